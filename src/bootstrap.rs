use crate::{
    config::Config,
    credential::CredentialManager,
    db::{OpenOutcome, SyncedDatabase},
    error::SyncError,
    registry::ModelRegistry,
    scheduler::{ScheduleConfig, SyncOutcome, SyncScheduler},
    storage::{RemoteStore, build_remote_store},
};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Running components plus their background sync loops.
pub struct Services {
    pub credentials: Option<Arc<CredentialManager>>,
    pub store: Arc<dyn RemoteStore>,
    pub database: Arc<SyncedDatabase>,
    pub registry: Arc<ModelRegistry>,
    schedulers: Vec<SyncScheduler>,
    cancel: CancellationToken,
}

impl Services {
    /// Opens the database and model registry against the configured backend and starts one
    /// scheduler per synchronized resource (plus credential pre-refresh for remote backends).
    pub async fn start(cfg: &Config) -> Result<Self, SyncError> {
        let backend = cfg.storage.backend;
        let credentials = if backend.is_remote() {
            Some(Arc::new(CredentialManager::from_config(cfg)?))
        } else {
            None
        };
        let store = build_remote_store(cfg, credentials.clone())?;

        let database = Arc::new(SyncedDatabase::from_config(cfg, store.clone()));
        match database.open().await? {
            OpenOutcome::LocalFallback { reason } => {
                warn!(%reason, "Database opened in local fallback mode");
            }
            outcome => info!(?outcome, "Database opened"),
        }

        let registry = Arc::new(ModelRegistry::from_config(cfg, store.clone()));
        match registry.open().await? {
            SyncOutcome::LocalFallback { reason } => {
                warn!(%reason, "Model registry opened in local fallback mode");
            }
            outcome => info!(?outcome, "Model registry opened"),
        }

        let cancel = CancellationToken::new();
        let schedule = |interval: Duration| ScheduleConfig {
            interval,
            backoff_factor: cfg.storage.backoff_factor,
            backoff_ceiling: cfg.storage.backoff_ceiling(),
        };

        let mut schedulers = vec![
            SyncScheduler::spawn_with_token(
                database.clone(),
                schedule(cfg.storage.db_sync_interval()),
                cancel.child_token(),
            ),
            SyncScheduler::spawn_with_token(
                registry.clone(),
                schedule(cfg.storage.model_sync_interval()),
                cancel.child_token(),
            ),
        ];
        if let Some(creds) = &credentials {
            schedulers.push(SyncScheduler::spawn_with_token(
                creds.clone(),
                schedule(cfg.credential.refresh_check_interval()),
                cancel.child_token(),
            ));
        }

        info!(
            backend = backend.as_str(),
            schedulers = schedulers.len(),
            "Sync services started"
        );
        Ok(Self {
            credentials,
            store,
            database,
            registry,
            schedulers,
            cancel,
        })
    }

    /// Requests an immediate sync of every resource.
    pub fn trigger_all(&self) {
        for scheduler in &self.schedulers {
            scheduler.trigger();
        }
    }

    /// Stops the sync loops (each drains its last flush), then closes the database.
    pub async fn shutdown(self) -> Result<(), SyncError> {
        self.cancel.cancel();
        for scheduler in &self.schedulers {
            scheduler.shutdown().await;
        }
        let outcome = self.database.close().await?;
        info!(?outcome, "Sync services stopped");
        Ok(())
    }
}

use super::{endpoints::TokenEndpoint, store::CredentialFile, token::Credential};
use crate::{
    config::{BackendKind, Config},
    error::SyncError,
    scheduler::{Reconcile, SyncOutcome},
};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Owns the OAuth credential of the configured remote backend.
///
/// Every other component receives clones; the cached copy and the token file are only mutated
/// here. Refreshes run while holding the state lock, so concurrent callers that find an expired
/// token wait for one refresh instead of racing the token endpoint.
pub struct CredentialManager {
    backend: BackendKind,
    file: CredentialFile,
    endpoint: TokenEndpoint,
    app_id: String,
    app_secret: String,
    seed_refresh_token: Option<String>,
    skew: Duration,
    current: Mutex<Option<Credential>>,
}

impl CredentialManager {
    pub fn from_config(cfg: &Config) -> Result<Self, SyncError> {
        let endpoint = TokenEndpoint::from_config(cfg)?;
        let file = CredentialFile::new(cfg.token_file());
        info!(
            backend = cfg.storage.backend.as_str(),
            token_file = %file.path().display(),
            "Credential manager ready"
        );
        Ok(Self {
            backend: cfg.storage.backend,
            file,
            endpoint,
            app_id: cfg.credential.app_id.clone(),
            app_secret: cfg.credential.app_secret.clone(),
            seed_refresh_token: cfg
                .credential
                .refresh_token
                .clone()
                .filter(|t| !t.trim().is_empty()),
            skew: cfg.credential.refresh_skew(),
            current: Mutex::new(None),
        })
    }

    /// Configured refresh skew.
    pub fn skew(&self) -> Duration {
        self.skew
    }

    /// Returns the cached credential, reading the token file on first use.
    ///
    /// Falls back to the configured seed refresh token when no file exists.
    pub async fn load(&self) -> Result<Credential, SyncError> {
        let mut slot = self.current.lock().await;
        self.load_locked(&mut slot).await
    }

    pub fn is_valid(&self, cred: &Credential, skew: Duration) -> bool {
        cred.is_valid(skew)
    }

    /// Runs the refresh-token grant for `cred` and persists the result.
    ///
    /// If another caller already replaced `cred` with a still valid token, that token is returned
    /// without contacting the endpoint. No retry happens here.
    pub async fn refresh(&self, cred: &Credential) -> Result<Credential, SyncError> {
        let mut slot = self.current.lock().await;
        if let Some(current) = slot.as_ref() {
            if current.access_token() != cred.access_token() && current.is_valid(self.skew) {
                debug!("Credential already refreshed by another caller");
                return Ok(current.clone());
            }
        }
        self.refresh_locked(&mut slot, cred).await
    }

    /// Returns a credential valid for at least `skew`, refreshing it if needed.
    pub async fn ensure_valid(&self, skew: Duration) -> Result<Credential, SyncError> {
        let mut slot = self.current.lock().await;
        let cred = self.load_locked(&mut slot).await?;
        if cred.is_valid(skew) {
            return Ok(cred);
        }

        let fresh = self.refresh_locked(&mut slot, &cred).await?;
        if !fresh.is_valid(skew) {
            return Err(SyncError::Auth(format!(
                "refreshed token expires at {} which is within the {}s skew",
                fresh.expiry(),
                skew.as_secs()
            )));
        }
        Ok(fresh)
    }

    /// Authorization URL the operator opens to grant offline access, plus its CSRF state.
    pub fn authorize_url(&self) -> (url::Url, String) {
        let (url, state) = self.endpoint.authorize_url();
        (url, state.secret().clone())
    }

    /// Exchanges an authorization code for the first credential and persists it.
    pub async fn exchange_code(&self, code: &str) -> Result<Credential, SyncError> {
        let code = code.trim();
        if code.is_empty() {
            return Err(SyncError::Auth("authorization code is empty".into()));
        }

        let mut slot = self.current.lock().await;
        let token = self.endpoint.exchange_code(code).await?;

        let mut cred = Credential::seeded("", &self.app_id, &self.app_secret);
        cred.update_credential(&token)?;
        if cred.refresh_token().is_empty() {
            return Err(SyncError::Auth(
                "token endpoint did not issue a refresh token; offline access is required".into(),
            ));
        }

        self.file.save(&cred).await?;
        info!(
            backend = self.backend.as_str(),
            expiry = %cred.expiry(),
            "Credential created from authorization code"
        );
        *slot = Some(cred.clone());
        Ok(cred)
    }

    /// Drops the credential, including its refresh token, from memory and disk.
    pub async fn reset(&self) -> Result<(), SyncError> {
        let mut slot = self.current.lock().await;
        self.file.remove().await?;
        *slot = None;
        warn!(backend = self.backend.as_str(), "Credential reset");
        Ok(())
    }

    async fn load_locked(&self, slot: &mut Option<Credential>) -> Result<Credential, SyncError> {
        if let Some(cred) = slot.as_ref() {
            return Ok(cred.clone());
        }

        let cred = match self.file.load().await {
            Ok(cred) => cred.with_app(&self.app_id, &self.app_secret),
            Err(SyncError::CredentialMissing) => {
                let Some(seed) = self.seed_refresh_token.as_deref() else {
                    return Err(SyncError::CredentialMissing);
                };
                info!(
                    backend = self.backend.as_str(),
                    "No token file, seeding credential from configured refresh token"
                );
                Credential::seeded(seed, &self.app_id, &self.app_secret)
            }
            Err(e) => return Err(e),
        };

        *slot = Some(cred.clone());
        Ok(cred)
    }

    async fn refresh_locked(
        &self,
        slot: &mut Option<Credential>,
        base: &Credential,
    ) -> Result<Credential, SyncError> {
        if base.app_secret().is_empty() {
            return Err(SyncError::Config("credential.app_secret is not set".into()));
        }

        let token = match self.endpoint.refresh(base.refresh_token()).await {
            Ok(token) => token,
            Err(e) => {
                warn!(backend = self.backend.as_str(), error = %e, "Token refresh failed");
                return Err(e);
            }
        };

        let mut fresh = base.clone();
        fresh.update_credential(&token)?;

        if let Err(e) = self.file.save(&fresh).await {
            error!(
                path = %self.file.path().display(),
                error = %e,
                "Failed to persist refreshed credential; keeping it in memory"
            );
        }

        info!(
            backend = self.backend.as_str(),
            expiry = %fresh.expiry(),
            "Access token refreshed"
        );
        *slot = Some(fresh.clone());
        Ok(fresh)
    }
}

/// Background refresh ahead of expiry so foreground remote calls rarely pay for it.
#[async_trait]
impl Reconcile for CredentialManager {
    fn name(&self) -> &'static str {
        "credential"
    }

    async fn reconcile(&self) -> Result<SyncOutcome, SyncError> {
        let before = self.current.lock().await.as_ref().map(|c| c.expiry());
        match self.ensure_valid(self.skew.saturating_mul(2)).await {
            Ok(cred) if Some(cred.expiry()) == before => Ok(SyncOutcome::Unchanged),
            Ok(_) => Ok(SyncOutcome::Refreshed),
            Err(e) if e.is_degradable() => Ok(SyncOutcome::LocalFallback {
                reason: e.to_string(),
            }),
            Err(e) => Err(e),
        }
    }
}

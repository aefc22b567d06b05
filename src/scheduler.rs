use crate::error::SyncError;
use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use std::{
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};
use tokio::{sync::Notify, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of one synchronization attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Local state was written to the remote store.
    Uploaded,
    /// Nothing to do; local and remote already agree.
    Unchanged,
    /// Another attempt was already in flight and covers this request.
    Coalesced,
    /// A newer remote snapshot replaced the local copy.
    RemoteWon,
    /// A credential was renewed.
    Refreshed,
    /// Remote unavailable; the local copy stays authoritative until the next attempt.
    LocalFallback { reason: String },
}

impl SyncOutcome {
    pub fn is_fallback(&self) -> bool {
        matches!(self, SyncOutcome::LocalFallback { .. })
    }
}

/// A resource kept in sync by a [`SyncScheduler`].
#[async_trait]
pub trait Reconcile: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn reconcile(&self) -> Result<SyncOutcome, SyncError>;

    /// Fires when local state changed and an early sync is worthwhile.
    fn change_signal(&self) -> Option<Arc<Notify>> {
        None
    }

    /// Last chance to push local state before the scheduler stops.
    async fn drain(&self) -> Result<(), SyncError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ScheduleConfig {
    pub interval: Duration,
    pub backoff_factor: f32,
    pub backoff_ceiling: Duration,
}

/// Delay policy: the fixed interval while healthy, multiplicative growth up to a ceiling while
/// failing, and back to the interval after the next success.
#[derive(Debug)]
pub struct Backoff {
    interval: Duration,
    ceiling: Duration,
    builder: ExponentialBuilder,
    failing: Option<ExponentialBackoff>,
}

impl Backoff {
    pub fn new(interval: Duration, factor: f32, ceiling: Duration) -> Self {
        let ceiling = ceiling.max(interval);
        let factor = factor.max(1.0);
        let builder = ExponentialBuilder::default()
            .with_min_delay(interval.mul_f32(factor).min(ceiling))
            .with_max_delay(ceiling)
            .with_factor(factor)
            .without_max_times();
        Self {
            interval,
            ceiling,
            builder,
            failing: None,
        }
    }

    pub fn is_failing(&self) -> bool {
        self.failing.is_some()
    }

    pub fn on_success(&mut self) -> Duration {
        self.failing = None;
        self.interval
    }

    pub fn on_failure(&mut self) -> Duration {
        let builder = self.builder;
        self.failing
            .get_or_insert_with(|| builder.build())
            .next()
            .unwrap_or(self.ceiling)
    }
}

/// Background loop driving one [`Reconcile`] resource.
///
/// Runs on every interval tick, on [`trigger`](Self::trigger) and on the resource's change
/// signal. Cancellation lets an in-flight attempt finish, runs `drain`, then stops.
pub struct SyncScheduler {
    name: &'static str,
    cancel: CancellationToken,
    trigger: Arc<Notify>,
    handle: StdMutex<Option<JoinHandle<()>>>,
}

impl SyncScheduler {
    pub fn spawn(resource: Arc<dyn Reconcile>, cfg: ScheduleConfig) -> Self {
        Self::spawn_with_token(resource, cfg, CancellationToken::new())
    }

    /// Like [`spawn`](Self::spawn), stopping when `cancel` (or a parent of it) is cancelled.
    pub fn spawn_with_token(
        resource: Arc<dyn Reconcile>,
        cfg: ScheduleConfig,
        cancel: CancellationToken,
    ) -> Self {
        let name = resource.name();
        let trigger = Arc::new(Notify::new());
        let handle = tokio::spawn(run(resource, cfg, cancel.clone(), trigger.clone()));
        info!(
            resource = name,
            interval_secs = cfg.interval.as_secs(),
            ceiling_secs = cfg.backoff_ceiling.as_secs(),
            "Sync scheduler started"
        );
        Self {
            name,
            cancel,
            trigger,
            handle: StdMutex::new(Some(handle)),
        }
    }

    /// Requests an immediate attempt. Coalesces with other pending triggers.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Cancels the loop and waits for in-flight work and the final drain.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(resource = self.name, error = %e, "Sync scheduler task failed");
            }
        }
    }
}

async fn run(
    resource: Arc<dyn Reconcile>,
    cfg: ScheduleConfig,
    cancel: CancellationToken,
    trigger: Arc<Notify>,
) {
    let name = resource.name();
    let changes = resource.change_signal();
    let mut backoff = Backoff::new(cfg.interval, cfg.backoff_factor, cfg.backoff_ceiling);
    let mut delay = cfg.interval;

    loop {
        let failing = backoff.is_failing();
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = trigger.notified() => debug!(resource = name, "Sync triggered"),
            () = wait_for_change(changes.as_deref()), if !failing => {
                debug!(resource = name, "Sync after local change");
            }
            () = tokio::time::sleep(delay) => {}
        }

        delay = match resource.reconcile().await {
            Ok(SyncOutcome::LocalFallback { reason }) => {
                let next = backoff.on_failure();
                warn!(resource = name, %reason, retry_in = ?next, "Sync degraded to local copy");
                next
            }
            Ok(outcome) => {
                if outcome != SyncOutcome::Unchanged {
                    info!(resource = name, ?outcome, "Sync completed");
                }
                backoff.on_success()
            }
            Err(e) => {
                let next = backoff.on_failure();
                error!(resource = name, error = %e, retry_in = ?next, "Sync failed");
                next
            }
        };
    }

    if let Err(e) = resource.drain().await {
        warn!(resource = name, error = %e, "Final sync before shutdown failed");
    }
    info!(resource = name, "Sync scheduler stopped");
}

async fn wait_for_change(signal: Option<&Notify>) {
    match signal {
        Some(notify) => notify.notified().await,
        None => std::future::pending().await,
    }
}

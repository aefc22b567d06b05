use crate::{
    config::Config,
    credential::CredentialManager,
    error::{IsRetryable, SyncError},
};
use backon::{ExponentialBuilder, Retryable};
use std::{future::Future, sync::Arc, time::Duration};
use tracing::warn;

const MAX_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Runs remote calls with a freshly validated access token.
///
/// Each attempt is bounded by the request timeout. Transient network failures are retried with
/// backoff. An auth rejection triggers exactly one credential refresh and one more round of
/// attempts before the error is surfaced.
pub(crate) struct Authorized {
    creds: Arc<CredentialManager>,
    retry_policy: ExponentialBuilder,
    attempt_timeout: Duration,
}

impl Authorized {
    pub(crate) fn new(creds: Arc<CredentialManager>, cfg: &Config) -> Self {
        let retry_policy = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(200))
            .with_max_delay(MAX_RETRY_DELAY)
            .with_max_times(cfg.storage.retry_max_times)
            .with_jitter();
        Self {
            creds,
            retry_policy,
            attempt_timeout: cfg.storage.request_timeout(),
        }
    }

    /// Longest a single [`Authorized::call`] can take: two rounds of attempts, each attempt
    /// followed by at most one backoff sleep, plus the two token endpoint calls.
    pub(crate) fn call_budget(cfg: &Config) -> Duration {
        let attempts = u32::try_from(cfg.storage.retry_max_times)
            .unwrap_or(u32::MAX)
            .saturating_add(1);
        let slot = cfg.storage.request_timeout().saturating_add(MAX_RETRY_DELAY);
        slot.saturating_mul(attempts.saturating_mul(2).saturating_add(2))
    }

    pub(crate) async fn call<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T, SyncError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let cred = self.creds.ensure_valid(self.creds.skew()).await?;
        match self.with_retry(op, &f, cred.access_token()).await {
            Err(SyncError::Auth(reason)) => {
                warn!(op, %reason, "Access token rejected, refreshing once");
                let fresh = self.creds.refresh(&cred).await?;
                self.with_retry(op, &f, fresh.access_token()).await
            }
            other => other,
        }
    }

    async fn with_retry<T, F, Fut>(&self, op: &'static str, f: &F, token: &str) -> Result<T, SyncError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let limit = self.attempt_timeout;
        (|| {
            let attempt = f(token.to_string());
            async move {
                tokio::time::timeout(limit, attempt).await.unwrap_or_else(|_| {
                    Err(SyncError::Network(format!("{op} timed out after {limit:?}")))
                })
            }
        })
        .retry(self.retry_policy)
        .when(|e: &SyncError| e.is_retryable())
        .notify(|err: &SyncError, dur: Duration| {
            warn!(op, error = %err, "Remote call failed, retrying in {:?}", dur);
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_budget_covers_every_attempt() {
        let mut cfg = Config::default();
        cfg.storage.request_timeout_seconds = 1;
        cfg.storage.retry_max_times = 1;
        // Two rounds of two attempts plus two token calls, each with a backoff slot.
        assert_eq!(Authorized::call_budget(&cfg), Duration::from_secs(18));

        cfg.storage.retry_max_times = usize::MAX;
        assert!(Authorized::call_budget(&cfg) > Duration::from_secs(u64::from(u32::MAX)));
    }
}

mod oauth;
mod sync;

pub use oauth::OauthError;
pub use sync::SyncError;

pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}

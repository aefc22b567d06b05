use crate::config::{
    BackendKind, Config, DROPBOX_AUTH_URL, DROPBOX_TOKEN_URL, GOOGLE_AUTH_URL, GOOGLE_TOKEN_URL,
};
use crate::error::SyncError;
use crate::oauth_utils::{OauthTokenResponse, StandardOauth2Client, build_oauth2_client};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use oauth2::{AuthorizationCode, CsrfToken, RefreshToken, Scope};
use std::{num::NonZeroU32, time::Duration};
use tracing::{debug, info};

/// Token endpoint of the selected backend, shared by refresh and code exchange.
pub(crate) struct TokenEndpoint {
    kind: BackendKind,
    client: StandardOauth2Client,
    http: reqwest::Client,
    limiter: DefaultDirectRateLimiter,
}

impl TokenEndpoint {
    pub(crate) fn from_config(cfg: &Config) -> Result<Self, SyncError> {
        let kind = cfg.storage.backend;
        let (default_auth, default_token) = match kind {
            BackendKind::GoogleDrive => (GOOGLE_AUTH_URL, GOOGLE_TOKEN_URL),
            BackendKind::Dropbox | BackendKind::Local => (DROPBOX_AUTH_URL, DROPBOX_TOKEN_URL),
        };
        let auth_url = cfg
            .credential
            .auth_url
            .as_ref()
            .map_or(default_auth, url::Url::as_str);
        let token_url = cfg
            .credential
            .token_url
            .as_ref()
            .map_or(default_token, url::Url::as_str);

        let client = build_oauth2_client(
            &cfg.credential.app_id,
            &cfg.credential.app_secret,
            auth_url,
            token_url,
            None,
        )?;

        // The oauth2 crate requires redirects to be disabled to avoid SSRF via the token endpoint.
        let http = reqwest::Client::builder()
            .user_agent(concat!("intentsync/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(5))
            .timeout(cfg.storage.request_timeout())
            .build()
            .map_err(|e| SyncError::Config(format!("token HTTP client: {e}")))?;

        let per_minute = NonZeroU32::new(cfg.credential.refresh_per_minute.max(1))
            .unwrap_or(NonZeroU32::MIN);
        let limiter = RateLimiter::direct(Quota::per_minute(per_minute));

        info!(
            backend = kind.as_str(),
            token_url,
            refresh_per_minute = per_minute.get(),
            "Token endpoint configured"
        );

        Ok(Self {
            kind,
            client,
            http,
            limiter,
        })
    }

    pub(crate) async fn refresh(&self, refresh_token: &str) -> Result<OauthTokenResponse, SyncError> {
        self.limiter.until_ready().await;
        debug!(backend = self.kind.as_str(), "Requesting refresh_token grant");
        let token = self
            .client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(&self.http)
            .await?;
        Ok(token)
    }

    pub(crate) async fn exchange_code(&self, code: &str) -> Result<OauthTokenResponse, SyncError> {
        self.limiter.until_ready().await;
        let token = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(&self.http)
            .await?;
        info!(backend = self.kind.as_str(), "OAuth2 code exchange completed");
        Ok(token)
    }

    /// Authorization URL for the no-redirect flow; asks for offline access so a refresh token
    /// is issued.
    pub(crate) fn authorize_url(&self) -> (url::Url, CsrfToken) {
        let req = self.client.authorize_url(CsrfToken::new_random);
        match self.kind {
            BackendKind::GoogleDrive => req
                .add_scope(Scope::new(
                    "https://www.googleapis.com/auth/drive.file".to_string(),
                ))
                .add_extra_param("access_type", "offline")
                .add_extra_param("prompt", "consent")
                .url(),
            BackendKind::Dropbox | BackendKind::Local => req
                .add_extra_param("token_access_type", "offline")
                .url(),
        }
    }
}

use super::IsRetryable;
use super::sync::SyncError;
use oauth2::basic::BasicErrorResponseType;
use oauth2::reqwest::Error as ReqwestClientError;
use oauth2::{HttpClientError, RequestTokenError, StandardErrorResponse};
use reqwest::StatusCode;
use thiserror::Error as ThisError;

/// Token endpoint failures, before they are folded into [`SyncError`].
#[derive(Debug, ThisError)]
pub enum OauthError {
    #[error("OAuth2 request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("OAuth2 upstream error with status: {0}")]
    UpstreamStatus(StatusCode),

    #[error("OAuth2 server response error: {error}")]
    ServerResponse {
        error: String,
        description: Option<String>,
    },

    #[error("OAuth2 token endpoint parse error: {message}. Body: {body}")]
    Parse { message: String, body: String },

    #[error("OAuth2 unexpected error: {message}")]
    Other { message: String },
}

impl OauthError {
    /// True when the token endpoint rejected the grant itself (bad or revoked refresh token,
    /// bad app credentials). These never heal by retrying.
    pub fn is_grant_rejection(&self) -> bool {
        match self {
            OauthError::ServerResponse { .. } => true,
            OauthError::UpstreamStatus(status) => {
                matches!(*status, StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED)
            }
            _ => false,
        }
    }
}

impl IsRetryable for OauthError {
    fn is_retryable(&self) -> bool {
        match self {
            OauthError::Request(_) => true,
            OauthError::UpstreamStatus(status) => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            OauthError::Parse { .. } => true,
            _ => false,
        }
    }
}

type PkgsRequestTokenError = RequestTokenError<
    HttpClientError<ReqwestClientError>,
    StandardErrorResponse<BasicErrorResponseType>,
>;

impl From<PkgsRequestTokenError> for OauthError {
    fn from(e: PkgsRequestTokenError) -> Self {
        match e {
            RequestTokenError::ServerResponse(err) => OauthError::ServerResponse {
                error: err.error().to_string(),
                description: err.error_description().cloned(),
            },
            RequestTokenError::Request(wrapper) => match wrapper {
                HttpClientError::Reqwest(real_err) => OauthError::Request(*real_err),
                other => OauthError::Other {
                    message: format!("HttpClientError: {other:?}"),
                },
            },
            RequestTokenError::Parse(parse_err, body) => {
                let body_str = String::from_utf8_lossy(&body);
                let body = body_str
                    .char_indices()
                    .nth(100)
                    .map(|(idx, _)| format!("{}...<truncated>", &body_str[..idx]))
                    .unwrap_or_else(|| body_str.into_owned());
                OauthError::Parse {
                    message: parse_err.to_string(),
                    body,
                }
            }
            RequestTokenError::Other(s) => OauthError::Other { message: s },
        }
    }
}

impl From<OauthError> for SyncError {
    fn from(e: OauthError) -> Self {
        if e.is_grant_rejection() {
            SyncError::Auth(e.to_string())
        } else {
            SyncError::Network(e.to_string())
        }
    }
}

impl From<PkgsRequestTokenError> for SyncError {
    fn from(e: PkgsRequestTokenError) -> Self {
        OauthError::from(e).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_grant_maps_to_auth() {
        let err = OauthError::ServerResponse {
            error: "invalid_grant".to_string(),
            description: None,
        };
        assert!(!err.is_retryable());
        assert!(matches!(SyncError::from(err), SyncError::Auth(_)));
    }

    #[test]
    fn server_errors_map_to_network_and_retry() {
        let err = OauthError::UpstreamStatus(StatusCode::BAD_GATEWAY);
        assert!(err.is_retryable());
        assert!(matches!(SyncError::from(err), SyncError::Network(_)));
    }

    #[test]
    fn unparseable_body_is_transient() {
        let err = OauthError::Parse {
            message: "expected value".to_string(),
            body: "<html>".to_string(),
        };
        assert!(err.is_retryable());
        assert!(matches!(SyncError::from(err), SyncError::Network(_)));
    }
}

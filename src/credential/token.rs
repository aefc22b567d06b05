use crate::error::SyncError;
use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

/// OAuth token state for one remote backend.
///
/// Persisted as `{access_token, refresh_token, expiry_time, app_id}`; the app secret is only ever
/// injected from configuration and is never written to disk.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credential {
    #[serde(default, deserialize_with = "null_as_empty")]
    access_token: String,
    refresh_token: String,
    #[serde(
        rename = "expiry_time",
        default = "expired",
        deserialize_with = "deserialize_expiry"
    )]
    expiry: DateTime<Utc>,
    #[serde(default)]
    app_id: String,
    #[serde(skip)]
    app_secret: String,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expiry", &self.expiry)
            .field("app_id", &self.app_id)
            .finish_non_exhaustive()
    }
}

impl Credential {
    /// A credential that only knows its refresh token; the first `ensure_valid` refreshes it.
    pub fn seeded(refresh_token: &str, app_id: &str, app_secret: &str) -> Self {
        Self {
            access_token: String::new(),
            refresh_token: refresh_token.to_string(),
            expiry: expired(),
            app_id: app_id.to_string(),
            app_secret: app_secret.to_string(),
        }
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn refresh_token(&self) -> &str {
        &self.refresh_token
    }

    pub fn expiry(&self) -> DateTime<Utc> {
        self.expiry
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub(crate) fn app_secret(&self) -> &str {
        &self.app_secret
    }

    pub(crate) fn with_app(mut self, app_id: &str, app_secret: &str) -> Self {
        self.app_id = app_id.to_string();
        self.app_secret = app_secret.to_string();
        self
    }

    /// True iff `now < expiry - skew` and an access token is present.
    pub fn is_valid(&self, skew: std::time::Duration) -> bool {
        let skew = Duration::from_std(skew).unwrap_or(Duration::MAX);
        !self.access_token.is_empty()
            && self
                .expiry
                .checked_sub_signed(skew)
                .is_some_and(|deadline| Utc::now() < deadline)
    }

    /// Merge updates from any JSON-serializable payload into this credential.
    ///
    /// Accepts token endpoint payloads (`access_token`, `expires_in`, optional
    /// `refresh_token`) as well as full credential JSON. A refresh token is only replaced by a
    /// non-empty new one, never cleared.
    pub fn update_credential(&mut self, payload: impl Serialize) -> Result<(), SyncError> {
        #[derive(Debug, Default, Deserialize)]
        struct CredentialPatch {
            access_token: Option<String>,
            refresh_token: Option<String>,
            #[serde(alias = "expiry_time")]
            expiry: Option<DateTime<Utc>>,
            expires_in: Option<i64>,
            app_id: Option<String>,
        }

        let value = serde_json::to_value(payload)?;
        let patch: CredentialPatch = serde_json::from_value(value)?;

        let expiry = match patch.expires_in {
            Some(secs) => Some(
                Duration::try_seconds(secs)
                    .and_then(|ttl| Utc::now().checked_add_signed(ttl))
                    .ok_or_else(|| {
                        SyncError::Auth(format!("token lifetime of {secs}s is out of range"))
                    })?,
            ),
            None => patch.expiry,
        };

        if let Some(token) = patch.access_token {
            self.access_token = token;
        }
        if let Some(token) = patch.refresh_token.filter(|t| !t.trim().is_empty()) {
            self.refresh_token = token;
        }
        if let Some(app_id) = patch.app_id {
            self.app_id = app_id;
        }

        if let Some(expiry) = expiry {
            self.expiry = expiry;
        }

        debug!(app_id = %self.app_id, expiry = %self.expiry, "Credential updated");
        Ok(())
    }
}

fn expired() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Accepts RFC 3339 timestamps and naive ISO-8601 ones (taken as UTC); `null` means expired.
fn deserialize_expiry<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(raw) = Option::<String>::deserialize(deserializer)? else {
        return Ok(expired());
    };
    if let Ok(dt) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(|e| serde::de::Error::custom(format!("invalid expiry_time {raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration as StdDuration;

    #[test]
    fn validity_respects_skew() {
        let mut cred = Credential::seeded("rt", "app", "secret");
        assert!(!cred.is_valid(StdDuration::ZERO));

        cred.update_credential(json!({ "access_token": "at", "expires_in": 600 }))
            .unwrap();
        assert!(cred.is_valid(StdDuration::from_secs(300)));
        assert!(!cred.is_valid(StdDuration::from_secs(900)));
    }

    #[test]
    fn refresh_token_is_never_cleared() {
        let mut cred = Credential::seeded("rt-1", "app", "secret");
        cred.update_credential(json!({ "access_token": "at", "refresh_token": "" }))
            .unwrap();
        assert_eq!(cred.refresh_token(), "rt-1");

        cred.update_credential(json!({ "refresh_token": "rt-2" }))
            .unwrap();
        assert_eq!(cred.refresh_token(), "rt-2");
    }

    #[test]
    fn out_of_range_lifetime_is_rejected_without_side_effects() {
        let mut cred = Credential::seeded("rt", "app", "secret");
        cred.update_credential(json!({ "access_token": "at-1", "expires_in": 600 }))
            .unwrap();
        let expiry = cred.expiry();

        for secs in [i64::MAX, i64::MIN, i64::MAX / 1000 + 1] {
            let err = cred
                .update_credential(json!({ "access_token": "at-2", "expires_in": secs }))
                .unwrap_err();
            assert!(matches!(err, SyncError::Auth(_)), "expires_in {secs}: {err:?}");
        }
        assert_eq!(cred.access_token(), "at-1");
        assert_eq!(cred.expiry(), expiry);
    }

    #[test]
    fn parses_naive_iso_expiry_and_null_access_token() {
        let cred: Credential = serde_json::from_value(json!({
            "access_token": null,
            "refresh_token": "rt",
            "expiry_time": "2030-01-02T03:04:05.123456",
            "app_id": "app"
        }))
        .unwrap();
        assert_eq!(cred.access_token(), "");
        assert_eq!(cred.expiry().to_rfc3339(), "2030-01-02T03:04:05.123456+00:00");
    }

    #[test]
    fn serialized_form_omits_secret() {
        let cred = Credential::seeded("rt", "app", "top-secret");
        let raw = serde_json::to_string(&cred).unwrap();
        assert!(raw.contains("expiry_time"));
        assert!(!raw.contains("top-secret"));
    }
}

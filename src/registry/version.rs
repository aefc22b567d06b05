use crate::error::SyncError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{cmp::Ordering, fmt};

/// Model version identifier: `{prefix}{YYYYMMDD}.{unix_millis}`.
///
/// Ordered by the millisecond stamp, which [`VersionId::next_after`] keeps strictly increasing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionId {
    raw: String,
    stamp: i64,
}

impl VersionId {
    /// A new id for `now`, strictly greater than `newest` when given.
    pub fn next_after(prefix: &str, now: DateTime<Utc>, newest: Option<&VersionId>) -> Self {
        let mut stamp = now.timestamp_millis();
        if let Some(newest) = newest {
            stamp = stamp.max(newest.stamp + 1);
        }
        let day = DateTime::<Utc>::from_timestamp_millis(stamp).unwrap_or(now);
        Self {
            raw: format!("{prefix}{}.{stamp}", day.format("%Y%m%d")),
            stamp,
        }
    }

    pub fn parse(raw: &str) -> Result<Self, SyncError> {
        let stamp = raw
            .rsplit_once('.')
            .and_then(|(_, tail)| tail.parse::<i64>().ok())
            .ok_or_else(|| SyncError::NotFound(format!("malformed model version id {raw:?}")))?;
        Ok(Self {
            raw: raw.to_string(),
            stamp,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn stamp(&self) -> i64 {
        self.stamp
    }
}

impl Ord for VersionId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.stamp
            .cmp(&other.stamp)
            .then_with(|| self.raw.cmp(&other.raw))
    }
}

impl PartialOrd for VersionId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Serialize for VersionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for VersionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        VersionId::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    #[default]
    Trained,
    Uploaded,
    Ensemble,
}

/// Caller supplied description of an artifact being registered.
#[derive(Debug, Clone, Default)]
pub struct ModelMetadata {
    pub is_base: bool,
    pub kind: ModelKind,
    /// Defaults to the configured base or member weight.
    pub weight: Option<f64>,
    pub accuracy: Option<f64>,
    pub training_data_size: Option<u64>,
    pub description: Option<String>,
}

impl ModelMetadata {
    pub fn base() -> Self {
        Self {
            is_base: true,
            ..Self::default()
        }
    }

    pub fn uploaded() -> Self {
        Self {
            kind: ModelKind::Uploaded,
            ..Self::default()
        }
    }
}

/// One registered model artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub version_id: VersionId,
    /// Remote key of the artifact.
    pub artifact_ref: String,
    pub weight: f64,
    pub created_at: DateTime<Utc>,
    pub is_base: bool,
    #[serde(default)]
    pub kind: ModelKind,
    #[serde(default)]
    pub accuracy: Option<f64>,
    #[serde(default)]
    pub training_data_size: Option<u64>,
    #[serde(default)]
    pub description: Option<String>,
    pub size_bytes: u64,
    pub sha256: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn ids_are_strictly_increasing_within_one_millisecond() {
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 8, 0, 0).unwrap();
        let a = VersionId::next_after("1.0.", now, None);
        let b = VersionId::next_after("1.0.", now, Some(&a));
        let c = VersionId::next_after("1.0.", now, Some(&b));
        assert!(a < b && b < c);
        assert!(a.as_str().starts_with("1.0.20261019."));
        assert_eq!(VersionId::parse(c.as_str()).unwrap(), c);
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = VersionId::parse("1.0.20261019.1792396800000").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"1.0.20261019.1792396800000\"");
        assert!(VersionId::parse("garbage").is_err());
    }
}

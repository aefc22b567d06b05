use crate::error::SyncError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelsConfig {
    /// Non-base versions kept by retention.
    /// TOML: `models.max_versions_to_keep`. Default: `5`.
    #[serde(default = "default_max_versions", alias = "maxVersionsToKeep")]
    pub max_versions_to_keep: usize,

    /// Ensemble weight of the base classifier.
    /// TOML: `models.base_weight`. Default: `2.0`.
    #[serde(default = "default_base_weight", alias = "baseWeight")]
    pub base_weight: f64,

    /// Ensemble weight of each member model.
    /// TOML: `models.member_weight`. Default: `1.0`.
    #[serde(default = "default_member_weight", alias = "memberWeight")]
    pub member_weight: f64,

    /// Prefix of generated version ids, e.g. `1.0.` gives `1.0.20250101.1735689600000`.
    /// TOML: `models.version_prefix`. Default: `1.0.`.
    #[serde(default = "default_version_prefix")]
    pub version_prefix: String,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            max_versions_to_keep: default_max_versions(),
            base_weight: default_base_weight(),
            member_weight: default_member_weight(),
            version_prefix: default_version_prefix(),
        }
    }
}

impl ModelsConfig {
    pub fn validate(&self) -> Result<(), SyncError> {
        if !(self.base_weight.is_finite() && self.member_weight.is_finite()) {
            return Err(SyncError::Config("model weights must be finite".into()));
        }
        if self.member_weight < 0.0 {
            return Err(SyncError::Config("models.member_weight must be >= 0".into()));
        }
        if self.max_versions_to_keep == 0 {
            return Err(SyncError::Config(
                "models.max_versions_to_keep must be at least 1".into(),
            ));
        }
        if self.base_weight < self.member_weight {
            return Err(SyncError::Config(format!(
                "models.base_weight ({}) must be >= models.member_weight ({})",
                self.base_weight, self.member_weight
            )));
        }
        Ok(())
    }
}

fn default_max_versions() -> usize {
    5
}

fn default_base_weight() -> f64 {
    2.0
}

fn default_member_weight() -> f64 {
    1.0
}

fn default_version_prefix() -> String {
    "1.0.".to_string()
}

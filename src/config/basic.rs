use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where the working copy of the relational store lives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkingCopy {
    /// Pure in-memory SQLite; remote snapshots are the only durable copy.
    #[default]
    Memory,
    /// SQLite file under `basic.data_dir`.
    Disk,
}

/// Basic (core) configuration managed by Figment.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BasicConfig {
    /// Log level for tracing subscriber initialization (e.g., "error", "warn", "info", "debug", "trace").
    /// TOML: `basic.loglevel`. Default: `info`.
    #[serde(default = "default_loglevel")]
    pub loglevel: String,

    /// Directory for local state: token file, model cache, disk working copy.
    /// TOML: `basic.data_dir`. Default: `./data`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// TOML: `basic.working_copy`. Default: `memory`.
    #[serde(default)]
    pub working_copy: WorkingCopy,
}

impl Default for BasicConfig {
    fn default() -> Self {
        Self {
            loglevel: default_loglevel(),
            data_dir: default_data_dir(),
            working_copy: WorkingCopy::default(),
        }
    }
}

fn default_loglevel() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

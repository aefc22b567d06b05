pub mod bootstrap;
pub mod config;
pub mod credential;
pub mod db;
pub mod error;
mod oauth_utils;
pub mod registry;
pub mod scheduler;
pub mod storage;

pub use bootstrap::Services;
pub use config::Config;
pub use error::SyncError;

//! Model registry: versioned artifacts, retention, ensembles and lazy fetch.

mod cache;
mod ensemble;
mod index;
mod manager;
mod version;

pub use cache::ArtifactCache;
pub use ensemble::EnsembleSpec;
pub use index::{LatestPointer, RegistryIndex};
pub use manager::{ModelHandle, ModelRegistry};
pub use version::{ModelKind, ModelMetadata, ModelVersion, VersionId};

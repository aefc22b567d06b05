//! Working database: a local SQLite copy mirrored to the remote store.
//!
//! Layout:
//! - `schema.rs`: SQL DDL for the domain tables
//! - `models.rs`: Rust structs mirroring DB rows
//! - `interactions.rs`: queries over the domain tables
//! - `snapshot.rs`: deterministic dump, decode and restore
//! - `synced.rs`: the [`SyncedDatabase`] engine

pub mod interactions;
pub mod models;
pub mod schema;
pub mod snapshot;
mod synced;

pub use models::{
    DbInteraction, DbUploadedModel, IntentStats, NewFeedback, NewInteraction, NewUploadedModel,
};
pub use schema::SQLITE_INIT;
pub use snapshot::{DatabaseSnapshot, RemoteSnapshot, SnapshotFormat};
pub use synced::{DbState, OpenOutcome, SyncedDatabase};

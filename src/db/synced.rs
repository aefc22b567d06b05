use super::{
    schema::apply_schema,
    snapshot::{DatabaseSnapshot, RemoteSnapshot, restore, sha256_hex},
};
use crate::{
    config::{Config, WorkingCopy},
    error::SyncError,
    scheduler::{Reconcile, SyncOutcome},
    storage::RemoteStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use sqlx::{
    ConnectOptions, Connection, Executor, Row, SqliteConnection,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous},
};
use std::{
    path::PathBuf,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};
use tokio::sync::{Mutex, Notify, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbState {
    Uninitialized,
    Loading,
    Ready,
    Syncing,
    Closed,
}

/// Where the working copy came from on [`SyncedDatabase::open`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    /// Materialized from the remote snapshot.
    Remote { content_hash: String },
    /// No remote snapshot yet; started from the empty schema (or the existing disk copy).
    Fresh,
    /// Remote unreachable; serving the local copy.
    LocalFallback { reason: String },
}

#[derive(Debug, Default)]
struct SyncMark {
    /// Content hash the remote is known to hold.
    remote_hash: Option<String>,
    /// Capture time of the last snapshot exchanged with the remote, or the open time.
    synced_at: Option<DateTime<Utc>>,
}

/// Local SQLite working copy mirrored to one remote key.
///
/// Transactions only touch the local copy. A single connection guarded by an async mutex is the
/// writer lock: transactions and snapshot captures are serialized on it, and it is never held
/// across remote I/O.
pub struct SyncedDatabase {
    store: Arc<dyn RemoteStore>,
    db_key: String,
    working_path: Option<PathBuf>,
    conn: Mutex<Option<SqliteConnection>>,
    flush_gate: Mutex<()>,
    mark: StdMutex<SyncMark>,
    state: watch::Sender<DbState>,
    changes: Arc<Notify>,
}

impl SyncedDatabase {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        db_key: impl Into<String>,
        working_path: Option<PathBuf>,
    ) -> Self {
        Self {
            store,
            db_key: db_key.into(),
            working_path,
            conn: Mutex::new(None),
            flush_gate: Mutex::new(()),
            mark: StdMutex::new(SyncMark::default()),
            state: watch::Sender::new(DbState::Uninitialized),
            changes: Arc::new(Notify::new()),
        }
    }

    pub fn from_config(cfg: &Config, store: Arc<dyn RemoteStore>) -> Self {
        let working_path = match cfg.basic.working_copy {
            WorkingCopy::Memory => None,
            WorkingCopy::Disk => cfg.working_db_path(),
        };
        Self::new(store, cfg.storage.db_key.clone(), working_path)
    }

    pub fn state(&self) -> DbState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<DbState> {
        self.state.subscribe()
    }

    pub fn db_key(&self) -> &str {
        &self.db_key
    }

    /// Content hash of the snapshot last exchanged with the remote store.
    pub fn remote_hash(&self) -> Option<String> {
        self.lock_mark().remote_hash.clone()
    }

    /// Loads the remote snapshot into the working copy, or starts empty.
    ///
    /// Missing remote state is a fresh deployment. An unreachable or unreadable remote degrades
    /// to the local copy. Either way the database ends up `Ready`.
    pub async fn open(&self) -> Result<OpenOutcome, SyncError> {
        if self.state() != DbState::Uninitialized {
            return Err(SyncError::Config(format!(
                "database {} is already opened",
                self.db_key
            )));
        }
        self.state.send_replace(DbState::Loading);

        match self.load().await {
            Ok((conn, outcome)) => {
                *self.conn.lock().await = Some(conn);
                self.state.send_replace(DbState::Ready);
                Ok(outcome)
            }
            Err(e) => {
                self.state.send_replace(DbState::Uninitialized);
                Err(e)
            }
        }
    }

    async fn load(&self) -> Result<(SqliteConnection, OpenOutcome), SyncError> {
        let mut conn = self.connect().await?;
        apply_schema(&mut conn).await?;

        let opened_at = Utc::now();
        let outcome = match self.store.get(&self.db_key).await {
            Ok(bytes) => match materialize(&mut conn, &bytes).await {
                Ok(remote) => {
                    info!(
                        key = %self.db_key,
                        format = ?remote.format,
                        size = bytes.len(),
                        "Working copy materialized from remote snapshot"
                    );
                    let mut mark = self.lock_mark();
                    mark.remote_hash = Some(remote.content_hash.clone());
                    mark.synced_at = Some(remote.captured_at.unwrap_or(opened_at));
                    OpenOutcome::Remote {
                        content_hash: remote.content_hash,
                    }
                }
                Err(e @ SyncError::Snapshot(_)) => {
                    // The next flush overwrites the unreadable remote copy.
                    self.lock_mark().synced_at = Some(opened_at);
                    warn!(
                        key = %self.db_key,
                        error = %e,
                        hash = %sha256_hex(&bytes),
                        "Remote snapshot unreadable, continuing on local copy"
                    );
                    OpenOutcome::LocalFallback {
                        reason: e.to_string(),
                    }
                }
                Err(e) => return Err(e),
            },
            Err(e) if e.is_not_found() => {
                self.lock_mark().synced_at = Some(opened_at);
                info!(key = %self.db_key, "No remote snapshot, starting with empty schema");
                OpenOutcome::Fresh
            }
            Err(e) if e.is_degradable() => {
                self.lock_mark().synced_at = Some(opened_at);
                warn!(
                    key = %self.db_key,
                    error = %e,
                    "Remote snapshot unavailable, continuing on local copy"
                );
                OpenOutcome::LocalFallback {
                    reason: e.to_string(),
                }
            }
            Err(e) => return Err(e),
        };
        Ok((conn, outcome))
    }

    /// Runs `f` in a transaction on the local working copy. Never waits on remote I/O.
    ///
    /// Commits when `f` succeeds, rolls back otherwise. If the transaction changed any row, the
    /// change signal fires so the scheduler can flush early.
    pub async fn execute<T, F>(&self, f: F) -> Result<T, SyncError>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T, SyncError>> + Send,
    {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(SyncError::Closed)?;

        let before = total_changes(conn).await?;
        let mut tx = conn.begin().await?;
        let value = match f(&mut *tx).await {
            Ok(value) => value,
            Err(e) => {
                tx.rollback().await?;
                return Err(e);
            }
        };
        tx.commit().await?;

        if total_changes(conn).await? != before {
            self.changes.notify_one();
        }
        Ok(value)
    }

    /// Uploads a snapshot of the working copy when it differs from the remote one.
    ///
    /// Returns [`SyncOutcome::Coalesced`] if another flush is in flight. Remote failures that
    /// synchronization tolerates come back as [`SyncOutcome::LocalFallback`].
    pub async fn flush(&self) -> Result<SyncOutcome, SyncError> {
        let Ok(_gate) = self.flush_gate.try_lock() else {
            debug!(key = %self.db_key, "Flush already in flight, coalescing");
            return Ok(SyncOutcome::Coalesced);
        };
        self.flush_locked().await
    }

    /// Final flush, then releases the working copy. Later calls fail with `Closed`.
    pub async fn close(&self) -> Result<SyncOutcome, SyncError> {
        let _gate = self.flush_gate.lock().await;
        if matches!(self.state(), DbState::Closed | DbState::Uninitialized) {
            return Ok(SyncOutcome::Unchanged);
        }
        let outcome = self.flush_locked().await;

        if let Some(conn) = self.conn.lock().await.take() {
            conn.close().await?;
        }
        self.state.send_replace(DbState::Closed);
        info!(key = %self.db_key, "Synced database closed");
        outcome
    }

    async fn flush_locked(&self) -> Result<SyncOutcome, SyncError> {
        let snapshot = {
            let mut guard = self.conn.lock().await;
            let conn = guard.as_mut().ok_or(SyncError::Closed)?;
            DatabaseSnapshot::capture(conn).await?
        };

        if self.remote_hash().as_deref() == Some(snapshot.content_hash()) {
            return Ok(SyncOutcome::Unchanged);
        }

        self.state.send_replace(DbState::Syncing);
        let res = self.push(&snapshot).await;
        self.state.send_replace(DbState::Ready);

        match res {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_degradable() => {
                warn!(
                    key = %self.db_key,
                    error = %e,
                    "Snapshot upload deferred, local copy stays authoritative"
                );
                Ok(SyncOutcome::LocalFallback {
                    reason: e.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn push(&self, snapshot: &DatabaseSnapshot) -> Result<SyncOutcome, SyncError> {
        if let Some(outcome) = self.resolve_conflict(snapshot).await? {
            return Ok(outcome);
        }

        self.store
            .put(&self.db_key, snapshot.bytes().clone())
            .await?;

        let mut mark = self.lock_mark();
        mark.remote_hash = Some(snapshot.content_hash().to_string());
        mark.synced_at = Some(snapshot.captured_at());
        info!(
            key = %self.db_key,
            hash = %snapshot.content_hash(),
            size = snapshot.bytes().len(),
            "Snapshot uploaded"
        );
        Ok(SyncOutcome::Uploaded)
    }

    /// Checks whether the remote changed behind our back. A newer remote snapshot replaces the
    /// working copy; otherwise the caller goes on to overwrite it.
    async fn resolve_conflict(
        &self,
        snapshot: &DatabaseSnapshot,
    ) -> Result<Option<SyncOutcome>, SyncError> {
        let bytes = match self.store.get(&self.db_key).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };

        let (known, synced_at) = {
            let mark = self.lock_mark();
            (mark.remote_hash.clone(), mark.synced_at)
        };
        let remote = match RemoteSnapshot::decode(&bytes).await {
            Ok(remote) => remote,
            Err(e @ SyncError::Snapshot(_)) => {
                let conflict = SyncError::Conflict {
                    key: self.db_key.clone(),
                    expected: known.unwrap_or_else(|| "<none>".to_string()),
                    found: sha256_hex(&bytes),
                };
                unreadable_remote(&conflict, &e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        if known.as_deref() == Some(remote.content_hash.as_str())
            || remote.content_hash == snapshot.content_hash()
        {
            return Ok(None);
        }

        let conflict = SyncError::Conflict {
            key: self.db_key.clone(),
            expected: known.unwrap_or_else(|| "<none>".to_string()),
            found: remote.content_hash.clone(),
        };
        let remote_is_newer = match (remote.captured_at, synced_at) {
            (Some(remote_at), Some(local_at)) => remote_at > local_at,
            (Some(_), None) => true,
            (None, _) => false,
        };

        if !remote_is_newer {
            warn!(
                error = %conflict,
                "Remote snapshot is older than the last sync, local copy wins"
            );
            return Ok(None);
        }

        warn!(
            error = %conflict,
            remote_captured_at = ?remote.captured_at,
            "Newer remote snapshot wins, replacing local copy"
        );
        let restored = {
            let mut guard = self.conn.lock().await;
            let conn = guard.as_mut().ok_or(SyncError::Closed)?;
            restore(conn, &remote.sql).await
        };
        match restored {
            Ok(()) => {}
            Err(e @ SyncError::Snapshot(_)) => {
                unreadable_remote(&conflict, &e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        }
        let mut mark = self.lock_mark();
        mark.remote_hash = Some(remote.content_hash);
        mark.synced_at = remote.captured_at;
        Ok(Some(SyncOutcome::RemoteWon))
    }

    async fn connect(&self) -> Result<SqliteConnection, SyncError> {
        let conn = match &self.working_path {
            None => {
                SqliteConnectOptions::new()
                    .in_memory(true)
                    .foreign_keys(true)
                    .connect()
                    .await?
            }
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent).await?;
                }
                SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true)
                    .busy_timeout(Duration::from_secs(5))
                    .journal_mode(SqliteJournalMode::Wal)
                    .synchronous(SqliteSynchronous::Normal)
                    .foreign_keys(true)
                    .connect()
                    .await?
            }
        };
        debug!(
            key = %self.db_key,
            disk = self.working_path.is_some(),
            "Working copy connection opened"
        );
        Ok(conn)
    }

    fn lock_mark(&self) -> std::sync::MutexGuard<'_, SyncMark> {
        self.mark
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// A remote snapshot that cannot be replayed counts as older than the working copy.
fn unreadable_remote(conflict: &SyncError, cause: &SyncError) {
    warn!(
        error = %conflict,
        cause = %cause,
        "Remote snapshot unreadable, local copy wins"
    );
}

async fn materialize(
    conn: &mut SqliteConnection,
    bytes: &[u8],
) -> Result<RemoteSnapshot, SyncError> {
    let remote = RemoteSnapshot::decode(bytes).await?;
    restore(conn, &remote.sql).await?;
    Ok(remote)
}

async fn total_changes(conn: &mut SqliteConnection) -> Result<i64, sqlx::Error> {
    (&mut *conn)
        .fetch_one("SELECT total_changes()")
        .await?
        .try_get(0)
}

#[async_trait]
impl Reconcile for SyncedDatabase {
    fn name(&self) -> &'static str {
        "database"
    }

    async fn reconcile(&self) -> Result<SyncOutcome, SyncError> {
        match self.state() {
            DbState::Ready | DbState::Syncing => self.flush().await,
            DbState::Closed => Err(SyncError::Closed),
            DbState::Uninitialized | DbState::Loading => Ok(SyncOutcome::Unchanged),
        }
    }

    fn change_signal(&self) -> Option<Arc<Notify>> {
        Some(self.changes.clone())
    }

    async fn drain(&self) -> Result<(), SyncError> {
        let _gate = self.flush_gate.lock().await;
        if self.state() == DbState::Ready {
            self.flush_locked().await?;
        }
        Ok(())
    }
}

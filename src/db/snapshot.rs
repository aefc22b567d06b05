use super::schema::apply_schema;
use crate::error::SyncError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::{
    ConnectOptions, Connection, Executor, Row, SqliteConnection,
    sqlite::{SqliteConnectOptions, SqliteJournalMode},
};
use std::fmt::Write as _;
use tracing::debug;

const MAGIC: &str = "-- intentsync snapshot v1";
const CAPTURED_AT: &str = "-- captured_at: ";
const CONTENT_HASH: &str = "-- content_hash: ";
const SQLITE_IMAGE_MAGIC: &[u8] = b"SQLite format 3\0";

/// One point-in-time serialization of the working database.
///
/// The payload is a deterministic SQL dump behind a three line header; `content_hash` covers
/// the dump only, so two captures of the same data hash equally regardless of when they ran.
#[derive(Debug, Clone)]
pub struct DatabaseSnapshot {
    bytes: Bytes,
    content_hash: String,
    captured_at: DateTime<Utc>,
}

impl DatabaseSnapshot {
    pub async fn capture(conn: &mut SqliteConnection) -> Result<Self, SyncError> {
        let body = dump_sql(conn).await?;
        Ok(Self::from_dump(&body, Utc::now()))
    }

    pub(crate) fn from_dump(body: &str, captured_at: DateTime<Utc>) -> Self {
        let content_hash = sha256_hex(body.as_bytes());
        let mut out = String::with_capacity(body.len() + 160);
        out.push_str(MAGIC);
        out.push('\n');
        let _ = writeln!(out, "{CAPTURED_AT}{}", captured_at.to_rfc3339());
        let _ = writeln!(out, "{CONTENT_HASH}{content_hash}");
        out.push_str(body);
        Self {
            bytes: Bytes::from(out),
            content_hash,
            captured_at,
        }
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotFormat {
    /// Header plus canonical dump, as written by [`DatabaseSnapshot::capture`].
    Canonical,
    /// A raw SQLite database file.
    SqliteImage,
    /// A SQL script without header, e.g. the output of `sqlite3 .dump`.
    PlainSql,
}

/// A snapshot downloaded from the remote store, decoded into replayable SQL.
#[derive(Debug, Clone)]
pub struct RemoteSnapshot {
    pub format: SnapshotFormat,
    pub sql: String,
    pub content_hash: String,
    /// Only canonical snapshots carry a capture time.
    pub captured_at: Option<DateTime<Utc>>,
}

impl RemoteSnapshot {
    pub async fn decode(bytes: &[u8]) -> Result<Self, SyncError> {
        if bytes.starts_with(SQLITE_IMAGE_MAGIC) {
            let sql = dump_image(bytes).await?;
            return Ok(Self {
                format: SnapshotFormat::SqliteImage,
                sql,
                content_hash: sha256_hex(bytes),
                captured_at: None,
            });
        }

        let text = std::str::from_utf8(bytes).map_err(|e| {
            SyncError::Snapshot(format!(
                "snapshot is neither SQL text nor a SQLite image: {e}"
            ))
        })?;

        if let Some(rest) = text.strip_prefix(MAGIC) {
            return Self::decode_canonical(rest);
        }

        Ok(Self {
            format: SnapshotFormat::PlainSql,
            sql: strip_transaction_control(text),
            content_hash: sha256_hex(bytes),
            captured_at: None,
        })
    }

    fn decode_canonical(rest: &str) -> Result<Self, SyncError> {
        let mut parts = rest.splitn(4, '\n');
        let _ = parts.next();
        let captured = parts
            .next()
            .and_then(|l| l.strip_prefix(CAPTURED_AT))
            .ok_or_else(|| SyncError::Snapshot("missing captured_at header".into()))?;
        let declared = parts
            .next()
            .and_then(|l| l.strip_prefix(CONTENT_HASH))
            .ok_or_else(|| SyncError::Snapshot("missing content_hash header".into()))?;
        let body = parts.next().unwrap_or_default();

        let captured_at = DateTime::parse_from_rfc3339(captured.trim())
            .map_err(|e| SyncError::Snapshot(format!("invalid captured_at {captured:?}: {e}")))?
            .with_timezone(&Utc);
        let actual = sha256_hex(body.as_bytes());
        if actual != declared.trim() {
            return Err(SyncError::Snapshot(format!(
                "content hash mismatch: header {declared}, body {actual}"
            )));
        }

        Ok(Self {
            format: SnapshotFormat::Canonical,
            sql: body.to_string(),
            content_hash: actual,
            captured_at: Some(captured_at),
        })
    }
}

/// Replaces every user table and view with the contents of `sql`, atomically.
///
/// On failure the transaction rolls back and the working copy is left as it was.
pub async fn restore(conn: &mut SqliteConnection, sql: &str) -> Result<(), SyncError> {
    (&mut *conn).execute("PRAGMA foreign_keys = OFF").await?;
    let res = restore_in_tx(conn, sql).await;
    (&mut *conn).execute("PRAGMA foreign_keys = ON").await?;
    res
}

// sqlx calls in this module go through `Executor` so the futures stay `Send` for any borrow.
async fn restore_in_tx(conn: &mut SqliteConnection, sql: &str) -> Result<(), SyncError> {
    let mut tx = conn.begin().await?;

    let objects = (&mut *tx)
        .fetch_all(
            r"
            SELECT type, name FROM sqlite_master
            WHERE type IN ('view', 'table') AND name NOT LIKE 'sqlite_%'
            ORDER BY type DESC, name
            ",
        )
        .await?;
    for row in &objects {
        let kind: String = row.try_get(0)?;
        let name: String = row.try_get(1)?;
        let stmt = format!("DROP {} IF EXISTS {}", kind.to_uppercase(), quote_ident(&name));
        (&mut *tx).execute(stmt.as_str()).await?;
    }

    if !sql.trim().is_empty() {
        (&mut *tx)
            .execute(sqlx::raw_sql(sql))
            .await
            .map_err(|e| SyncError::Snapshot(format!("replaying snapshot failed: {e}")))?;
    }
    apply_schema(&mut tx).await?;

    tx.commit().await?;
    Ok(())
}

/// Deterministic SQL dump: tables by name with rows by rowid, then indexes, triggers and views.
pub(crate) async fn dump_sql(conn: &mut SqliteConnection) -> Result<String, SyncError> {
    let tables = (&mut *conn)
        .fetch_all(
            r"
            SELECT name, sql FROM sqlite_master
            WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND sql IS NOT NULL
            ORDER BY name
            ",
        )
        .await?;

    let mut out = String::new();
    for row in &tables {
        let name: String = row.try_get(0)?;
        let create: String = row.try_get(1)?;
        let _ = writeln!(out, "{create};");

        let columns = (&mut *conn)
            .fetch_all(
                sqlx::query("SELECT name FROM pragma_table_info(?) ORDER BY cid").bind(&name),
            )
            .await?
            .iter()
            .map(|r| r.try_get::<String, _>(0))
            .collect::<Result<Vec<_>, _>>()?;
        if columns.is_empty() {
            continue;
        }

        let ident = quote_ident(&name);
        let values = columns
            .iter()
            .map(|c| format!("quote({})", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(" || ',' || ");
        let order = if create.to_ascii_uppercase().contains("WITHOUT ROWID") {
            "1"
        } else {
            "rowid"
        };
        let select = format!(
            "SELECT 'INSERT INTO {} VALUES(' || {values} || ');' FROM {ident} ORDER BY {order}",
            ident.replace('\'', "''"),
        );
        for row in (&mut *conn).fetch_all(select.as_str()).await? {
            out.push_str(&row.try_get::<String, _>(0)?);
            out.push('\n');
        }
    }

    let others = (&mut *conn)
        .fetch_all(
            r"
            SELECT sql FROM sqlite_master
            WHERE type IN ('index', 'trigger', 'view') AND sql IS NOT NULL
              AND name NOT LIKE 'sqlite_%'
            ORDER BY type, name
            ",
        )
        .await?;
    for row in &others {
        let _ = writeln!(out, "{};", row.try_get::<String, _>(0)?);
    }

    debug!(tables = tables.len(), size = out.len(), "Database dumped");
    Ok(out)
}

async fn dump_image(bytes: &[u8]) -> Result<String, SyncError> {
    let file = tempfile::Builder::new()
        .prefix("intentsync-image-")
        .suffix(".db")
        .tempfile()?;
    tokio::fs::write(file.path(), bytes).await?;

    let mut conn = SqliteConnectOptions::new()
        .filename(file.path())
        .journal_mode(SqliteJournalMode::Delete)
        .connect()
        .await?;
    let sql = dump_sql(&mut conn).await;
    conn.close().await?;
    sql
}

fn strip_transaction_control(text: &str) -> String {
    text.lines()
        .filter(|line| {
            let l = line.trim().to_ascii_uppercase();
            !(l == "BEGIN TRANSACTION;"
                || l == "BEGIN;"
                || l == "COMMIT;"
                || l == "END TRANSACTION;"
                || l.starts_with("PRAGMA "))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::interactions::{count_interactions, record_interaction};
    use crate::db::models::NewInteraction;

    async fn memory_conn() -> SqliteConnection {
        let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
        apply_schema(&mut conn).await.unwrap();
        conn
    }

    fn interaction(text: &str) -> NewInteraction {
        NewInteraction {
            session_id: "s1".into(),
            text: text.into(),
            predicted_intent: "greeting".into(),
            confidence: 0.75,
            model_version: None,
            feedback: None,
        }
    }

    #[tokio::test]
    async fn capture_is_deterministic_and_restores() {
        let mut src = memory_conn().await;
        record_interaction(&mut src, interaction("hello 'quoted'"))
            .await
            .unwrap();
        record_interaction(&mut src, interaction("hi"))
            .await
            .unwrap();

        let first = DatabaseSnapshot::capture(&mut src).await.unwrap();
        let second = DatabaseSnapshot::capture(&mut src).await.unwrap();
        assert_eq!(first.content_hash(), second.content_hash());

        let decoded = RemoteSnapshot::decode(first.bytes()).await.unwrap();
        assert_eq!(decoded.format, SnapshotFormat::Canonical);
        assert_eq!(decoded.content_hash, first.content_hash());

        let mut dst = memory_conn().await;
        record_interaction(&mut dst, interaction("stale")).await.unwrap();
        restore(&mut dst, &decoded.sql).await.unwrap();
        assert_eq!(count_interactions(&mut dst).await.unwrap(), 2);

        let copy = DatabaseSnapshot::capture(&mut dst).await.unwrap();
        assert_eq!(copy.content_hash(), first.content_hash());
    }

    #[tokio::test]
    async fn tampered_body_is_rejected() {
        let mut conn = memory_conn().await;
        let snap = DatabaseSnapshot::capture(&mut conn).await.unwrap();
        let mut raw = snap.bytes().to_vec();
        raw.extend_from_slice(b"DROP TABLE interactions;\n");
        assert!(matches!(
            RemoteSnapshot::decode(&raw).await,
            Err(SyncError::Snapshot(_))
        ));
    }

    #[tokio::test]
    async fn accepts_plain_dump_with_transaction_lines() {
        let dump = "PRAGMA foreign_keys=OFF;\nBEGIN TRANSACTION;\n\
            CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT);\n\
            INSERT INTO notes VALUES(1,'a');\nCOMMIT;\n";
        let decoded = RemoteSnapshot::decode(dump.as_bytes()).await.unwrap();
        assert_eq!(decoded.format, SnapshotFormat::PlainSql);
        assert!(decoded.captured_at.is_none());

        let mut conn = memory_conn().await;
        restore(&mut conn, &decoded.sql).await.unwrap();
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM notes")
            .fetch_one(&mut conn)
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(count_interactions(&mut conn).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn accepts_sqlite_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.db");
        let mut file_conn = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete)
            .connect()
            .await
            .unwrap();
        apply_schema(&mut file_conn).await.unwrap();
        for i in 0..3 {
            record_interaction(&mut file_conn, interaction(&format!("row {i}")))
                .await
                .unwrap();
        }
        file_conn.close().await.unwrap();

        let raw = std::fs::read(&path).unwrap();
        let decoded = RemoteSnapshot::decode(&raw).await.unwrap();
        assert_eq!(decoded.format, SnapshotFormat::SqliteImage);

        let mut conn = memory_conn().await;
        restore(&mut conn, &decoded.sql).await.unwrap();
        assert_eq!(count_interactions(&mut conn).await.unwrap(), 3);
    }
}

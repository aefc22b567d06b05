//! SQL DDL for the working database.

use sqlx::{Executor, SqliteConnection};

/// SQLite schema includes:
/// - `interactions` table (one classified user utterance per row)
/// - `feedback` table (user verdict on an interaction's predicted intent)
/// - `uploaded_models` table (user-submitted models waiting to join an ensemble)
pub const SQLITE_INIT: &str = r"
-- ---------------------------------------------------------------------------
-- Interactions
-- ---------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS interactions (
    id INTEGER PRIMARY KEY NOT NULL,
    session_id TEXT NOT NULL,
    text TEXT NOT NULL,
    predicted_intent TEXT NOT NULL,
    confidence REAL NOT NULL,
    model_version TEXT NULL,
    created_at TEXT NOT NULL -- RFC3339
);

CREATE INDEX IF NOT EXISTS idx_interactions_intent ON interactions(predicted_intent);

-- ---------------------------------------------------------------------------
-- Feedback (at most one verdict per interaction)
-- ---------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS feedback (
    id INTEGER PRIMARY KEY NOT NULL,
    interaction_id INTEGER NOT NULL REFERENCES interactions(id) ON DELETE CASCADE,
    is_correct INTEGER NOT NULL,
    correct_intent TEXT NULL,
    created_at TEXT NOT NULL, -- RFC3339
    UNIQUE(interaction_id)
);

-- ---------------------------------------------------------------------------
-- Uploaded models (status: pending | incorporated | rejected)
-- ---------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS uploaded_models (
    id INTEGER PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    uploader TEXT NULL,
    artifact_sha256 TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    accuracy REAL NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    version_id TEXT NULL,
    created_at TEXT NOT NULL, -- RFC3339
    updated_at TEXT NOT NULL, -- RFC3339
    UNIQUE(artifact_sha256)
);

CREATE INDEX IF NOT EXISTS idx_uploaded_models_status ON uploaded_models(status);
";

/// Creates any missing table or index. Safe to run on a populated database.
pub async fn apply_schema(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    for stmt in SQLITE_INIT.split(';') {
        let s = stmt.trim();
        if s.is_empty() {
            continue;
        }
        (&mut *conn).execute(s).await?;
    }
    Ok(())
}

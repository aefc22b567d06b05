//! Queries over the domain tables. Every helper runs on the connection handed out by
//! [`SyncedDatabase::execute`](super::SyncedDatabase::execute), inside its transaction.

use super::models::{DbInteraction, DbUploadedModel, IntentStats, NewInteraction, NewUploadedModel};
use chrono::Utc;
use sqlx::SqliteConnection;

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_INCORPORATED: &str = "incorporated";

/// Inserts an interaction and, when present, its feedback. Returns the interaction id.
pub async fn record_interaction(
    conn: &mut SqliteConnection,
    new: NewInteraction,
) -> Result<i64, sqlx::Error> {
    let now = Utc::now();
    let id: i64 = sqlx::query_scalar(
        r"
        INSERT INTO interactions (session_id, text, predicted_intent, confidence, model_version, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        RETURNING id
        ",
    )
    .bind(new.session_id)
    .bind(new.text)
    .bind(new.predicted_intent)
    .bind(new.confidence)
    .bind(new.model_version)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    if let Some(feedback) = new.feedback {
        sqlx::query(
            r"
            INSERT INTO feedback (interaction_id, is_correct, correct_intent, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(interaction_id) DO UPDATE SET
                is_correct = excluded.is_correct,
                correct_intent = excluded.correct_intent,
                created_at = excluded.created_at
            ",
        )
        .bind(id)
        .bind(feedback.is_correct)
        .bind(feedback.correct_intent)
        .bind(now)
        .execute(&mut *conn)
        .await?;
    }

    Ok(id)
}

pub async fn count_interactions(conn: &mut SqliteConnection) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM interactions")
        .fetch_one(&mut *conn)
        .await
}

pub async fn list_interactions(
    conn: &mut SqliteConnection,
    limit: i64,
) -> Result<Vec<DbInteraction>, sqlx::Error> {
    sqlx::query_as::<_, DbInteraction>(
        r"
        SELECT id, session_id, text, predicted_intent, confidence, model_version, created_at
        FROM interactions
        ORDER BY id DESC
        LIMIT ?
        ",
    )
    .bind(limit)
    .fetch_all(&mut *conn)
    .await
}

/// Interaction counts per predicted intent, with feedback verdicts.
pub async fn interaction_stats(
    conn: &mut SqliteConnection,
) -> Result<Vec<IntentStats>, sqlx::Error> {
    sqlx::query_as::<_, IntentStats>(
        r"
        SELECT
            i.predicted_intent AS intent,
            COUNT(*) AS total,
            COALESCE(SUM(CASE WHEN f.is_correct = 1 THEN 1 ELSE 0 END), 0) AS correct,
            COALESCE(SUM(CASE WHEN f.is_correct = 0 THEN 1 ELSE 0 END), 0) AS incorrect
        FROM interactions i
        LEFT JOIN feedback f ON f.interaction_id = i.id
        GROUP BY i.predicted_intent
        ORDER BY i.predicted_intent
        ",
    )
    .fetch_all(&mut *conn)
    .await
}

/// Records a user-submitted model; re-uploading the same artifact returns the existing id.
pub async fn record_uploaded_model(
    conn: &mut SqliteConnection,
    new: NewUploadedModel,
) -> Result<i64, sqlx::Error> {
    let now = Utc::now();
    sqlx::query_scalar(
        r"
        INSERT INTO uploaded_models (name, uploader, artifact_sha256, size_bytes, accuracy, status, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(artifact_sha256) DO UPDATE SET
            name = excluded.name,
            updated_at = excluded.updated_at
        RETURNING id
        ",
    )
    .bind(new.name)
    .bind(new.uploader)
    .bind(new.artifact_sha256)
    .bind(new.size_bytes)
    .bind(new.accuracy)
    .bind(STATUS_PENDING)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *conn)
    .await
}

pub async fn pending_uploaded_models(
    conn: &mut SqliteConnection,
) -> Result<Vec<DbUploadedModel>, sqlx::Error> {
    sqlx::query_as::<_, DbUploadedModel>(
        r"
        SELECT id, name, uploader, artifact_sha256, size_bytes, accuracy, status, version_id, created_at, updated_at
        FROM uploaded_models
        WHERE status = ?
        ORDER BY id
        ",
    )
    .bind(STATUS_PENDING)
    .fetch_all(&mut *conn)
    .await
}

/// Marks uploaded models as part of registry version `version_id`. Returns rows changed.
pub async fn mark_incorporated(
    conn: &mut SqliteConnection,
    ids: &[i64],
    version_id: &str,
) -> Result<u64, sqlx::Error> {
    let now = Utc::now();
    let mut changed = 0;
    for id in ids {
        changed += sqlx::query(
            r"
            UPDATE uploaded_models
            SET status = ?, version_id = ?, updated_at = ?
            WHERE id = ? AND status = ?
            ",
        )
        .bind(STATUS_INCORPORATED)
        .bind(version_id)
        .bind(now)
        .bind(id)
        .bind(STATUS_PENDING)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    }
    Ok(changed)
}

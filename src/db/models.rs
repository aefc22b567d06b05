use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FromRow)]
pub struct DbInteraction {
    pub id: i64,
    pub session_id: String,
    pub text: String,
    pub predicted_intent: String,
    pub confidence: f64,
    pub model_version: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FromRow)]
pub struct DbUploadedModel {
    pub id: i64,
    pub name: String,
    pub uploader: Option<String>,
    pub artifact_sha256: String,
    pub size_bytes: i64,
    pub accuracy: Option<f64>,
    pub status: String,
    /// Registry version the model was incorporated into.
    pub version_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-intent aggregate over interactions and their feedback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FromRow)]
pub struct IntentStats {
    pub intent: String,
    pub total: i64,
    pub correct: i64,
    pub incorrect: i64,
}

#[derive(Debug, Clone)]
pub struct NewInteraction {
    pub session_id: String,
    pub text: String,
    pub predicted_intent: String,
    pub confidence: f64,
    pub model_version: Option<String>,
    pub feedback: Option<NewFeedback>,
}

#[derive(Debug, Clone)]
pub struct NewFeedback {
    pub is_correct: bool,
    pub correct_intent: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewUploadedModel {
    pub name: String,
    pub uploader: Option<String>,
    pub artifact_sha256: String,
    pub size_bytes: i64,
    pub accuracy: Option<f64>,
}

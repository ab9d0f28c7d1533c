//! Pipeline entities
//!
//! Rows owned by the task store. The core treats them as value objects
//! with identity; all mutation goes through the store traits.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::payloads::{DetectionResult, FactSource, SnippetAnalysis};
use super::status::{EmbeddingStatus, KbStatus, ProcessingStatus};

/// A recorded radio broadcast awaiting (or through) detection.
///
/// Created by ingestion; mutated only by the detection worker; never
/// deleted by the pipeline, only reset.
#[derive(Debug, Clone)]
pub struct AudioFile {
    pub id: Uuid,
    pub file_path: String,
    pub station_code: String,
    pub station_name: String,
    pub location_state: String,
    pub location_city: Option<String>,
    pub recorded_at: DateTime<Utc>,
    pub status: ProcessingStatus,
    pub error_message: Option<String>,
}

/// Detection output for one audio file (1:1 per run).
///
/// Written by the detection stage, consumed by the clipping stage.
#[derive(Debug, Clone)]
pub struct Stage1Response {
    pub id: Uuid,
    pub audio_file_id: Uuid,
    pub timestamped_transcription: Option<String>,
    pub transcribed_by: Option<String>,
    pub initial_detection_result: Option<DetectionResult>,
    pub detection_result: Option<DetectionResult>,
    pub status: ProcessingStatus,
    pub error_message: Option<String>,
}

/// An extracted clip around one flagged region.
///
/// The id is assigned by the clipping producer (taken from the flagged
/// snippet in the detection result), which makes re-insertion after a
/// partial clipping failure idempotent.
#[derive(Debug, Clone)]
pub struct Snippet {
    pub id: Uuid,
    pub audio_file_id: Uuid,
    pub stage1_response_id: Uuid,
    pub file_path: String,
    pub recorded_at: DateTime<Utc>,
    /// Clip length, normalized `HH:MM:SS`
    pub duration: String,
    /// Flagged region start within the clip, normalized `HH:MM:SS`
    pub start_time: String,
    /// Flagged region end within the clip, normalized `HH:MM:SS`
    pub end_time: String,
    pub status: ProcessingStatus,
    pub error_message: Option<String>,
    pub analysis: Option<SnippetAnalysis>,
    pub analyzed_by: Option<String>,
    pub reviewed_by: Option<String>,
    /// Point-in-time backup of `analysis` taken before the first review
    pub previous_analysis: Option<SnippetAnalysis>,
}

/// Embedding of one processed snippet (1:1).
#[derive(Debug, Clone)]
pub struct SnippetEmbedding {
    pub snippet_id: Uuid,
    pub document: String,
    pub embedding: Vec<f32>,
    pub model_name: String,
    pub status: EmbeddingStatus,
    pub error_message: Option<String>,
}

/// A verified fact in the knowledge base.
///
/// Entries form a version chain: superseding never mutates fact text in
/// place. The embedding row exists exactly while the entry is `active`.
#[derive(Debug, Clone)]
pub struct KbEntry {
    pub id: Uuid,
    pub fact: String,
    pub confidence_score: u8,
    pub categories: Vec<String>,
    pub keywords: Vec<String>,
    pub related_claim: Option<String>,
    pub is_time_sensitive: bool,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub status: KbStatus,
    pub deactivation_reason: Option<String>,
    pub version: u32,
    pub previous_version: Option<Uuid>,
    pub superseded_by: Option<Uuid>,
    pub created_by_snippet: Option<Uuid>,
    pub created_by_model: String,
    pub created_at: DateTime<Utc>,
}

/// A knowledge-base search hit with its similarity score.
#[derive(Debug, Clone)]
pub struct KbMatch {
    pub entry: KbEntry,
    pub sources: Vec<FactSource>,
    pub similarity: f32,
}

/// Audit link between a snippet and the KB entry it produced or refreshed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KbUsage {
    TriggeredCreation,
    TriggeredUpdate,
}

impl KbUsage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TriggeredCreation => "triggered_creation",
            Self::TriggeredUpdate => "triggered_update",
        }
    }
}

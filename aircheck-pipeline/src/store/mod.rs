//! Task store traits: the reservation protocol contract
//!
//! The store is the only shared mutable resource in the pipeline and the
//! only synchronization point between workers. `claim_next_*` operations
//! are atomic: they select one eligible row, move it to its in-progress
//! state, and return the payload in a single step, so two workers can
//! never observe the same row as claimable. `Ok(None)` from a claim means
//! "no work right now" and is a normal, frequent result.
//!
//! Fetch-by-id ("targeted mode") deliberately does NOT claim; callers that
//! use it must write the in-progress state themselves and accept that the
//! path is only safe for single-operator invocation.

mod sqlite;

pub use sqlite::SqliteTaskStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use aircheck_common::Result;

use crate::models::{
    AudioFile, DetectionResult, FactSource, KbEntry, KbMatch, KbUsage, ProcessingStatus, Snippet,
    SnippetAnalysis, SnippetEmbedding, Stage1Response,
};

/// Reservation, mutation, and undo operations over pipeline work items.
#[async_trait]
pub trait TaskStore: Send + Sync {
    // ---- atomic claims ----

    /// Claim the next `New` audio file, moving it to `Processing`.
    async fn claim_next_audio_file(&self) -> Result<Option<AudioFile>>;

    /// Claim the next `New` stage-1 response, moving it to `Processing`.
    async fn claim_next_stage1_response(&self) -> Result<Option<Stage1Response>>;

    /// Claim the next `New` snippet, moving it to `Processing`.
    async fn claim_next_snippet(&self) -> Result<Option<Snippet>>;

    /// Claim the next `Ready for review` snippet, moving it to `Reviewing`.
    async fn claim_next_reviewable_snippet(&self) -> Result<Option<Snippet>>;

    /// Next `Processed` snippet with no embedding row. No status is
    /// written; exclusivity comes from the embedding upsert being
    /// idempotent.
    async fn claim_next_unembedded_snippet(&self) -> Result<Option<Snippet>>;

    // ---- targeted fetch ----

    async fn get_audio_file(&self, id: Uuid) -> Result<Option<AudioFile>>;
    async fn get_stage1_response(&self, id: Uuid) -> Result<Option<Stage1Response>>;
    async fn get_snippet(&self, id: Uuid) -> Result<Option<Snippet>>;

    // ---- status writes ----

    async fn set_audio_file_status(
        &self,
        id: Uuid,
        status: ProcessingStatus,
        error_message: Option<&str>,
    ) -> Result<()>;

    async fn set_stage1_response_status(
        &self,
        id: Uuid,
        status: ProcessingStatus,
        error_message: Option<&str>,
    ) -> Result<()>;

    async fn set_snippet_status(
        &self,
        id: Uuid,
        status: ProcessingStatus,
        error_message: Option<&str>,
    ) -> Result<()>;

    // ---- inserts ----

    async fn insert_stage1_response(&self, response: &Stage1Response) -> Result<()>;

    /// Insert a snippet with its producer-assigned id. Returns false if a
    /// row with that id already exists (idempotent re-insert).
    async fn insert_snippet(&self, snippet: &Snippet) -> Result<bool>;

    // ---- stage-specific updates ----

    async fn update_stage1_detection(&self, id: Uuid, result: &DetectionResult) -> Result<()>;

    async fn update_stage1_transcription(
        &self,
        id: Uuid,
        transcription: &str,
        transcribed_by: &str,
    ) -> Result<()>;

    async fn update_snippet_analysis(
        &self,
        id: Uuid,
        analysis: &SnippetAnalysis,
        analyzed_by: &str,
        status: ProcessingStatus,
    ) -> Result<()>;

    /// Copy `analysis` into `previous_analysis` if no backup exists yet.
    async fn backup_snippet_analysis(&self, id: Uuid) -> Result<()>;

    /// Write the reviewed analysis and move the snippet to `Processed`.
    async fn submit_snippet_review(
        &self,
        id: Uuid,
        analysis: &SnippetAnalysis,
        reviewed_by: &str,
    ) -> Result<()>;

    // ---- undo support ----

    /// Reset audio files to `New`, clearing error messages.
    async fn reset_audio_files(&self, ids: &[Uuid]) -> Result<u64>;

    /// Delete the stage-1 responses belonging to the given audio files.
    async fn delete_stage1_responses_for(&self, audio_file_ids: &[Uuid]) -> Result<u64>;

    /// Reset a stage-1 response to `New`, clearing its error message.
    async fn reset_stage1_response(&self, id: Uuid) -> Result<()>;

    async fn delete_snippet(&self, id: Uuid) -> Result<()>;

    /// Clear analysis fields and reset snippets to `New`.
    async fn reset_snippets(&self, ids: &[Uuid]) -> Result<u64>;

    // ---- embeddings ----

    async fn upsert_snippet_embedding(&self, embedding: &SnippetEmbedding) -> Result<()>;
    async fn delete_snippet_embedding(&self, snippet_id: Uuid) -> Result<()>;
}

/// Knowledge-base persistence consumed by the dedup/versioning engine.
#[async_trait]
pub trait KbStore: Send + Sync {
    /// Insert an entry together with its sources and embedding, atomically.
    async fn insert_entry(
        &self,
        entry: &KbEntry,
        sources: &[FactSource],
        document: &str,
        embedding: &[f32],
        embedding_model: &str,
    ) -> Result<()>;

    async fn get_entry(&self, id: Uuid) -> Result<Option<KbEntry>>;

    async fn entry_sources(&self, id: Uuid) -> Result<Vec<FactSource>>;

    /// Active entries whose embedding has cosine similarity >= threshold,
    /// most similar first, optionally filtered by category overlap and
    /// temporal validity window.
    async fn search_active(
        &self,
        embedding: &[f32],
        threshold: f32,
        limit: usize,
        categories: Option<&[String]>,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Vec<KbMatch>>;

    /// Mark `old_id` superseded by `new_id` and delete its embedding row,
    /// so it drops out of the searchable set atomically.
    async fn mark_superseded(&self, old_id: Uuid, new_id: Uuid) -> Result<()>;

    /// Terminal retraction: set status and reason, delete the embedding.
    /// Returns false if the entry does not exist.
    async fn deactivate_entry(&self, id: Uuid, reason: &str) -> Result<bool>;

    /// Record an audit link between a snippet and a KB entry.
    async fn record_usage(&self, entry_id: Uuid, snippet_id: Uuid, usage: KbUsage) -> Result<()>;
}

/// Cosine similarity between two vectors. Returns 0.0 when either side has
/// zero magnitude or the dimensions differ.
pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![0.5, -0.25, 1.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn cosine_handles_degenerate_input() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }
}

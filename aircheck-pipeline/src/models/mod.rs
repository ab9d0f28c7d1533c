//! Data model: entities, statuses, and typed stage-boundary payloads

mod entities;
mod payloads;
mod status;

pub use entities::{
    AudioFile, KbEntry, KbMatch, KbUsage, Snippet, SnippetEmbedding, Stage1Response,
};
pub use payloads::{
    ClipContext, ConfidenceScores, DetectionResult, FactSource, FactSubmission, FlaggedSnippet,
    ReviewOutcome, SnippetAnalysis, SourceTier,
};
pub use status::{EmbeddingStatus, KbStatus, ProcessingStatus};

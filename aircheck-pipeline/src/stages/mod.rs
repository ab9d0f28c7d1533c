//! Pipeline stages
//!
//! One module per stage, each implementing [`StageWorker`] over the shared
//! store. The operator-invoked undo operations live here because they cut
//! across stages: each one walks a stage's outputs backwards and returns
//! the inputs to `New`.

mod analysis;
mod clipping;
mod detection;
mod embedding;
mod review;

pub use analysis::AnalysisStage;
pub use clipping::ClippingStage;
pub use detection::DetectionStage;
pub use embedding::EmbeddingStage;
pub use review::ReviewStage;

use tracing::{info, warn};
use uuid::Uuid;

use aircheck_common::{Error, Result};

use crate::storage::ObjectStorage;
use crate::store::TaskStore;

/// Store failures propagate out of a stage and stop the worker loop;
/// everything else is recorded on the item.
pub(crate) fn is_store_failure(err: &Error) -> bool {
    matches!(err, Error::Database(_))
}

/// Undo detection: audio files back to `New`, their stage-1 responses
/// deleted. The detection worker will redo them from scratch.
pub async fn undo_detection(store: &dyn TaskStore, audio_file_ids: &[Uuid]) -> Result<u64> {
    let deleted = store.delete_stage1_responses_for(audio_file_ids).await?;
    let reset = store.reset_audio_files(audio_file_ids).await?;
    info!(
        reset,
        responses_deleted = deleted,
        "Undid detection for {} audio file(s)",
        audio_file_ids.len()
    );
    Ok(reset)
}

/// Undo clipping for the given stage-1 responses: delete the snippet rows
/// and clip objects they produced, then reset each response to `New`.
///
/// Snippet ids are recovered from the stored detection result, so this
/// also cleans up after a partially-failed clipping run.
pub async fn undo_clipping(
    store: &dyn TaskStore,
    storage: &dyn ObjectStorage,
    stage1_ids: &[Uuid],
) -> Result<u64> {
    let mut reset = 0u64;
    for &stage1_id in stage1_ids {
        let Some(response) = store.get_stage1_response(stage1_id).await? else {
            warn!(stage1_response = %stage1_id, "Stage-1 response not found, skipping");
            continue;
        };

        let flagged = response
            .detection_result
            .as_ref()
            .map(|r| r.flagged_snippets.as_slice())
            .unwrap_or_default();

        for flagged_snippet in flagged {
            if let Some(snippet) = store.get_snippet(flagged_snippet.id).await? {
                storage.delete(&snippet.file_path).await?;
                store.delete_snippet(snippet.id).await?;
                info!(snippet = %snippet.id, "Deleted snippet and its clip");
            }
        }

        store.reset_stage1_response(stage1_id).await?;
        reset += 1;
    }
    info!(reset, "Undid clipping for {} response(s)", stage1_ids.len());
    Ok(reset)
}

/// Reset snippets to `New` with all analysis fields cleared. The inverse
/// of the analysis and review stages.
pub async fn reset_snippets(store: &dyn TaskStore, snippet_ids: &[Uuid]) -> Result<u64> {
    let reset = store.reset_snippets(snippet_ids).await?;
    info!(reset, "Reset {} snippet(s) to New", snippet_ids.len());
    Ok(reset)
}

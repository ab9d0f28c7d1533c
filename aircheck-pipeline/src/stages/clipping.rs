//! Clipping stage (stage 2)
//!
//! Claims a stage-1 response and cuts one padded clip per flagged region
//! out of the source recording. Snippet rows reuse the producer-assigned
//! ids from the detection result, so a rerun after a partial failure
//! skips the clips that already landed.

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use aircheck_common::{Error, Result, clock_time};

use crate::clipper::AudioClipper;
use crate::models::{FlaggedSnippet, ProcessingStatus, Snippet, Stage1Response};
use crate::storage::ObjectStorage;
use crate::store::TaskStore;
use crate::worker::{ItemOutcome, StageWorker};

use super::is_store_failure;

/// A flagged window after validation, in seconds from recording start.
#[derive(Debug)]
struct ClipWindow {
    start: f64,
    end: f64,
}

pub struct ClippingStage {
    store: Arc<dyn TaskStore>,
    storage: Arc<dyn ObjectStorage>,
    clipper: Arc<dyn AudioClipper>,
    context_before: f64,
    context_after: f64,
}

impl ClippingStage {
    pub fn new(
        store: Arc<dyn TaskStore>,
        storage: Arc<dyn ObjectStorage>,
        clipper: Arc<dyn AudioClipper>,
        context_before_secs: u32,
        context_after_secs: u32,
    ) -> Self {
        Self {
            store,
            storage,
            clipper,
            context_before: context_before_secs as f64,
            context_after: context_after_secs as f64,
        }
    }

    async fn run(&self, response: &Stage1Response) -> Result<()> {
        let result = response
            .detection_result
            .as_ref()
            .ok_or_else(|| Error::Data("stage-1 response has no detection result".to_string()))?;

        let file = self
            .store
            .get_audio_file(response.audio_file_id)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!("audio file {}", response.audio_file_id))
            })?;

        let local = self.storage.fetch(&file.file_path).await?;
        let total_duration = self.clipper.probe_duration(&local).await?;

        // Validate every window before cutting anything. One bad window
        // fails the whole response rather than producing a partial set
        // with a gap nobody notices.
        let mut windows = Vec::with_capacity(result.flagged_snippets.len());
        for flagged in &result.flagged_snippets {
            windows.push(validate_window(flagged, total_duration)?);
        }

        let mut extracted = 0usize;
        for (flagged, window) in result.flagged_snippets.iter().zip(&windows) {
            if self.extract_one(&file.file_path, &local, response, flagged, window, file.recorded_at).await? {
                extracted += 1;
            }
        }

        self.store
            .set_stage1_response_status(response.id, ProcessingStatus::Processed, None)
            .await?;
        info!(
            stage1_response = %response.id,
            clips = extracted,
            flagged = result.flagged_snippets.len(),
            "Clipping finished"
        );
        Ok(())
    }

    /// Cut, upload, and record one clip. Returns false when the snippet
    /// row already existed (a previous partial run got this far).
    async fn extract_one(
        &self,
        source_key: &str,
        local: &std::path::Path,
        response: &Stage1Response,
        flagged: &FlaggedSnippet,
        window: &ClipWindow,
        recorded_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<bool> {
        let clip_start = (window.start - self.context_before).max(0.0);
        let clip_end = window.end + self.context_after;
        let clip_len = clip_end - clip_start;

        let key = clip_key(source_key, flagged.id);
        let temp = std::env::temp_dir().join(format!("aircheck-{}.mp3", flagged.id));
        self.clipper.cut(local, &temp, clip_start, clip_len).await?;
        let stored = self.storage.store(&key, &temp).await;
        if let Err(remove_err) = tokio::fs::remove_file(&temp).await {
            debug!(path = %temp.display(), error = %remove_err, "Could not remove temp clip");
        }
        stored?;

        let snippet = Snippet {
            id: flagged.id,
            audio_file_id: response.audio_file_id,
            stage1_response_id: response.id,
            file_path: key,
            recorded_at: recorded_at + ChronoDuration::milliseconds((clip_start * 1000.0) as i64),
            duration: clock_time::from_seconds(clip_len.round() as u32),
            start_time: clock_time::from_seconds((window.start - clip_start).round() as u32),
            end_time: clock_time::from_seconds((window.end - clip_start).round() as u32),
            status: ProcessingStatus::New,
            error_message: None,
            analysis: None,
            analyzed_by: None,
            reviewed_by: None,
            previous_analysis: None,
        };
        let inserted = self.store.insert_snippet(&snippet).await?;
        if !inserted {
            debug!(snippet = %flagged.id, "Snippet row already present, skipping insert");
        }
        Ok(inserted)
    }
}

/// Build the storage key for a clip from its source recording's key.
fn clip_key(source_key: &str, snippet_id: Uuid) -> String {
    let stem = source_key.rsplit('/').next().unwrap_or(source_key);
    let stem = stem.rsplit_once('.').map(|(s, _)| s).unwrap_or(stem);
    format!("snippets/{stem}/{snippet_id}.mp3")
}

fn validate_window(flagged: &FlaggedSnippet, total_duration: f64) -> Result<ClipWindow> {
    let start = clock_time::to_seconds(&flagged.start_time)? as f64;
    let end = clock_time::to_seconds(&flagged.end_time)? as f64;

    if start > end {
        return Err(Error::Data(format!(
            "flagged window {} starts after it ends ({} > {})",
            flagged.id, flagged.start_time, flagged.end_time
        )));
    }
    if end > total_duration {
        return Err(Error::Data(format!(
            "flagged window {} ends at {}s, past the {}s recording",
            flagged.id, end, total_duration
        )));
    }
    Ok(ClipWindow { start, end })
}

#[async_trait]
impl StageWorker for ClippingStage {
    type Item = Stage1Response;

    fn name(&self) -> &'static str {
        "clipping"
    }

    fn item_id(&self, item: &Stage1Response) -> Uuid {
        item.id
    }

    async fn claim_next(&self) -> Result<Option<Stage1Response>> {
        self.store.claim_next_stage1_response().await
    }

    async fn fetch_targeted(&self, id: Uuid) -> Result<Option<Stage1Response>> {
        let Some(mut response) = self.store.get_stage1_response(id).await? else {
            return Ok(None);
        };
        self.store
            .set_stage1_response_status(id, ProcessingStatus::Processing, None)
            .await?;
        response.status = ProcessingStatus::Processing;
        Ok(Some(response))
    }

    async fn process(&self, item: &Stage1Response) -> Result<ItemOutcome> {
        match self.run(item).await {
            Ok(()) => Ok(ItemOutcome::Processed),
            Err(err) if is_store_failure(&err) => Err(err),
            Err(err) => {
                warn!(stage1_response = %item.id, error = %err, "Clipping failed for item");
                self.store
                    .set_stage1_response_status(
                        item.id,
                        ProcessingStatus::Error,
                        Some(&err.to_string()),
                    )
                    .await?;
                Ok(ItemOutcome::Errored)
            }
        }
    }

    async fn recover(&self, item: &Stage1Response) -> Result<()> {
        let Some(current) = self.store.get_stage1_response(item.id).await? else {
            return Ok(());
        };
        if current.status == ProcessingStatus::Processing {
            self.store
                .set_stage1_response_status(item.id, ProcessingStatus::New, None)
                .await?;
            info!(stage1_response = %item.id, "Rolled claim back to New");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flagged(start: &str, end: &str) -> FlaggedSnippet {
        FlaggedSnippet {
            id: Uuid::new_v4(),
            start_time: start.into(),
            end_time: end.into(),
            transcription: "claim".into(),
            explanation: None,
            categories: vec![],
            keywords: vec![],
        }
    }

    #[test]
    fn windows_inside_the_recording_pass() {
        let window = validate_window(&flagged("12:30", "13:10"), 3600.0).unwrap();
        assert_eq!(window.start, 750.0);
        assert_eq!(window.end, 790.0);
    }

    #[test]
    fn inverted_windows_are_data_errors() {
        let err = validate_window(&flagged("13:10", "12:30"), 3600.0).unwrap_err();
        assert!(matches!(err, Error::Data(_)));
    }

    #[test]
    fn windows_past_the_end_are_data_errors() {
        let err = validate_window(&flagged("59:00", "61:00"), 3600.0).unwrap_err();
        assert!(matches!(err, Error::Data(_)));
    }

    #[test]
    fn garbled_times_are_data_errors() {
        let err = validate_window(&flagged("later", "13:10"), 3600.0).unwrap_err();
        assert!(matches!(err, Error::Data(_)));
    }

    #[test]
    fn clip_keys_nest_under_the_recording_stem() {
        let id = Uuid::new_v4();
        let key = clip_key("radio/KXYZ/2026-08-01T12.mp3", id);
        assert_eq!(key, format!("snippets/2026-08-01T12/{id}.mp3"));
    }
}

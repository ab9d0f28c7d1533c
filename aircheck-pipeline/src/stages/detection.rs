//! Detection stage (stage 1)
//!
//! Claims an audio file, transcribes it with timestamps, then runs a
//! detection call over the transcription plus recording metadata. The
//! flagged regions land in a new stage-1 response with producer-assigned
//! snippet ids, so the clipping stage can be re-run idempotently.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use aircheck_common::config::ModelConfig;
use aircheck_common::{Error, Result, clock_time};

use crate::escalation::{EscalationPolicy, parse_or_repair};
use crate::inference::{GenerateRequest, InferenceClient};
use crate::models::{AudioFile, DetectionResult, ProcessingStatus, Stage1Response};
use crate::storage::ObjectStorage;
use crate::store::TaskStore;
use crate::worker::{ItemOutcome, StageWorker};

use super::is_store_failure;

const TRANSCRIPTION_PROMPT: &str = "Transcribe this radio broadcast recording. \
Prefix each speaker turn with its start timestamp in MM:SS (or HH:MM:SS for \
recordings over an hour). Transcribe in the spoken language; do not translate. \
Include advertisements and station identifications.";

pub struct DetectionStage {
    store: Arc<dyn TaskStore>,
    storage: Arc<dyn ObjectStorage>,
    inference: Arc<dyn InferenceClient>,
    policy: EscalationPolicy,
    models: ModelConfig,
}

impl DetectionStage {
    pub fn new(
        store: Arc<dyn TaskStore>,
        storage: Arc<dyn ObjectStorage>,
        inference: Arc<dyn InferenceClient>,
        policy: EscalationPolicy,
        models: ModelConfig,
    ) -> Self {
        Self {
            store,
            storage,
            inference,
            policy,
            models,
        }
    }

    async fn run(&self, file: &AudioFile) -> Result<()> {
        let local = self.storage.fetch(&file.file_path).await?;

        let (transcription, transcribed_by) = self
            .policy
            .run(
                "transcription",
                &self.models.primary,
                &self.models.fallback,
                |model| {
                    let request =
                        GenerateRequest::new(model, TRANSCRIPTION_PROMPT).with_audio(local.clone());
                    async move { self.inference.generate(&request).await.map(|r| r.text) }
                },
            )
            .await?;

        let result = self.detect(&transcription, file).await?;
        let flagged = result.flagged_snippets.len();

        // A response with nothing flagged has no clipping work; it is
        // born Processed so the clipping worker never claims it.
        let status = if flagged == 0 {
            ProcessingStatus::Processed
        } else {
            ProcessingStatus::New
        };

        let response = Stage1Response {
            id: Uuid::new_v4(),
            audio_file_id: file.id,
            timestamped_transcription: Some(transcription),
            transcribed_by: Some(transcribed_by),
            initial_detection_result: Some(result.clone()),
            detection_result: Some(result),
            status,
            error_message: None,
        };
        self.store.insert_stage1_response(&response).await?;
        self.store
            .set_audio_file_status(file.id, ProcessingStatus::Processed, None)
            .await?;

        info!(
            audio_file = %file.id,
            stage1_response = %response.id,
            flagged,
            "Detection finished"
        );
        Ok(())
    }

    /// Run the detection call over an existing transcription.
    async fn detect(&self, transcription: &str, file: &AudioFile) -> Result<DetectionResult> {
        let prompt = detection_prompt(transcription, file);
        let schema = detection_schema();

        let (response, _) = self
            .policy
            .run(
                "detection",
                &self.models.primary,
                &self.models.fallback,
                |model| {
                    let request = GenerateRequest::new(model, prompt.clone())
                        .with_schema(schema.clone());
                    async move { self.inference.generate(&request).await }
                },
            )
            .await?;

        let mut result: DetectionResult = parse_or_repair(
            self.inference.as_ref(),
            &self.models.repair,
            &schema,
            &response.text,
        )
        .await?;
        normalize_windows(&mut result)?;
        Ok(result)
    }

    /// Operator redo: re-run the detection call over the transcription a
    /// stage-1 response already has, replacing its current detection
    /// result. The initial result stays untouched for comparison.
    pub async fn redo_detection(&self, stage1_ids: &[Uuid]) -> Result<u64> {
        let mut redone = 0u64;
        for &id in stage1_ids {
            let Some(response) = self.store.get_stage1_response(id).await? else {
                warn!(stage1_response = %id, "Stage-1 response not found, skipping");
                continue;
            };
            let Some(transcription) = response.timestamped_transcription.as_deref() else {
                warn!(stage1_response = %id, "No transcription to redo detection from, skipping");
                continue;
            };
            let Some(file) = self.store.get_audio_file(response.audio_file_id).await? else {
                return Err(Error::NotFound(format!(
                    "audio file {} for stage-1 response {id}",
                    response.audio_file_id
                )));
            };

            let result = self.detect(transcription, &file).await?;
            let flagged = result.flagged_snippets.len();
            self.store.update_stage1_detection(id, &result).await?;
            let status = if flagged == 0 {
                ProcessingStatus::Processed
            } else {
                ProcessingStatus::New
            };
            self.store.set_stage1_response_status(id, status, None).await?;
            info!(stage1_response = %id, flagged, "Redid detection");
            redone += 1;
        }
        Ok(redone)
    }

    /// Operator redo: regenerate the timestamped transcription for a
    /// stage-1 response from its source recording.
    pub async fn regenerate_transcript(&self, stage1_ids: &[Uuid]) -> Result<u64> {
        let mut regenerated = 0u64;
        for &id in stage1_ids {
            let Some(response) = self.store.get_stage1_response(id).await? else {
                warn!(stage1_response = %id, "Stage-1 response not found, skipping");
                continue;
            };
            let Some(file) = self.store.get_audio_file(response.audio_file_id).await? else {
                return Err(Error::NotFound(format!(
                    "audio file {} for stage-1 response {id}",
                    response.audio_file_id
                )));
            };
            let local = self.storage.fetch(&file.file_path).await?;

            let (transcription, transcribed_by) = self
                .policy
                .run(
                    "transcription",
                    &self.models.primary,
                    &self.models.fallback,
                    |model| {
                        let request = GenerateRequest::new(model, TRANSCRIPTION_PROMPT)
                            .with_audio(local.clone());
                        async move { self.inference.generate(&request).await.map(|r| r.text) }
                    },
                )
                .await?;

            self.store
                .update_stage1_transcription(id, &transcription, &transcribed_by)
                .await?;
            info!(stage1_response = %id, transcribed_by, "Regenerated transcription");
            regenerated += 1;
        }
        Ok(regenerated)
    }
}

/// Flagged windows are persisted in canonical `HH:MM:SS`; the model may
/// report them as "MM:SS" or bare seconds. An unparseable window is a
/// Data error failing the item.
fn normalize_windows(result: &mut DetectionResult) -> Result<()> {
    for flagged in &mut result.flagged_snippets {
        flagged.start_time = clock_time::normalize(&flagged.start_time)?;
        flagged.end_time = clock_time::normalize(&flagged.end_time)?;
    }
    Ok(())
}

fn detection_prompt(transcription: &str, file: &AudioFile) -> String {
    let location = match &file.location_city {
        Some(city) => format!("{}, {}", city, file.location_state),
        None => file.location_state.clone(),
    };
    format!(
        "You are reviewing a transcribed radio broadcast for claims that \
         warrant fact-checking. Flag each passage making a checkable factual \
         claim. For each flagged passage report its start_time and end_time \
         as they appear in the transcription, the verbatim transcription, a \
         short explanation, and category/keyword labels.\n\n\
         Station: {} ({})\n\
         Location: {}\n\
         Recorded: {} ({})\n\n\
         Transcription:\n{}",
        file.station_name,
        file.station_code,
        location,
        file.recorded_at.format("%Y-%m-%d %H:%M UTC"),
        file.recorded_at.format("%A"),
        transcription,
    )
}

fn detection_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "flagged_snippets": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "start_time": {"type": "string"},
                        "end_time": {"type": "string"},
                        "transcription": {"type": "string"},
                        "explanation": {"type": "string"},
                        "categories": {"type": "array", "items": {"type": "string"}},
                        "keywords": {"type": "array", "items": {"type": "string"}}
                    },
                    "required": ["start_time", "end_time", "transcription"]
                }
            }
        },
        "required": ["flagged_snippets"]
    })
}

#[async_trait]
impl StageWorker for DetectionStage {
    type Item = AudioFile;

    fn name(&self) -> &'static str {
        "detection"
    }

    fn item_id(&self, item: &AudioFile) -> Uuid {
        item.id
    }

    async fn claim_next(&self) -> Result<Option<AudioFile>> {
        self.store.claim_next_audio_file().await
    }

    async fn fetch_targeted(&self, id: Uuid) -> Result<Option<AudioFile>> {
        let Some(mut file) = self.store.get_audio_file(id).await? else {
            return Ok(None);
        };
        // Targeted mode claims explicitly; single-operator only.
        self.store
            .set_audio_file_status(id, ProcessingStatus::Processing, None)
            .await?;
        file.status = ProcessingStatus::Processing;
        Ok(Some(file))
    }

    async fn process(&self, item: &AudioFile) -> Result<ItemOutcome> {
        match self.run(item).await {
            Ok(()) => Ok(ItemOutcome::Processed),
            Err(err) if is_store_failure(&err) => Err(err),
            Err(err) => {
                warn!(audio_file = %item.id, error = %err, "Detection failed for item");
                self.store
                    .set_audio_file_status(item.id, ProcessingStatus::Error, Some(&err.to_string()))
                    .await?;
                Ok(ItemOutcome::Errored)
            }
        }
    }

    async fn recover(&self, item: &AudioFile) -> Result<()> {
        let Some(current) = self.store.get_audio_file(item.id).await? else {
            return Ok(());
        };
        // Only roll back if the row still shows our claim; a finished
        // result must not be clobbered.
        if current.status == ProcessingStatus::Processing {
            self.store
                .set_audio_file_status(item.id, ProcessingStatus::New, None)
                .await?;
            info!(audio_file = %item.id, "Rolled claim back to New");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn detection_prompt_carries_recording_metadata() {
        let file = AudioFile {
            id: Uuid::new_v4(),
            file_path: "radio/KXYZ/a.mp3".into(),
            station_code: "KXYZ".into(),
            station_name: "Radio XYZ".into(),
            location_state: "Texas".into(),
            location_city: Some("Houston".into()),
            recorded_at: "2026-08-01T12:00:00Z".parse().unwrap(),
            status: ProcessingStatus::Processing,
            error_message: None,
        };
        let prompt = detection_prompt("00:01 hello", &file);
        assert!(prompt.contains("Radio XYZ"));
        assert!(prompt.contains("Houston, Texas"));
        assert!(prompt.contains("Saturday")); // 2026-08-01
        assert!(prompt.contains("00:01 hello"));
    }

    #[test]
    fn prompt_without_city_uses_state_only() {
        let file = AudioFile {
            id: Uuid::new_v4(),
            file_path: "a.mp3".into(),
            station_code: "KXYZ".into(),
            station_name: "Radio XYZ".into(),
            location_state: "Texas".into(),
            location_city: None,
            recorded_at: Utc::now(),
            status: ProcessingStatus::Processing,
            error_message: None,
        };
        let prompt = detection_prompt("t", &file);
        assert!(prompt.contains("Location: Texas\n"));
    }

    #[test]
    fn flagged_windows_are_stored_in_canonical_form() {
        use crate::models::FlaggedSnippet;
        let mut result = DetectionResult {
            flagged_snippets: vec![FlaggedSnippet {
                id: Uuid::new_v4(),
                start_time: "12:30".into(),
                end_time: "13:10".into(),
                transcription: "claim".into(),
                explanation: None,
                categories: vec![],
                keywords: vec![],
            }],
        };
        normalize_windows(&mut result).unwrap();
        assert_eq!(result.flagged_snippets[0].start_time, "00:12:30");
        assert_eq!(result.flagged_snippets[0].end_time, "00:13:10");

        result.flagged_snippets[0].start_time = "1:2:3:4".into();
        assert!(normalize_windows(&mut result).is_err());
    }

    #[test]
    fn schema_requires_the_time_window() {
        let schema = detection_schema();
        let required = &schema["properties"]["flagged_snippets"]["items"]["required"];
        assert!(required.as_array().unwrap().iter().any(|v| v == "start_time"));
        assert!(required.as_array().unwrap().iter().any(|v| v == "end_time"));
    }
}

//! Analysis stage (stage 3)
//!
//! Claims a snippet and runs the deep analysis call over its clip plus
//! metadata. High-confidence results are routed to the review stage; the
//! rest go straight to `Processed`.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use aircheck_common::config::ModelConfig;
use aircheck_common::{Error, Result};

use crate::escalation::{EscalationPolicy, parse_or_repair};
use crate::inference::{GenerateRequest, InferenceClient};
use crate::models::{AudioFile, ProcessingStatus, Snippet, SnippetAnalysis};
use crate::storage::ObjectStorage;
use crate::store::TaskStore;
use crate::worker::{ItemOutcome, StageWorker};

use super::is_store_failure;

pub struct AnalysisStage {
    store: Arc<dyn TaskStore>,
    storage: Arc<dyn ObjectStorage>,
    inference: Arc<dyn InferenceClient>,
    policy: EscalationPolicy,
    models: ModelConfig,
    review_confidence_threshold: u8,
    skip_review: bool,
}

impl AnalysisStage {
    pub fn new(
        store: Arc<dyn TaskStore>,
        storage: Arc<dyn ObjectStorage>,
        inference: Arc<dyn InferenceClient>,
        policy: EscalationPolicy,
        models: ModelConfig,
        review_confidence_threshold: u8,
        skip_review: bool,
    ) -> Self {
        Self {
            store,
            storage,
            inference,
            policy,
            models,
            review_confidence_threshold,
            skip_review,
        }
    }

    async fn run(&self, snippet: &Snippet) -> Result<()> {
        let file = self
            .store
            .get_audio_file(snippet.audio_file_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("audio file {}", snippet.audio_file_id)))?;

        let local = self.storage.fetch(&snippet.file_path).await?;
        let prompt = analysis_prompt(snippet, &file);
        let schema = analysis_schema();

        let (response, analyzed_by) = self
            .policy
            .run(
                "analysis",
                &self.models.primary,
                &self.models.fallback,
                |model| {
                    let request = GenerateRequest::new(model, prompt.clone())
                        .with_audio(local.clone())
                        .with_schema(schema.clone());
                    async move { self.inference.generate(&request).await }
                },
            )
            .await?;

        let mut analysis: SnippetAnalysis = parse_or_repair(
            self.inference.as_ref(),
            &self.models.repair,
            &schema,
            &response.text,
        )
        .await?;
        analysis.grounding_metadata = response.grounding_metadata;

        let confidence = analysis.confidence_scores.overall;
        let status =
            post_analysis_status(confidence, self.review_confidence_threshold, self.skip_review);
        self.store
            .update_snippet_analysis(snippet.id, &analysis, &analyzed_by, status)
            .await?;

        info!(
            snippet = %snippet.id,
            analyzed_by,
            confidence,
            status = %status,
            "Analysis finished"
        );
        Ok(())
    }
}

/// High-confidence findings get a second opinion before publication;
/// everything else is done.
fn post_analysis_status(confidence: u8, threshold: u8, skip_review: bool) -> ProcessingStatus {
    if !skip_review && confidence >= threshold {
        ProcessingStatus::ReadyForReview
    } else {
        ProcessingStatus::Processed
    }
}

fn analysis_prompt(snippet: &Snippet, file: &AudioFile) -> String {
    let location = match &file.location_city {
        Some(city) => format!("{}, {}", city, file.location_state),
        None => file.location_state.clone(),
    };
    format!(
        "Analyze the attached radio clip. The flagged claim runs from {} to \
         {} within the clip; everything before and after is context. Produce \
         a full transcription and English translation, a title and summary, \
         an explanation of why the claim is or is not misleading, category \
         and keyword labels, the spoken language, per-category and overall \
         confidence scores (0-100), emotional tone labels, political leaning \
         if evident, and the transcript context split into \
         before/main/after.\n\n\
         Station: {} ({})\n\
         Location: {}\n\
         Recorded: {} ({})",
        snippet.start_time,
        snippet.end_time,
        file.station_name,
        file.station_code,
        location,
        snippet.recorded_at.format("%Y-%m-%d %H:%M UTC"),
        snippet.recorded_at.format("%A"),
    )
}

fn analysis_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "transcription": {"type": "string"},
            "translation": {"type": "string"},
            "title": {"type": "string"},
            "summary": {"type": "string"},
            "explanation": {"type": "string"},
            "categories": {"type": "array", "items": {"type": "string"}},
            "keywords": {"type": "array", "items": {"type": "string"}},
            "language": {"type": "string"},
            "confidence_scores": {
                "type": "object",
                "properties": {
                    "overall": {"type": "integer"},
                    "categories": {"type": "object"}
                },
                "required": ["overall"]
            },
            "emotional_tone": {"type": "array", "items": {"type": "string"}},
            "political_leaning": {"type": "string"},
            "context": {
                "type": "object",
                "properties": {
                    "before": {"type": "string"},
                    "main": {"type": "string"},
                    "after": {"type": "string"}
                },
                "required": ["main"]
            }
        },
        "required": [
            "transcription", "translation", "title", "summary", "explanation",
            "language", "confidence_scores", "context"
        ]
    })
}

#[async_trait]
impl StageWorker for AnalysisStage {
    type Item = Snippet;

    fn name(&self) -> &'static str {
        "analysis"
    }

    fn item_id(&self, item: &Snippet) -> Uuid {
        item.id
    }

    async fn claim_next(&self) -> Result<Option<Snippet>> {
        self.store.claim_next_snippet().await
    }

    async fn fetch_targeted(&self, id: Uuid) -> Result<Option<Snippet>> {
        let Some(mut snippet) = self.store.get_snippet(id).await? else {
            return Ok(None);
        };
        self.store
            .set_snippet_status(id, ProcessingStatus::Processing, None)
            .await?;
        snippet.status = ProcessingStatus::Processing;
        Ok(Some(snippet))
    }

    async fn process(&self, item: &Snippet) -> Result<ItemOutcome> {
        match self.run(item).await {
            Ok(()) => Ok(ItemOutcome::Processed),
            Err(err) if is_store_failure(&err) => Err(err),
            Err(err) => {
                warn!(snippet = %item.id, error = %err, "Analysis failed for item");
                self.store
                    .set_snippet_status(item.id, ProcessingStatus::Error, Some(&err.to_string()))
                    .await?;
                Ok(ItemOutcome::Errored)
            }
        }
    }

    async fn recover(&self, item: &Snippet) -> Result<()> {
        let Some(current) = self.store.get_snippet(item.id).await? else {
            return Ok(());
        };
        if current.status == ProcessingStatus::Processing {
            self.store
                .set_snippet_status(item.id, ProcessingStatus::New, None)
                .await?;
            info!(snippet = %item.id, "Rolled claim back to New");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_at_threshold_routes_to_review() {
        assert_eq!(post_analysis_status(95, 95, false), ProcessingStatus::ReadyForReview);
        assert_eq!(post_analysis_status(100, 95, false), ProcessingStatus::ReadyForReview);
        assert_eq!(post_analysis_status(94, 95, false), ProcessingStatus::Processed);
    }

    #[test]
    fn skip_review_always_processes() {
        assert_eq!(post_analysis_status(100, 95, true), ProcessingStatus::Processed);
    }

    #[test]
    fn prompt_names_the_flagged_window() {
        let snippet = Snippet {
            id: Uuid::new_v4(),
            audio_file_id: Uuid::new_v4(),
            stage1_response_id: Uuid::new_v4(),
            file_path: "snippets/a.mp3".into(),
            recorded_at: "2026-08-01T12:00:30Z".parse().unwrap(),
            duration: "00:01:40".into(),
            start_time: "00:00:30".into(),
            end_time: "00:01:10".into(),
            status: ProcessingStatus::Processing,
            error_message: None,
            analysis: None,
            analyzed_by: None,
            reviewed_by: None,
            previous_analysis: None,
        };
        let file = AudioFile {
            id: snippet.audio_file_id,
            file_path: "radio/KXYZ/a.mp3".into(),
            station_code: "KXYZ".into(),
            station_name: "Radio XYZ".into(),
            location_state: "Texas".into(),
            location_city: None,
            recorded_at: snippet.recorded_at,
            status: ProcessingStatus::Processed,
            error_message: None,
        };
        let prompt = analysis_prompt(&snippet, &file);
        assert!(prompt.contains("from 00:00:30 to"));
        assert!(prompt.contains("Radio XYZ"));
    }
}

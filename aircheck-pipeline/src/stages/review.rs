//! Review stage (stage 4)
//!
//! Claims a snippet the analysis stage routed to review and asks the
//! review model for a corrected analysis plus any facts it verified along
//! the way. The original analysis is backed up before the first review so
//! a bad correction never destroys information. Fact submissions flow
//! into the knowledge base, but a rejected fact never fails the snippet.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use aircheck_common::config::ModelConfig;
use aircheck_common::{Error, Result};

use crate::escalation::{EscalationPolicy, parse_or_repair};
use crate::inference::{GenerateRequest, InferenceClient};
use crate::kb::KnowledgeBase;
use crate::models::{ProcessingStatus, ReviewOutcome, Snippet};
use crate::store::TaskStore;
use crate::worker::{ItemOutcome, StageWorker};

use super::is_store_failure;

pub struct ReviewStage {
    store: Arc<dyn TaskStore>,
    inference: Arc<dyn InferenceClient>,
    kb: Arc<KnowledgeBase>,
    policy: EscalationPolicy,
    models: ModelConfig,
}

impl ReviewStage {
    pub fn new(
        store: Arc<dyn TaskStore>,
        inference: Arc<dyn InferenceClient>,
        kb: Arc<KnowledgeBase>,
        policy: EscalationPolicy,
        models: ModelConfig,
    ) -> Self {
        Self {
            store,
            inference,
            kb,
            policy,
            models,
        }
    }

    async fn run(&self, snippet: &Snippet) -> Result<()> {
        let analysis = snippet
            .analysis
            .as_ref()
            .ok_or_else(|| Error::Data(format!("snippet {} has no analysis to review", snippet.id)))?;

        self.store.backup_snippet_analysis(snippet.id).await?;

        let prompt = review_prompt(snippet, analysis)?;
        let schema = review_schema();

        let (response, reviewed_by) = self
            .policy
            .run(
                "review",
                &self.models.review,
                &self.models.fallback,
                |model| {
                    let request =
                        GenerateRequest::new(model, prompt.clone()).with_schema(schema.clone());
                    async move { self.inference.generate(&request).await }
                },
            )
            .await?;

        let mut outcome: ReviewOutcome = parse_or_repair(
            self.inference.as_ref(),
            &self.models.repair,
            &schema,
            &response.text,
        )
        .await?;
        if outcome.analysis.grounding_metadata.is_none() {
            outcome.analysis.grounding_metadata = response.grounding_metadata;
        }

        self.store
            .submit_snippet_review(snippet.id, &outcome.analysis, &reviewed_by)
            .await?;

        let mut facts_stored = 0usize;
        for mut fact in outcome.verified_facts {
            fact.snippet_id = Some(snippet.id);
            match self.kb.upsert_fact(&fact, &reviewed_by).await {
                Ok(_) => facts_stored += 1,
                // A fact the KB refuses (low confidence, no source) is
                // the KB doing its job, not a review failure.
                Err(err) => {
                    warn!(snippet = %snippet.id, error = %err, "Verified fact rejected by knowledge base")
                }
            }
        }

        // The reviewed analysis replaced the embedded one; dropping the
        // embedding row makes the embedding stage pick the snippet up again.
        self.store.delete_snippet_embedding(snippet.id).await?;

        info!(
            snippet = %snippet.id,
            reviewed_by,
            facts_stored,
            "Review finished"
        );
        Ok(())
    }
}

fn review_prompt(snippet: &Snippet, analysis: &crate::models::SnippetAnalysis) -> Result<String> {
    let prior = serde_json::to_string_pretty(analysis)
        .map_err(|e| Error::Data(format!("analysis not serializable: {e}")))?;
    Ok(format!(
        "You are reviewing a high-confidence analysis of a flagged radio \
         claim. Check the analysis against the transcription, correct any \
         field that overstates or misstates what was said, and recalibrate \
         the confidence scores. If you verified any factual finding against \
         a reliable source while reviewing, report it under verified_facts \
         with the source details; otherwise leave verified_facts empty.\n\n\
         Transcription:\n{}\n\n\
         Analysis under review:\n{}\n\n\
         Recorded: {}",
        analysis.transcription,
        prior,
        snippet.recorded_at.format("%Y-%m-%d %H:%M UTC"),
    ))
}

fn review_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "analysis": {
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
                    "transcription", "translation", "title", "summary",
                    "explanation", "language", "confidence_scores", "context"
                ]
            },
            "verified_facts": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "fact": {"type": "string"},
                        "confidence_score": {"type": "integer"},
                        "categories": {"type": "array", "items": {"type": "string"}},
                        "keywords": {"type": "array", "items": {"type": "string"}},
                        "related_claim": {"type": "string"},
                        "is_time_sensitive": {"type": "boolean"},
                        "valid_from": {"type": "string"},
                        "valid_until": {"type": "string"},
                        "source": {
                            "type": "object",
                            "properties": {
                                "url": {"type": "string"},
                                "name": {"type": "string"},
                                "tier": {"type": "string"},
                                "title": {"type": "string"},
                                "excerpt": {"type": "string"}
                            },
                            "required": ["url", "name", "tier"]
                        }
                    },
                    "required": ["fact", "confidence_score", "source"]
                }
            }
        },
        "required": ["analysis"]
    })
}

#[async_trait]
impl StageWorker for ReviewStage {
    type Item = Snippet;

    fn name(&self) -> &'static str {
        "review"
    }

    fn item_id(&self, item: &Snippet) -> Uuid {
        item.id
    }

    async fn claim_next(&self) -> Result<Option<Snippet>> {
        self.store.claim_next_reviewable_snippet().await
    }

    async fn fetch_targeted(&self, id: Uuid) -> Result<Option<Snippet>> {
        let Some(mut snippet) = self.store.get_snippet(id).await? else {
            return Ok(None);
        };
        self.store
            .set_snippet_status(id, ProcessingStatus::Reviewing, None)
            .await?;
        snippet.status = ProcessingStatus::Reviewing;
        Ok(Some(snippet))
    }

    async fn process(&self, item: &Snippet) -> Result<ItemOutcome> {
        match self.run(item).await {
            Ok(()) => Ok(ItemOutcome::Processed),
            Err(err) if is_store_failure(&err) => Err(err),
            Err(err) => {
                warn!(snippet = %item.id, error = %err, "Review failed for item");
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
        // Review claims from Ready for review, so that is where an
        // interrupted claim goes back to.
        if current.status == ProcessingStatus::Reviewing {
            self.store
                .set_snippet_status(item.id, ProcessingStatus::ReadyForReview, None)
                .await?;
            info!(snippet = %item.id, "Rolled claim back to Ready for review");
        }
        Ok(())
    }
}

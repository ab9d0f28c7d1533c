//! Embedding stage (stage 5)
//!
//! Claims a processed snippet that has no embedding row yet, embeds a
//! document built from its analysis, and upserts the row. The snippet's
//! own status never changes here; the absence of the row IS the work
//! queue, and the idempotent upsert is what makes concurrent workers
//! safe (the worst case is the same document embedded twice).

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use aircheck_common::{Error, Result};

use crate::inference::InferenceClient;
use crate::models::{EmbeddingStatus, Snippet, SnippetAnalysis, SnippetEmbedding};
use crate::store::TaskStore;
use crate::worker::{ItemOutcome, StageWorker};

use super::is_store_failure;

pub struct EmbeddingStage {
    store: Arc<dyn TaskStore>,
    inference: Arc<dyn InferenceClient>,
    embedding_model: String,
}

impl EmbeddingStage {
    pub fn new(
        store: Arc<dyn TaskStore>,
        inference: Arc<dyn InferenceClient>,
        embedding_model: String,
    ) -> Self {
        Self {
            store,
            inference,
            embedding_model,
        }
    }

    async fn run(&self, snippet: &Snippet) -> Result<()> {
        let analysis = snippet
            .analysis
            .as_ref()
            .ok_or_else(|| Error::Data(format!("snippet {} has no analysis to embed", snippet.id)))?;

        let document = snippet_document(analysis);
        let embedding = self
            .inference
            .embed(&self.embedding_model, &document)
            .await?;

        self.store
            .upsert_snippet_embedding(&SnippetEmbedding {
                snippet_id: snippet.id,
                document,
                embedding,
                model_name: self.embedding_model.clone(),
                status: EmbeddingStatus::Processed,
                error_message: None,
            })
            .await?;
        info!(snippet = %snippet.id, model = %self.embedding_model, "Embedded snippet");
        Ok(())
    }
}

/// The searchable text for one snippet. Built from the analysis fields a
/// reader would query by.
fn snippet_document(analysis: &SnippetAnalysis) -> String {
    let mut document = format!(
        "{}\n\n{}\n\n{}",
        analysis.title, analysis.summary, analysis.translation
    );
    if !analysis.categories.is_empty() {
        document.push_str(&format!("\n\nCategories: {}", analysis.categories.join(", ")));
    }
    if !analysis.keywords.is_empty() {
        document.push_str(&format!("\nKeywords: {}", analysis.keywords.join(", ")));
    }
    document
}

#[async_trait]
impl StageWorker for EmbeddingStage {
    type Item = Snippet;

    fn name(&self) -> &'static str {
        "embedding"
    }

    fn item_id(&self, item: &Snippet) -> Uuid {
        item.id
    }

    async fn claim_next(&self) -> Result<Option<Snippet>> {
        self.store.claim_next_unembedded_snippet().await
    }

    async fn fetch_targeted(&self, id: Uuid) -> Result<Option<Snippet>> {
        // No claim to write; this stage reserves nothing.
        self.store.get_snippet(id).await
    }

    async fn process(&self, item: &Snippet) -> Result<ItemOutcome> {
        match self.run(item).await {
            Ok(()) => Ok(ItemOutcome::Processed),
            Err(err) if is_store_failure(&err) => Err(err),
            Err(err) => {
                warn!(snippet = %item.id, error = %err, "Embedding failed for item");
                // The failure is recorded in the embedding row itself, so
                // the snippet does not get reclaimed on every poll.
                self.store
                    .upsert_snippet_embedding(&SnippetEmbedding {
                        snippet_id: item.id,
                        document: String::new(),
                        embedding: Vec::new(),
                        model_name: self.embedding_model.clone(),
                        status: EmbeddingStatus::Error,
                        error_message: Some(err.to_string()),
                    })
                    .await?;
                Ok(ItemOutcome::Errored)
            }
        }
    }

    async fn recover(&self, _item: &Snippet) -> Result<()> {
        // Nothing was reserved, so there is nothing to roll back.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ConfidenceScores;

    #[test]
    fn document_includes_labels_only_when_present() {
        let mut analysis = SnippetAnalysis {
            transcription: "t".into(),
            translation: "English translation".into(),
            title: "Title".into(),
            summary: "Summary".into(),
            explanation: "e".into(),
            categories: vec![],
            keywords: vec![],
            language: "es".into(),
            confidence_scores: ConfidenceScores::default(),
            emotional_tone: vec![],
            political_leaning: None,
            context: Default::default(),
            grounding_metadata: None,
        };
        let document = snippet_document(&analysis);
        assert!(document.starts_with("Title\n\nSummary\n\nEnglish translation"));
        assert!(!document.contains("Categories:"));

        analysis.categories = vec!["health".into()];
        analysis.keywords = vec!["vaccine".into()];
        let document = snippet_document(&analysis);
        assert!(document.contains("Categories: health"));
        assert!(document.contains("Keywords: vaccine"));
    }
}

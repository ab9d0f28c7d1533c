//! Knowledge-base dedup/versioning engine
//!
//! Facts verified during review accumulate here. The engine never stores
//! the same fact twice: a new submission whose embedding is close enough
//! to an active entry supersedes that entry instead, forming a version
//! chain. Retraction is terminal and leaves no chain entry.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use aircheck_common::{Error, Result};

use crate::inference::InferenceClient;
use crate::models::{FactSubmission, KbEntry, KbMatch, KbStatus, KbUsage};
use crate::store::KbStore;

/// What `upsert_fact` did with a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No duplicate found; a version-1 entry was created.
    Created(Uuid),
    /// A near-duplicate active entry was superseded by a new version.
    Updated { new: Uuid, superseded: Uuid },
}

pub struct KnowledgeBase {
    store: Arc<dyn KbStore>,
    inference: Arc<dyn InferenceClient>,
    embedding_model: String,
    min_confidence: u8,
    duplicate_threshold: f32,
    retrieval_threshold: f32,
}

impl KnowledgeBase {
    pub fn new(
        store: Arc<dyn KbStore>,
        inference: Arc<dyn InferenceClient>,
        embedding_model: String,
        min_confidence: u8,
        duplicate_threshold: f32,
        retrieval_threshold: f32,
    ) -> Self {
        Self {
            store,
            inference,
            embedding_model,
            min_confidence,
            duplicate_threshold,
            retrieval_threshold,
        }
    }

    /// Insert a verified fact, superseding an existing near-duplicate if
    /// one is active.
    pub async fn upsert_fact(
        &self,
        submission: &FactSubmission,
        created_by_model: &str,
    ) -> Result<UpsertOutcome> {
        validate_submission(submission, self.min_confidence)?;

        let document = canonical_document(submission);
        let embedding = self
            .inference
            .embed(&self.embedding_model, &document)
            .await?;

        // Only the single closest active entry matters; anything below
        // the duplicate threshold is a different fact.
        let duplicates = self
            .store
            .search_active(&embedding, self.duplicate_threshold, 1, None, None)
            .await?;

        match duplicates.into_iter().next() {
            None => {
                let entry = new_entry(submission, created_by_model, 1, None);
                self.store
                    .insert_entry(
                        &entry,
                        std::slice::from_ref(&submission.source),
                        &document,
                        &embedding,
                        &self.embedding_model,
                    )
                    .await?;
                if let Some(snippet_id) = submission.snippet_id {
                    self.store
                        .record_usage(entry.id, snippet_id, KbUsage::TriggeredCreation)
                        .await?;
                }
                info!(entry = %entry.id, "Created knowledge-base fact");
                Ok(UpsertOutcome::Created(entry.id))
            }
            Some(duplicate) => {
                let old = duplicate.entry;
                let entry = new_entry(
                    submission,
                    created_by_model,
                    old.version + 1,
                    Some(old.id),
                );

                // The old entry's sources carry forward; evidence is not
                // lost when a fact is refreshed.
                let mut sources = vec![submission.source.clone()];
                for source in self.store.entry_sources(old.id).await? {
                    if !sources.iter().any(|s| s.url == source.url) {
                        sources.push(source);
                    }
                }

                self.store
                    .insert_entry(&entry, &sources, &document, &embedding, &self.embedding_model)
                    .await?;
                self.store.mark_superseded(old.id, entry.id).await?;
                if let Some(snippet_id) = submission.snippet_id {
                    self.store
                        .record_usage(entry.id, snippet_id, KbUsage::TriggeredUpdate)
                        .await?;
                }
                info!(
                    entry = %entry.id,
                    superseded = %old.id,
                    version = entry.version,
                    similarity = duplicate.similarity,
                    "Superseded knowledge-base fact"
                );
                Ok(UpsertOutcome::Updated {
                    new: entry.id,
                    superseded: old.id,
                })
            }
        }
    }

    /// Retract a fact. Terminal: no new version, no chain entry, and the
    /// embedding leaves the searchable set.
    pub async fn deactivate_fact(&self, id: Uuid, reason: &str) -> Result<()> {
        if !self.store.deactivate_entry(id, reason).await? {
            return Err(Error::NotFound(format!("knowledge-base entry {id}")));
        }
        warn!(entry = %id, reason, "Deactivated knowledge-base fact");
        Ok(())
    }

    /// Similarity search over active facts. Pure read.
    pub async fn search_facts(
        &self,
        query: &str,
        categories: Option<&[String]>,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Vec<KbMatch>> {
        let embedding = self.inference.embed(&self.embedding_model, query).await?;
        self.store
            .search_active(&embedding, self.retrieval_threshold, 20, categories, as_of)
            .await
    }
}

fn validate_submission(submission: &FactSubmission, min_confidence: u8) -> Result<()> {
    if submission.confidence_score < min_confidence {
        return Err(Error::Data(format!(
            "fact confidence {} below minimum {}",
            submission.confidence_score, min_confidence
        )));
    }
    if submission.fact.trim().is_empty() {
        return Err(Error::Data("fact text is empty".to_string()));
    }
    if submission.source.url.trim().is_empty() || submission.source.name.trim().is_empty() {
        return Err(Error::Data(
            "fact source must name a url and a publisher".to_string(),
        ));
    }
    Ok(())
}

/// The canonical text that gets embedded for a fact. Dedup only works if
/// every submission renders the same way.
pub fn canonical_document(submission: &FactSubmission) -> String {
    let mut document = format!("Fact: {}", submission.fact.trim());
    if let Some(claim) = submission
        .related_claim
        .as_deref()
        .filter(|c| !c.trim().is_empty())
    {
        document.push_str(&format!("\nRelated claim: {}", claim.trim()));
    }
    if !submission.categories.is_empty() {
        document.push_str(&format!("\nCategories: {}", submission.categories.join(", ")));
    }
    document
}

fn new_entry(
    submission: &FactSubmission,
    created_by_model: &str,
    version: u32,
    previous_version: Option<Uuid>,
) -> KbEntry {
    KbEntry {
        id: Uuid::new_v4(),
        fact: submission.fact.trim().to_string(),
        confidence_score: submission.confidence_score,
        categories: submission.categories.clone(),
        keywords: submission.keywords.clone(),
        related_claim: submission.related_claim.clone(),
        is_time_sensitive: submission.is_time_sensitive,
        valid_from: submission.valid_from,
        valid_until: submission.valid_until,
        status: KbStatus::Active,
        deactivation_reason: None,
        version,
        previous_version,
        superseded_by: None,
        created_by_snippet: submission.snippet_id,
        created_by_model: created_by_model.to_string(),
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FactSource, SourceTier};

    fn submission(fact: &str, confidence: u8) -> FactSubmission {
        FactSubmission {
            fact: fact.into(),
            confidence_score: confidence,
            categories: vec![],
            keywords: vec![],
            related_claim: None,
            is_time_sensitive: false,
            valid_from: None,
            valid_until: None,
            source: FactSource {
                url: "https://example.org/report".into(),
                name: "Example Wire".into(),
                tier: SourceTier::Tier1WireService,
                title: None,
                excerpt: None,
            },
            snippet_id: None,
        }
    }

    #[test]
    fn low_confidence_is_rejected() {
        let err = validate_submission(&submission("f", 69), 70).unwrap_err();
        assert!(matches!(err, Error::Data(_)));
        assert!(validate_submission(&submission("f", 70), 70).is_ok());
    }

    #[test]
    fn unsourced_facts_are_rejected() {
        let mut sub = submission("f", 90);
        sub.source.url = "  ".into();
        assert!(validate_submission(&sub, 70).is_err());
    }

    #[test]
    fn canonical_document_is_stable() {
        let mut sub = submission("  The bridge reopened in July.  ", 90);
        assert_eq!(
            canonical_document(&sub),
            "Fact: The bridge reopened in July."
        );

        sub.related_claim = Some("The bridge is still closed".into());
        sub.categories = vec!["infrastructure".into(), "local".into()];
        assert_eq!(
            canonical_document(&sub),
            "Fact: The bridge reopened in July.\n\
             Related claim: The bridge is still closed\n\
             Categories: infrastructure, local"
        );
    }

    #[test]
    fn new_versions_link_their_predecessor() {
        let old_id = Uuid::new_v4();
        let entry = new_entry(&submission("f", 90), "model", 3, Some(old_id));
        assert_eq!(entry.version, 3);
        assert_eq!(entry.previous_version, Some(old_id));
        assert_eq!(entry.status, KbStatus::Active);
        assert!(entry.superseded_by.is_none());
    }
}

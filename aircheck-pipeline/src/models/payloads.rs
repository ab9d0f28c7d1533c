//! Typed stage-boundary payloads
//!
//! Each stage hands the next one a typed value, validated once at the
//! model-response boundary, instead of loosely checked JSON maps. The
//! payloads are persisted as JSON columns, so everything here derives
//! Serialize/Deserialize.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Output of the detection stage: which regions of the recording were
/// flagged for closer analysis.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectionResult {
    pub flagged_snippets: Vec<FlaggedSnippet>,
}

/// One flagged region of a recording.
///
/// `id` is assigned by the detection worker (not the store) before the
/// result is persisted, so that clip extraction can re-run after a partial
/// failure without producing duplicate snippet rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlaggedSnippet {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub start_time: String,
    pub end_time: String,
    pub transcription: String,
    #[serde(default)]
    pub explanation: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// Per-category and overall confidence, 0-100.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfidenceScores {
    pub overall: u8,
    #[serde(default)]
    pub categories: BTreeMap<String, u8>,
}

/// Transcript context around the flagged claim.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClipContext {
    #[serde(default)]
    pub before: String,
    pub main: String,
    #[serde(default)]
    pub after: String,
}

/// Full analysis of one snippet, produced by the analysis stage and
/// replaced (after backup) by the review stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnippetAnalysis {
    pub transcription: String,
    pub translation: String,
    pub title: String,
    pub summary: String,
    pub explanation: String,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub language: String,
    pub confidence_scores: ConfidenceScores,
    #[serde(default)]
    pub emotional_tone: Vec<String>,
    #[serde(default)]
    pub political_leaning: Option<String>,
    pub context: ClipContext,
    #[serde(default)]
    pub grounding_metadata: Option<String>,
}

/// Source tier for a knowledge-base fact. The knowledge base refuses
/// unsourced claims, so every fact submission names one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTier {
    Tier1WireService,
    Tier1Factchecker,
    Tier2MajorNews,
    Tier3RegionalNews,
    OfficialSource,
    Other,
}

impl SourceTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tier1WireService => "tier1_wire_service",
            Self::Tier1Factchecker => "tier1_factchecker",
            Self::Tier2MajorNews => "tier2_major_news",
            Self::Tier3RegionalNews => "tier3_regional_news",
            Self::OfficialSource => "official_source",
            Self::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tier1_wire_service" => Some(Self::Tier1WireService),
            "tier1_factchecker" => Some(Self::Tier1Factchecker),
            "tier2_major_news" => Some(Self::Tier2MajorNews),
            "tier3_regional_news" => Some(Self::Tier3RegionalNews),
            "official_source" => Some(Self::OfficialSource),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

/// External evidence backing a knowledge-base fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactSource {
    pub url: String,
    pub name: String,
    pub tier: SourceTier,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub excerpt: Option<String>,
}

/// A verified fact the review stage wants stored in the knowledge base.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactSubmission {
    pub fact: String,
    pub confidence_score: u8,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub related_claim: Option<String>,
    #[serde(default)]
    pub is_time_sensitive: bool,
    #[serde(default)]
    pub valid_from: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub valid_until: Option<chrono::DateTime<chrono::Utc>>,
    pub source: FactSource,
    #[serde(default)]
    pub snippet_id: Option<Uuid>,
}

/// Output of the review stage: the corrected analysis plus any facts the
/// reviewer verified along the way.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewOutcome {
    pub analysis: SnippetAnalysis,
    #[serde(default)]
    pub verified_facts: Vec<FactSubmission>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_result_parses_without_ids() {
        // The model response has no ids; serde fills them in.
        let json = r#"{
            "flagged_snippets": [
                {"start_time": "12:30", "end_time": "13:10", "transcription": "..."}
            ]
        }"#;
        let result: DetectionResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.flagged_snippets.len(), 1);
        assert!(!result.flagged_snippets[0].id.is_nil());
    }

    #[test]
    fn assigned_ids_survive_round_trip() {
        let snippet = FlaggedSnippet {
            id: Uuid::new_v4(),
            start_time: "00:12:30".into(),
            end_time: "00:13:10".into(),
            transcription: "claim".into(),
            explanation: None,
            categories: vec![],
            keywords: vec![],
        };
        let json = serde_json::to_string(&DetectionResult {
            flagged_snippets: vec![snippet.clone()],
        })
        .unwrap();
        let parsed: DetectionResult = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.flagged_snippets[0].id, snippet.id);
    }

    #[test]
    fn source_tier_round_trip() {
        for tier in [
            SourceTier::Tier1WireService,
            SourceTier::Tier1Factchecker,
            SourceTier::Tier2MajorNews,
            SourceTier::Tier3RegionalNews,
            SourceTier::OfficialSource,
            SourceTier::Other,
        ] {
            assert_eq!(SourceTier::parse(tier.as_str()), Some(tier));
        }
    }

    #[test]
    fn review_outcome_tolerates_missing_facts() {
        let json = r#"{
            "analysis": {
                "transcription": "t", "translation": "t", "title": "t",
                "summary": "s", "explanation": "e", "language": "es",
                "confidence_scores": {"overall": 90},
                "context": {"main": "m"}
            }
        }"#;
        let outcome: ReviewOutcome = serde_json::from_str(json).unwrap();
        assert!(outcome.verified_facts.is_empty());
        assert_eq!(outcome.analysis.confidence_scores.overall, 90);
    }
}

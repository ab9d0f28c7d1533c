//! Status enums and the legal-transition table
//!
//! Every work item (audio file, stage-1 response, snippet) carries a
//! `ProcessingStatus` column. Workers only ever write statuses that are
//! reachable from the status they claimed, which is what keeps concurrent
//! stage processes from trampling each other's results.

use serde::{Deserialize, Serialize};

/// Processing status of a pipeline work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingStatus {
    New,
    Processing,
    Processed,
    Error,
    /// Snippet-only: analysis finished with high confidence, awaiting review
    ReadyForReview,
    /// Snippet-only: claimed by a review worker
    Reviewing,
}

impl ProcessingStatus {
    /// Database/string representation (matches the stored column values).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "New",
            Self::Processing => "Processing",
            Self::Processed => "Processed",
            Self::Error => "Error",
            Self::ReadyForReview => "Ready for review",
            Self::Reviewing => "Reviewing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "New" => Some(Self::New),
            "Processing" => Some(Self::Processing),
            "Processed" => Some(Self::Processed),
            "Error" => Some(Self::Error),
            "Ready for review" => Some(Self::ReadyForReview),
            "Reviewing" => Some(Self::Reviewing),
            _ => None,
        }
    }

    /// True for the states that mean "a worker currently owns this row".
    pub fn is_in_progress(self) -> bool {
        matches!(self, Self::Processing | Self::Reviewing)
    }

    /// The state a row is claimed from to reach this in-progress state.
    ///
    /// Used by the recovery hook: an abnormally terminated worker rolls its
    /// item back from the in-progress state to this pre-claim state.
    pub fn pre_claim(self) -> Option<Self> {
        match self {
            Self::Processing => Some(Self::New),
            Self::Reviewing => Some(Self::ReadyForReview),
            _ => None,
        }
    }

    /// Legal transition check.
    ///
    /// Undo operations (Processed/Error back to New) are included; they are
    /// operator-invoked but still follow the table.
    pub fn may_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::New, Self::Processing)
                | (Self::Processing, Self::Processed)
                | (Self::Processing, Self::Error)
                | (Self::Processing, Self::New)
                | (Self::Processing, Self::ReadyForReview)
                | (Self::ReadyForReview, Self::Reviewing)
                | (Self::Reviewing, Self::Processed)
                | (Self::Reviewing, Self::Error)
                | (Self::Reviewing, Self::ReadyForReview)
                | (Self::Processed, Self::New)
                | (Self::Error, Self::New)
        )
    }
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of a snippet embedding row. Absence of the row is what makes a
/// processed snippet claimable by the embedding stage, so the row itself
/// only distinguishes success from failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmbeddingStatus {
    Processed,
    Error,
}

impl EmbeddingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Processed => "Processed",
            Self::Error => "Error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Processed" => Some(Self::Processed),
            "Error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Lifecycle status of a knowledge-base entry.
///
/// `Superseded` and `Deactivated` are both terminal and both remove the
/// entry's embedding from the searchable set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KbStatus {
    Active,
    Superseded,
    Deactivated,
}

impl KbStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Superseded => "superseded",
            Self::Deactivated => "deactivated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "superseded" => Some(Self::Superseded),
            "deactivated" => Some(Self::Deactivated),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_string_round_trip() {
        for status in [
            ProcessingStatus::New,
            ProcessingStatus::Processing,
            ProcessingStatus::Processed,
            ProcessingStatus::Error,
            ProcessingStatus::ReadyForReview,
            ProcessingStatus::Reviewing,
        ] {
            assert_eq!(ProcessingStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ProcessingStatus::parse("Bogus"), None);
    }

    #[test]
    fn claim_edges_are_legal() {
        assert!(ProcessingStatus::New.may_transition_to(ProcessingStatus::Processing));
        assert!(ProcessingStatus::ReadyForReview.may_transition_to(ProcessingStatus::Reviewing));
    }

    #[test]
    fn terminal_results_cannot_be_claimed() {
        assert!(!ProcessingStatus::Processed.may_transition_to(ProcessingStatus::Processing));
        assert!(!ProcessingStatus::Error.may_transition_to(ProcessingStatus::Processing));
        assert!(!ProcessingStatus::Processed.may_transition_to(ProcessingStatus::Error));
    }

    #[test]
    fn undo_edges_reach_new() {
        assert!(ProcessingStatus::Processed.may_transition_to(ProcessingStatus::New));
        assert!(ProcessingStatus::Error.may_transition_to(ProcessingStatus::New));
    }

    #[test]
    fn pre_claim_inverts_the_claim() {
        assert_eq!(
            ProcessingStatus::Processing.pre_claim(),
            Some(ProcessingStatus::New)
        );
        assert_eq!(
            ProcessingStatus::Reviewing.pre_claim(),
            Some(ProcessingStatus::ReadyForReview)
        );
        assert_eq!(ProcessingStatus::Processed.pre_claim(), None);
    }

    #[test]
    fn in_progress_states() {
        assert!(ProcessingStatus::Processing.is_in_progress());
        assert!(ProcessingStatus::Reviewing.is_in_progress());
        assert!(!ProcessingStatus::New.is_in_progress());
        assert!(!ProcessingStatus::ReadyForReview.is_in_progress());
    }

    #[test]
    fn kb_status_round_trip() {
        for status in [KbStatus::Active, KbStatus::Superseded, KbStatus::Deactivated] {
            assert_eq!(KbStatus::parse(status.as_str()), Some(status));
        }
    }
}

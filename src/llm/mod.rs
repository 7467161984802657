//! The LLM collaborator seam.
//!
//! Thread summarization may be refined by an external model, but the
//! engine is fully functional without one: the deterministic digest from
//! `mailbox::summary` is always produced first, and a summarizer may only
//! replace the key-point/action-item lists. Model selection and prompting
//! live entirely behind this trait.

use async_trait::async_trait;

use crate::model::{Message, ThreadSummary};

/// Replacement lists produced by a summarizer.
#[derive(Debug, Clone, Default)]
pub struct SummaryRefinement {
    pub key_points: Vec<String>,
    pub action_items: Vec<String>,
}

#[async_trait]
pub trait ThreadSummarizer: Send + Sync {
    /// Refine a digest given the thread snapshot. Returning `None` keeps
    /// the deterministic output; errors are treated the same way.
    async fn refine(&self, messages: &[Message], digest: &ThreadSummary)
        -> Option<SummaryRefinement>;
}

/// The always-available collaborator: keeps the deterministic digest.
#[derive(Debug, Default)]
pub struct HeuristicSummarizer;

#[async_trait]
impl ThreadSummarizer for HeuristicSummarizer {
    async fn refine(
        &self,
        _messages: &[Message],
        _digest: &ThreadSummary,
    ) -> Option<SummaryRefinement> {
        None
    }
}

/// Merge a refinement into a digest, keeping deterministic fields.
pub fn apply_refinement(mut digest: ThreadSummary, refinement: SummaryRefinement) -> ThreadSummary {
    if !refinement.key_points.is_empty() {
        digest.key_points = refinement.key_points;
    }
    if !refinement.action_items.is_empty() {
        digest.action_items = refinement.action_items;
    }
    digest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn heuristic_summarizer_keeps_digest() {
        let digest = ThreadSummary {
            thread_id: "t".into(),
            participants: vec!["Alpha".into()],
            total_messages: 1,
            first_ts: None,
            last_ts: None,
            key_points: vec!["original".into()],
            action_items: vec![],
            examples: vec![],
        };
        let refined = HeuristicSummarizer.refine(&[], &digest).await;
        assert!(refined.is_none());
    }

    #[test]
    fn refinement_replaces_only_nonempty_lists() {
        let digest = ThreadSummary {
            thread_id: "t".into(),
            participants: vec!["Alpha".into()],
            total_messages: 1,
            first_ts: None,
            last_ts: None,
            key_points: vec!["original".into()],
            action_items: vec!["keep me".into()],
            examples: vec![],
        };
        let merged = apply_refinement(
            digest,
            SummaryRefinement {
                key_points: vec!["better".into()],
                action_items: vec![],
            },
        );
        assert_eq!(merged.key_points, vec!["better"]);
        assert_eq!(merged.action_items, vec!["keep me"]);
        assert_eq!(merged.total_messages, 1);
    }
}

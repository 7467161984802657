//! Deterministic thread digests.
//!
//! The engine can always produce participants, counts, and
//! heading-extracted key points without any external service; an LLM
//! collaborator may refine the digest but is never required.

use crate::model::{Message, ThreadSummary};

const MAX_POINTS: usize = 10;
const ACTION_KEYWORDS: [&str; 5] = ["TODO", "ACTION", "FIXME", "NEXT", "BLOCKED"];

/// Compute the deterministic digest of a thread, oldest-first input.
pub fn digest(thread_id: &str, messages: &[Message]) -> ThreadSummary {
    let mut participants: Vec<String> = Vec::new();
    let mut key_points = Vec::new();
    let mut action_items = Vec::new();

    for message in messages {
        if !participants
            .iter()
            .any(|p| p.eq_ignore_ascii_case(&message.from_agent))
        {
            participants.push(message.from_agent.clone());
        }
        for line in message.body_md.lines() {
            let stripped = line.trim();
            if stripped.is_empty() {
                continue;
            }
            if is_checkbox(stripped) {
                if action_items.len() < MAX_POINTS {
                    action_items.push(stripped.to_string());
                }
                continue;
            }
            if is_bullet(stripped) {
                if key_points.len() < MAX_POINTS {
                    key_points.push(
                        stripped
                            .trim_start_matches(['-', '*', '+', ' '])
                            .to_string(),
                    );
                }
            }
            let upper = stripped.to_uppercase();
            if ACTION_KEYWORDS.iter().any(|kw| upper.contains(kw))
                && action_items.len() < MAX_POINTS
            {
                action_items.push(stripped.to_string());
            }
        }
    }
    participants.sort();

    ThreadSummary {
        thread_id: thread_id.to_string(),
        participants,
        total_messages: messages.len(),
        first_ts: messages.first().map(|m| m.created_ts),
        last_ts: messages.last().map(|m| m.created_ts),
        key_points,
        action_items,
        examples: Vec::new(),
    }
}

fn is_bullet(line: &str) -> bool {
    line.starts_with("- ") || line.starts_with("* ") || line.starts_with("+ ")
}

fn is_checkbox(line: &str) -> bool {
    ["- [ ]", "- [x]", "- [X]", "* [ ]", "* [x]", "* [X]"]
        .iter()
        .any(|prefix| line.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Importance, MessageKind};
    use chrono::Utc;

    fn message(from: &str, body: &str) -> Message {
        Message {
            id: "msg_x".into(),
            project_id: 1,
            thread_id: "t".into(),
            subject: "s".into(),
            body_md: body.into(),
            from_agent: from.into(),
            created_ts: Utc::now(),
            importance: Importance::Normal,
            ack_required: false,
            kind: MessageKind::Normal,
            overseer: false,
        }
    }

    #[test]
    fn digest_extracts_points_and_actions() {
        let messages = vec![
            message("Alpha", "Plan:\n- build the index\n- wire the server"),
            message("Beta", "- [ ] write tests\nTODO: review locking"),
        ];
        let summary = digest("t", &messages);
        assert_eq!(summary.participants, vec!["Alpha", "Beta"]);
        assert_eq!(summary.total_messages, 2);
        assert_eq!(summary.key_points.len(), 2);
        assert_eq!(summary.key_points[0], "build the index");
        assert_eq!(summary.action_items.len(), 2);
        assert!(summary.action_items.iter().any(|a| a.contains("TODO")));
    }

    #[test]
    fn digest_of_empty_thread() {
        let summary = digest("t", &[]);
        assert_eq!(summary.total_messages, 0);
        assert!(summary.first_ts.is_none());
        assert!(summary.participants.is_empty());
    }

    #[test]
    fn participants_deduplicate_case_insensitively() {
        let messages = vec![message("Alpha", "hi"), message("alpha", "again")];
        let summary = digest("t", &messages);
        assert_eq!(summary.participants.len(), 1);
    }
}

//! Mailbox helpers shared by the engine: message ids, subjects, views, and
//! the deterministic thread digest.

pub mod summary;

use chrono::{DateTime, Datelike, Utc};
use uuid::Uuid;

use crate::model::{Message, MessageSummary, Recipient};

/// Time-prefixed opaque message id: `msg_YYYYMMDD_<8 hex>`.
pub fn message_id(created_ts: DateTime<Utc>) -> String {
    format!(
        "msg_{:04}{:02}{:02}_{}",
        created_ts.year(),
        created_ts.month(),
        created_ts.day(),
        &Uuid::new_v4().simple().to_string()[..8]
    )
}

/// Claim ids share the shape of message ids with their own prefix.
pub fn claim_id(created_ts: DateTime<Utc>) -> String {
    format!(
        "clm_{:04}{:02}{:02}_{}",
        created_ts.year(),
        created_ts.month(),
        created_ts.day(),
        &Uuid::new_v4().simple().to_string()[..8]
    )
}

/// Prefix a reply subject with `Re: ` unless one is already there.
pub fn reply_subject(original: &str) -> String {
    if original.trim_start().to_lowercase().starts_with("re:") {
        original.to_string()
    } else {
        format!("Re: {original}")
    }
}

pub fn summarize_message(
    message: &Message,
    recipient: Option<&Recipient>,
    include_body: bool,
) -> MessageSummary {
    MessageSummary {
        id: message.id.clone(),
        thread_id: message.thread_id.clone(),
        subject: message.subject.clone(),
        from: message.from_agent.clone(),
        created_ts: message.created_ts,
        importance: message.importance,
        ack_required: message.ack_required,
        kind: message.kind,
        overseer: message.overseer,
        recipient_kind: recipient.map(|r| r.kind),
        read_ts: recipient.and_then(|r| r.read_ts),
        ack_ts: recipient.and_then(|r| r.ack_ts),
        body_md: include_body.then(|| message.body_md.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_ids_are_date_prefixed_and_unique() {
        let now = Utc::now();
        let a = message_id(now);
        let b = message_id(now);
        assert!(a.starts_with("msg_"));
        assert_eq!(a.len(), "msg_".len() + 8 + 1 + 8);
        assert_ne!(a, b);
    }

    #[test]
    fn reply_subject_prefixes_once() {
        assert_eq!(reply_subject("Hi"), "Re: Hi");
        assert_eq!(reply_subject("Re: Hi"), "Re: Hi");
        assert_eq!(reply_subject("re: hi"), "re: hi");
        assert_eq!(reply_subject("RE: shouting"), "RE: shouting");
    }
}

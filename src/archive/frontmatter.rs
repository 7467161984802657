//! Frontmatter-delimited markdown message files.
//!
//! A message file is a `---json` block holding the fields mirrored by the
//! Index, followed by a blank line and the GFM body. The frontmatter is the
//! canonical record: rebuilding the Index reads nothing else.

use serde::{Deserialize, Serialize};

use crate::error::{MailroomError, Result};
use crate::model::{parse_ts, ts, Importance, Message, MessageKind, Recipient, RecipientKind};

const OPEN_MARKER: &str = "---json";
const CLOSE_MARKER: &str = "---";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frontmatter {
    pub id: String,
    pub thread_id: String,
    pub project: String,
    pub from: String,
    pub to: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bcc: Vec<String>,
    pub created: String,
    pub importance: Importance,
    pub ack_required: bool,
    pub subject: String,
    #[serde(default, skip_serializing_if = "is_default_kind")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub overseer: bool,
}

fn is_default_kind(kind: &MessageKind) -> bool {
    *kind == MessageKind::Normal
}

impl Frontmatter {
    pub fn from_message(message: &Message, slug: &str, recipients: &[Recipient]) -> Self {
        let names = |kind: RecipientKind| {
            recipients
                .iter()
                .filter(|r| r.kind == kind)
                .map(|r| r.agent_name.clone())
                .collect::<Vec<_>>()
        };
        Self {
            id: message.id.clone(),
            thread_id: message.thread_id.clone(),
            project: slug.to_string(),
            from: message.from_agent.clone(),
            to: names(RecipientKind::To),
            cc: names(RecipientKind::Cc),
            bcc: names(RecipientKind::Bcc),
            created: ts(message.created_ts),
            importance: message.importance,
            ack_required: message.ack_required,
            subject: message.subject.clone(),
            kind: message.kind,
            overseer: message.overseer,
        }
    }

    /// Reconstruct the Index rows this file mirrors.
    pub fn into_records(self, project_id: i64, body_md: String) -> Result<(Message, Vec<Recipient>)> {
        let created_ts = parse_ts(&self.created).ok_or_else(|| {
            MailroomError::IndexArchiveMismatch(format!(
                "message '{}' has unparseable created timestamp '{}'",
                self.id, self.created
            ))
        })?;
        let message = Message {
            id: self.id.clone(),
            project_id,
            thread_id: self.thread_id,
            subject: self.subject,
            body_md,
            from_agent: self.from,
            created_ts,
            importance: self.importance,
            ack_required: self.ack_required,
            kind: self.kind,
            overseer: self.overseer,
        };
        let mut recipients = Vec::new();
        for (names, kind) in [
            (&self.to, RecipientKind::To),
            (&self.cc, RecipientKind::Cc),
            (&self.bcc, RecipientKind::Bcc),
        ] {
            for name in names {
                recipients.push(Recipient {
                    message_id: self.id.clone(),
                    agent_name: name.clone(),
                    kind,
                    read_ts: None,
                    ack_ts: None,
                });
            }
        }
        Ok((message, recipients))
    }
}

pub fn render(front: &Frontmatter, body_md: &str) -> Result<String> {
    let json = serde_json::to_string_pretty(front)?;
    Ok(format!(
        "{OPEN_MARKER}\n{json}\n{CLOSE_MARKER}\n\n{}\n",
        body_md.trim_end()
    ))
}

pub fn parse(content: &str) -> Result<(Frontmatter, String)> {
    let rest = content.strip_prefix(OPEN_MARKER).ok_or_else(|| {
        MailroomError::IndexArchiveMismatch("message file missing ---json frontmatter".into())
    })?;
    let close = rest.find("\n---\n").ok_or_else(|| {
        MailroomError::IndexArchiveMismatch("message frontmatter is unterminated".into())
    })?;
    let front: Frontmatter = serde_json::from_str(&rest[..close])?;
    let body = rest[close + "\n---\n".len()..]
        .trim_start_matches('\n')
        .trim_end()
        .to_string();
    Ok((front, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample() -> Frontmatter {
        Frontmatter {
            id: "msg_20260101_abcd1234".into(),
            thread_id: "msg_20260101_abcd1234".into(),
            project: "demo-0123456789".into(),
            from: "Alpha".into(),
            to: vec!["Beta".into()],
            cc: vec![],
            bcc: vec![],
            created: ts(Utc::now()),
            importance: Importance::High,
            ack_required: true,
            subject: "Plan".into(),
            kind: MessageKind::Normal,
            overseer: false,
        }
    }

    #[test]
    fn render_parse_roundtrip() {
        let front = sample();
        let body = "# Heading\n\n- bullet one\n- bullet two";
        let rendered = render(&front, body).unwrap();
        assert!(rendered.starts_with("---json\n"));
        let (parsed, parsed_body) = parse(&rendered).unwrap();
        assert_eq!(parsed.id, front.id);
        assert_eq!(parsed.to, front.to);
        assert_eq!(parsed.importance, Importance::High);
        assert_eq!(parsed_body, body);
    }

    #[test]
    fn body_with_dashes_survives() {
        let front = sample();
        let body = "before\n\n---\n\nafter the rule";
        let rendered = render(&front, body).unwrap();
        let (_, parsed_body) = parse(&rendered).unwrap();
        assert_eq!(parsed_body, body);
    }

    #[test]
    fn records_roundtrip() {
        let front = sample();
        let (message, recipients) = front.clone().into_records(7, "body".into()).unwrap();
        assert_eq!(message.project_id, 7);
        assert_eq!(recipients.len(), 1);
        assert_eq!(recipients[0].agent_name, "Beta");
        assert_eq!(recipients[0].kind, RecipientKind::To);
        let back = Frontmatter::from_message(&message, "demo-0123456789", &recipients);
        assert_eq!(back.id, front.id);
        assert_eq!(back.to, front.to);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse("no frontmatter here").is_err());
        assert!(parse("---json\n{\"id\": \"x\"").is_err());
    }
}

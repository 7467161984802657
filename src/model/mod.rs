//! Domain types shared across the archive, index, and engine layers.
//!
//! Timestamps are `chrono::DateTime<Utc>` serialized as fixed-width RFC 3339
//! with microsecond precision so the stored text orders lexicographically.

use chrono::{DateTime, SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Render a timestamp in the canonical storage form.
pub fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a timestamp in any RFC 3339 form back to UTC.
pub fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Importance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            "urgent" => Some(Self::Urgent),
            _ => None,
        }
    }

    pub fn is_urgent_class(&self) -> bool {
        matches!(self, Self::High | Self::Urgent)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ContactPolicy {
    Open,
    #[default]
    Auto,
    ContactsOnly,
    BlockAll,
}

impl ContactPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Auto => "auto",
            Self::ContactsOnly => "contacts_only",
            Self::BlockAll => "block_all",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "auto" => Some(Self::Auto),
            "contacts_only" => Some(Self::ContactsOnly),
            "block_all" => Some(Self::BlockAll),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RecipientKind {
    #[default]
    To,
    Cc,
    Bcc,
}

impl RecipientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::To => "to",
            Self::Cc => "cc",
            Self::Bcc => "bcc",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "to" => Some(Self::To),
            "cc" => Some(Self::Cc),
            "bcc" => Some(Self::Bcc),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    #[default]
    Pending,
    Accepted,
    Blocked,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Blocked => "blocked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "accepted" => Some(Self::Accepted),
            "blocked" => Some(Self::Blocked),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ContactState {
    #[default]
    Pending,
    Accepted,
    Rejected,
}

impl ContactState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "accepted" => Some(Self::Accepted),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// Distinguishes ordinary mail from policy-generated notifications that are
/// carried through the same mailbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Normal,
    ContactRequest,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::ContactRequest => "contact_request",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(Self::Normal),
            "contact_request" => Some(Self::ContactRequest),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub slug: String,
    pub human_key: String,
    pub created_ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub program: String,
    pub model: String,
    pub task_description: String,
    pub inception_ts: DateTime<Utc>,
    pub last_active_ts: DateTime<Utc>,
    pub contact_policy: ContactPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub project_id: i64,
    pub thread_id: String,
    pub subject: String,
    pub body_md: String,
    pub from_agent: String,
    pub created_ts: DateTime<Utc>,
    pub importance: Importance,
    pub ack_required: bool,
    pub kind: MessageKind,
    /// Set on messages injected by the human overseer; such messages bypass
    /// contact policy and clients must render them distinctly.
    pub overseer: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub message_id: String,
    pub agent_name: String,
    pub kind: RecipientKind,
    pub read_ts: Option<DateTime<Utc>>,
    pub ack_ts: Option<DateTime<Utc>>,
}

/// An advisory lease over a literal path or glob pattern.
///
/// Active iff `released_ts` is unset and `expires_ts` is in the future;
/// expired rows are swept lazily on the next read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub id: String,
    pub project_id: i64,
    pub agent_name: String,
    pub path: String,
    pub exclusive: bool,
    pub reason: String,
    pub created_ts: DateTime<Utc>,
    pub expires_ts: DateTime<Utc>,
    pub released_ts: Option<DateTime<Utc>>,
}

impl Claim {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.released_ts.is_none() && self.expires_ts > now
    }
}

/// One direction of a cross-project authorization. Traffic requires the
/// reverse direction to be accepted as well.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLink {
    pub from_project_id: i64,
    pub from_agent: String,
    pub to_project_id: i64,
    pub to_agent: String,
    pub state: LinkState,
    pub created_ts: DateTime<Utc>,
    pub decided_ts: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactRequest {
    pub project_id: i64,
    pub from_agent: String,
    pub to_agent: String,
    pub reason: String,
    pub state: ContactState,
    pub created_ts: DateTime<Utc>,
    pub decided_ts: Option<DateTime<Utc>>,
}

/// Inbox/outbox listing entry; bodies are included only on request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSummary {
    pub id: String,
    pub thread_id: String,
    pub subject: String,
    pub from: String,
    pub created_ts: DateTime<Utc>,
    pub importance: Importance,
    pub ack_required: bool,
    pub kind: MessageKind,
    pub overseer: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient_kind: Option<RecipientKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_ts: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack_ts: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_md: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadSummary {
    pub thread_id: String,
    pub participants: Vec<String>,
    pub total_messages: usize,
    pub first_ts: Option<DateTime<Utc>>,
    pub last_ts: Option<DateTime<Utc>>,
    pub key_points: Vec<String>,
    pub action_items: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub examples: Vec<MessageSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimHolder {
    pub agent: String,
    pub path: String,
    pub exclusive: bool,
    pub expires_ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConflict {
    pub path: String,
    pub code: crate::error::ErrorCode,
    pub holders: Vec<ClaimHolder>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveOutcome {
    pub granted: Vec<String>,
    pub conflicts: Vec<PathConflict>,
    pub expires_ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendReceipt {
    pub id: String,
    pub thread_id: String,
    pub created: DateTime<Utc>,
    pub subject: String,
    pub recipients: Vec<String>,
}

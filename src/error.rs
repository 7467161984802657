use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable, machine-readable error codes surfaced to RPC callers.
///
/// These strings are part of the wire contract; clients match on them to
/// decide how to recover (register the agent, request contact, retry, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ProjectNotFound,
    AgentNotRegistered,
    PolicyBlocked,
    ContactPending,
    LinkRequired,
    ClaimConflict,
    InvalidArgument,
    Timeout,
    IndexArchiveMismatch,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProjectNotFound => "PROJECT_NOT_FOUND",
            Self::AgentNotRegistered => "AGENT_NOT_REGISTERED",
            Self::PolicyBlocked => "POLICY_BLOCKED",
            Self::ContactPending => "CONTACT_PENDING",
            Self::LinkRequired => "LINK_REQUIRED",
            Self::ClaimConflict => "CLAIM_CONFLICT",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::Timeout => "TIMEOUT",
            Self::IndexArchiveMismatch => "INDEX_ARCHIVE_MISMATCH",
            Self::Internal => "INTERNAL",
        }
    }
}

#[derive(Error, Debug)]
pub enum MailroomError {
    #[error("Project '{0}' not found. Call ensure_project first.")]
    ProjectNotFound(String),

    #[error("Agent(s) {agents} not registered in project '{project}'. Call register_agent first.")]
    AgentNotRegistered { project: String, agents: String },

    #[error("Recipient '{0}' is not accepting messages")]
    PolicyBlocked(String),

    #[error("Contact request to '{0}' is pending approval; retry after the recipient responds")]
    ContactPending(String),

    #[error("No accepted agent link for '{agent}' in project '{project}'; a pending link was created")]
    LinkRequired { project: String, agent: String },

    #[error("Invalid argument '{field}': {message}")]
    InvalidArgument { field: String, message: String },

    #[error("Deadline exceeded before the operation could start")]
    Timeout,

    #[error("Index and archive disagree: {0}")]
    IndexArchiveMismatch(String),

    #[error("Failed to acquire project lock: {0}")]
    Lock(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl MailroomError {
    pub fn invalid_argument(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.into(),
            message: message.into(),
        }
    }

    /// The stable code reported to RPC callers for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::ProjectNotFound(_) => ErrorCode::ProjectNotFound,
            Self::AgentNotRegistered { .. } => ErrorCode::AgentNotRegistered,
            Self::PolicyBlocked(_) => ErrorCode::PolicyBlocked,
            Self::ContactPending(_) => ErrorCode::ContactPending,
            Self::LinkRequired { .. } => ErrorCode::LinkRequired,
            Self::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            Self::Timeout => ErrorCode::Timeout,
            Self::IndexArchiveMismatch(_) => ErrorCode::IndexArchiveMismatch,
            Self::Config(_) => ErrorCode::InvalidArgument,
            Self::Lock(_)
            | Self::Git(_)
            | Self::Db(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Other(_) => ErrorCode::Internal,
        }
    }

    /// Transient disk/index failures are retried once inside the locked
    /// section before being surfaced.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Db(_) | Self::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, MailroomError>;

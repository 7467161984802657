//! Contact-policy authorization: who may message whom.
//!
//! Same-project sends are governed by the recipient's `ContactPolicy`;
//! cross-project sends require an `AgentLink` accepted in both directions.
//! The human overseer bypasses all of it.

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::index::IndexStore;
use crate::leases;
use crate::model::{Agent, ContactPolicy, Project};

/// Outcome of evaluating one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    /// `block_all`, or `contacts_only` without an accepted contact.
    Blocked,
    /// `auto` with no qualifying signal; a pending contact request should
    /// be created and the send fails with `CONTACT_PENDING`.
    Pending,
}

/// A recipient address, possibly pointing into another project.
///
/// Supported external forms: `Name@<project-key-or-slug>` and
/// `project:<project-key-or-slug>#Name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Local { name: String },
    External { name: String, project_key: String },
}

impl Address {
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        if let Some(rest) = trimmed.strip_prefix("project:") {
            let (project_key, name) = rest.split_once('#')?;
            if project_key.trim().is_empty() || name.trim().is_empty() {
                return None;
            }
            return Some(Self::External {
                name: name.trim().to_string(),
                project_key: project_key.trim().to_string(),
            });
        }
        if let Some((name, project_key)) = trimmed.split_once('@') {
            if !name.trim().is_empty() && !project_key.trim().is_empty() {
                return Some(Self::External {
                    name: name.trim().to_string(),
                    project_key: project_key.trim().to_string(),
                });
            }
            return None;
        }
        Some(Self::Local {
            name: trimmed.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Local { name } | Self::External { name, .. } => name,
        }
    }
}

/// Evaluate a same-project send from `sender` to `recipient`.
pub fn evaluate_local(
    index: &IndexStore,
    project: &Project,
    sender: &Agent,
    recipient: &Agent,
    now: DateTime<Utc>,
) -> Result<PolicyDecision> {
    // Self-sends are always fine.
    if sender.name.eq_ignore_ascii_case(&recipient.name) {
        return Ok(PolicyDecision::Allow);
    }
    match recipient.contact_policy {
        ContactPolicy::Open => Ok(PolicyDecision::Allow),
        ContactPolicy::BlockAll => Ok(PolicyDecision::Blocked),
        ContactPolicy::ContactsOnly => {
            if index.contact_accepted(project.id, &sender.name, &recipient.name)? {
                Ok(PolicyDecision::Allow)
            } else {
                Ok(PolicyDecision::Blocked)
            }
        }
        ContactPolicy::Auto => {
            if index.contact_accepted_between(project.id, &sender.name, &recipient.name)? {
                return Ok(PolicyDecision::Allow);
            }
            if index.agents_share_thread(project.id, &sender.name, &recipient.name)? {
                return Ok(PolicyDecision::Allow);
            }
            let sender_claims = index.active_claims_for_agent(project.id, &sender.name, now)?;
            let recipient_claims =
                index.active_claims_for_agent(project.id, &recipient.name, now)?;
            if leases::agents_share_overlap(&sender_claims, &recipient_claims) {
                return Ok(PolicyDecision::Allow);
            }
            Ok(PolicyDecision::Pending)
        }
    }
}

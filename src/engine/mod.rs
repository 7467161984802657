//! The engine facade: the single entry point the RPC and web layers call.
//!
//! Every mutating call acquires the target project's exclusive lock (an
//! in-process mutex plus an on-disk lock file) for the span of policy check
//! → archive writes → commit → index upsert, so no two mutations on one
//! project interleave at either layer. Read-only calls take no lock and
//! tolerate concurrent commits. Cross-project operations acquire all
//! involved project locks in sorted slug order.

pub mod recovery;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex as TokioMutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::archive::{self, ArchiveLock, ProjectArchive};
use crate::config::Settings;
use crate::error::{MailroomError, Result};
use crate::index::{InboxFilter, IndexStore};
use crate::leases;
use crate::llm::{apply_refinement, HeuristicSummarizer, ThreadSummarizer};
use crate::mailbox::{self, summary};
use crate::model::{
    Agent, AgentLink, Claim, ContactPolicy, ContactRequest, Importance, LinkState, Message,
    MessageKind, MessageSummary, Project, Recipient, RecipientKind, ReserveOutcome, SendReceipt,
    ThreadSummary,
};
use crate::policy::{self, Address, PolicyDecision};
use crate::registry::{self, RegisterSpec};

pub use recovery::RebuildReport;

const FILE_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default)]
pub struct SendMessage {
    pub sender: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub body_md: String,
    pub importance: Importance,
    pub ack_required: bool,
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    /// Human overseer injection: bypasses contact policy and tags the
    /// message so clients render it distinctly.
    pub overseer: bool,
    pub deadline: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct ReplyMessage {
    pub sender: String,
    pub body_md: String,
    pub importance: Option<Importance>,
    pub ack_required: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct InboxQuery {
    pub since_ts: Option<DateTime<Utc>>,
    pub urgent_only: bool,
    pub include_bodies: bool,
    pub limit: usize,
}

#[derive(Debug, Clone)]
pub struct ReserveRequest {
    pub agent: String,
    pub paths: Vec<String>,
    pub ttl_seconds: Option<i64>,
    pub exclusive: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AckReceipt {
    pub acknowledged_at: DateTime<Utc>,
    pub updated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RenewOutcome {
    pub renewed: Vec<String>,
    pub expires_ts: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReleaseOutcome {
    pub released_count: usize,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStart {
    pub project: Project,
    pub agent: Agent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation: Option<ReserveOutcome>,
    pub inbox: Vec<MessageSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadPrep {
    pub agent: Agent,
    pub summary: ThreadSummary,
    pub inbox: Vec<MessageSummary>,
}

/// Held for the span of one mutating operation on one project.
struct ProjectGuard {
    _permit: OwnedMutexGuard<()>,
    _file: ArchiveLock,
}

pub struct Engine {
    settings: Settings,
    index: IndexStore,
    locks: DashMap<String, Arc<TokioMutex<()>>>,
    /// Per-project floor (µs since epoch) keeping `created_ts` strictly
    /// monotonic under concurrent sends.
    clock_floor: DashMap<String, i64>,
    summarizer: Arc<dyn ThreadSummarizer>,
}

impl Engine {
    pub fn new(settings: Settings) -> Result<Self> {
        let index = IndexStore::open(&settings.index_db_path())?;
        Ok(Self {
            settings,
            index,
            locks: DashMap::new(),
            clock_floor: DashMap::new(),
            summarizer: Arc::new(HeuristicSummarizer),
        })
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn ThreadSummarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Reconcile Index↔Archive before accepting traffic.
    pub fn startup_reconcile(&self) -> Result<RebuildReport> {
        recovery::reconcile(&self.settings, &self.index)
    }

    pub fn rebuild_index(&self) -> Result<RebuildReport> {
        recovery::rebuild(&self.settings, &self.index)
    }

    // ------------------------------------------------------------------
    // Identity registry
    // ------------------------------------------------------------------

    pub async fn ensure_project(
        &self,
        human_key: &str,
        deadline: Option<Instant>,
    ) -> Result<Project> {
        if human_key.trim().is_empty() {
            return Err(MailroomError::invalid_argument(
                "human_key",
                "must not be empty",
            ));
        }
        let slug = crate::naming::slugify(human_key);
        let _guard = self.lock_project(&slug, deadline).await?;
        self.retrying(|| registry::ensure_project(&self.settings, &self.index, human_key, Utc::now()))
    }

    pub async fn register_agent(
        &self,
        project_key: &str,
        spec: RegisterSpec,
        deadline: Option<Instant>,
    ) -> Result<Agent> {
        let project = self.resolve_project(project_key)?;
        let _guard = self.lock_project(&project.slug, deadline).await?;
        let archive = self.open_archive(&project.slug)?;
        let agent =
            self.retrying(|| registry::register_agent(&self.index, &archive, &project, &spec, Utc::now()))?;
        info!(project = %project.slug, agent = %agent.name, "agent registered");
        Ok(agent)
    }

    pub fn whois(&self, project_key: &str, agent_name: &str) -> Result<Agent> {
        let project = self.resolve_project(project_key)?;
        self.require_agent(&project, agent_name)
    }

    pub fn list_agents(&self, project_key: &str, active_only: bool) -> Result<Vec<Agent>> {
        let project = self.resolve_project(project_key)?;
        let floor = active_only.then(|| registry::active_floor(Utc::now()));
        self.index.list_agents(project.id, floor)
    }

    pub async fn set_contact_policy(
        &self,
        project_key: &str,
        agent_name: &str,
        policy: ContactPolicy,
        deadline: Option<Instant>,
    ) -> Result<Agent> {
        let project = self.resolve_project(project_key)?;
        let _guard = self.lock_project(&project.slug, deadline).await?;
        let agent = self
            .index
            .set_contact_policy(project.id, agent_name, policy)?
            .ok_or_else(|| self.unknown_agent(&project, agent_name))?;
        let archive = self.open_archive(&project.slug)?;
        archive.write_agent_profile(&agent, false)?;
        Ok(agent)
    }

    // ------------------------------------------------------------------
    // Mailbox
    // ------------------------------------------------------------------

    pub async fn send_message(
        &self,
        project_key: &str,
        message: SendMessage,
        options: SendOptions,
    ) -> Result<SendReceipt> {
        let project = self.resolve_project(project_key)?;

        // Parse and dedupe addressing before taking any lock.
        let mut local: Vec<(String, RecipientKind)> = Vec::new();
        let mut external: Vec<(Project, String, RecipientKind)> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for (list, kind) in [
            (&message.to, RecipientKind::To),
            (&message.cc, RecipientKind::Cc),
            (&message.bcc, RecipientKind::Bcc),
        ] {
            for raw in list {
                let address = Address::parse(raw).ok_or_else(|| {
                    MailroomError::invalid_argument("to", format!("unusable recipient '{raw}'"))
                })?;
                match address {
                    Address::Local { name } => {
                        if seen.insert(format!("{}#{}", project.slug, name.to_lowercase())) {
                            local.push((name, kind));
                        }
                    }
                    Address::External { name, project_key } => {
                        let target = self.resolve_project(&project_key)?;
                        if seen.insert(format!("{}#{}", target.slug, name.to_lowercase())) {
                            external.push((target, name, kind));
                        }
                    }
                }
            }
        }
        if local.is_empty() && external.is_empty() {
            return Err(MailroomError::invalid_argument(
                "to",
                "at least one recipient is required",
            ));
        }

        let mut slugs: Vec<String> = std::iter::once(project.slug.clone())
            .chain(external.iter().map(|(p, _, _)| p.slug.clone()))
            .collect();
        let _guards = self.lock_projects(&mut slugs, options.deadline).await?;

        let sender = self.require_agent(&project, &message.sender)?;

        // Resolve every local recipient up front; the whole send fails when
        // any name is unknown.
        let mut local_agents: Vec<(Agent, RecipientKind)> = Vec::new();
        let mut missing: Vec<String> = Vec::new();
        for (name, kind) in &local {
            match self.index.agent(project.id, name)? {
                Some(agent) => local_agents.push((agent, *kind)),
                None => missing.push(name.clone()),
            }
        }
        for (target, name, _) in &external {
            if self.index.agent(target.id, name)?.is_none() {
                missing.push(format!("{name}@{}", target.human_key));
            }
        }
        if !missing.is_empty() {
            return Err(MailroomError::AgentNotRegistered {
                project: project.human_key.clone(),
                agents: missing.join(", "),
            });
        }

        // Cross-project sends require an accepted link in both directions;
        // a refused send leaves a pending link behind for the overseer.
        for (target, name, _) in &external {
            if options.overseer || !self.settings.contact_enforcement_enabled {
                continue;
            }
            if !self
                .index
                .link_accepted_both(project.id, &sender.name, target.id, name)?
            {
                self.index.upsert_link_pending(
                    project.id,
                    &sender.name,
                    target.id,
                    name,
                    Utc::now(),
                )?;
                return Err(MailroomError::LinkRequired {
                    project: target.human_key.clone(),
                    agent: name.clone(),
                });
            }
        }

        // Contact policy per local recipient.
        if !options.overseer && self.settings.contact_enforcement_enabled {
            let now = Utc::now();
            let mut blocked = Vec::new();
            let mut pending = Vec::new();
            for (agent, _) in &local_agents {
                match policy::evaluate_local(&self.index, &project, &sender, agent, now)? {
                    PolicyDecision::Allow => {}
                    PolicyDecision::Blocked => blocked.push(agent.name.clone()),
                    PolicyDecision::Pending => pending.push(agent.name.clone()),
                }
            }
            if !blocked.is_empty() {
                return Err(MailroomError::PolicyBlocked(blocked.join(", ")));
            }
            if !pending.is_empty() {
                let archive = self.open_archive(&project.slug)?;
                for name in &pending {
                    self.index
                        .upsert_contact_pending(project.id, &sender.name, name, &message.subject, now)?;
                }
                let notice = pending
                    .iter()
                    .map(|n| (n.clone(), RecipientKind::To))
                    .collect();
                self.deliver_local(
                    &project,
                    &archive,
                    &sender.name,
                    notice,
                    &format!("Contact request from {}", sender.name),
                    &format!(
                        "{} would like to message you about: {}\n\nRespond with the respond_contact tool.",
                        sender.name, message.subject
                    ),
                    Importance::Normal,
                    false,
                    None,
                    MessageKind::ContactRequest,
                    false,
                )?;
                return Err(MailroomError::ContactPending(pending.join(", ")));
            }
        }

        // Deliver locally, then per external project with a sender alias.
        let mut receipt: Option<SendReceipt> = None;
        let mut recipient_names: Vec<String> = Vec::new();

        if !local_agents.is_empty() {
            let archive = self.open_archive(&project.slug)?;
            let resolved: Vec<(String, RecipientKind)> = local_agents
                .iter()
                .map(|(agent, kind)| (agent.name.clone(), *kind))
                .collect();
            recipient_names.extend(resolved.iter().map(|(n, _)| n.clone()));
            let (stored, _) = self.deliver_local(
                &project,
                &archive,
                &sender.name,
                resolved,
                &message.subject,
                &message.body_md,
                message.importance,
                message.ack_required,
                message.thread_id.as_deref(),
                MessageKind::Normal,
                options.overseer,
            )?;
            receipt = Some(SendReceipt {
                id: stored.id.clone(),
                thread_id: stored.thread_id.clone(),
                created: stored.created_ts,
                subject: stored.subject.clone(),
                recipients: Vec::new(),
            });
        }

        let mut externals_by_project: std::collections::BTreeMap<String, Vec<(String, RecipientKind)>> =
            Default::default();
        let mut target_projects: std::collections::BTreeMap<String, Project> = Default::default();
        for (target, name, kind) in external {
            recipient_names.push(format!("{name}@{}", target.human_key));
            externals_by_project
                .entry(target.slug.clone())
                .or_default()
                .push((name, kind));
            target_projects.insert(target.slug.clone(), target);
        }
        for (slug, recipients) in externals_by_project {
            let target = &target_projects[&slug];
            let archive = self.open_archive(&target.slug)?;
            // The sender appears in the target project under its own name.
            let alias_spec = RegisterSpec {
                program: sender.program.clone(),
                model: sender.model.clone(),
                name_hint: Some(sender.name.clone()),
                task_description: sender.task_description.clone(),
            };
            let alias =
                registry::register_agent(&self.index, &archive, target, &alias_spec, Utc::now())?;
            let (stored, _) = self.deliver_local(
                target,
                &archive,
                &alias.name,
                recipients,
                &message.subject,
                &message.body_md,
                message.importance,
                message.ack_required,
                message.thread_id.as_deref(),
                MessageKind::Normal,
                options.overseer,
            )?;
            if receipt.is_none() {
                receipt = Some(SendReceipt {
                    id: stored.id.clone(),
                    thread_id: stored.thread_id.clone(),
                    created: stored.created_ts,
                    subject: stored.subject.clone(),
                    recipients: Vec::new(),
                });
            }
        }

        self.index
            .touch_agent(project.id, &sender.name, Utc::now())?;
        let mut receipt = receipt
            .ok_or_else(|| MailroomError::Other("send produced no delivery".into()))?;
        receipt.recipients = recipient_names;
        Ok(receipt)
    }

    pub async fn reply_message(
        &self,
        project_key: &str,
        message_id: &str,
        reply: ReplyMessage,
        options: SendOptions,
    ) -> Result<SendReceipt> {
        let project = self.resolve_project(project_key)?;
        let original = self
            .index
            .message(project.id, message_id)?
            .ok_or_else(|| MailroomError::invalid_argument("message_id", format!("unknown message '{message_id}'")))?;
        let original_recipients = self.index.recipients(message_id)?;

        // Recipients: original sender plus the original To list minus the
        // replier.
        let mut to = vec![original.from_agent.clone()];
        for recipient in original_recipients
            .iter()
            .filter(|r| r.kind == RecipientKind::To)
        {
            if !recipient.agent_name.eq_ignore_ascii_case(&reply.sender)
                && !to
                    .iter()
                    .any(|n| n.eq_ignore_ascii_case(&recipient.agent_name))
            {
                to.push(recipient.agent_name.clone());
            }
        }

        let send = SendMessage {
            sender: reply.sender,
            to,
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: mailbox::reply_subject(&original.subject),
            body_md: reply.body_md,
            importance: reply.importance.unwrap_or(original.importance),
            ack_required: reply.ack_required.unwrap_or(original.ack_required),
            thread_id: Some(original.thread_id.clone()),
        };
        self.send_message(project_key, send, options).await
    }

    pub fn fetch_inbox(
        &self,
        project_key: &str,
        agent_name: &str,
        query: &InboxQuery,
    ) -> Result<Vec<MessageSummary>> {
        let project = self.resolve_project(project_key)?;
        let agent = self.require_agent(&project, agent_name)?;
        let filter = InboxFilter {
            since_ts: query.since_ts,
            urgent_only: query.urgent_only,
            limit: query.limit,
        };
        let rows = self.index.inbox(project.id, &agent.name, &filter)?;
        self.index.touch_agent(project.id, &agent.name, Utc::now())?;
        Ok(rows
            .iter()
            .map(|(message, recipient)| {
                mailbox::summarize_message(message, Some(recipient), query.include_bodies)
            })
            .collect())
    }

    pub fn fetch_outbox(
        &self,
        project_key: &str,
        agent_name: &str,
        include_bodies: bool,
        limit: usize,
    ) -> Result<Vec<MessageSummary>> {
        let project = self.resolve_project(project_key)?;
        let agent = self.require_agent(&project, agent_name)?;
        let rows = self.index.outbox(project.id, &agent.name, limit)?;
        Ok(rows
            .iter()
            .map(|message| mailbox::summarize_message(message, None, include_bodies))
            .collect())
    }

    pub fn get_message(
        &self,
        project_key: &str,
        message_id: &str,
    ) -> Result<(Message, Vec<Recipient>)> {
        let project = self.resolve_project(project_key)?;
        match self.index.message(project.id, message_id)? {
            Some(message) => {
                let recipients = self.index.recipients(message_id)?;
                Ok((message, recipients))
            }
            None => {
                // The archive may know a message the index lost; repair and
                // retry once before giving up.
                recovery::reconcile(&self.settings, &self.index)?;
                let message = self.index.message(project.id, message_id)?.ok_or_else(|| {
                    MailroomError::invalid_argument(
                        "message_id",
                        format!("unknown message '{message_id}'"),
                    )
                })?;
                let recipients = self.index.recipients(message_id)?;
                Ok((message, recipients))
            }
        }
    }

    pub fn mark_read(&self, project_key: &str, agent_name: &str, message_id: &str) -> Result<AckReceipt> {
        let project = self.resolve_project(project_key)?;
        let agent = self.require_agent(&project, agent_name)?;
        let now = Utc::now();
        let updated = self.index.mark_read(project.id, &agent.name, message_id, now)?;
        Ok(AckReceipt {
            acknowledged_at: now,
            updated,
        })
    }

    pub fn acknowledge_message(
        &self,
        project_key: &str,
        agent_name: &str,
        message_id: &str,
    ) -> Result<AckReceipt> {
        let project = self.resolve_project(project_key)?;
        let agent = self.require_agent(&project, agent_name)?;
        let now = Utc::now();
        let updated = self
            .index
            .acknowledge(project.id, &agent.name, message_id, now)?;
        self.index.touch_agent(project.id, &agent.name, now)?;
        Ok(AckReceipt {
            acknowledged_at: now,
            updated,
        })
    }

    pub fn search_messages(
        &self,
        project_key: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MessageSummary>> {
        if query.trim().is_empty() {
            return Err(MailroomError::invalid_argument("query", "must not be empty"));
        }
        let project = self.resolve_project(project_key)?;
        let rows = self.index.search(project.id, query, limit)?;
        Ok(rows
            .iter()
            .map(|message| mailbox::summarize_message(message, None, false))
            .collect())
    }

    /// Summarize a thread. The deterministic digest is always produced; an
    /// enabled LLM collaborator may refine key points and action items,
    /// reading a snapshot taken here — never inside a lock.
    pub async fn summarize_thread(
        &self,
        project_key: &str,
        thread_id: &str,
        include_examples: bool,
    ) -> Result<ThreadSummary> {
        let project = self.resolve_project(project_key)?;
        let messages = self.index.thread_messages(project.id, thread_id)?;
        let mut digest = summary::digest(thread_id, &messages);
        if self.settings.llm.enabled {
            if let Some(refinement) = self.summarizer.refine(&messages, &digest).await {
                digest = apply_refinement(digest, refinement);
            }
        }
        if include_examples {
            digest.examples = messages
                .iter()
                .take(3)
                .map(|m| mailbox::summarize_message(m, None, false))
                .collect();
        }
        Ok(digest)
    }

    // ------------------------------------------------------------------
    // Leases
    // ------------------------------------------------------------------

    pub async fn reserve_file_paths(
        &self,
        project_key: &str,
        request: ReserveRequest,
        deadline: Option<Instant>,
    ) -> Result<ReserveOutcome> {
        if request.paths.is_empty() {
            return Err(MailroomError::invalid_argument("paths", "must not be empty"));
        }
        for path in &request.paths {
            validate_claim_path(path)?;
        }
        let project = self.resolve_project(project_key)?;
        let _guard = self.lock_project(&project.slug, deadline).await?;
        let agent = self.require_agent(&project, &request.agent)?;

        let now = Utc::now();
        self.index.sweep_expired(project.id, now)?;
        let active = self.index.active_claims(project.id, now)?;
        let paths: Vec<String> = request.paths.iter().map(|p| leases::normalize(p)).collect();
        let (granted, conflicts) =
            leases::evaluate_request(&active, &paths, request.exclusive, &agent.name, now);

        let expires_ts = now + leases::effective_ttl(request.ttl_seconds);
        let mut new_claims = Vec::with_capacity(granted.len());
        for path in &granted {
            new_claims.push(Claim {
                id: mailbox::claim_id(now),
                project_id: project.id,
                agent_name: agent.name.clone(),
                path: path.clone(),
                exclusive: request.exclusive,
                reason: request.reason.clone(),
                created_ts: now,
                expires_ts,
                released_ts: None,
            });
        }
        if !new_claims.is_empty() {
            let archive = self.open_archive(&project.slug)?;
            archive.write_claim_records(
                &new_claims,
                &archive::claim_commit_subject(&agent.name, request.exclusive, new_claims.len()),
            )?;
            self.retrying(|| {
                for claim in &new_claims {
                    self.index.insert_claim(claim)?;
                }
                Ok(())
            })
            .map_err(|err| index_after_commit(err))?;
        }
        self.index.touch_agent(project.id, &agent.name, now)?;
        debug!(
            project = %project.slug,
            agent = %agent.name,
            granted = granted.len(),
            conflicts = conflicts.len(),
            "reservation evaluated"
        );
        Ok(ReserveOutcome {
            granted,
            conflicts,
            expires_ts,
        })
    }

    pub async fn renew_file_reservations(
        &self,
        project_key: &str,
        agent_name: &str,
        extend_seconds: i64,
        paths: Option<Vec<String>>,
        deadline: Option<Instant>,
    ) -> Result<RenewOutcome> {
        if extend_seconds <= 0 {
            return Err(MailroomError::invalid_argument(
                "extend_seconds",
                "must be positive",
            ));
        }
        let project = self.resolve_project(project_key)?;
        let _guard = self.lock_project(&project.slug, deadline).await?;
        let agent = self.require_agent(&project, agent_name)?;
        let now = Utc::now();
        self.index.sweep_expired(project.id, now)?;
        let normalized = paths.map(|p| p.iter().map(|x| leases::normalize(x)).collect::<Vec<_>>());
        let renewed = self.index.renew_claims(
            project.id,
            &agent.name,
            chrono::Duration::seconds(extend_seconds),
            normalized.as_deref(),
            now,
        )?;
        if !renewed.is_empty() {
            let archive = self.open_archive(&project.slug)?;
            archive.write_claim_records(
                &renewed,
                &format!("claim: renew {} {} path(s)", agent.name, renewed.len()),
            )?;
        }
        self.index.touch_agent(project.id, &agent.name, now)?;
        Ok(RenewOutcome {
            expires_ts: renewed.iter().map(|c| c.expires_ts).max(),
            renewed: renewed.into_iter().map(|c| c.path).collect(),
        })
    }

    pub async fn release_file_reservations(
        &self,
        project_key: &str,
        agent_name: &str,
        paths: Option<Vec<String>>,
        deadline: Option<Instant>,
    ) -> Result<ReleaseOutcome> {
        let project = self.resolve_project(project_key)?;
        let _guard = self.lock_project(&project.slug, deadline).await?;
        let agent = self.require_agent(&project, agent_name)?;
        let now = Utc::now();
        let normalized = paths.map(|p| p.iter().map(|x| leases::normalize(x)).collect::<Vec<_>>());
        let released =
            self.index
                .release_claims(project.id, &agent.name, normalized.as_deref(), now)?;
        if !released.is_empty() {
            let archive = self.open_archive(&project.slug)?;
            archive.write_claim_records(
                &released,
                &archive::release_commit_subject(&agent.name, released.len()),
            )?;
        }
        self.index.touch_agent(project.id, &agent.name, now)?;
        Ok(ReleaseOutcome {
            released_count: released.len(),
            at: now,
        })
    }

    pub fn list_claims(&self, project_key: &str, active_only: bool) -> Result<Vec<Claim>> {
        let project = self.resolve_project(project_key)?;
        if active_only {
            self.index.active_claims(project.id, Utc::now())
        } else {
            self.index.all_claims(project.id)
        }
    }

    /// Sweep every project's expired claims and record the releases in the
    /// archives. Returns the number of claims swept.
    pub async fn gc_expired_claims(&self) -> Result<usize> {
        let mut total = 0;
        for project in self.index.list_projects()? {
            let _guard = self.lock_project(&project.slug, None).await?;
            let swept = self.index.sweep_expired(project.id, Utc::now())?;
            if !swept.is_empty() {
                let archive = self.open_archive(&project.slug)?;
                archive.write_claim_records(
                    &swept,
                    &format!("claim: expire {} path(s)", swept.len()),
                )?;
                total += swept.len();
            }
        }
        Ok(total)
    }

    // ------------------------------------------------------------------
    // Contacts and links
    // ------------------------------------------------------------------

    pub async fn request_contact(
        &self,
        project_key: &str,
        from_agent: &str,
        to_agent: &str,
        reason: &str,
        deadline: Option<Instant>,
    ) -> Result<ContactRequest> {
        let project = self.resolve_project(project_key)?;
        let _guard = self.lock_project(&project.slug, deadline).await?;
        let from = self.require_agent(&project, from_agent)?;
        let to = self.require_agent(&project, to_agent)?;
        let now = Utc::now();
        let request =
            self.index
                .upsert_contact_pending(project.id, &from.name, &to.name, reason, now)?;
        if request.state == crate::model::ContactState::Pending {
            let archive = self.open_archive(&project.slug)?;
            self.deliver_local(
                &project,
                &archive,
                &from.name,
                vec![(to.name.clone(), RecipientKind::To)],
                &format!("Contact request from {}", from.name),
                &format!("{}\n\nRespond with the respond_contact tool.", reason),
                Importance::Normal,
                false,
                None,
                MessageKind::ContactRequest,
                false,
            )?;
        }
        Ok(request)
    }

    /// The target of a pending request decides it.
    pub async fn respond_contact(
        &self,
        project_key: &str,
        agent_name: &str,
        from_agent: &str,
        accept: bool,
        deadline: Option<Instant>,
    ) -> Result<ContactRequest> {
        let project = self.resolve_project(project_key)?;
        let _guard = self.lock_project(&project.slug, deadline).await?;
        let to = self.require_agent(&project, agent_name)?;
        let from = self.require_agent(&project, from_agent)?;
        self.index
            .decide_contact(project.id, &from.name, &to.name, accept, Utc::now())?
            .ok_or_else(|| {
                MailroomError::invalid_argument(
                    "from_agent",
                    format!("no contact request from '{from_agent}'"),
                )
            })
    }

    pub fn list_contacts(&self, project_key: &str, agent_name: &str) -> Result<Vec<ContactRequest>> {
        let project = self.resolve_project(project_key)?;
        let agent = self.require_agent(&project, agent_name)?;
        self.index.contacts_for(project.id, &agent.name)
    }

    pub async fn request_link(
        &self,
        from_project_key: &str,
        from_agent: &str,
        to_project_key: &str,
        to_agent: &str,
        deadline: Option<Instant>,
    ) -> Result<AgentLink> {
        let from_project = self.resolve_project(from_project_key)?;
        let to_project = self.resolve_project(to_project_key)?;
        let mut slugs = vec![from_project.slug.clone(), to_project.slug.clone()];
        let _guards = self.lock_projects(&mut slugs, deadline).await?;
        let from = self.require_agent(&from_project, from_agent)?;
        let to = self.require_agent(&to_project, to_agent)?;
        self.index
            .upsert_link_pending(from_project.id, &from.name, to_project.id, &to.name, Utc::now())
    }

    /// The target side decides a pending link. Accepting authorizes both
    /// directions in one call.
    pub async fn respond_link(
        &self,
        from_project_key: &str,
        from_agent: &str,
        to_project_key: &str,
        to_agent: &str,
        accept: bool,
        deadline: Option<Instant>,
    ) -> Result<AgentLink> {
        let from_project = self.resolve_project(from_project_key)?;
        let to_project = self.resolve_project(to_project_key)?;
        let mut slugs = vec![from_project.slug.clone(), to_project.slug.clone()];
        let _guards = self.lock_projects(&mut slugs, deadline).await?;
        let from = self.require_agent(&from_project, from_agent)?;
        let to = self.require_agent(&to_project, to_agent)?;
        let now = Utc::now();
        let state = if accept {
            LinkState::Accepted
        } else {
            LinkState::Blocked
        };
        let link = self.index.set_link_state(
            from_project.id,
            &from.name,
            to_project.id,
            &to.name,
            state,
            now,
        )?;
        if accept {
            self.index.set_link_state(
                to_project.id,
                &to.name,
                from_project.id,
                &from.name,
                LinkState::Accepted,
                now,
            )?;
        }
        Ok(link)
    }

    // ------------------------------------------------------------------
    // Macros
    // ------------------------------------------------------------------

    /// `ensure_project` + `register_agent` (+ reserve + inbox) in one call.
    pub async fn macro_start_session(
        &self,
        project_key: &str,
        spec: RegisterSpec,
        reserve_paths: Option<Vec<String>>,
        ttl_seconds: Option<i64>,
        exclusive: bool,
        deadline: Option<Instant>,
    ) -> Result<SessionStart> {
        let project = self.ensure_project(project_key, deadline).await?;
        let agent = self
            .register_agent(&project.human_key, spec, deadline)
            .await?;
        let reservation = match reserve_paths.filter(|p| !p.is_empty()) {
            Some(paths) => Some(
                self.reserve_file_paths(
                    &project.human_key,
                    ReserveRequest {
                        agent: agent.name.clone(),
                        paths,
                        ttl_seconds,
                        exclusive,
                        reason: "session start".into(),
                    },
                    deadline,
                )
                .await?,
            ),
            None => None,
        };
        let inbox = self.fetch_inbox(
            &project.human_key,
            &agent.name,
            &InboxQuery {
                limit: 20,
                ..Default::default()
            },
        )?;
        Ok(SessionStart {
            project,
            agent,
            reservation,
            inbox,
        })
    }

    /// `register_agent` + `summarize_thread` + `fetch_inbox` in one call.
    pub async fn macro_prepare_thread(
        &self,
        project_key: &str,
        spec: RegisterSpec,
        thread_id: &str,
        include_examples: bool,
        deadline: Option<Instant>,
    ) -> Result<ThreadPrep> {
        let project = self.ensure_project(project_key, deadline).await?;
        let agent = self
            .register_agent(&project.human_key, spec, deadline)
            .await?;
        let summary = self
            .summarize_thread(&project.human_key, thread_id, include_examples)
            .await?;
        let inbox = self.fetch_inbox(
            &project.human_key,
            &agent.name,
            &InboxQuery {
                limit: 20,
                ..Default::default()
            },
        )?;
        Ok(ThreadPrep {
            agent,
            summary,
            inbox,
        })
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        self.index.list_projects()
    }

    pub fn get_project(&self, project_key: &str) -> Result<Project> {
        self.resolve_project(project_key)
    }

    /// Lookup by message id alone, for `resource://message/{id}`.
    pub fn find_message(&self, message_id: &str) -> Result<(Message, Vec<Recipient>)> {
        match self.index.message_any(message_id)? {
            Some(message) => {
                let recipients = self.index.recipients(message_id)?;
                Ok((message, recipients))
            }
            None => Err(MailroomError::invalid_argument(
                "message_id",
                format!("unknown message '{message_id}'"),
            )),
        }
    }

    pub fn health(&self) -> Result<serde_json::Value> {
        let projects = self.index.list_projects()?;
        Ok(serde_json::json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "projects": projects.len(),
            "storage_root": self.settings.storage.root.display().to_string(),
        }))
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Accept either a human key or an existing slug.
    fn resolve_project(&self, project_key: &str) -> Result<Project> {
        let slug = crate::naming::slugify(project_key);
        if let Some(project) = self.index.project_by_slug(&slug)? {
            return Ok(project);
        }
        if let Some(project) = self.index.project_by_slug(project_key)? {
            return Ok(project);
        }
        Err(MailroomError::ProjectNotFound(project_key.to_string()))
    }

    fn require_agent(&self, project: &Project, name: &str) -> Result<Agent> {
        self.index
            .agent(project.id, name)?
            .ok_or_else(|| self.unknown_agent(project, name))
    }

    fn unknown_agent(&self, project: &Project, name: &str) -> MailroomError {
        MailroomError::AgentNotRegistered {
            project: project.human_key.clone(),
            agents: name.to_string(),
        }
    }

    fn open_archive(&self, slug: &str) -> Result<ProjectArchive> {
        ProjectArchive::open(
            &self.settings.project_repo_dir(slug),
            &self.settings.storage.git_author_name,
            &self.settings.storage.git_author_email,
        )
    }

    async fn lock_project(&self, slug: &str, deadline: Option<Instant>) -> Result<ProjectGuard> {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(MailroomError::Timeout);
        }
        let mutex = {
            let entry = self
                .locks
                .entry(slug.to_string())
                .or_insert_with(|| Arc::new(TokioMutex::new(())));
            entry.value().clone()
        };
        let permit = mutex.lock_owned().await;
        let lock_dir = self.settings.projects_dir().join(slug);
        std::fs::create_dir_all(&lock_dir)?;
        let file = ArchiveLock::acquire(&lock_dir.join(".archive.lock"), FILE_LOCK_TIMEOUT).await?;
        Ok(ProjectGuard {
            _permit: permit,
            _file: file,
        })
    }

    /// Acquire several project locks in sorted slug order, the discipline
    /// that keeps cross-project sends deadlock-free.
    async fn lock_projects(
        &self,
        slugs: &mut Vec<String>,
        deadline: Option<Instant>,
    ) -> Result<Vec<ProjectGuard>> {
        slugs.sort();
        slugs.dedup();
        let mut guards = Vec::with_capacity(slugs.len());
        for slug in slugs.iter() {
            guards.push(self.lock_project(slug, deadline).await?);
        }
        Ok(guards)
    }

    /// Strictly monotonic per-project timestamps, assigned inside the
    /// critical section so concurrent sends order deterministically.
    fn next_created_ts(&self, slug: &str) -> DateTime<Utc> {
        let now = Utc::now().timestamp_micros();
        let mut floor = self.clock_floor.entry(slug.to_string()).or_insert(0);
        let next = now.max(*floor + 1);
        *floor = next;
        DateTime::from_timestamp_micros(next).unwrap_or_else(Utc::now)
    }

    fn unique_message_id(&self, project_id: i64, created: DateTime<Utc>) -> Result<String> {
        loop {
            let id = mailbox::message_id(created);
            if self.index.message(project_id, &id)?.is_none() {
                return Ok(id);
            }
        }
    }

    /// Archive commit then index upsert for one message in one project.
    /// Must be called with the project lock held.
    #[allow(clippy::too_many_arguments)]
    fn deliver_local(
        &self,
        project: &Project,
        archive: &ProjectArchive,
        from: &str,
        recipients: Vec<(String, RecipientKind)>,
        subject: &str,
        body_md: &str,
        importance: Importance,
        ack_required: bool,
        thread_id: Option<&str>,
        kind: MessageKind,
        overseer: bool,
    ) -> Result<(Message, Vec<Recipient>)> {
        let created_ts = self.next_created_ts(&project.slug);
        let id = self.unique_message_id(project.id, created_ts)?;
        let message = Message {
            id: id.clone(),
            project_id: project.id,
            thread_id: thread_id
                .filter(|t| !t.trim().is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| id.clone()),
            subject: subject.to_string(),
            body_md: body_md.to_string(),
            from_agent: from.to_string(),
            created_ts,
            importance,
            ack_required,
            kind,
            overseer,
        };
        let recipient_rows: Vec<Recipient> = recipients
            .into_iter()
            .map(|(name, kind)| Recipient {
                message_id: id.clone(),
                agent_name: name,
                kind,
                read_ts: None,
                ack_ts: None,
            })
            .collect();

        archive.write_message_bundle(&message, &recipient_rows)?;
        self.retrying(|| self.index.insert_message(&message, &recipient_rows))
            .map_err(index_after_commit)?;
        Ok((message, recipient_rows))
    }

    /// One retry for transient disk/index errors inside the locked section.
    fn retrying<T>(&self, operation: impl Fn() -> Result<T>) -> Result<T> {
        match operation() {
            Err(err) if err.is_transient() => operation(),
            other => other,
        }
    }
}

/// An index failure after the archive commit landed: the caller sees
/// `INDEX_ARCHIVE_MISMATCH` and the next open repairs from the archive.
fn index_after_commit(err: MailroomError) -> MailroomError {
    match err {
        MailroomError::IndexArchiveMismatch(_) => err,
        other => MailroomError::IndexArchiveMismatch(other.to_string()),
    }
}

fn validate_claim_path(path: &str) -> Result<()> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(MailroomError::invalid_argument("paths", "empty path"));
    }
    if trimmed.starts_with('/') {
        return Err(MailroomError::invalid_argument(
            "paths",
            format!("'{trimmed}' must be project-relative"),
        ));
    }
    if trimmed.split('/').any(|segment| segment == "..") {
        return Err(MailroomError::invalid_argument(
            "paths",
            format!("'{trimmed}' must not traverse upward"),
        ));
    }
    Ok(())
}

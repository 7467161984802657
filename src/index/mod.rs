//! The Index: a SQLite mirror of the archive used for queries.
//!
//! The archive owns the durable bytes; every row here can be rebuilt from
//! the committed files alone. The connection runs in WAL mode with foreign
//! keys on, and message subject/body are mirrored into an FTS5 table by
//! triggers.

mod schema;

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use crate::error::{MailroomError, Result};
use crate::model::{
    parse_ts, ts, Agent, AgentLink, Claim, ContactPolicy, ContactRequest, ContactState, Importance,
    LinkState, Message, MessageKind, Project, Recipient, RecipientKind,
};

#[derive(Debug, Clone, Default)]
pub struct InboxFilter {
    pub since_ts: Option<DateTime<Utc>>,
    pub urgent_only: bool,
    pub limit: usize,
}

#[derive(Clone)]
pub struct IndexStore {
    conn: Arc<Mutex<Connection>>,
}

impl IndexStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init(conn: &Connection) -> Result<()> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.execute_batch(schema::CREATE_TABLES_SQL)?;
        conn.execute_batch(schema::CREATE_FTS_TRIGGERS_SQL)?;
        Ok(())
    }

    /// Drop every mirrored row. Only `rebuild-index` calls this.
    pub fn wipe(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(schema::WIPE_SQL)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Projects
    // ------------------------------------------------------------------

    pub fn upsert_project(
        &self,
        slug: &str,
        human_key: &str,
        created_ts: DateTime<Utc>,
    ) -> Result<Project> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO projects (slug, human_key, created_ts) VALUES (?1, ?2, ?3)
             ON CONFLICT(slug) DO NOTHING",
            params![slug, human_key, ts(created_ts)],
        )?;
        Self::project_by_slug_inner(&conn, slug)?
            .ok_or_else(|| MailroomError::ProjectNotFound(slug.to_string()))
    }

    pub fn project_by_slug(&self, slug: &str) -> Result<Option<Project>> {
        let conn = self.conn.lock();
        Self::project_by_slug_inner(&conn, slug)
    }

    fn project_by_slug_inner(conn: &Connection, slug: &str) -> Result<Option<Project>> {
        conn.query_row(
            "SELECT id, slug, human_key, created_ts FROM projects WHERE slug = ?1",
            params![slug],
            row_to_project,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn project_by_id(&self, id: i64) -> Result<Option<Project>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, slug, human_key, created_ts FROM projects WHERE id = ?1",
            params![id],
            row_to_project,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT id, slug, human_key, created_ts FROM projects ORDER BY slug")?;
        let rows = stmt.query_map([], row_to_project)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    // ------------------------------------------------------------------
    // Agents
    // ------------------------------------------------------------------

    /// Register semantics: create, or refresh the mutable fields of an
    /// existing row (program, model, task, last_active). Name matching is
    /// case-insensitive via column collation.
    pub fn upsert_agent(
        &self,
        project_id: i64,
        name: &str,
        program: &str,
        model: &str,
        task_description: &str,
        now: DateTime<Utc>,
    ) -> Result<Agent> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO agents (project_id, name, program, model, task_description, inception_ts, last_active_ts, contact_policy)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, 'auto')
             ON CONFLICT(project_id, name) DO UPDATE SET
                 program = excluded.program,
                 model = excluded.model,
                 task_description = excluded.task_description,
                 last_active_ts = excluded.last_active_ts",
            params![project_id, name, program, model, task_description, ts(now)],
        )?;
        Self::agent_inner(&conn, project_id, name)?.ok_or_else(|| {
            MailroomError::Other(format!("agent '{name}' vanished during upsert"))
        })
    }

    /// Rebuild semantics: restore a full agent row from its archived
    /// profile, including policy and inception time.
    pub fn restore_agent(&self, project_id: i64, agent: &Agent) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO agents (project_id, name, program, model, task_description, inception_ts, last_active_ts, contact_policy)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(project_id, name) DO UPDATE SET
                 program = excluded.program,
                 model = excluded.model,
                 task_description = excluded.task_description,
                 inception_ts = excluded.inception_ts,
                 last_active_ts = excluded.last_active_ts,
                 contact_policy = excluded.contact_policy",
            params![
                project_id,
                agent.name,
                agent.program,
                agent.model,
                agent.task_description,
                ts(agent.inception_ts),
                ts(agent.last_active_ts),
                agent.contact_policy.as_str(),
            ],
        )?;
        Ok(())
    }

    pub fn agent(&self, project_id: i64, name: &str) -> Result<Option<Agent>> {
        let conn = self.conn.lock();
        Self::agent_inner(&conn, project_id, name)
    }

    fn agent_inner(conn: &Connection, project_id: i64, name: &str) -> Result<Option<Agent>> {
        conn.query_row(
            "SELECT id, project_id, name, program, model, task_description, inception_ts, last_active_ts, contact_policy
             FROM agents WHERE project_id = ?1 AND name = ?2",
            params![project_id, name],
            row_to_agent,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list_agents(&self, project_id: i64, active_since: Option<DateTime<Utc>>) -> Result<Vec<Agent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, project_id, name, program, model, task_description, inception_ts, last_active_ts, contact_policy
             FROM agents WHERE project_id = ?1 AND last_active_ts >= ?2 ORDER BY name",
        )?;
        let floor = active_since.map_or_else(|| "0000".to_string(), ts);
        let rows = stmt.query_map(params![project_id, floor], row_to_agent)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn agent_names_lower(&self, project_id: i64) -> Result<HashSet<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT name FROM agents WHERE project_id = ?1")?;
        let rows = stmt.query_map(params![project_id], |row| row.get::<_, String>(0))?;
        let mut out = HashSet::new();
        for name in rows {
            out.insert(name?.to_lowercase());
        }
        Ok(out)
    }

    pub fn touch_agent(&self, project_id: i64, name: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE agents SET last_active_ts = ?3 WHERE project_id = ?1 AND name = ?2",
            params![project_id, name, ts(now)],
        )?;
        Ok(())
    }

    pub fn set_contact_policy(
        &self,
        project_id: i64,
        name: &str,
        policy: ContactPolicy,
    ) -> Result<Option<Agent>> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE agents SET contact_policy = ?3 WHERE project_id = ?1 AND name = ?2",
            params![project_id, name, policy.as_str()],
        )?;
        if updated == 0 {
            return Ok(None);
        }
        Self::agent_inner(&conn, project_id, name)
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    pub fn insert_message(&self, message: &Message, recipients: &[Recipient]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO messages (id, project_id, thread_id, subject, body_md, from_agent, created_ts, importance, ack_required, kind, overseer)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                message.id,
                message.project_id,
                message.thread_id,
                message.subject,
                message.body_md,
                message.from_agent,
                ts(message.created_ts),
                message.importance.as_str(),
                message.ack_required as i64,
                message.kind.as_str(),
                message.overseer as i64,
            ],
        )?;
        for recipient in recipients {
            tx.execute(
                "INSERT INTO message_recipients (message_id, agent_name, kind, read_ts, ack_ts)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    recipient.message_id,
                    recipient.agent_name,
                    recipient.kind.as_str(),
                    recipient.read_ts.map(ts),
                    recipient.ack_ts.map(ts),
                ],
            )?;
        }
        tx.commit()?;
        debug!(message_id = %message.id, recipients = recipients.len(), "message indexed");
        Ok(())
    }

    /// Recovery/rebuild path: insert only if the id is not already mirrored.
    pub fn restore_message(&self, message: &Message, recipients: &[Recipient]) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO messages (id, project_id, thread_id, subject, body_md, from_agent, created_ts, importance, ack_required, kind, overseer)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                message.id,
                message.project_id,
                message.thread_id,
                message.subject,
                message.body_md,
                message.from_agent,
                ts(message.created_ts),
                message.importance.as_str(),
                message.ack_required as i64,
                message.kind.as_str(),
                message.overseer as i64,
            ],
        )?;
        if inserted > 0 {
            for recipient in recipients {
                tx.execute(
                    "INSERT OR IGNORE INTO message_recipients (message_id, agent_name, kind) VALUES (?1, ?2, ?3)",
                    params![recipient.message_id, recipient.agent_name, recipient.kind.as_str()],
                )?;
            }
        }
        tx.commit()?;
        Ok(inserted > 0)
    }

    pub fn message(&self, project_id: i64, message_id: &str) -> Result<Option<Message>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("{MESSAGE_SELECT} WHERE project_id = ?1 AND id = ?2"),
            params![project_id, message_id],
            row_to_message,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Lookup by id alone, for resource URIs that carry no project key.
    pub fn message_any(&self, message_id: &str) -> Result<Option<Message>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("{MESSAGE_SELECT} WHERE id = ?1"),
            params![message_id],
            row_to_message,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn recipients(&self, message_id: &str) -> Result<Vec<Recipient>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT message_id, agent_name, kind, read_ts, ack_ts
             FROM message_recipients WHERE message_id = ?1 ORDER BY kind, agent_name",
        )?;
        let rows = stmt.query_map(params![message_id], row_to_recipient)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn message_ids(&self, project_id: i64) -> Result<HashSet<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id FROM messages WHERE project_id = ?1")?;
        let rows = stmt.query_map(params![project_id], |row| row.get::<_, String>(0))?;
        let mut out = HashSet::new();
        for id in rows {
            out.insert(id?);
        }
        Ok(out)
    }

    pub fn all_messages(&self, project_id: i64) -> Result<Vec<Message>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{MESSAGE_SELECT} WHERE project_id = ?1 ORDER BY created_ts, id"
        ))?;
        let rows = stmt.query_map(params![project_id], row_to_message)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn inbox(
        &self,
        project_id: i64,
        agent: &str,
        filter: &InboxFilter,
    ) -> Result<Vec<(Message, Recipient)>> {
        let conn = self.conn.lock();
        let mut sql = format!(
            "SELECT m.id, m.project_id, m.thread_id, m.subject, m.body_md, m.from_agent,
                    m.created_ts, m.importance, m.ack_required, m.kind, m.overseer,
                    r.message_id, r.agent_name, r.kind, r.read_ts, r.ack_ts
             FROM message_recipients r
             JOIN messages m ON m.id = r.message_id
             WHERE m.project_id = ?1 AND r.agent_name = ?2"
        );
        if filter.urgent_only {
            sql.push_str(" AND m.importance IN ('high', 'urgent')");
        }
        if filter.since_ts.is_some() {
            sql.push_str(" AND m.created_ts > ?3");
        }
        sql.push_str(" ORDER BY m.created_ts DESC, m.id DESC LIMIT ?4");

        let limit = if filter.limit == 0 { 50 } else { filter.limit } as i64;
        let since = filter.since_ts.map_or_else(|| "0000".to_string(), ts);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![project_id, agent, since, limit], |row| {
            Ok((row_to_message(row)?, row_to_recipient_at(row, 11)?))
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn outbox(&self, project_id: i64, agent: &str, limit: usize) -> Result<Vec<Message>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{MESSAGE_SELECT} WHERE project_id = ?1 AND from_agent = ?2
             ORDER BY created_ts DESC, id DESC LIMIT ?3"
        ))?;
        let limit = if limit == 0 { 50 } else { limit } as i64;
        let rows = stmt.query_map(params![project_id, agent, limit], row_to_message)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Messages in a thread, oldest first. A `thread_id` equal to a message
    /// id also matches that root message.
    pub fn thread_messages(&self, project_id: i64, thread_id: &str) -> Result<Vec<Message>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{MESSAGE_SELECT} WHERE project_id = ?1 AND (thread_id = ?2 OR id = ?2)
             ORDER BY created_ts, id"
        ))?;
        let rows = stmt.query_map(params![project_id, thread_id], row_to_message)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn mark_read(
        &self,
        project_id: i64,
        agent: &str,
        message_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE message_recipients SET read_ts = COALESCE(read_ts, ?4)
             WHERE message_id = ?1 AND agent_name = ?2
               AND message_id IN (SELECT id FROM messages WHERE project_id = ?3)",
            params![message_id, agent, project_id, ts(now)],
        )?;
        Ok(updated > 0)
    }

    /// Acknowledge implies read.
    pub fn acknowledge(
        &self,
        project_id: i64,
        agent: &str,
        message_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE message_recipients
             SET ack_ts = COALESCE(ack_ts, ?4), read_ts = COALESCE(read_ts, ?4)
             WHERE message_id = ?1 AND agent_name = ?2
               AND message_id IN (SELECT id FROM messages WHERE project_id = ?3)",
            params![message_id, agent, project_id, ts(now)],
        )?;
        Ok(updated > 0)
    }

    /// Full-text search over subject and body; FTS5 grammar (phrases,
    /// `prefix*`, AND/OR/NOT). Matches are ordered newest-first.
    pub fn search(&self, project_id: i64, query: &str, limit: usize) -> Result<Vec<Message>> {
        let conn = self.conn.lock();
        let limit = if limit == 0 { 20 } else { limit } as i64;
        let mut stmt = conn.prepare(
            "SELECT m.id, m.project_id, m.thread_id, m.subject, m.body_md, m.from_agent,
                    m.created_ts, m.importance, m.ack_required, m.kind, m.overseer
             FROM fts_messages f
             JOIN messages m ON m.id = f.message_id
             WHERE m.project_id = ?1 AND fts_messages MATCH ?2
             ORDER BY m.created_ts DESC, m.id DESC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![project_id, query, limit], row_to_message)
            .map_err(|_| MailroomError::invalid_argument("query", "invalid search syntax"))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(
                row.map_err(|_| MailroomError::invalid_argument("query", "invalid search syntax"))?,
            );
        }
        Ok(out)
    }

    /// Do two agents appear (as sender or recipient) in any common thread?
    /// Contact-request notifications do not count; otherwise the
    /// notification itself would satisfy the `auto` policy on retry.
    pub fn agents_share_thread(&self, project_id: i64, a: &str, b: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM
                   (SELECT DISTINCT m.thread_id FROM messages m
                    LEFT JOIN message_recipients r ON r.message_id = m.id
                    WHERE m.project_id = ?1 AND m.kind = 'normal'
                      AND (m.from_agent = ?2 OR r.agent_name = ?2)) ta
                 JOIN
                   (SELECT DISTINCT m.thread_id FROM messages m
                    LEFT JOIN message_recipients r ON r.message_id = m.id
                    WHERE m.project_id = ?1 AND m.kind = 'normal'
                      AND (m.from_agent = ?3 OR r.agent_name = ?3)) tb
                 ON ta.thread_id = tb.thread_id
                 LIMIT 1",
                params![project_id, a, b],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    // ------------------------------------------------------------------
    // Claims
    // ------------------------------------------------------------------

    pub fn insert_claim(&self, claim: &Claim) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO claims (id, project_id, agent_name, path, exclusive, reason, created_ts, expires_ts, released_ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                claim.id,
                claim.project_id,
                claim.agent_name,
                claim.path,
                claim.exclusive as i64,
                claim.reason,
                ts(claim.created_ts),
                ts(claim.expires_ts),
                claim.released_ts.map(ts),
            ],
        )?;
        Ok(())
    }

    pub fn restore_claim(&self, claim: &Claim) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO claims (id, project_id, agent_name, path, exclusive, reason, created_ts, expires_ts, released_ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET expires_ts = excluded.expires_ts, released_ts = excluded.released_ts",
            params![
                claim.id,
                claim.project_id,
                claim.agent_name,
                claim.path,
                claim.exclusive as i64,
                claim.reason,
                ts(claim.created_ts),
                ts(claim.expires_ts),
                claim.released_ts.map(ts),
            ],
        )?;
        Ok(())
    }

    /// The lazy sweep: mark expired-but-unreleased rows as released at
    /// `now`. Returns the rows that were swept so the archive records can
    /// be updated in the same operation.
    pub fn sweep_expired(&self, project_id: i64, now: DateTime<Utc>) -> Result<Vec<Claim>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{CLAIM_SELECT} WHERE project_id = ?1 AND released_ts IS NULL AND expires_ts < ?2"
        ))?;
        let expired: Vec<Claim> = stmt
            .query_map(params![project_id, ts(now)], row_to_claim)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        if !expired.is_empty() {
            conn.execute(
                "UPDATE claims SET released_ts = ?2
                 WHERE project_id = ?1 AND released_ts IS NULL AND expires_ts < ?2",
                params![project_id, ts(now)],
            )?;
            debug!(project_id, swept = expired.len(), "expired claims swept");
        }
        Ok(expired
            .into_iter()
            .map(|c| Claim {
                released_ts: Some(now),
                ..c
            })
            .collect())
    }

    pub fn active_claims(&self, project_id: i64, now: DateTime<Utc>) -> Result<Vec<Claim>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{CLAIM_SELECT} WHERE project_id = ?1 AND released_ts IS NULL AND expires_ts > ?2
             ORDER BY created_ts, id"
        ))?;
        let rows = stmt.query_map(params![project_id, ts(now)], row_to_claim)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn active_claims_for_agent(
        &self,
        project_id: i64,
        agent: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Claim>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{CLAIM_SELECT} WHERE project_id = ?1 AND agent_name = ?2
               AND released_ts IS NULL AND expires_ts > ?3
             ORDER BY created_ts, id"
        ))?;
        let rows = stmt.query_map(params![project_id, agent, ts(now)], row_to_claim)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn all_claims(&self, project_id: i64) -> Result<Vec<Claim>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{CLAIM_SELECT} WHERE project_id = ?1 ORDER BY created_ts, id"
        ))?;
        let rows = stmt.query_map(params![project_id], row_to_claim)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Extend the caller's active claims (optionally restricted to `paths`)
    /// by `extend` — never shortening — and return the updated rows.
    pub fn renew_claims(
        &self,
        project_id: i64,
        agent: &str,
        extend: Duration,
        paths: Option<&[String]>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Claim>> {
        let active = self.active_claims_for_agent(project_id, agent, now)?;
        let conn = self.conn.lock();
        let mut renewed = Vec::new();
        for claim in active {
            if let Some(filter) = paths {
                if !filter.iter().any(|p| p == &claim.path) {
                    continue;
                }
            }
            let new_expires = claim.expires_ts + extend;
            conn.execute(
                "UPDATE claims SET expires_ts = ?2 WHERE id = ?1",
                params![claim.id, ts(new_expires)],
            )?;
            renewed.push(Claim {
                expires_ts: new_expires,
                ..claim
            });
        }
        Ok(renewed)
    }

    /// Release the caller's active claims (optionally restricted to
    /// `paths`) and return the released rows.
    pub fn release_claims(
        &self,
        project_id: i64,
        agent: &str,
        paths: Option<&[String]>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Claim>> {
        let active = self.active_claims_for_agent(project_id, agent, now)?;
        let conn = self.conn.lock();
        let mut released = Vec::new();
        for claim in active {
            if let Some(filter) = paths {
                if !filter.iter().any(|p| p == &claim.path) {
                    continue;
                }
            }
            conn.execute(
                "UPDATE claims SET released_ts = ?2 WHERE id = ?1",
                params![claim.id, ts(now)],
            )?;
            released.push(Claim {
                released_ts: Some(now),
                ..claim
            });
        }
        Ok(released)
    }

    // ------------------------------------------------------------------
    // Contact requests
    // ------------------------------------------------------------------

    pub fn contact(&self, project_id: i64, from: &str, to: &str) -> Result<Option<ContactRequest>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("{CONTACT_SELECT} WHERE project_id = ?1 AND from_agent = ?2 AND to_agent = ?3"),
            params![project_id, from, to],
            row_to_contact,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Create a pending request if none exists; an existing row (any state)
    /// is left untouched. Returns the current row.
    pub fn upsert_contact_pending(
        &self,
        project_id: i64,
        from: &str,
        to: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<ContactRequest> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO contact_requests (project_id, from_agent, to_agent, reason, state, created_ts)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5)
             ON CONFLICT(project_id, from_agent, to_agent) DO NOTHING",
            params![project_id, from, to, reason, ts(now)],
        )?;
        conn.query_row(
            &format!("{CONTACT_SELECT} WHERE project_id = ?1 AND from_agent = ?2 AND to_agent = ?3"),
            params![project_id, from, to],
            row_to_contact,
        )
        .map_err(Into::into)
    }

    /// The target decides a pending request; returns the updated row, or
    /// `None` when no request from `from` exists.
    pub fn decide_contact(
        &self,
        project_id: i64,
        from: &str,
        to: &str,
        accept: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<ContactRequest>> {
        let state = if accept {
            ContactState::Accepted
        } else {
            ContactState::Rejected
        };
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE contact_requests SET state = ?4, decided_ts = ?5
             WHERE project_id = ?1 AND from_agent = ?2 AND to_agent = ?3",
            params![project_id, from, to, state.as_str(), ts(now)],
        )?;
        if updated == 0 {
            return Ok(None);
        }
        conn.query_row(
            &format!("{CONTACT_SELECT} WHERE project_id = ?1 AND from_agent = ?2 AND to_agent = ?3"),
            params![project_id, from, to],
            row_to_contact,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn contact_accepted(&self, project_id: i64, from: &str, to: &str) -> Result<bool> {
        Ok(self
            .contact(project_id, from, to)?
            .is_some_and(|c| c.state == ContactState::Accepted))
    }

    pub fn contact_accepted_between(&self, project_id: i64, a: &str, b: &str) -> Result<bool> {
        Ok(self.contact_accepted(project_id, a, b)? || self.contact_accepted(project_id, b, a)?)
    }

    pub fn contacts_for(&self, project_id: i64, agent: &str) -> Result<Vec<ContactRequest>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{CONTACT_SELECT} WHERE project_id = ?1 AND (from_agent = ?2 OR to_agent = ?2)
             ORDER BY created_ts"
        ))?;
        let rows = stmt.query_map(params![project_id, agent], row_to_contact)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    // ------------------------------------------------------------------
    // Agent links
    // ------------------------------------------------------------------

    pub fn link(
        &self,
        from_project_id: i64,
        from_agent: &str,
        to_project_id: i64,
        to_agent: &str,
    ) -> Result<Option<AgentLink>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "{LINK_SELECT} WHERE from_project_id = ?1 AND from_agent = ?2
                   AND to_project_id = ?3 AND to_agent = ?4"
            ),
            params![from_project_id, from_agent, to_project_id, to_agent],
            row_to_link,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Create a pending directed link if absent; returns the current row.
    pub fn upsert_link_pending(
        &self,
        from_project_id: i64,
        from_agent: &str,
        to_project_id: i64,
        to_agent: &str,
        now: DateTime<Utc>,
    ) -> Result<AgentLink> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO agent_links (from_project_id, from_agent, to_project_id, to_agent, state, created_ts)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5)
             ON CONFLICT(from_project_id, from_agent, to_project_id, to_agent) DO NOTHING",
            params![from_project_id, from_agent, to_project_id, to_agent, ts(now)],
        )?;
        conn.query_row(
            &format!(
                "{LINK_SELECT} WHERE from_project_id = ?1 AND from_agent = ?2
                   AND to_project_id = ?3 AND to_agent = ?4"
            ),
            params![from_project_id, from_agent, to_project_id, to_agent],
            row_to_link,
        )
        .map_err(Into::into)
    }

    /// Force a directed link into a state, creating the row if needed.
    pub fn set_link_state(
        &self,
        from_project_id: i64,
        from_agent: &str,
        to_project_id: i64,
        to_agent: &str,
        state: LinkState,
        now: DateTime<Utc>,
    ) -> Result<AgentLink> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO agent_links (from_project_id, from_agent, to_project_id, to_agent, state, created_ts, decided_ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(from_project_id, from_agent, to_project_id, to_agent)
             DO UPDATE SET state = excluded.state, decided_ts = excluded.decided_ts",
            params![from_project_id, from_agent, to_project_id, to_agent, state.as_str(), ts(now)],
        )?;
        conn.query_row(
            &format!(
                "{LINK_SELECT} WHERE from_project_id = ?1 AND from_agent = ?2
                   AND to_project_id = ?3 AND to_agent = ?4"
            ),
            params![from_project_id, from_agent, to_project_id, to_agent],
            row_to_link,
        )
        .map_err(Into::into)
    }

    /// Cross-project traffic requires both directions accepted.
    pub fn link_accepted_both(
        &self,
        a_project_id: i64,
        a_agent: &str,
        b_project_id: i64,
        b_agent: &str,
    ) -> Result<bool> {
        let forward = self.link(a_project_id, a_agent, b_project_id, b_agent)?;
        let reverse = self.link(b_project_id, b_agent, a_project_id, a_agent)?;
        Ok(forward.is_some_and(|l| l.state == LinkState::Accepted)
            && reverse.is_some_and(|l| l.state == LinkState::Accepted))
    }
}

const MESSAGE_SELECT: &str = "SELECT id, project_id, thread_id, subject, body_md, from_agent, created_ts, importance, ack_required, kind, overseer FROM messages";
const CLAIM_SELECT: &str = "SELECT id, project_id, agent_name, path, exclusive, reason, created_ts, expires_ts, released_ts FROM claims";
const CONTACT_SELECT: &str = "SELECT project_id, from_agent, to_agent, reason, state, created_ts, decided_ts FROM contact_requests";
const LINK_SELECT: &str = "SELECT from_project_id, from_agent, to_project_id, to_agent, state, created_ts, decided_ts FROM agent_links";

fn get_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("invalid timestamp '{raw}'").into(),
        )
    })
}

fn get_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    Ok(raw.as_deref().and_then(parse_ts))
}

fn row_to_project(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        slug: row.get(1)?,
        human_key: row.get(2)?,
        created_ts: get_ts(row, 3)?,
    })
}

fn row_to_agent(row: &Row<'_>) -> rusqlite::Result<Agent> {
    let policy: String = row.get(8)?;
    Ok(Agent {
        id: row.get(0)?,
        project_id: row.get(1)?,
        name: row.get(2)?,
        program: row.get(3)?,
        model: row.get(4)?,
        task_description: row.get(5)?,
        inception_ts: get_ts(row, 6)?,
        last_active_ts: get_ts(row, 7)?,
        contact_policy: ContactPolicy::parse(&policy).unwrap_or_default(),
    })
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let importance: String = row.get(7)?;
    let kind: String = row.get(9)?;
    Ok(Message {
        id: row.get(0)?,
        project_id: row.get(1)?,
        thread_id: row.get(2)?,
        subject: row.get(3)?,
        body_md: row.get(4)?,
        from_agent: row.get(5)?,
        created_ts: get_ts(row, 6)?,
        importance: Importance::parse(&importance).unwrap_or_default(),
        ack_required: row.get::<_, i64>(8)? != 0,
        kind: MessageKind::parse(&kind).unwrap_or_default(),
        overseer: row.get::<_, i64>(10)? != 0,
    })
}

fn row_to_recipient(row: &Row<'_>) -> rusqlite::Result<Recipient> {
    row_to_recipient_at(row, 0)
}

fn row_to_recipient_at(row: &Row<'_>, base: usize) -> rusqlite::Result<Recipient> {
    let kind: String = row.get(base + 2)?;
    Ok(Recipient {
        message_id: row.get(base)?,
        agent_name: row.get(base + 1)?,
        kind: RecipientKind::parse(&kind).unwrap_or_default(),
        read_ts: get_opt_ts(row, base + 3)?,
        ack_ts: get_opt_ts(row, base + 4)?,
    })
}

fn row_to_claim(row: &Row<'_>) -> rusqlite::Result<Claim> {
    Ok(Claim {
        id: row.get(0)?,
        project_id: row.get(1)?,
        agent_name: row.get(2)?,
        path: row.get(3)?,
        exclusive: row.get::<_, i64>(4)? != 0,
        reason: row.get(5)?,
        created_ts: get_ts(row, 6)?,
        expires_ts: get_ts(row, 7)?,
        released_ts: get_opt_ts(row, 8)?,
    })
}

fn row_to_contact(row: &Row<'_>) -> rusqlite::Result<ContactRequest> {
    let state: String = row.get(4)?;
    Ok(ContactRequest {
        project_id: row.get(0)?,
        from_agent: row.get(1)?,
        to_agent: row.get(2)?,
        reason: row.get(3)?,
        state: ContactState::parse(&state).unwrap_or_default(),
        created_ts: get_ts(row, 5)?,
        decided_ts: get_opt_ts(row, 6)?,
    })
}

fn row_to_link(row: &Row<'_>) -> rusqlite::Result<AgentLink> {
    let state: String = row.get(4)?;
    Ok(AgentLink {
        from_project_id: row.get(0)?,
        from_agent: row.get(1)?,
        to_project_id: row.get(2)?,
        to_agent: row.get(3)?,
        state: LinkState::parse(&state).unwrap_or_default(),
        created_ts: get_ts(row, 5)?,
        decided_ts: get_opt_ts(row, 6)?,
    })
}

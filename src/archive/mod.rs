//! The Archive: one git repository per project holding markdown messages,
//! agent profiles, and claim records as committed files.
//!
//! This is the sole durable truth. Every mutating operation stages its
//! files and makes exactly one commit with a deterministic author identity
//! and a subject line describing the operation. The Index can always be
//! reconstructed from the committed tree alone.

pub mod frontmatter;
pub mod lock;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Utc};
use git2::{Repository, Signature};
use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::Result;
use crate::model::{parse_ts, ts, Agent, Claim, ContactPolicy, Message, Recipient};
use crate::naming::sha1_hex;

pub use frontmatter::Frontmatter;
pub use lock::ArchiveLock;

const GITATTRIBUTES: &str = "*.json text\n*.md text\n";

/// Project metadata kept in the archive so `rebuild-index` can restore the
/// project row without the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub slug: String,
    pub human_key: String,
    pub created: String,
}

/// Agent profile file, `agents/<Name>/profile.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub name: String,
    pub program: String,
    pub model: String,
    pub task_description: String,
    pub inception: String,
    pub last_active: String,
    pub contact_policy: ContactPolicy,
}

impl AgentProfile {
    pub fn from_agent(agent: &Agent) -> Self {
        Self {
            name: agent.name.clone(),
            program: agent.program.clone(),
            model: agent.model.clone(),
            task_description: agent.task_description.clone(),
            inception: ts(agent.inception_ts),
            last_active: ts(agent.last_active_ts),
            contact_policy: agent.contact_policy,
        }
    }

    pub fn into_agent(self, project_id: i64) -> Option<Agent> {
        Some(Agent {
            id: 0,
            project_id,
            name: self.name,
            program: self.program,
            model: self.model,
            task_description: self.task_description,
            inception_ts: parse_ts(&self.inception)?,
            last_active_ts: parse_ts(&self.last_active)?,
            contact_policy: self.contact_policy,
        })
    }
}

/// Claim record file, `claims/<sha1(path)>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub id: String,
    pub agent: String,
    pub path: String,
    pub exclusive: bool,
    pub reason: String,
    pub created: String,
    pub expires: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub released: Option<String>,
}

impl ClaimRecord {
    pub fn from_claim(claim: &Claim) -> Self {
        Self {
            id: claim.id.clone(),
            agent: claim.agent_name.clone(),
            path: claim.path.clone(),
            exclusive: claim.exclusive,
            reason: claim.reason.clone(),
            created: ts(claim.created_ts),
            expires: ts(claim.expires_ts),
            released: claim.released_ts.map(ts),
        }
    }

    pub fn into_claim(self, project_id: i64) -> Option<Claim> {
        Some(Claim {
            id: self.id,
            project_id,
            agent_name: self.agent,
            path: self.path,
            exclusive: self.exclusive,
            reason: self.reason,
            created_ts: parse_ts(&self.created)?,
            expires_ts: parse_ts(&self.expires)?,
            released_ts: match self.released {
                Some(raw) => Some(parse_ts(&raw)?),
                None => None,
            },
        })
    }
}

pub struct ProjectArchive {
    slug: String,
    root: PathBuf,
    repo: Repository,
    author_name: String,
    author_email: String,
}

impl ProjectArchive {
    /// Open the project's repository, initializing it on first use.
    pub fn ensure(
        repo_dir: &Path,
        slug: &str,
        human_key: &str,
        created_ts: DateTime<Utc>,
        author_name: &str,
        author_email: &str,
    ) -> Result<Self> {
        std::fs::create_dir_all(repo_dir)?;
        let (repo, fresh) = if repo_dir.join(".git").exists() {
            (Repository::open(repo_dir)?, false)
        } else {
            (Repository::init(repo_dir)?, true)
        };

        let archive = Self {
            slug: slug.to_string(),
            root: repo_dir.to_path_buf(),
            repo,
            author_name: author_name.to_string(),
            author_email: author_email.to_string(),
        };

        if fresh {
            archive.repo.config()?.set_bool("commit.gpgsign", false)?;
            std::fs::write(archive.root.join(".gitattributes"), GITATTRIBUTES)?;
            let record = ProjectRecord {
                slug: slug.to_string(),
                human_key: human_key.to_string(),
                created: ts(created_ts),
            };
            archive.write_json(Path::new("project.json"), &record)?;
            archive.commit(
                "chore: initialize archive",
                &[PathBuf::from(".gitattributes"), PathBuf::from("project.json")],
            )?;
            debug!(slug, "archive initialized");
        }
        Ok(archive)
    }

    /// Open an existing archive without creating anything.
    pub fn open(repo_dir: &Path, author_name: &str, author_email: &str) -> Result<Self> {
        let repo = Repository::open(repo_dir)?;
        let record = Self::read_project_record(repo_dir)?;
        Ok(Self {
            slug: record.slug,
            root: repo_dir.to_path_buf(),
            repo,
            author_name: author_name.to_string(),
            author_email: author_email.to_string(),
        })
    }

    pub fn read_project_record(repo_dir: &Path) -> Result<ProjectRecord> {
        let raw = std::fs::read_to_string(repo_dir.join("project.json"))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(".archive.lock")
    }

    // ------------------------------------------------------------------
    // Writes (one commit each)
    // ------------------------------------------------------------------

    pub fn write_agent_profile(&self, agent: &Agent, fresh: bool) -> Result<()> {
        let rel = Path::new("agents").join(&agent.name).join("profile.json");
        self.write_json(&rel, &AgentProfile::from_agent(agent))?;
        let verb = if fresh { "create" } else { "update" };
        self.commit(&format!("agent: {verb} {}", agent.name), &[rel])?;
        Ok(())
    }

    /// Canonical message file plus sender outbox and per-recipient inbox
    /// copies, in a single commit.
    pub fn write_message_bundle(
        &self,
        message: &Message,
        recipients: &[Recipient],
    ) -> Result<()> {
        let front = Frontmatter::from_message(message, &self.slug, recipients);
        let content = frontmatter::render(&front, &message.body_md)?;
        let filename = format!("{}.md", message.id);
        let (year, month) = year_month(message.created_ts);

        let mut rel_paths = Vec::with_capacity(recipients.len() + 2);
        let canonical = Path::new("messages").join(&year).join(&month).join(&filename);
        rel_paths.push(canonical);
        rel_paths.push(mailbox_rel(&message.from_agent, "outbox", &year, &month, &filename));
        for recipient in recipients {
            rel_paths.push(mailbox_rel(&recipient.agent_name, "inbox", &year, &month, &filename));
        }

        for rel in &rel_paths {
            self.write_text(rel, &content)?;
        }

        let to_list: Vec<&str> = recipients.iter().map(|r| r.agent_name.as_str()).collect();
        let subject = format!(
            "mail: {} -> {} | {}",
            message.from_agent,
            to_list.join(", "),
            message.subject
        );
        self.commit(&subject, &rel_paths)?;
        Ok(())
    }

    /// Write claim records and commit them under one subject.
    pub fn write_claim_records(&self, claims: &[Claim], commit_subject: &str) -> Result<()> {
        if claims.is_empty() {
            return Ok(());
        }
        let mut rel_paths = Vec::with_capacity(claims.len());
        for claim in claims {
            let rel = Path::new("claims").join(format!("{}.json", sha1_hex(&claim.path)));
            self.write_json(&rel, &ClaimRecord::from_claim(claim))?;
            rel_paths.push(rel);
        }
        self.commit(commit_subject, &rel_paths)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Rebuild scans
    // ------------------------------------------------------------------

    /// All canonical messages, parsed from their frontmatter files.
    pub fn scan_messages(&self, project_id: i64) -> Result<Vec<(Message, Vec<Recipient>)>> {
        let dir = self.root.join("messages");
        let mut out = Vec::new();
        if !dir.exists() {
            return Ok(out);
        }
        for entry in WalkDir::new(&dir).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file()
                || entry.path().extension().and_then(|e| e.to_str()) != Some("md")
            {
                continue;
            }
            let raw = std::fs::read_to_string(entry.path())?;
            let (front, body) = frontmatter::parse(&raw)?;
            out.push(front.into_records(project_id, body)?);
        }
        out.sort_by(|a, b| (a.0.created_ts, &a.0.id).cmp(&(b.0.created_ts, &b.0.id)));
        Ok(out)
    }

    pub fn scan_agents(&self, project_id: i64) -> Result<Vec<Agent>> {
        let dir = self.root.join("agents");
        let mut out = Vec::new();
        if !dir.exists() {
            return Ok(out);
        }
        for entry in std::fs::read_dir(&dir)? {
            let profile_path = entry?.path().join("profile.json");
            if !profile_path.exists() {
                continue;
            }
            let raw = std::fs::read_to_string(&profile_path)?;
            let profile: AgentProfile = serde_json::from_str(&raw)?;
            if let Some(agent) = profile.into_agent(project_id) {
                out.push(agent);
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    pub fn scan_claims(&self, project_id: i64) -> Result<Vec<Claim>> {
        let dir = self.root.join("claims");
        let mut out = Vec::new();
        if !dir.exists() {
            return Ok(out);
        }
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = std::fs::read_to_string(&path)?;
            let record: ClaimRecord = serde_json::from_str(&raw)?;
            if let Some(claim) = record.into_claim(project_id) {
                out.push(claim);
            }
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn write_text(&self, rel: &Path, content: &str) -> Result<()> {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    fn write_json<T: Serialize>(&self, rel: &Path, value: &T) -> Result<()> {
        let mut rendered = serde_json::to_string_pretty(value)?;
        rendered.push('\n');
        self.write_text(rel, &rendered)
    }

    fn commit(&self, subject: &str, rel_paths: &[PathBuf]) -> Result<()> {
        let mut index = self.repo.index()?;
        for rel in rel_paths {
            index.add_path(rel)?;
        }
        index.write()?;
        let tree_id = index.write_tree()?;
        let tree = self.repo.find_tree(tree_id)?;
        let signature = Signature::now(&self.author_name, &self.author_email)?;
        let parent = self
            .repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok());
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        self.repo
            .commit(Some("HEAD"), &signature, &signature, subject, &tree, &parents)?;
        debug!(slug = %self.slug, subject, files = rel_paths.len(), "archive commit");
        Ok(())
    }
}

fn year_month(dt: DateTime<Utc>) -> (String, String) {
    (format!("{:04}", dt.year()), format!("{:02}", dt.month()))
}

fn mailbox_rel(agent: &str, boxname: &str, year: &str, month: &str, filename: &str) -> PathBuf {
    Path::new("agents")
        .join(agent)
        .join(boxname)
        .join(year)
        .join(month)
        .join(filename)
}

/// Subject line for a reservation commit.
pub fn claim_commit_subject(agent: &str, exclusive: bool, count: usize) -> String {
    let mode = if exclusive { "exclusive" } else { "shared" };
    format!("claim: {agent} {mode} {count} path(s)")
}

/// Subject line for a release commit.
pub fn release_commit_subject(agent: &str, count: usize) -> String {
    format!("claim: release {agent} {count} path(s)")
}

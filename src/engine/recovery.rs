//! Index↔Archive reconciliation.
//!
//! The archive is the truth; these passes replay committed state into the
//! index. `reconcile` restores rows lost to a crash between commit and
//! index write, `rebuild` reconstructs the whole index from scratch.

use chrono::Utc;
use tracing::{info, warn};

use crate::archive::ProjectArchive;
use crate::config::Settings;
use crate::error::Result;
use crate::index::IndexStore;

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RebuildReport {
    pub projects: usize,
    pub agents: usize,
    pub messages: usize,
    pub claims: usize,
}

/// Replay any archive state missing from the index, across all projects
/// found on disk. Runs before the server accepts traffic and after a
/// detected mismatch.
pub fn reconcile(settings: &Settings, index: &IndexStore) -> Result<RebuildReport> {
    let mut report = RebuildReport::default();
    for repo_dir in project_repo_dirs(settings)? {
        let record = match ProjectArchive::read_project_record(&repo_dir) {
            Ok(record) => record,
            Err(err) => {
                warn!(dir = %repo_dir.display(), error = %err, "skipping unreadable project archive");
                continue;
            }
        };
        let created = crate::model::parse_ts(&record.created).unwrap_or_else(Utc::now);
        let project = index.upsert_project(&record.slug, &record.human_key, created)?;
        report.projects += 1;

        let archive = ProjectArchive::open(
            &repo_dir,
            &settings.storage.git_author_name,
            &settings.storage.git_author_email,
        )?;

        for agent in archive.scan_agents(project.id)? {
            if index.agent(project.id, &agent.name)?.is_none() {
                index.restore_agent(project.id, &agent)?;
                report.agents += 1;
            }
        }

        let known = index.message_ids(project.id)?;
        for (message, recipients) in archive.scan_messages(project.id)? {
            if known.contains(&message.id) {
                continue;
            }
            if index.restore_message(&message, &recipients)? {
                report.messages += 1;
            }
        }

        let existing_claims: std::collections::HashSet<String> = index
            .all_claims(project.id)?
            .into_iter()
            .map(|c| c.id)
            .collect();
        for claim in archive.scan_claims(project.id)? {
            if !existing_claims.contains(&claim.id) {
                index.restore_claim(&claim)?;
                report.claims += 1;
            }
        }
    }
    if report.messages > 0 || report.agents > 0 || report.claims > 0 {
        info!(
            messages = report.messages,
            agents = report.agents,
            claims = report.claims,
            "reconciled archive state into index"
        );
    }
    Ok(report)
}

/// Reconstruct the entire index from the archives alone.
pub fn rebuild(settings: &Settings, index: &IndexStore) -> Result<RebuildReport> {
    index.wipe()?;
    let mut report = RebuildReport::default();
    for repo_dir in project_repo_dirs(settings)? {
        let record = ProjectArchive::read_project_record(&repo_dir)?;
        let created = crate::model::parse_ts(&record.created).unwrap_or_else(Utc::now);
        let project = index.upsert_project(&record.slug, &record.human_key, created)?;
        report.projects += 1;

        let archive = ProjectArchive::open(
            &repo_dir,
            &settings.storage.git_author_name,
            &settings.storage.git_author_email,
        )?;
        for agent in archive.scan_agents(project.id)? {
            index.restore_agent(project.id, &agent)?;
            report.agents += 1;
        }
        for (message, recipients) in archive.scan_messages(project.id)? {
            if index.restore_message(&message, &recipients)? {
                report.messages += 1;
            }
        }
        for claim in archive.scan_claims(project.id)? {
            index.restore_claim(&claim)?;
            report.claims += 1;
        }
    }
    info!(
        projects = report.projects,
        messages = report.messages,
        "index rebuilt from archive"
    );
    Ok(report)
}

fn project_repo_dirs(settings: &Settings) -> Result<Vec<std::path::PathBuf>> {
    let projects_dir = settings.projects_dir();
    let mut dirs = Vec::new();
    if !projects_dir.exists() {
        return Ok(dirs);
    }
    for entry in std::fs::read_dir(&projects_dir)? {
        let repo_dir = entry?.path().join("repo");
        if repo_dir.join(".git").exists() {
            dirs.push(repo_dir);
        }
    }
    dirs.sort();
    Ok(dirs)
}

//! Identity registry operations: projects and agents.
//!
//! These run inside the engine's per-project critical section; each writes
//! the archive first, then mirrors into the index.

use chrono::{DateTime, Duration, Utc};

use crate::archive::ProjectArchive;
use crate::config::Settings;
use crate::error::Result;
use crate::index::IndexStore;
use crate::model::{Agent, Project};
use crate::naming;

/// Agents count as active for seven days after their last call.
pub const ACTIVE_WINDOW_DAYS: i64 = 7;

#[derive(Debug, Clone)]
pub struct RegisterSpec {
    pub program: String,
    pub model: String,
    pub name_hint: Option<String>,
    pub task_description: String,
}

/// Create the project on first use; idempotent ever after.
pub fn ensure_project(
    settings: &Settings,
    index: &IndexStore,
    human_key: &str,
    now: DateTime<Utc>,
) -> Result<Project> {
    let slug = naming::slugify(human_key);
    ProjectArchive::ensure(
        &settings.project_repo_dir(&slug),
        &slug,
        human_key,
        now,
        &settings.storage.git_author_name,
        &settings.storage.git_author_email,
    )?;
    index.upsert_project(&slug, human_key, now)
}

/// Register an agent, or refresh an existing one.
///
/// Re-registering an existing name updates the mutable fields (program,
/// model, task, last_active) and recommits the profile; a free name hint is
/// honored, an unusable one falls back to the generator.
pub fn register_agent(
    index: &IndexStore,
    archive: &ProjectArchive,
    project: &Project,
    spec: &RegisterSpec,
    now: DateTime<Utc>,
) -> Result<Agent> {
    let hint = spec.name_hint.as_deref();
    let existing_hint = hint
        .and_then(naming::sanitize_agent_name)
        .and_then(|name| index.agent(project.id, &name).transpose())
        .transpose()?;

    let (name, fresh) = match existing_hint {
        Some(agent) => (agent.name, false),
        None => {
            let taken = index.agent_names_lower(project.id)?;
            (naming::unique_agent_name(&taken, hint), true)
        }
    };

    let agent = index.upsert_agent(
        project.id,
        &name,
        &spec.program,
        &spec.model,
        &spec.task_description,
        now,
    )?;
    archive.write_agent_profile(&agent, fresh)?;
    Ok(agent)
}

/// The floor timestamp for "active" agent listings.
pub fn active_floor(now: DateTime<Utc>) -> DateTime<Utc> {
    now - Duration::days(ACTIVE_WINDOW_DAYS)
}

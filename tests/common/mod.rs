//! Shared fixtures for the integration suites.
#![allow(dead_code)]

use std::sync::Arc;

use mailroom::engine::Engine;
use mailroom::{RegisterSpec, Settings};
use tempfile::TempDir;

/// Engine with contact enforcement off: the plain coordination flows.
pub fn test_engine() -> (TempDir, Arc<Engine>) {
    let dir = TempDir::new().expect("tempdir");
    let mut settings = Settings::for_storage_root(dir.path());
    settings.contact_enforcement_enabled = false;
    let engine = Engine::new(settings).expect("engine");
    (dir, Arc::new(engine))
}

/// Engine with contact enforcement on, for the policy suites.
pub fn policy_engine() -> (TempDir, Arc<Engine>) {
    let dir = TempDir::new().expect("tempdir");
    let settings = Settings::for_storage_root(dir.path());
    let engine = Engine::new(settings).expect("engine");
    (dir, Arc::new(engine))
}

pub fn spec(name: &str) -> RegisterSpec {
    RegisterSpec {
        program: "claude-code".into(),
        model: "test-model".into(),
        name_hint: Some(name.into()),
        task_description: format!("{name}'s task"),
    }
}

/// Register a named agent in a project, creating the project if needed.
pub async fn register(engine: &Engine, project_key: &str, name: &str) -> mailroom::Agent {
    engine
        .ensure_project(project_key, None)
        .await
        .expect("ensure_project");
    engine
        .register_agent(project_key, spec(name), None)
        .await
        .expect("register_agent")
}

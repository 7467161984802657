//! Read-only resource URIs served over MCP `resources/read`.

use serde_json::{json, Value};

use crate::engine::{Engine, InboxQuery};
use crate::error::{MailroomError, Result};

pub const RESOURCE_PREFIX: &str = "resource://";

/// Static descriptors for `resources/list`.
pub fn catalog() -> Vec<Value> {
    [
        ("resource://projects", "All registered projects"),
        ("resource://project/{key}", "One project by key or slug"),
        ("resource://agents/{key}", "Agents of a project"),
        ("resource://inbox/{key}/{agent}", "An agent's inbox"),
        ("resource://outbox/{key}/{agent}", "An agent's outbox"),
        ("resource://message/{id}", "One message by id"),
        (
            "resource://claims/{key}?active_only=true",
            "File reservations of a project",
        ),
    ]
    .iter()
    .map(|(uri, description)| {
        json!({
            "uri": uri,
            "name": uri.trim_start_matches(RESOURCE_PREFIX),
            "description": description,
            "mimeType": "application/json",
        })
    })
    .collect()
}

/// Resolve one resource URI to its JSON payload.
pub async fn read(engine: &Engine, uri: &str) -> Result<Value> {
    let rest = uri.strip_prefix(RESOURCE_PREFIX).ok_or_else(|| bad_uri(uri))?;
    let (path, query) = match rest.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (rest, None),
    };
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match segments.as_slice() {
        ["projects"] => Ok(json!(engine.list_projects()?)),
        ["project", key] => Ok(json!(engine.get_project(key)?)),
        ["agents", key] => Ok(json!(engine.list_agents(key, false)?)),
        ["inbox", key, agent] => {
            let query = InboxQuery {
                limit: 50,
                include_bodies: false,
                ..Default::default()
            };
            Ok(json!(engine.fetch_inbox(key, agent, &query)?))
        }
        ["outbox", key, agent] => Ok(json!(engine.fetch_outbox(key, agent, false, 50)?)),
        ["message", id] => {
            let (message, recipients) = engine.find_message(id)?;
            Ok(json!({ "message": message, "recipients": recipients }))
        }
        ["claims", key] => {
            let active_only = query
                .and_then(|q| {
                    q.split('&')
                        .find_map(|pair| pair.strip_prefix("active_only="))
                })
                .map(|v| matches!(v, "true" | "1" | "yes"))
                .unwrap_or(true);
            Ok(json!(engine.list_claims(key, active_only)?))
        }
        _ => Err(bad_uri(uri)),
    }
}

fn bad_uri(uri: &str) -> MailroomError {
    MailroomError::invalid_argument("uri", format!("unknown resource '{uri}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_covers_all_resource_families() {
        let entries = catalog();
        assert_eq!(entries.len(), 7);
        assert!(entries.iter().all(|e| e
            .get("uri")
            .and_then(|u| u.as_str())
            .is_some_and(|u| u.starts_with(RESOURCE_PREFIX))));
    }
}

//! The MCP tool surface: input schemas and dispatch into the engine.
//!
//! Input types derive `JsonSchema`; `tools/list` serves the derived
//! schemas, so the wire contract and the deserializer can never drift.

use std::time::Instant;

use schemars::{schema_for, JsonSchema};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::engine::{Engine, InboxQuery, ReplyMessage, ReserveRequest, SendMessage, SendOptions};
use crate::error::{MailroomError, Result};
use crate::model::{parse_ts, ContactPolicy, Importance};
use crate::registry::RegisterSpec;

pub struct ToolDef {
    pub name: &'static str,
    pub description: &'static str,
    schema: fn() -> Value,
}

fn schema<T: JsonSchema>() -> Value {
    serde_json::to_value(schema_for!(T)).unwrap_or_else(|_| json!({ "type": "object" }))
}

fn empty_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

pub const TOOLS: &[ToolDef] = &[
    ToolDef {
        name: "ensure_project",
        description: "Create or fetch the project for a human key (absolute path or URL). Idempotent.",
        schema: schema::<EnsureProjectArgs>,
    },
    ToolDef {
        name: "register_agent",
        description: "Assume an identity in a project; re-registering the same name refreshes it.",
        schema: schema::<RegisterAgentArgs>,
    },
    ToolDef {
        name: "whois",
        description: "Fetch one agent's profile.",
        schema: schema::<WhoisArgs>,
    },
    ToolDef {
        name: "list_agents",
        description: "List a project's agents; active_only limits to the last 7 days.",
        schema: schema::<ListAgentsArgs>,
    },
    ToolDef {
        name: "set_contact_policy",
        description: "Set who may message this agent: open, auto, contacts_only, or block_all.",
        schema: schema::<SetContactPolicyArgs>,
    },
    ToolDef {
        name: "send_message",
        description: "Send markdown mail to agents; cross-project recipients use Name@project addressing.",
        schema: schema::<SendMessageArgs>,
    },
    ToolDef {
        name: "reply_message",
        description: "Reply within a thread; recipients and importance inherit from the original.",
        schema: schema::<ReplyMessageArgs>,
    },
    ToolDef {
        name: "fetch_inbox",
        description: "Poll the caller's inbox, newest first.",
        schema: schema::<FetchInboxArgs>,
    },
    ToolDef {
        name: "check_my_messages",
        description: "Alias of fetch_inbox.",
        schema: schema::<FetchInboxArgs>,
    },
    ToolDef {
        name: "fetch_outbox",
        description: "List messages the caller has sent, newest first.",
        schema: schema::<FetchOutboxArgs>,
    },
    ToolDef {
        name: "get_message",
        description: "Fetch one message with its full body and recipients.",
        schema: schema::<GetMessageArgs>,
    },
    ToolDef {
        name: "mark_read",
        description: "Record that the caller has read a message.",
        schema: schema::<MarkReadArgs>,
    },
    ToolDef {
        name: "acknowledge_message",
        description: "Acknowledge a message that requested it (implies read).",
        schema: schema::<AcknowledgeArgs>,
    },
    ToolDef {
        name: "search_messages",
        description: "Full-text search over subjects and bodies (FTS5 grammar: phrases, prefix*, AND/OR/NOT).",
        schema: schema::<SearchArgs>,
    },
    ToolDef {
        name: "summarize_thread",
        description: "Participants, counts, key points, and action items for a thread.",
        schema: schema::<SummarizeThreadArgs>,
    },
    ToolDef {
        name: "reserve_file_paths",
        description: "Take advisory leases on paths or globs; conflicting paths are reported, the rest granted.",
        schema: schema::<ReserveArgs>,
    },
    ToolDef {
        name: "renew_file_reservations",
        description: "Extend the caller's active leases.",
        schema: schema::<RenewArgs>,
    },
    ToolDef {
        name: "release_file_reservations",
        description: "Release the caller's leases (all, or the given paths).",
        schema: schema::<ReleaseArgs>,
    },
    ToolDef {
        name: "request_contact",
        description: "Ask another agent for permission to message them.",
        schema: schema::<RequestContactArgs>,
    },
    ToolDef {
        name: "respond_contact",
        description: "Accept or reject a pending contact request addressed to the caller.",
        schema: schema::<RespondContactArgs>,
    },
    ToolDef {
        name: "list_contacts",
        description: "List contact requests involving the caller.",
        schema: schema::<ListContactsArgs>,
    },
    ToolDef {
        name: "request_link",
        description: "Request a cross-project link between two agents.",
        schema: schema::<RequestLinkArgs>,
    },
    ToolDef {
        name: "respond_link",
        description: "Decide a pending cross-project link; accepting authorizes both directions.",
        schema: schema::<RespondLinkArgs>,
    },
    ToolDef {
        name: "health_check",
        description: "Server readiness information.",
        schema: empty_schema,
    },
    ToolDef {
        name: "macro_start_session",
        description: "ensure_project + register_agent (+ reserve_file_paths + fetch_inbox) in one call.",
        schema: schema::<MacroStartSessionArgs>,
    },
    ToolDef {
        name: "macro_prepare_thread",
        description: "register_agent + summarize_thread + fetch_inbox in one call.",
        schema: schema::<MacroPrepareThreadArgs>,
    },
];

pub fn catalog() -> Vec<Value> {
    TOOLS
        .iter()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.description,
                "inputSchema": (tool.schema)(),
            })
        })
        .collect()
}

// ----------------------------------------------------------------------
// Argument types
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize, JsonSchema)]
struct EnsureProjectArgs {
    /// Absolute path or URL identifying the workspace.
    human_key: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct RegisterAgentArgs {
    project_key: String,
    program: String,
    model: String,
    /// Preferred name; generated when omitted or taken.
    name: Option<String>,
    task_description: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct WhoisArgs {
    project_key: String,
    agent_name: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ListAgentsArgs {
    project_key: String,
    active_only: Option<bool>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SetContactPolicyArgs {
    project_key: String,
    agent_name: String,
    /// One of: open, auto, contacts_only, block_all.
    policy: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SendMessageArgs {
    project_key: String,
    sender_name: String,
    to: Vec<String>,
    subject: String,
    body_md: String,
    cc: Option<Vec<String>>,
    bcc: Option<Vec<String>>,
    /// One of: low, normal, high, urgent.
    importance: Option<String>,
    ack_required: Option<bool>,
    thread_id: Option<String>,
    /// Reserved for the human overseer surface; bypasses contact policy.
    overseer: Option<bool>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ReplyMessageArgs {
    project_key: String,
    message_id: String,
    sender_name: String,
    body_md: String,
    importance: Option<String>,
    ack_required: Option<bool>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct FetchInboxArgs {
    project_key: String,
    agent_name: String,
    /// RFC 3339; only messages created after this instant.
    since_ts: Option<String>,
    urgent_only: Option<bool>,
    include_bodies: Option<bool>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct FetchOutboxArgs {
    project_key: String,
    agent_name: String,
    include_bodies: Option<bool>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct GetMessageArgs {
    project_key: String,
    message_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct MarkReadArgs {
    project_key: String,
    agent_name: String,
    message_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct AcknowledgeArgs {
    project_key: String,
    agent_name: String,
    message_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SearchArgs {
    project_key: String,
    query: String,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SummarizeThreadArgs {
    project_key: String,
    thread_id: String,
    include_examples: Option<bool>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ReserveArgs {
    project_key: String,
    agent_name: String,
    /// Project-relative paths or globs (`*`, `?`, `**`).
    paths: Vec<String>,
    ttl_seconds: Option<i64>,
    exclusive: Option<bool>,
    reason: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct RenewArgs {
    project_key: String,
    agent_name: String,
    extend_seconds: i64,
    paths: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ReleaseArgs {
    project_key: String,
    agent_name: String,
    paths: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct RequestContactArgs {
    project_key: String,
    from_agent: String,
    to_agent: String,
    reason: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct RespondContactArgs {
    project_key: String,
    /// The agent answering (the request's target).
    agent_name: String,
    from_agent: String,
    accept: bool,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ListContactsArgs {
    project_key: String,
    agent_name: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct RequestLinkArgs {
    from_project_key: String,
    from_agent: String,
    to_project_key: String,
    to_agent: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct RespondLinkArgs {
    from_project_key: String,
    from_agent: String,
    to_project_key: String,
    to_agent: String,
    accept: bool,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct MacroStartSessionArgs {
    project_key: String,
    program: String,
    model: String,
    name: Option<String>,
    task_description: Option<String>,
    reserve_paths: Option<Vec<String>>,
    ttl_seconds: Option<i64>,
    exclusive: Option<bool>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct MacroPrepareThreadArgs {
    project_key: String,
    program: String,
    model: String,
    name: Option<String>,
    task_description: Option<String>,
    thread_id: String,
    include_examples: Option<bool>,
}

// ----------------------------------------------------------------------
// Dispatch
// ----------------------------------------------------------------------

fn parse_args<T: serde::de::DeserializeOwned>(args: Value) -> Result<T> {
    serde_json::from_value(args)
        .map_err(|err| MailroomError::invalid_argument("arguments", err.to_string()))
}

fn parse_importance(raw: Option<String>) -> Result<Importance> {
    match raw {
        None => Ok(Importance::Normal),
        Some(raw) => Importance::parse(&raw).ok_or_else(|| {
            MailroomError::invalid_argument(
                "importance",
                format!("'{raw}' is not one of low|normal|high|urgent"),
            )
        }),
    }
}

fn parse_opt_importance(raw: Option<String>) -> Result<Option<Importance>> {
    raw.map(|r| parse_importance(Some(r))).transpose()
}

fn parse_since(raw: Option<String>) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
    match raw {
        None => Ok(None),
        Some(raw) => parse_ts(&raw).map(Some).ok_or_else(|| {
            MailroomError::invalid_argument("since_ts", format!("'{raw}' is not RFC 3339"))
        }),
    }
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

fn register_spec(program: String, model: String, name: Option<String>, task: Option<String>) -> RegisterSpec {
    RegisterSpec {
        program,
        model,
        name_hint: name,
        task_description: task.unwrap_or_default(),
    }
}

/// Execute one tool call. Unknown names and argument errors surface as
/// `MailroomError`s which the RPC layer renders as tool failures.
pub async fn dispatch(
    engine: &Engine,
    name: &str,
    args: Value,
    deadline: Option<Instant>,
) -> Result<Value> {
    match name {
        "ensure_project" => {
            let args: EnsureProjectArgs = parse_args(args)?;
            to_value(engine.ensure_project(&args.human_key, deadline).await?)
        }
        "register_agent" => {
            let args: RegisterAgentArgs = parse_args(args)?;
            let spec = register_spec(args.program, args.model, args.name, args.task_description);
            to_value(engine.register_agent(&args.project_key, spec, deadline).await?)
        }
        "whois" => {
            let args: WhoisArgs = parse_args(args)?;
            to_value(engine.whois(&args.project_key, &args.agent_name)?)
        }
        "list_agents" => {
            let args: ListAgentsArgs = parse_args(args)?;
            to_value(engine.list_agents(&args.project_key, args.active_only.unwrap_or(false))?)
        }
        "set_contact_policy" => {
            let args: SetContactPolicyArgs = parse_args(args)?;
            let policy = ContactPolicy::parse(&args.policy).ok_or_else(|| {
                MailroomError::invalid_argument(
                    "policy",
                    format!("'{}' is not one of open|auto|contacts_only|block_all", args.policy),
                )
            })?;
            to_value(
                engine
                    .set_contact_policy(&args.project_key, &args.agent_name, policy, deadline)
                    .await?,
            )
        }
        "send_message" => {
            let args: SendMessageArgs = parse_args(args)?;
            let message = SendMessage {
                sender: args.sender_name,
                to: args.to,
                cc: args.cc.unwrap_or_default(),
                bcc: args.bcc.unwrap_or_default(),
                subject: args.subject,
                body_md: args.body_md,
                importance: parse_importance(args.importance)?,
                ack_required: args.ack_required.unwrap_or(false),
                thread_id: args.thread_id,
            };
            let options = SendOptions {
                overseer: args.overseer.unwrap_or(false),
                deadline,
            };
            to_value(engine.send_message(&args.project_key, message, options).await?)
        }
        "reply_message" => {
            let args: ReplyMessageArgs = parse_args(args)?;
            let reply = ReplyMessage {
                sender: args.sender_name,
                body_md: args.body_md,
                importance: parse_opt_importance(args.importance)?,
                ack_required: args.ack_required,
            };
            let options = SendOptions {
                overseer: false,
                deadline,
            };
            to_value(
                engine
                    .reply_message(&args.project_key, &args.message_id, reply, options)
                    .await?,
            )
        }
        "fetch_inbox" | "check_my_messages" => {
            let args: FetchInboxArgs = parse_args(args)?;
            let query = InboxQuery {
                since_ts: parse_since(args.since_ts)?,
                urgent_only: args.urgent_only.unwrap_or(false),
                include_bodies: args.include_bodies.unwrap_or(false),
                limit: args.limit.unwrap_or(50),
            };
            to_value(engine.fetch_inbox(&args.project_key, &args.agent_name, &query)?)
        }
        "fetch_outbox" => {
            let args: FetchOutboxArgs = parse_args(args)?;
            to_value(engine.fetch_outbox(
                &args.project_key,
                &args.agent_name,
                args.include_bodies.unwrap_or(false),
                args.limit.unwrap_or(50),
            )?)
        }
        "get_message" => {
            let args: GetMessageArgs = parse_args(args)?;
            let (message, recipients) = engine.get_message(&args.project_key, &args.message_id)?;
            Ok(json!({ "message": message, "recipients": recipients }))
        }
        "mark_read" => {
            let args: MarkReadArgs = parse_args(args)?;
            to_value(engine.mark_read(&args.project_key, &args.agent_name, &args.message_id)?)
        }
        "acknowledge_message" => {
            let args: AcknowledgeArgs = parse_args(args)?;
            to_value(engine.acknowledge_message(
                &args.project_key,
                &args.agent_name,
                &args.message_id,
            )?)
        }
        "search_messages" => {
            let args: SearchArgs = parse_args(args)?;
            to_value(engine.search_messages(
                &args.project_key,
                &args.query,
                args.limit.unwrap_or(20),
            )?)
        }
        "summarize_thread" => {
            let args: SummarizeThreadArgs = parse_args(args)?;
            to_value(
                engine
                    .summarize_thread(
                        &args.project_key,
                        &args.thread_id,
                        args.include_examples.unwrap_or(false),
                    )
                    .await?,
            )
        }
        "reserve_file_paths" => {
            let args: ReserveArgs = parse_args(args)?;
            let request = ReserveRequest {
                agent: args.agent_name,
                paths: args.paths,
                ttl_seconds: args.ttl_seconds,
                exclusive: args.exclusive.unwrap_or(true),
                reason: args.reason.unwrap_or_default(),
            };
            to_value(
                engine
                    .reserve_file_paths(&args.project_key, request, deadline)
                    .await?,
            )
        }
        "renew_file_reservations" => {
            let args: RenewArgs = parse_args(args)?;
            to_value(
                engine
                    .renew_file_reservations(
                        &args.project_key,
                        &args.agent_name,
                        args.extend_seconds,
                        args.paths,
                        deadline,
                    )
                    .await?,
            )
        }
        "release_file_reservations" => {
            let args: ReleaseArgs = parse_args(args)?;
            to_value(
                engine
                    .release_file_reservations(
                        &args.project_key,
                        &args.agent_name,
                        args.paths,
                        deadline,
                    )
                    .await?,
            )
        }
        "request_contact" => {
            let args: RequestContactArgs = parse_args(args)?;
            to_value(
                engine
                    .request_contact(
                        &args.project_key,
                        &args.from_agent,
                        &args.to_agent,
                        args.reason.as_deref().unwrap_or(""),
                        deadline,
                    )
                    .await?,
            )
        }
        "respond_contact" => {
            let args: RespondContactArgs = parse_args(args)?;
            to_value(
                engine
                    .respond_contact(
                        &args.project_key,
                        &args.agent_name,
                        &args.from_agent,
                        args.accept,
                        deadline,
                    )
                    .await?,
            )
        }
        "list_contacts" => {
            let args: ListContactsArgs = parse_args(args)?;
            to_value(engine.list_contacts(&args.project_key, &args.agent_name)?)
        }
        "request_link" => {
            let args: RequestLinkArgs = parse_args(args)?;
            to_value(
                engine
                    .request_link(
                        &args.from_project_key,
                        &args.from_agent,
                        &args.to_project_key,
                        &args.to_agent,
                        deadline,
                    )
                    .await?,
            )
        }
        "respond_link" => {
            let args: RespondLinkArgs = parse_args(args)?;
            to_value(
                engine
                    .respond_link(
                        &args.from_project_key,
                        &args.from_agent,
                        &args.to_project_key,
                        &args.to_agent,
                        args.accept,
                        deadline,
                    )
                    .await?,
            )
        }
        "health_check" => engine.health(),
        "macro_start_session" => {
            let args: MacroStartSessionArgs = parse_args(args)?;
            let spec = register_spec(args.program, args.model, args.name, args.task_description);
            to_value(
                engine
                    .macro_start_session(
                        &args.project_key,
                        spec,
                        args.reserve_paths,
                        args.ttl_seconds,
                        args.exclusive.unwrap_or(true),
                        deadline,
                    )
                    .await?,
            )
        }
        "macro_prepare_thread" => {
            let args: MacroPrepareThreadArgs = parse_args(args)?;
            let spec = register_spec(args.program, args.model, args.name, args.task_description);
            to_value(
                engine
                    .macro_prepare_thread(
                        &args.project_key,
                        spec,
                        &args.thread_id,
                        args.include_examples.unwrap_or(false),
                        deadline,
                    )
                    .await?,
            )
        }
        other => Err(MailroomError::invalid_argument(
            "name",
            format!("unknown tool '{other}'"),
        )),
    }
}

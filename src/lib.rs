pub mod archive;
pub mod config;
pub mod engine;
pub mod error;
pub mod index;
pub mod leases;
pub mod llm;
pub mod mailbox;
pub mod model;
pub mod naming;
pub mod policy;
pub mod registry;
pub mod server;

pub use config::Settings;
pub use engine::{
    Engine, InboxQuery, RebuildReport, ReplyMessage, ReserveRequest, SendMessage, SendOptions,
};
pub use error::{ErrorCode, MailroomError, Result};
pub use model::{
    Agent, AgentLink, Claim, ContactPolicy, ContactRequest, Importance, Message, MessageSummary,
    Project, Recipient, ReserveOutcome, SendReceipt, ThreadSummary,
};
pub use registry::RegisterSpec;

//! Domain-Specialized Agent orchestrator - Core Library
//!
//! Registers versioned agents with knowledge contracts, routes queries to
//! them by domain, checks every dispatch against governance rules and keeps
//! per-agent performance records.

pub mod agent;
pub mod batch;
pub mod cli;
pub mod error;
pub mod governance;
pub mod identity;
pub mod knowledge;
pub mod middleware;
pub mod monitoring;
pub mod orchestrator;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;
pub mod settings;
pub mod telemetry;

pub use agent::{Agent, AgentDescriptor, AgentReply, Context};
pub use error::{ErrorKind, OrchestrationError};
pub use knowledge::KnowledgeContract;
pub use orchestrator::{OrchestrationResponse, Orchestrator, QueryRequest};
pub use protocol::Protocol;
pub use registry::AgentRegistry;

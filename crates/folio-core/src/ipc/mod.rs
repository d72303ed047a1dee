//! Inter-process communication between the workspace host and the
//! evaluation agent.

mod client;
pub mod protocol;

pub use client::{AgentClient, AgentKillHandle};
pub use protocol::{
    read_message, write_message, AgentConnection, AgentEvent, AgentEventSink, AgentMessage,
    AgentRequest, AgentResponse, ModuleLoadResult, RequestEnvelope, ResponseEnvelope,
};

//! Protocol messages between the workspace host and the evaluation agent.
//!
//! Frames are 4-byte length (u32 LE) + bincode-encoded message, carried
//! over the agent process's stdio. Requests and responses are matched by
//! correlation id; events are uncorrelated and stream agent→host on the
//! same pipe.

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::compile::{
    Compilation, CompilationConfiguration, EvaluationContextId, ModuleDefinition,
    TargetCapabilityHints,
};
use crate::error::{Error, Result};
use crate::evaluating::{CapturedOutputSegment, Evaluation, EvaluationInFlight, ExceptionInfo};
use crate::graph::CellId;

/// Request sent from host to agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AgentRequest {
    /// Liveness check.
    Ping,

    /// Create a fresh evaluation context.
    InitializeContext { hints: TargetCapabilityHints },

    /// Register module definitions with a context and load any that carry
    /// host-integration hooks.
    LoadModules {
        context_id: EvaluationContextId,
        modules: Vec<ModuleDefinition>,
    },

    /// Execute one compilation. Acknowledged immediately; outcomes stream
    /// back as events.
    Evaluate {
        context_id: EvaluationContextId,
        compilation: Compilation,
    },

    /// Discard a context's submission states and module cache.
    ResetState { context_id: EvaluationContextId },

    /// Cooperatively cancel the context's in-flight evaluation.
    Interrupt { context_id: EvaluationContextId },

    /// Exit the agent process gracefully.
    Shutdown,
}

/// Per-module outcome of a load-modules request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleLoadResult {
    pub name: String,
    pub success: bool,
    /// Whether loading this module activated host-integration.
    pub initialized_integration: bool,
    pub message: Option<String>,
}

/// Response sent from agent to host, matched by correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AgentResponse {
    Pong,
    ContextInitialized {
        configuration: CompilationConfiguration,
    },
    ModulesLoaded {
        results: Vec<ModuleLoadResult>,
    },
    /// The evaluate request was accepted; watch the event stream.
    EvaluationStarted,
    StateReset,
    Interrupting,
    ShuttingDown,
    /// The request failed inside the agent.
    Error {
        message: String,
    },
}

/// Uncorrelated event streamed agent→host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AgentEvent {
    /// Phase transition for an in-flight evaluation.
    InFlight(EvaluationInFlight),
    /// The published, terminal evaluation record.
    Evaluation(Evaluation),
    /// A tagged segment of captured standard output/error.
    Output(CapturedOutputSegment),
    /// Stream-level error signal, raised in addition to the phase events
    /// when the evaluated phase recorded a failure.
    EvaluationError {
        cell_id: CellId,
        exception: ExceptionInfo,
    },
}

/// Request envelope carrying the correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub correlation_id: u64,
    pub body: AgentRequest,
}

/// Response envelope echoing the correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub correlation_id: u64,
    pub body: AgentResponse,
}

/// Any frame the agent writes on its outbound pipe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AgentMessage {
    Response(ResponseEnvelope),
    Event(AgentEvent),
}

/// Receives uncorrelated agent events on the host side.
pub trait AgentEventSink: Send + Sync {
    fn on_event(&self, event: AgentEvent);
}

/// The connection surface the workspace host drives. Implemented by the
/// process-backed [`AgentClient`](super::AgentClient) and by in-memory
/// doubles in tests.
pub trait AgentConnection: Send {
    fn initialize_context(
        &mut self,
        hints: &TargetCapabilityHints,
    ) -> Result<CompilationConfiguration>;

    fn load_modules(
        &mut self,
        context_id: EvaluationContextId,
        modules: &[ModuleDefinition],
    ) -> Result<Vec<ModuleLoadResult>>;

    fn evaluate(&mut self, context_id: EvaluationContextId, compilation: &Compilation)
        -> Result<()>;

    fn reset_state(&mut self, context_id: EvaluationContextId) -> Result<()>;

    fn interrupt(&mut self, context_id: EvaluationContextId) -> Result<()>;

    /// Subscribe to the uncorrelated event side channel.
    fn subscribe(&mut self, sink: std::sync::Arc<dyn AgentEventSink>);
}

/// Reject absurdly large frames rather than attempting the allocation.
const MAX_MESSAGE_BYTES: usize = 100 * 1024 * 1024;

/// Write a message using length-prefixed bincode encoding.
pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let bytes = bincode::serialize(message)
        .map_err(|e| Error::Serialization(format!("failed to encode message: {e}")))?;

    let len = bytes.len() as u32;
    writer
        .write_all(&len.to_le_bytes())
        .map_err(|e| Error::Ipc(format!("failed to write message length: {e}")))?;
    writer
        .write_all(&bytes)
        .map_err(|e| Error::Ipc(format!("failed to write message body: {e}")))?;
    writer
        .flush()
        .map_err(|e| Error::Ipc(format!("failed to flush message stream: {e}")))?;

    Ok(())
}

/// Read a message using length-prefixed bincode encoding.
pub fn read_message<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T> {
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .map_err(|e| Error::Ipc(format!("failed to read message length: {e}")))?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_MESSAGE_BYTES {
        return Err(Error::Ipc(format!("message too large: {len} bytes")));
    }

    let mut bytes = vec![0u8; len];
    reader
        .read_exact(&mut bytes)
        .map_err(|e| Error::Ipc(format!("failed to read message body: {e}")))?;

    bincode::deserialize(&bytes)
        .map_err(|e| Error::Serialization(format!("failed to decode message: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use uuid::Uuid;

    #[test]
    fn test_request_roundtrip() {
        let request = RequestEnvelope {
            correlation_id: 7,
            body: AgentRequest::InitializeContext {
                hints: TargetCapabilityHints {
                    host_os: "linux".to_string(),
                    request_inline_images: true,
                },
            },
        };

        let mut buf = Vec::new();
        write_message(&mut buf, &request).unwrap();

        let decoded: RequestEnvelope = read_message(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded.correlation_id, 7);
        match decoded.body {
            AgentRequest::InitializeContext { hints } => {
                assert_eq!(hints.host_os, "linux");
                assert!(hints.request_inline_images);
            }
            other => panic!("wrong request type: {other:?}"),
        }
    }

    #[test]
    fn test_event_roundtrip() {
        let cell_id = CellId::new(Uuid::new_v4());
        let event = AgentMessage::Event(AgentEvent::Output(CapturedOutputSegment {
            cell_id,
            stream: crate::evaluating::OutputStream::Stdout,
            value: "hello".to_string(),
        }));

        let mut buf = Vec::new();
        write_message(&mut buf, &event).unwrap();

        let decoded: AgentMessage = read_message(&mut Cursor::new(buf)).unwrap();
        match decoded {
            AgentMessage::Event(AgentEvent::Output(segment)) => {
                assert_eq!(segment.cell_id, cell_id);
                assert_eq!(segment.value, "hello");
            }
            other => panic!("wrong message type: {other:?}"),
        }
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(u32::MAX).to_le_bytes());
        let result: Result<AgentMessage> = read_message(&mut Cursor::new(buf));
        assert!(matches!(result, Err(Error::Ipc(_))));
    }
}

//! The agent's request loop: frames in on stdin, responses and events out
//! on the shared outbound writer.

use std::io::{BufReader, BufWriter, Read, Write};
use std::sync::{mpsc, Arc, Mutex};

use folio_core::error::Result;
use folio_core::ipc::protocol::{
    read_message, write_message, AgentEventSink, AgentMessage, AgentRequest, AgentResponse,
    RequestEnvelope, ResponseEnvelope,
};
use folio_core::ipc::AgentEvent;

use crate::manager::{EvaluationContextManager, ManagerOptions};

pub use crate::manager::ManagerOptions as AgentOptions;

/// Forwards events from evaluation workers into the outbound channel.
struct ChannelSink {
    outbound: Mutex<mpsc::Sender<AgentMessage>>,
}

impl AgentEventSink for ChannelSink {
    fn on_event(&self, event: AgentEvent) {
        let _ = self
            .outbound
            .lock()
            .unwrap()
            .send(AgentMessage::Event(event));
    }
}

/// The agent server: one per process.
pub struct AgentServer {
    manager: EvaluationContextManager,
    outbound: mpsc::Sender<AgentMessage>,
}

impl AgentServer {
    /// Run the request loop until the host closes the channel or sends a
    /// shutdown request.
    ///
    /// The writer thread drains responses and events through one channel
    /// so frames never interleave. It is intentionally not joined: an
    /// evaluation worker stuck in user code holds a sender clone, and the
    /// host's kill path covers that case.
    pub fn run<R, W>(reader: R, writer: W, options: ManagerOptions) -> Result<()>
    where
        R: Read,
        W: Write + Send + 'static,
    {
        let (outbound, inbound) = mpsc::channel::<AgentMessage>();

        std::thread::Builder::new()
            .name("folio-agent-writer".to_string())
            .spawn(move || {
                let mut writer = BufWriter::new(writer);
                for message in inbound {
                    if let Err(e) = write_message(&mut writer, &message) {
                        tracing::debug!("outbound channel closed: {e}");
                        break;
                    }
                }
            })
            .map_err(|e| folio_core::Error::Ipc(format!("failed to start writer thread: {e}")))?;

        let sink = Arc::new(ChannelSink {
            outbound: Mutex::new(outbound.clone()),
        });

        let mut server = Self {
            manager: EvaluationContextManager::new(sink, options),
            outbound,
        };

        let mut reader = BufReader::new(reader);
        loop {
            let envelope: RequestEnvelope = match read_message(&mut reader) {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::debug!("host channel closed: {e}");
                    break;
                }
            };

            let shutting_down = matches!(envelope.body, AgentRequest::Shutdown);
            let response = server.dispatch(envelope.body);
            let _ = server.outbound.send(AgentMessage::Response(ResponseEnvelope {
                correlation_id: envelope.correlation_id,
                body: response,
            }));

            if shutting_down {
                break;
            }
        }

        Ok(())
    }

    fn dispatch(&mut self, request: AgentRequest) -> AgentResponse {
        match request {
            AgentRequest::Ping => AgentResponse::Pong,

            AgentRequest::InitializeContext { hints } => AgentResponse::ContextInitialized {
                configuration: self.manager.initialize_context(&hints),
            },

            AgentRequest::LoadModules {
                context_id,
                modules,
            } => match self.manager.load_modules(context_id, &modules) {
                Ok(results) => AgentResponse::ModulesLoaded { results },
                Err(e) => AgentResponse::Error {
                    message: e.to_string(),
                },
            },

            AgentRequest::Evaluate {
                context_id,
                compilation,
            } => match self.manager.evaluate(context_id, compilation) {
                Ok(()) => AgentResponse::EvaluationStarted,
                Err(e) => AgentResponse::Error {
                    message: e.to_string(),
                },
            },

            AgentRequest::ResetState { context_id } => {
                match self.manager.reset_state(context_id) {
                    Ok(()) => AgentResponse::StateReset,
                    Err(e) => AgentResponse::Error {
                        message: e.to_string(),
                    },
                }
            }

            AgentRequest::Interrupt { context_id } => match self.manager.interrupt(context_id) {
                Ok(()) => AgentResponse::Interrupting,
                Err(e) => AgentResponse::Error {
                    message: e.to_string(),
                },
            },

            AgentRequest::Shutdown => AgentResponse::ShuttingDown,
        }
    }
}

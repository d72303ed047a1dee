//! Agent process management for the workspace host.
//!
//! Provides [`AgentClient`] for spawning and talking to the target process,
//! routing correlated responses back to callers and uncorrelated events to
//! subscribed sinks.

use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use rustc_hash::FxHashMap;

use crate::compile::{
    Compilation, CompilationConfiguration, EvaluationContextId, ModuleDefinition,
    TargetCapabilityHints,
};
use crate::error::{Error, Result};

use super::protocol::{
    read_message, write_message, AgentConnection, AgentEventSink, AgentMessage, AgentRequest,
    AgentResponse, ModuleLoadResult, RequestEnvelope,
};

/// State shared with the reader thread.
struct ClientShared {
    /// Correlation id → reply channel for in-flight requests.
    pending: Mutex<FxHashMap<u64, mpsc::Sender<AgentResponse>>>,
    /// Subscribers to the uncorrelated event side channel.
    sinks: Mutex<Vec<Arc<dyn AgentEventSink>>>,
    /// Set once the channel breaks; all further requests fail fast.
    disconnected: AtomicBool,
}

impl ClientShared {
    fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
        // Dropping the senders fails every in-flight recv with a
        // disconnection error.
        self.pending.lock().unwrap().clear();
    }
}

/// Handle to a spawned agent process.
pub struct AgentClient {
    child: Child,
    writer: BufWriter<std::process::ChildStdin>,
    shared: Arc<ClientShared>,
    reader: Option<JoinHandle<()>>,
    next_correlation_id: u64,
    killed: bool,
}

impl AgentClient {
    /// Spawn a new agent process and verify it is alive with a ping.
    ///
    /// Looks for the `folio-agent` binary in order: the `FOLIO_AGENT_PATH`
    /// environment variable, the directory of the current executable, the
    /// system `PATH`, and finally the development target directories.
    pub fn spawn() -> Result<Self> {
        let agent_path = Self::find_agent_binary()?;
        Self::spawn_at(&agent_path)
    }

    /// Spawn the agent from an explicit binary path.
    pub fn spawn_at(agent_path: &std::path::Path) -> Result<Self> {
        let mut child = Command::new(agent_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                Error::Ipc(format!(
                    "failed to spawn agent process '{}': {e}",
                    agent_path.display()
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Ipc("failed to get agent stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Ipc("failed to get agent stdout".to_string()))?;

        let shared = Arc::new(ClientShared {
            pending: Mutex::new(FxHashMap::default()),
            sinks: Mutex::new(Vec::new()),
            disconnected: AtomicBool::new(false),
        });

        let reader_shared = shared.clone();
        let reader = std::thread::Builder::new()
            .name("folio-agent-reader".to_string())
            .spawn(move || Self::reader_loop(BufReader::new(stdout), reader_shared))
            .map_err(|e| Error::Ipc(format!("failed to start reader thread: {e}")))?;

        let mut client = Self {
            child,
            writer: BufWriter::new(stdin),
            shared,
            reader: Some(reader),
            next_correlation_id: 0,
            killed: false,
        };

        match client.request(AgentRequest::Ping)? {
            AgentResponse::Pong => Ok(client),
            other => Err(Error::Ipc(format!(
                "unexpected response from agent: {other:?}"
            ))),
        }
    }

    fn reader_loop(mut stdout: BufReader<std::process::ChildStdout>, shared: Arc<ClientShared>) {
        loop {
            match read_message::<_, AgentMessage>(&mut stdout) {
                Ok(AgentMessage::Response(envelope)) => {
                    let sender = shared
                        .pending
                        .lock()
                        .unwrap()
                        .remove(&envelope.correlation_id);
                    match sender {
                        Some(sender) => {
                            let _ = sender.send(envelope.body);
                        }
                        None => tracing::warn!(
                            correlation_id = envelope.correlation_id,
                            "dropping response with no pending request"
                        ),
                    }
                }
                Ok(AgentMessage::Event(event)) => {
                    for sink in shared.sinks.lock().unwrap().iter() {
                        sink.on_event(event.clone());
                    }
                }
                Err(e) => {
                    tracing::debug!("agent channel closed: {e}");
                    shared.disconnect();
                    return;
                }
            }
        }
    }

    /// Find the folio-agent binary path.
    fn find_agent_binary() -> Result<PathBuf> {
        if let Ok(path) = std::env::var("FOLIO_AGENT_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Ok(path);
            }
        }

        let agent_name = if cfg!(windows) {
            "folio-agent.exe"
        } else {
            "folio-agent"
        };

        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(exe_dir) = exe_path.parent() {
                let agent_path = exe_dir.join(agent_name);
                if agent_path.exists() {
                    return Ok(agent_path);
                }
            }
        }

        if let Ok(path) = which::which(agent_name) {
            return Ok(path);
        }

        if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
            for profile in &["debug", "release"] {
                let path = PathBuf::from(&manifest_dir)
                    .join("..")
                    .join("..")
                    .join("target")
                    .join(profile)
                    .join(agent_name);
                if path.exists() {
                    return Ok(path.canonicalize().unwrap_or(path));
                }
            }
        }

        Err(Error::Ipc(
            "could not find folio-agent binary; set FOLIO_AGENT_PATH or ensure it is in PATH"
                .to_string(),
        ))
    }

    /// Send one request and block for its correlated response.
    fn request(&mut self, body: AgentRequest) -> Result<AgentResponse> {
        if self.is_disconnected() {
            return Err(Error::Disconnected);
        }

        let correlation_id = self.next_correlation_id;
        self.next_correlation_id += 1;

        let (sender, receiver) = mpsc::channel();
        self.shared
            .pending
            .lock()
            .unwrap()
            .insert(correlation_id, sender);

        let envelope = RequestEnvelope {
            correlation_id,
            body,
        };
        if let Err(e) = write_message(&mut self.writer, &envelope) {
            tracing::debug!("agent write failed: {e}");
            self.shared.disconnect();
            return Err(Error::Disconnected);
        }

        match receiver.recv() {
            Ok(AgentResponse::Error { message }) => Err(Error::Agent(message)),
            Ok(response) => Ok(response),
            Err(_) => Err(Error::Disconnected),
        }
    }

    /// Whether the channel has broken.
    pub fn is_disconnected(&self) -> bool {
        self.shared.disconnected.load(Ordering::SeqCst)
    }

    /// Whether the agent process is still running.
    pub fn is_alive(&mut self) -> bool {
        !self.killed && matches!(self.child.try_wait(), Ok(None))
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// A handle that can force-stop the agent from another thread.
    pub fn kill_handle(&self) -> AgentKillHandle {
        AgentKillHandle {
            pid: self.child.id(),
            killed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Kill the agent process immediately. The forced-stop primitive: the
    /// in-flight evaluation and every queued request fail with
    /// [`Error::Disconnected`].
    pub fn kill(&mut self) -> Result<()> {
        if self.killed {
            return Ok(());
        }
        self.killed = true;

        // Attempt a graceful exit first so the agent can flush events.
        let _ = write_message(
            &mut self.writer,
            &RequestEnvelope {
                correlation_id: u64::MAX,
                body: AgentRequest::Shutdown,
            },
        );
        std::thread::sleep(Duration::from_millis(10));

        if let Err(e) = self.child.kill() {
            if !e.to_string().contains("No such process") {
                tracing::warn!("failed to kill agent: {e}");
            }
        }
        let _ = self.child.wait();

        self.shared.disconnect();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }

        Ok(())
    }

    /// Ask the agent to exit cleanly and wait for it.
    pub fn shutdown(mut self) -> Result<()> {
        if self.killed {
            return Ok(());
        }

        match self.request(AgentRequest::Shutdown) {
            Ok(AgentResponse::ShuttingDown) | Err(Error::Disconnected) => {}
            Ok(other) => {
                return Err(Error::Ipc(format!(
                    "unexpected response to shutdown: {other:?}"
                )))
            }
            Err(e) => return Err(e),
        }

        self.killed = true;
        match self.child.wait() {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(Error::Ipc(format!("agent exited with status: {status}"))),
            Err(e) => Err(Error::Ipc(format!("failed to wait for agent: {e}"))),
        }
    }
}

impl AgentConnection for AgentClient {
    fn initialize_context(
        &mut self,
        hints: &TargetCapabilityHints,
    ) -> Result<CompilationConfiguration> {
        match self.request(AgentRequest::InitializeContext {
            hints: hints.clone(),
        })? {
            AgentResponse::ContextInitialized { configuration } => Ok(configuration),
            other => Err(Error::Ipc(format!(
                "unexpected response to initialize: {other:?}"
            ))),
        }
    }

    fn load_modules(
        &mut self,
        context_id: EvaluationContextId,
        modules: &[ModuleDefinition],
    ) -> Result<Vec<ModuleLoadResult>> {
        match self.request(AgentRequest::LoadModules {
            context_id,
            modules: modules.to_vec(),
        })? {
            AgentResponse::ModulesLoaded { results } => Ok(results),
            other => Err(Error::Ipc(format!(
                "unexpected response to load modules: {other:?}"
            ))),
        }
    }

    fn evaluate(
        &mut self,
        context_id: EvaluationContextId,
        compilation: &Compilation,
    ) -> Result<()> {
        match self.request(AgentRequest::Evaluate {
            context_id,
            compilation: compilation.clone(),
        })? {
            AgentResponse::EvaluationStarted => Ok(()),
            other => Err(Error::Ipc(format!(
                "unexpected response to evaluate: {other:?}"
            ))),
        }
    }

    fn reset_state(&mut self, context_id: EvaluationContextId) -> Result<()> {
        match self.request(AgentRequest::ResetState { context_id })? {
            AgentResponse::StateReset => Ok(()),
            other => Err(Error::Ipc(format!(
                "unexpected response to reset: {other:?}"
            ))),
        }
    }

    fn interrupt(&mut self, context_id: EvaluationContextId) -> Result<()> {
        match self.request(AgentRequest::Interrupt { context_id })? {
            AgentResponse::Interrupting => Ok(()),
            other => Err(Error::Ipc(format!(
                "unexpected response to interrupt: {other:?}"
            ))),
        }
    }

    fn subscribe(&mut self, sink: Arc<dyn AgentEventSink>) {
        self.shared.sinks.lock().unwrap().push(sink);
    }
}

impl Drop for AgentClient {
    fn drop(&mut self) {
        let _ = self.kill();
    }
}

/// Thread-safe handle for force-stopping the agent from another thread.
///
/// The host environment guarantees the postconditions of a forced stop by
/// construction: the process dies, the channel disconnects, and the next
/// connection starts from a fresh context.
#[derive(Clone)]
pub struct AgentKillHandle {
    pid: u32,
    killed: Arc<AtomicBool>,
}

impl AgentKillHandle {
    /// Kill the agent process. Callable from any thread.
    pub fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }

        #[cfg(unix)]
        unsafe {
            libc::kill(self.pid as i32, libc::SIGKILL);
        }

        #[cfg(not(unix))]
        tracing::warn!(pid = self.pid, "forced agent stop unsupported on this platform");
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests require the folio-agent binary to be built.
    // Run `cargo build -p folio-agent` first.

    #[test]
    #[ignore = "requires folio-agent binary"]
    fn test_spawn_and_ping() {
        let client = AgentClient::spawn().unwrap();
        assert!(client.pid() > 0);
    }

    #[test]
    #[ignore = "requires folio-agent binary"]
    fn test_kill_disconnects() {
        let mut client = AgentClient::spawn().unwrap();
        client.kill().unwrap();
        assert!(client.is_disconnected());
    }
}

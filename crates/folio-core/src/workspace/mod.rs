//! The workspace host: owns the cell graph, drives incremental
//! compilation, and coordinates evaluation with the agent process.

mod plan;

pub use plan::EvaluationPlan;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::SystemTime;

use rustc_hash::FxHashMap;

use crate::compile::{
    CompilationBackend, CompilationConfiguration, CompileRequest, Diagnostic,
    EvaluationEnvironment, TargetCapabilityHints,
};
use crate::error::{Error, Result};
use crate::evaluating::EvaluationStatus;
use crate::events::{CellEvent, CellEventObserver, ObserverSet};
use crate::graph::{Cell, CellGraph, CellId};
use crate::ipc::{AgentConnection, AgentEvent, AgentEventSink};

/// Snapshot of one external file dependency taken at compile time.
#[derive(Debug, Clone)]
struct FileDependency {
    path: std::path::PathBuf,
    modified: Option<SystemTime>,
}

impl FileDependency {
    fn snapshot(path: std::path::PathBuf) -> Self {
        let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
        Self { path, modified }
    }

    fn is_stale(&self) -> bool {
        let current = std::fs::metadata(&self.path).and_then(|m| m.modified()).ok();
        current != self.modified
    }
}

/// Result of updating a cell's buffer.
#[derive(Debug, Clone)]
pub struct CellUpdate {
    pub cell_id: CellId,
    /// Whether the buffer is now a syntactically complete unit.
    pub is_complete: bool,
    pub diagnostics: Vec<Diagnostic>,
}

/// Outcome of one cell within an evaluation batch.
#[derive(Debug, Clone)]
pub struct CellEvaluationRecord {
    pub cell_id: CellId,
    pub status: EvaluationStatus,
}

/// Keeps new evaluation batches from starting while held. Nestable.
pub struct InhibitGuard {
    inhibitions: Arc<AtomicUsize>,
}

impl Drop for InhibitGuard {
    fn drop(&mut self) {
        self.inhibitions.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Routes agent events to host observers and resolves per-cell awaiters
/// when the terminal evaluation record arrives.
struct HostEventBridge {
    observers: ObserverSet,
    awaiters: Arc<Mutex<FxHashMap<CellId, mpsc::Sender<EvaluationStatus>>>>,
}

impl AgentEventSink for HostEventBridge {
    fn on_event(&self, event: AgentEvent) {
        match event {
            AgentEvent::InFlight(in_flight) => {
                self.observers.publish(&CellEvent::InFlight(in_flight));
            }
            AgentEvent::Output(segment) => {
                self.observers.publish(&CellEvent::Output(segment));
            }
            AgentEvent::Evaluation(evaluation) => {
                let cell_id = evaluation.cell_id;
                let status = evaluation.status;
                self.observers.publish(&CellEvent::Evaluation(evaluation));
                if let Some(awaiter) = self.awaiters.lock().unwrap().remove(&cell_id) {
                    let _ = awaiter.send(status);
                }
            }
            AgentEvent::EvaluationError { cell_id, exception } => {
                self.observers.publish_stream_error(cell_id, &exception);
            }
        }
    }
}

/// The workspace host.
///
/// Graph mutation is serialized by ownership: every operation takes
/// `&mut self`, and embeddings are expected to drive the host from one
/// logical thread, running [`evaluate`](Self::evaluate) off their UI
/// thread. The transport serializes one in-flight evaluation per context.
pub struct WorkspaceHost {
    graph: CellGraph,
    backend: Box<dyn CompilationBackend>,
    environment: EvaluationEnvironment,
    connection: Option<Box<dyn AgentConnection>>,
    configuration: Option<CompilationConfiguration>,
    observers: ObserverSet,
    awaiters: Arc<Mutex<FxHashMap<CellId, mpsc::Sender<EvaluationStatus>>>>,
    inhibitions: Arc<AtomicUsize>,
    file_dependencies: FxHashMap<CellId, Vec<FileDependency>>,
    /// Monotonic submission-slot source for the current evaluation
    /// context. Slot 0 belongs to the context's global object, so the
    /// first compile gets slot 1. Never derived from graph positions:
    /// those shift as cells are inserted and removed, while issued slots
    /// must stay stable for the life of the context.
    submission_count: usize,
}

impl WorkspaceHost {
    pub fn new(backend: Box<dyn CompilationBackend>, environment: EvaluationEnvironment) -> Self {
        Self {
            graph: CellGraph::new(),
            backend,
            environment,
            connection: None,
            configuration: None,
            observers: ObserverSet::new(),
            awaiters: Arc::new(Mutex::new(FxHashMap::default())),
            inhibitions: Arc::new(AtomicUsize::new(0)),
            file_dependencies: FxHashMap::default(),
            submission_count: 0,
        }
    }

    /// Attach an agent connection, initialize a fresh evaluation context,
    /// and hand its compilation configuration to the backend.
    ///
    /// Reconnecting after a lost agent replaces the old context; prior
    /// submission state is unrecoverable, so every cell is marked outdated
    /// to force a full re-evaluation on the next request.
    pub fn connect(&mut self, connection: Box<dyn AgentConnection>) -> Result<()> {
        self.connect_with_hints(
            connection,
            TargetCapabilityHints {
                host_os: std::env::consts::OS.to_string(),
                request_inline_images: false,
            },
        )
    }

    pub fn connect_with_hints(
        &mut self,
        mut connection: Box<dyn AgentConnection>,
        hints: TargetCapabilityHints,
    ) -> Result<()> {
        let reconnecting = self.configuration.is_some();

        connection.subscribe(Arc::new(HostEventBridge {
            observers: self.observers.clone(),
            awaiters: self.awaiters.clone(),
        }));

        let configuration = connection.initialize_context(&hints)?;
        self.backend.configure(&configuration);
        self.configuration = Some(configuration);
        self.connection = Some(connection);

        // A fresh context starts a fresh submission sequence.
        self.submission_count = 0;

        if reconnecting {
            self.outdate_all_cells();
        }

        Ok(())
    }

    /// The compilation configuration from the current connection, if any.
    pub fn configuration(&self) -> Option<&CompilationConfiguration> {
        self.configuration.as_ref()
    }

    pub fn subscribe(&self, observer: Arc<dyn CellEventObserver>) {
        self.observers.subscribe(observer);
    }

    /// Block new evaluation batches until the returned guard is dropped.
    pub fn inhibit_evaluation(&self) -> InhibitGuard {
        self.inhibitions.fetch_add(1, Ordering::SeqCst);
        InhibitGuard {
            inhibitions: self.inhibitions.clone(),
        }
    }

    pub fn can_evaluate(&self) -> bool {
        self.inhibitions.load(Ordering::SeqCst) == 0
    }

    pub fn insert_cell(
        &mut self,
        buffer: impl Into<String>,
        previous: Option<CellId>,
        next: Option<CellId>,
    ) -> Result<CellId> {
        self.graph.insert_cell(buffer, previous, next)
    }

    pub fn append_cell(&mut self, buffer: impl Into<String>) -> Result<CellId> {
        self.graph.insert_cell(buffer, None, None)
    }

    /// Replace a cell's buffer, marking it dirty and reporting completeness
    /// plus lightweight diagnostics.
    pub fn update_cell(&mut self, cell_id: CellId, buffer: impl Into<String>) -> Result<CellUpdate> {
        let buffer = buffer.into();
        let diagnostics = self.backend.buffer_diagnostics(cell_id, &buffer);
        let is_complete = self.backend.is_complete(&buffer);

        let cell = self
            .graph
            .cell_mut(cell_id)
            .ok_or_else(|| Error::CellNotFound(cell_id.to_string()))?;
        cell.buffer = buffer;
        cell.dirty = true;
        cell.diagnostics = diagnostics.clone();

        Ok(CellUpdate {
            cell_id,
            is_complete,
            diagnostics,
        })
    }

    /// Remove a cell, relinking its neighbors.
    pub fn remove_cell(&mut self, cell_id: CellId) -> Result<()> {
        let next = self.graph.successor(cell_id)?;
        self.graph.remove_cell(cell_id, next)?;
        self.file_dependencies.remove(&cell_id);
        Ok(())
    }

    pub fn topologically_sorted_cell_ids(&self) -> Vec<CellId> {
        self.graph.topologically_sorted_cell_ids()
    }

    pub fn cell(&self, cell_id: CellId) -> Option<&Cell> {
        self.graph.cell(cell_id)
    }

    pub fn is_cell_complete(&self, cell_id: CellId) -> Result<bool> {
        let cell = self
            .graph
            .cell(cell_id)
            .ok_or_else(|| Error::CellNotFound(cell_id.to_string()))?;
        Ok(self.backend.is_complete(&cell.buffer))
    }

    /// Mark every cell outdated so the next plan re-selects the graph.
    pub fn outdate_all_cells(&mut self) {
        let ids = self.graph.topologically_sorted_cell_ids();
        for id in ids {
            if let Some(cell) = self.graph.cell_mut(id) {
                cell.outdated = true;
            }
        }
    }

    /// Evaluate the target cell (or everything when `target` is `None`)
    /// according to the evaluation plan.
    ///
    /// Per-cell failures are data: diagnostics and exceptions land on the
    /// cell and in the event stream. Only engine-level failures (backend
    /// infrastructure, reset transport loss) return `Err`.
    pub fn evaluate(&mut self, target: Option<CellId>) -> Result<Vec<CellEvaluationRecord>> {
        if !self.can_evaluate() {
            return Err(Error::EvaluationInhibited);
        }

        let plan = self.evaluation_plan(target)?;

        if plan.should_reset_state {
            if let (Some(connection), Some(configuration)) =
                (self.connection.as_mut(), self.configuration.as_ref())
            {
                connection.reset_state(configuration.evaluation_context_id)?;
            }
        }

        let mut records = Vec::with_capacity(plan.cells.len());

        for &cell_id in &plan.cells {
            self.observers
                .publish(&CellEvent::EvaluationStarted { cell_id });

            let status = self.core_evaluate_cell(cell_id)?;

            let diagnostics = self
                .graph
                .cell(cell_id)
                .map(|cell| cell.diagnostics.clone())
                .unwrap_or_default();

            self.observers.publish(&CellEvent::EvaluationFinished {
                cell_id,
                status,
                should_start_new_cell: plan.should_maybe_start_new_cell
                    && status == EvaluationStatus::Success
                    && Some(cell_id) == target,
                diagnostics,
            });

            records.push(CellEvaluationRecord { cell_id, status });

            match status {
                EvaluationStatus::ErrorDiagnostic | EvaluationStatus::Disconnected => break,
                _ => {}
            }
        }

        Ok(records)
    }

    /// Compile and run a single planned cell, blocking until its terminal
    /// evaluation record arrives from the agent.
    fn core_evaluate_cell(&mut self, cell_id: CellId) -> Result<EvaluationStatus> {
        if self.connection.is_none() || self.configuration.is_none() {
            if let Some(cell) = self.graph.cell_mut(cell_id) {
                cell.diagnostics = vec![Diagnostic::error(
                    "cannot evaluate: not connected to an agent",
                )];
            }
            return Ok(EvaluationStatus::Disconnected);
        }

        let position = self.graph.position(cell_id)?;
        let order = self.graph.topologically_sorted_cell_ids();
        let buffer = self
            .graph
            .cell(cell_id)
            .map(|cell| cell.buffer.clone())
            .unwrap_or_default();

        self.submission_count += 1;

        let configuration = self.configuration.as_ref().unwrap();
        let request = CompileRequest {
            cell_id,
            buffer: buffer.clone(),
            submission_number: self.submission_count,
            predecessors: order[..position].to_vec(),
            evaluation_context_id: configuration.evaluation_context_id,
            environment: self.environment.clone(),
        };

        let result = self.backend.compile(request)?;

        // Snapshot the external files this buffer pulls in so later plans
        // can detect staleness.
        let dependencies = self
            .backend
            .external_file_dependencies(&buffer)
            .into_iter()
            .map(FileDependency::snapshot)
            .collect::<Vec<_>>();
        if dependencies.is_empty() {
            self.file_dependencies.remove(&cell_id);
        } else {
            self.file_dependencies.insert(cell_id, dependencies);
        }

        {
            let cell = self
                .graph
                .cell_mut(cell_id)
                .ok_or_else(|| Error::CellNotFound(cell_id.to_string()))?;
            cell.diagnostics = result.diagnostics;
            if cell.has_error_diagnostics() {
                return Ok(EvaluationStatus::ErrorDiagnostic);
            }
        }

        let compilation = result.compilation.ok_or_else(|| Error::Compilation {
            cell_id: Some(cell_id.to_string()),
            message: "backend produced neither a compilation nor error diagnostics".to_string(),
        })?;

        if let Some(cell) = self.graph.cell_mut(cell_id) {
            cell.render_result_expression = compilation.result_is_expression;
        }

        let (sender, receiver) = mpsc::channel();
        self.awaiters.lock().unwrap().insert(cell_id, sender);

        let context_id = compilation.evaluation_context_id;
        let connection = self.connection.as_mut().unwrap();

        let integration_modules: Vec<_> = compilation
            .references
            .iter()
            .filter(|module| module.has_integration)
            .cloned()
            .collect();

        let send_result = (|| -> Result<()> {
            if !integration_modules.is_empty() {
                connection.load_modules(context_id, &integration_modules)?;
            }
            connection.evaluate(context_id, &compilation)
        })();

        let status = match send_result {
            Ok(()) => match receiver.recv() {
                Ok(status) => status,
                // The bridge dropped the sender: the channel broke while
                // this cell was executing.
                Err(_) => EvaluationStatus::Disconnected,
            },
            Err(e) => {
                tracing::error!("marking agent as terminated: {e}");
                EvaluationStatus::Disconnected
            }
        };

        self.awaiters.lock().unwrap().remove(&cell_id);

        let cell = self
            .graph
            .cell_mut(cell_id)
            .ok_or_else(|| Error::CellNotFound(cell_id.to_string()))?;

        if status == EvaluationStatus::Disconnected {
            cell.agent_terminated_while_evaluating = true;
            cell.diagnostics = vec![Diagnostic::error(
                "the application terminated during evaluation of this cell; \
                 run this cell manually to try again",
            )];
        } else {
            // An explicit attempt that completed without termination clears
            // the flag, letting later plans walk past this cell again.
            cell.agent_terminated_while_evaluating = false;
        }

        cell.dirty = false;
        cell.outdated = false;
        cell.evaluation_count += 1;

        Ok(status)
    }

    pub(crate) fn graph(&self) -> &CellGraph {
        &self.graph
    }

    pub(crate) fn graph_mut(&mut self) -> &mut CellGraph {
        &mut self.graph
    }

    pub(crate) fn backend_mut(&mut self) -> &mut dyn CompilationBackend {
        self.backend.as_mut()
    }

    pub(crate) fn file_dependencies_stale(&self, cell_id: CellId) -> bool {
        self.file_dependencies
            .get(&cell_id)
            .is_some_and(|dependencies| dependencies.iter().any(FileDependency::is_stale))
    }
}

//! The external compilation capability consumed by the workspace host.

use std::path::PathBuf;

use crate::error::Result;
use crate::graph::CellId;

use super::types::{
    Compilation, CompilationConfiguration, Diagnostic, EvaluationContextId, EvaluationEnvironment,
};

/// Everything the backend needs to compile one cell.
#[derive(Debug, Clone)]
pub struct CompileRequest {
    pub cell_id: CellId,
    /// Full source buffer of the cell.
    pub buffer: String,
    /// Submission-state slot this cell will occupy.
    pub submission_number: usize,
    /// Ids of the already-compiled predecessor cells, in chain order.
    pub predecessors: Vec<CellId>,
    pub evaluation_context_id: EvaluationContextId,
    pub environment: EvaluationEnvironment,
}

/// Outcome of a compile attempt: diagnostics always, a compilation when
/// something runnable was produced. Error diagnostics and a present
/// compilation are not mutually exclusive; the host checks severity.
#[derive(Debug)]
pub struct CompileResult {
    pub compilation: Option<Compilation>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Incrementally compiles one cell's source text into a loadable module
/// plus diagnostics, given the set of already-compiled predecessor cells.
///
/// Implementations are stateful: they may cache per-cell compilation state
/// keyed by buffer content, which is why [`invalidate`](Self::invalidate)
/// exists.
pub trait CompilationBackend: Send {
    /// Called once the agent connection reports its compilation
    /// configuration (default imports, suppressions, global object type).
    fn configure(&mut self, _configuration: &CompilationConfiguration) {}

    /// Whether the buffer is a syntactically complete unit, used to decide
    /// whether end-of-input should trigger evaluation.
    fn is_complete(&self, buffer: &str) -> bool;

    /// Lightweight diagnostics for an edited buffer, without emitting.
    fn buffer_diagnostics(&mut self, cell_id: CellId, buffer: &str) -> Vec<Diagnostic>;

    /// Files referenced by the buffer's include/load directives. The host
    /// snapshots their modification times to detect staleness.
    fn external_file_dependencies(&self, buffer: &str) -> Vec<PathBuf>;

    /// Force the backend to drop any cached compilation state for a cell
    /// whose buffer text is unchanged but whose external dependencies are
    /// stale.
    fn invalidate(&mut self, cell_id: CellId);

    /// Compile one cell.
    fn compile(&mut self, request: CompileRequest) -> Result<CompileResult>;
}

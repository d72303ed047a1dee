//! Error types for folio-core.

use thiserror::Error;

/// Result type for folio-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in folio-core.
#[derive(Debug, Error)]
pub enum Error {
    /// Cell not found in the workspace graph.
    #[error("cell not found: {0}")]
    CellNotFound(String),

    /// Compilation backend failure (not a diagnostic; those are data on the cell).
    #[error("compilation failed{}: {message}", cell_id.as_ref().map(|id| format!(" for cell {id}")).unwrap_or_default())]
    Compilation {
        cell_id: Option<String>,
        message: String,
    },

    /// A module reference could not be materialized or loaded.
    #[error("module resolution failed for '{name}': {message}")]
    ModuleResolution { name: String, message: String },

    /// IPC communication error with the agent process.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// The agent process connection was lost. Distinct from an ordinary
    /// failed response so the host can apply its reconnect policy.
    #[error("agent disconnected")]
    Disconnected,

    /// The agent returned a failure response for a request.
    #[error("agent error: {0}")]
    Agent(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Evaluation is currently inhibited by a held guard.
    #[error("evaluation is inhibited")]
    EvaluationInhibited,

    /// Invalid operation (e.g., removing a cell with a mismatched successor).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

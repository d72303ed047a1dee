//! Host-side engine for folio interactive workbooks.
//!
//! This crate provides:
//! - The ordered cell graph and evaluation planning
//! - The compilation model and the external backend capability
//! - Module definition resolution tables
//! - The agent protocol and process client

pub mod compile;
pub mod error;
pub mod evaluating;
pub mod events;
pub mod graph;
pub mod ipc;
pub mod resolve;
pub mod workspace;

pub use error::{Error, Result};
pub use evaluating::{
    CapturedOutputSegment, Culture, Evaluation, EvaluationInFlight, EvaluationPhase,
    EvaluationStatus, ExceptionInfo, OutputStream, RepresentedValue, ResultHandling,
};
pub use events::{CellEvent, CellEventObserver, ObserverSet};
pub use graph::{Cell, CellGraph, CellId};
pub use resolve::ModuleDefinitionTable;
pub use workspace::{CellEvaluationRecord, CellUpdate, EvaluationPlan, InhibitGuard, WorkspaceHost};

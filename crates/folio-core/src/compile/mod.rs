//! The compilation model and the external compilation backend capability.
//!
//! folio does not compile cell source itself: an embedding supplies a
//! [`CompilationBackend`] that turns one cell's buffer plus its resolved
//! predecessors into a loadable module and diagnostics.

mod backend;
mod types;

pub use backend::{CompilationBackend, CompileRequest, CompileResult};
pub use types::{
    Compilation, CompilationConfiguration, Diagnostic, EntryPoint, EvaluationContextId,
    EvaluationEnvironment, ModuleContent, ModuleDefinition, ModuleId, NativeDependency, Severity,
    TargetCapabilityHints, TypeDescriptor,
};

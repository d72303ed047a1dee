//! Common types for the compilation pipeline.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::graph::CellId;

/// Identifier for an evaluation context inside the agent process.
/// Process-unique and monotonically assigned by the agent.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct EvaluationContextId(u32);

impl EvaluationContextId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for EvaluationContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ctx_{}", self.0)
    }
}

/// Module identity: a name, optionally versioned.
///
/// Definition lookups treat the name case-insensitively; loaded-module
/// identity is case-sensitive (see the resolver).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleId {
    pub name: String,
    pub version: Option<String>,
}

impl ModuleId {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
        }
    }

    pub fn with_version(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: Some(version.into()),
        }
    }
}

impl std::fmt::Display for ModuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{} {}", self.name, version),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Binary content of a module: a byte image, a resolvable file location,
/// or both. Content with neither cannot be materialized.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleContent {
    /// Full binary image, when transmitted inline.
    pub image: Option<Vec<u8>>,
    /// On-disk location, when the target can read it locally.
    pub location: Option<PathBuf>,
    /// Optional debug symbols accompanying the image.
    pub debug_symbols: Option<Vec<u8>>,
}

impl ModuleContent {
    pub fn from_image(image: Vec<u8>) -> Self {
        Self {
            image: Some(image),
            ..Default::default()
        }
    }

    pub fn from_location(location: PathBuf) -> Self {
        Self {
            location: Some(location),
            ..Default::default()
        }
    }

    /// Whether there is anything to materialize at all.
    pub fn is_resolvable(&self) -> bool {
        self.image.is_some() || self.location.is_some()
    }
}

/// Entry point descriptor for an executable module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPoint {
    /// Exported symbol invoked with the submission-state array.
    pub symbol: String,
}

/// An external native library a module depends on at load time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeDependency {
    pub name: String,
    pub location: Option<PathBuf>,
}

/// A named, loadable unit of compiled code plus its binary content and
/// dependencies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleDefinition {
    pub id: ModuleId,
    pub content: ModuleContent,
    pub entry_point: Option<EntryPoint>,
    pub external_dependencies: Vec<NativeDependency>,
    /// Whether the module carries host-integration hooks to activate on load.
    pub has_integration: bool,
}

impl ModuleDefinition {
    pub fn new(id: ModuleId, content: ModuleContent) -> Self {
        Self {
            id,
            content,
            entry_point: None,
            external_dependencies: Vec::new(),
            has_integration: false,
        }
    }
}

/// Severity of a compile diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl Severity {
    pub fn is_error(&self) -> bool {
        matches!(self, Severity::Error)
    }
}

/// A compile diagnostic. Diagnostics are data attached to a cell, never
/// errors thrown at the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Stable identifier usable for suppression, when the backend has one.
    pub id: Option<String>,
    pub message: String,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            id: None,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            id: None,
            message: message.into(),
        }
    }
}

/// The environment an evaluation runs in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationEnvironment {
    pub working_directory: PathBuf,
}

impl EvaluationEnvironment {
    pub fn new(working_directory: impl Into<PathBuf>) -> Self {
        Self {
            working_directory: working_directory.into(),
        }
    }
}

/// Descriptor for a type the host exposes to compiled cells, most notably
/// the context's persistent global object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDescriptor {
    pub name: String,
    pub module: Option<ModuleId>,
}

/// Capability hints sent with an initialize-context request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetCapabilityHints {
    /// Operating system of the host, e.g. `std::env::consts::OS`.
    pub host_os: String,
    /// Whether the host wants full binary images transmitted inline rather
    /// than resolved from the target's filesystem.
    pub request_inline_images: bool,
}

/// Compilation configuration returned by the agent when an evaluation
/// context is initialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilationConfiguration {
    pub evaluation_context_id: EvaluationContextId,
    /// Imports every submission starts with.
    pub default_imports: Vec<String>,
    /// Diagnostic ids the backend should suppress by default.
    pub default_suppressed_diagnostics: Vec<String>,
    /// Type of the context's persistent global object, if the agent has one.
    pub global_object_type: Option<TypeDescriptor>,
    /// Whether module definitions sent to this target must carry their full
    /// binary images inline.
    pub include_inline_images: bool,
}

/// The immutable result of compiling one cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Compilation {
    pub cell_id: CellId,
    /// Index of this cell's submission-state slot in the evaluation context.
    pub submission_number: usize,
    pub evaluation_context_id: EvaluationContextId,
    pub environment: EvaluationEnvironment,
    /// Whether the buffer's trailing statement is an expression whose value
    /// should be rendered.
    pub result_is_expression: bool,
    /// The executable module, absent when nothing runnable was produced.
    pub executable: Option<ModuleDefinition>,
    /// Module definitions the executable depends on.
    pub references: Vec<ModuleDefinition>,
}

//! Target-process agent for folio interactive workbooks.
//!
//! This crate provides:
//! - Evaluation contexts holding submission state across cells
//! - The phased execution machine (compiled → evaluated → represented →
//!   completed)
//! - Module loading and context-scoped resolution caching
//! - Tagged stdout/stderr capture during evaluation
//! - The agent protocol server

pub mod abi;
pub mod context;
pub mod loaded;
pub mod manager;
pub mod output;
pub mod represent;
pub mod resolve;
pub mod server;

pub use context::{CancellationToken, EvaluationContext, EvaluationServices, GlobalVariable};
pub use loaded::{EntryInvocation, LoadedModule};
pub use manager::{EvaluationContextManager, ManagerOptions};
pub use represent::{DisplayRepresenter, Representer};
pub use resolve::{IntegrationRegistry, ModuleCache, NativeDependencyMapper};
pub use server::AgentServer;

//! The phased evaluation data model shared by host and agent.
//!
//! Dynamic values cross the process boundary as JSON text so the protocol
//! frames stay plain binary records.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::compile::ModuleId;
use crate::graph::CellId;

/// The four ordered stages an evaluation passes through.
///
/// There is no externally observable pseudo-state before `Compiled`: an
/// in-flight record exists only once that phase has been entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationPhase {
    Compiled,
    Evaluated,
    Represented,
    Completed,
}

/// Terminal status of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStatus {
    Success,
    /// Error diagnostics blocked the cell before execution.
    ErrorDiagnostic,
    /// User code raised; the context remains usable.
    EvaluationException,
    Interrupted,
    /// The agent terminated or the channel broke mid-evaluation.
    Disconnected,
}

/// How a consumer should merge the result into prior renderings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultHandling {
    Replace,
    Append,
    Ignore,
}

/// A captured exception, singly-wrapped causes already unwrapped where the
/// execution host added the wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    pub type_name: String,
    pub message: String,
    pub inner: Option<Box<ExceptionInfo>>,
}

impl ExceptionInfo {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            inner: None,
        }
    }
}

/// A display-ready transform of a raw result value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepresentedValue {
    pub type_name: Option<String>,
    /// One or more renderings, each a JSON document.
    pub representations: Vec<String>,
}

/// Culture identifiers in effect during an evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Culture {
    pub name: String,
}

impl Culture {
    /// The culture of the current process environment.
    pub fn current() -> Self {
        let name = std::env::var("LC_ALL")
            .or_else(|_| std::env::var("LANG"))
            .unwrap_or_else(|_| "en-US".to_string());
        Self { name }
    }
}

/// The published result of one execution. Mutable only inside the agent
/// while phases advance; frozen once `Completed` is published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub cell_id: CellId,
    pub status: EvaluationStatus,
    pub result_handling: ResultHandling,
    /// Display-ready form of the raw result.
    pub result: Option<RepresentedValue>,
    pub exception: Option<ExceptionInfo>,
    pub duration: Duration,
    pub culture: Culture,
    pub ui_culture: Culture,
    pub interrupted: bool,
    /// Whether host-integration activated during this evaluation.
    pub initialized_integration: bool,
    /// Modules loaded as a side effect of this evaluation.
    pub loaded_modules: Vec<ModuleId>,
}

/// A snapshot of an evaluation mid-flight, published at each phase
/// transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationInFlight {
    pub cell_id: CellId,
    pub phase: EvaluationPhase,
    /// Raw, unrepresented result (JSON), set from `Evaluated` onward.
    pub original_value: Option<String>,
    /// The final record, set from `Represented` onward.
    pub evaluation: Option<Evaluation>,
}

impl EvaluationInFlight {
    pub fn compiled(cell_id: CellId) -> Self {
        Self {
            cell_id,
            phase: EvaluationPhase::Compiled,
            original_value: None,
            evaluation: None,
        }
    }

    pub fn with_phase(&self, phase: EvaluationPhase) -> Self {
        let mut next = self.clone();
        next.phase = phase;
        next
    }
}

/// Which standard stream a captured segment came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One tagged segment of output captured while a cell was executing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedOutputSegment {
    pub cell_id: CellId,
    pub stream: OutputStream,
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_ordering() {
        assert!(EvaluationPhase::Compiled < EvaluationPhase::Evaluated);
        assert!(EvaluationPhase::Evaluated < EvaluationPhase::Represented);
        assert!(EvaluationPhase::Represented < EvaluationPhase::Completed);
    }

    #[test]
    fn test_in_flight_phase_advance() {
        let cell_id = CellId::new(uuid::Uuid::new_v4());
        let compiled = EvaluationInFlight::compiled(cell_id);
        assert_eq!(compiled.phase, EvaluationPhase::Compiled);

        let evaluated = compiled.with_phase(EvaluationPhase::Evaluated);
        assert_eq!(evaluated.phase, EvaluationPhase::Evaluated);
        assert_eq!(evaluated.cell_id, cell_id);
    }

    #[test]
    fn test_culture_has_a_name() {
        assert!(!Culture::current().name.is_empty());
    }
}

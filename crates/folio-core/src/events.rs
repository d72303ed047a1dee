//! Host-side cell events and the observer seam.

use std::sync::{Arc, Mutex};

use crate::compile::Diagnostic;
use crate::evaluating::{
    CapturedOutputSegment, Evaluation, EvaluationInFlight, EvaluationStatus, ExceptionInfo,
};
use crate::graph::CellId;

/// Events published by the workspace host to its consumers.
#[derive(Debug, Clone)]
pub enum CellEvent {
    /// A planned cell is about to be compiled and evaluated.
    EvaluationStarted { cell_id: CellId },

    /// A planned cell finished, successfully or not.
    EvaluationFinished {
        cell_id: CellId,
        status: EvaluationStatus,
        /// Hint that the caller may want to auto-create a trailing cell.
        should_start_new_cell: bool,
        diagnostics: Vec<Diagnostic>,
    },

    /// Phase transition forwarded from the agent.
    InFlight(EvaluationInFlight),

    /// Terminal evaluation record forwarded from the agent.
    Evaluation(Evaluation),

    /// Captured output segment forwarded from the agent.
    Output(CapturedOutputSegment),
}

/// Observer of workspace cell events.
///
/// A failure recorded by the evaluated phase arrives twice, deliberately:
/// once inside the normal phase publications and once through
/// [`on_stream_error`](Self::on_stream_error). The two are independent
/// signals of the same outcome.
pub trait CellEventObserver: Send + Sync {
    fn on_event(&self, event: &CellEvent);

    fn on_stream_error(&self, _cell_id: CellId, _exception: &ExceptionInfo) {}
}

/// A cloneable fan-out list of observers.
#[derive(Clone, Default)]
pub struct ObserverSet {
    observers: Arc<Mutex<Vec<Arc<dyn CellEventObserver>>>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn CellEventObserver>) {
        self.observers.lock().unwrap().push(observer);
    }

    pub fn publish(&self, event: &CellEvent) {
        for observer in self.observers.lock().unwrap().iter() {
            observer.on_event(event);
        }
    }

    pub fn publish_stream_error(&self, cell_id: CellId, exception: &ExceptionInfo) {
        for observer in self.observers.lock().unwrap().iter() {
            observer.on_stream_error(cell_id, exception);
        }
    }
}

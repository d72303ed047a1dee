//! Evaluation contexts: the long-lived execution state inside the agent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rustc_hash::FxHashMap;

use folio_core::compile::{Compilation, EvaluationContextId, ModuleId};
use folio_core::evaluating::{
    Culture, Evaluation, EvaluationInFlight, EvaluationPhase, EvaluationStatus, ExceptionInfo,
    ResultHandling,
};
use folio_core::ipc::{AgentEvent, AgentEventSink};

use crate::abi::{Declaration, EntryError, EntryInput, SubmissionState};
use crate::loaded::EntryInvocation;
use crate::output::CaptureGuard;
use crate::represent::Representer;
use crate::resolve::{IntegrationRegistry, ModuleCache, NativeDependencyMapper};

/// Cooperative cancellation shared between an in-flight evaluation and
/// whoever wants to stop it. Any clone can trip it; every clone sees it.
#[derive(Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Clear a previous cancellation before a new evaluation starts.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::Relaxed);
    }
}

/// One declared global: retained top-level state listed for consumers.
/// Populated from each successful evaluation's declaration output rather
/// than by introspecting submission state.
#[derive(Debug, Clone)]
pub struct GlobalVariable {
    pub name: String,
    pub type_name: Option<String>,
    pub value_json: String,
}

/// Shared services an evaluation needs from its manager.
#[derive(Clone)]
pub struct EvaluationServices {
    pub sink: Arc<dyn AgentEventSink>,
    pub representer: Arc<dyn Representer>,
    pub integrations: Arc<IntegrationRegistry>,
    pub capture_output: bool,
}

/// Everything one entry-point invocation produced.
#[derive(Default)]
pub(crate) struct InvokeOutcome {
    pub value_json: Option<String>,
    pub value_type: Option<String>,
    pub declarations: Vec<Declaration>,
    pub exception: Option<ExceptionInfo>,
    pub interrupted: bool,
    pub initialized_integration: bool,
    pub loaded_modules: Vec<ModuleId>,
}

/// A persistent execution environment holding state across cells.
///
/// Owned exclusively by one manager registration; the protocol's
/// one-in-flight-per-context rule means no two evaluations ever touch the
/// submission states or module cache concurrently.
pub struct EvaluationContext {
    id: EvaluationContextId,
    /// Slot 0 is the persistent global object and is never reassigned;
    /// the array grows monotonically and is never trimmed.
    submission_states: Vec<Option<SubmissionState>>,
    modules: ModuleCache,
    globals: FxHashMap<String, GlobalVariable>,
    cancellation: CancellationToken,
    /// The thread currently running an entry point, cleared in the same
    /// completion path that publishes the evaluated phase.
    current_run: Option<std::thread::ThreadId>,
    initialized_integration: bool,
}

impl EvaluationContext {
    pub fn new(
        id: EvaluationContextId,
        scratch_dir: std::path::PathBuf,
        mapper: Option<Arc<dyn NativeDependencyMapper>>,
    ) -> Self {
        Self {
            id,
            submission_states: vec![Some(SubmissionState::default()), None],
            modules: ModuleCache::new(scratch_dir, mapper),
            globals: FxHashMap::default(),
            cancellation: CancellationToken::new(),
            current_run: None,
            initialized_integration: false,
        }
    }

    pub fn id(&self) -> EvaluationContextId {
        self.id
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn modules_mut(&mut self) -> &mut ModuleCache {
        &mut self.modules
    }

    pub fn submission_state_len(&self) -> usize {
        self.submission_states.len()
    }

    pub fn global_variables(&self) -> impl Iterator<Item = &GlobalVariable> {
        self.globals.values()
    }

    pub fn has_initialized_integration(&self) -> bool {
        self.initialized_integration
    }

    /// Discard the submission-state array and module cache. The global
    /// slot is re-created fresh; prior state is unrecoverable.
    pub fn reset(&mut self) {
        self.submission_states = vec![Some(SubmissionState::default()), None];
        self.modules.clear();
        self.globals.clear();
        self.cancellation.reset();
        self.current_run = None;
        self.initialized_integration = false;
    }

    /// Run one compilation through the phase machine, loading its
    /// executable module and invoking the entry point.
    pub fn evaluate(&mut self, compilation: &Compilation, services: &EvaluationServices) -> Evaluation {
        let integrations = services.integrations.clone();
        let mut invoke = move |modules: &mut ModuleCache, input: &EntryInput| {
            Self::invoke_compiled(modules, &integrations, compilation, input)
        };
        self.evaluate_inner(compilation, services, &mut invoke)
    }

    /// The phase machine proper, with the entry invocation injected so the
    /// machinery is exercisable without real compiled modules.
    pub(crate) fn evaluate_inner(
        &mut self,
        compilation: &Compilation,
        services: &EvaluationServices,
        invoke: &mut dyn FnMut(&mut ModuleCache, &EntryInput) -> InvokeOutcome,
    ) -> Evaluation {
        let cell_id = compilation.cell_id;

        // Compiled: the in-flight record exists, capture is installed and
        // the timer starts.
        let mut in_flight = EvaluationInFlight::compiled(cell_id);
        services
            .sink
            .on_event(AgentEvent::InFlight(in_flight.clone()));

        let capture = if services.capture_output {
            CaptureGuard::install(cell_id, services.sink.clone()).unwrap_or_else(|e| {
                tracing::warn!("failed to install output capture: {e}");
                CaptureGuard::disabled()
            })
        } else {
            CaptureGuard::disabled()
        };

        let started = Instant::now();
        self.current_run = Some(std::thread::current().id());
        self.modules.drain_newly_loaded();

        self.grow_submission_states(compilation.submission_number);

        let outcome = if self.cancellation.is_cancelled() {
            // The cooperative token tripped before the entry point ran.
            InvokeOutcome {
                interrupted: true,
                ..Default::default()
            }
        } else {
            let input = EntryInput {
                states: self.submission_states.clone(),
            };
            invoke(&mut self.modules, &input)
        };

        // The completion path: clear the run marker and restore the
        // swapped writers unconditionally, then publish the evaluated
        // phase with the raw result. Restoration comes first so nothing
        // an observer writes while handling the event is captured and
        // mis-attributed to the cell.
        let duration = started.elapsed();
        self.current_run = None;

        drop(capture);

        in_flight = in_flight.with_phase(EvaluationPhase::Evaluated);
        in_flight.original_value = outcome.value_json.clone();
        services
            .sink
            .on_event(AgentEvent::InFlight(in_flight.clone()));

        if outcome.exception.is_none() && !outcome.interrupted {
            self.store_declarations(compilation.submission_number, &outcome.declarations);
        }

        let status = if outcome.interrupted {
            EvaluationStatus::Interrupted
        } else if outcome.exception.is_some() {
            EvaluationStatus::EvaluationException
        } else {
            EvaluationStatus::Success
        };

        let result_handling = if outcome.exception.is_some() {
            ResultHandling::Replace
        } else if outcome.interrupted
            || (outcome.value_json.is_none() && !compilation.result_is_expression)
        {
            ResultHandling::Ignore
        } else {
            ResultHandling::Replace
        };

        // Represented: the raw value goes through the representation seam
        // and the evaluation record is assembled.
        let result = match (&outcome.exception, &outcome.value_json) {
            (None, Some(value_json)) => Some(
                services
                    .representer
                    .prepare(value_json, outcome.value_type.as_deref()),
            ),
            _ => None,
        };

        self.initialized_integration |= outcome.initialized_integration;

        let evaluation = Evaluation {
            cell_id,
            status,
            result_handling,
            result,
            exception: outcome.exception.clone(),
            duration,
            culture: Culture::current(),
            ui_culture: Culture::current(),
            interrupted: outcome.interrupted,
            initialized_integration: outcome.initialized_integration,
            loaded_modules: outcome.loaded_modules,
        };

        in_flight = in_flight.with_phase(EvaluationPhase::Represented);
        in_flight.evaluation = Some(evaluation.clone());
        services
            .sink
            .on_event(AgentEvent::InFlight(in_flight.clone()));

        // Completed: publish the evaluation record, then the terminal
        // phase. The record is frozen from here on.
        services
            .sink
            .on_event(AgentEvent::Evaluation(evaluation.clone()));

        in_flight = in_flight.with_phase(EvaluationPhase::Completed);
        services.sink.on_event(AgentEvent::InFlight(in_flight));

        // A recorded failure is also a stream-level error: two independent
        // signals of the same outcome.
        if let Some(exception) = &evaluation.exception {
            services.sink.on_event(AgentEvent::EvaluationError {
                cell_id,
                exception: exception.clone(),
            });
        }

        evaluation
    }

    /// Load and run the compilation's executable module.
    fn invoke_compiled(
        modules: &mut ModuleCache,
        integrations: &IntegrationRegistry,
        compilation: &Compilation,
        input: &EntryInput,
    ) -> InvokeOutcome {
        let mut outcome = InvokeOutcome::default();

        modules.add_definitions(compilation.references.iter().cloned());

        if let Some(executable) = &compilation.executable {
            match modules.load_definition(executable) {
                Ok(module) => {
                    match integrations.try_activate(&module) {
                        Ok(activated) => outcome.initialized_integration |= activated,
                        Err(e) => {
                            tracing::error!(module = %module.id, "integration activation failed: {e}")
                        }
                    }

                    match module.invoke(input) {
                        Ok(EntryInvocation::Completed(output)) => {
                            outcome.value_json = output.result_json;
                            outcome.value_type = output.result_type_name;
                            outcome.declarations = output.declarations;
                            outcome.exception = output.error.map(Self::exception_from);
                        }
                        Ok(EntryInvocation::Interrupted) => outcome.interrupted = true,
                        Ok(EntryInvocation::Panicked { message }) => {
                            outcome.exception = Some(ExceptionInfo::new("Panic", message));
                        }
                        Err(e) => {
                            // Attributable to the executing submission's
                            // module, so it surfaces through the exception
                            // field rather than unwinding the agent.
                            outcome.exception =
                                Some(ExceptionInfo::new("ModuleInvocationError", e.to_string()));
                        }
                    }
                }
                Err(e) => {
                    outcome.exception =
                        Some(ExceptionInfo::new("ModuleResolutionError", e.to_string()));
                }
            }
        }

        outcome.loaded_modules = modules.drain_newly_loaded();
        outcome
    }

    fn exception_from(error: EntryError) -> ExceptionInfo {
        fn convert(error: EntryError) -> ExceptionInfo {
            ExceptionInfo {
                type_name: error.type_name,
                message: error.message,
                inner: error.inner.map(|inner| Box::new(convert(*inner))),
            }
        }
        convert(error.unwrap_singly_wrapped())
    }

    /// Grow the submission-state array to hold `required_slot`, at least
    /// doubling, preserving existing slots.
    fn grow_submission_states(&mut self, required_slot: usize) {
        let len = self.submission_states.len();
        if required_slot >= len {
            let new_len = (required_slot + 1).max(len * 2);
            self.submission_states.resize(new_len, None);
        }
    }

    fn store_declarations(&mut self, slot: usize, declarations: &[Declaration]) {
        if slot == 0 {
            // Slot 0 belongs to the global object and is never reassigned.
            tracing::warn!("refusing to store a submission into the global slot");
            return;
        }

        self.submission_states[slot] = Some(SubmissionState {
            declarations: declarations.to_vec(),
        });

        for declaration in declarations {
            self.globals.insert(
                declaration.name.clone(),
                GlobalVariable {
                    name: declaration.name.clone(),
                    type_name: declaration.type_name.clone(),
                    value_json: declaration.value_json.clone(),
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use uuid::Uuid;

    use folio_core::compile::EvaluationEnvironment;
    use folio_core::graph::CellId;

    use crate::represent::DisplayRepresenter;

    struct CollectingSink {
        events: Mutex<Vec<AgentEvent>>,
    }

    impl CollectingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
            })
        }

        fn phases(&self) -> Vec<EvaluationPhase> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|event| match event {
                    AgentEvent::InFlight(in_flight) => Some(in_flight.phase),
                    _ => None,
                })
                .collect()
        }

        fn stream_errors(&self) -> usize {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|event| matches!(event, AgentEvent::EvaluationError { .. }))
                .count()
        }
    }

    impl AgentEventSink for CollectingSink {
        fn on_event(&self, event: AgentEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn services(sink: Arc<CollectingSink>) -> EvaluationServices {
        EvaluationServices {
            sink,
            representer: Arc::new(DisplayRepresenter),
            integrations: Arc::new(IntegrationRegistry::new()),
            capture_output: false,
        }
    }

    fn context() -> EvaluationContext {
        EvaluationContext::new(
            EvaluationContextId::new(1),
            std::env::temp_dir().join("folio-context-tests"),
            None,
        )
    }

    fn compilation(submission_number: usize, result_is_expression: bool) -> Compilation {
        Compilation {
            cell_id: CellId::new(Uuid::new_v4()),
            submission_number,
            evaluation_context_id: EvaluationContextId::new(1),
            environment: EvaluationEnvironment::default(),
            result_is_expression,
            executable: None,
            references: Vec::new(),
        }
    }

    fn all_phases() -> Vec<EvaluationPhase> {
        vec![
            EvaluationPhase::Compiled,
            EvaluationPhase::Evaluated,
            EvaluationPhase::Represented,
            EvaluationPhase::Completed,
        ]
    }

    #[test]
    fn test_success_phase_order() {
        let sink = CollectingSink::new();
        let mut context = context();
        let compilation = compilation(1, true);

        let evaluation = context.evaluate_inner(
            &compilation,
            &services(sink.clone()),
            &mut |_modules, _input| InvokeOutcome {
                value_json: Some("42".to_string()),
                value_type: Some("i64".to_string()),
                ..Default::default()
            },
        );

        assert_eq!(sink.phases(), all_phases());
        assert_eq!(evaluation.status, EvaluationStatus::Success);
        assert_eq!(evaluation.result_handling, ResultHandling::Replace);
        assert_eq!(
            evaluation.result.as_ref().unwrap().representations,
            vec!["42".to_string()]
        );
        assert_eq!(sink.stream_errors(), 0);
    }

    #[test]
    fn test_failure_still_walks_every_phase_and_raises_stream_error() {
        let sink = CollectingSink::new();
        let mut context = context();
        let compilation = compilation(1, true);

        let evaluation = context.evaluate_inner(
            &compilation,
            &services(sink.clone()),
            &mut |_modules, _input| InvokeOutcome {
                exception: Some(ExceptionInfo::new("ValueError", "bad value")),
                ..Default::default()
            },
        );

        assert_eq!(sink.phases(), all_phases());
        assert_eq!(evaluation.status, EvaluationStatus::EvaluationException);
        assert_eq!(evaluation.exception.as_ref().unwrap().type_name, "ValueError");
        assert_eq!(sink.stream_errors(), 1);
        assert!(evaluation.result.is_none());
    }

    #[test]
    fn test_pre_cancelled_token_interrupts_without_invoking() {
        let sink = CollectingSink::new();
        let mut context = context();
        context.cancellation().cancel();
        let compilation = compilation(1, true);

        let mut invoked = false;
        let evaluation = context.evaluate_inner(
            &compilation,
            &services(sink.clone()),
            &mut |_modules, _input| {
                invoked = true;
                InvokeOutcome::default()
            },
        );

        assert!(!invoked);
        assert!(evaluation.interrupted);
        assert_eq!(evaluation.status, EvaluationStatus::Interrupted);
        assert_eq!(evaluation.result_handling, ResultHandling::Ignore);
        assert!(evaluation.exception.is_none());
        assert_eq!(sink.phases(), all_phases());
    }

    #[test]
    fn test_unit_result_of_statement_cell_is_ignored() {
        let sink = CollectingSink::new();
        let mut context = context();
        let compilation = compilation(1, false);

        let evaluation = context.evaluate_inner(
            &compilation,
            &services(sink),
            &mut |_modules, _input| InvokeOutcome::default(),
        );

        assert_eq!(evaluation.status, EvaluationStatus::Success);
        assert_eq!(evaluation.result_handling, ResultHandling::Ignore);
    }

    #[test]
    fn test_submission_state_growth_preserves_slots() {
        let sink = CollectingSink::new();
        let mut context = context();
        assert_eq!(context.submission_state_len(), 2);

        let evaluation_services = services(sink);
        let first = compilation(1, false);
        context.evaluate_inner(&first, &evaluation_services, &mut |_modules, _input| {
            InvokeOutcome {
                declarations: vec![Declaration {
                    name: "x".to_string(),
                    type_name: Some("i64".to_string()),
                    value_json: "1".to_string(),
                }],
                ..Default::default()
            }
        });

        // Jumping to slot 5 grows to at least 6, doubling from 2 → 6.
        let later = compilation(5, false);
        let mut seen_states = 0;
        context.evaluate_inner(&later, &evaluation_services, &mut |_modules, input| {
            seen_states = input.states.len();
            // Slot 0 (global) and slot 1 (x) survived the growth.
            assert!(input.states[0].is_some());
            assert_eq!(input.states[1].as_ref().unwrap().declarations[0].name, "x");
            InvokeOutcome::default()
        });

        assert!(seen_states >= 6);
        assert!(context.submission_state_len() >= 6);
        assert!(context.submission_states[0].is_some());
    }

    #[test]
    fn test_declarations_feed_the_globals_registry() {
        let sink = CollectingSink::new();
        let mut context = context();
        let evaluation_services = services(sink);

        context.evaluate_inner(&compilation(1, false), &evaluation_services, &mut |_m, _i| {
            InvokeOutcome {
                declarations: vec![Declaration {
                    name: "total".to_string(),
                    type_name: Some("f64".to_string()),
                    value_json: "3.5".to_string(),
                }],
                ..Default::default()
            }
        });

        let globals: Vec<_> = context.global_variables().collect();
        assert_eq!(globals.len(), 1);
        assert_eq!(globals[0].name, "total");
        assert_eq!(globals[0].value_json, "3.5");

        // A later cell shadowing the name replaces the entry.
        context.evaluate_inner(&compilation(2, false), &evaluation_services, &mut |_m, _i| {
            InvokeOutcome {
                declarations: vec![Declaration {
                    name: "total".to_string(),
                    type_name: Some("f64".to_string()),
                    value_json: "7.0".to_string(),
                }],
                ..Default::default()
            }
        });

        let globals: Vec<_> = context.global_variables().collect();
        assert_eq!(globals.len(), 1);
        assert_eq!(globals[0].value_json, "7.0");
    }

    #[test]
    fn test_failed_evaluation_does_not_store_state() {
        let sink = CollectingSink::new();
        let mut context = context();
        let evaluation_services = services(sink);

        context.evaluate_inner(&compilation(1, false), &evaluation_services, &mut |_m, _i| {
            InvokeOutcome {
                declarations: vec![Declaration {
                    name: "x".to_string(),
                    type_name: None,
                    value_json: "1".to_string(),
                }],
                exception: Some(ExceptionInfo::new("Boom", "boom")),
                ..Default::default()
            }
        });

        assert_eq!(context.global_variables().count(), 0);

        // The context stays usable: a following cell sees no slot for the
        // failed submission and can still run.
        let evaluation =
            context.evaluate_inner(&compilation(2, false), &evaluation_services, &mut |_m, input| {
                assert!(input.states[1].is_none());
                InvokeOutcome::default()
            });
        assert_eq!(evaluation.status, EvaluationStatus::Success);
    }

    #[test]
    fn test_reset_discards_state_but_keeps_global_slot() {
        let sink = CollectingSink::new();
        let mut context = context();
        let evaluation_services = services(sink);

        context.evaluate_inner(&compilation(1, false), &evaluation_services, &mut |_m, _i| {
            InvokeOutcome {
                declarations: vec![Declaration {
                    name: "x".to_string(),
                    type_name: None,
                    value_json: "1".to_string(),
                }],
                ..Default::default()
            }
        });

        context.reset();
        assert_eq!(context.submission_state_len(), 2);
        assert_eq!(context.global_variables().count(), 0);
        assert!(context.submission_states[0].is_some());
    }

    #[cfg(unix)]
    #[test]
    fn test_output_segments_are_tagged_with_the_cell() {
        use std::io::Write;

        let sink = CollectingSink::new();
        let mut context = context();
        let compilation = compilation(1, false);
        let mut evaluation_services = services(sink.clone());
        evaluation_services.capture_output = true;

        context.evaluate_inner(&compilation, &evaluation_services, &mut |_m, _i| {
            std::io::stdout().write_all(b"x").unwrap();
            std::io::stdout().flush().unwrap();
            std::io::stdout().write_all(b"y").unwrap();
            std::io::stdout().flush().unwrap();
            InvokeOutcome::default()
        });

        let events = sink.events.lock().unwrap();
        let captured: String = events
            .iter()
            .filter_map(|event| match event {
                AgentEvent::Output(segment) if segment.cell_id == compilation.cell_id => {
                    Some(segment.value.as_str())
                }
                _ => None,
            })
            .collect();
        assert_eq!(captured, "xy");

        // Phase events are all present alongside the segments.
        drop(events);
        assert_eq!(sink.phases(), all_phases());
    }
}

//! The evaluation context manager: registry of contexts, configuration
//! finalization, and the evaluation worker dispatch.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;

use folio_core::compile::{
    Compilation, CompilationConfiguration, EvaluationContextId, ModuleDefinition,
    TargetCapabilityHints, TypeDescriptor,
};
use folio_core::error::{Error, Result};
use folio_core::evaluating::{Culture, Evaluation, EvaluationStatus, ResultHandling};
use folio_core::graph::CellId;
use folio_core::ipc::{AgentEvent, AgentEventSink, ModuleLoadResult};

use crate::context::{CancellationToken, EvaluationContext, EvaluationServices};
use crate::represent::{DisplayRepresenter, Representer};
use crate::resolve::{IntegrationRegistry, NativeDependencyMapper};

/// Imports every submission starts with.
const DEFAULT_IMPORTS: &[&str] = &["std::prelude::v1::*"];

/// Diagnostics suppressed by default: interactive cells routinely leave
/// declarations unused until a later cell picks them up.
const DEFAULT_SUPPRESSED_DIAGNOSTICS: &[&str] = &["unused_variables", "unused_imports", "dead_code"];

/// Type descriptor for the context's persistent global object.
const GLOBAL_OBJECT_TYPE: &str = "folio_agent::GlobalObject";

/// Manager construction options.
#[derive(Clone)]
pub struct ManagerOptions {
    /// Where transmitted module images are materialized.
    pub scratch_dir: PathBuf,
    /// Whether evaluations capture stdout/stderr.
    pub capture_output: bool,
}

struct ContextRegistration {
    context: Arc<Mutex<EvaluationContext>>,
    cancellation: CancellationToken,
    in_flight: Arc<AtomicBool>,
}

/// Clears the in-flight marker when an evaluation worker exits, however
/// it exits.
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Hosts the evaluation contexts of one agent process.
pub struct EvaluationContextManager {
    contexts: FxHashMap<EvaluationContextId, ContextRegistration>,
    /// Monotonic id source, owned here rather than process-global.
    next_context_id: u32,
    representer: Arc<dyn Representer>,
    integrations: Arc<IntegrationRegistry>,
    mapper: Option<Arc<dyn NativeDependencyMapper>>,
    reset_handlers: Vec<Box<dyn Fn() + Send + Sync>>,
    sink: Arc<dyn AgentEventSink>,
    options: ManagerOptions,
}

impl EvaluationContextManager {
    pub fn new(sink: Arc<dyn AgentEventSink>, options: ManagerOptions) -> Self {
        Self {
            contexts: FxHashMap::default(),
            next_context_id: 1,
            representer: Arc::new(DisplayRepresenter),
            integrations: Arc::new(IntegrationRegistry::new()),
            mapper: None,
            reset_handlers: Vec::new(),
            sink,
            options,
        }
    }

    pub fn with_representer(mut self, representer: Arc<dyn Representer>) -> Self {
        self.representer = representer;
        self
    }

    pub fn with_native_dependency_mapper(
        mut self,
        mapper: Arc<dyn NativeDependencyMapper>,
    ) -> Self {
        self.mapper = Some(mapper);
        self
    }

    /// Create a fresh evaluation context and finalize the compilation
    /// configuration the host's backend will compile against.
    pub fn initialize_context(
        &mut self,
        hints: &TargetCapabilityHints,
    ) -> CompilationConfiguration {
        let id = EvaluationContextId::new(self.next_context_id);
        self.next_context_id += 1;

        let context = EvaluationContext::new(
            id,
            self.options.scratch_dir.join(id.to_string()),
            self.mapper.clone(),
        );
        let cancellation = context.cancellation();

        self.contexts.insert(
            id,
            ContextRegistration {
                context: Arc::new(Mutex::new(context)),
                cancellation,
                in_flight: Arc::new(AtomicBool::new(false)),
            },
        );

        tracing::info!(context = %id, os = %hints.host_os, "initialized evaluation context");

        CompilationConfiguration {
            evaluation_context_id: id,
            default_imports: DEFAULT_IMPORTS.iter().map(|s| s.to_string()).collect(),
            default_suppressed_diagnostics: DEFAULT_SUPPRESSED_DIAGNOSTICS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            global_object_type: Some(TypeDescriptor {
                name: GLOBAL_OBJECT_TYPE.to_string(),
                module: None,
            }),
            include_inline_images: hints.request_inline_images,
        }
    }

    fn registration(&self, id: EvaluationContextId) -> Result<&ContextRegistration> {
        self.contexts
            .get(&id)
            .ok_or_else(|| Error::InvalidOperation(format!("no evaluation context {id}")))
    }

    /// Register and materialize module definitions in a context.
    pub fn load_modules(
        &mut self,
        id: EvaluationContextId,
        modules: &[ModuleDefinition],
    ) -> Result<Vec<ModuleLoadResult>> {
        let registration = self.registration(id)?;
        let mut context = registration.context.lock().unwrap();

        let mut results = Vec::with_capacity(modules.len());
        for definition in modules {
            context.modules_mut().add_definitions([definition.clone()]);

            match context.modules_mut().load_definition(definition) {
                Ok(module) => {
                    let initialized_integration = match self.integrations.try_activate(&module) {
                        Ok(activated) => activated,
                        Err(e) => {
                            tracing::error!(module = %module.id, "integration activation failed: {e}");
                            false
                        }
                    };
                    results.push(ModuleLoadResult {
                        name: definition.id.name.clone(),
                        success: true,
                        initialized_integration,
                        message: None,
                    });
                }
                Err(e) => results.push(ModuleLoadResult {
                    name: definition.id.name.clone(),
                    success: false,
                    initialized_integration: false,
                    message: Some(e.to_string()),
                }),
            }
        }

        Ok(results)
    }

    /// Dispatch one evaluation onto a dedicated worker thread. Returns as
    /// soon as the worker is launched; outcomes stream through the sink.
    ///
    /// The protocol allows one in-flight evaluation per context; a second
    /// request while one is running is refused.
    pub fn evaluate(&mut self, id: EvaluationContextId, compilation: Compilation) -> Result<()> {
        let registration = self.registration(id)?;

        if registration.in_flight.swap(true, Ordering::SeqCst) {
            return Err(Error::InvalidOperation(format!(
                "an evaluation is already in flight for {id}"
            )));
        }

        registration.cancellation.reset();

        let context = registration.context.clone();
        let guard = InFlightGuard(registration.in_flight.clone());
        let services = EvaluationServices {
            sink: self.sink.clone(),
            representer: self.representer.clone(),
            integrations: self.integrations.clone(),
            capture_output: self.options.capture_output,
        };

        std::thread::Builder::new()
            .name(format!("folio-eval-{}", id.as_u32()))
            .spawn(move || {
                let _guard = guard;
                let mut context = context.lock().unwrap();
                let evaluation = context.evaluate(&compilation, &services);
                tracing::debug!(
                    cell = %evaluation.cell_id,
                    status = ?evaluation.status,
                    "evaluation completed"
                );
            })
            .map_err(|e| Error::Ipc(format!("failed to start evaluation worker: {e}")))?;

        Ok(())
    }

    /// Discard a context's submission states and module cache, then run
    /// the registered reset handlers.
    pub fn reset_state(&mut self, id: EvaluationContextId) -> Result<()> {
        let registration = self.registration(id)?;
        registration.context.lock().unwrap().reset();

        for handler in &self.reset_handlers {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler()));
            if result.is_err() {
                tracing::error!("reset state handler panicked");
            }
        }

        Ok(())
    }

    /// Trip the cooperative cancellation token of a context's in-flight
    /// evaluation.
    pub fn interrupt(&mut self, id: EvaluationContextId) -> Result<()> {
        let registration = self.registration(id)?;
        registration.cancellation.cancel();
        Ok(())
    }

    /// Register a callback invoked whenever a context's state is reset.
    pub fn register_reset_handler(&mut self, handler: impl Fn() + Send + Sync + 'static) {
        self.reset_handlers.push(Box::new(handler));
    }

    /// Publish a value for a cell outside an evaluation, on behalf of a
    /// host integration.
    pub fn publish_value_for_cell(
        &self,
        cell_id: CellId,
        value_json: &str,
        result_handling: ResultHandling,
    ) {
        let result = self.representer.prepare(value_json, None);
        self.sink.on_event(AgentEvent::Evaluation(Evaluation {
            cell_id,
            status: EvaluationStatus::Success,
            result_handling,
            result: Some(result),
            exception: None,
            duration: std::time::Duration::ZERO,
            culture: Culture::current(),
            ui_culture: Culture::current(),
            interrupted: false,
            initialized_integration: false,
            loaded_modules: Vec::new(),
        }));
    }

    /// Whether a context currently has an evaluation in flight.
    pub fn is_evaluating(&self, id: EvaluationContextId) -> bool {
        self.contexts
            .get(&id)
            .is_some_and(|registration| registration.in_flight.load(Ordering::SeqCst))
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use uuid::Uuid;

    use folio_core::compile::EvaluationEnvironment;

    struct CollectingSink {
        events: StdMutex<Vec<AgentEvent>>,
    }

    impl AgentEventSink for CollectingSink {
        fn on_event(&self, event: AgentEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn manager() -> (EvaluationContextManager, Arc<CollectingSink>) {
        let sink = Arc::new(CollectingSink {
            events: StdMutex::new(Vec::new()),
        });
        let manager = EvaluationContextManager::new(
            sink.clone(),
            ManagerOptions {
                scratch_dir: std::env::temp_dir().join("folio-manager-tests"),
                capture_output: false,
            },
        );
        (manager, sink)
    }

    fn hints() -> TargetCapabilityHints {
        TargetCapabilityHints {
            host_os: "linux".to_string(),
            request_inline_images: false,
        }
    }

    fn empty_compilation(context_id: EvaluationContextId) -> Compilation {
        Compilation {
            cell_id: CellId::new(Uuid::new_v4()),
            submission_number: 1,
            evaluation_context_id: context_id,
            environment: EvaluationEnvironment::default(),
            result_is_expression: false,
            executable: None,
            references: Vec::new(),
        }
    }

    fn wait_for_terminal_evaluation(sink: &CollectingSink) -> Evaluation {
        for _ in 0..200 {
            {
                let events = sink.events.lock().unwrap();
                if let Some(evaluation) = events.iter().find_map(|event| match event {
                    AgentEvent::Evaluation(evaluation) => Some(evaluation.clone()),
                    _ => None,
                }) {
                    return evaluation;
                }
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("no terminal evaluation arrived");
    }

    #[test]
    fn test_context_ids_are_monotonic() {
        let (mut manager, _sink) = manager();
        let first = manager.initialize_context(&hints());
        let second = manager.initialize_context(&hints());
        assert!(second.evaluation_context_id > first.evaluation_context_id);
        assert_eq!(manager.context_count(), 2);
    }

    #[test]
    fn test_configuration_carries_defaults() {
        let (mut manager, _sink) = manager();
        let configuration = manager.initialize_context(&TargetCapabilityHints {
            host_os: "linux".to_string(),
            request_inline_images: true,
        });
        assert!(!configuration.default_imports.is_empty());
        assert!(!configuration.default_suppressed_diagnostics.is_empty());
        assert!(configuration.global_object_type.is_some());
        assert!(configuration.include_inline_images);
    }

    #[test]
    fn test_unknown_context_is_refused() {
        let (mut manager, _sink) = manager();
        let ghost = EvaluationContextId::new(99);
        assert!(manager.reset_state(ghost).is_err());
        assert!(manager.interrupt(ghost).is_err());
        assert!(manager
            .evaluate(ghost, empty_compilation(ghost))
            .is_err());
    }

    #[test]
    fn test_evaluate_streams_a_terminal_record() {
        let (mut manager, sink) = manager();
        let configuration = manager.initialize_context(&hints());
        let id = configuration.evaluation_context_id;

        manager.evaluate(id, empty_compilation(id)).unwrap();

        let evaluation = wait_for_terminal_evaluation(&sink);
        assert_eq!(evaluation.status, EvaluationStatus::Success);
        assert_eq!(evaluation.result_handling, ResultHandling::Ignore);

        // The in-flight marker clears once the worker finishes.
        for _ in 0..200 {
            if !manager.is_evaluating(id) {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!manager.is_evaluating(id));
    }

    #[test]
    fn test_reset_handlers_run() {
        let (mut manager, _sink) = manager();
        let configuration = manager.initialize_context(&hints());
        let id = configuration.evaluation_context_id;

        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let handler_calls = calls.clone();
        manager.register_reset_handler(move || {
            handler_calls.fetch_add(1, Ordering::SeqCst);
        });

        manager.reset_state(id).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_publish_value_for_cell() {
        let (manager, sink) = manager();
        let cell_id = CellId::new(Uuid::new_v4());
        manager.publish_value_for_cell(cell_id, "\"chart\"", ResultHandling::Append);

        let events = sink.events.lock().unwrap();
        match events.as_slice() {
            [AgentEvent::Evaluation(evaluation)] => {
                assert_eq!(evaluation.cell_id, cell_id);
                assert_eq!(evaluation.result_handling, ResultHandling::Append);
                assert_eq!(
                    evaluation.result.as_ref().unwrap().representations,
                    vec!["\"chart\"".to_string()]
                );
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }
}

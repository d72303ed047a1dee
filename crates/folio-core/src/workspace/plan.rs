//! Evaluation planning: deciding which cells a request must (re)run.

use crate::error::{Error, Result};
use crate::graph::CellId;

use super::WorkspaceHost;

/// The set of cells one evaluation request will run, in chain order.
#[derive(Debug, Clone, Default)]
pub struct EvaluationPlan {
    /// The walk reached the graph head while selecting, or everything is
    /// being re-run: the agent's execution context must be reinitialized.
    pub should_reset_state: bool,
    /// The target was the last cell; the caller may want to auto-create a
    /// trailing cell after a successful run.
    pub should_maybe_start_new_cell: bool,
    pub cells: Vec<CellId>,
}

impl WorkspaceHost {
    /// Compute the evaluation plan for a target cell, or for the whole
    /// graph when `target` is `None`.
    ///
    /// A target id that is not in the graph is a caller error.
    pub fn evaluation_plan(&mut self, target: Option<CellId>) -> Result<EvaluationPlan> {
        let mut plan = EvaluationPlan::default();
        let order = self.graph().topologically_sorted_cell_ids();

        let target_index = match target {
            None => {
                plan.should_reset_state = true;
                plan.cells = order;
                return Ok(plan);
            }
            Some(target) => order
                .iter()
                .position(|&id| id == target)
                .ok_or_else(|| Error::CellNotFound(target.to_string()))?,
        };

        // Starting with the target and working backwards to the head,
        // pick up every cell whose state can no longer be trusted.
        for index in (0..=target_index).rev() {
            let cell_id = order[index];
            let is_target = index == target_index;

            let mut should_evaluate = is_target
                || self
                    .graph()
                    .cell(cell_id)
                    .is_some_and(|cell| cell.is_evaluation_candidate());

            // An unchanged buffer whose external file dependencies moved
            // underneath it must recompile anyway; force the backend to
            // drop its cached state for the cell.
            if !should_evaluate && self.file_dependencies_stale(cell_id) {
                should_evaluate = true;
                self.backend_mut().invalidate(cell_id);
                if let Some(cell) = self.graph_mut().cell_mut(cell_id) {
                    cell.dirty = true;
                }
            }

            if should_evaluate {
                plan.should_reset_state |= index == 0;
                plan.cells.insert(0, cell_id);
            }
        }

        // Cells after the target that have run before depend on state the
        // batch is about to replace, so they run again too. Stop at the
        // first cell that previously terminated the agent: its consequences
        // are unknown until the user explicitly re-runs it.
        for &cell_id in &order[target_index + 1..] {
            let Some(cell) = self.graph().cell(cell_id) else {
                continue;
            };
            if cell.agent_terminated_while_evaluating {
                break;
            }
            if cell.evaluation_count > 0 {
                plan.cells.push(cell_id);
            }
        }

        plan.should_maybe_start_new_cell = target_index == order.len() - 1;

        Ok(plan)
    }

    /// Whether an externally-loaded dependency of this cell changed since
    /// its last compile, forcing recompilation of an unchanged buffer.
    pub fn should_invalidate_cell_buffer(&self, cell_id: CellId) -> bool {
        self.file_dependencies_stale(cell_id)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use crate::compile::{
        CompilationBackend, CompileRequest, CompileResult, Diagnostic,
        EvaluationEnvironment,
    };
    use crate::graph::CellId;
    use crate::workspace::WorkspaceHost;

    /// A backend that treats every buffer as complete and records
    /// invalidation calls.
    struct StubBackend {
        invalidated: Vec<CellId>,
    }

    impl StubBackend {
        fn boxed() -> Box<Self> {
            Box::new(Self {
                invalidated: Vec::new(),
            })
        }
    }

    impl CompilationBackend for StubBackend {
        fn is_complete(&self, _buffer: &str) -> bool {
            true
        }

        fn buffer_diagnostics(&mut self, _cell_id: CellId, _buffer: &str) -> Vec<Diagnostic> {
            Vec::new()
        }

        fn external_file_dependencies(&self, _buffer: &str) -> Vec<PathBuf> {
            Vec::new()
        }

        fn invalidate(&mut self, cell_id: CellId) {
            self.invalidated.push(cell_id);
        }

        fn compile(&mut self, _request: CompileRequest) -> crate::Result<CompileResult> {
            unreachable!("plan tests never compile")
        }
    }

    fn host() -> WorkspaceHost {
        WorkspaceHost::new(StubBackend::boxed(), EvaluationEnvironment::default())
    }

    /// Build a host with `n` cells that all look previously evaluated and
    /// clean.
    fn settled_host(n: usize) -> (WorkspaceHost, Vec<CellId>) {
        let mut host = host();
        let mut ids = Vec::new();
        for i in 0..n {
            ids.push(host.append_cell(format!("cell {i}")).unwrap());
        }
        for &id in &ids {
            let cell = host.graph_mut().cell_mut(id).unwrap();
            cell.dirty = false;
            cell.evaluation_count = 1;
        }
        (host, ids)
    }

    #[test]
    fn test_evaluate_all_selects_everything_and_resets() {
        let (mut host, ids) = settled_host(3);
        let plan = host.evaluation_plan(None).unwrap();
        assert!(plan.should_reset_state);
        assert_eq!(plan.cells, ids);
    }

    #[test]
    fn test_unknown_target_is_a_caller_error() {
        let (mut host, _) = settled_host(2);
        let ghost = CellId::new(uuid::Uuid::new_v4());
        assert!(host.evaluation_plan(Some(ghost)).is_err());
    }

    #[test]
    fn test_plan_minimality() {
        // A→B→C→D all evaluated and unmodified: requesting C selects
        // exactly {C, D} and never re-selects A or B.
        let (mut host, ids) = settled_host(4);
        let plan = host.evaluation_plan(Some(ids[2])).unwrap();
        assert_eq!(plan.cells, vec![ids[2], ids[3]]);
        assert!(!plan.should_reset_state);
        assert!(!plan.should_maybe_start_new_cell);
    }

    #[test]
    fn test_reset_propagation_from_dirty_head() {
        // A dirty, B C D settled: evaluating D selects all four and resets
        // because the walk reached the head.
        let (mut host, ids) = settled_host(4);
        host.graph_mut().cell_mut(ids[0]).unwrap().dirty = true;
        let plan = host.evaluation_plan(Some(ids[3])).unwrap();
        assert_eq!(plan.cells, ids);
        assert!(plan.should_reset_state);
        assert!(plan.should_maybe_start_new_cell);
    }

    #[test]
    fn test_never_evaluated_cells_are_candidates() {
        let (mut host, ids) = settled_host(3);
        host.graph_mut().cell_mut(ids[1]).unwrap().evaluation_count = 0;
        let plan = host.evaluation_plan(Some(ids[2])).unwrap();
        assert_eq!(plan.cells, vec![ids[1], ids[2]]);
        assert!(!plan.should_reset_state);
    }

    #[test]
    fn test_outdated_cells_are_candidates() {
        let (mut host, ids) = settled_host(3);
        host.graph_mut().cell_mut(ids[0]).unwrap().outdated = true;
        let plan = host.evaluation_plan(Some(ids[1])).unwrap();
        assert_eq!(plan.cells, vec![ids[0], ids[1], ids[2]]);
        assert!(plan.should_reset_state);
    }

    #[test]
    fn test_forward_walk_skips_never_evaluated() {
        let (mut host, ids) = settled_host(4);
        host.graph_mut().cell_mut(ids[3]).unwrap().evaluation_count = 0;
        let plan = host.evaluation_plan(Some(ids[1])).unwrap();
        // D never ran, so it is not pulled in by the forward walk.
        assert_eq!(plan.cells, vec![ids[1], ids[2]]);
    }

    #[test]
    fn test_forward_walk_stops_at_terminated_cell() {
        let (mut host, ids) = settled_host(5);
        host.graph_mut()
            .cell_mut(ids[2])
            .unwrap()
            .agent_terminated_while_evaluating = true;
        let plan = host.evaluation_plan(Some(ids[0])).unwrap();
        // The walk stops at C; C, D and E stay unselected even though D
        // and E ran before.
        assert_eq!(plan.cells, vec![ids[0], ids[1]]);
    }

    #[test]
    fn test_terminated_cell_as_target_is_selected() {
        let (mut host, ids) = settled_host(3);
        host.graph_mut()
            .cell_mut(ids[1])
            .unwrap()
            .agent_terminated_while_evaluating = true;
        let plan = host.evaluation_plan(Some(ids[1])).unwrap();
        assert_eq!(plan.cells, vec![ids[1], ids[2]]);
    }

    #[test]
    fn test_single_cell_graph_targets_itself() {
        let (mut host, ids) = settled_host(1);
        host.graph_mut().cell_mut(ids[0]).unwrap().dirty = true;
        let plan = host.evaluation_plan(Some(ids[0])).unwrap();
        assert_eq!(plan.cells, ids);
        assert!(plan.should_reset_state);
        assert!(plan.should_maybe_start_new_cell);
    }
}

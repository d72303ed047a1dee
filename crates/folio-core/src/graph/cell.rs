//! Cells: the ordered, independently editable units of a workbook.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::compile::Diagnostic;

/// Unique, stable identifier for a cell: a group (workspace) id paired
/// with a per-cell slot id. Survives edits; assigned on insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellId {
    pub group: Uuid,
    pub slot: Uuid,
}

impl CellId {
    pub fn new(group: Uuid) -> Self {
        Self {
            group,
            slot: Uuid::new_v4(),
        }
    }
}

impl std::fmt::Display for CellId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.group, self.slot)
    }
}

/// One editable unit of source code and its evaluation bookkeeping.
#[derive(Debug, Clone)]
pub struct Cell {
    id: CellId,
    /// Current source text.
    pub buffer: String,
    /// Set on every buffer edit; cleared after an evaluation attempt.
    pub dirty: bool,
    /// Set when upstream state has changed underneath this cell.
    pub outdated: bool,
    /// Number of completed evaluation attempts.
    pub evaluation_count: u32,
    /// The agent process died while this cell was executing. Excluded from
    /// automatic re-evaluation until explicitly re-run.
    pub agent_terminated_while_evaluating: bool,
    /// Diagnostics from the most recent compile.
    pub diagnostics: Vec<Diagnostic>,
    /// Whether the trailing expression's value should be rendered.
    pub render_result_expression: bool,
}

impl Cell {
    pub(crate) fn new(id: CellId, buffer: String) -> Self {
        Self {
            id,
            buffer,
            dirty: true,
            outdated: false,
            evaluation_count: 0,
            agent_terminated_while_evaluating: false,
            diagnostics: Vec::new(),
            render_result_expression: true,
        }
    }

    pub fn id(&self) -> CellId {
        self.id
    }

    /// Whether this cell should be picked up by the backward planning walk
    /// even when it is not the target.
    pub fn is_evaluation_candidate(&self) -> bool {
        self.dirty || self.outdated || self.evaluation_count == 0
    }

    /// Whether the last compile produced any error-severity diagnostics.
    pub fn has_error_diagnostics(&self) -> bool {
        self.diagnostics.iter().any(|d| d.severity.is_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_cell_is_a_candidate() {
        let cell = Cell::new(CellId::new(Uuid::new_v4()), String::new());
        assert!(cell.dirty);
        assert!(cell.is_evaluation_candidate());
    }

    #[test]
    fn test_settled_cell_is_not_a_candidate() {
        let mut cell = Cell::new(CellId::new(Uuid::new_v4()), "1 + 1".into());
        cell.dirty = false;
        cell.evaluation_count = 1;
        assert!(!cell.is_evaluation_candidate());

        cell.outdated = true;
        assert!(cell.is_evaluation_candidate());
    }
}

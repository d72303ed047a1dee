//! The ordered cell graph.
//!
//! Cells form a straight-line dependency chain: each cell depends on its
//! immediate predecessor in insertion order, so topological order always
//! equals insertion order.

mod cell;

pub use cell::{Cell, CellId};

use rustc_hash::FxHashMap;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Owns the ordered set of cells and their adjacency.
///
/// Invariants: the sorted order always equals the live insertion order, and
/// removing or inserting a cell re-links exactly its neighbors.
pub struct CellGraph {
    /// Shared group identity for every cell in this graph.
    group: Uuid,
    /// Cells in dependency (= insertion) order.
    order: Vec<CellId>,
    /// Cell lookup by id.
    cells: FxHashMap<CellId, Cell>,
}

impl CellGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self {
            group: Uuid::new_v4(),
            order: Vec::new(),
            cells: FxHashMap::default(),
        }
    }

    /// Insert a new cell strictly between the two given neighbors.
    ///
    /// With a previous cell the new cell goes directly after it; otherwise
    /// with a next cell it goes directly before that one; with neither the
    /// cell is appended at the tail.
    pub fn insert_cell(
        &mut self,
        buffer: impl Into<String>,
        previous: Option<CellId>,
        next: Option<CellId>,
    ) -> Result<CellId> {
        let index = if let Some(previous) = previous {
            self.position(previous)? + 1
        } else if let Some(next) = next {
            self.position(next)?
        } else {
            self.order.len()
        };

        let id = CellId::new(self.group);
        self.order.insert(index, id);
        self.cells.insert(id, Cell::new(id, buffer.into()));
        Ok(id)
    }

    /// Remove a cell, relinking its former predecessor directly to `next`.
    ///
    /// `next` must be the cell currently following `id` (or `None` when `id`
    /// is the tail); a mismatch is an invalid operation.
    pub fn remove_cell(&mut self, id: CellId, next: Option<CellId>) -> Result<Cell> {
        let index = self.position(id)?;
        let actual_next = self.order.get(index + 1).copied();
        if next != actual_next {
            return Err(Error::InvalidOperation(format!(
                "cell {id} is not followed by {next:?}"
            )));
        }

        self.order.remove(index);
        Ok(self.cells.remove(&id).expect("order and cell table in sync"))
    }

    /// Cells in dependency (= insertion) order. O(n) and stable.
    pub fn topologically_sorted_cell_ids(&self) -> Vec<CellId> {
        self.order.clone()
    }

    /// Position of a cell within the chain.
    pub fn position(&self, id: CellId) -> Result<usize> {
        self.order
            .iter()
            .position(|&candidate| candidate == id)
            .ok_or_else(|| Error::CellNotFound(id.to_string()))
    }

    /// The cell immediately after `id`, if any.
    pub fn successor(&self, id: CellId) -> Result<Option<CellId>> {
        let index = self.position(id)?;
        Ok(self.order.get(index + 1).copied())
    }

    pub fn cell(&self, id: CellId) -> Option<&Cell> {
        self.cells.get(&id)
    }

    pub fn cell_mut(&mut self, id: CellId) -> Option<&mut Cell> {
        self.cells.get_mut(&id)
    }

    /// Cells in chain order.
    pub fn cells(&self) -> impl Iterator<Item = &Cell> {
        self.order.iter().map(|id| &self.cells[id])
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for CellGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(graph: &CellGraph) -> Vec<CellId> {
        graph.topologically_sorted_cell_ids()
    }

    #[test]
    fn test_empty_graph() {
        let graph = CellGraph::new();
        assert!(graph.is_empty());
        assert_eq!(graph.len(), 0);
        assert!(ids(&graph).is_empty());
    }

    #[test]
    fn test_append_when_no_neighbors() {
        let mut graph = CellGraph::new();
        let a = graph.insert_cell("a", None, None).unwrap();
        let b = graph.insert_cell("b", None, None).unwrap();
        assert_eq!(ids(&graph), vec![a, b]);
    }

    #[test]
    fn test_insert_after_previous() {
        let mut graph = CellGraph::new();
        let a = graph.insert_cell("a", None, None).unwrap();
        let c = graph.insert_cell("c", Some(a), None).unwrap();
        let b = graph.insert_cell("b", Some(a), Some(c)).unwrap();
        assert_eq!(ids(&graph), vec![a, b, c]);
    }

    #[test]
    fn test_insert_before_next() {
        let mut graph = CellGraph::new();
        let b = graph.insert_cell("b", None, None).unwrap();
        let a = graph.insert_cell("a", None, Some(b)).unwrap();
        assert_eq!(ids(&graph), vec![a, b]);
    }

    #[test]
    fn test_remove_middle_relinks_neighbors() {
        let mut graph = CellGraph::new();
        let a = graph.insert_cell("a", None, None).unwrap();
        let b = graph.insert_cell("b", None, None).unwrap();
        let c = graph.insert_cell("c", None, None).unwrap();

        graph.remove_cell(b, Some(c)).unwrap();
        assert_eq!(ids(&graph), vec![a, c]);
        assert_eq!(graph.successor(a).unwrap(), Some(c));

        // Re-inserting between the former neighbors reproduces the adjacency.
        let b2 = graph.insert_cell("b2", Some(a), Some(c)).unwrap();
        assert_eq!(ids(&graph), vec![a, b2, c]);
    }

    #[test]
    fn test_remove_tail() {
        let mut graph = CellGraph::new();
        let a = graph.insert_cell("a", None, None).unwrap();
        let b = graph.insert_cell("b", None, None).unwrap();
        graph.remove_cell(b, None).unwrap();
        assert_eq!(ids(&graph), vec![a]);
    }

    #[test]
    fn test_remove_with_wrong_successor() {
        let mut graph = CellGraph::new();
        let a = graph.insert_cell("a", None, None).unwrap();
        let b = graph.insert_cell("b", None, None).unwrap();
        let result = graph.remove_cell(a, None);
        assert!(matches!(result, Err(Error::InvalidOperation(_))));
        assert_eq!(ids(&graph), vec![a, b]);
    }

    #[test]
    fn test_unknown_neighbor_is_an_error() {
        let mut graph = CellGraph::new();
        let other = CellId::new(Uuid::new_v4());
        let result = graph.insert_cell("a", Some(other), None);
        assert!(matches!(result, Err(Error::CellNotFound(_))));
    }

    #[test]
    fn test_order_is_stable_under_churn() {
        let mut graph = CellGraph::new();
        let a = graph.insert_cell("a", None, None).unwrap();
        let b = graph.insert_cell("b", None, None).unwrap();
        let c = graph.insert_cell("c", None, None).unwrap();
        let d = graph.insert_cell("d", Some(c), None).unwrap();

        graph.remove_cell(b, Some(c)).unwrap();
        let e = graph.insert_cell("e", None, Some(a)).unwrap();

        assert_eq!(ids(&graph), vec![e, a, c, d]);
        // Repeated calls return the same order.
        assert_eq!(ids(&graph), ids(&graph));
    }
}

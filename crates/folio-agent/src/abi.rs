//! The C ABI contract between the agent and compiled cell modules.
//!
//! A compiled cell is a dynamic library exporting one entry symbol:
//!
//! ```text
//! unsafe extern "C" fn(
//!     states_ptr: *const u8, states_len: usize,   // bincode EntryInput
//!     out_ptr: *mut *mut u8, out_len: *mut usize, // malloc'd bincode EntryOutput
//! ) -> i32
//! ```
//!
//! The return code separates user-code failures from host failures so
//! engine bugs are never swallowed by the user-code handler.

use serde::{Deserialize, Serialize};

/// Entry completed and produced an [`EntryOutput`].
pub const ENTRY_SUCCESS: i32 = 0;
/// User code failed; the output payload carries the error.
pub const ENTRY_ERROR: i32 = 1;
/// User code panicked; there may be no payload.
pub const ENTRY_PANIC: i32 = 2;
/// The entry observed cancellation and unwound early.
pub const ENTRY_INTERRUPTED: i32 = 3;
/// The entry could not decode its input or encode its output.
pub const ENTRY_SERIALIZATION: i32 = 4;

/// Signature of a cell module's entry point.
pub type CellEntryFn = unsafe extern "C" fn(
    states_ptr: *const u8,
    states_len: usize,
    out_ptr: *mut *mut u8,
    out_len: *mut usize,
) -> i32;

/// Entry symbol a host-integration module exports, invoked once when the
/// module is first loaded into the agent.
pub const INTEGRATION_SYMBOL: &[u8] = b"folio_register_integration";

/// Signature of a module's host-integration hook.
pub type IntegrationEntryFn = unsafe extern "C" fn() -> i32;

/// Type-name marker the execution shim uses when wrapping a failure that
/// surfaced through a top-level await. A wrapper with a single inner cause
/// is unwound before the failure is recorded.
pub const AGGREGATE_ERROR: &str = "AggregateError";

/// One top-level declaration a cell produced: retained state visible to
/// later cells.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Declaration {
    pub name: String,
    pub type_name: Option<String>,
    /// The value, serialized as JSON.
    pub value_json: String,
}

/// The retained state of one previously executed cell.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionState {
    pub declarations: Vec<Declaration>,
}

/// What the entry point receives: every submission-state slot of the
/// owning evaluation context, in slot order. Slot 0 is the context's
/// persistent global object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntryInput {
    pub states: Vec<Option<SubmissionState>>,
}

/// A failure raised by user code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryError {
    pub type_name: String,
    pub message: String,
    pub inner: Option<Box<EntryError>>,
}

impl EntryError {
    /// Unwind wrapper errors the execution shim added around top-level
    /// awaits: a singly-wrapped cause is recorded as the cause itself.
    pub fn unwrap_singly_wrapped(mut self) -> EntryError {
        while self.type_name == AGGREGATE_ERROR {
            match self.inner.take() {
                Some(inner) => self = *inner,
                None => break,
            }
        }
        self
    }
}

/// What the entry point returns on success or user failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntryOutput {
    /// The trailing expression's value, serialized as JSON, if any.
    pub result_json: Option<String>,
    pub result_type_name: Option<String>,
    /// Declarations to retain in this cell's submission slot.
    pub declarations: Vec<Declaration>,
    pub error: Option<EntryError>,
}

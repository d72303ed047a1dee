//! Loaded module handles and entry-point dispatch.

use libloading::{Library, Symbol};

use folio_core::compile::{ModuleDefinition, ModuleId};
use folio_core::error::{Error, Result};

use crate::abi::{
    CellEntryFn, EntryInput, EntryOutput, IntegrationEntryFn, ENTRY_ERROR, ENTRY_INTERRUPTED,
    ENTRY_PANIC, ENTRY_SERIALIZATION, ENTRY_SUCCESS, INTEGRATION_SYMBOL,
};

/// RAII guard for memory the entry point allocated with `malloc`.
/// Ensures the buffer is freed even if decoding panics.
struct FfiMemoryGuard {
    ptr: *mut u8,
}

impl FfiMemoryGuard {
    unsafe fn new(ptr: *mut u8) -> Self {
        Self { ptr }
    }

    fn as_slice(&self, len: usize) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, len) }
    }
}

impl Drop for FfiMemoryGuard {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                libc::free(self.ptr as *mut libc::c_void);
            }
        }
    }
}

/// One decoded invocation of a cell entry point.
#[derive(Debug)]
pub enum EntryInvocation {
    /// The entry ran to completion; the output may still carry a user error.
    Completed(EntryOutput),
    /// The entry observed cancellation and unwound early.
    Interrupted,
    /// The entry panicked.
    Panicked { message: String },
}

/// A materialized module: the dynamic library handle plus what the agent
/// needs to drive it.
pub struct LoadedModule {
    pub id: ModuleId,
    pub has_integration: bool,
    entry_symbol: Option<String>,
    library: Library,
}

impl LoadedModule {
    /// Wrap an already-opened library with its definition's metadata.
    pub fn new(definition: &ModuleDefinition, library: Library) -> Self {
        Self {
            id: definition.id.clone(),
            has_integration: definition.has_integration,
            entry_symbol: definition.entry_point.as_ref().map(|e| e.symbol.clone()),
            library,
        }
    }

    pub fn entry_symbol(&self) -> Option<&str> {
        self.entry_symbol.as_deref()
    }

    /// Invoke the module's entry point with the submission states.
    pub fn invoke(&self, input: &EntryInput) -> Result<EntryInvocation> {
        let symbol_name = self.entry_symbol.as_deref().ok_or_else(|| {
            Error::ModuleResolution {
                name: self.id.name.clone(),
                message: "module has no entry point".to_string(),
            }
        })?;

        let input_bytes = bincode::serialize(input)
            .map_err(|e| Error::Serialization(format!("failed to encode entry input: {e}")))?;

        // Safety: the symbol is generated by the compilation backend with
        // the agreed signature.
        let entry: Symbol<CellEntryFn> = unsafe {
            self.library.get(symbol_name.as_bytes()).map_err(|e| {
                Error::ModuleResolution {
                    name: self.id.name.clone(),
                    message: format!("failed to resolve entry symbol {symbol_name}: {e}"),
                }
            })?
        };

        let mut out_ptr: *mut u8 = std::ptr::null_mut();
        let mut out_len: usize = 0;

        // Safety: calling the agreed entry signature; output memory is
        // owned by the guard below.
        let code = unsafe {
            entry(
                input_bytes.as_ptr(),
                input_bytes.len(),
                &mut out_ptr,
                &mut out_len,
            )
        };

        let guard = unsafe { FfiMemoryGuard::new(out_ptr) };

        match code {
            ENTRY_SUCCESS | ENTRY_ERROR => {
                if out_ptr.is_null() || out_len == 0 {
                    return Err(Error::Serialization(format!(
                        "entry point of {} returned no output payload",
                        self.id.name
                    )));
                }
                let output: EntryOutput =
                    bincode::deserialize(guard.as_slice(out_len)).map_err(|e| {
                        Error::Serialization(format!("failed to decode entry output: {e}"))
                    })?;
                Ok(EntryInvocation::Completed(output))
            }
            ENTRY_INTERRUPTED => Ok(EntryInvocation::Interrupted),
            ENTRY_PANIC => {
                let message = if !out_ptr.is_null() && out_len > 0 {
                    String::from_utf8_lossy(guard.as_slice(out_len)).to_string()
                } else {
                    "cell panicked during execution".to_string()
                };
                Ok(EntryInvocation::Panicked { message })
            }
            ENTRY_SERIALIZATION => Err(Error::Serialization(format!(
                "entry point of {} could not decode its input",
                self.id.name
            ))),
            other => Err(Error::ModuleResolution {
                name: self.id.name.clone(),
                message: format!("entry point returned unknown code {other}"),
            }),
        }
    }

    /// Call the module's one-time host-integration hook.
    pub fn activate_integration(&self) -> Result<()> {
        // Safety: integration modules export the agreed niladic signature.
        let entry: Symbol<IntegrationEntryFn> = unsafe {
            self.library
                .get(INTEGRATION_SYMBOL)
                .map_err(|e| Error::ModuleResolution {
                    name: self.id.name.clone(),
                    message: format!("module declares integration but exports no hook: {e}"),
                })?
        };

        let code = unsafe { entry() };
        if code == 0 {
            Ok(())
        } else {
            Err(Error::ModuleResolution {
                name: self.id.name.clone(),
                message: format!("integration hook failed with code {code}"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    // Invoking a real entry point requires a compiled cell module; the
    // in-process phase machinery is covered through the context tests'
    // invoker seam instead.

    #[test]
    #[ignore = "requires a compiled cell module"]
    fn test_invoke_real_module() {}
}

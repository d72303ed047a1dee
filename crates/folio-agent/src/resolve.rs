//! Context-scoped module resolution and caching.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;
use rustc_hash::FxHashMap;

use folio_core::compile::{ModuleDefinition, ModuleId, NativeDependency};
use folio_core::error::{Error, Result};
use folio_core::resolve::ModuleDefinitionTable;

use crate::loaded::LoadedModule;

/// Maps a module's external native dependency to a loadable path. The
/// host environment supplies this when targets need platform-specific
/// library name translation.
pub trait NativeDependencyMapper: Send + Sync {
    fn map(&self, dependency: &NativeDependency) -> Option<PathBuf>;
}

/// Module cache owned by exactly one evaluation context.
///
/// Two tables: definitions keyed case-insensitively, loaded handles keyed
/// by the definition's exact name. A module is materialized at most once;
/// repeat resolution returns the cached handle.
pub struct ModuleCache {
    definitions: ModuleDefinitionTable,
    loaded: FxHashMap<String, Arc<LoadedModule>>,
    /// Keeps native dependency handles alive for the cache's lifetime.
    native_handles: Vec<Library>,
    /// Where transmitted byte images are written before loading.
    scratch_dir: PathBuf,
    mapper: Option<Arc<dyn NativeDependencyMapper>>,
    /// Modules materialized since the last drain, for per-evaluation
    /// side-effect reporting.
    newly_loaded: Vec<ModuleId>,
}

impl ModuleCache {
    pub fn new(scratch_dir: PathBuf, mapper: Option<Arc<dyn NativeDependencyMapper>>) -> Self {
        Self {
            definitions: ModuleDefinitionTable::new(),
            loaded: FxHashMap::default(),
            native_handles: Vec::new(),
            scratch_dir,
            mapper,
            newly_loaded: Vec::new(),
        }
    }

    /// Register definitions for later resolution.
    pub fn add_definitions(&mut self, definitions: impl IntoIterator<Item = ModuleDefinition>) {
        self.definitions.insert_all(definitions);
    }

    pub fn definition(&self, name: &str) -> Option<&ModuleDefinition> {
        self.definitions.get(name)
    }

    /// Resolve a name to a loaded module handle.
    ///
    /// A hit in the loaded table (case-sensitive identity) returns the
    /// cached handle. A miss that hits the definition table materializes
    /// the module. A miss in both tables is `Ok(None)`; a definition that
    /// cannot be materialized is an error, never silently skipped.
    pub fn resolve(&mut self, name: &str) -> Result<Option<Arc<LoadedModule>>> {
        if let Some(module) = self.loaded.get(name) {
            return Ok(Some(module.clone()));
        }

        let Some(definition) = self.definitions.get(name).cloned() else {
            return Ok(None);
        };

        self.load_definition(&definition).map(Some)
    }

    /// Materialize a definition, reusing the cached handle when the module
    /// was already loaded.
    pub fn load_definition(&mut self, definition: &ModuleDefinition) -> Result<Arc<LoadedModule>> {
        if let Some(module) = self.loaded.get(&definition.id.name) {
            return Ok(module.clone());
        }

        self.load_native_dependencies(definition)?;

        let library = self.open_library(definition)?;
        let module = Arc::new(LoadedModule::new(definition, library));

        self.loaded
            .insert(definition.id.name.clone(), module.clone());
        self.newly_loaded.push(definition.id.clone());

        tracing::debug!(module = %definition.id, "materialized module");
        Ok(module)
    }

    fn open_library(&self, definition: &ModuleDefinition) -> Result<Library> {
        let load = |path: &Path| -> Result<Library> {
            // Safety: loading modules produced by the compilation backend
            // or supplied by the host.
            unsafe {
                Library::new(path).map_err(|e| Error::ModuleResolution {
                    name: definition.id.name.clone(),
                    message: format!("failed to load {}: {e}", path.display()),
                })
            }
        };

        if let Some(location) = &definition.content.location {
            if location.exists() {
                return load(location);
            }
        }

        if definition.content.image.is_some() {
            let image = ModuleDefinitionTable::load_image(definition)?;
            let path = self.scratch_path(&definition.id);
            std::fs::create_dir_all(&self.scratch_dir)?;
            std::fs::write(&path, image)?;
            if let Some(symbols) = &definition.content.debug_symbols {
                std::fs::write(path.with_extension("dbg"), symbols)?;
            }
            return load(&path);
        }

        Err(Error::ModuleResolution {
            name: definition.id.name.clone(),
            message: "location does not exist and no image bytes were sent".to_string(),
        })
    }

    fn scratch_path(&self, id: &ModuleId) -> PathBuf {
        let stem: String = id
            .name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.scratch_dir.join(format!("{stem}.module"))
    }

    fn load_native_dependencies(&mut self, definition: &ModuleDefinition) -> Result<()> {
        for dependency in &definition.external_dependencies {
            let location = dependency
                .location
                .clone()
                .or_else(|| self.mapper.as_ref().and_then(|m| m.map(dependency)));

            let Some(location) = location else {
                tracing::warn!(
                    module = %definition.id,
                    dependency = %dependency.name,
                    "no mapping for native dependency"
                );
                continue;
            };

            // Safety: preloading a host-supplied native library so the
            // module's own load can bind against it.
            let handle = unsafe {
                Library::new(&location).map_err(|e| Error::ModuleResolution {
                    name: definition.id.name.clone(),
                    message: format!(
                        "failed to load native dependency {} from {}: {e}",
                        dependency.name,
                        location.display()
                    ),
                })?
            };
            self.native_handles.push(handle);
        }
        Ok(())
    }

    /// Modules materialized since the last call.
    pub fn drain_newly_loaded(&mut self) -> Vec<ModuleId> {
        std::mem::take(&mut self.newly_loaded)
    }

    pub fn loaded_len(&self) -> usize {
        self.loaded.len()
    }

    /// Drop both tables. Loaded handles release when the last reference
    /// does.
    pub fn clear(&mut self) {
        self.loaded.clear();
        self.definitions.clear();
        self.native_handles.clear();
        self.newly_loaded.clear();
    }
}

/// One-time activation bookkeeping for host-integration modules.
///
/// A module that declares integration is activated at most once per agent
/// process, keyed by its exact name.
#[derive(Default)]
pub struct IntegrationRegistry {
    activated: std::sync::Mutex<rustc_hash::FxHashSet<String>>,
}

impl IntegrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Activate the module's integration hook if it declares one and has
    /// not been activated before. Returns whether activation happened now.
    pub fn try_activate(&self, module: &LoadedModule) -> Result<bool> {
        if !module.has_integration {
            return Ok(false);
        }

        let mut activated = self.activated.lock().unwrap();
        if activated.contains(&module.id.name) {
            return Ok(false);
        }

        module.activate_integration()?;
        activated.insert(module.id.name.clone());
        tracing::info!(module = %module.id, "activated host integration");
        Ok(true)
    }

    pub fn activated_len(&self) -> usize {
        self.activated.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::compile::ModuleContent;

    fn cache() -> ModuleCache {
        ModuleCache::new(std::env::temp_dir().join("folio-agent-tests"), None)
    }

    #[test]
    fn test_unknown_name_resolves_to_none() {
        let mut cache = cache();
        assert!(cache.resolve("nope").unwrap().is_none());
    }

    #[test]
    fn test_unresolvable_definition_is_fatal() {
        let mut cache = cache();
        cache.add_definitions([ModuleDefinition::new(
            ModuleId::new("ghost"),
            ModuleContent::default(),
        )]);

        assert!(matches!(
            cache.resolve("ghost"),
            Err(Error::ModuleResolution { .. })
        ));
    }

    #[test]
    fn test_definition_lookup_is_case_insensitive() {
        let mut cache = cache();
        cache.add_definitions([ModuleDefinition::new(
            ModuleId::new("Widgets"),
            ModuleContent::default(),
        )]);
        assert!(cache.definition("widgets").is_some());
        assert!(cache.definition("WIDGETS").is_some());
    }

    #[test]
    #[ignore = "requires a compiled cell module"]
    fn test_repeat_resolution_returns_cached_handle() {
        // With a real module on disk: resolve twice, assert Arc::ptr_eq.
    }
}

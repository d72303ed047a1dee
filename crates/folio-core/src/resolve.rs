//! Module definition lookup shared by the workspace host and the agent.

use rustc_hash::FxHashMap;

use crate::compile::ModuleDefinition;
use crate::error::{Error, Result};

/// Name → [`ModuleDefinition`] table.
///
/// Lookups are case-insensitive: external code refers to the same module
/// with varying name casing, and definitions are unversioned enough that
/// folding case is safe. Loaded-module identity stays case-sensitive and
/// lives with the agent's cache, not here.
#[derive(Default)]
pub struct ModuleDefinitionTable {
    definitions: FxHashMap<String, ModuleDefinition>,
}

impl ModuleDefinitionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(name: &str) -> String {
        name.to_ascii_lowercase()
    }

    /// Register a definition, replacing any previous one with the same
    /// case-folded name.
    pub fn insert(&mut self, definition: ModuleDefinition) {
        self.definitions
            .insert(Self::key(&definition.id.name), definition);
    }

    pub fn insert_all(&mut self, definitions: impl IntoIterator<Item = ModuleDefinition>) {
        for definition in definitions {
            self.insert(definition);
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModuleDefinition> {
        self.definitions.get(&Self::key(name))
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn clear(&mut self) {
        self.definitions.clear();
    }

    /// Materialize a definition's binary image: inline bytes if they were
    /// transmitted, otherwise read from the file location. Failure to
    /// produce bytes is fatal for the reference, never silently skipped.
    pub fn load_image(definition: &ModuleDefinition) -> Result<Vec<u8>> {
        if let Some(image) = &definition.content.image {
            return Ok(image.clone());
        }
        if let Some(location) = &definition.content.location {
            return std::fs::read(location).map_err(|e| Error::ModuleResolution {
                name: definition.id.name.clone(),
                message: format!("failed to read {}: {e}", location.display()),
            });
        }
        Err(Error::ModuleResolution {
            name: definition.id.name.clone(),
            message: "no image bytes and no file location".to_string(),
        })
    }
}

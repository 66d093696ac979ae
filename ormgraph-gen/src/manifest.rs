//! Model manifest loading
//!
//! A manifest is a TOML file with an optional `[settings]` table and one
//! `[[models]]` entry per model descriptor.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use ormgraph::{MemoryStore, ModelDef, ModelRegistry, SchemaBuilder, SchemaSettings};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub settings: SchemaSettings,
    #[serde(default)]
    pub models: Vec<ModelDef>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let text =
            std::fs::read_to_string(path).with_context(|| format!("failed to read manifest {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid manifest {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Schema builder over an empty in-memory store
    pub fn into_builder(self) -> Result<SchemaBuilder> {
        let registry = Arc::new(ModelRegistry::from_models(self.models)?);
        let store = MemoryStore::new(registry.clone())?;
        Ok(SchemaBuilder::new(registry, Arc::new(store), self.settings))
    }
}

//! Generator settings
//!
//! Every settings struct deserializes with `#[serde(default)]` so a manifest
//! only names what it overrides. Settings are built once per schema build and
//! read-only afterwards.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Where nested object input is offered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NestedRelationsPolicy {
    /// Global default
    pub enable_nested_relations: bool,
    /// Per-model override
    pub nested_relations_config: HashMap<String, bool>,
    /// Per-model, per-field override
    pub nested_field_config: HashMap<String, HashMap<String, bool>>,
}

impl Default for NestedRelationsPolicy {
    fn default() -> Self {
        Self {
            enable_nested_relations: true,
            nested_relations_config: HashMap::new(),
            nested_field_config: HashMap::new(),
        }
    }
}

impl NestedRelationsPolicy {
    /// Resolve enablement for a relation field; the first configured level wins
    ///
    /// Field config, then model config, then the global flag. A field missing
    /// from the field config falls through to the model or global default.
    pub fn is_enabled(&self, model: &str, field: &str) -> bool {
        if let Some(enabled) = self
            .nested_field_config
            .get(model)
            .and_then(|fields| fields.get(field))
        {
            return *enabled;
        }
        if let Some(enabled) = self.nested_relations_config.get(model) {
            return *enabled;
        }
        self.enable_nested_relations
    }

    /// Disable nesting for one field
    pub fn disable_field(mut self, model: &str, field: &str) -> Self {
        self.nested_field_config
            .entry(model.to_string())
            .or_default()
            .insert(field.to_string(), false);
        self
    }

    /// Set the per-model default
    pub fn model(mut self, model: &str, enabled: bool) -> Self {
        self.nested_relations_config.insert(model.to_string(), enabled);
        self
    }
}

/// Controls object and input type generation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TypeGeneratorSettings {
    /// Fields hidden from every generated type, per model
    pub exclude_fields: HashMap<String, HashSet<String>>,
    /// When a model is listed, only these fields are exposed
    pub include_fields: HashMap<String, HashSet<String>>,
    /// Field type name to GraphQL scalar name overrides
    pub custom_scalars: HashMap<String, String>,
    #[serde(flatten)]
    pub nested: NestedRelationsPolicy,
}

impl TypeGeneratorSettings {
    /// Whether a model attribute is exposed at all
    pub fn is_field_exposed(&self, model: &str, field: &str) -> bool {
        if self
            .exclude_fields
            .get(model)
            .is_some_and(|excluded| excluded.contains(field))
        {
            return false;
        }
        match self.include_fields.get(model) {
            Some(included) => included.contains(field),
            None => true,
        }
    }
}

/// Controls which mutations are generated and how they behave
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MutationGeneratorSettings {
    pub enable_create: bool,
    pub enable_update: bool,
    pub enable_delete: bool,
    pub enable_bulk_operations: bool,
    pub enable_method_mutations: bool,
    /// Collapse doubled quote characters in string input
    pub sanitize_strings: bool,
    /// Largest accepted batch; `0` means unlimited
    pub bulk_limit: usize,
}

impl Default for MutationGeneratorSettings {
    fn default() -> Self {
        Self {
            enable_create: true,
            enable_update: true,
            enable_delete: true,
            enable_bulk_operations: false,
            enable_method_mutations: true,
            sanitize_strings: true,
            bulk_limit: 100,
        }
    }
}

/// Controls the generated query fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuerySettings {
    pub default_page_size: usize,
    pub max_page_size: usize,
    /// How many relations a filter path may traverse
    pub max_filter_depth: usize,
    pub enable_pagination: bool,
    /// Seconds list results stay in the cache manager; `None` skips caching
    pub cache_timeout: Option<u64>,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            default_page_size: 20,
            max_page_size: 100,
            max_filter_depth: 2,
            enable_pagination: true,
            cache_timeout: None,
        }
    }
}

impl QuerySettings {
    /// Requested page size clamped to `1..=max_page_size`
    pub fn clamp_page_size(&self, requested: Option<i64>) -> usize {
        let size = match requested {
            Some(size) if size > 0 => size as usize,
            _ => self.default_page_size,
        };
        size.clamp(1, self.max_page_size.max(1))
    }
}

/// Top-level schema build settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaSettings {
    pub types: TypeGeneratorSettings,
    pub mutations: MutationGeneratorSettings,
    pub queries: QuerySettings,
    pub excluded_apps: HashSet<String>,
    pub excluded_models: HashSet<String>,
    /// Rebuild on lifecycle signals
    pub auto_refresh: bool,
    /// Expose the `health` query
    pub enable_health: bool,
}

impl Default for SchemaSettings {
    fn default() -> Self {
        Self {
            types: TypeGeneratorSettings::default(),
            mutations: MutationGeneratorSettings::default(),
            queries: QuerySettings::default(),
            excluded_apps: HashSet::new(),
            excluded_models: HashSet::new(),
            auto_refresh: true,
            enable_health: true,
        }
    }
}

//! Model introspection
//!
//! Reads a model descriptor out of the [`ModelRegistry`] and flattens it into
//! the metadata every generator works from: scalar fields, forward
//! relationships, reverse relations pointing at the model, methods, properties
//! and the inheritance chain.

use std::collections::HashSet;
use std::sync::Arc;

use heck::ToSnakeCase;
use indexmap::IndexMap;
use serde_json::Value;

use crate::error::RegistryError;
use crate::model::{FieldDef, FieldKind, MethodDef, ModelDef, ModelRegistry, PropertyDef, RelationKind};

/// Scalar attribute metadata
#[derive(Debug, Clone, PartialEq)]
pub struct FieldInfo {
    pub name: String,
    pub field_type: FieldKind,
    /// Derived from nullability
    pub is_required: bool,
    pub default_value: Option<Value>,
    pub help_text: Option<String>,
    pub has_auto_now: bool,
    pub has_auto_now_add: bool,
    pub blank: bool,
    pub has_default: bool,
    pub null: bool,
    pub primary_key: bool,
    pub unique: bool,
    pub max_length: Option<usize>,
    pub choices: Vec<String>,
}

impl FieldInfo {
    fn from_def(def: &FieldDef) -> Self {
        Self {
            name: def.name.clone(),
            field_type: def.kind.clone(),
            is_required: !def.null,
            default_value: def.default.clone(),
            help_text: def.help_text.clone(),
            has_auto_now: def.auto_now,
            has_auto_now_add: def.auto_now_add,
            blank: def.blank,
            has_default: def.default.is_some(),
            null: def.null,
            primary_key: def.primary_key,
            unique: def.unique || def.primary_key,
            max_length: def.max_length,
            choices: def.choices.clone(),
        }
    }

    /// Implicit `id` key for models that declare none
    fn implicit_pk() -> Self {
        Self::from_def(&FieldDef::primary("id"))
    }

    /// Whether the store fills the value in when it is omitted
    pub fn is_system_managed(&self) -> bool {
        self.has_auto_now || self.has_auto_now_add || (self.primary_key && self.field_type.is_auto())
    }
}

/// Forward relationship metadata
#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipInfo {
    pub name: String,
    pub related_model: String,
    pub relationship_type: RelationKind,
    /// Column on the related model the relation points at
    pub to_field: String,
    /// Column on this model holding the reference; the field name for to-many
    pub from_field: String,
    pub null: bool,
    pub blank: bool,
    pub has_default: bool,
    pub help_text: Option<String>,
    /// Accessor installed on the related model, if any
    pub accessor: Option<String>,
}

/// A relation declared on another model that points at this one
#[derive(Debug, Clone, PartialEq)]
pub struct ReverseRelationInfo {
    /// Name used to reach the related collection from an instance
    pub accessor: String,
    /// Model declaring the forward relation
    pub related_model: String,
    /// Forward relation field on `related_model`
    pub field: String,
    /// Cardinality of the forward relation
    pub relationship_type: RelationKind,
}

impl ReverseRelationInfo {
    /// Reverse side of a unique to-one is a single object, not a collection
    pub fn is_single(&self) -> bool {
        self.relationship_type == RelationKind::ToOneUnique
    }
}

/// Position of a model in its inheritance chain
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InheritanceInfo {
    /// Nearest parent first
    pub parents: Vec<String>,
    pub is_abstract: bool,
}

/// Everything the generators need to know about one model
#[derive(Debug, Clone)]
pub struct ModelMetadata {
    pub name: String,
    pub app_label: String,
    pub table_name: String,
    pub description: Option<String>,
    pub primary_key: String,
    pub fields: IndexMap<String, FieldInfo>,
    pub relationships: IndexMap<String, RelationshipInfo>,
    pub reverse_relations: IndexMap<String, ReverseRelationInfo>,
    pub methods: IndexMap<String, MethodDef>,
    pub properties: IndexMap<String, PropertyDef>,
    pub inheritance: InheritanceInfo,
}

impl ModelMetadata {
    pub fn field(&self, name: &str) -> Option<&FieldInfo> {
        self.fields.get(name)
    }

    pub fn relationship(&self, name: &str) -> Option<&RelationshipInfo> {
        self.relationships.get(name)
    }

    pub fn reverse_relation(&self, accessor: &str) -> Option<&ReverseRelationInfo> {
        self.reverse_relations.get(accessor)
    }

    /// Primary key metadata
    pub fn pk(&self) -> Option<&FieldInfo> {
        self.fields.get(&self.primary_key)
    }

    /// Relationship stored in the given column (`category_id` -> `category`)
    pub fn relationship_by_column(&self, column: &str) -> Option<&RelationshipInfo> {
        self.relationships
            .values()
            .find(|rel| rel.relationship_type.is_to_one() && rel.from_field == column)
    }
}

/// Reads model metadata out of the registry
#[derive(Debug, Clone)]
pub struct ModelIntrospector {
    models: Arc<ModelRegistry>,
}

impl ModelIntrospector {
    pub fn new(models: Arc<ModelRegistry>) -> Self {
        Self { models }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.models
    }

    /// Full metadata for a model
    pub fn introspect(&self, model: &str) -> Result<ModelMetadata, RegistryError> {
        let def = self.lookup(model)?;
        let parents = self.parent_chain(def)?;
        let declared = self.merged_fields(def, &parents)?;

        let mut fields = IndexMap::new();
        let mut relationships = IndexMap::new();
        for field in &declared {
            match field.kind.relation_kind() {
                Some(kind) => {
                    let rel = self.relationship_info(&def.name, field, kind)?;
                    relationships.insert(rel.name.clone(), rel);
                }
                // Reverse accessors carry no column semantics
                None if field.kind == FieldKind::Reverse => {}
                None => {
                    fields.insert(field.name.clone(), FieldInfo::from_def(field));
                }
            }
        }

        let primary_key = match fields.values().find(|f| f.primary_key) {
            Some(pk) => pk.name.clone(),
            None => {
                let pk = FieldInfo::implicit_pk();
                let name = pk.name.clone();
                fields.shift_insert(0, name.clone(), pk);
                name
            }
        };

        let mut methods = IndexMap::new();
        let mut properties = IndexMap::new();
        for ancestor in parents.iter().rev().chain(std::iter::once(&def.name)) {
            let source = self.lookup(ancestor)?;
            for method in &source.methods {
                methods.insert(method.name.clone(), method.clone());
            }
            for property in &source.properties {
                properties.insert(property.name.clone(), property.clone());
            }
        }

        Ok(ModelMetadata {
            name: def.name.clone(),
            app_label: def.app_label.clone(),
            table_name: def.table_name(),
            description: def.description.clone(),
            primary_key,
            fields,
            relationships,
            reverse_relations: self.reverse_relations(&def.name)?,
            methods,
            properties,
            inheritance: InheritanceInfo {
                parents,
                is_abstract: def.is_abstract,
            },
        })
    }

    /// Scalar fields only
    pub fn get_model_fields(&self, model: &str) -> Result<IndexMap<String, FieldInfo>, RegistryError> {
        Ok(self.introspect(model)?.fields)
    }

    /// Forward relationships only
    pub fn get_model_relationships(
        &self,
        model: &str,
    ) -> Result<IndexMap<String, RelationshipInfo>, RegistryError> {
        Ok(self.introspect(model)?.relationships)
    }

    /// Every relation in the registry pointing at `model`, keyed by accessor
    pub fn reverse_relations(
        &self,
        model: &str,
    ) -> Result<IndexMap<String, ReverseRelationInfo>, RegistryError> {
        let mut reverse = IndexMap::new();
        for source in self.models.models().filter(|m| !m.is_abstract) {
            let parents = self.parent_chain(source)?;
            for field in self.merged_fields(source, &parents)? {
                let Some(kind) = field.kind.relation_kind() else {
                    continue;
                };
                if field.related_model.as_deref() != Some(model) {
                    continue;
                }
                let Some(accessor) = reverse_accessor(&source.name, &field, kind) else {
                    continue;
                };
                reverse.insert(
                    accessor.clone(),
                    ReverseRelationInfo {
                        accessor,
                        related_model: source.name.clone(),
                        field: field.name.clone(),
                        relationship_type: kind,
                    },
                );
            }
        }
        Ok(reverse)
    }

    fn lookup(&self, model: &str) -> Result<&ModelDef, RegistryError> {
        self.models
            .get(model)
            .ok_or_else(|| RegistryError::UnknownModel(model.to_string()))
    }

    /// Ancestors of a model, nearest first
    fn parent_chain(&self, def: &ModelDef) -> Result<Vec<String>, RegistryError> {
        let mut chain = Vec::new();
        let mut seen = HashSet::from([def.name.clone()]);
        let mut current = def.parent.clone();
        while let Some(parent) = current {
            if !seen.insert(parent.clone()) {
                return Err(RegistryError::InheritanceCycle(parent));
            }
            current = self.lookup(&parent)?.parent.clone();
            chain.push(parent);
        }
        Ok(chain)
    }

    /// Declared fields with inherited ones first; the child wins on clashes
    fn merged_fields(&self, def: &ModelDef, parents: &[String]) -> Result<Vec<FieldDef>, RegistryError> {
        let mut merged: IndexMap<String, FieldDef> = IndexMap::new();
        for ancestor in parents.iter().rev() {
            for field in &self.lookup(ancestor)?.fields {
                merged.insert(field.name.clone(), field.clone());
            }
        }
        for field in &def.fields {
            merged.insert(field.name.clone(), field.clone());
        }
        Ok(merged.into_values().collect())
    }

    fn relationship_info(
        &self,
        model: &str,
        field: &FieldDef,
        kind: RelationKind,
    ) -> Result<RelationshipInfo, RegistryError> {
        let related_model = field
            .related_model
            .clone()
            .ok_or_else(|| RegistryError::MissingTarget {
                model: model.to_string(),
                field: field.name.clone(),
            })?;
        let to_field = match &field.to_field {
            Some(to_field) => to_field.clone(),
            None => target_pk(self.lookup(&related_model)?),
        };
        let from_field = if kind.is_to_one() {
            format!("{}_id", field.name)
        } else {
            field.name.clone()
        };
        Ok(RelationshipInfo {
            name: field.name.clone(),
            accessor: field.related_name.clone().filter(|name| name != "+"),
            related_model,
            relationship_type: kind,
            to_field,
            from_field,
            null: field.null,
            blank: field.blank,
            has_default: field.default.is_some(),
            help_text: field.help_text.clone(),
        })
    }
}

/// Name of the declared primary key, `id` when implicit
fn target_pk(def: &ModelDef) -> String {
    def.fields
        .iter()
        .find(|f| f.primary_key)
        .map(|f| f.name.clone())
        .unwrap_or_else(|| "id".to_string())
}

/// Accessor a forward relation installs on its target; `+` suppresses it
fn reverse_accessor(source: &str, field: &FieldDef, kind: RelationKind) -> Option<String> {
    match field.related_name.as_deref() {
        Some("+") => None,
        Some(name) => Some(name.to_string()),
        None if kind == RelationKind::ToOneUnique => Some(source.to_snake_case()),
        None => Some(format!("{}_set", source.to_snake_case())),
    }
}

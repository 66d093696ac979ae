//! Model descriptors
//!
//! The [`ModelRegistry`] is the application's catalogue of models: what an ORM
//! would expose through its app registry. Descriptors are plain data so they can
//! be built in code or deserialized from a manifest; method and property
//! implementations are bound afterwards since they are code, not data.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use heck::ToSnakeCase;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RegistryError;
use crate::methods::ModelMethod;

/// A persisted row: column name to JSON value
pub type Record = serde_json::Map<String, Value>;

/// Storage kind of a model attribute
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Auto,
    BigAuto,
    Char,
    Text,
    Slug,
    Email,
    Url,
    Uuid,
    Integer,
    BigInteger,
    SmallInteger,
    PositiveInteger,
    Float,
    Decimal,
    Boolean,
    Date,
    DateTime,
    Time,
    Duration,
    Json,
    File,
    Image,
    Binary,
    ForeignKey,
    OneToOne,
    ManyToMany,
    /// Accessor declared on the model that is not backed by a column
    Reverse,
    /// Third-party field type, identified by its type name
    Custom(String),
}

/// Cardinality of a forward relationship
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    ToOne,
    ToOneUnique,
    ToMany,
}

impl RelationKind {
    /// Whether the relation is stored as a column on the declaring model
    pub fn is_to_one(self) -> bool {
        matches!(self, RelationKind::ToOne | RelationKind::ToOneUnique)
    }
}

impl FieldKind {
    /// Relationship cardinality, if this kind declares a forward relation
    pub fn relation_kind(&self) -> Option<RelationKind> {
        match self {
            FieldKind::ForeignKey => Some(RelationKind::ToOne),
            FieldKind::OneToOne => Some(RelationKind::ToOneUnique),
            FieldKind::ManyToMany => Some(RelationKind::ToMany),
            _ => None,
        }
    }

    /// Whether values are generated by the store when omitted
    pub fn is_auto(&self) -> bool {
        matches!(self, FieldKind::Auto | FieldKind::BigAuto)
    }

    /// Whether the kind holds text
    pub fn is_textual(&self) -> bool {
        matches!(
            self,
            FieldKind::Char
                | FieldKind::Text
                | FieldKind::Slug
                | FieldKind::Email
                | FieldKind::Url
                | FieldKind::Uuid
        )
    }

    /// Whether the kind holds an integer
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            FieldKind::Auto
                | FieldKind::BigAuto
                | FieldKind::Integer
                | FieldKind::BigInteger
                | FieldKind::SmallInteger
                | FieldKind::PositiveInteger
        )
    }
}

fn default_true() -> bool {
    true
}

/// A declared model attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub null: bool,
    #[serde(default)]
    pub blank: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub auto_now: bool,
    #[serde(default)]
    pub auto_now_add: bool,
    #[serde(default)]
    pub help_text: Option<String>,
    #[serde(default)]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub choices: Vec<String>,
    /// Target model for relationship kinds
    #[serde(default)]
    pub related_model: Option<String>,
    /// Accessor name installed on the target model
    #[serde(default)]
    pub related_name: Option<String>,
    /// Target column; defaults to the target's primary key
    #[serde(default)]
    pub to_field: Option<String>,
}

impl FieldDef {
    /// Create a non-null, non-blank attribute of the given kind
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            null: false,
            blank: false,
            default: None,
            primary_key: false,
            unique: false,
            auto_now: false,
            auto_now_add: false,
            help_text: None,
            max_length: None,
            choices: Vec::new(),
            related_model: None,
            related_name: None,
            to_field: None,
        }
    }

    /// Auto-incrementing primary key
    pub fn primary(name: impl Into<String>) -> Self {
        let mut field = Self::new(name, FieldKind::Auto);
        field.primary_key = true;
        field
    }

    /// Relationship attribute pointing at `related`
    pub fn relation(name: impl Into<String>, kind: FieldKind, related: impl Into<String>) -> Self {
        let mut field = Self::new(name, kind);
        field.related_model = Some(related.into());
        field
    }

    pub fn null(mut self, null: bool) -> Self {
        self.null = null;
        self
    }

    pub fn blank(mut self, blank: bool) -> Self {
        self.blank = blank;
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn auto_now(mut self) -> Self {
        self.auto_now = true;
        self
    }

    pub fn auto_now_add(mut self) -> Self {
        self.auto_now_add = true;
        self
    }

    pub fn max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }

    pub fn choices<I, S>(mut self, choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.choices = choices.into_iter().map(Into::into).collect();
        self
    }

    pub fn related_name(mut self, related_name: impl Into<String>) -> Self {
        self.related_name = Some(related_name.into());
        self
    }

    pub fn help_text(mut self, help_text: impl Into<String>) -> Self {
        self.help_text = Some(help_text.into());
        self
    }
}

/// A parameter of an exposed model method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDef {
    pub name: String,
    /// Type annotation, e.g. `i64`, `Option<String>`, `Vec<i32>`
    pub annotation: String,
    #[serde(default)]
    pub default: Option<Value>,
}

/// What a model method hands back to the mutation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodReturn {
    /// The (possibly modified) model instance; it is persisted after the call
    Instance,
    /// An arbitrary JSON value
    Value,
    #[default]
    Unit,
}

/// Bound implementation of a model method
#[derive(Clone)]
pub struct MethodHandler(pub Arc<dyn ModelMethod>);

impl fmt::Debug for MethodHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MethodHandler(..)")
    }
}

/// A business method declared on a model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodDef {
    pub name: String,
    #[serde(default)]
    pub params: Vec<ParamDef>,
    /// Expose the method as a GraphQL mutation
    #[serde(default)]
    pub mutation: bool,
    /// Run the method inside a transaction
    #[serde(default = "default_true")]
    pub atomic: bool,
    /// Permission the caller must hold
    #[serde(default)]
    pub permission: Option<String>,
    #[serde(default)]
    pub returns: MethodReturn,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(skip)]
    pub handler: Option<MethodHandler>,
}

impl MethodDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            mutation: false,
            atomic: true,
            permission: None,
            returns: MethodReturn::Unit,
            description: None,
            handler: None,
        }
    }

    /// Mark the method as exposed through a mutation
    pub fn exposed(mut self) -> Self {
        self.mutation = true;
        self
    }

    pub fn param(mut self, name: impl Into<String>, annotation: impl Into<String>) -> Self {
        self.params.push(ParamDef {
            name: name.into(),
            annotation: annotation.into(),
            default: None,
        });
        self
    }

    pub fn returns(mut self, returns: MethodReturn) -> Self {
        self.returns = returns;
        self
    }

    pub fn permission(mut self, permission: impl Into<String>) -> Self {
        self.permission = Some(permission.into());
        self
    }

    pub fn atomic(mut self, atomic: bool) -> Self {
        self.atomic = atomic;
        self
    }

    pub fn handler(mut self, handler: Arc<dyn ModelMethod>) -> Self {
        self.handler = Some(MethodHandler(handler));
        self
    }
}

/// Getter for a computed property
pub type PropertyFn = Arc<dyn Fn(&Record) -> Value + Send + Sync>;

/// Bound implementation of a computed property
#[derive(Clone)]
pub struct PropertyGetter(pub PropertyFn);

impl fmt::Debug for PropertyGetter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PropertyGetter(..)")
    }
}

/// A read-only computed attribute
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyDef {
    pub name: String,
    pub kind: FieldKind,
    #[serde(skip)]
    pub getter: Option<PropertyGetter>,
}

/// A model class
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDef {
    pub name: String,
    pub app_label: String,
    #[serde(default, rename = "abstract")]
    pub is_abstract: bool,
    /// Parent model this one inherits fields from
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
    #[serde(default)]
    pub methods: Vec<MethodDef>,
    #[serde(default)]
    pub properties: Vec<PropertyDef>,
}

impl ModelDef {
    pub fn new(app_label: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            app_label: app_label.into(),
            is_abstract: false,
            parent: None,
            description: None,
            fields: Vec::new(),
            methods: Vec::new(),
            properties: Vec::new(),
        }
    }

    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    pub fn method(mut self, method: MethodDef) -> Self {
        self.methods.push(method);
        self
    }

    pub fn property(mut self, name: impl Into<String>, kind: FieldKind, getter: PropertyFn) -> Self {
        self.properties.push(PropertyDef {
            name: name.into(),
            kind,
            getter: Some(PropertyGetter(getter)),
        });
        self
    }

    pub fn abstract_model(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    pub fn inherits(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Database table name, `{app_label}_{model}`
    pub fn table_name(&self) -> String {
        format!("{}_{}", self.app_label, self.name.to_snake_case())
    }
}

/// Catalogue of every model known to the application
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: BTreeMap<String, ModelDef>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a list of descriptors
    pub fn from_models(models: impl IntoIterator<Item = ModelDef>) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for model in models {
            registry.register(model)?;
        }
        registry.check_relations()?;
        Ok(registry)
    }

    /// Add a model; names are unique across apps
    pub fn register(&mut self, model: ModelDef) -> Result<(), RegistryError> {
        if self.models.contains_key(&model.name) {
            return Err(RegistryError::Duplicate(model.name));
        }
        self.models.insert(model.name.clone(), model);
        Ok(())
    }

    /// Every relationship must point at a registered model
    pub fn check_relations(&self) -> Result<(), RegistryError> {
        for model in self.models.values() {
            for field in &model.fields {
                if field.kind.relation_kind().is_none() {
                    continue;
                }
                let related = field.related_model.as_deref().ok_or_else(|| {
                    RegistryError::MissingTarget {
                        model: model.name.clone(),
                        field: field.name.clone(),
                    }
                })?;
                if !self.models.contains_key(related) {
                    return Err(RegistryError::UnknownModel(related.to_string()));
                }
            }
            if let Some(parent) = &model.parent {
                if !self.models.contains_key(parent) {
                    return Err(RegistryError::UnknownModel(parent.clone()));
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ModelDef> {
        self.models.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    /// Models in name order
    pub fn models(&self) -> impl Iterator<Item = &ModelDef> {
        self.models.values()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Attach an implementation to a declared method
    pub fn bind_method(
        &mut self,
        model: &str,
        method: &str,
        handler: Arc<dyn ModelMethod>,
    ) -> Result<(), RegistryError> {
        let def = self
            .models
            .get_mut(model)
            .ok_or_else(|| RegistryError::UnknownModel(model.to_string()))?;
        let slot = def
            .methods
            .iter_mut()
            .find(|m| m.name == method)
            .ok_or_else(|| RegistryError::UnknownMember {
                model: model.to_string(),
                member: method.to_string(),
            })?;
        slot.handler = Some(MethodHandler(handler));
        Ok(())
    }

    /// Attach a getter to a declared property
    pub fn bind_property(
        &mut self,
        model: &str,
        property: &str,
        getter: PropertyFn,
    ) -> Result<(), RegistryError> {
        let def = self
            .models
            .get_mut(model)
            .ok_or_else(|| RegistryError::UnknownModel(model.to_string()))?;
        let slot = def
            .properties
            .iter_mut()
            .find(|p| p.name == property)
            .ok_or_else(|| RegistryError::UnknownMember {
                model: model.to_string(),
                member: property.to_string(),
            })?;
        slot.getter = Some(PropertyGetter(getter));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_model_rejected() {
        let mut registry = ModelRegistry::new();
        registry.register(ModelDef::new("blog", "Tag")).unwrap();
        let err = registry.register(ModelDef::new("shop", "Tag")).unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(name) if name == "Tag"));
    }

    #[test]
    fn test_relation_to_unknown_model_rejected() {
        let post = ModelDef::new("blog", "Post")
            .field(FieldDef::primary("id"))
            .field(FieldDef::relation("category", FieldKind::ForeignKey, "Category"));
        let err = ModelRegistry::from_models([post]).unwrap_err();
        assert!(matches!(err, RegistryError::UnknownModel(name) if name == "Category"));
    }

    #[test]
    fn test_table_name() {
        assert_eq!(ModelDef::new("blog", "BlogPost").table_name(), "blog_blog_post");
    }

    #[test]
    fn test_manifest_deserialization() {
        let json = serde_json::json!({
            "name": "Tag",
            "app_label": "blog",
            "fields": [
                { "name": "id", "kind": "auto", "primary_key": true },
                { "name": "name", "kind": "char", "max_length": 50, "unique": true },
                { "name": "phone", "kind": { "custom": "PhoneNumberField" }, "blank": true }
            ],
            "methods": [
                { "name": "merge_into", "mutation": true, "params": [{ "name": "target", "annotation": "i64" }] }
            ]
        });
        let model: ModelDef = serde_json::from_value(json).unwrap();
        assert_eq!(model.fields.len(), 3);
        assert_eq!(model.fields[2].kind, FieldKind::Custom("PhoneNumberField".into()));
        assert!(model.methods[0].atomic);
        assert!(model.methods[0].handler.is_none());
    }
}

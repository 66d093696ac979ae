//! Generated type descriptors
//!
//! The generators build plain descriptions of GraphQL types; the schema layer
//! turns them into `async_graphql::dynamic` types and the code generator into
//! Rust source. Keeping them as data lets both consumers share one generator.

use std::fmt;
use std::sync::Arc;

use async_graphql::dynamic;

/// Reference to a GraphQL type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeRef {
    Named(String),
    NonNull(Box<TypeRef>),
    List(Box<TypeRef>),
}

impl TypeRef {
    pub fn named(name: impl Into<String>) -> Self {
        TypeRef::Named(name.into())
    }

    /// `Name!`
    pub fn named_nn(name: impl Into<String>) -> Self {
        Self::named(name).non_null()
    }

    /// `[Name!]`
    pub fn named_nn_list(name: impl Into<String>) -> Self {
        TypeRef::List(Box::new(Self::named_nn(name)))
    }

    /// `[Name!]!`
    pub fn named_nn_list_nn(name: impl Into<String>) -> Self {
        Self::named_nn_list(name).non_null()
    }

    pub fn non_null(self) -> Self {
        match self {
            TypeRef::NonNull(_) => self,
            other => TypeRef::NonNull(Box::new(other)),
        }
    }

    pub fn nullable(self) -> Self {
        match self {
            TypeRef::NonNull(inner) => *inner,
            other => other,
        }
    }

    pub fn is_required(&self) -> bool {
        matches!(self, TypeRef::NonNull(_))
    }

    pub fn is_list(&self) -> bool {
        match self {
            TypeRef::List(_) => true,
            TypeRef::NonNull(inner) => inner.is_list(),
            TypeRef::Named(_) => false,
        }
    }

    /// Innermost named type
    pub fn base_name(&self) -> &str {
        match self {
            TypeRef::Named(name) => name,
            TypeRef::NonNull(inner) | TypeRef::List(inner) => inner.base_name(),
        }
    }

    pub fn to_dynamic(&self) -> dynamic::TypeRef {
        match self {
            TypeRef::Named(name) => dynamic::TypeRef::Named(name.clone().into()),
            TypeRef::NonNull(inner) => dynamic::TypeRef::NonNull(Box::new(inner.to_dynamic())),
            TypeRef::List(inner) => dynamic::TypeRef::List(Box::new(inner.to_dynamic())),
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Named(name) => f.write_str(name),
            TypeRef::NonNull(inner) => write!(f, "{inner}!"),
            TypeRef::List(inner) => write!(f, "[{inner}]"),
        }
    }
}

/// Mutation flavour an input type is generated for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    Create,
    Update,
}

impl MutationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MutationKind::Create => "Create",
            MutationKind::Update => "Update",
        }
    }
}

/// How an object field gets its value at runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldSource {
    /// Column of the parent row; `id` renders the value as a GraphQL `ID`
    Column { key: String, id: bool },
    /// Opaque global id of the parent row
    GlobalId,
    /// Row referenced by a foreign key column
    ToOne { column: String, target: String },
    /// Rows linked through a many-to-many relation
    ToMany { field: String, target: String },
    /// Rows of `source_model` whose `field` points at the parent
    Reverse {
        source_model: String,
        field: String,
        single: bool,
    },
    /// Computed property of the parent row
    Property { name: String },
    /// Entry of a plain JSON parent (page info, health)
    Key(String),
    PageItems,
    PageInfo,
    PayloadOk,
    PayloadErrors,
    PayloadObject,
    PayloadObjects,
    PayloadResult,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectField {
    pub name: String,
    pub ty: TypeRef,
    pub description: Option<String>,
    pub source: FieldSource,
}

impl ObjectField {
    pub fn new(name: impl Into<String>, ty: TypeRef, source: FieldSource) -> Self {
        Self {
            name: name.into(),
            ty,
            description: None,
            source,
        }
    }

    pub fn describe(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }
}

/// Output object type
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectTypeDef {
    pub name: String,
    /// Model whose rows back the type
    pub model: Option<String>,
    pub description: Option<String>,
    pub fields: Vec<ObjectField>,
}

impl ObjectTypeDef {
    pub fn field(&self, name: &str) -> Option<&ObjectField> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// What an input field feeds into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputRole {
    Scalar,
    /// Bare id or id list for a forward relation
    Relation,
    /// `nested_{field}` object counterpart of a relation
    Nested,
    /// Nested objects created through a reverse relation
    Reverse,
    /// Lookup or combinator of a filter
    Filter,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InputFieldDef {
    pub name: String,
    pub ty: TypeRef,
    pub description: Option<String>,
    pub role: InputRole,
}

impl InputFieldDef {
    pub fn new(name: impl Into<String>, ty: TypeRef, role: InputRole) -> Self {
        Self {
            name: name.into(),
            ty,
            description: None,
            role,
        }
    }

    pub fn describe(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }
}

/// Input object type
#[derive(Debug, Clone, PartialEq)]
pub struct InputTypeDef {
    pub name: String,
    pub model: Option<String>,
    pub description: Option<String>,
    pub fields: Vec<InputFieldDef>,
}

impl InputTypeDef {
    pub fn field(&self, name: &str) -> Option<&InputFieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Whether any field points at the given type name
    pub fn references(&self, type_name: &str) -> bool {
        self.fields.iter().any(|f| f.ty.base_name() == type_name)
    }
}

/// Argument of a root field
#[derive(Debug, Clone, PartialEq)]
pub struct ArgDef {
    pub name: String,
    pub ty: TypeRef,
    pub default: Option<serde_json::Value>,
}

impl ArgDef {
    pub fn new(name: impl Into<String>, ty: TypeRef) -> Self {
        Self {
            name: name.into(),
            ty,
            default: None,
        }
    }

    pub fn with_default(mut self, default: serde_json::Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// A type held by the registry
#[derive(Debug, Clone)]
pub enum GeneratedType {
    Object(Arc<ObjectTypeDef>),
    Input(Arc<InputTypeDef>),
}

impl GeneratedType {
    pub fn name(&self) -> &str {
        match self {
            GeneratedType::Object(def) => &def.name,
            GeneratedType::Input(def) => &def.name,
        }
    }
}

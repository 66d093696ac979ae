//! Error types for schema generation
//!
//! Errors raised while reading model metadata and assembling types. Runtime
//! errors live next to the layer that raises them: `StoreError` in
//! [`crate::store`], `ValidationError` in [`crate::validation`] and
//! `NestedError` in [`crate::nested`].

/// Error raised by the model registry and the introspector
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Two models share a name
    #[error("model '{0}' is already registered")]
    Duplicate(String),

    /// A model name that the registry does not know
    #[error("unknown model '{0}'")]
    UnknownModel(String),

    /// A relationship field without a target model
    #[error("relationship '{model}.{field}' has no related model")]
    MissingTarget {
        /// Declaring model
        model: String,
        /// Relationship field
        field: String,
    },

    /// A method or property that the model does not declare
    #[error("model '{model}' has no member '{member}'")]
    UnknownMember {
        /// Declaring model
        model: String,
        /// Method or property name
        member: String,
    },

    /// Inheritance chain loops back on itself
    #[error("inheritance cycle through model '{0}'")]
    InheritanceCycle(String),
}

/// Error raised while generating or assembling the schema
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    /// Model metadata could not be read
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The GraphQL library rejected the assembled schema
    #[error("schema build error: {0}")]
    Build(String),

    /// The rebuild lock was poisoned by a panicking builder
    #[error("schema builder lock poisoned")]
    Poisoned,
}

/// Error raised while rendering Rust source
#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    /// Generated tokens did not parse as a Rust file
    #[error("generated code does not parse: {0}")]
    Parse(#[from] syn::Error),
}

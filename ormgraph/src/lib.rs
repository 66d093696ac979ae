//! ormgraph: GraphQL schemas generated from ORM model metadata
//!
//! Given a [`ModelRegistry`] of model descriptors, ormgraph builds:
//! - object types with forward and reverse relations
//! - create and update input types, including `nested_{field}` inputs whose
//!   relationship cycles are broken by excluding the parent model
//! - filter inputs with Django-style lookups
//! - list, single and paginated query fields
//! - create, update, delete, bulk and model method mutations that write nested
//!   object graphs inside one transaction
//!
//! [`SchemaBuilder`] assembles everything into an `async_graphql::dynamic`
//! schema and republishes it when models change. [`codegen::render_types`]
//! emits the same types as Rust source.

pub mod codegen;
pub mod error;
pub mod filters;
pub mod global_id;
pub mod introspector;
pub mod methods;
pub mod model;
pub mod mutations;
pub mod nested;
pub mod queries;
pub mod schema;
pub mod settings;
pub mod store;
pub mod types;
pub mod validation;

#[cfg(test)]
mod test_fixtures;

pub use error::{CodegenError, RegistryError, SchemaError};
pub use introspector::{ModelIntrospector, ModelMetadata};
pub use model::{FieldDef, FieldKind, MethodDef, ModelDef, ModelRegistry, Record};
pub use mutations::{MutationGenerator, MutationResult};
pub use nested::{NestedError, NestedOperationHandler};
pub use queries::QueryGenerator;
pub use schema::{BuiltSchema, SchemaBuilder, SchemaExtension, Signal};
pub use settings::SchemaSettings;
pub use store::{MemoryStore, Store, Transaction};
pub use types::TypeGenerator;

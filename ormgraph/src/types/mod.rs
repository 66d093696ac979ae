//! Object and input type generation
//!
//! [`TypeGenerator`] walks model metadata and builds type descriptors:
//! - object types with scalar fields, forward relations and reverse relation lists
//! - create/update input types with create-mode requiredness
//! - `nested_{field}` dual fields and reverse relation inputs
//! - reduced nested input types that break relationship cycles
//! - filter input types
//!
//! Every generated type is held by the [`TypeRegistry`] under a typed key, so a
//! repeated request returns the same `Arc`.

pub mod defs;
pub mod scalars;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::RegistryError;
use crate::filters::AdvancedFilterGenerator;
use crate::introspector::{FieldInfo, ModelIntrospector, ModelMetadata};
use crate::model::{ModelRegistry, RelationKind};
use crate::settings::TypeGeneratorSettings;

pub use defs::{
    ArgDef, FieldSource, GeneratedType, InputFieldDef, InputRole, InputTypeDef, MutationKind,
    ObjectField, ObjectTypeDef, TypeRef,
};
pub use scalars::{Scalar, handle_custom_fields};

/// Cache key of a generated type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeKey {
    Object(String),
    Input {
        model: String,
        partial: bool,
        mutation: MutationKind,
        include_reverse: bool,
    },
    NestedInput {
        model: String,
        mutation: MutationKind,
        exclude: Option<String>,
    },
    Filter(String),
    /// Payload, page and other support types, keyed by name
    Support(String),
}

/// Owner of every generated type
#[derive(Debug, Default)]
pub struct TypeRegistry {
    types: HashMap<TypeKey, GeneratedType>,
    names: HashMap<String, TypeKey>,
    order: Vec<TypeKey>,
}

impl TypeRegistry {
    pub fn get(&self, key: &TypeKey) -> Option<&GeneratedType> {
        self.types.get(key)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&GeneratedType> {
        self.names.get(name).and_then(|key| self.types.get(key))
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    /// Types in generation order
    pub fn iter(&self) -> impl Iterator<Item = &GeneratedType> {
        self.order.iter().filter_map(|key| self.types.get(key))
    }

    pub fn objects(&self) -> impl Iterator<Item = &Arc<ObjectTypeDef>> {
        self.iter().filter_map(|ty| match ty {
            GeneratedType::Object(def) => Some(def),
            GeneratedType::Input(_) => None,
        })
    }

    pub fn inputs(&self) -> impl Iterator<Item = &Arc<InputTypeDef>> {
        self.iter().filter_map(|ty| match ty {
            GeneratedType::Input(def) => Some(def),
            GeneratedType::Object(_) => None,
        })
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// First free name out of `base`, then `alternate`, then `alternate{n}`
    fn claim_name(&self, base: String, alternate: String) -> String {
        if !self.names.contains_key(&base) {
            return base;
        }
        if !self.names.contains_key(&alternate) {
            return alternate;
        }
        let mut n = 2;
        loop {
            let candidate = format!("{alternate}{n}");
            if !self.names.contains_key(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    fn insert(&mut self, key: TypeKey, ty: GeneratedType) {
        self.names.insert(ty.name().to_string(), key.clone());
        self.order.push(key.clone());
        self.types.insert(key, ty);
    }

    fn object(&self, key: &TypeKey) -> Option<Arc<ObjectTypeDef>> {
        match self.types.get(key) {
            Some(GeneratedType::Object(def)) => Some(def.clone()),
            _ => None,
        }
    }

    fn input(&self, key: &TypeKey) -> Option<Arc<InputTypeDef>> {
        match self.types.get(key) {
            Some(GeneratedType::Input(def)) => Some(def.clone()),
            _ => None,
        }
    }
}

/// Builds and caches GraphQL type descriptors for models
#[derive(Debug)]
pub struct TypeGenerator {
    introspector: ModelIntrospector,
    settings: TypeGeneratorSettings,
    filter_depth: usize,
    registry: TypeRegistry,
}

impl TypeGenerator {
    pub fn new(models: Arc<ModelRegistry>, settings: TypeGeneratorSettings) -> Self {
        Self {
            introspector: ModelIntrospector::new(models),
            settings,
            filter_depth: 2,
            registry: TypeRegistry::default(),
        }
    }

    /// How deep filter paths may follow relations
    pub fn with_filter_depth(mut self, depth: usize) -> Self {
        self.filter_depth = depth;
        self
    }

    pub fn settings(&self) -> &TypeGeneratorSettings {
        &self.settings
    }

    pub fn introspector(&self) -> &ModelIntrospector {
        &self.introspector
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn into_registry(self) -> TypeRegistry {
        self.registry
    }

    /// Output type exposing a model's rows
    pub fn generate_object_type(&mut self, model: &str) -> Result<Arc<ObjectTypeDef>, RegistryError> {
        let key = TypeKey::Object(model.to_string());
        if let Some(def) = self.registry.object(&key) {
            return Ok(def);
        }
        debug!(model, "generating object type");

        let meta = self.introspector.introspect(model)?;
        let mut fields = Vec::new();
        for field in meta.fields.values() {
            if !self.settings.is_field_exposed(model, &field.name) {
                continue;
            }
            let scalar = self.scalar(field);
            let ty = if field.null && !field.primary_key {
                TypeRef::named(scalar.name())
            } else {
                TypeRef::named_nn(scalar.name())
            };
            fields.push(
                ObjectField::new(
                    field.name.clone(),
                    ty,
                    FieldSource::Column {
                        key: field.name.clone(),
                        id: scalar == Scalar::Id,
                    },
                )
                .describe(field.help_text.clone()),
            );
        }
        fields.push(ObjectField::new("global_id", TypeRef::named_nn("ID"), FieldSource::GlobalId));

        for rel in meta.relationships.values() {
            if !self.settings.is_field_exposed(model, &rel.name) {
                continue;
            }
            let (ty, source) = match rel.relationship_type {
                RelationKind::ToOne | RelationKind::ToOneUnique => {
                    let ty = TypeRef::named(&rel.related_model);
                    let ty = if rel.null { ty } else { ty.non_null() };
                    let source = FieldSource::ToOne {
                        column: rel.from_field.clone(),
                        target: rel.related_model.clone(),
                    };
                    (ty, source)
                }
                RelationKind::ToMany => (
                    TypeRef::named_nn_list_nn(&rel.related_model),
                    FieldSource::ToMany {
                        field: rel.name.clone(),
                        target: rel.related_model.clone(),
                    },
                ),
            };
            fields.push(ObjectField::new(rel.name.clone(), ty, source).describe(rel.help_text.clone()));
        }

        for reverse in meta.reverse_relations.values() {
            if !self.settings.is_field_exposed(model, &reverse.accessor) || fields.iter().any(|f| f.name == reverse.accessor) {
                continue;
            }
            let single = reverse.is_single();
            let ty = if single {
                TypeRef::named(&reverse.related_model)
            } else {
                TypeRef::named_nn_list_nn(&reverse.related_model)
            };
            fields.push(ObjectField::new(
                reverse.accessor.clone(),
                ty,
                FieldSource::Reverse {
                    source_model: reverse.related_model.clone(),
                    field: reverse.field.clone(),
                    single,
                },
            ));
        }

        for property in meta.properties.values() {
            if !self.settings.is_field_exposed(model, &property.name) {
                continue;
            }
            let scalar = scalars::scalar_for(&property.kind, false, &self.settings.custom_scalars);
            fields.push(ObjectField::new(
                property.name.clone(),
                TypeRef::named(scalar.name()),
                FieldSource::Property {
                    name: property.name.clone(),
                },
            ));
        }

        let name = self.registry.claim_name(meta.name.clone(), format!("{}Type", meta.name));
        let def = Arc::new(ObjectTypeDef {
            name,
            model: Some(meta.name.clone()),
            description: meta.description.clone(),
            fields,
        });
        self.registry.insert(key, GeneratedType::Object(def.clone()));
        Ok(def)
    }

    /// Input type for create or update mutations
    ///
    /// Update inputs only require the identifier; `partial` and
    /// `include_reverse_relations` do not change them, so all update requests
    /// for a model share one type.
    pub fn generate_input_type(
        &mut self,
        model: &str,
        partial: bool,
        mutation: MutationKind,
        include_reverse_relations: bool,
    ) -> Result<Arc<InputTypeDef>, RegistryError> {
        let (partial, include_reverse) = match mutation {
            MutationKind::Create => (partial, include_reverse_relations),
            MutationKind::Update => (true, false),
        };
        let key = TypeKey::Input {
            model: model.to_string(),
            partial,
            mutation,
            include_reverse,
        };
        if let Some(def) = self.registry.input(&key) {
            return Ok(def);
        }
        debug!(model, ?mutation, partial, include_reverse, "generating input type");

        let meta = self.introspector.introspect(model)?;
        let creating = mutation == MutationKind::Create && !partial;
        let mut fields = Vec::new();

        for field in meta.fields.values() {
            if !self.settings.is_field_exposed(model, &field.name) {
                continue;
            }
            let required = match mutation {
                MutationKind::Create => creating && is_required_for_create(field),
                MutationKind::Update => field.primary_key,
            };
            let ty = TypeRef::named(self.scalar(field).name());
            let ty = if required { ty.non_null() } else { ty };
            fields.push(
                InputFieldDef::new(field.name.clone(), ty, InputRole::Scalar)
                    .describe(field.help_text.clone()),
            );
        }

        for rel in meta.relationships.values() {
            if !self.settings.is_field_exposed(model, &rel.name) {
                continue;
            }
            let ty = if rel.relationship_type.is_to_one() {
                let required = creating && !rel.null && !rel.blank && !rel.has_default;
                let ty = TypeRef::named("ID");
                if required { ty.non_null() } else { ty }
            } else {
                let ty = TypeRef::named_nn_list("ID");
                if creating && !rel.blank { ty.non_null() } else { ty }
            };
            fields.push(InputFieldDef::new(rel.name.clone(), ty, InputRole::Relation).describe(rel.help_text.clone()));

            if self.settings.nested.is_enabled(model, &rel.name) {
                let nested = self.generate_nested_input_type(&rel.related_model, mutation, Some(model))?;
                let ty = if rel.relationship_type.is_to_one() {
                    TypeRef::named(&nested.name)
                } else {
                    TypeRef::named_nn_list(&nested.name)
                };
                fields.push(InputFieldDef::new(format!("nested_{}", rel.name), ty, InputRole::Nested));
            }
        }

        if include_reverse && mutation == MutationKind::Create {
            for reverse in meta.reverse_relations.values() {
                if !self.settings.is_field_exposed(model, &reverse.accessor)
                    || !self.settings.nested.is_enabled(model, &reverse.accessor)
                    || fields.iter().any(|f| f.name == reverse.accessor)
                {
                    continue;
                }
                let nested = self.generate_nested_input_type(&reverse.related_model, MutationKind::Create, Some(model))?;
                let ty = if reverse.is_single() {
                    TypeRef::named(&nested.name)
                } else {
                    TypeRef::named_nn_list(&nested.name)
                };
                fields.push(InputFieldDef::new(reverse.accessor.clone(), ty, InputRole::Reverse));
            }
        }

        let base = format!(
            "{}{}{}Input",
            meta.name,
            if partial && mutation == MutationKind::Create { "Partial" } else { "" },
            mutation.as_str()
        );
        let alternate = format!("{}Flat{}Input", meta.name, mutation.as_str());
        let name = self.registry.claim_name(base, alternate);
        let def = Arc::new(InputTypeDef {
            name,
            model: Some(meta.name.clone()),
            description: None,
            fields,
        });
        self.registry.insert(key, GeneratedType::Input(def.clone()));
        Ok(def)
    }

    /// Reduced input used inside another model's input
    ///
    /// Scalars are all optional and relations are bare ids, so nesting stops
    /// after one level. Relations pointing at `exclude_parent` are dropped to
    /// break the cycle back to the enclosing model.
    pub fn generate_nested_input_type(
        &mut self,
        model: &str,
        mutation: MutationKind,
        exclude_parent: Option<&str>,
    ) -> Result<Arc<InputTypeDef>, RegistryError> {
        let meta = self.introspector.introspect(model)?;
        let exclude = exclude_parent
            .filter(|parent| {
                meta.relationships
                    .values()
                    .any(|rel| rel.related_model == *parent)
            })
            .map(str::to_string);
        let key = TypeKey::NestedInput {
            model: model.to_string(),
            mutation,
            exclude: exclude.clone(),
        };
        if let Some(def) = self.registry.input(&key) {
            return Ok(def);
        }
        debug!(model, ?mutation, exclude = ?exclude, "generating nested input type");

        let mut fields = Vec::new();
        for field in meta.fields.values() {
            if !self.settings.is_field_exposed(model, &field.name) {
                continue;
            }
            let ty = TypeRef::named(self.scalar(field).name());
            fields.push(InputFieldDef::new(field.name.clone(), ty, InputRole::Scalar));
        }
        for rel in meta.relationships.values() {
            if Some(&rel.related_model) == exclude.as_ref()
                || !self.settings.is_field_exposed(model, &rel.name)
            {
                continue;
            }
            let ty = if rel.relationship_type.is_to_one() {
                TypeRef::named("ID")
            } else {
                TypeRef::named_nn_list("ID")
            };
            fields.push(InputFieldDef::new(rel.name.clone(), ty, InputRole::Relation));
        }

        let base = format!("{}Nested{}Input", meta.name, mutation.as_str());
        let alternate = match &exclude {
            Some(parent) => format!("{base}Excluding{parent}"),
            None => format!("{base}Complete"),
        };
        let name = self.registry.claim_name(base, alternate);
        let def = Arc::new(InputTypeDef {
            name,
            model: Some(meta.name.clone()),
            description: None,
            fields,
        });
        self.registry.insert(key, GeneratedType::Input(def.clone()));
        Ok(def)
    }

    /// `{Model}Filter` input type
    pub fn generate_filter_type(&mut self, model: &str) -> Result<Arc<InputTypeDef>, RegistryError> {
        let key = TypeKey::Filter(model.to_string());
        if let Some(def) = self.registry.input(&key) {
            return Ok(def);
        }
        debug!(model, "generating filter type");
        let mut def = AdvancedFilterGenerator::new(&self.introspector, &self.settings, self.filter_depth)
            .generate_filter_type(model)?;
        def.name = self
            .registry
            .claim_name(def.name.clone(), format!("{}Where", def.name));
        let def = Arc::new(def);
        self.registry.insert(key, GeneratedType::Input(def.clone()));
        Ok(def)
    }

    /// Register a support object type; a name already taken returns the existing type
    pub fn register_object(&mut self, def: ObjectTypeDef) -> Arc<ObjectTypeDef> {
        let key = TypeKey::Support(def.name.clone());
        if let Some(existing) = self.registry.object(&key) {
            return existing;
        }
        let def = Arc::new(def);
        self.registry.insert(key, GeneratedType::Object(def.clone()));
        def
    }

    /// Register a support input type; a name already taken returns the existing type
    pub fn register_input(&mut self, def: InputTypeDef) -> Arc<InputTypeDef> {
        let key = TypeKey::Support(def.name.clone());
        if let Some(existing) = self.registry.input(&key) {
            return existing;
        }
        let def = Arc::new(def);
        self.registry.insert(key, GeneratedType::Input(def.clone()));
        def
    }

    /// Metadata passthrough for collaborating generators
    pub fn metadata(&self, model: &str) -> Result<ModelMetadata, RegistryError> {
        self.introspector.introspect(model)
    }

    fn scalar(&self, field: &FieldInfo) -> Scalar {
        scalars::scalar_for(&field.field_type, field.primary_key, &self.settings.custom_scalars)
    }
}

/// Create-mode rule: required unless the store or the caller can leave it out
pub fn is_required_for_create(field: &FieldInfo) -> bool {
    !field.primary_key
        && !field.has_auto_now
        && !field.has_auto_now_add
        && !field.has_default
        && !field.blank
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldDef, FieldKind, ModelDef};
    use crate::settings::NestedRelationsPolicy;
    use crate::test_fixtures::blog_registry;

    fn generator() -> TypeGenerator {
        TypeGenerator::new(Arc::new(blog_registry()), TypeGeneratorSettings::default())
    }

    fn field_type(def: &InputTypeDef, name: &str) -> String {
        def.field(name)
            .map(|f| f.ty.to_string())
            .unwrap_or_else(|| panic!("missing field {name} on {}", def.name))
    }

    #[test]
    fn test_object_type_cached_identity() {
        let mut types = generator();
        let first = types.generate_object_type("Post").unwrap();
        let second = types.generate_object_type("Post").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_input_type_cached_identity() {
        let mut types = generator();
        let first = types.generate_input_type("Tag", true, MutationKind::Update, false).unwrap();
        let second = types.generate_input_type("Tag", true, MutationKind::Update, false).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let create = types.generate_input_type("Post", false, MutationKind::Create, true).unwrap();
        let again = types.generate_input_type("Post", false, MutationKind::Create, true).unwrap();
        assert!(Arc::ptr_eq(&create, &again));
        let flat = types.generate_input_type("Post", false, MutationKind::Create, false).unwrap();
        assert!(!Arc::ptr_eq(&create, &flat));
        assert_ne!(create.name, flat.name);
    }

    #[test]
    fn test_object_type_fields() {
        let mut types = generator();
        let post = types.generate_object_type("Post").unwrap();
        assert_eq!(post.field("id").unwrap().ty.to_string(), "ID!");
        assert_eq!(post.field("title").unwrap().ty.to_string(), "String!");
        assert_eq!(post.field("category").unwrap().ty.to_string(), "Category!");
        assert_eq!(post.field("tags").unwrap().ty.to_string(), "[Tag!]!");
        let comments = post.field("comments").unwrap();
        assert_eq!(comments.ty.to_string(), "[Comment!]!");
        assert!(matches!(&comments.source, FieldSource::Reverse { source_model, .. } if source_model == "Comment"));

        let tag = types.generate_object_type("Tag").unwrap();
        assert!(tag.field("post_set").is_some());
    }

    #[test]
    fn test_create_input_post() {
        let mut types = generator();
        let input = types.generate_input_type("Post", false, MutationKind::Create, true).unwrap();
        assert_eq!(input.name, "PostCreateInput");
        assert_eq!(field_type(&input, "category"), "ID!");
        assert_eq!(field_type(&input, "title"), "String!");
        assert_eq!(field_type(&input, "body"), "String");
        assert_eq!(field_type(&input, "published"), "Boolean");
        assert_eq!(field_type(&input, "created_at"), "DateTime");
        assert_eq!(field_type(&input, "updated_at"), "DateTime");
        assert_eq!(field_type(&input, "id"), "ID");
        assert_eq!(field_type(&input, "tags"), "[ID!]");
        assert_eq!(field_type(&input, "nested_category"), "CategoryNestedCreateInput");
        assert_eq!(field_type(&input, "nested_tags"), "[TagNestedCreateInput!]");
        assert_eq!(field_type(&input, "comments"), "[CommentNestedCreateInput!]");

        let comment = types.registry().get_by_name("CommentNestedCreateInput").unwrap();
        let GeneratedType::Input(comment) = comment else {
            panic!("expected input type");
        };
        assert!(comment.field("post").is_none());
        assert!(comment.field("content").is_some());
        assert!(!comment.references("Post"));
    }

    #[test]
    fn test_create_requiredness_flips() {
        let model = ModelDef::new("app", "Item")
            .field(FieldDef::primary("id"))
            .field(FieldDef::new("plain", FieldKind::Char))
            .field(FieldDef::new("blank", FieldKind::Char).blank(true))
            .field(FieldDef::new("defaulted", FieldKind::Integer).default_value(serde_json::json!(1)))
            .field(FieldDef::new("stamped", FieldKind::DateTime).auto_now())
            .field(FieldDef::new("added", FieldKind::DateTime).auto_now_add());
        let registry = ModelRegistry::from_models([model]).unwrap();
        let mut types = TypeGenerator::new(Arc::new(registry), TypeGeneratorSettings::default());
        let input = types.generate_input_type("Item", false, MutationKind::Create, false).unwrap();
        assert_eq!(field_type(&input, "plain"), "String!");
        assert_eq!(field_type(&input, "blank"), "String");
        assert_eq!(field_type(&input, "defaulted"), "Int");
        assert_eq!(field_type(&input, "stamped"), "DateTime");
        assert_eq!(field_type(&input, "added"), "DateTime");
        assert_eq!(field_type(&input, "id"), "ID");
    }

    #[test]
    fn test_update_input_is_partial() {
        let mut types = generator();
        let input = types.generate_input_type("Post", false, MutationKind::Update, false).unwrap();
        assert_eq!(input.name, "PostUpdateInput");
        for field in &input.fields {
            if field.name == "id" {
                assert!(field.ty.is_required());
            } else {
                assert!(!field.ty.is_required(), "{} should be optional", field.name);
            }
        }
        assert!(input.field("comments").is_none());
        assert_eq!(field_type(&input, "nested_category"), "CategoryNestedUpdateInput");
    }

    #[test]
    fn test_nested_input_cycle_breaking() {
        let mut types = generator();
        let excluded = types
            .generate_nested_input_type("Post", MutationKind::Create, Some("Category"))
            .unwrap();
        assert!(excluded.field("category").is_none());
        assert!(excluded.fields.iter().all(|f| f.ty.base_name() != "Category"));

        let full = types.generate_nested_input_type("Post", MutationKind::Create, None).unwrap();
        assert!(full.field("category").is_some());
        assert!(!Arc::ptr_eq(&excluded, &full));
        assert_ne!(excluded.name, full.name);
        assert_eq!(field_type(&full, "tags"), "[ID!]");
        assert!(full.fields.iter().all(|f| !f.ty.is_required()));
    }

    #[test]
    fn test_nested_exclusion_is_part_of_the_key() {
        let mut types = generator();
        let by_category = types
            .generate_nested_input_type("Post", MutationKind::Create, Some("Category"))
            .unwrap();
        let by_tag = types
            .generate_nested_input_type("Post", MutationKind::Create, Some("Tag"))
            .unwrap();
        assert!(by_category.field("tags").is_some());
        assert!(by_tag.field("tags").is_none());
        assert!(by_tag.field("category").is_some());
        assert_eq!(by_tag.name, "PostNestedCreateInputExcludingTag");

        // an exclusion that removes nothing shares the unexcluded type
        let unrelated = types
            .generate_nested_input_type("Post", MutationKind::Create, Some("Comment"))
            .unwrap();
        let none = types.generate_nested_input_type("Post", MutationKind::Create, None).unwrap();
        assert!(Arc::ptr_eq(&unrelated, &none));
    }

    #[test]
    fn test_disabled_nesting_drops_dual_field() {
        let settings = TypeGeneratorSettings {
            nested: NestedRelationsPolicy::default()
                .disable_field("Post", "category")
                .disable_field("Post", "comments"),
            ..Default::default()
        };
        let mut types = TypeGenerator::new(Arc::new(blog_registry()), settings);
        let input = types.generate_input_type("Post", false, MutationKind::Create, true).unwrap();
        assert!(input.field("nested_category").is_none());
        assert!(input.field("comments").is_none());
        assert!(input.field("nested_tags").is_some());
        assert_eq!(field_type(&input, "category"), "ID!");
    }

    #[test]
    fn test_excluded_fields_hidden() {
        let mut settings = TypeGeneratorSettings::default();
        settings
            .exclude_fields
            .insert("Post".into(), ["body".to_string()].into());
        let mut types = TypeGenerator::new(Arc::new(blog_registry()), settings);
        assert!(types.generate_object_type("Post").unwrap().field("body").is_none());
        let input = types.generate_input_type("Post", false, MutationKind::Create, true).unwrap();
        assert!(input.field("body").is_none());
    }
}

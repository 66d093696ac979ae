//! Schema assembly
//!
//! [`SchemaBuilder`] is the context object a host application keeps around:
//! it owns the model registry, the store and the collaborators, and publishes
//! a complete [`BuiltSchema`] on every rebuild. Rebuilds are serialized by a
//! mutex; readers load the published schema without locking and always see a
//! finished one.

mod dynamic;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwapOption;
use tracing::{debug, info};

use crate::error::{RegistryError, SchemaError};
use crate::global_id::{GlobalIdCodec, RelayGlobalId};
use crate::introspector::{ModelIntrospector, ModelMetadata};
use crate::model::ModelRegistry;
use crate::mutations::{MutationFieldDef, MutationGenerator};
use crate::queries::{CacheManager, QueryFieldDef, QueryGenerator, QueryOptimizer, RelationOptimizer};
use crate::settings::SchemaSettings;
use crate::store::Store;
use crate::types::{FieldSource, ObjectField, ObjectTypeDef, TypeGenerator, TypeKey, TypeRef, TypeRegistry};

/// Lifecycle events that may change the schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    MigrationApplied,
    InstanceSaved { model: String },
    InstanceDeleted { model: String },
}

/// Extra root fields contributed by another layer, e.g. authentication
pub trait SchemaExtension: Send + Sync {
    fn name(&self) -> &str;

    fn query_fields(&self, _models: &[ModelMetadata]) -> Vec<async_graphql::dynamic::Field> {
        Vec::new()
    }

    fn mutation_fields(&self, _models: &[ModelMetadata]) -> Vec<async_graphql::dynamic::Field> {
        Vec::new()
    }

    /// Types the contributed fields refer to
    fn types(&self) -> Vec<async_graphql::dynamic::Type> {
        Vec::new()
    }
}

/// Type descriptors and root fields of one build
#[derive(Debug)]
pub struct SchemaPlan {
    pub models: Vec<String>,
    pub types: TypeRegistry,
    pub queries: Vec<QueryFieldDef>,
    pub mutations: Vec<MutationFieldDef>,
    pub health: Option<Arc<ObjectTypeDef>>,
}

/// A published schema
pub struct BuiltSchema {
    pub schema: async_graphql::dynamic::Schema,
    pub version: u64,
    pub plan: SchemaPlan,
}

impl BuiltSchema {
    /// Schema definition language of the published schema
    pub fn sdl(&self) -> String {
        self.schema.sdl()
    }
}

/// Builds, publishes and refreshes the GraphQL schema of a model registry
pub struct SchemaBuilder {
    models: Arc<ModelRegistry>,
    store: Arc<dyn Store>,
    settings: SchemaSettings,
    extensions: Vec<Arc<dyn SchemaExtension>>,
    optimizer: Arc<dyn QueryOptimizer>,
    cache: Option<Arc<dyn CacheManager>>,
    global_ids: Arc<dyn GlobalIdCodec>,
    rebuild: Mutex<()>,
    current: ArcSwapOption<BuiltSchema>,
    version: AtomicU64,
}

impl SchemaBuilder {
    pub fn new(models: Arc<ModelRegistry>, store: Arc<dyn Store>, settings: SchemaSettings) -> Self {
        Self {
            models,
            store,
            settings,
            extensions: Vec::new(),
            optimizer: Arc::new(RelationOptimizer),
            cache: None,
            global_ids: Arc::new(RelayGlobalId),
            rebuild: Mutex::new(()),
            current: ArcSwapOption::empty(),
            version: AtomicU64::new(0),
        }
    }

    pub fn with_extension(mut self, extension: Arc<dyn SchemaExtension>) -> Self {
        self.extensions.push(extension);
        self
    }

    pub fn with_optimizer(mut self, optimizer: Arc<dyn QueryOptimizer>) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheManager>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_global_id_codec(mut self, codec: Arc<dyn GlobalIdCodec>) -> Self {
        self.global_ids = codec;
        self
    }

    pub fn settings(&self) -> &SchemaSettings {
        &self.settings
    }

    /// Concrete models that are not excluded, in name order
    pub fn discover_models(&self) -> Vec<String> {
        self.models
            .models()
            .filter(|m| !m.is_abstract)
            .filter(|m| !self.settings.excluded_apps.contains(&m.app_label))
            .filter(|m| !self.settings.excluded_models.contains(&m.name))
            .map(|m| m.name.clone())
            .collect()
    }

    /// Generate every type and root field without publishing anything
    pub fn plan(&self) -> Result<SchemaPlan, SchemaError> {
        let models = self.discover_models();
        let mut types = TypeGenerator::new(self.models.clone(), self.settings.types.clone())
            .with_filter_depth(self.settings.queries.max_filter_depth);
        let queries = self.query_generator();
        let mutations = self.mutation_generator();

        let mut query_fields = Vec::new();
        let mut mutation_fields = Vec::new();
        for model in &models {
            query_fields.extend(queries.generate_queries(&mut types, model)?);
            mutation_fields.extend(mutations.generate_mutations(&mut types, model)?);
        }
        close_over_references(&mut types)?;

        let health = self.settings.enable_health.then(|| {
            types.register_object(ObjectTypeDef {
                name: "Health".to_string(),
                model: None,
                description: Some("Schema status".to_string()),
                fields: ["status", "schema_version", "model_count"]
                    .into_iter()
                    .map(|key| {
                        let scalar = if key == "status" { "String" } else { "Int" };
                        ObjectField::new(key, TypeRef::named_nn(scalar), FieldSource::Key(key.to_string()))
                    })
                    .collect(),
            })
        });

        Ok(SchemaPlan {
            models,
            types: types.into_registry(),
            queries: query_fields,
            mutations: mutation_fields,
            health,
        })
    }

    /// Regenerate and publish the schema
    pub fn rebuild(&self) -> Result<Arc<BuiltSchema>, SchemaError> {
        let _guard = self.rebuild.lock().map_err(|_| SchemaError::Poisoned)?;
        self.build_and_publish()
    }

    /// Caller holds the rebuild lock
    fn build_and_publish(&self) -> Result<Arc<BuiltSchema>, SchemaError> {
        let plan = self.plan()?;
        let version = self.version.load(Ordering::SeqCst) + 1;

        let introspector = ModelIntrospector::new(self.models.clone());
        let metadata = plan
            .models
            .iter()
            .map(|m| introspector.introspect(m))
            .collect::<Result<Vec<_>, RegistryError>>()?;

        let runtime = Arc::new(dynamic::Runtime {
            store: self.store.clone(),
            introspector,
            queries: self.query_generator(),
            mutations: self.mutation_generator(),
            global_ids: self.global_ids.clone(),
            version,
            model_count: plan.models.len(),
        });
        let schema = dynamic::build(&plan, runtime, &self.extensions, &metadata)?;

        self.version.store(version, Ordering::SeqCst);
        info!(
            version,
            models = plan.models.len(),
            types = plan.types.len(),
            queries = plan.queries.len(),
            mutations = plan.mutations.len(),
            "schema rebuilt"
        );
        let built = Arc::new(BuiltSchema { schema, version, plan });
        self.current.store(Some(built.clone()));
        Ok(built)
    }

    /// Published schema, if any build has succeeded
    pub fn current(&self) -> Option<Arc<BuiltSchema>> {
        self.current.load_full()
    }

    /// Published schema, building it on first use
    pub fn schema(&self) -> Result<Arc<BuiltSchema>, SchemaError> {
        if let Some(built) = self.current() {
            return Ok(built);
        }
        let _guard = self.rebuild.lock().map_err(|_| SchemaError::Poisoned)?;
        // another caller may have published while we waited
        match self.current() {
            Some(built) => Ok(built),
            None => self.build_and_publish(),
        }
    }

    /// Number of successful rebuilds
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Rebuild in response to a lifecycle event; `false` when auto refresh is off
    pub fn handle_signal(&self, signal: &Signal) -> Result<bool, SchemaError> {
        if !self.settings.auto_refresh {
            debug!(?signal, "auto refresh disabled, ignoring signal");
            return Ok(false);
        }
        debug!(?signal, "rebuilding schema");
        self.rebuild()?;
        Ok(true)
    }

    fn query_generator(&self) -> QueryGenerator {
        let queries = QueryGenerator::new(self.models.clone(), self.settings.queries.clone())
            .with_optimizer(self.optimizer.clone())
            .with_global_id_codec(self.global_ids.clone());
        match &self.cache {
            Some(cache) => queries.with_cache(cache.clone()),
            None => queries,
        }
    }

    fn mutation_generator(&self) -> MutationGenerator {
        MutationGenerator::new(
            self.models.clone(),
            self.settings.mutations.clone(),
            self.settings.types.nested.clone(),
        )
        .with_global_id_codec(self.global_ids.clone())
    }
}

/// Generate object types for models that are only reached through relations
fn close_over_references(types: &mut TypeGenerator) -> Result<(), RegistryError> {
    loop {
        let missing: Vec<String> = types
            .registry()
            .objects()
            .flat_map(|object| object.fields.iter())
            .filter_map(|field| match &field.source {
                FieldSource::ToOne { target, .. } | FieldSource::ToMany { target, .. } => Some(target.clone()),
                FieldSource::Reverse { source_model, .. } => Some(source_model.clone()),
                _ => None,
            })
            .filter(|model| types.registry().get(&TypeKey::Object(model.clone())).is_none())
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        for model in missing {
            types.generate_object_type(&model)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::methods::RequestContext;
    use crate::model::{FieldDef, FieldKind, ModelDef};
    use crate::store::MemoryStore;
    use crate::test_fixtures::{blog_registry, seeded_store};
    use async_graphql::dynamic::{Field, FieldFuture, FieldValue};
    use serde_json::json;

    fn builder(settings: SchemaSettings) -> (SchemaBuilder, Arc<MemoryStore>) {
        let registry = Arc::new(blog_registry());
        let store = Arc::new(seeded_store(registry.clone()));
        (SchemaBuilder::new(registry, store.clone(), settings), store)
    }

    async fn execute(built: &BuiltSchema, query: &str) -> serde_json::Value {
        let response = built.schema.execute(query).await;
        assert!(response.errors.is_empty(), "{:?}", response.errors);
        response.data.into_json().unwrap()
    }

    #[test]
    fn test_discover_models_skips_abstract_and_excluded() {
        let registry = ModelRegistry::from_models([
            ModelDef::new("core", "Timestamped")
                .abstract_model()
                .field(FieldDef::new("created_at", FieldKind::DateTime).auto_now_add()),
            ModelDef::new("core", "Audit").field(FieldDef::primary("id")),
            ModelDef::new("blog", "Note").inherits("Timestamped").field(FieldDef::primary("id")),
            ModelDef::new("shop", "Order").field(FieldDef::primary("id")),
        ])
        .unwrap();
        let registry = Arc::new(registry);
        let store = Arc::new(MemoryStore::new(registry.clone()).unwrap());
        let mut settings = SchemaSettings::default();
        settings.excluded_apps.insert("shop".into());
        settings.excluded_models.insert("Audit".into());
        let builder = SchemaBuilder::new(registry, store, settings);
        assert_eq!(builder.discover_models(), vec!["Note"]);
    }

    #[test]
    fn test_excluded_target_still_gets_object_type() {
        let mut settings = SchemaSettings::default();
        settings.excluded_models.insert("Category".into());
        let (builder, _) = builder(settings);
        let plan = builder.plan().unwrap();
        assert!(!plan.models.contains(&"Category".to_string()));
        assert!(plan.types.get(&TypeKey::Object("Category".into())).is_some());
        assert!(plan.queries.iter().all(|q| q.model != "Category"));
    }

    #[test]
    fn test_rebuild_publishes_and_versions() {
        let (builder, _) = builder(SchemaSettings::default());
        assert!(builder.current().is_none());
        let first = builder.schema().unwrap();
        assert_eq!(first.version, 1);
        assert!(Arc::ptr_eq(&first, &builder.schema().unwrap()));

        assert!(builder.handle_signal(&Signal::MigrationApplied).unwrap());
        let second = builder.current().unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(builder.version(), 2);
        assert!(second.sdl().contains("type Post"));
    }

    #[test]
    fn test_concurrent_first_use_builds_once() {
        let (builder, _) = builder(SchemaSettings::default());
        let built: Vec<Arc<BuiltSchema>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4).map(|_| scope.spawn(|| builder.schema().unwrap())).collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(builder.version(), 1);
        assert!(built.iter().all(|b| Arc::ptr_eq(b, &built[0])));
    }

    #[tokio::test]
    async fn test_health_reports_the_version_it_was_built_as() {
        let (builder, _) = builder(SchemaSettings::default());
        let first = builder.schema().unwrap();
        builder.rebuild().unwrap();
        let data = execute(&first, "{ health { schema_version } }").await;
        assert_eq!(data, json!({ "health": { "schema_version": 1 } }));
        let data = execute(&builder.current().unwrap(), "{ health { schema_version } }").await;
        assert_eq!(data, json!({ "health": { "schema_version": 2 } }));
    }

    #[test]
    fn test_signals_ignored_without_auto_refresh() {
        let (builder, _) = builder(SchemaSettings {
            auto_refresh: false,
            ..Default::default()
        });
        let handled = builder
            .handle_signal(&Signal::InstanceSaved { model: "Post".into() })
            .unwrap();
        assert!(!handled);
        assert_eq!(builder.version(), 0);
    }

    #[test]
    fn test_sdl_shape() {
        let (builder, _) = builder(SchemaSettings::default());
        let sdl = builder.schema().unwrap().sdl();
        assert!(sdl.contains("input PostCreateInput"));
        assert!(sdl.contains("input CommentNestedCreateInput"));
        assert!(sdl.contains("input PostFilter"));
        assert!(sdl.contains("type CreatePostPayload"));
        assert!(sdl.contains("scalar DateTime"));
        assert!(sdl.contains("create_post(input: PostCreateInput!): CreatePostPayload!"));
    }

    #[tokio::test]
    async fn test_create_post_with_nested_comment_through_schema() {
        let (builder, store) = builder(SchemaSettings::default());
        let built = builder.schema().unwrap();
        let data = execute(
            &built,
            r#"mutation {
                create_post(input: { title: "Hello", category: "3", comments: [{ content: "first" }] }) {
                    ok
                    errors
                    object { title category { name } comments { content } }
                }
            }"#,
        )
        .await;
        assert_eq!(
            data,
            json!({
                "create_post": {
                    "ok": true,
                    "errors": [],
                    "object": {
                        "title": "Hello",
                        "category": { "name": "Art" },
                        "comments": [{ "content": "first" }]
                    }
                }
            })
        );
        assert_eq!(store.row_count("Comment").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_mutation_reports_errors() {
        let (builder, store) = builder(SchemaSettings::default());
        let built = builder.schema().unwrap();
        let data = execute(
            &built,
            r#"mutation {
                create_post(input: { title: "Hello", category: "999", comments: [{ content: "first" }] }) {
                    ok
                    errors
                    object { id }
                }
            }"#,
        )
        .await;
        assert_eq!(
            data,
            json!({
                "create_post": {
                    "ok": false,
                    "errors": ["Category with id 999 does not exist"],
                    "object": null
                }
            })
        );
        assert_eq!(store.row_count("Post").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_queries_through_schema() {
        let (builder, _) = builder(SchemaSettings::default());
        let built = builder.schema().unwrap();
        let data = execute(
            &built,
            r#"{
                categories(filter: { name__icontains: "t" }, order_by: ["name"]) { name }
                categories_pages(page: 1, page_size: 2, order_by: ["-name"]) {
                    items { name }
                    page_info { total_count total_pages has_next_page has_previous_page }
                }
                tag(id: "2") { name }
                health { status schema_version model_count }
            }"#,
        )
        .await;
        assert_eq!(
            data,
            json!({
                "categories": [{ "name": "Art" }, { "name": "Tech" }],
                "categories_pages": {
                    "items": [{ "name": "Tech" }, { "name": "Science" }],
                    "page_info": {
                        "total_count": 3,
                        "total_pages": 2,
                        "has_next_page": true,
                        "has_previous_page": false
                    }
                },
                "tag": { "name": "graphql" },
                "health": { "status": "ok", "schema_version": 1, "model_count": 4 }
            })
        );
    }

    #[tokio::test]
    async fn test_method_mutation_uses_request_context() {
        let (builder, _) = builder(SchemaSettings::default());
        let built = builder.schema().unwrap();
        execute(&built, r#"mutation { create_post(input: { title: "T", category: "1" }) { ok } }"#).await;

        let query = r#"mutation { post_publish(id: "1") { ok errors object { published } } }"#;
        let data = execute(&built, query).await;
        assert_eq!(data["post_publish"]["ok"], json!(false));

        let request = async_graphql::Request::new(query)
            .data(RequestContext::user("ana").with_permission("blog.change_post"));
        let response = built.schema.execute(request).await;
        assert!(response.errors.is_empty(), "{:?}", response.errors);
        assert_eq!(
            response.data.into_json().unwrap(),
            json!({ "post_publish": { "ok": true, "errors": [], "object": { "published": true } } })
        );
    }

    struct Whoami;

    impl SchemaExtension for Whoami {
        fn name(&self) -> &str {
            "whoami"
        }

        fn query_fields(&self, _models: &[ModelMetadata]) -> Vec<Field> {
            vec![Field::new(
                "whoami",
                async_graphql::dynamic::TypeRef::named_nn(async_graphql::dynamic::TypeRef::STRING),
                |ctx| {
                    FieldFuture::new(async move {
                        let user = ctx
                            .data_opt::<RequestContext>()
                            .and_then(|c| c.user.clone())
                            .unwrap_or_else(|| "anonymous".to_string());
                        Ok(Some(FieldValue::value(user)))
                    })
                },
            )]
        }
    }

    #[tokio::test]
    async fn test_extension_fields_are_merged() {
        let registry = Arc::new(blog_registry());
        let store = Arc::new(seeded_store(registry.clone()));
        let builder = SchemaBuilder::new(registry, store, SchemaSettings::default()).with_extension(Arc::new(Whoami));
        let built = builder.schema().unwrap();
        let data = execute(&built, "{ whoami }").await;
        assert_eq!(data, json!({ "whoami": "anonymous" }));
    }
}

//! Root query fields
//!
//! Each model gets three fields:
//! - `post(id: ID!)` a single row by raw key or global id
//! - `posts(filter, order_by, offset, limit)` a filtered list
//! - `posts_pages(filter, order_by, page, page_size)` a page with counts

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use heck::ToSnakeCase;
use serde_json::Value;
use tracing::debug;

use crate::error::RegistryError;
use crate::filters::{self, FilterError};
use crate::global_id::{GlobalIdCodec, RelayGlobalId};
use crate::introspector::{ModelIntrospector, ModelMetadata};
use crate::model::{ModelRegistry, Record};
use crate::settings::QuerySettings;
use crate::store::{FilterExpr, OrderBy, Pk, QueryPlan, Store, StoreError};
use crate::types::{ArgDef, FieldSource, ObjectField, ObjectTypeDef, TypeGenerator, TypeRef};

/// Error raised while resolving a query field
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Adjusts a plan to the selection a client asked for
pub trait QueryOptimizer: Send + Sync {
    fn optimize(&self, meta: &ModelMetadata, plan: QueryPlan, selection: &[String]) -> QueryPlan;
}

/// Marks selected to-one relations for joining and to-many ones for prefetching
#[derive(Debug, Clone, Copy, Default)]
pub struct RelationOptimizer;

impl QueryOptimizer for RelationOptimizer {
    fn optimize(&self, meta: &ModelMetadata, mut plan: QueryPlan, selection: &[String]) -> QueryPlan {
        for name in selection {
            let bucket = match meta.relationship(name) {
                Some(rel) if rel.relationship_type.is_to_one() => &mut plan.select_related,
                Some(_) => &mut plan.prefetch_related,
                None if meta.reverse_relation(name).is_some() => &mut plan.prefetch_related,
                None => continue,
            };
            if !bucket.contains(name) {
                bucket.push(name.clone());
            }
        }
        plan
    }
}

/// Result cache consulted by list fields
pub trait CacheManager: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;

    fn set(&self, key: &str, value: Value, timeout: Duration);
}

/// In-process cache with per-entry expiry
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, (Instant, Value)>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl CacheManager for MemoryCache {
    fn get(&self, key: &str) -> Option<Value> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.0 > Instant::now() => return Some(entry.1.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    fn set(&self, key: &str, value: Value, timeout: Duration) {
        self.entries.insert(key.to_string(), (Instant::now() + timeout, value));
    }
}

/// What a generated query field returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryAction {
    Single,
    List,
    Pages,
}

/// Root query field description
#[derive(Debug, Clone)]
pub struct QueryFieldDef {
    pub name: String,
    pub model: String,
    pub action: QueryAction,
    pub args: Vec<ArgDef>,
    pub ty: TypeRef,
    pub description: Option<String>,
}

/// Arguments of a list field
#[derive(Debug, Clone, Default)]
pub struct ListArgs {
    pub filter: Option<Record>,
    pub order_by: Vec<String>,
    pub offset: Option<i64>,
    pub limit: Option<i64>,
}

/// Arguments of a paginated field
#[derive(Debug, Clone, Default)]
pub struct PageArgs {
    pub filter: Option<Record>,
    pub order_by: Vec<String>,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageInfo {
    pub total_count: usize,
    pub page: usize,
    pub page_size: usize,
    pub total_pages: usize,
    pub has_next_page: bool,
    pub has_previous_page: bool,
}

impl PageInfo {
    fn new(total_count: usize, page: usize, page_size: usize) -> Self {
        let total_pages = total_count.div_ceil(page_size);
        Self {
            total_count,
            page,
            page_size,
            total_pages,
            has_next_page: page < total_pages,
            has_previous_page: page > 1,
        }
    }

    /// Field map read by the `PageInfo` object type
    pub fn to_record(&self) -> Record {
        let mut record = Record::new();
        record.insert("total_count".into(), Value::from(self.total_count));
        record.insert("page".into(), Value::from(self.page));
        record.insert("page_size".into(), Value::from(self.page_size));
        record.insert("total_pages".into(), Value::from(self.total_pages));
        record.insert("has_next_page".into(), Value::Bool(self.has_next_page));
        record.insert("has_previous_page".into(), Value::Bool(self.has_previous_page));
        record
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub items: Vec<Record>,
    pub info: PageInfo,
}

/// English plural of a snake_case model name
pub fn pluralize(name: &str) -> String {
    if let Some(stem) = name.strip_suffix('y') {
        if !stem.ends_with(['a', 'e', 'i', 'o', 'u']) {
            return format!("{stem}ies");
        }
    }
    if name.ends_with(['s', 'x', 'z']) || name.ends_with("ch") || name.ends_with("sh") {
        return format!("{name}es");
    }
    format!("{name}s")
}

/// Builds and resolves the query fields of a model
pub struct QueryGenerator {
    introspector: ModelIntrospector,
    settings: QuerySettings,
    optimizer: Arc<dyn QueryOptimizer>,
    cache: Option<Arc<dyn CacheManager>>,
    global_ids: Arc<dyn GlobalIdCodec>,
}

impl QueryGenerator {
    pub fn new(models: Arc<ModelRegistry>, settings: QuerySettings) -> Self {
        Self {
            introspector: ModelIntrospector::new(models),
            settings,
            optimizer: Arc::new(RelationOptimizer),
            cache: None,
            global_ids: Arc::new(RelayGlobalId),
        }
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

    pub fn settings(&self) -> &QuerySettings {
        &self.settings
    }

    pub fn global_ids(&self) -> &Arc<dyn GlobalIdCodec> {
        &self.global_ids
    }

    /// Root query fields for a model, registering the types they return
    pub fn generate_queries(&self, types: &mut TypeGenerator, model: &str) -> Result<Vec<QueryFieldDef>, RegistryError> {
        let meta = self.introspector.introspect(model)?;
        let object = types.generate_object_type(model)?;
        let filter = types.generate_filter_type(model)?;
        let snake = meta.name.to_snake_case();
        let plural = pluralize(&snake);

        let order_by = ArgDef::new("order_by", TypeRef::named_nn_list("String"));
        let mut fields = vec![
            QueryFieldDef {
                name: snake.clone(),
                model: meta.name.clone(),
                action: QueryAction::Single,
                args: vec![ArgDef::new("id", TypeRef::named_nn("ID"))],
                ty: TypeRef::named(&object.name),
                description: Some(format!("Fetch a single {} by id", meta.name)),
            },
            QueryFieldDef {
                name: plural.clone(),
                model: meta.name.clone(),
                action: QueryAction::List,
                args: vec![
                    ArgDef::new("filter", TypeRef::named(&filter.name)),
                    order_by.clone(),
                    ArgDef::new("offset", TypeRef::named("Int")),
                    ArgDef::new("limit", TypeRef::named("Int")),
                ],
                ty: TypeRef::named_nn_list_nn(&object.name),
                description: Some(format!("List {} rows", meta.name)),
            },
        ];

        if self.settings.enable_pagination {
            let page_info = types.register_object(ObjectTypeDef {
                name: "PageInfo".to_string(),
                model: None,
                description: Some("Offset pagination state".to_string()),
                fields: vec![
                    key_field("total_count", "Int"),
                    key_field("page", "Int"),
                    key_field("page_size", "Int"),
                    key_field("total_pages", "Int"),
                    key_field("has_next_page", "Boolean"),
                    key_field("has_previous_page", "Boolean"),
                ],
            });
            let page = types.register_object(ObjectTypeDef {
                name: format!("{}Page", object.name),
                model: Some(meta.name.clone()),
                description: None,
                fields: vec![
                    ObjectField::new("items", TypeRef::named_nn_list_nn(&object.name), FieldSource::PageItems),
                    ObjectField::new("page_info", TypeRef::named_nn(&page_info.name), FieldSource::PageInfo),
                ],
            });
            fields.push(QueryFieldDef {
                name: format!("{plural}_pages"),
                model: meta.name.clone(),
                action: QueryAction::Pages,
                args: vec![
                    ArgDef::new("filter", TypeRef::named(&filter.name)),
                    order_by,
                    ArgDef::new("page", TypeRef::named("Int")).with_default(Value::from(1)),
                    ArgDef::new("page_size", TypeRef::named("Int")),
                ],
                ty: TypeRef::named_nn(&page.name),
                description: Some(format!("Page through {} rows", meta.name)),
            });
        }
        Ok(fields)
    }

    /// Row named by a raw key, or by a global id of this model
    pub fn resolve_single(&self, store: &dyn Store, model: &str, id: &Value) -> Result<Option<Record>, QueryError> {
        let mut tx = store.begin()?;
        if let Some(pk) = Pk::from_value(id) {
            if let Some(row) = tx.get(model, &pk)? {
                return Ok(Some(row));
            }
        }
        match id.as_str().and_then(|raw| self.global_ids.decode(raw)) {
            Some((type_name, pk)) if type_name == model => Ok(tx.get(model, &pk)?),
            _ => Ok(None),
        }
    }

    pub fn resolve_list(&self, store: &dyn Store, model: &str, args: &ListArgs, selection: &[String]) -> Result<Vec<Record>, QueryError> {
        let offset = args.offset.unwrap_or(0).max(0) as usize;
        let limit = args.limit.map(|limit| limit.clamp(0, self.settings.max_page_size as i64) as usize);
        let plan = self
            .plan(model, args.filter.as_ref(), &args.order_by, selection)?
            .slice(offset, limit);

        let cache = self.cache.as_ref().zip(self.settings.cache_timeout);
        let key = format!("list:{}", plan.cache_key());
        if let Some((cache, _)) = cache {
            if let Some(Value::Array(items)) = cache.get(&key) {
                debug!(model, "list served from cache");
                return Ok(items.into_iter().filter_map(|v| v.as_object().cloned()).collect());
            }
        }

        let rows = store.begin()?.query(&plan)?;
        if let Some((cache, seconds)) = cache {
            let value = Value::Array(rows.iter().cloned().map(Value::Object).collect());
            cache.set(&key, value, Duration::from_secs(seconds));
        }
        Ok(rows)
    }

    pub fn resolve_page(&self, store: &dyn Store, model: &str, args: &PageArgs, selection: &[String]) -> Result<Page, QueryError> {
        let page = args.page.unwrap_or(1).max(1) as usize;
        let page_size = self.settings.clamp_page_size(args.page_size);
        let plan = self.plan(model, args.filter.as_ref(), &args.order_by, selection)?;

        let mut tx = store.begin()?;
        let total = tx.count(model, &plan.filter)?;
        let plan = plan.slice((page - 1) * page_size, Some(page_size));
        let items = tx.query(&plan)?;
        Ok(Page {
            items,
            info: PageInfo::new(total, page, page_size),
        })
    }

    fn plan(&self, model: &str, filter: Option<&Record>, order_by: &[String], selection: &[String]) -> Result<QueryPlan, QueryError> {
        let meta = self.introspector.introspect(model)?;
        let filter = match filter {
            Some(input) => filters::parse_filter(input)?,
            None => FilterExpr::All,
        };
        let plan = QueryPlan::new(model)
            .filter(filter)
            .order_by(order_by.iter().map(|key| OrderBy::parse(key)).collect());
        Ok(self.optimizer.optimize(&meta, plan, selection))
    }
}

fn key_field(name: &str, scalar: &str) -> ObjectField {
    ObjectField::new(name, TypeRef::named_nn(scalar), FieldSource::Key(name.to_string()))
}

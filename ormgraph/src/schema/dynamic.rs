//! Runtime GraphQL types
//!
//! Turns a [`SchemaPlan`] into `async_graphql::dynamic` objects and inputs.
//! Resolvers pass [`Node`] values down to the fields of their object type;
//! each field reads its value according to its [`FieldSource`].

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use async_graphql::dynamic::{
    Field, FieldFuture, FieldValue, InputObject, InputValue, Object, ResolverContext, Scalar, Schema,
};
use async_graphql::{Error, Value as GqlValue};
use serde_json::Value;
use tracing::debug;

use super::{SchemaExtension, SchemaPlan};
use crate::error::SchemaError;
use crate::global_id::GlobalIdCodec;
use crate::introspector::{ModelIntrospector, ModelMetadata};
use crate::methods::RequestContext;
use crate::model::Record;
use crate::mutations::{MutationAction, MutationFieldDef, MutationGenerator, MutationResult};
use crate::queries::{ListArgs, Page, PageArgs, QueryAction, QueryFieldDef, QueryGenerator};
use crate::store::{FilterExpr, Pk, QueryPlan, Store};
use crate::types::{ArgDef, FieldSource, GeneratedType, InputTypeDef, ObjectTypeDef, TypeRef};

const BUILTIN_SCALARS: [&str; 5] = ["ID", "String", "Int", "Float", "Boolean"];

/// Collaborators shared by every resolver of one build
pub(crate) struct Runtime {
    pub store: Arc<dyn Store>,
    pub introspector: ModelIntrospector,
    pub queries: QueryGenerator,
    pub mutations: MutationGenerator,
    pub global_ids: Arc<dyn GlobalIdCodec>,
    /// Version this schema is published as
    pub version: u64,
    pub model_count: usize,
}

/// Parent value handed to object fields
enum Node {
    Row { model: String, record: Record },
    Page { model: String, page: Page },
    Payload { model: String, result: MutationResult },
    Map(Record),
}

type Resolved = Result<Option<FieldValue<'static>>, Error>;

pub(crate) fn build(
    plan: &SchemaPlan,
    runtime: Arc<Runtime>,
    extensions: &[Arc<dyn SchemaExtension>],
    metadata: &[ModelMetadata],
) -> Result<Schema, SchemaError> {
    let mut query = Object::new("Query");
    for def in &plan.queries {
        query = query.field(query_field(def, runtime.clone())?);
    }
    if let Some(health) = &plan.health {
        query = query.field(health_field(&health.name, runtime.clone()));
    }

    let mut mutation = Object::new("Mutation");
    let mut has_mutations = false;
    for def in &plan.mutations {
        mutation = mutation.field(mutation_field(def, runtime.clone())?);
        has_mutations = true;
    }

    let mut extra_types = Vec::new();
    for extension in extensions {
        for field in extension.query_fields(metadata) {
            query = query.field(field);
        }
        for field in extension.mutation_fields(metadata) {
            mutation = mutation.field(field);
            has_mutations = true;
        }
        extra_types.extend(extension.types());
        debug!(extension = extension.name(), "merged schema extension");
    }

    let mut builder = Schema::build("Query", has_mutations.then_some("Mutation"), None).register(query);
    if has_mutations {
        builder = builder.register(mutation);
    }

    let mut declared = HashSet::new();
    for ty in plan.types.iter() {
        builder = match ty {
            GeneratedType::Object(def) => builder.register(object_type(def, &runtime)),
            GeneratedType::Input(def) => builder.register(input_type(def)),
        };
        declared.insert(ty.name().to_string());
    }
    for name in referenced_scalars(plan, &declared) {
        builder = builder.register(Scalar::new(name));
    }
    for ty in extra_types {
        builder = builder.register(ty);
    }
    builder.finish().map_err(|err| SchemaError::Build(err.to_string()))
}

/// Non-builtin scalar names used anywhere in the plan
fn referenced_scalars(plan: &SchemaPlan, declared: &HashSet<String>) -> BTreeSet<String> {
    let mut refs: Vec<&TypeRef> = Vec::new();
    for ty in plan.types.iter() {
        match ty {
            GeneratedType::Object(def) => refs.extend(def.fields.iter().map(|f| &f.ty)),
            GeneratedType::Input(def) => refs.extend(def.fields.iter().map(|f| &f.ty)),
        }
    }
    refs.extend(plan.queries.iter().flat_map(|q| q.args.iter().map(|a| &a.ty)));
    refs.extend(plan.mutations.iter().flat_map(|m| m.args.iter().map(|a| &a.ty)));
    refs.into_iter()
        .map(TypeRef::base_name)
        .filter(|name| !BUILTIN_SCALARS.contains(name) && !declared.contains(*name))
        .map(str::to_string)
        .collect()
}

fn with_args(mut field: Field, args: &[ArgDef]) -> Result<Field, SchemaError> {
    for arg in args {
        let mut value = InputValue::new(arg.name.clone(), arg.ty.to_dynamic());
        if let Some(default) = &arg.default {
            let default = GqlValue::from_json(default.clone()).map_err(|err| SchemaError::Build(err.to_string()))?;
            value = value.default_value(default);
        }
        field = field.argument(value);
    }
    Ok(field)
}

fn object_type(def: &ObjectTypeDef, runtime: &Arc<Runtime>) -> Object {
    let mut object = Object::new(def.name.clone());
    if let Some(description) = &def.description {
        object = object.description(description.clone());
    }
    for field in &def.fields {
        let source = field.source.clone();
        let runtime = runtime.clone();
        let mut resolver = Field::new(field.name.clone(), field.ty.to_dynamic(), move |ctx| {
            let source = source.clone();
            let runtime = runtime.clone();
            FieldFuture::new(async move { resolve_source(&runtime, &source, ctx.parent_value) })
        });
        if let Some(description) = &field.description {
            resolver = resolver.description(description.clone());
        }
        object = object.field(resolver);
    }
    object
}

fn input_type(def: &InputTypeDef) -> InputObject {
    let mut input = InputObject::new(def.name.clone());
    if let Some(description) = &def.description {
        input = input.description(description.clone());
    }
    for field in &def.fields {
        let mut value = InputValue::new(field.name.clone(), field.ty.to_dynamic());
        if let Some(description) = &field.description {
            value = value.description(description.clone());
        }
        input = input.field(value);
    }
    input
}

fn query_field(def: &QueryFieldDef, runtime: Arc<Runtime>) -> Result<Field, SchemaError> {
    let model = def.model.clone();
    let action = def.action;
    let mut field = Field::new(def.name.clone(), def.ty.to_dynamic(), move |ctx| {
        let runtime = runtime.clone();
        let model = model.clone();
        FieldFuture::new(async move {
            let store = runtime.store.as_ref();
            match action {
                QueryAction::Single => {
                    let id = required_arg(&ctx, "id")?;
                    let row = runtime.queries.resolve_single(store, &model, &id)?;
                    Ok(row.map(|record| row_value(&model, record)))
                }
                QueryAction::List => {
                    let args = ListArgs {
                        filter: record_arg(&ctx, "filter")?,
                        order_by: string_list_arg(&ctx, "order_by")?,
                        offset: int_arg(&ctx, "offset")?,
                        limit: int_arg(&ctx, "limit")?,
                    };
                    let rows = runtime.queries.resolve_list(store, &model, &args, &selection(&ctx, None))?;
                    Ok(Some(rows_value(&model, rows)))
                }
                QueryAction::Pages => {
                    let args = PageArgs {
                        filter: record_arg(&ctx, "filter")?,
                        order_by: string_list_arg(&ctx, "order_by")?,
                        page: int_arg(&ctx, "page")?,
                        page_size: int_arg(&ctx, "page_size")?,
                    };
                    let page = runtime
                        .queries
                        .resolve_page(store, &model, &args, &selection(&ctx, Some("items")))?;
                    Ok(Some(FieldValue::owned_any(Node::Page { model, page })))
                }
            }
        })
    });
    if let Some(description) = &def.description {
        field = field.description(description.clone());
    }
    with_args(field, &def.args)
}

fn mutation_field(def: &MutationFieldDef, runtime: Arc<Runtime>) -> Result<Field, SchemaError> {
    let model = def.model.clone();
    let action = def.action.clone();
    let mut field = Field::new(def.name.clone(), TypeRef::named_nn(&def.payload).to_dynamic(), move |ctx| {
        let runtime = runtime.clone();
        let model = model.clone();
        let action = action.clone();
        FieldFuture::new(async move {
            let store = runtime.store.as_ref();
            let mutations = &runtime.mutations;
            let result = match &action {
                MutationAction::Create => mutations.create(store, &model, required_record(&ctx, "input")?),
                MutationAction::Update => mutations.update(store, &model, required_record(&ctx, "input")?),
                MutationAction::Delete => mutations.delete(store, &model, &required_arg(&ctx, "id")?),
                MutationAction::BulkCreate => mutations.bulk_create(store, &model, record_list_arg(&ctx, "inputs")?),
                MutationAction::BulkUpdate => mutations.bulk_update(store, &model, record_list_arg(&ctx, "inputs")?),
                MutationAction::BulkDelete => {
                    let ids = match json_arg(&ctx, "ids")? {
                        Some(Value::Array(ids)) => ids,
                        _ => Vec::new(),
                    };
                    mutations.bulk_delete(store, &model, &ids)
                }
                MutationAction::Method(method) => {
                    let id = required_arg(&ctx, "id")?;
                    let mut args = Record::new();
                    for (name, value) in ctx.args.iter() {
                        if name.as_str() != "id" {
                            args.insert(name.to_string(), value.as_value().clone().into_json()?);
                        }
                    }
                    let request = ctx.data_opt::<RequestContext>().cloned().unwrap_or_default();
                    mutations.execute_method(store, &request, &model, method, &id, args)
                }
            };
            Ok(Some(FieldValue::owned_any(Node::Payload { model, result })))
        })
    });
    if let Some(description) = &def.description {
        field = field.description(description.clone());
    }
    with_args(field, &def.args)
}

fn health_field(type_name: &str, runtime: Arc<Runtime>) -> Field {
    Field::new("health", TypeRef::named_nn(type_name).to_dynamic(), move |_ctx| {
        let runtime = runtime.clone();
        FieldFuture::new(async move {
            let mut record = Record::new();
            record.insert("status".into(), Value::from("ok"));
            record.insert("schema_version".into(), Value::from(runtime.version));
            record.insert("model_count".into(), Value::from(runtime.model_count));
            Ok(Some(FieldValue::owned_any(Node::Map(record))))
        })
    })
}

fn resolve_source(runtime: &Runtime, source: &FieldSource, parent: &FieldValue<'_>) -> Resolved {
    let node = parent.try_downcast_ref::<Node>()?;
    match (source, node) {
        (FieldSource::Column { key, id }, Node::Row { record, .. }) => match record.get(key) {
            Some(Value::Number(n)) if *id => Ok(Some(FieldValue::value(n.to_string()))),
            value => json_value(value.cloned().unwrap_or(Value::Null)),
        },
        (FieldSource::GlobalId, Node::Row { model, record }) => {
            let pk = row_pk(runtime, model, record)?;
            Ok(Some(FieldValue::value(runtime.global_ids.encode(model, &pk))))
        }
        (FieldSource::ToOne { column, target }, Node::Row { record, .. }) => {
            let Some(pk) = record.get(column).and_then(Pk::from_value) else {
                return Ok(None);
            };
            let row = runtime.store.begin()?.get(target, &pk)?;
            Ok(row.map(|record| row_value(target, record)))
        }
        (FieldSource::ToMany { field, target }, Node::Row { model, record }) => {
            let pk = row_pk(runtime, model, record)?;
            let mut tx = runtime.store.begin()?;
            let mut rows = Vec::new();
            for key in tx.related(model, &pk, field)? {
                if let Some(row) = tx.get(target, &key)? {
                    rows.push(row);
                }
            }
            Ok(Some(rows_value(target, rows)))
        }
        (
            FieldSource::Reverse {
                source_model,
                field,
                single,
            },
            Node::Row { model, record },
        ) => {
            let pk = row_pk(runtime, model, record)?;
            let plan = QueryPlan::new(source_model.clone()).filter(FilterExpr::eq(field.clone(), pk.to_value()));
            let rows = runtime.store.begin()?.query(&plan)?;
            if *single {
                Ok(rows.into_iter().next().map(|row| row_value(source_model, row)))
            } else {
                Ok(Some(rows_value(source_model, rows)))
            }
        }
        (FieldSource::Property { name }, Node::Row { model, record }) => {
            let meta = runtime.introspector.introspect(model)?;
            match meta.properties.get(name).and_then(|p| p.getter.as_ref()) {
                Some(getter) => json_value((getter.0)(record)),
                None => Ok(None),
            }
        }
        (FieldSource::Key(key), Node::Map(map)) => json_value(map.get(key).cloned().unwrap_or(Value::Null)),
        (FieldSource::PageItems, Node::Page { model, page }) => Ok(Some(rows_value(model, page.items.clone()))),
        (FieldSource::PageInfo, Node::Page { page, .. }) => {
            Ok(Some(FieldValue::owned_any(Node::Map(page.info.to_record()))))
        }
        (FieldSource::PayloadOk, Node::Payload { result, .. }) => Ok(Some(FieldValue::value(result.ok))),
        (FieldSource::PayloadErrors, Node::Payload { result, .. }) => Ok(Some(FieldValue::list(
            result.errors.iter().map(|e| FieldValue::value(e.clone())),
        ))),
        (FieldSource::PayloadObject, Node::Payload { model, result }) => {
            Ok(result.object.clone().map(|record| row_value(model, record)))
        }
        (FieldSource::PayloadObjects, Node::Payload { model, result }) => {
            Ok(Some(rows_value(model, result.objects.clone())))
        }
        (FieldSource::PayloadResult, Node::Payload { result, .. }) => match &result.result {
            Some(value) => json_value(value.clone()),
            None => Ok(None),
        },
        _ => Err(Error::new("field does not match its parent value")),
    }
}

fn row_value(model: &str, record: Record) -> FieldValue<'static> {
    FieldValue::owned_any(Node::Row {
        model: model.to_string(),
        record,
    })
}

fn rows_value(model: &str, rows: Vec<Record>) -> FieldValue<'static> {
    FieldValue::list(rows.into_iter().map(|record| row_value(model, record)))
}

fn json_value(value: Value) -> Resolved {
    if value.is_null() {
        return Ok(None);
    }
    Ok(Some(FieldValue::value(GqlValue::from_json(value)?)))
}

fn row_pk(runtime: &Runtime, model: &str, record: &Record) -> Result<Pk, Error> {
    let meta = runtime.introspector.introspect(model)?;
    record
        .get(&meta.primary_key)
        .and_then(Pk::from_value)
        .ok_or_else(|| Error::new(format!("{model} row has no primary key")))
}

/// Names selected under the current field, or under one of its children
fn selection(ctx: &ResolverContext<'_>, child: Option<&str>) -> Vec<String> {
    let field = ctx.ctx.field();
    match child {
        None => field.selection_set().map(|f| f.name().to_string()).collect(),
        Some(child) => field
            .selection_set()
            .filter(|f| f.name() == child)
            .flat_map(|f| f.selection_set().map(|g| g.name().to_string()).collect::<Vec<_>>())
            .collect(),
    }
}

fn json_arg(ctx: &ResolverContext<'_>, name: &str) -> Result<Option<Value>, Error> {
    match ctx.args.get(name) {
        Some(accessor) => {
            let value = accessor.as_value().clone().into_json()?;
            Ok((!value.is_null()).then_some(value))
        }
        None => Ok(None),
    }
}

fn required_arg(ctx: &ResolverContext<'_>, name: &str) -> Result<Value, Error> {
    json_arg(ctx, name)?.ok_or_else(|| Error::new(format!("missing argument '{name}'")))
}

fn record_arg(ctx: &ResolverContext<'_>, name: &str) -> Result<Option<Record>, Error> {
    match json_arg(ctx, name)? {
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(_) => Err(Error::new(format!("argument '{name}' must be an object"))),
        None => Ok(None),
    }
}

fn required_record(ctx: &ResolverContext<'_>, name: &str) -> Result<Record, Error> {
    record_arg(ctx, name)?.ok_or_else(|| Error::new(format!("missing argument '{name}'")))
}

fn record_list_arg(ctx: &ResolverContext<'_>, name: &str) -> Result<Vec<Record>, Error> {
    match json_arg(ctx, name)? {
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(map) => Ok(map),
                _ => Err(Error::new(format!("argument '{name}' must be a list of objects"))),
            })
            .collect(),
        Some(_) => Err(Error::new(format!("argument '{name}' must be a list"))),
        None => Ok(Vec::new()),
    }
}

fn string_list_arg(ctx: &ResolverContext<'_>, name: &str) -> Result<Vec<String>, Error> {
    Ok(match json_arg(ctx, name)? {
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).map(str::to_string).collect(),
        Some(Value::String(single)) => vec![single],
        _ => Vec::new(),
    })
}

fn int_arg(ctx: &ResolverContext<'_>, name: &str) -> Result<Option<i64>, Error> {
    Ok(json_arg(ctx, name)?.and_then(|value| value.as_i64()))
}

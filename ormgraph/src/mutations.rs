//! Mutation generation and execution
//!
//! Every generated mutation answers with the same payload shape:
//!
//! ```graphql
//! type CreatePostPayload {
//!   ok: Boolean!
//!   object: Post
//!   errors: [String!]!
//! }
//! ```
//!
//! Bulk payloads carry `objects` instead of `object`, method payloads add a
//! `result`. Errors never escape a mutation: whatever goes wrong inside the
//! transaction rolls it back and is reported through `errors`.

use std::sync::Arc;

use heck::ToSnakeCase;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::RegistryError;
use crate::global_id::{GlobalIdCodec, RelayGlobalId};
use crate::introspector::{ModelIntrospector, ModelMetadata};
use crate::methods::{self, MethodOutput, RequestContext};
use crate::model::{ModelRegistry, Record};
use crate::nested::{NestedError, NestedOperationHandler};
use crate::settings::{MutationGeneratorSettings, NestedRelationsPolicy};
use crate::store::{Pk, Store, StoreError, Transaction};
use crate::types::{ArgDef, FieldSource, MutationKind, ObjectField, ObjectTypeDef, TypeGenerator, TypeRef};

static UNIQUE_VIOLATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"UNIQUE constraint failed: (?:\w+\.)?(?P<col>\w+)|Key \((?P<key>\w+)\)=")
        .unwrap_or_else(|err| panic!("invalid unique violation pattern: {err}"))
});

/// Outcome of a mutation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MutationResult {
    pub ok: bool,
    pub object: Option<Record>,
    pub objects: Vec<Record>,
    pub errors: Vec<String>,
    /// Value returned by a method mutation
    pub result: Option<Value>,
}

impl MutationResult {
    pub fn success(object: Record) -> Self {
        Self {
            ok: true,
            object: Some(object),
            ..Default::default()
        }
    }

    pub fn success_many(objects: Vec<Record>) -> Self {
        Self {
            ok: true,
            objects,
            ..Default::default()
        }
    }

    pub fn failure(errors: Vec<String>) -> Self {
        Self {
            ok: false,
            errors,
            ..Default::default()
        }
    }
}

/// What a generated mutation field does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationAction {
    Create,
    Update,
    Delete,
    BulkCreate,
    BulkUpdate,
    BulkDelete,
    Method(String),
}

impl MutationAction {
    fn verb(&self) -> &str {
        match self {
            MutationAction::Create | MutationAction::BulkCreate => "create",
            MutationAction::Update | MutationAction::BulkUpdate => "update",
            MutationAction::Delete | MutationAction::BulkDelete => "delete",
            MutationAction::Method(name) => name,
        }
    }
}

/// Root mutation field description
#[derive(Debug, Clone)]
pub struct MutationFieldDef {
    pub name: String,
    pub model: String,
    pub action: MutationAction,
    pub args: Vec<ArgDef>,
    pub payload: String,
    pub description: Option<String>,
}

/// Builds and runs the create, update, delete, bulk and method mutations of a model
pub struct MutationGenerator {
    introspector: ModelIntrospector,
    settings: MutationGeneratorSettings,
    handler: NestedOperationHandler,
    global_ids: Arc<dyn GlobalIdCodec>,
}

impl MutationGenerator {
    pub fn new(models: Arc<ModelRegistry>, settings: MutationGeneratorSettings, policy: NestedRelationsPolicy) -> Self {
        Self {
            introspector: ModelIntrospector::new(models.clone()),
            settings,
            handler: NestedOperationHandler::new(models, policy),
            global_ids: Arc::new(RelayGlobalId),
        }
    }

    pub fn with_global_id_codec(mut self, codec: Arc<dyn GlobalIdCodec>) -> Self {
        self.global_ids = codec;
        self
    }

    /// Nested write handler, for extension layers that run their own writes
    pub fn nested_handler(&self) -> &NestedOperationHandler {
        &self.handler
    }

    pub fn settings(&self) -> &MutationGeneratorSettings {
        &self.settings
    }

    /// Root mutation fields for a model, registering their payload and input types
    pub fn generate_mutations(&self, types: &mut TypeGenerator, model: &str) -> Result<Vec<MutationFieldDef>, RegistryError> {
        let meta = self.introspector.introspect(model)?;
        let object = types.generate_object_type(model)?;
        let snake = meta.name.to_snake_case();
        let mut fields = Vec::new();

        let single = |types: &mut TypeGenerator, prefix: &str| {
            payload_type(types, &format!("{prefix}{}Payload", meta.name), &object.name, false, false)
        };

        if self.settings.enable_create {
            let input = types.generate_input_type(model, false, MutationKind::Create, true)?;
            let payload = single(types, "Create");
            fields.push(MutationFieldDef {
                name: format!("create_{snake}"),
                model: meta.name.clone(),
                action: MutationAction::Create,
                args: vec![ArgDef::new("input", TypeRef::named_nn(&input.name))],
                payload,
                description: Some(format!("Create a {}", meta.name)),
            });
        }
        if self.settings.enable_update {
            let input = types.generate_input_type(model, true, MutationKind::Update, false)?;
            let payload = single(types, "Update");
            fields.push(MutationFieldDef {
                name: format!("update_{snake}"),
                model: meta.name.clone(),
                action: MutationAction::Update,
                args: vec![ArgDef::new("input", TypeRef::named_nn(&input.name))],
                payload,
                description: Some(format!("Update a {}", meta.name)),
            });
        }
        if self.settings.enable_delete {
            let payload = single(types, "Delete");
            fields.push(MutationFieldDef {
                name: format!("delete_{snake}"),
                model: meta.name.clone(),
                action: MutationAction::Delete,
                args: vec![ArgDef::new("id", TypeRef::named_nn("ID"))],
                payload,
                description: Some(format!("Delete a {}", meta.name)),
            });
        }

        if self.settings.enable_bulk_operations {
            let many = |types: &mut TypeGenerator, prefix: &str| {
                payload_type(types, &format!("{prefix}{}Payload", meta.name), &object.name, true, false)
            };
            if self.settings.enable_create {
                let input = types.generate_input_type(model, false, MutationKind::Create, true)?;
                fields.push(MutationFieldDef {
                    name: format!("bulk_create_{snake}"),
                    model: meta.name.clone(),
                    action: MutationAction::BulkCreate,
                    args: vec![ArgDef::new("inputs", TypeRef::named_nn_list_nn(&input.name))],
                    payload: many(types, "BulkCreate"),
                    description: None,
                });
            }
            if self.settings.enable_update {
                let input = types.generate_input_type(model, true, MutationKind::Update, false)?;
                fields.push(MutationFieldDef {
                    name: format!("bulk_update_{snake}"),
                    model: meta.name.clone(),
                    action: MutationAction::BulkUpdate,
                    args: vec![ArgDef::new("inputs", TypeRef::named_nn_list_nn(&input.name))],
                    payload: many(types, "BulkUpdate"),
                    description: None,
                });
            }
            if self.settings.enable_delete {
                fields.push(MutationFieldDef {
                    name: format!("bulk_delete_{snake}"),
                    model: meta.name.clone(),
                    action: MutationAction::BulkDelete,
                    args: vec![ArgDef::new("ids", TypeRef::named_nn_list_nn("ID"))],
                    payload: many(types, "BulkDelete"),
                    description: None,
                });
            }
        }

        if self.settings.enable_method_mutations {
            for method in meta.methods.values().filter(|m| m.mutation) {
                let mutation = methods::convert_method_to_mutation(&meta, method);
                let payload = payload_type(types, &mutation.payload_name, &object.name, false, true);
                fields.push(MutationFieldDef {
                    name: mutation.field_name,
                    model: meta.name.clone(),
                    action: MutationAction::Method(method.name.clone()),
                    args: mutation.args,
                    payload,
                    description: method.description.clone(),
                });
            }
        }
        Ok(fields)
    }

    /// Collapse doubled quote characters left by naive client escaping
    pub fn sanitize_input(&self, input: Record) -> Record {
        if !self.settings.sanitize_strings {
            return input;
        }
        input.into_iter().map(|(k, v)| (k, sanitize_value(v))).collect()
    }

    pub fn create(&self, store: &dyn Store, model: &str, input: Record) -> MutationResult {
        let action = MutationAction::Create;
        let input = match self.prepare(model, input, MutationKind::Create) {
            Ok(input) => input,
            Err(errors) => return MutationResult::failure(errors),
        };
        self.in_transaction(store, model, &action, |tx| {
            self.handler
                .handle_nested_create(tx, model, input)
                .map(MutationResult::success)
        })
    }

    /// Update the row named by the input's identifier; raw key or global id
    pub fn update(&self, store: &dyn Store, model: &str, input: Record) -> MutationResult {
        let action = MutationAction::Update;
        let meta = match self.introspector.introspect(model) {
            Ok(meta) => meta,
            Err(err) => return MutationResult::failure(vec![err.to_string()]),
        };
        let mut input = input;
        let Some(id) = input.remove(&meta.primary_key).filter(|id| !id.is_null()) else {
            return MutationResult::failure(vec![format!("{}: This field is required.", meta.primary_key)]);
        };
        let input = match self.prepare(model, input, MutationKind::Update) {
            Ok(input) => input,
            Err(errors) => return MutationResult::failure(errors),
        };
        self.in_transaction(store, model, &action, |tx| {
            let (_, instance) = self.resolve_instance(tx, &meta, &id)?;
            self.handler
                .handle_nested_update(tx, model, input, instance)
                .map(MutationResult::success)
        })
    }

    /// Delete a row; the payload carries the row as it was
    pub fn delete(&self, store: &dyn Store, model: &str, id: &Value) -> MutationResult {
        let meta = match self.introspector.introspect(model) {
            Ok(meta) => meta,
            Err(err) => return MutationResult::failure(vec![err.to_string()]),
        };
        self.in_transaction(store, model, &MutationAction::Delete, |tx| {
            let (pk, snapshot) = self.resolve_instance(tx, &meta, id)?;
            tx.delete(model, &pk)?;
            Ok(MutationResult::success(snapshot))
        })
    }

    pub fn bulk_create(&self, store: &dyn Store, model: &str, inputs: Vec<Record>) -> MutationResult {
        if let Some(failure) = self.check_bulk_limit(inputs.len()) {
            return failure;
        }
        let prepared = match self.prepare_all(model, inputs, MutationKind::Create) {
            Ok(prepared) => prepared,
            Err(errors) => return MutationResult::failure(errors),
        };
        self.in_transaction(store, model, &MutationAction::BulkCreate, |tx| {
            let mut objects = Vec::with_capacity(prepared.len());
            for input in prepared {
                objects.push(self.handler.handle_nested_create(tx, model, input)?);
            }
            Ok(MutationResult::success_many(objects))
        })
    }

    pub fn bulk_update(&self, store: &dyn Store, model: &str, inputs: Vec<Record>) -> MutationResult {
        if let Some(failure) = self.check_bulk_limit(inputs.len()) {
            return failure;
        }
        let meta = match self.introspector.introspect(model) {
            Ok(meta) => meta,
            Err(err) => return MutationResult::failure(vec![err.to_string()]),
        };
        let mut ids = Vec::with_capacity(inputs.len());
        let mut stripped = Vec::with_capacity(inputs.len());
        for (i, mut input) in inputs.into_iter().enumerate() {
            match input.remove(&meta.primary_key).filter(|id| !id.is_null()) {
                Some(id) => ids.push(id),
                None => {
                    return MutationResult::failure(vec![format!(
                        "Item {i}: {}: This field is required.",
                        meta.primary_key
                    )]);
                }
            }
            stripped.push(input);
        }
        let prepared = match self.prepare_all(model, stripped, MutationKind::Update) {
            Ok(prepared) => prepared,
            Err(errors) => return MutationResult::failure(errors),
        };
        self.in_transaction(store, model, &MutationAction::BulkUpdate, |tx| {
            let mut objects = Vec::with_capacity(prepared.len());
            for (id, input) in ids.iter().zip(prepared) {
                let (_, instance) = self.resolve_instance(tx, &meta, id)?;
                objects.push(self.handler.handle_nested_update(tx, model, input, instance)?);
            }
            Ok(MutationResult::success_many(objects))
        })
    }

    /// Delete every listed row or none; missing ids are reported by value
    pub fn bulk_delete(&self, store: &dyn Store, model: &str, ids: &[Value]) -> MutationResult {
        if let Some(failure) = self.check_bulk_limit(ids.len()) {
            return failure;
        }
        let meta = match self.introspector.introspect(model) {
            Ok(meta) => meta,
            Err(err) => return MutationResult::failure(vec![err.to_string()]),
        };
        self.in_transaction(store, model, &MutationAction::BulkDelete, |tx| {
            let mut found = Vec::with_capacity(ids.len());
            let mut missing = Vec::new();
            for id in ids {
                match self.resolve_instance(tx, &meta, id) {
                    Ok(row) => found.push(row),
                    Err(NestedError::NotFound { .. }) => missing.push(display_id(id)),
                    Err(err) => return Err(err),
                }
            }
            if !missing.is_empty() {
                return Ok(MutationResult::failure(vec![format!(
                    "{} not found for ids: {}",
                    meta.name,
                    missing.join(", ")
                )]));
            }
            let mut objects = Vec::with_capacity(found.len());
            for (pk, snapshot) in found {
                // cascades may already have removed it
                if tx.get(model, &pk)?.is_some() {
                    tx.delete(model, &pk)?;
                }
                objects.push(snapshot);
            }
            Ok(MutationResult::success_many(objects))
        })
    }

    /// Run an exposed model method against one row
    pub fn execute_method(
        &self,
        store: &dyn Store,
        ctx: &RequestContext,
        model: &str,
        method: &str,
        id: &Value,
        mut args: Record,
    ) -> MutationResult {
        let meta = match self.introspector.introspect(model) {
            Ok(meta) => meta,
            Err(err) => return MutationResult::failure(vec![err.to_string()]),
        };
        let Some(def) = meta.methods.get(method).filter(|m| m.mutation) else {
            return MutationResult::failure(vec![format!("{model} has no method '{method}'")]);
        };
        if let Some(permission) = &def.permission {
            if !ctx.has_permission(permission) {
                return MutationResult::failure(vec![methods::MethodError::PermissionDenied.to_string()]);
            }
        }
        let Some(handler) = def.handler.clone() else {
            return MutationResult::failure(vec![format!("{model}.{method} has no implementation")]);
        };
        for param in &def.params {
            if let Some(default) = &param.default {
                if args.get(&param.name).is_none_or(Value::is_null) {
                    args.insert(param.name.clone(), default.clone());
                }
            }
        }
        let args = self.sanitize_input(args);

        let mut tx = match store.begin() {
            Ok(tx) => tx,
            Err(err) => return MutationResult::failure(vec![err.to_string()]),
        };
        let (pk, mut instance) = match self.resolve_instance(&mut *tx, &meta, id) {
            Ok(found) => found,
            Err(err) => return MutationResult::failure(vec![err.to_string()]),
        };

        let outcome = handler
            .0
            .call(&mut *tx, &mut instance, &args)
            .map_err(|err| err.to_string())
            .and_then(|output| match output {
                MethodOutput::Instance => tx
                    .update(model, &pk, instance.clone())
                    .map(|saved| (Some(saved), None))
                    .map_err(|err| format_store_error(&meta, &err)),
                MethodOutput::Value(value) => Ok((Some(instance.clone()), Some(value))),
                MethodOutput::Unit => Ok((Some(instance.clone()), None)),
            });

        match outcome {
            Ok((object, result)) => match tx.commit() {
                Ok(()) => MutationResult {
                    ok: true,
                    object,
                    result,
                    ..Default::default()
                },
                Err(err) => MutationResult::failure(vec![err.to_string()]),
            },
            Err(message) => {
                // non-atomic methods keep what they wrote before failing
                let finished = if def.atomic { tx.rollback() } else { tx.commit() };
                if let Err(err) = finished {
                    warn!(model, method, error = %err, "could not finish method transaction");
                }
                warn!(model, method, error = %message, atomic = def.atomic, "method mutation failed");
                MutationResult::failure(vec![message])
            }
        }
    }

    /// Sanitize, check the nesting policy and merge dual fields
    ///
    /// The policy is checked on the keys as submitted so errors name
    /// `nested_{field}` rather than the field it merges into.
    fn prepare(&self, model: &str, input: Record, mode: MutationKind) -> Result<Record, Vec<String>> {
        let input = self.sanitize_input(input);
        let errors = self.handler.validate_nested_data(model, &input, mode);
        if !errors.is_empty() {
            debug!(model, ?errors, "nested input rejected");
            return Err(errors);
        }
        self.handler
            .merge_dual_fields(model, input)
            .map_err(|err| vec![err.to_string()])
    }

    fn prepare_all(&self, model: &str, inputs: Vec<Record>, mode: MutationKind) -> Result<Vec<Record>, Vec<String>> {
        let mut prepared = Vec::with_capacity(inputs.len());
        let mut errors = Vec::new();
        for (i, input) in inputs.into_iter().enumerate() {
            match self.prepare(model, input, mode) {
                Ok(input) => prepared.push(input),
                Err(item_errors) => errors.extend(item_errors.into_iter().map(|e| format!("Item {i}: {e}"))),
            }
        }
        if errors.is_empty() { Ok(prepared) } else { Err(errors) }
    }

    fn check_bulk_limit(&self, len: usize) -> Option<MutationResult> {
        let limit = self.settings.bulk_limit;
        (limit > 0 && len > limit).then(|| {
            MutationResult::failure(vec![format!(
                "Bulk operations are limited to {limit} items, got {len}"
            )])
        })
    }

    /// Run `body` in one transaction; commit on `ok`, roll back otherwise
    fn in_transaction<F>(&self, store: &dyn Store, model: &str, action: &MutationAction, body: F) -> MutationResult
    where
        F: FnOnce(&mut dyn Transaction) -> Result<MutationResult, NestedError>,
    {
        let mut tx = match store.begin() {
            Ok(tx) => tx,
            Err(err) => return MutationResult::failure(vec![err.to_string()]),
        };
        let result = match body(&mut *tx) {
            Ok(result) => result,
            Err(err) => {
                let message = self.format_error(model, action, &err);
                MutationResult::failure(vec![message])
            }
        };
        if result.ok {
            match tx.commit() {
                Ok(()) => result,
                Err(err) => MutationResult::failure(vec![err.to_string()]),
            }
        } else {
            if let Err(err) = tx.rollback() {
                warn!(model, error = %err, "rollback failed");
            }
            warn!(model, action = action.verb(), errors = ?result.errors, "mutation rolled back");
            result
        }
    }

    /// Look a row up by raw key first, then by global id
    fn resolve_instance(&self, tx: &mut dyn Transaction, meta: &ModelMetadata, id: &Value) -> Result<(Pk, Record), NestedError> {
        if let Some(pk) = Pk::from_value(id) {
            if let Some(row) = tx.get(&meta.name, &pk)? {
                return Ok((pk, row));
            }
        }
        if let Some((type_name, pk)) = id.as_str().and_then(|raw| self.global_ids.decode(raw)) {
            if type_name == meta.name {
                if let Some(row) = tx.get(&meta.name, &pk)? {
                    return Ok((pk, row));
                }
            }
        }
        Err(NestedError::NotFound {
            model: meta.name.clone(),
            pk: display_id(id),
        })
    }

    fn format_error(&self, model: &str, action: &MutationAction, err: &NestedError) -> String {
        match err {
            NestedError::Validation(validation) => validation.to_string(),
            NestedError::NotFound { .. } | NestedError::NestingDisabled(_) => err.to_string(),
            NestedError::Store(store) => match self.introspector.introspect(model) {
                Ok(meta) => format_store_error(&meta, store),
                Err(_) => format!("Failed to {} {model}: {store}", action.verb()),
            },
            other => format!("Failed to {} {model}: {other}", action.verb()),
        }
    }
}

/// Name the column of a uniqueness violation; other store errors pass through
fn format_store_error(meta: &ModelMetadata, err: &StoreError) -> String {
    if let StoreError::Integrity(message) = err {
        if let Some(caps) = UNIQUE_VIOLATION.captures(message) {
            if let Some(column) = caps.name("col").or_else(|| caps.name("key")) {
                let column = column.as_str();
                return format!("{column}: {} with this {column} already exists.", meta.name);
            }
        }
    }
    err.to_string()
}

fn display_id(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn sanitize_value(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.replace("\"\"", "\"").replace("''", "'")),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_value).collect()),
        Value::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (k, sanitize_value(v))).collect()),
        other => other,
    }
}

/// Register a payload type; an existing one with the same name is reused
fn payload_type(types: &mut TypeGenerator, name: &str, object: &str, many: bool, method: bool) -> String {
    let mut fields = vec![
        ObjectField::new("ok", TypeRef::named_nn("Boolean"), FieldSource::PayloadOk),
        ObjectField::new("errors", TypeRef::named_nn_list_nn("String"), FieldSource::PayloadErrors),
    ];
    if many {
        fields.push(ObjectField::new("objects", TypeRef::named_nn_list_nn(object), FieldSource::PayloadObjects));
    } else {
        fields.push(ObjectField::new("object", TypeRef::named(object), FieldSource::PayloadObject));
    }
    if method {
        fields.push(ObjectField::new("result", TypeRef::named("JSON"), FieldSource::PayloadResult));
    }
    types
        .register_object(ObjectTypeDef {
            name: name.to_string(),
            model: None,
            description: None,
            fields,
        })
        .name
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FilterExpr, MemoryStore, QueryPlan};
    use crate::settings::TypeGeneratorSettings;
    use crate::test_fixtures::{self as fixtures, blog_registry, blog_store, record};
    use crate::types::GeneratedType;
    use serde_json::json;

    fn generator(settings: MutationGeneratorSettings) -> MutationGenerator {
        MutationGenerator::new(Arc::new(blog_registry()), settings, NestedRelationsPolicy::default())
    }

    fn bulk() -> MutationGenerator {
        generator(MutationGeneratorSettings {
            enable_bulk_operations: true,
            ..Default::default()
        })
    }

    fn rows(store: &MemoryStore, model: &str) -> Vec<Record> {
        let mut tx = store.begin().unwrap();
        tx.query(&QueryPlan::new(model)).unwrap()
    }

    #[test]
    fn test_generated_mutation_fields() {
        let mutations = bulk();
        let mut types = TypeGenerator::new(Arc::new(blog_registry()), TypeGeneratorSettings::default());
        let fields = mutations.generate_mutations(&mut types, "Post").unwrap();
        let names: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "create_post",
                "update_post",
                "delete_post",
                "bulk_create_post",
                "bulk_update_post",
                "bulk_delete_post",
                "post_publish",
                "post_add_comment"
            ]
        );
        assert_eq!(fields[0].args[0].ty.to_string(), "PostCreateInput!");
        assert_eq!(fields[1].args[0].ty.to_string(), "PostUpdateInput!");
        assert_eq!(fields[5].args[0].ty.to_string(), "[ID!]!");
        let Some(GeneratedType::Object(payload)) = types.registry().get_by_name("BulkDeletePostPayload") else {
            panic!("missing payload");
        };
        assert_eq!(payload.field("objects").unwrap().ty.to_string(), "[Post!]!");
        let Some(GeneratedType::Object(payload)) = types.registry().get_by_name("PostPublishPayload") else {
            panic!("missing method payload");
        };
        assert!(payload.field("result").is_some());
    }

    #[test]
    fn test_bulk_fields_disabled_by_default() {
        let mutations = generator(MutationGeneratorSettings::default());
        let mut types = TypeGenerator::new(Arc::new(blog_registry()), TypeGeneratorSettings::default());
        let fields = mutations.generate_mutations(&mut types, "Tag").unwrap();
        assert!(fields.iter().all(|f| !f.name.starts_with("bulk_")));
    }

    #[test]
    fn test_sanitize_doubled_quotes() {
        let mutations = generator(MutationGeneratorSettings::default());
        let clean = mutations.sanitize_input(record(json!({
            "title": "He said \"\"hi\"\"",
            "nested": { "body": "it''s" },
            "count": 3
        })));
        assert_eq!(clean["title"], json!("He said \"hi\""));
        assert_eq!(clean["nested"]["body"], json!("it's"));
        assert_eq!(clean["count"], json!(3));
    }

    #[test]
    fn test_create_with_nested_comment() {
        let store = blog_store();
        let result = generator(MutationGeneratorSettings::default()).create(
            &store,
            "Post",
            record(json!({ "title": "T", "category": 3, "nested_comments": [{ "content": "hi" }] })),
        );
        assert!(result.ok, "{:?}", result.errors);
        let post = result.object.unwrap();
        assert_eq!(post["category_id"], json!(3));
        let comments = rows(&store, "Comment");
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0]["post_id"], post["id"]);
    }

    #[test]
    fn test_create_with_invalid_category_leaves_nothing() {
        let store = blog_store();
        let result = generator(MutationGeneratorSettings::default()).create(
            &store,
            "Post",
            record(json!({ "title": "T", "category": 999, "nested_comments": [{ "content": "hi" }] })),
        );
        assert!(!result.ok);
        assert_eq!(result.errors, vec!["Category with id 999 does not exist".to_string()]);
        assert!(result.object.is_none());
        assert!(rows(&store, "Post").is_empty());
        assert!(rows(&store, "Comment").is_empty());
    }

    #[test]
    fn test_third_child_failure_rolls_back_all() {
        let store = blog_store();
        let result = generator(MutationGeneratorSettings::default()).create(
            &store,
            "Post",
            record(json!({
                "title": "T",
                "category": 1,
                "tags": [1],
                "nested_comments": [
                    { "content": "one" },
                    { "content": "two" },
                    { "content": "" },
                    { "content": "four" }
                ]
            })),
        );
        assert!(!result.ok);
        assert_eq!(result.errors, vec!["content: This field cannot be blank.".to_string()]);
        assert!(rows(&store, "Post").is_empty());
        assert!(rows(&store, "Comment").is_empty());
    }

    #[test]
    fn test_disabled_nesting_reported_per_field() {
        let store = blog_store();
        let mutations = MutationGenerator::new(
            Arc::new(blog_registry()),
            MutationGeneratorSettings::default(),
            NestedRelationsPolicy::default().disable_field("Post", "category"),
        );
        let result = mutations.create(
            &store,
            "Post",
            record(json!({ "title": "T", "category": 1, "nested_category": { "name": "Nope" } })),
        );
        assert!(!result.ok);
        assert_eq!(result.errors, vec!["Nested input is not allowed for field 'nested_category'".to_string()]);

        let result = mutations.update(
            &store,
            "Post",
            record(json!({ "id": 1, "nested_category": { "name": "Nope" } })),
        );
        assert_eq!(result.errors, vec!["Nested input is not allowed for field 'nested_category'".to_string()]);

        let result = mutations.create(&store, "Post", record(json!({ "title": "T", "category": 1 })));
        assert!(result.ok);
    }

    #[test]
    fn test_unique_violation_names_column() {
        let store = blog_store();
        let result = generator(MutationGeneratorSettings::default()).create(&store, "Tag", record(json!({ "name": "rust" })));
        assert!(!result.ok);
        assert_eq!(result.errors, vec!["name: Tag with this name already exists.".to_string()]);
    }

    #[test]
    fn test_update_by_raw_and_global_id() {
        let store = blog_store();
        let mutations = generator(MutationGeneratorSettings::default());
        let result = mutations.update(&store, "Tag", record(json!({ "id": "1", "name": "rustlang" })));
        assert!(result.ok, "{:?}", result.errors);
        assert_eq!(result.object.unwrap()["name"], json!("rustlang"));

        let global = RelayGlobalId.encode("Tag", &Pk::Int(2));
        let result = mutations.update(&store, "Tag", record(json!({ "id": global, "name": "gql" })));
        assert!(result.ok, "{:?}", result.errors);
        assert_eq!(result.object.unwrap()["id"], json!(2));

        let wrong_type = RelayGlobalId.encode("Category", &Pk::Int(2));
        let result = mutations.update(&store, "Tag", record(json!({ "id": wrong_type, "name": "x" })));
        assert!(!result.ok);

        let result = mutations.update(&store, "Tag", record(json!({ "name": "x" })));
        assert_eq!(result.errors, vec!["id: This field is required.".to_string()]);
    }

    #[test]
    fn test_delete_returns_snapshot() {
        let store = blog_store();
        let result = generator(MutationGeneratorSettings::default()).delete(&store, "Tag", &json!("3"));
        assert!(result.ok);
        assert_eq!(result.object.unwrap()["name"], json!("python"));
        assert_eq!(rows(&store, "Tag").len(), 2);

        let result = generator(MutationGeneratorSettings::default()).delete(&store, "Tag", &json!("3"));
        assert_eq!(result.errors, vec!["Tag with id 3 does not exist".to_string()]);
    }

    #[test]
    fn test_bulk_delete_reports_missing_and_deletes_nothing() {
        let store = blog_store();
        let result = bulk().bulk_delete(&store, "Tag", &[json!(1), json!(2), json!(999)]);
        assert!(!result.ok);
        assert!(result.objects.is_empty());
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("999"));
        assert_eq!(rows(&store, "Tag").len(), 3);

        let result = bulk().bulk_delete(&store, "Tag", &[json!(1), json!(2)]);
        assert!(result.ok);
        assert_eq!(result.objects.len(), 2);
        assert_eq!(rows(&store, "Tag").len(), 1);
    }

    #[test]
    fn test_bulk_create_is_all_or_nothing() {
        let store = blog_store();
        let result = bulk().bulk_create(
            &store,
            "Tag",
            vec![record(json!({ "name": "a" })), record(json!({ "name": "b" })), record(json!({ "name": "rust" }))],
        );
        assert!(!result.ok);
        assert_eq!(rows(&store, "Tag").len(), 3);

        let result = bulk().bulk_create(&store, "Tag", vec![record(json!({ "name": "a" })), record(json!({ "name": "b" }))]);
        assert!(result.ok);
        assert_eq!(result.objects.len(), 2);
        assert_eq!(rows(&store, "Tag").len(), 5);
    }

    #[test]
    fn test_bulk_update_and_limit() {
        let store = blog_store();
        let result = bulk().bulk_update(
            &store,
            "Tag",
            vec![record(json!({ "id": 1, "name": "one" })), record(json!({ "id": 42, "name": "x" }))],
        );
        assert!(!result.ok);
        let names: Vec<Value> = rows(&store, "Tag").into_iter().map(|r| r["name"].clone()).collect();
        assert!(names.contains(&json!("rust")));

        let limited = generator(MutationGeneratorSettings {
            enable_bulk_operations: true,
            bulk_limit: 1,
            ..Default::default()
        });
        let result = limited.bulk_delete(&store, "Tag", &[json!(1), json!(2)]);
        assert_eq!(result.errors, vec!["Bulk operations are limited to 1 items, got 2".to_string()]);
    }

    #[test]
    fn test_method_permission_and_persistence() {
        let store = blog_store();
        let mutations = generator(MutationGeneratorSettings::default());
        let post = mutations
            .create(&store, "Post", record(json!({ "title": "T", "category": 1 })))
            .object
            .unwrap();
        let id = post["id"].clone();

        let denied = mutations.execute_method(&store, &RequestContext::user("ana"), "Post", "publish", &id, Record::new());
        assert!(!denied.ok);
        assert_eq!(denied.errors, vec!["You do not have permission to perform this action".to_string()]);

        let editor = RequestContext::user("ana").with_permission("blog.change_post");
        let published = mutations.execute_method(&store, &editor, "Post", "publish", &id, Record::new());
        assert!(published.ok, "{:?}", published.errors);
        assert_eq!(rows(&store, "Post")[0]["published"], json!(true));

        let again = mutations.execute_method(&store, &editor, "Post", "publish", &id, Record::new());
        assert_eq!(again.errors, vec!["post is already published".to_string()]);
    }

    #[test]
    fn test_atomic_method_rolls_back_its_writes() {
        let store = blog_store();
        let mutations = generator(MutationGeneratorSettings::default());
        let post = mutations
            .create(&store, "Post", record(json!({ "title": "T", "category": 1 })))
            .object
            .unwrap();
        let ctx = RequestContext::anonymous();

        let failed = mutations.execute_method(&store, &ctx, "Post", "add_comment", &post["id"], record(json!({ "content": "x", "fail": true })));
        assert!(!failed.ok);
        assert!(rows(&store, "Comment").is_empty());

        let added = mutations.execute_method(&store, &ctx, "Post", "add_comment", &post["id"], record(json!({ "content": "x" })));
        assert!(added.ok);
        assert_eq!(added.result, Some(json!(1)));
        let mut tx = store.begin().unwrap();
        assert_eq!(tx.count("Comment", &FilterExpr::All).unwrap(), 1);
    }

    #[test]
    fn test_non_atomic_method_keeps_partial_writes() {
        let mut post = fixtures::post();
        for method in &mut post.methods {
            if method.name == "add_comment" {
                method.atomic = false;
            }
        }
        let registry = Arc::new(
            ModelRegistry::from_models([fixtures::category(), post, fixtures::comment(), fixtures::tag()]).unwrap(),
        );
        let store = fixtures::seeded_store(registry.clone());
        let mutations = MutationGenerator::new(registry, MutationGeneratorSettings::default(), NestedRelationsPolicy::default());
        let post = mutations
            .create(&store, "Post", record(json!({ "title": "T", "category": 1 })))
            .object
            .unwrap();
        let failed = mutations.execute_method(
            &store,
            &RequestContext::anonymous(),
            "Post",
            "add_comment",
            &post["id"],
            record(json!({ "content": "kept", "fail": true })),
        );
        assert!(!failed.ok);
        assert_eq!(rows(&store, "Comment").len(), 1);
    }
}

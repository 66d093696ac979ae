//! Nested create and update
//!
//! Resolves a mutation payload that mixes plain ids with nested objects into
//! writes against one open [`Transaction`]:
//!
//! - to-one relations are written first so the base row's foreign keys exist
//! - the base row is validated and written next
//! - to-many links and reverse relation rows follow once the base row has a key
//!
//! The handler never commits. The mutation boundary owns the transaction and
//! rolls it back when any step fails, so a failure at any depth leaves the
//! store untouched.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::error::RegistryError;
use crate::introspector::{ModelIntrospector, ModelMetadata, RelationshipInfo, ReverseRelationInfo};
use crate::model::{ModelRegistry, Record};
use crate::settings::NestedRelationsPolicy;
use crate::store::{Pk, StoreError, Transaction};
use crate::types::MutationKind;
use crate::validation::{ModelValidator, ValidationError};

const NESTED_PREFIX: &str = "nested_";

/// Error raised while resolving a nested payload
#[derive(Debug, thiserror::Error)]
pub enum NestedError {
    /// Object input for a relation whose nesting is switched off
    #[error("Nested input is not allowed for field '{0}'")]
    NestingDisabled(String),

    /// An id that does not resolve to a row
    #[error("{model} with id {pk} does not exist")]
    NotFound { model: String, pk: String },

    /// A value of the wrong shape for its field
    #[error("Invalid value for field '{field}': {reason}")]
    InvalidShape { field: String, reason: String },

    #[error("Unknown field '{field}' on {model}")]
    UnknownField { model: String, field: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl From<StoreError> for NestedError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { model, pk } => NestedError::NotFound { model, pk },
            other => NestedError::Store(other),
        }
    }
}

fn shape(field: &str, reason: &str) -> NestedError {
    NestedError::InvalidShape {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

/// Operations accepted inside a structured to-many value
fn allowed_operations(mode: MutationKind) -> &'static [&'static str] {
    match mode {
        MutationKind::Create => &["connect", "create"],
        MutationKind::Update => &["connect", "create", "disconnect", "set"],
    }
}

/// Resolves nested payloads against a transaction
#[derive(Debug, Clone)]
pub struct NestedOperationHandler {
    introspector: ModelIntrospector,
    policy: NestedRelationsPolicy,
}

impl NestedOperationHandler {
    pub fn new(models: Arc<ModelRegistry>, policy: NestedRelationsPolicy) -> Self {
        Self {
            introspector: ModelIntrospector::new(models),
            policy,
        }
    }

    pub fn policy(&self) -> &NestedRelationsPolicy {
        &self.policy
    }

    /// Whether object input is accepted for a model's relation or reverse accessor
    pub fn nesting_enabled(&self, model: &str, field: &str) -> bool {
        self.policy.is_enabled(model, field)
    }

    /// Fold `nested_{field}` entries into their direct field
    ///
    /// For a to-one relation the nested object replaces the direct id. For
    /// to-many and reverse relations the nested objects are appended to the
    /// direct list (or to `create` of a structured value), so the ids they
    /// produce end up connected next to the explicit ones. Running it twice
    /// changes nothing.
    pub fn merge_dual_fields(&self, model: &str, input: Record) -> Result<Record, NestedError> {
        let meta = self.introspector.introspect(model)?;
        Ok(merge_dual_fields(&meta, input))
    }

    /// Check relation values against the nesting policy; returns every problem found
    pub fn validate_nested_data(&self, model: &str, input: &Record, mode: MutationKind) -> Vec<String> {
        let mut errors = Vec::new();
        match self.introspector.introspect(model) {
            Ok(meta) => self.validate_into(&meta, input, mode, "", &mut errors),
            Err(err) => errors.push(err.to_string()),
        }
        errors
    }

    /// Create a row and everything nested under it
    pub fn handle_nested_create(&self, tx: &mut dyn Transaction, model: &str, input: Record) -> Result<Record, NestedError> {
        let meta = self.introspector.introspect(model)?;
        let input = merge_dual_fields(&meta, input);
        self.create_instance(tx, &meta, input, "")
    }

    /// Apply a partial change to `instance` and everything nested under it
    pub fn handle_nested_update(
        &self,
        tx: &mut dyn Transaction,
        model: &str,
        input: Record,
        instance: Record,
    ) -> Result<Record, NestedError> {
        let meta = self.introspector.introspect(model)?;
        let input = merge_dual_fields(&meta, input);
        self.update_instance(tx, &meta, instance, input, "")
    }

    fn validate_into(&self, meta: &ModelMetadata, input: &Record, mode: MutationKind, prefix: &str, errors: &mut Vec<String>) {
        for (key, value) in input {
            let (name, dual) = match key.strip_prefix(NESTED_PREFIX) {
                Some(base) if meta.relationship(base).is_some() || meta.reverse_relation(base).is_some() => (base, true),
                _ => (key.as_str(), false),
            };
            let path = join(prefix, key);

            if let Some(rel) = meta.relationship(name) {
                self.validate_relation(meta, rel, value, dual, mode, &path, errors);
            } else if let Some(reverse) = meta.reverse_relation(name) {
                self.validate_reverse(meta, reverse, value, &path, errors);
            } else if meta.field(name).is_none() && meta.relationship_by_column(name).is_none() {
                errors.push(format!("Unknown field '{path}' on {}", meta.name));
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn validate_relation(
        &self,
        meta: &ModelMetadata,
        rel: &RelationshipInfo,
        value: &Value,
        dual: bool,
        mode: MutationKind,
        path: &str,
        errors: &mut Vec<String>,
    ) {
        let enabled = self.nesting_enabled(&meta.name, &rel.name);
        if rel.relationship_type.is_to_one() {
            match value {
                Value::Null => {}
                Value::Number(_) | Value::String(_) if !dual => {}
                Value::Object(obj) => {
                    if enabled {
                        self.validate_target(&rel.related_model, obj, mode, path, errors);
                    } else {
                        errors.push(NestedError::NestingDisabled(path.to_string()).to_string());
                    }
                }
                _ => errors.push(shape(path, "expected an id or an object").to_string()),
            }
            return;
        }

        match value {
            Value::Null => {}
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    let item_path = format!("{path}.{i}");
                    match item {
                        Value::Number(_) | Value::String(_) if !dual => {}
                        Value::Object(obj) if enabled => {
                            self.validate_target(&rel.related_model, obj, mode, &item_path, errors)
                        }
                        Value::Object(_) => errors.push(NestedError::NestingDisabled(path.to_string()).to_string()),
                        _ => errors.push(shape(&item_path, "expected an id or an object").to_string()),
                    }
                }
            }
            Value::Object(ops) if !dual => {
                for (op, items) in ops {
                    let op_path = format!("{path}.{op}");
                    if !allowed_operations(mode).contains(&op.as_str()) {
                        errors.push(format!("Unknown operation '{op_path}'"));
                        continue;
                    }
                    let Some(items) = items.as_array() else {
                        if !items.is_null() {
                            errors.push(shape(&op_path, "expected a list").to_string());
                        }
                        continue;
                    };
                    for (i, item) in items.iter().enumerate() {
                        let item_path = format!("{op_path}.{i}");
                        match (op.as_str(), item) {
                            ("create", Value::Object(obj)) if enabled => {
                                self.validate_target(&rel.related_model, obj, mode, &item_path, errors)
                            }
                            ("create", Value::Object(_)) => {
                                errors.push(NestedError::NestingDisabled(path.to_string()).to_string())
                            }
                            ("create", _) => errors.push(shape(&item_path, "expected an object").to_string()),
                            (_, Value::Number(_) | Value::String(_)) => {}
                            _ => errors.push(shape(&item_path, "expected an id").to_string()),
                        }
                    }
                }
            }
            _ => errors.push(shape(path, "expected a list").to_string()),
        }
    }

    fn validate_reverse(
        &self,
        meta: &ModelMetadata,
        reverse: &ReverseRelationInfo,
        value: &Value,
        path: &str,
        errors: &mut Vec<String>,
    ) {
        let enabled = self.nesting_enabled(&meta.name, &reverse.accessor);
        let items: Vec<&Value> = match value {
            Value::Null => return,
            Value::Array(items) => items.iter().collect(),
            Value::Object(_) if reverse.is_single() => vec![value],
            _ => {
                errors.push(shape(path, "expected a list").to_string());
                return;
            }
        };
        for (i, item) in items.into_iter().enumerate() {
            let item_path = if value.is_array() { format!("{path}.{i}") } else { path.to_string() };
            match item {
                Value::Number(_) | Value::String(_) => {}
                Value::Object(obj) if enabled => {
                    // the back reference is filled in by the handler
                    let mut obj = obj.clone();
                    obj.remove(&reverse.field);
                    self.validate_target(&reverse.related_model, &obj, MutationKind::Create, &item_path, errors)
                }
                Value::Object(_) => errors.push(NestedError::NestingDisabled(path.to_string()).to_string()),
                _ => errors.push(shape(&item_path, "expected an id or an object").to_string()),
            }
        }
    }

    fn validate_target(&self, model: &str, input: &Record, mode: MutationKind, path: &str, errors: &mut Vec<String>) {
        match self.introspector.introspect(model) {
            Ok(meta) => self.validate_into(&meta, input, mode, path, errors),
            Err(err) => errors.push(err.to_string()),
        }
    }

    fn create_instance(
        &self,
        tx: &mut dyn Transaction,
        meta: &ModelMetadata,
        input: Record,
        prefix: &str,
    ) -> Result<Record, NestedError> {
        let mut row = Record::new();
        let mut to_many = Vec::new();
        let mut reverse = Vec::new();

        for (key, value) in input {
            let path = join(prefix, &key);
            if meta.field(&key).is_some() {
                row.insert(key, value);
            } else if let Some(rel) = meta.relationship(&key) {
                if rel.relationship_type.is_to_one() {
                    let fk = self.resolve_to_one(tx, meta, rel, value, &path)?;
                    row.insert(rel.from_field.clone(), fk);
                } else {
                    to_many.push((rel.clone(), value, path));
                }
            } else if let Some(rel) = meta.relationship_by_column(&key) {
                let fk = self.resolve_to_one(tx, meta, rel, value, &path)?;
                row.insert(rel.from_field.clone(), fk);
            } else if let Some(rev) = meta.reverse_relation(&key) {
                reverse.push((rev.clone(), value, path));
            } else {
                return Err(NestedError::UnknownField {
                    model: meta.name.clone(),
                    field: path,
                });
            }
        }

        ModelValidator::clean(meta, &row)?;
        let created = tx.insert(&meta.name, row)?;
        let pk = pk_of(meta, &created)?;
        debug!(model = %meta.name, %pk, "nested create");

        for (rel, value, path) in to_many {
            self.apply_to_many(tx, meta, &rel, &pk, value, MutationKind::Create, &path)?;
        }
        for (rev, value, path) in reverse {
            self.apply_reverse(tx, meta, &rev, &pk, value, &path)?;
        }
        Ok(created)
    }

    fn update_instance(
        &self,
        tx: &mut dyn Transaction,
        meta: &ModelMetadata,
        instance: Record,
        input: Record,
        prefix: &str,
    ) -> Result<Record, NestedError> {
        let pk = pk_of(meta, &instance)?;
        let mut changes = Record::new();
        let mut to_many = Vec::new();
        let mut reverse = Vec::new();

        for (key, value) in input {
            let path = join(prefix, &key);
            if key == meta.primary_key || key == "pk" {
                continue;
            }
            if meta.field(&key).is_some() {
                changes.insert(key, value);
            } else if let Some(rel) = meta.relationship(&key) {
                if rel.relationship_type.is_to_one() {
                    let fk = self.resolve_to_one(tx, meta, rel, value, &path)?;
                    changes.insert(rel.from_field.clone(), fk);
                } else {
                    to_many.push((rel.clone(), value, path));
                }
            } else if let Some(rel) = meta.relationship_by_column(&key) {
                let fk = self.resolve_to_one(tx, meta, rel, value, &path)?;
                changes.insert(rel.from_field.clone(), fk);
            } else if let Some(rev) = meta.reverse_relation(&key) {
                reverse.push((rev.clone(), value, path));
            } else {
                return Err(NestedError::UnknownField {
                    model: meta.name.clone(),
                    field: path,
                });
            }
        }

        let mut candidate = instance;
        for (key, value) in &changes {
            candidate.insert(key.clone(), value.clone());
        }
        ModelValidator::clean(meta, &candidate)?;
        let updated = tx.update(&meta.name, &pk, changes)?;
        debug!(model = %meta.name, %pk, "nested update");

        for (rel, value, path) in to_many {
            self.apply_to_many(tx, meta, &rel, &pk, value, MutationKind::Update, &path)?;
        }
        for (rev, value, path) in reverse {
            self.apply_reverse(tx, meta, &rev, &pk, value, &path)?;
        }
        Ok(updated)
    }

    /// Turn a to-one value into the foreign key to store
    fn resolve_to_one(
        &self,
        tx: &mut dyn Transaction,
        meta: &ModelMetadata,
        rel: &RelationshipInfo,
        value: Value,
        path: &str,
    ) -> Result<Value, NestedError> {
        match value {
            Value::Null => Ok(Value::Null),
            Value::Object(obj) => {
                if !self.nesting_enabled(&meta.name, &rel.name) {
                    return Err(NestedError::NestingDisabled(path.to_string()));
                }
                let target = self.introspector.introspect(&rel.related_model)?;
                let pk = self.write_object(tx, &target, obj, path)?;
                Ok(pk.to_value())
            }
            Value::Number(_) | Value::String(_) => {
                let pk = Pk::from_value(&value).ok_or_else(|| shape(path, "expected an id"))?;
                tx.fetch(&rel.related_model, &pk)?;
                Ok(pk.to_value())
            }
            _ => Err(shape(path, "expected an id or an object")),
        }
    }

    /// Create an object, or update and reuse it when it carries its key
    fn write_object(&self, tx: &mut dyn Transaction, meta: &ModelMetadata, mut obj: Record, path: &str) -> Result<Pk, NestedError> {
        let key = obj
            .remove(&meta.primary_key)
            .or_else(|| obj.remove("pk"))
            .and_then(|v| Pk::from_value(&v));
        match key {
            Some(pk) => {
                let instance = tx.fetch(&meta.name, &pk)?;
                if !obj.is_empty() {
                    self.update_instance(tx, meta, instance, obj, path)?;
                }
                Ok(pk)
            }
            None => {
                let created = self.create_instance(tx, meta, obj, path)?;
                pk_of(meta, &created)
            }
        }
    }

    /// Ids named by a list of ids and objects; objects are written first
    fn collect_ids(
        &self,
        tx: &mut dyn Transaction,
        meta: &ModelMetadata,
        rel: &RelationshipInfo,
        items: Vec<Value>,
        path: &str,
        objects_allowed: bool,
    ) -> Result<Vec<Pk>, NestedError> {
        let target = self.introspector.introspect(&rel.related_model)?;
        let mut ids = Vec::new();
        for (i, item) in items.into_iter().enumerate() {
            let item_path = format!("{path}.{i}");
            let pk = match item {
                Value::Object(obj) => {
                    if !objects_allowed || !self.nesting_enabled(&meta.name, &rel.name) {
                        return Err(NestedError::NestingDisabled(path.to_string()));
                    }
                    self.write_object(tx, &target, obj, &item_path)?
                }
                Value::Number(_) | Value::String(_) => {
                    let pk = Pk::from_value(&item).ok_or_else(|| shape(&item_path, "expected an id"))?;
                    tx.fetch(&target.name, &pk)?;
                    pk
                }
                _ => return Err(shape(&item_path, "expected an id or an object")),
            };
            push_unique(&mut ids, pk);
        }
        Ok(ids)
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_to_many(
        &self,
        tx: &mut dyn Transaction,
        meta: &ModelMetadata,
        rel: &RelationshipInfo,
        pk: &Pk,
        value: Value,
        mode: MutationKind,
        path: &str,
    ) -> Result<(), NestedError> {
        let ids = match value {
            Value::Null => return Ok(()),
            // a plain list is the complete set
            Value::Array(items) => self.collect_ids(tx, meta, rel, items, path, true)?,
            Value::Object(mut ops) => {
                let mut ids = match mode {
                    MutationKind::Create => Vec::new(),
                    MutationKind::Update => tx.related(&meta.name, pk, &rel.name)?,
                };
                if let Some(op) = ops.keys().find(|op| !allowed_operations(mode).contains(&op.as_str())) {
                    return Err(shape(&format!("{path}.{op}"), "unknown operation"));
                }
                if let Some(set) = take_list(&mut ops, "set", path)? {
                    ids = self.collect_ids(tx, meta, rel, set, &format!("{path}.set"), false)?;
                }
                if let Some(disconnect) = take_list(&mut ops, "disconnect", path)? {
                    let removed = self.collect_ids(tx, meta, rel, disconnect, &format!("{path}.disconnect"), false)?;
                    ids.retain(|id| !removed.contains(id));
                }
                if let Some(connect) = take_list(&mut ops, "connect", path)? {
                    for id in self.collect_ids(tx, meta, rel, connect, &format!("{path}.connect"), false)? {
                        push_unique(&mut ids, id);
                    }
                }
                if let Some(create) = take_list(&mut ops, "create", path)? {
                    if create.iter().any(|item| !item.is_object()) {
                        return Err(shape(&format!("{path}.create"), "expected a list of objects"));
                    }
                    for id in self.collect_ids(tx, meta, rel, create, path, true)? {
                        push_unique(&mut ids, id);
                    }
                }
                ids
            }
            _ => return Err(shape(path, "expected a list")),
        };
        debug!(model = %meta.name, %pk, field = %rel.name, count = ids.len(), "set related");
        tx.set_related(&meta.name, pk, &rel.name, &ids)?;
        Ok(())
    }

    /// Write rows of another model that point back at `parent`
    fn apply_reverse(
        &self,
        tx: &mut dyn Transaction,
        meta: &ModelMetadata,
        reverse: &ReverseRelationInfo,
        parent: &Pk,
        value: Value,
        path: &str,
    ) -> Result<(), NestedError> {
        let source = self.introspector.introspect(&reverse.related_model)?;
        let Some(rel) = source.relationship(&reverse.field).cloned() else {
            return Err(RegistryError::UnknownMember {
                model: source.name.clone(),
                member: reverse.field.clone(),
            }
            .into());
        };

        let (connect, create) = match value {
            Value::Null => return Ok(()),
            Value::Array(items) => split_ids_and_objects(items),
            Value::Object(mut ops) if ops.contains_key("connect") || ops.contains_key("create") => {
                let connect = take_list(&mut ops, "connect", path)?.unwrap_or_default();
                let create = take_list(&mut ops, "create", path)?.unwrap_or_default();
                if let Some(op) = ops.keys().next() {
                    return Err(shape(&format!("{path}.{op}"), "unknown operation"));
                }
                (connect, create)
            }
            obj @ Value::Object(_) if reverse.is_single() => (Vec::new(), vec![obj]),
            _ => return Err(shape(path, "expected a list")),
        };

        if !create.is_empty() && !self.nesting_enabled(&meta.name, &reverse.accessor) {
            return Err(NestedError::NestingDisabled(path.to_string()));
        }

        let mut children = Vec::new();
        for (i, item) in connect.into_iter().enumerate() {
            let pk = Pk::from_value(&item).ok_or_else(|| shape(&format!("{path}.{i}"), "expected an id"))?;
            tx.fetch(&source.name, &pk)?;
            children.push(pk);
        }
        for (i, item) in create.into_iter().enumerate() {
            let Value::Object(mut obj) = item else {
                return Err(shape(&format!("{path}.{i}"), "expected an object"));
            };
            if rel.relationship_type.is_to_one() {
                obj.insert(rel.name.clone(), parent.to_value());
            } else {
                obj.remove(&rel.name);
            }
            children.push(self.write_object(tx, &source, obj, &format!("{path}.{i}"))?);
        }

        for child in children {
            if rel.relationship_type.is_to_one() {
                let mut change = Record::new();
                change.insert(rel.from_field.clone(), parent.to_value());
                tx.update(&source.name, &child, change)?;
            } else {
                let mut linked = tx.related(&source.name, &child, &rel.name)?;
                push_unique(&mut linked, parent.clone());
                tx.set_related(&source.name, &child, &rel.name, &linked)?;
            }
        }
        Ok(())
    }
}

/// Fold `nested_{field}` keys into their direct counterparts
fn merge_dual_fields(meta: &ModelMetadata, input: Record) -> Record {
    let mut merged = Record::new();
    let mut nested = Vec::new();
    for (key, value) in input {
        match key.strip_prefix(NESTED_PREFIX) {
            Some(base) if meta.relationship(base).is_some() || meta.reverse_relation(base).is_some() => {
                nested.push((base.to_string(), value));
            }
            _ => {
                merged.insert(key, value);
            }
        }
    }

    for (name, value) in nested {
        if value.is_null() {
            continue;
        }
        let to_one = meta
            .relationship(&name)
            .is_some_and(|rel| rel.relationship_type.is_to_one())
            || meta.reverse_relation(&name).is_some_and(ReverseRelationInfo::is_single);
        if to_one {
            // the nested object wins over the direct id
            merged.insert(name, value);
            continue;
        }
        let additions = match value {
            Value::Array(items) => items,
            other => vec![other],
        };
        match merged.remove(&name) {
            Some(Value::Object(mut ops)) => {
                let entry = ops.entry("create").or_insert_with(|| Value::Array(Vec::new()));
                match entry {
                    Value::Array(create) => create.extend(additions),
                    other => *other = Value::Array(additions),
                }
                merged.insert(name, Value::Object(ops));
            }
            Some(Value::Array(mut items)) => {
                items.extend(additions);
                merged.insert(name, Value::Array(items));
            }
            _ => {
                merged.insert(name, Value::Array(additions));
            }
        }
    }
    merged
}

fn split_ids_and_objects(items: Vec<Value>) -> (Vec<Value>, Vec<Value>) {
    items.into_iter().partition(|item| !item.is_object())
}

fn take_list(ops: &mut Record, op: &str, path: &str) -> Result<Option<Vec<Value>>, NestedError> {
    match ops.remove(op) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => Ok(Some(items)),
        Some(_) => Err(shape(&format!("{path}.{op}"), "expected a list")),
    }
}

fn push_unique(ids: &mut Vec<Pk>, pk: Pk) {
    if !ids.contains(&pk) {
        ids.push(pk);
    }
}

fn pk_of(meta: &ModelMetadata, row: &Record) -> Result<Pk, NestedError> {
    row.get(&meta.primary_key)
        .and_then(Pk::from_value)
        .ok_or_else(|| shape(&meta.primary_key, "row has no primary key"))
}

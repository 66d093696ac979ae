//! In-process store
//!
//! Rows live in per-model ordered maps and many-to-many links in per-relation
//! pair lists. A transaction holds the state lock for its whole life and keeps
//! a snapshot to restore on rollback, so transactions are serialized.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use heck::ToSnakeCase;
use regex::RegexBuilder;
use serde_json::Value;
use tracing::trace;

use crate::error::RegistryError;
use crate::introspector::{ModelIntrospector, ModelMetadata};
use crate::model::{FieldKind, ModelRegistry, Record, RelationKind};
use crate::store::{FilterExpr, Lookup, Pk, QueryPlan, Store, StoreError, Transaction};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    tables: HashMap<String, BTreeMap<Pk, Record>>,
    /// `(model, field)` to `(source pk, target pk)` pairs
    links: HashMap<(String, String), Vec<(Pk, Pk)>>,
    sequences: HashMap<String, i64>,
}

/// Store backed by process memory
#[derive(Debug)]
pub struct MemoryStore {
    models: Arc<HashMap<String, ModelMetadata>>,
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Create empty tables for every concrete model
    pub fn new(registry: Arc<ModelRegistry>) -> Result<Self, RegistryError> {
        let introspector = ModelIntrospector::new(registry.clone());
        let mut models = HashMap::new();
        for model in registry.models().filter(|m| !m.is_abstract) {
            models.insert(model.name.clone(), introspector.introspect(&model.name)?);
        }
        Ok(Self {
            models: Arc::new(models),
            state: Mutex::new(MemoryState::default()),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".into()))
    }

    /// Number of rows of a model, outside any transaction
    pub fn row_count(&self, model: &str) -> Result<usize, StoreError> {
        Ok(self.lock()?.tables.get(model).map_or(0, BTreeMap::len))
    }
}

impl MemoryStore {
    fn transaction(&self) -> Result<MemoryTransaction<'_>, StoreError> {
        Ok(MemoryTransaction {
            models: &self.models,
            state: self.lock()?,
            snapshot: None,
        })
    }
}

impl Store for MemoryStore {
    fn begin(&self) -> Result<Box<dyn Transaction + '_>, StoreError> {
        Ok(Box::new(self.transaction()?))
    }
}

struct MemoryTransaction<'a> {
    models: &'a HashMap<String, ModelMetadata>,
    state: MutexGuard<'a, MemoryState>,
    /// State before the first write; `None` for read-only or committed work
    snapshot: Option<MemoryState>,
}

impl Drop for MemoryTransaction<'_> {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            trace!("rolling back memory transaction");
            *self.state = snapshot;
        }
    }
}

impl MemoryTransaction<'_> {
    /// Keep the pre-transaction state before anything changes
    fn begin_write(&mut self) {
        if self.snapshot.is_none() {
            self.snapshot = Some(self.state.clone());
        }
    }

    fn meta(&self, model: &str) -> Result<&ModelMetadata, StoreError> {
        self.models
            .get(model)
            .ok_or_else(|| StoreError::UnknownModel(model.to_string()))
    }

    fn row(&self, model: &str, pk: &Pk) -> Option<&Record> {
        self.state.tables.get(model).and_then(|rows| rows.get(pk))
    }

    fn link_key(model: &str, field: &str) -> (String, String) {
        (model.to_string(), field.to_string())
    }

    /// Map relation names onto their columns and reject unknown keys
    fn normalize(&self, meta: &ModelMetadata, values: Record) -> Result<Record, StoreError> {
        let mut normalized = Record::new();
        for (key, value) in values {
            if let Some(rel) = meta.relationship(&key) {
                if !rel.relationship_type.is_to_one() {
                    return Err(StoreError::UnknownField {
                        model: meta.name.clone(),
                        field: key,
                    });
                }
                normalized.insert(rel.from_field.clone(), normalize_key(value));
            } else if meta.relationship_by_column(&key).is_some() {
                normalized.insert(key, normalize_key(value));
            } else if let Some(field) = meta.field(&key) {
                let value = if field.primary_key { normalize_key(value) } else { value };
                normalized.insert(key, value);
            } else {
                return Err(StoreError::UnknownField {
                    model: meta.name.clone(),
                    field: key,
                });
            }
        }
        Ok(normalized)
    }

    /// NOT NULL, FOREIGN KEY and UNIQUE checks against the current state
    fn check_constraints(&self, meta: &ModelMetadata, record: &Record, own_pk: Option<&Pk>) -> Result<(), StoreError> {
        let table = &meta.table_name;
        for field in meta.fields.values() {
            let value = record.get(&field.name).unwrap_or(&Value::Null);
            if value.is_null() && !field.null {
                return Err(StoreError::Integrity(format!(
                    "NOT NULL constraint failed: {table}.{}",
                    field.name
                )));
            }
            if field.unique && !value.is_null() && self.is_taken(meta, &field.name, value, own_pk) {
                return Err(StoreError::Integrity(format!(
                    "UNIQUE constraint failed: {table}.{}",
                    field.name
                )));
            }
        }
        for rel in meta.relationships.values() {
            if !rel.relationship_type.is_to_one() {
                continue;
            }
            let value = record.get(&rel.from_field).unwrap_or(&Value::Null);
            if value.is_null() {
                if !rel.null {
                    return Err(StoreError::Integrity(format!(
                        "NOT NULL constraint failed: {table}.{}",
                        rel.from_field
                    )));
                }
                continue;
            }
            let exists = Pk::from_value(value).is_some_and(|pk| self.row(&rel.related_model, &pk).is_some());
            if !exists {
                return Err(StoreError::Integrity(format!(
                    "FOREIGN KEY constraint failed: {table}.{}",
                    rel.from_field
                )));
            }
            if rel.relationship_type == RelationKind::ToOneUnique && self.is_taken(meta, &rel.from_field, value, own_pk) {
                return Err(StoreError::Integrity(format!(
                    "UNIQUE constraint failed: {table}.{}",
                    rel.from_field
                )));
            }
        }
        Ok(())
    }

    fn is_taken(&self, meta: &ModelMetadata, column: &str, value: &Value, own_pk: Option<&Pk>) -> bool {
        self.state.tables.get(&meta.name).is_some_and(|rows| {
            rows.iter()
                .any(|(pk, row)| Some(pk) != own_pk && row.get(column).is_some_and(|v| loose_eq(v, value)))
        })
    }

    fn next_pk(&mut self, model: &str) -> Pk {
        let seq = self.state.sequences.entry(model.to_string()).or_insert(0);
        *seq += 1;
        Pk::Int(*seq)
    }

    fn bump_sequence(&mut self, model: &str, pk: &Pk) {
        if let Pk::Int(n) = pk {
            let seq = self.state.sequences.entry(model.to_string()).or_insert(0);
            *seq = (*seq).max(*n);
        }
    }

    fn matches(&self, meta: &ModelMetadata, record: &Record, expr: &FilterExpr) -> Result<bool, StoreError> {
        Ok(match expr {
            FilterExpr::All => true,
            FilterExpr::And(items) => {
                for item in items {
                    if !self.matches(meta, record, item)? {
                        return Ok(false);
                    }
                }
                true
            }
            FilterExpr::Or(items) => {
                for item in items {
                    if self.matches(meta, record, item)? {
                        return Ok(true);
                    }
                }
                false
            }
            FilterExpr::Not(inner) => !self.matches(meta, record, inner)?,
            FilterExpr::Condition { path, lookup, value } => {
                let actual = self.resolve_path(meta, record, path)?;
                if *lookup == Lookup::IsNull {
                    let is_null = actual.iter().all(Value::is_null);
                    is_null == value.as_bool().unwrap_or(true)
                } else {
                    actual.iter().any(|a| compare(*lookup, a, value))
                }
            }
        })
    }

    /// Values reached by walking `path` from a row; relations fan out
    fn resolve_path(&self, meta: &ModelMetadata, record: &Record, path: &[String]) -> Result<Vec<Value>, StoreError> {
        let Some((head, rest)) = path.split_first() else {
            return Ok(Vec::new());
        };
        let pk = record.get(&meta.primary_key).and_then(Pk::from_value);
        let name = if head == "pk" { &meta.primary_key } else { head };

        if let Some(field) = meta.field(name) {
            if !rest.is_empty() {
                return Err(StoreError::UnknownField {
                    model: meta.name.clone(),
                    field: rest.join("__"),
                });
            }
            return Ok(vec![record.get(&field.name).cloned().unwrap_or(Value::Null)]);
        }

        // rows reached through the relation, plus their keys for a terminal segment
        let (target, rows): (&str, Vec<Record>) = if let Some(rel) = meta.relationship(name) {
            let rows = if rel.relationship_type.is_to_one() {
                let fk = record.get(&rel.from_field).and_then(Pk::from_value);
                if rest.is_empty() {
                    return Ok(vec![fk.map_or(Value::Null, |pk| pk.to_value())]);
                }
                fk.and_then(|fk| self.row(&rel.related_model, &fk).cloned())
                    .into_iter()
                    .collect()
            } else {
                let linked = match &pk {
                    Some(pk) => self.linked(&meta.name, pk, &rel.name),
                    None => Vec::new(),
                };
                if rest.is_empty() {
                    return Ok(linked.iter().map(Pk::to_value).collect());
                }
                linked
                    .iter()
                    .filter_map(|target| self.row(&rel.related_model, target).cloned())
                    .collect()
            };
            (rel.related_model.as_str(), rows)
        } else if let Some(reverse) = meta.reverse_relation(name) {
            let source = self.meta(&reverse.related_model)?;
            let rows = match &pk {
                Some(pk) => self.reverse_rows(source, &reverse.field, pk),
                None => Vec::new(),
            };
            if rest.is_empty() {
                return Ok(rows
                    .iter()
                    .filter_map(|row| row.get(&source.primary_key).cloned())
                    .collect());
            }
            (reverse.related_model.as_str(), rows)
        } else if meta.relationship_by_column(name).is_some() {
            return Ok(vec![record.get(name).cloned().unwrap_or(Value::Null)]);
        } else {
            return Err(StoreError::UnknownField {
                model: meta.name.clone(),
                field: name.to_string(),
            });
        };

        let target_meta = self.meta(target)?;
        let mut values = Vec::new();
        for row in &rows {
            values.extend(self.resolve_path(target_meta, row, rest)?);
        }
        Ok(values)
    }

    fn linked(&self, model: &str, pk: &Pk, field: &str) -> Vec<Pk> {
        self.state
            .links
            .get(&Self::link_key(model, field))
            .map(|pairs| {
                pairs
                    .iter()
                    .filter(|(source, _)| source == pk)
                    .map(|(_, target)| target.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Rows of `source` whose relation `field` points at `pk`
    fn reverse_rows(&self, source: &ModelMetadata, field: &str, pk: &Pk) -> Vec<Record> {
        let Some(rel) = source.relationship(field) else {
            return Vec::new();
        };
        let Some(rows) = self.state.tables.get(&source.name) else {
            return Vec::new();
        };
        if rel.relationship_type.is_to_one() {
            rows.values()
                .filter(|row| row.get(&rel.from_field).and_then(Pk::from_value).as_ref() == Some(pk))
                .cloned()
                .collect()
        } else {
            let key = Self::link_key(&source.name, field);
            let sources: Vec<&Pk> = self
                .state
                .links
                .get(&key)
                .map(|pairs| pairs.iter().filter(|(_, t)| t == pk).map(|(s, _)| s).collect())
                .unwrap_or_default();
            sources
                .into_iter()
                .filter_map(|s| rows.get(s).cloned())
                .collect()
        }
    }

    fn delete_cascade(&mut self, model: &str, pk: &Pk) -> Result<(), StoreError> {
        let meta = self.meta(model)?.clone();
        let removed = self
            .state
            .tables
            .get_mut(model)
            .and_then(|rows| rows.remove(pk));
        if removed.is_none() {
            return Err(StoreError::not_found(model, pk));
        }

        // links on either side of the deleted row
        for ((source_model, field), pairs) in self.state.links.iter_mut() {
            let target_model = self
                .models
                .get(source_model)
                .and_then(|m| m.relationship(field))
                .map(|rel| rel.related_model.as_str());
            pairs.retain(|(source, target)| {
                !((source_model == model && source == pk) || (target_model == Some(model) && target == pk))
            });
        }

        // rows pointing at it: cascade when the column is required, clear it otherwise
        for reverse in meta.reverse_relations.values() {
            let source = self.meta(&reverse.related_model)?.clone();
            let Some(rel) = source.relationship(&reverse.field) else {
                continue;
            };
            if !rel.relationship_type.is_to_one() {
                continue;
            }
            let dependents: Vec<Pk> = self
                .reverse_rows(&source, &reverse.field, pk)
                .iter()
                .filter_map(|row| row.get(&source.primary_key).and_then(Pk::from_value))
                .collect();
            for dependent in dependents {
                if rel.null {
                    if let Some(row) = self
                        .state
                        .tables
                        .get_mut(&source.name)
                        .and_then(|rows| rows.get_mut(&dependent))
                    {
                        row.insert(rel.from_field.clone(), Value::Null);
                    }
                } else {
                    self.delete_cascade(&source.name, &dependent)?;
                }
            }
        }
        Ok(())
    }
}

impl Transaction for MemoryTransaction<'_> {
    fn get(&mut self, model: &str, pk: &Pk) -> Result<Option<Record>, StoreError> {
        self.meta(model)?;
        Ok(self.row(model, pk).cloned())
    }

    fn query(&mut self, plan: &QueryPlan) -> Result<Vec<Record>, StoreError> {
        let meta = self.meta(&plan.model)?;
        let mut rows = Vec::new();
        if let Some(table) = self.state.tables.get(&plan.model) {
            for row in table.values() {
                if self.matches(meta, row, &plan.filter)? {
                    rows.push(row.clone());
                }
            }
        }
        if !plan.order_by.is_empty() {
            rows.sort_by(|a, b| {
                for order in &plan.order_by {
                    let field = if order.field == "pk" { &meta.primary_key } else { &order.field };
                    let ordering = order_values(
                        a.get(field).unwrap_or(&Value::Null),
                        b.get(field).unwrap_or(&Value::Null),
                    );
                    let ordering = if order.descending { ordering.reverse() } else { ordering };
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                Ordering::Equal
            });
        }
        let rows = rows.into_iter().skip(plan.offset);
        Ok(match plan.limit {
            Some(limit) => rows.take(limit).collect(),
            None => rows.collect(),
        })
    }

    fn count(&mut self, model: &str, filter: &FilterExpr) -> Result<usize, StoreError> {
        let meta = self.meta(model)?;
        let mut count = 0;
        if let Some(table) = self.state.tables.get(model) {
            for row in table.values() {
                if self.matches(meta, row, filter)? {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    fn insert(&mut self, model: &str, values: Record) -> Result<Record, StoreError> {
        self.begin_write();
        let meta = self.meta(model)?.clone();
        let mut record = self.normalize(&meta, values)?;

        let pk = match record.get(&meta.primary_key).and_then(Pk::from_value) {
            Some(pk) => {
                self.bump_sequence(model, &pk);
                pk
            }
            None => self.next_pk(model),
        };
        if self.row(model, &pk).is_some() {
            return Err(StoreError::Integrity(format!(
                "UNIQUE constraint failed: {}.{}",
                meta.table_name, meta.primary_key
            )));
        }
        record.insert(meta.primary_key.clone(), pk.to_value());

        let now = Utc::now();
        for field in meta.fields.values() {
            if field.has_auto_now || field.has_auto_now_add {
                record.insert(field.name.clone(), timestamp(&field.field_type, now));
                continue;
            }
            if record.get(&field.name).is_some_and(|v| !v.is_null()) {
                continue;
            }
            if let Some(default) = &field.default_value {
                record.insert(field.name.clone(), default.clone());
            } else if !field.null && field.field_type.is_textual() && !record.contains_key(&field.name) {
                // text columns store an empty string when omitted
                record.insert(field.name.clone(), Value::String(String::new()));
            } else {
                record.entry(field.name.clone()).or_insert(Value::Null);
            }
        }
        for rel in meta.relationships.values() {
            if rel.relationship_type.is_to_one() {
                record.entry(rel.from_field.clone()).or_insert(Value::Null);
            }
        }

        self.check_constraints(&meta, &record, None)?;
        trace!(model, %pk, "insert");
        self.state
            .tables
            .entry(model.to_string())
            .or_default()
            .insert(pk, record.clone());
        Ok(record)
    }

    fn update(&mut self, model: &str, pk: &Pk, values: Record) -> Result<Record, StoreError> {
        self.begin_write();
        let meta = self.meta(model)?.clone();
        let changes = self.normalize(&meta, values)?;
        let mut record = self
            .row(model, pk)
            .cloned()
            .ok_or_else(|| StoreError::not_found(model, pk))?;
        for (key, value) in changes {
            if key != meta.primary_key {
                record.insert(key, value);
            }
        }
        let now = Utc::now();
        for field in meta.fields.values().filter(|f| f.has_auto_now) {
            record.insert(field.name.clone(), timestamp(&field.field_type, now));
        }
        self.check_constraints(&meta, &record, Some(pk))?;
        trace!(model, %pk, "update");
        self.state
            .tables
            .entry(model.to_string())
            .or_default()
            .insert(pk.clone(), record.clone());
        Ok(record)
    }

    fn delete(&mut self, model: &str, pk: &Pk) -> Result<(), StoreError> {
        self.begin_write();
        trace!(model, %pk, "delete");
        self.delete_cascade(model, pk)
    }

    fn related(&mut self, model: &str, pk: &Pk, field: &str) -> Result<Vec<Pk>, StoreError> {
        let meta = self.meta(model)?;
        match meta.relationship(field) {
            Some(rel) if rel.relationship_type == RelationKind::ToMany => Ok(self.linked(model, pk, field)),
            _ => Err(StoreError::UnknownField {
                model: model.to_string(),
                field: field.to_string(),
            }),
        }
    }

    fn set_related(&mut self, model: &str, pk: &Pk, field: &str, targets: &[Pk]) -> Result<(), StoreError> {
        self.begin_write();
        let meta = self.meta(model)?;
        let rel = match meta.relationship(field) {
            Some(rel) if rel.relationship_type == RelationKind::ToMany => rel.clone(),
            _ => {
                return Err(StoreError::UnknownField {
                    model: model.to_string(),
                    field: field.to_string(),
                });
            }
        };
        if self.row(model, pk).is_none() {
            return Err(StoreError::not_found(model, pk));
        }
        for target in targets {
            if self.row(&rel.related_model, target).is_none() {
                return Err(StoreError::Integrity(format!(
                    "FOREIGN KEY constraint failed: {}_{}.{}_id",
                    meta.table_name,
                    field,
                    rel.related_model.to_snake_case()
                )));
            }
        }
        let pairs = self.state.links.entry(Self::link_key(model, field)).or_default();
        pairs.retain(|(source, _)| source != pk);
        for target in targets {
            let pair = (pk.clone(), target.clone());
            if !pairs.contains(&pair) {
                pairs.push(pair);
            }
        }
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        self.snapshot = None;
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        // restored by Drop
        Ok(())
    }
}

/// Key columns hold integers when the value parses as one
fn normalize_key(value: Value) -> Value {
    match Pk::from_value(&value) {
        Some(pk) => pk.to_value(),
        None => value,
    }
}

fn timestamp(kind: &FieldKind, now: chrono::DateTime<Utc>) -> Value {
    let text = match kind {
        FieldKind::Date => now.format("%Y-%m-%d").to_string(),
        FieldKind::Time => now.format("%H:%M:%S%.6f").to_string(),
        _ => now.to_rfc3339(),
    };
    Value::String(text)
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Equality that treats `3` and `"3"` alike, like a database column would
fn loose_eq(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) if a.is_number() || b.is_number() => x == y,
        _ => false,
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn order_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => match (a, b) {
            (Value::Number(_), _) | (_, Value::Number(_)) => match (as_number(a), as_number(b)) {
                (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
                _ => as_text(a).cmp(&as_text(b)),
            },
            _ => as_text(a).cmp(&as_text(b)),
        },
    }
}

/// An invalid pattern matches nothing
fn regex_match(actual: &Value, pattern: &Value, case_insensitive: bool) -> bool {
    RegexBuilder::new(&as_text(pattern))
        .case_insensitive(case_insensitive)
        .build()
        .is_ok_and(|re| re.is_match(&as_text(actual)))
}

fn compare(lookup: Lookup, actual: &Value, expected: &Value) -> bool {
    match lookup {
        Lookup::Exact => loose_eq(actual, expected),
        Lookup::IExact => as_text(actual).to_lowercase() == as_text(expected).to_lowercase(),
        Lookup::Contains => !actual.is_null() && as_text(actual).contains(&as_text(expected)),
        Lookup::IContains => {
            !actual.is_null() && as_text(actual).to_lowercase().contains(&as_text(expected).to_lowercase())
        }
        Lookup::StartsWith => !actual.is_null() && as_text(actual).starts_with(&as_text(expected)),
        Lookup::EndsWith => !actual.is_null() && as_text(actual).ends_with(&as_text(expected)),
        Lookup::Regex => !actual.is_null() && regex_match(actual, expected, false),
        Lookup::IRegex => !actual.is_null() && regex_match(actual, expected, true),
        Lookup::In => expected
            .as_array()
            .is_some_and(|items| items.iter().any(|item| loose_eq(actual, item))),
        Lookup::Gt => !actual.is_null() && order_values(actual, expected) == Ordering::Greater,
        Lookup::Gte => !actual.is_null() && order_values(actual, expected) != Ordering::Less,
        Lookup::Lt => !actual.is_null() && order_values(actual, expected) == Ordering::Less,
        Lookup::Lte => !actual.is_null() && order_values(actual, expected) != Ordering::Greater,
        Lookup::Range => match expected.as_array().map(Vec::as_slice) {
            Some([low, high]) => {
                !actual.is_null()
                    && order_values(actual, low) != Ordering::Less
                    && order_values(actual, high) != Ordering::Greater
            }
            _ => false,
        },
        Lookup::IsNull => actual.is_null() == expected.as_bool().unwrap_or(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::OrderBy;
    use crate::test_fixtures::{blog_store, record};
    use serde_json::json;

    #[test]
    fn test_insert_applies_defaults_and_timestamps() {
        let store = blog_store();
        let mut tx = store.begin().unwrap();
        let post = tx
            .insert("Post", record(json!({ "title": "Hello", "category": "1" })))
            .unwrap();
        assert_eq!(post["category_id"], json!(1));
        assert_eq!(post["published"], json!(false));
        assert_eq!(post["body"], json!(""));
        assert!(post["created_at"].is_string());
        assert!(post["id"].is_number());
        tx.commit().unwrap();
    }

    #[test]
    fn test_constraint_messages() {
        let store = blog_store();
        let mut tx = store.begin().unwrap();
        let err = tx.insert("Post", record(json!({ "title": "x" }))).unwrap_err();
        assert_eq!(err.to_string(), "NOT NULL constraint failed: blog_post.category_id");

        let err = tx
            .insert("Post", record(json!({ "title": "x", "category": 999 })))
            .unwrap_err();
        assert_eq!(err.to_string(), "FOREIGN KEY constraint failed: blog_post.category_id");

        let err = tx.insert("Tag", record(json!({ "name": "rust" }))).unwrap_err();
        assert_eq!(err.to_string(), "UNIQUE constraint failed: blog_tag.name");
    }

    #[test]
    fn test_drop_rolls_back() {
        let store = blog_store();
        let before = store.row_count("Tag").unwrap();
        {
            let mut tx = store.begin().unwrap();
            tx.insert("Tag", record(json!({ "name": "temporary" }))).unwrap();
        }
        assert_eq!(store.row_count("Tag").unwrap(), before);

        let mut tx = store.begin().unwrap();
        tx.insert("Tag", record(json!({ "name": "kept" }))).unwrap();
        tx.commit().unwrap();
        assert_eq!(store.row_count("Tag").unwrap(), before + 1);
    }

    #[test]
    fn test_snapshot_taken_on_first_write() {
        let store = blog_store();
        let mut tx = store.transaction().unwrap();
        tx.get("Tag", &Pk::Int(1)).unwrap();
        tx.query(&QueryPlan::new("Category")).unwrap();
        assert!(tx.snapshot.is_none());

        tx.insert("Tag", record(json!({ "name": "later" }))).unwrap();
        assert_eq!(tx.snapshot.as_ref().map(|s| s.tables["Tag"].len()), Some(3));
        drop(tx);
        assert_eq!(store.row_count("Tag").unwrap(), 3);
    }

    #[test]
    fn test_filter_across_relations() {
        let store = blog_store();
        let mut tx = store.begin().unwrap();
        let post = tx
            .insert("Post", record(json!({ "title": "Rust news", "category": 1 })))
            .unwrap();
        let pk = Pk::from_value(&post["id"]).unwrap();
        tx.set_related("Post", &pk, "tags", &[Pk::Int(1), Pk::Int(2)]).unwrap();
        tx.insert("Post", record(json!({ "title": "Other", "category": 2 })))
            .unwrap();

        let plan = QueryPlan::new("Post").filter(FilterExpr::Condition {
            path: vec!["category".into(), "name".into()],
            lookup: Lookup::IExact,
            value: json!("TECH"),
        });
        let rows = tx.query(&plan).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["title"], json!("Rust news"));

        let by_tag = QueryPlan::new("Post").filter(FilterExpr::eq("tags", json!(2)));
        assert_eq!(tx.query(&by_tag).unwrap().len(), 1);

        let tagged = QueryPlan::new("Tag").filter(FilterExpr::Condition {
            path: vec!["post_set".into(), "title".into()],
            lookup: Lookup::StartsWith,
            value: json!("Rust"),
        });
        assert_eq!(tx.query(&tagged).unwrap().len(), 2);
    }

    #[test]
    fn test_regex_lookups() {
        let store = blog_store();
        let mut tx = store.begin().unwrap();
        let by_name = |lookup, pattern: &str| {
            QueryPlan::new("Tag").filter(FilterExpr::Condition {
                path: vec!["name".into()],
                lookup,
                value: json!(pattern),
            })
        };
        assert_eq!(tx.query(&by_name(Lookup::Regex, "^(rust|python)$")).unwrap().len(), 2);
        assert_eq!(tx.query(&by_name(Lookup::Regex, "^RUST$")).unwrap().len(), 0);
        assert_eq!(tx.query(&by_name(Lookup::IRegex, "^RUST$")).unwrap().len(), 1);
        assert!(tx.query(&by_name(Lookup::Regex, "(")).unwrap().is_empty());
    }

    #[test]
    fn test_query_order_and_slice() {
        let store = blog_store();
        let mut tx = store.begin().unwrap();
        let plan = QueryPlan::new("Category")
            .order_by(vec![OrderBy::parse("-name")])
            .slice(1, Some(1));
        let rows = tx.query(&plan).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], json!("Science"));
    }

    #[test]
    fn test_delete_cascades_and_clears_links() {
        let store = blog_store();
        let mut tx = store.begin().unwrap();
        let post = tx
            .insert("Post", record(json!({ "title": "Doomed", "category": 3 })))
            .unwrap();
        let pk = Pk::from_value(&post["id"]).unwrap();
        tx.set_related("Post", &pk, "tags", &[Pk::Int(1)]).unwrap();
        tx.insert("Comment", record(json!({ "post": pk.to_value(), "content": "bye" })))
            .unwrap();

        tx.delete("Category", &Pk::Int(3)).unwrap();
        assert!(tx.get("Post", &pk).unwrap().is_none());
        assert_eq!(tx.count("Comment", &FilterExpr::All).unwrap(), 0);
        assert!(tx.related("Tag", &Pk::Int(1), "post_set").is_err());
        let tagged = QueryPlan::new("Tag").filter(FilterExpr::Condition {
            path: vec!["post_set".into()],
            lookup: Lookup::IsNull,
            value: json!(false),
        });
        assert!(tx.query(&tagged).unwrap().is_empty());
    }

    #[test]
    fn test_missing_row() {
        let store = blog_store();
        let mut tx = store.begin().unwrap();
        let err = tx.fetch("Post", &Pk::Int(77)).unwrap_err();
        assert_eq!(err, StoreError::not_found("Post", &Pk::Int(77)));
        assert!(tx.delete("Post", &Pk::Int(77)).is_err());
    }
}

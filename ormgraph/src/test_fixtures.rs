//! Blog models shared by the unit tests

use std::sync::Arc;

use serde_json::{Value, json};

use crate::methods::{MethodError, MethodOutput, ModelMethod};
use crate::model::{FieldDef, FieldKind, MethodDef, MethodReturn, ModelDef, ModelRegistry, Record};
use crate::store::{MemoryStore, Store, Transaction};

/// Marks a post as published
pub struct PublishPost;

impl ModelMethod for PublishPost {
    fn call(&self, _tx: &mut dyn Transaction, instance: &mut Record, _args: &Record) -> Result<MethodOutput, MethodError> {
        if instance.get("published") == Some(&Value::Bool(true)) {
            return Err(MethodError::Failed("post is already published".into()));
        }
        instance.insert("published".into(), Value::Bool(true));
        Ok(MethodOutput::Instance)
    }
}

/// Adds a comment, optionally failing afterwards
pub struct AddComment;

impl ModelMethod for AddComment {
    fn call(&self, tx: &mut dyn Transaction, instance: &mut Record, args: &Record) -> Result<MethodOutput, MethodError> {
        let comment = tx.insert(
            "Comment",
            record(json!({
                "post": instance.get("id").cloned().unwrap_or(Value::Null),
                "content": args.get("content").cloned().unwrap_or(Value::Null),
            })),
        )?;
        if args.get("fail").and_then(Value::as_bool) == Some(true) {
            return Err(MethodError::Failed("comment rejected".into()));
        }
        Ok(MethodOutput::Value(comment["id"].clone()))
    }
}

pub fn category() -> ModelDef {
    ModelDef::new("blog", "Category")
        .field(FieldDef::primary("id"))
        .field(FieldDef::new("name", FieldKind::Char).max_length(100).unique())
        .field(FieldDef::new("description", FieldKind::Text).blank(true))
        .field(FieldDef::new("post_set", FieldKind::Reverse))
}

pub fn post() -> ModelDef {
    ModelDef::new("blog", "Post")
        .field(FieldDef::primary("id"))
        .field(FieldDef::new("title", FieldKind::Char).max_length(200))
        .field(FieldDef::new("body", FieldKind::Text).blank(true))
        .field(FieldDef::new("published", FieldKind::Boolean).default_value(json!(false)))
        .field(FieldDef::new("created_at", FieldKind::DateTime).auto_now_add())
        .field(FieldDef::new("updated_at", FieldKind::DateTime).auto_now())
        .field(FieldDef::relation("category", FieldKind::ForeignKey, "Category"))
        .field(FieldDef::relation("tags", FieldKind::ManyToMany, "Tag").blank(true))
        .method(
            MethodDef::new("publish")
                .exposed()
                .returns(MethodReturn::Instance)
                .permission("blog.change_post")
                .handler(Arc::new(PublishPost)),
        )
        .method(
            MethodDef::new("add_comment")
                .exposed()
                .param("content", "String")
                .param("fail", "Option<bool>")
                .returns(MethodReturn::Value)
                .handler(Arc::new(AddComment)),
        )
        .property(
            "title_length",
            FieldKind::Integer,
            Arc::new(|row: &Record| {
                let len = row.get("title").and_then(Value::as_str).map_or(0, |t| t.chars().count());
                Value::from(len)
            }),
        )
}

pub fn comment() -> ModelDef {
    ModelDef::new("blog", "Comment")
        .field(FieldDef::primary("id"))
        .field(FieldDef::relation("post", FieldKind::ForeignKey, "Post").related_name("comments"))
        .field(FieldDef::new("content", FieldKind::Text))
}

pub fn tag() -> ModelDef {
    ModelDef::new("blog", "Tag")
        .field(FieldDef::primary("id"))
        .field(FieldDef::new("name", FieldKind::Char).max_length(50).unique())
}

pub fn blog_registry() -> ModelRegistry {
    ModelRegistry::from_models([category(), post(), comment(), tag()]).unwrap()
}

pub fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}

/// Store with categories Tech, Science, Art and tags rust, graphql, python
pub fn blog_store() -> MemoryStore {
    seeded_store(Arc::new(blog_registry()))
}

pub fn seeded_store(registry: Arc<ModelRegistry>) -> MemoryStore {
    let store = MemoryStore::new(registry).unwrap();
    let mut tx = store.begin().unwrap();
    for name in ["Tech", "Science", "Art"] {
        tx.insert("Category", record(json!({ "name": name }))).unwrap();
    }
    for name in ["rust", "graphql", "python"] {
        tx.insert("Tag", record(json!({ "name": name }))).unwrap();
    }
    tx.commit().unwrap();
    store
}

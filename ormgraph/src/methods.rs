//! Business methods exposed as mutations

use std::collections::HashSet;

use heck::{ToSnakeCase, ToUpperCamelCase};
use serde_json::Value;

use crate::introspector::ModelMetadata;
use crate::model::{MethodDef, Record};
use crate::store::{StoreError, Transaction};
use crate::types::{ArgDef, TypeRef};

/// What a method call produced
#[derive(Debug, Clone, PartialEq)]
pub enum MethodOutput {
    /// The instance passed in, possibly modified; it is saved afterwards
    Instance,
    Value(Value),
    Unit,
}

#[derive(Debug, thiserror::Error)]
pub enum MethodError {
    #[error("{0}")]
    Failed(String),

    #[error("You do not have permission to perform this action")]
    PermissionDenied,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Implementation of a model method
pub trait ModelMethod: Send + Sync {
    fn call(&self, tx: &mut dyn Transaction, instance: &mut Record, args: &Record) -> Result<MethodOutput, MethodError>;
}

/// Caller identity attached to a request
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub user: Option<String>,
    pub permissions: HashSet<String>,
    pub is_superuser: bool,
}

impl RequestContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user(name: impl Into<String>) -> Self {
        Self {
            user: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.insert(permission.into());
        self
    }

    pub fn superuser(mut self) -> Self {
        self.is_superuser = true;
        self
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.is_superuser || (self.user.is_some() && self.permissions.contains(permission))
    }
}

/// GraphQL type for a parameter annotation
///
/// Integer and float primitives, `bool` and strings map to their scalars,
/// `Option<T>` is nullable and `Vec<T>` a list. Anything else is a `String`.
pub fn annotation_type(annotation: &str) -> TypeRef {
    let annotation = annotation.trim();
    if let Some(inner) = generic_arg(annotation, "Option") {
        return annotation_type(inner).nullable();
    }
    if let Some(inner) = generic_arg(annotation, "Vec") {
        return TypeRef::List(Box::new(annotation_type(inner))).non_null();
    }
    if let Some(inner) = annotation.strip_prefix("&[").and_then(|rest| rest.strip_suffix(']')) {
        return TypeRef::List(Box::new(annotation_type(inner))).non_null();
    }
    let scalar = match annotation {
        "i8" | "i16" | "i32" | "i64" | "isize" | "u8" | "u16" | "u32" | "u64" | "usize" => "Int",
        "f32" | "f64" => "Float",
        "bool" => "Boolean",
        _ => "String",
    };
    TypeRef::named_nn(scalar)
}

fn generic_arg<'a>(annotation: &'a str, wrapper: &str) -> Option<&'a str> {
    annotation
        .strip_prefix(wrapper)?
        .trim_start()
        .strip_prefix('<')?
        .strip_suffix('>')
}

/// Root mutation field generated for a model method
#[derive(Debug, Clone)]
pub struct MethodMutation {
    pub field_name: String,
    pub payload_name: String,
    pub model: String,
    pub args: Vec<ArgDef>,
    pub method: MethodDef,
}

/// Describe the mutation for an exposed method: `id` plus one argument per parameter
pub fn convert_method_to_mutation(meta: &ModelMetadata, method: &MethodDef) -> MethodMutation {
    let mut args = vec![ArgDef::new("id", TypeRef::named_nn("ID"))];
    for param in &method.params {
        let ty = annotation_type(&param.annotation);
        let arg = match &param.default {
            Some(default) => ArgDef::new(param.name.clone(), ty.nullable()).with_default(default.clone()),
            None => ArgDef::new(param.name.clone(), ty),
        };
        args.push(arg);
    }
    MethodMutation {
        field_name: format!("{}_{}", meta.name.to_snake_case(), method.name.to_snake_case()),
        payload_name: format!("{}{}Payload", meta.name, method.name.to_upper_camel_case()),
        model: meta.name.clone(),
        args,
        method: method.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::introspector::ModelIntrospector;
    use crate::test_fixtures::blog_registry;
    use std::sync::Arc;

    #[test]
    fn test_annotation_mapping() {
        assert_eq!(annotation_type("i64").to_string(), "Int!");
        assert_eq!(annotation_type("u8").to_string(), "Int!");
        assert_eq!(annotation_type("f32").to_string(), "Float!");
        assert_eq!(annotation_type("bool").to_string(), "Boolean!");
        assert_eq!(annotation_type("&str").to_string(), "String!");
        assert_eq!(annotation_type("Option<String>").to_string(), "String");
        assert_eq!(annotation_type("Vec<i32>").to_string(), "[Int!]!");
        assert_eq!(annotation_type("Option<Vec<bool>>").to_string(), "[Boolean!]");
        assert_eq!(annotation_type("Result<i32, String>").to_string(), "String!");
        assert_eq!(annotation_type("HashMap<String, i32>").to_string(), "String!");
    }

    #[test]
    fn test_convert_method_to_mutation() {
        let meta = ModelIntrospector::new(Arc::new(blog_registry()))
            .introspect("Post")
            .unwrap();
        let method = &meta.methods["add_comment"];
        let mutation = convert_method_to_mutation(&meta, method);
        assert_eq!(mutation.field_name, "post_add_comment");
        assert_eq!(mutation.payload_name, "PostAddCommentPayload");
        let args: Vec<String> = mutation.args.iter().map(|a| format!("{}: {}", a.name, a.ty)).collect();
        assert_eq!(args, vec!["id: ID!", "content: String!", "fail: Boolean"]);
    }

    #[test]
    fn test_permissions() {
        assert!(!RequestContext::anonymous().has_permission("blog.change_post"));
        assert!(!RequestContext::user("ana").has_permission("blog.change_post"));
        assert!(
            RequestContext::user("ana")
                .with_permission("blog.change_post")
                .has_permission("blog.change_post")
        );
        assert!(RequestContext::anonymous().superuser().has_permission("anything"));
    }
}

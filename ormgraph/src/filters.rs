//! Filter input types
//!
//! Generates `{Model}Filter` input types in the `field__lookup` style and
//! parses filter arguments back into a [`FilterExpr`] for the store.
//!
//! ```graphql
//! input PostFilter {
//!   title: String
//!   title__icontains: String
//!   category__name__iexact: String
//!   and: [PostFilter!]
//!   or: [PostFilter!]
//!   not: PostFilter
//! }
//! ```

use serde_json::Value;

use crate::error::RegistryError;
use crate::introspector::{FieldInfo, ModelIntrospector, ModelMetadata};
use crate::model::{FieldKind, Record};
use crate::settings::TypeGeneratorSettings;
use crate::store::{FilterExpr, Lookup};
use crate::types::scalars::{self, Scalar};
use crate::types::{InputFieldDef, InputRole, InputTypeDef, TypeRef};

const TEXT_LOOKUPS: &[Lookup] = &[
    Lookup::IExact,
    Lookup::Contains,
    Lookup::IContains,
    Lookup::StartsWith,
    Lookup::EndsWith,
    Lookup::Regex,
    Lookup::IRegex,
    Lookup::In,
    Lookup::IsNull,
];

const ORDERED_LOOKUPS: &[Lookup] = &[
    Lookup::In,
    Lookup::Gt,
    Lookup::Gte,
    Lookup::Lt,
    Lookup::Lte,
    Lookup::Range,
    Lookup::IsNull,
];

const KEY_LOOKUPS: &[Lookup] = &[Lookup::In, Lookup::IsNull];

const EQUALITY_LOOKUPS: &[Lookup] = &[Lookup::IsNull];

/// Error raised while reading a filter argument
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FilterError {
    #[error("filter '{0}' expects a list of filter objects")]
    InvalidCombinator(String),

    #[error("filter 'not' expects a filter object")]
    InvalidNot,
}

/// Lookups offered beside plain equality for a field
pub fn lookups_for(field: &FieldInfo) -> &'static [Lookup] {
    if field.primary_key {
        return if field.field_type.is_integer() { ORDERED_LOOKUPS } else { KEY_LOOKUPS };
    }
    match &field.field_type {
        kind if kind.is_textual() => TEXT_LOOKUPS,
        kind if kind.is_integer() => ORDERED_LOOKUPS,
        FieldKind::Float
        | FieldKind::Decimal
        | FieldKind::Date
        | FieldKind::DateTime
        | FieldKind::Time
        | FieldKind::Duration => ORDERED_LOOKUPS,
        FieldKind::Custom(_) => TEXT_LOOKUPS,
        _ => EQUALITY_LOOKUPS,
    }
}

/// Builds `{Model}Filter` input types
pub struct AdvancedFilterGenerator<'a> {
    introspector: &'a ModelIntrospector,
    settings: &'a TypeGeneratorSettings,
    max_depth: usize,
}

impl<'a> AdvancedFilterGenerator<'a> {
    pub fn new(introspector: &'a ModelIntrospector, settings: &'a TypeGeneratorSettings, max_depth: usize) -> Self {
        Self {
            introspector,
            settings,
            max_depth: max_depth.max(1),
        }
    }

    pub fn generate_filter_type(&self, model: &str) -> Result<InputTypeDef, RegistryError> {
        let meta = self.introspector.introspect(model)?;
        let name = format!("{}Filter", meta.name);
        let mut fields = Vec::new();
        self.add_fields(&meta, &[], &mut fields)?;

        fields.push(InputFieldDef::new("and", TypeRef::named_nn_list(&name), InputRole::Filter));
        fields.push(InputFieldDef::new("or", TypeRef::named_nn_list(&name), InputRole::Filter));
        fields.push(InputFieldDef::new("not", TypeRef::named(&name), InputRole::Filter));

        Ok(InputTypeDef {
            name,
            model: Some(meta.name.clone()),
            description: Some(format!("Filter for {} rows", meta.name)),
            fields,
        })
    }

    fn add_fields(&self, meta: &ModelMetadata, prefix: &[String], fields: &mut Vec<InputFieldDef>) -> Result<(), RegistryError> {
        for field in meta.fields.values() {
            if !self.settings.is_field_exposed(&meta.name, &field.name) {
                continue;
            }
            let scalar = scalars::scalar_for(&field.field_type, field.primary_key, &self.settings.custom_scalars);
            let path = join_path(prefix, &field.name);
            fields.push(InputFieldDef::new(path.clone(), TypeRef::named(scalar.name()), InputRole::Filter));
            for lookup in lookups_for(field) {
                fields.push(lookup_field(&path, *lookup, scalar));
            }
        }

        for rel in meta.relationships.values() {
            if !self.settings.is_field_exposed(&meta.name, &rel.name) {
                continue;
            }
            let path = join_path(prefix, &rel.name);
            fields.push(InputFieldDef::new(path.clone(), TypeRef::named("ID"), InputRole::Filter));
            for lookup in KEY_LOOKUPS {
                fields.push(lookup_field(&path, *lookup, Scalar::Id));
            }
            if prefix.len() + 1 < self.max_depth {
                let target = self.introspector.introspect(&rel.related_model)?;
                let mut nested = prefix.to_vec();
                nested.push(rel.name.clone());
                self.add_fields(&target, &nested, fields)?;
            }
        }
        Ok(())
    }
}

fn join_path(prefix: &[String], name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}__{name}", prefix.join("__"))
    }
}

fn lookup_field(path: &str, lookup: Lookup, scalar: Scalar) -> InputFieldDef {
    let ty = match lookup {
        Lookup::IsNull => TypeRef::named("Boolean"),
        Lookup::In | Lookup::Range => TypeRef::named_nn_list(scalar.name()),
        _ => TypeRef::named(scalar.name()),
    };
    InputFieldDef::new(format!("{path}__{}", lookup.as_str()), ty, InputRole::Filter)
}

/// Read a filter argument into an expression; null entries are ignored
pub fn parse_filter(input: &Record) -> Result<FilterExpr, FilterError> {
    let mut conditions = Vec::new();
    for (key, value) in input {
        if value.is_null() {
            continue;
        }
        match key.as_str() {
            "and" | "or" => {
                let items = value
                    .as_array()
                    .ok_or_else(|| FilterError::InvalidCombinator(key.clone()))?;
                let mut parsed = Vec::new();
                for item in items {
                    let item = item
                        .as_object()
                        .ok_or_else(|| FilterError::InvalidCombinator(key.clone()))?;
                    parsed.push(parse_filter(item)?);
                }
                conditions.push(if key == "and" {
                    FilterExpr::And(parsed)
                } else {
                    FilterExpr::Or(parsed)
                });
            }
            "not" => {
                let inner = value.as_object().ok_or(FilterError::InvalidNot)?;
                conditions.push(FilterExpr::Not(Box::new(parse_filter(inner)?)));
            }
            _ => conditions.push(parse_condition(key, value)),
        }
    }
    Ok(match conditions.len() {
        0 => FilterExpr::All,
        1 => conditions.remove(0),
        _ => FilterExpr::And(conditions),
    })
}

fn parse_condition(key: &str, value: &Value) -> FilterExpr {
    let mut path: Vec<String> = key.split("__").map(str::to_string).collect();
    let lookup = match path.last().and_then(|last| Lookup::parse(last)) {
        Some(lookup) if path.len() > 1 => {
            path.pop();
            lookup
        }
        _ => Lookup::Exact,
    };
    FilterExpr::Condition {
        path,
        lookup,
        value: value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::{blog_registry, record};
    use serde_json::json;
    use std::sync::Arc;

    fn filter_type(model: &str, depth: usize) -> InputTypeDef {
        let introspector = ModelIntrospector::new(Arc::new(blog_registry()));
        let settings = TypeGeneratorSettings::default();
        AdvancedFilterGenerator::new(&introspector, &settings, depth)
            .generate_filter_type(model)
            .unwrap()
    }

    #[test]
    fn test_filter_type_fields() {
        let filter = filter_type("Post", 2);
        assert_eq!(filter.name, "PostFilter");
        assert_eq!(filter.field("title").unwrap().ty.to_string(), "String");
        assert!(filter.field("title__icontains").is_some());
        assert_eq!(filter.field("title__iregex").unwrap().ty.to_string(), "String");
        assert!(filter.field("title__gt").is_none());
        assert_eq!(filter.field("id__in").unwrap().ty.to_string(), "[ID!]");
        assert_eq!(filter.field("created_at__range").unwrap().ty.to_string(), "[DateTime!]");
        assert_eq!(filter.field("published__isnull").unwrap().ty.to_string(), "Boolean");
        assert!(filter.field("category__name__icontains").is_some());
        assert!(filter.field("tags__name").is_some());
        assert_eq!(filter.field("or").unwrap().ty.to_string(), "[PostFilter!]");
    }

    #[test]
    fn test_filter_depth_limits_paths() {
        let shallow = filter_type("Comment", 1);
        assert!(shallow.field("post").is_some());
        assert!(shallow.field("post__title").is_none());

        let deep = filter_type("Comment", 2);
        assert!(deep.field("post__title").is_some());
        assert!(deep.field("post__category").is_some());
        assert!(deep.field("post__category__name").is_none());
    }

    #[test]
    fn test_parse_filter() {
        let expr = parse_filter(&record(json!({
            "title__icontains": "rust",
            "category__name": "Tech",
            "or": [{ "published": true }, { "id__in": [1, 2] }],
            "body": null
        })))
        .unwrap();
        let FilterExpr::And(items) = expr else {
            panic!("expected conjunction");
        };
        assert_eq!(items.len(), 3);
        assert!(items.contains(&FilterExpr::Condition {
            path: vec!["title".into()],
            lookup: Lookup::IContains,
            value: json!("rust"),
        }));
        assert!(items.contains(&FilterExpr::Condition {
            path: vec!["category".into(), "name".into()],
            lookup: Lookup::Exact,
            value: json!("Tech"),
        }));
    }

    #[test]
    fn test_parse_filter_rejects_bad_combinator() {
        let err = parse_filter(&record(json!({ "and": { "title": "x" } }))).unwrap_err();
        assert_eq!(err, FilterError::InvalidCombinator("and".into()));
        assert_eq!(parse_filter(&Record::new()).unwrap(), FilterExpr::All);
    }
}

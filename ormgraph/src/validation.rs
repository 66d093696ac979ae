//! Model-level validation run before every write

use std::fmt;

use serde_json::Value;

use crate::introspector::{FieldInfo, ModelMetadata};
use crate::model::{FieldKind, Record};

/// One rejected field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Every field a candidate row fails on
#[derive(Debug, Clone, PartialEq, Eq, Default, thiserror::Error)]
pub struct ValidationError {
    pub errors: Vec<FieldError>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, error) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", error.field, error.message)?;
        }
        Ok(())
    }
}

impl ValidationError {
    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            errors: vec![FieldError {
                field: field.into(),
                message: message.into(),
            }],
        }
    }

    pub fn push(&mut self, field: &str, message: String) {
        self.errors.push(FieldError {
            field: field.to_string(),
            message,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.errors.iter().map(|e| e.field.as_str())
    }
}

/// Field-level checks a model applies to a row before it is saved
pub struct ModelValidator;

impl ModelValidator {
    /// Validate a complete candidate row
    ///
    /// Missing values are read as the field default, or an empty string for
    /// text columns, the same way the store fills them in.
    pub fn clean(meta: &ModelMetadata, record: &Record) -> Result<(), ValidationError> {
        let mut errors = ValidationError::default();
        for field in meta.fields.values() {
            if field.primary_key || field.has_auto_now || field.has_auto_now_add {
                continue;
            }
            let value = effective_value(field, record);
            if let Some(message) = check_field(field, &value) {
                errors.push(&field.name, message);
            }
        }
        for rel in meta.relationships.values() {
            if !rel.relationship_type.is_to_one() || rel.null || rel.has_default {
                continue;
            }
            let value = record
                .get(&rel.from_field)
                .or_else(|| record.get(&rel.name))
                .unwrap_or(&Value::Null);
            if value.is_null() {
                errors.push(&rel.name, "This field cannot be null.".to_string());
            }
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

fn effective_value(field: &FieldInfo, record: &Record) -> Value {
    match record.get(&field.name) {
        Some(value) => value.clone(),
        None => match &field.default_value {
            Some(default) => default.clone(),
            None if field.field_type.is_textual() && !field.null => Value::String(String::new()),
            None => Value::Null,
        },
    }
}

fn check_field(field: &FieldInfo, value: &Value) -> Option<String> {
    if value.is_null() {
        return (!field.null).then(|| "This field cannot be null.".to_string());
    }
    if is_empty(value) {
        return (!field.blank).then(|| "This field cannot be blank.".to_string());
    }
    if let Some(message) = check_kind(&field.field_type, value) {
        return Some(message);
    }
    if let (Some(max), Some(text)) = (field.max_length, value.as_str()) {
        let len = text.chars().count();
        if len > max {
            return Some(format!(
                "Ensure this value has at most {max} characters (it has {len})."
            ));
        }
    }
    if !field.choices.is_empty() {
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if !field.choices.contains(&text) {
            return Some(format!("Value '{text}' is not a valid choice."));
        }
    }
    None
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn check_kind(kind: &FieldKind, value: &Value) -> Option<String> {
    let valid = match kind {
        kind if kind.is_integer() => match value {
            Value::Number(n) => n.is_i64() || n.is_u64(),
            Value::String(s) => s.parse::<i64>().is_ok(),
            _ => false,
        },
        FieldKind::Float | FieldKind::Decimal => match value {
            Value::Number(_) => true,
            Value::String(s) => s.parse::<f64>().is_ok(),
            _ => false,
        },
        FieldKind::Boolean => value.is_boolean(),
        _ => return None,
    };
    if valid {
        return None;
    }
    Some(match kind {
        FieldKind::Boolean => format!("'{}' value must be either True or False.", display(value)),
        FieldKind::Float => format!("'{}' value must be a float.", display(value)),
        FieldKind::Decimal => format!("'{}' value must be a decimal number.", display(value)),
        _ => format!("'{}' value must be an integer.", display(value)),
    })
}

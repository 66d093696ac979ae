//! Persistence boundary
//!
//! The engine never talks to a database directly. Everything it reads or
//! writes goes through a [`Transaction`] opened on a [`Store`]; a transaction
//! that is dropped without [`Transaction::commit`] rolls back.

pub mod memory;

use std::fmt;

use serde_json::Value;

use crate::model::Record;

pub use memory::MemoryStore;

/// Primary key value
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Pk {
    Int(i64),
    Str(String),
}

impl Pk {
    /// Read a key out of a JSON value; numeric strings become integers
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Pk::Int),
            Value::String(s) if s.is_empty() => None,
            Value::String(s) => Some(s.parse::<i64>().map(Pk::Int).unwrap_or_else(|_| Pk::Str(s.clone()))),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Pk::Int(n) => Value::from(*n),
            Pk::Str(s) => Value::String(s.clone()),
        }
    }
}

impl fmt::Display for Pk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pk::Int(n) => write!(f, "{n}"),
            Pk::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Pk {
    fn from(value: i64) -> Self {
        Pk::Int(value)
    }
}

/// Error raised by a store backend
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// No row with the given key
    #[error("{model} matching query does not exist (pk={pk})")]
    NotFound { model: String, pk: String },

    /// Constraint violation, worded like the database reports it
    #[error("{0}")]
    Integrity(String),

    #[error("unknown model '{0}'")]
    UnknownModel(String),

    #[error("{model} has no field named '{field}'")]
    UnknownField { model: String, field: String },

    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn not_found(model: &str, pk: &Pk) -> Self {
        StoreError::NotFound {
            model: model.to_string(),
            pk: pk.to_string(),
        }
    }
}

/// Field lookup of a filter condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lookup {
    Exact,
    IExact,
    Contains,
    IContains,
    StartsWith,
    EndsWith,
    Regex,
    IRegex,
    In,
    Gt,
    Gte,
    Lt,
    Lte,
    IsNull,
    Range,
}

impl Lookup {
    pub const ALL: [Lookup; 15] = [
        Lookup::Exact,
        Lookup::IExact,
        Lookup::Contains,
        Lookup::IContains,
        Lookup::StartsWith,
        Lookup::EndsWith,
        Lookup::Regex,
        Lookup::IRegex,
        Lookup::In,
        Lookup::Gt,
        Lookup::Gte,
        Lookup::Lt,
        Lookup::Lte,
        Lookup::IsNull,
        Lookup::Range,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Lookup::Exact => "exact",
            Lookup::IExact => "iexact",
            Lookup::Contains => "contains",
            Lookup::IContains => "icontains",
            Lookup::StartsWith => "startswith",
            Lookup::EndsWith => "endswith",
            Lookup::Regex => "regex",
            Lookup::IRegex => "iregex",
            Lookup::In => "in",
            Lookup::Gt => "gt",
            Lookup::Gte => "gte",
            Lookup::Lt => "lt",
            Lookup::Lte => "lte",
            Lookup::IsNull => "isnull",
            Lookup::Range => "range",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|l| l.as_str() == name)
    }
}

/// Row predicate handed to the store
#[derive(Debug, Clone, PartialEq, Default)]
pub enum FilterExpr {
    #[default]
    All,
    /// `path` walks relations; the last segment names a column or relation
    Condition {
        path: Vec<String>,
        lookup: Lookup,
        value: Value,
    },
    And(Vec<FilterExpr>),
    Or(Vec<FilterExpr>),
    Not(Box<FilterExpr>),
}

impl FilterExpr {
    /// `field = value`
    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        FilterExpr::Condition {
            path: vec![field.into()],
            lookup: Lookup::Exact,
            value,
        }
    }

    pub fn and(self, other: FilterExpr) -> Self {
        match (self, other) {
            (FilterExpr::All, other) | (other, FilterExpr::All) => other,
            (FilterExpr::And(mut items), other) => {
                items.push(other);
                FilterExpr::And(items)
            }
            (this, other) => FilterExpr::And(vec![this, other]),
        }
    }
}

/// Sort key; parsed from `field` or `-field`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub descending: bool,
}

impl OrderBy {
    pub fn parse(key: &str) -> Self {
        match key.strip_prefix('-') {
            Some(field) => Self {
                field: field.to_string(),
                descending: true,
            },
            None => Self {
                field: key.to_string(),
                descending: false,
            },
        }
    }
}

impl fmt::Display for OrderBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.descending {
            f.write_str("-")?;
        }
        f.write_str(&self.field)
    }
}

/// A read against one model
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryPlan {
    pub model: String,
    pub filter: FilterExpr,
    pub order_by: Vec<OrderBy>,
    pub offset: usize,
    pub limit: Option<usize>,
    /// To-one relations the caller will traverse
    pub select_related: Vec<String>,
    /// To-many relations the caller will traverse
    pub prefetch_related: Vec<String>,
}

impl QueryPlan {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn filter(mut self, filter: FilterExpr) -> Self {
        self.filter = self.filter.and(filter);
        self
    }

    pub fn order_by(mut self, order_by: Vec<OrderBy>) -> Self {
        self.order_by = order_by;
        self
    }

    pub fn slice(mut self, offset: usize, limit: Option<usize>) -> Self {
        self.offset = offset;
        self.limit = limit;
        self
    }

    /// Stable key for caching the result of this plan
    pub fn cache_key(&self) -> String {
        let order: Vec<String> = self.order_by.iter().map(ToString::to_string).collect();
        format!(
            "{}:{:?}:{}:{}:{:?}",
            self.model,
            self.filter,
            order.join(","),
            self.offset,
            self.limit
        )
    }
}

/// Source of transactions
pub trait Store: Send + Sync {
    fn begin(&self) -> Result<Box<dyn Transaction + '_>, StoreError>;
}

/// A unit of work; dropping it without committing rolls back
pub trait Transaction {
    fn get(&mut self, model: &str, pk: &Pk) -> Result<Option<Record>, StoreError>;

    fn query(&mut self, plan: &QueryPlan) -> Result<Vec<Record>, StoreError>;

    fn count(&mut self, model: &str, filter: &FilterExpr) -> Result<usize, StoreError>;

    /// Insert a row; keys may name columns or to-one relations
    fn insert(&mut self, model: &str, values: Record) -> Result<Record, StoreError>;

    /// Apply a partial change to an existing row
    fn update(&mut self, model: &str, pk: &Pk, values: Record) -> Result<Record, StoreError>;

    fn delete(&mut self, model: &str, pk: &Pk) -> Result<(), StoreError>;

    /// Keys linked through a many-to-many relation
    fn related(&mut self, model: &str, pk: &Pk, field: &str) -> Result<Vec<Pk>, StoreError>;

    /// Replace the keys linked through a many-to-many relation
    fn set_related(&mut self, model: &str, pk: &Pk, field: &str, targets: &[Pk]) -> Result<(), StoreError>;

    fn commit(self: Box<Self>) -> Result<(), StoreError>;

    fn rollback(self: Box<Self>) -> Result<(), StoreError>;

    /// Fetch a row or fail with `NotFound`
    fn fetch(&mut self, model: &str, pk: &Pk) -> Result<Record, StoreError> {
        self.get(model, pk)?
            .ok_or_else(|| StoreError::not_found(model, pk))
    }
}

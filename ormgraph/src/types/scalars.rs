//! Field kind to GraphQL scalar mapping

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::model::FieldKind;

/// GraphQL scalars the generators emit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scalar {
    Id,
    String,
    Int,
    Float,
    Boolean,
    DateTime,
    Date,
    Time,
    Decimal,
    Json,
    Uuid,
    Duration,
}

impl Scalar {
    pub fn name(self) -> &'static str {
        match self {
            Scalar::Id => "ID",
            Scalar::String => "String",
            Scalar::Int => "Int",
            Scalar::Float => "Float",
            Scalar::Boolean => "Boolean",
            Scalar::DateTime => "DateTime",
            Scalar::Date => "Date",
            Scalar::Time => "Time",
            Scalar::Decimal => "Decimal",
            Scalar::Json => "JSON",
            Scalar::Uuid => "UUID",
            Scalar::Duration => "Duration",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.name() == name)
    }

    /// Whether the scalar is not built into GraphQL and must be registered
    pub fn is_custom(self) -> bool {
        !matches!(
            self,
            Scalar::Id | Scalar::String | Scalar::Int | Scalar::Float | Scalar::Boolean
        )
    }

    pub const ALL: [Scalar; 12] = [
        Scalar::Id,
        Scalar::String,
        Scalar::Int,
        Scalar::Float,
        Scalar::Boolean,
        Scalar::DateTime,
        Scalar::Date,
        Scalar::Time,
        Scalar::Decimal,
        Scalar::Json,
        Scalar::Uuid,
        Scalar::Duration,
    ];
}

/// Third-party field types with a known scalar
static KNOWN_CUSTOM_FIELDS: Lazy<HashMap<&'static str, Scalar>> = Lazy::new(|| {
    HashMap::from([
        ("PhoneNumberField", Scalar::String),
        ("GenericIPAddressField", Scalar::String),
        ("CICharField", Scalar::String),
        ("CIEmailField", Scalar::String),
        ("CITextField", Scalar::String),
        ("ArrayField", Scalar::Json),
        ("HStoreField", Scalar::Json),
        ("JSONField", Scalar::Json),
        ("MoneyField", Scalar::Decimal),
        ("PositiveBigIntegerField", Scalar::Int),
        ("PositiveSmallIntegerField", Scalar::Int),
        ("DateTimeRangeField", Scalar::Json),
        ("IntegerRangeField", Scalar::Json),
    ])
});

/// Scalar for a field kind; primary keys are always `ID`
pub fn scalar_for(kind: &FieldKind, primary_key: bool, overrides: &HashMap<String, String>) -> Scalar {
    if primary_key {
        return Scalar::Id;
    }
    match kind {
        FieldKind::Auto | FieldKind::BigAuto => Scalar::Id,
        FieldKind::Char
        | FieldKind::Text
        | FieldKind::Slug
        | FieldKind::Email
        | FieldKind::Url
        | FieldKind::File
        | FieldKind::Image
        | FieldKind::Binary => Scalar::String,
        FieldKind::Uuid => Scalar::Uuid,
        FieldKind::Integer
        | FieldKind::BigInteger
        | FieldKind::SmallInteger
        | FieldKind::PositiveInteger => Scalar::Int,
        FieldKind::Float => Scalar::Float,
        FieldKind::Decimal => Scalar::Decimal,
        FieldKind::Boolean => Scalar::Boolean,
        FieldKind::Date => Scalar::Date,
        FieldKind::DateTime => Scalar::DateTime,
        FieldKind::Time => Scalar::Time,
        FieldKind::Duration => Scalar::Duration,
        FieldKind::Json => Scalar::Json,
        FieldKind::ForeignKey | FieldKind::OneToOne => Scalar::Id,
        // never reaches a scalar position, kept total
        FieldKind::ManyToMany | FieldKind::Reverse => Scalar::Id,
        FieldKind::Custom(name) => handle_custom_fields(name, overrides),
    }
}

/// Scalar for a third-party field type, falling back to `String`
pub fn handle_custom_fields(type_name: &str, overrides: &HashMap<String, String>) -> Scalar {
    if let Some(scalar) = overrides.get(type_name).and_then(|name| Scalar::from_name(name)) {
        return scalar;
    }
    KNOWN_CUSTOM_FIELDS
        .get(type_name)
        .copied()
        .unwrap_or(Scalar::String)
}

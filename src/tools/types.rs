//! Property type to column type mapping

use crate::feather::{Primitive, PropertySpec, PropertyType};
use serde::{Deserialize, Serialize};

/// Storage type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Text,
    Integer,
    BigInt,
    Numeric,
    Boolean,
    Date,
    Timestamp,
    Json,
}

impl ColumnType {
    /// Postgres type name
    pub fn sql(&self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Integer => "integer",
            ColumnType::BigInt => "bigint",
            ColumnType::Numeric => "numeric",
            ColumnType::Boolean => "boolean",
            ColumnType::Date => "date",
            ColumnType::Timestamp => "timestamp with time zone",
            ColumnType::Json => "jsonb",
        }
    }
}

/// Column type for a property, `None` when the property has no column
/// (one-to-many compositions live in the child table).
pub fn column_type(spec: &PropertySpec) -> Option<ColumnType> {
    match &spec.kind {
        PropertyType::Relation(rel) if rel.parent_of.is_some() => None,
        PropertyType::Relation(_) => Some(ColumnType::BigInt),
        PropertyType::Primitive(primitive) => Some(primitive_type(*primitive, spec.format.as_deref())),
    }
}

fn primitive_type(primitive: Primitive, format: Option<&str>) -> ColumnType {
    match (primitive, format) {
        (_, Some("money")) | (_, Some("lock")) => ColumnType::Json,
        (Primitive::String, Some("date")) => ColumnType::Date,
        (Primitive::String, Some("dateTime")) => ColumnType::Timestamp,
        (Primitive::String, _) => ColumnType::Text,
        (Primitive::Integer, _) => ColumnType::Integer,
        (Primitive::Number, _) => ColumnType::Numeric,
        (Primitive::Boolean, _) => ColumnType::Boolean,
        (Primitive::Object, _) | (Primitive::Array, _) => ColumnType::Json,
    }
}

/// Formats accepted on primitive properties
pub const FORMATS: &[&str] = &[
    "date", "dateTime", "money", "lock", "enum", "color", "email", "url", "tel", "password",
    "textArea", "script",
];

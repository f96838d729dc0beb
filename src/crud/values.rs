//! Property values: defaults, type checks and column mapping

use crate::error::{DataError, Result};
use crate::feather::{Feather, Primitive, PropertySpec};
use crate::tools::case::{relation_column, to_snake_case};
use crate::tools::types::column_type;
use crate::tools::ColumnType;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde_json::{json, Map, Value};

/// Default literal meaning "the current date or time"
pub const NOW: &str = "now()";

/// Current time in the format stored for `dateTime` properties
pub fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Column name and type backing a property, if it has a column
pub fn column_of(name: &str, spec: &PropertySpec) -> Option<(String, ColumnType)> {
    let kind = column_type(spec)?;
    let column = if spec.is_to_one() {
        relation_column(name)
    } else {
        to_snake_case(name)
    };
    Some((column, kind))
}

/// Value for a property the caller left empty
pub fn default_value(spec: &PropertySpec, base_currency: &str) -> Value {
    if let Some(default) = &spec.default {
        if default.as_str() == Some(NOW) {
            return if spec.format_is("date") {
                Value::String(Utc::now().date_naive().format("%Y-%m-%d").to_string())
            } else {
                Value::String(now())
            };
        }
        return default.clone();
    }
    if spec.format_is("money") {
        return json!({
            "amount": 0,
            "currency": base_currency,
            "effective": null,
            "baseAmount": null
        });
    }
    match spec.primitive() {
        Some(Primitive::Boolean) => Value::Bool(false),
        Some(Primitive::Integer) | Some(Primitive::Number) => json!(0),
        Some(Primitive::String) if spec.format_is("date") || spec.format_is("dateTime") => {
            Value::Null
        }
        Some(Primitive::String) => Value::String(String::new()),
        Some(Primitive::Array) => Value::Array(Vec::new()),
        Some(Primitive::Object) | None => Value::Null,
    }
}

/// Empty for the purpose of `isRequired`
pub fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn invalid(feather: &Feather, name: &str, expected: &str) -> DataError {
    DataError::validation(format!(
        "Value of \"{}\" on \"{}\" must be {}",
        name, feather.name, expected
    ))
}

/// Check a primitive value against its property and normalise it
pub fn check_value(feather: &Feather, name: &str, spec: &PropertySpec, value: Value) -> Result<Value> {
    if value.is_null() {
        return Ok(value);
    }
    let Some(primitive) = spec.primitive() else {
        return Ok(value);
    };
    match primitive {
        Primitive::String => {
            let Value::String(text) = &value else {
                return Err(invalid(feather, name, "a string"));
            };
            if spec.format_is("date") && NaiveDate::parse_from_str(text, "%Y-%m-%d").is_err() {
                return Err(invalid(feather, name, "a date (YYYY-MM-DD)"));
            }
            if spec.format_is("dateTime") && DateTime::parse_from_rfc3339(text).is_err() {
                return Err(invalid(feather, name, "an RFC 3339 date and time"));
            }
            Ok(value)
        }
        Primitive::Integer => match &value {
            Value::Number(n) if n.is_i64() => Ok(value),
            Value::Number(n) => match n.as_f64() {
                Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(json!(f as i64)),
                _ => Err(invalid(feather, name, "an integer")),
            },
            _ => Err(invalid(feather, name, "an integer")),
        },
        Primitive::Number => match &value {
            Value::Number(_) => Ok(value),
            _ => Err(invalid(feather, name, "a number")),
        },
        Primitive::Boolean => match &value {
            Value::Bool(_) => Ok(value),
            _ => Err(invalid(feather, name, "a boolean")),
        },
        Primitive::Array => match &value {
            Value::Array(_) => Ok(value),
            _ => Err(invalid(feather, name, "an array")),
        },
        Primitive::Object if spec.format_is("money") => {
            let Value::Object(money) = value else {
                return Err(invalid(feather, name, "a money object"));
            };
            if !money.get("amount").is_some_and(Value::is_number)
                || !money.get("currency").is_some_and(Value::is_string)
            {
                return Err(invalid(feather, name, "a money object with amount and currency"));
            }
            let mut money = money;
            money.entry("effective").or_insert(Value::Null);
            money.entry("baseAmount").or_insert(Value::Null);
            Ok(Value::Object(money))
        }
        Primitive::Object => match &value {
            Value::Object(_) | Value::Array(_) => Ok(value),
            _ => Err(invalid(feather, name, "an object")),
        },
    }
}

/// Reject keys the feather does not declare
pub fn check_known(feather: &Feather, data: &Map<String, Value>) -> Result<()> {
    for key in data.keys() {
        if !feather.properties.contains_key(key) {
            return Err(DataError::validation(format!(
                "Feather \"{}\" does not contain property \"{}\"",
                feather.name, key
            )));
        }
    }
    Ok(())
}

/// Id referenced by a relation value (`"id"` or `{"id": ...}`)
pub fn relation_id(value: &Value) -> Option<&str> {
    match value {
        Value::String(id) => Some(id),
        Value::Object(map) => map.get("id").and_then(Value::as_str),
        _ => None,
    }
}

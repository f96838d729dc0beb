//! Identifier case conversion between feather property names and columns

use serde_json::{Map, Value};

/// `firstName` -> `first_name`, `Contact` -> `contact`, `SalesOrder` -> `sales_order`
pub fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for c in name.chars() {
        if c.is_ascii_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
            prev_lower = false;
        } else {
            prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
            out.push(c);
        }
    }
    out
}

/// `first_name` -> `firstName`. Leading underscores are preserved.
pub fn to_camel_case(name: &str) -> String {
    let leading = name.len() - name.trim_start_matches('_').len();
    let mut out = String::with_capacity(name.len());
    out.push_str(&name[..leading]);
    let mut upper = false;
    for c in name[leading..].chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.push(c.to_ascii_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Recursively rename every object key to camelCase.
pub fn camelize(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (to_camel_case(&k), camelize(v)))
                .collect::<Map<String, Value>>(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(camelize).collect()),
        other => other,
    }
}

/// Table backing a feather
pub fn table_name(feather: &str) -> String {
    to_snake_case(feather)
}

/// Column holding the internal key of a to-one relation
pub fn relation_column(property: &str) -> String {
    format!("_{}_pk", to_snake_case(property))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_snake_case() {
        assert_eq!(to_snake_case("firstName"), "first_name");
        assert_eq!(to_snake_case("Contact"), "contact");
        assert_eq!(to_snake_case("SalesOrderLine"), "sales_order_line");
        assert_eq!(to_snake_case("isDeleted"), "is_deleted");
        assert_eq!(to_snake_case("id"), "id");
        assert_eq!(to_snake_case("address2"), "address2");
    }

    #[test]
    fn test_camel_case() {
        assert_eq!(to_camel_case("first_name"), "firstName");
        assert_eq!(to_camel_case("is_deleted"), "isDeleted");
        assert_eq!(to_camel_case("_pk"), "_pk");
        assert_eq!(to_camel_case("id"), "id");
    }

    #[test]
    fn test_camelize_nested() {
        let value = json!({"created_by": "ann", "lock": {"session_id": "s1"}, "rows": [{"line_no": 1}]});
        assert_eq!(
            camelize(value),
            json!({"createdBy": "ann", "lock": {"sessionId": "s1"}, "rows": [{"lineNo": 1}]})
        );
    }

    #[test]
    fn test_relation_column() {
        assert_eq!(relation_column("parentOrder"), "_parent_order_pk");
    }
}

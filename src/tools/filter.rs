//! Declarative request filters and their translation into statements

use super::case::{relation_column, table_name, to_snake_case};
use super::statement::{ColumnRef, Condition, Operator, OrderBy};
use super::types::column_type;
use crate::error::{DataError, Result};
use crate::feather::Feather;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Filter carried by a list request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filter {
    #[serde(default)]
    pub criteria: Vec<Criterion>,
    #[serde(default)]
    pub sort: Vec<Sort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

impl Filter {
    pub fn criterion(mut self, criterion: Criterion) -> Self {
        self.criteria.push(criterion);
        self
    }

    pub fn sort_by(mut self, sort: Sort) -> Self {
        self.sort.push(sort);
        self
    }
}

/// Single criterion; an array `property` is an OR-group, an array `value` an IN list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    pub property: PropertyRef,
    #[serde(default = "default_operator")]
    pub operator: String,
    #[serde(default)]
    pub value: Value,
}

fn default_operator() -> String {
    "=".to_string()
}

impl Criterion {
    pub fn new(property: impl Into<String>, operator: &str, value: impl Into<Value>) -> Self {
        Self {
            property: PropertyRef::One(property.into()),
            operator: operator.to_string(),
            value: value.into(),
        }
    }

    pub fn eq(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(property, "=", value)
    }

    pub fn any_of(properties: &[&str], operator: &str, value: impl Into<Value>) -> Self {
        Self {
            property: PropertyRef::Many(properties.iter().map(|p| p.to_string()).collect()),
            operator: operator.to_string(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyRef {
    One(String),
    Many(Vec<String>),
}

impl PropertyRef {
    fn names(&self) -> Vec<&str> {
        match self {
            PropertyRef::One(p) => vec![p.as_str()],
            PropertyRef::Many(ps) => ps.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sort {
    pub property: String,
    #[serde(default)]
    pub order: SortOrder,
}

impl Sort {
    pub fn asc(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            order: SortOrder::Asc,
        }
    }

    pub fn desc(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            order: SortOrder::Desc,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    #[serde(alias = "ASC")]
    Asc,
    #[serde(alias = "DESC")]
    Desc,
}

/// Translate filter criteria into a condition against `feather`'s table.
///
/// `feather` must be resolved with inherited properties.
pub fn build_condition(feather: &Feather, filter: &Filter) -> Result<Condition> {
    let mut condition = Condition::All;
    for criterion in &filter.criteria {
        let op = Operator::parse(&criterion.operator).ok_or_else(|| {
            DataError::validation(format!(
                "Unsupported operator \"{}\"",
                criterion.operator
            ))
        })?;
        let names = criterion.property.names();
        if names.is_empty() {
            return Err(DataError::validation("Filter criterion has no property"));
        }
        let mut group = Vec::with_capacity(names.len());
        for name in names {
            group.push(criterion_for(feather, name, op, &criterion.value)?);
        }
        let term = if group.len() == 1 {
            group.remove(0)
        } else {
            Condition::Or(group)
        };
        condition = condition.and(term);
    }
    Ok(condition)
}

fn criterion_for(feather: &Feather, name: &str, op: Operator, value: &Value) -> Result<Condition> {
    let spec = feather.properties.get(name).ok_or_else(|| {
        DataError::validation(format!(
            "Feather \"{}\" does not contain property \"{}\"",
            feather.name, name
        ))
    })?;

    if spec.is_to_many() {
        return Err(DataError::validation(format!(
            "Can not filter on composition property \"{}\"",
            name
        )));
    }

    // Array values mean IN regardless of the operator token, as long as it is an equality
    let op = match (op, value) {
        (Operator::Eq, Value::Array(_)) => Operator::In,
        (Operator::In, Value::Array(_)) => Operator::In,
        (Operator::In, _) => {
            return Err(DataError::validation(format!(
                "Operator IN on \"{}\" requires an array value",
                name
            )))
        }
        (other, Value::Array(_)) => {
            return Err(DataError::validation(format!(
                "Operator \"{}\" on \"{}\" does not accept an array value",
                other.sql(),
                name
            )))
        }
        (other, _) => other,
    };

    if let Some(rel) = spec.relation_spec() {
        let column = relation_column(name);
        let table = table_name(&rel.relation);
        return match (op, value) {
            (Operator::Eq, Value::Null) => Ok(Condition::is_null(ColumnRef::new(
                column,
                super::types::ColumnType::BigInt,
            ))),
            (Operator::Eq, v) => Ok(Condition::Related {
                column,
                table,
                id: relation_id(v)?,
            }),
            (Operator::In, Value::Array(items)) => Ok(Condition::Or(
                items
                    .iter()
                    .map(|v| {
                        Ok(Condition::Related {
                            column: column.clone(),
                            table: table.clone(),
                            id: relation_id(v)?,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?,
            )),
            _ => Err(DataError::validation(format!(
                "Operator \"{}\" is not supported on relation \"{}\"",
                op.sql(),
                name
            ))),
        };
    }

    let kind = column_type(spec).unwrap_or(super::types::ColumnType::Text);
    Ok(Condition::Compare {
        column: ColumnRef::new(to_snake_case(name), kind),
        op,
        value: value.clone(),
    })
}

fn relation_id(value: &Value) -> Result<Value> {
    match value {
        Value::String(_) => Ok(value.clone()),
        Value::Object(map) => map
            .get("id")
            .filter(|id| id.is_string())
            .cloned()
            .ok_or_else(|| DataError::validation("Relation criterion requires an id")),
        _ => Err(DataError::validation("Relation criterion requires an id")),
    }
}

/// Sort keys for a filter, always ending with the internal key as tie-break.
pub fn build_order(feather: &Feather, filter: &Filter) -> Result<Vec<OrderBy>> {
    let mut order = Vec::with_capacity(filter.sort.len() + 1);
    for sort in &filter.sort {
        let spec = feather.properties.get(&sort.property).ok_or_else(|| {
            DataError::validation(format!(
                "Feather \"{}\" does not contain property \"{}\"",
                feather.name, sort.property
            ))
        })?;
        if spec.relation_spec().is_some() {
            return Err(DataError::validation(format!(
                "Can not sort on relation property \"{}\"",
                sort.property
            )));
        }
        let kind = column_type(spec).unwrap_or(super::types::ColumnType::Text);
        order.push(OrderBy {
            column: ColumnRef::new(to_snake_case(&sort.property), kind),
            descending: sort.order == SortOrder::Desc,
        });
    }
    order.push(OrderBy::asc(ColumnRef::pk()));
    Ok(order)
}

//! Statement AST shared by the SQL renderer and the in-memory store
//!
//! The engine never concatenates SQL itself; it builds statements, and each
//! backend either renders them to parameterized SQL or evaluates them
//! directly. Selects, updates and deletes on a table also reach rows of
//! tables that inherit from it.

use super::types::ColumnType;
use serde_json::Value;

/// Sequence backing every internal primary key
pub const PK_SEQUENCE: &str = "object__pk_seq";

/// Column definition used by [`Statement::DefineTable`]
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub kind: ColumnType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, kind: ColumnType) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// A typed value written to a column
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnValue {
    pub column: String,
    pub value: Value,
    pub kind: ColumnType,
}

impl ColumnValue {
    pub fn new(column: impl Into<String>, value: Value, kind: ColumnType) -> Self {
        Self {
            column: column.into(),
            value,
            kind,
        }
    }
}

/// Column reference, optionally into a key of a JSON column
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRef {
    pub name: String,
    /// Key inside a JSON column (`lock->>'sessionId'`)
    pub field: Option<String>,
    pub kind: ColumnType,
}

impl ColumnRef {
    pub fn new(name: impl Into<String>, kind: ColumnType) -> Self {
        Self {
            name: name.into(),
            field: None,
            kind,
        }
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Text)
    }

    pub fn pk() -> Self {
        Self::new("_pk", ColumnType::BigInt)
    }

    /// Text value of a key inside a JSON column
    pub fn json_field(name: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field: Some(field.into()),
            kind: ColumnType::Text,
        }
    }
}

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    NotEq,
    /// Case-sensitive regular expression match
    Matches,
    NotMatches,
    /// Case-insensitive regular expression match
    MatchesInsensitive,
    NotMatchesInsensitive,
    Lt,
    Gt,
    Le,
    Ge,
    In,
}

impl Operator {
    /// Parse a request-level operator token
    pub fn parse(token: &str) -> Option<Self> {
        Some(match token {
            "=" => Operator::Eq,
            "!=" | "<>" => Operator::NotEq,
            "~" => Operator::Matches,
            "!~" => Operator::NotMatches,
            "~*" => Operator::MatchesInsensitive,
            "!~*" => Operator::NotMatchesInsensitive,
            "<" => Operator::Lt,
            ">" => Operator::Gt,
            "<=" => Operator::Le,
            ">=" => Operator::Ge,
            "IN" | "in" => Operator::In,
            _ => return None,
        })
    }

    pub fn sql(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::NotEq => "!=",
            Operator::Matches => "~",
            Operator::NotMatches => "!~",
            Operator::MatchesInsensitive => "~*",
            Operator::NotMatchesInsensitive => "!~*",
            Operator::Lt => "<",
            Operator::Gt => ">",
            Operator::Le => "<=",
            Operator::Ge => ">=",
            Operator::In => "IN",
        }
    }

    pub fn is_regex(&self) -> bool {
        matches!(
            self,
            Operator::Matches
                | Operator::NotMatches
                | Operator::MatchesInsensitive
                | Operator::NotMatchesInsensitive
        )
    }
}

/// Authorization action; each maps to a column of the grant table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    CanCreate,
    CanRead,
    CanUpdate,
    CanDelete,
}

impl Action {
    pub fn column(&self) -> &'static str {
        match self {
            Action::CanCreate => "can_create",
            Action::CanRead => "can_read",
            Action::CanUpdate => "can_update",
            Action::CanDelete => "can_delete",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "canCreate" => Action::CanCreate,
            "canRead" => Action::CanRead,
            "canUpdate" => Action::CanUpdate,
            "canDelete" => Action::CanDelete,
            _ => return None,
        })
    }
}

/// Row predicate
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Matches every row
    All,
    Compare {
        column: ColumnRef,
        op: Operator,
        value: Value,
    },
    /// `column` holds the internal key of the record with surrogate `id` in `table`
    Related {
        column: String,
        table: String,
        id: Value,
    },
    /// Row-level grant check: an object-level grant for one of `roles` on the
    /// row's id decides; without one the row is allowed when its
    /// `object_type` is among the `readable` feathers.
    Authorized {
        roles: Vec<String>,
        action: Action,
        readable: Vec<String>,
    },
    And(Vec<Condition>),
    Or(Vec<Condition>),
}

impl Condition {
    pub fn eq(column: ColumnRef, value: impl Into<Value>) -> Self {
        Condition::Compare {
            column,
            op: Operator::Eq,
            value: value.into(),
        }
    }

    pub fn id(id: impl Into<Value>) -> Self {
        Self::eq(ColumnRef::text("id"), id)
    }

    pub fn pk(pk: i64) -> Self {
        Self::eq(ColumnRef::pk(), pk)
    }

    pub fn pks(pks: &[i64]) -> Self {
        Condition::Compare {
            column: ColumnRef::pk(),
            op: Operator::In,
            value: Value::Array(pks.iter().map(|pk| Value::from(*pk)).collect()),
        }
    }

    pub fn not_deleted() -> Self {
        Self::eq(ColumnRef::new("is_deleted", ColumnType::Boolean), false)
    }

    pub fn is_null(column: ColumnRef) -> Self {
        Self::eq(column, Value::Null)
    }

    pub fn is_not_null(column: ColumnRef) -> Self {
        Condition::Compare {
            column,
            op: Operator::NotEq,
            value: Value::Null,
        }
    }

    /// Conjunction that drops `All` terms
    pub fn and(self, other: Condition) -> Condition {
        match (self, other) {
            (Condition::All, c) | (c, Condition::All) => c,
            (Condition::And(mut a), Condition::And(b)) => {
                a.extend(b);
                Condition::And(a)
            }
            (Condition::And(mut a), c) => {
                a.push(c);
                Condition::And(a)
            }
            (a, b) => Condition::And(vec![a, b]),
        }
    }
}

/// Sort key
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub column: ColumnRef,
    pub descending: bool,
}

impl OrderBy {
    pub fn asc(column: ColumnRef) -> Self {
        Self {
            column,
            descending: false,
        }
    }
}

/// A primitive store operation
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// Create the table if missing and add any missing columns
    DefineTable {
        table: String,
        inherits: Option<String>,
        columns: Vec<ColumnDef>,
        /// Composite uniqueness over these columns (`ON CONFLICT` target)
        unique: Vec<String>,
        /// Install the row-change notification trigger
        notify: bool,
    },
    DropTable {
        table: String,
    },
    /// Next value of a named sequence (created on first use)
    NextVal {
        sequence: String,
    },
    Insert {
        table: String,
        values: Vec<ColumnValue>,
        /// Silently skip rows violating the table's unique constraint
        ignore_conflict: bool,
    },
    Select {
        table: String,
        /// Empty selects every column
        columns: Vec<String>,
        condition: Condition,
        order_by: Vec<OrderBy>,
        offset: Option<u64>,
        limit: Option<u64>,
    },
    Update {
        table: String,
        values: Vec<ColumnValue>,
        condition: Condition,
    },
    Delete {
        table: String,
        condition: Condition,
    },
}

impl Statement {
    pub fn select(table: impl Into<String>, columns: &[&str], condition: Condition) -> Self {
        Statement::Select {
            table: table.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            condition,
            order_by: Vec::new(),
            offset: None,
            limit: None,
        }
    }

    pub fn table(&self) -> Option<&str> {
        match self {
            Statement::DefineTable { table, .. }
            | Statement::DropTable { table }
            | Statement::Insert { table, .. }
            | Statement::Select { table, .. }
            | Statement::Update { table, .. }
            | Statement::Delete { table, .. } => Some(table),
            Statement::NextVal { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_tokens() {
        for token in ["=", "!=", "~", "!~", "~*", "!~*", "<", ">", "<=", ">=", "IN"] {
            let op = Operator::parse(token).unwrap();
            assert_eq!(op.sql(), token);
        }
        assert!(Operator::parse("LIKE").is_none());
    }

    #[test]
    fn test_and_flattens_and_skips_all() {
        let a = Condition::id("a");
        assert_eq!(Condition::All.and(a.clone()), a);
        let both = a.clone().and(Condition::not_deleted());
        let three = both.and(Condition::pk(1));
        match three {
            Condition::And(items) => assert_eq!(items.len(), 3),
            other => panic!("unexpected {:?}", other),
        }
    }
}

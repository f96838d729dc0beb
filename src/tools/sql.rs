//! Render statements as parameterized Postgres SQL
//!
//! Every parameter carries the column type it is compared with or written
//! to, and is cast explicitly (`$1::numeric`) so text-encoded values bind
//! cleanly against typed columns. Every query returns a single `result`
//! jsonb column.

use super::statement::{Condition, ColumnRef, Operator, OrderBy, Statement};
use super::types::ColumnType;
use serde_json::Value;

/// A bound parameter
#[derive(Debug, Clone, PartialEq)]
pub struct SqlParam {
    pub value: Value,
    pub kind: ColumnType,
}

/// SQL text plus its parameters
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

/// Name of the grant table
pub const AUTH_TABLE: &str = "$auth";

/// Quote an identifier
pub fn ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

#[derive(Default)]
struct Builder {
    params: Vec<SqlParam>,
}

impl Builder {
    fn bind(&mut self, value: Value, kind: ColumnType) -> String {
        self.params.push(SqlParam { value, kind });
        format!("${}::{}", self.params.len(), kind.sql())
    }

    fn column(&self, column: &ColumnRef) -> String {
        match &column.field {
            Some(field) => format!("({}->>{})", ident(&column.name), literal(field)),
            None => ident(&column.name),
        }
    }

    fn condition(&mut self, condition: &Condition) -> String {
        match condition {
            Condition::All => "TRUE".to_string(),
            Condition::Compare { column, op, value } => self.compare(column, *op, value),
            Condition::Related { column, table, id } => {
                let param = self.bind(id.clone(), ColumnType::Text);
                format!(
                    "{} IN (SELECT \"_pk\" FROM {} WHERE \"id\" = {})",
                    ident(column),
                    ident(table),
                    param
                )
            }
            Condition::Authorized {
                roles,
                action,
                readable,
            } => {
                let roles: Vec<String> = roles
                    .iter()
                    .map(|r| self.bind(Value::String(r.clone()), ColumnType::Text))
                    .collect();
                let roles = roles.join(", ");
                let grants = format!(
                    "SELECT 1 FROM {} _a WHERE _a.\"object_id\" = _t.\"id\" AND _a.\"role\" IN ({})",
                    ident(AUTH_TABLE),
                    roles
                );
                let fallback = if readable.is_empty() {
                    "FALSE".to_string()
                } else {
                    let types: Vec<String> = readable
                        .iter()
                        .map(|f| self.bind(Value::String(f.clone()), ColumnType::Text))
                        .collect();
                    format!("_t.\"object_type\" IN ({})", types.join(", "))
                };
                format!(
                    "(CASE WHEN EXISTS ({grants} AND _a.{col} IS NOT NULL) \
                     THEN EXISTS ({grants} AND _a.{col}) ELSE {fallback} END)",
                    grants = grants,
                    col = ident(action.column()),
                    fallback = fallback
                )
            }
            Condition::And(terms) => self.join(terms, " AND ", "TRUE"),
            Condition::Or(terms) => self.join(terms, " OR ", "FALSE"),
        }
    }

    fn join(&mut self, terms: &[Condition], sep: &str, empty: &str) -> String {
        if terms.is_empty() {
            return empty.to_string();
        }
        let parts: Vec<String> = terms.iter().map(|t| self.condition(t)).collect();
        format!("({})", parts.join(sep))
    }

    fn compare(&mut self, column: &ColumnRef, op: Operator, value: &Value) -> String {
        let col = self.column(column);
        match (op, value) {
            (Operator::Eq, Value::Null) => format!("{} IS NULL", col),
            (Operator::NotEq, Value::Null) => format!("{} IS NOT NULL", col),
            (Operator::In, Value::Array(items)) => {
                if items.is_empty() {
                    return "FALSE".to_string();
                }
                let params: Vec<String> = items
                    .iter()
                    .map(|v| self.bind(v.clone(), column.kind))
                    .collect();
                format!("{} IN ({})", col, params.join(", "))
            }
            (op, value) if op.is_regex() => {
                let param = self.bind(value.clone(), ColumnType::Text);
                format!("{}::text {} {}", col, op.sql(), param)
            }
            (op, value) => {
                let param = self.bind(value.clone(), column.kind);
                format!("{} {} {}", col, op.sql(), param)
            }
        }
    }

    fn order(&self, order_by: &[OrderBy]) -> String {
        order_by
            .iter()
            .map(|o| {
                format!(
                    "{} {}",
                    self.column(&o.column),
                    if o.descending { "DESC" } else { "ASC" }
                )
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Render a data statement. DDL statements return `None`; see [`ddl`].
pub fn render(statement: &Statement) -> Option<SqlQuery> {
    let mut b = Builder::default();
    let sql = match statement {
        Statement::DefineTable { .. } | Statement::DropTable { .. } => return None,
        Statement::NextVal { sequence } => {
            let seq = b.bind(Value::String(ident(sequence)), ColumnType::Text);
            format!("SELECT jsonb_build_object('value', nextval({})) AS result", seq)
        }
        Statement::Insert {
            table,
            values,
            ignore_conflict,
        } => {
            let columns: Vec<String> = values.iter().map(|v| ident(&v.column)).collect();
            let params: Vec<String> = values
                .iter()
                .map(|v| b.bind(v.value.clone(), v.kind))
                .collect();
            format!(
                "INSERT INTO {} ({}) VALUES ({}){}",
                ident(table),
                columns.join(", "),
                params.join(", "),
                if *ignore_conflict {
                    " ON CONFLICT DO NOTHING"
                } else {
                    ""
                }
            )
        }
        Statement::Select {
            table,
            columns,
            condition,
            order_by,
            offset,
            limit,
        } => {
            let projection = if columns.is_empty() {
                "_t.*".to_string()
            } else {
                columns
                    .iter()
                    .map(|c| format!("_t.{}", ident(c)))
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            let condition = b.condition(condition);
            let order = b.order(order_by);
            let mut sql = if order.is_empty() {
                format!("SELECT {} FROM {} _t WHERE {}", projection, ident(table), condition)
            } else {
                format!(
                    "SELECT {}, row_number() OVER (ORDER BY {}) AS \"_ord\" FROM {} _t WHERE {} ORDER BY {}",
                    projection,
                    order,
                    ident(table),
                    condition,
                    order
                )
            };
            if let Some(offset) = offset {
                sql.push_str(&format!(" OFFSET {}", offset));
            }
            if let Some(limit) = limit {
                sql.push_str(&format!(" LIMIT {}", limit));
            }
            if order.is_empty() {
                format!("SELECT to_jsonb(_r) AS result FROM ({}) _r", sql)
            } else {
                format!(
                    "SELECT to_jsonb(_r) - '_ord' AS result FROM ({}) _r ORDER BY _r.\"_ord\"",
                    sql
                )
            }
        }
        Statement::Update {
            table,
            values,
            condition,
        } => {
            let sets: Vec<String> = values
                .iter()
                .map(|v| format!("{} = {}", ident(&v.column), b.bind(v.value.clone(), v.kind)))
                .collect();
            format!(
                "UPDATE {} _t SET {} WHERE {}",
                ident(table),
                sets.join(", "),
                b.condition(condition)
            )
        }
        Statement::Delete { table, condition } => format!(
            "DELETE FROM {} _t WHERE {}",
            ident(table),
            b.condition(condition)
        ),
    };
    Some(SqlQuery {
        sql,
        params: b.params,
    })
}

/// Render a DDL statement into one or more SQL commands.
pub fn ddl(statement: &Statement) -> Vec<String> {
    match statement {
        Statement::DefineTable {
            table,
            inherits,
            columns,
            unique,
            notify,
        } => {
            let mut out = vec![match inherits {
                Some(parent) => format!(
                    "CREATE TABLE IF NOT EXISTS {} () INHERITS ({})",
                    ident(table),
                    ident(parent)
                ),
                None => format!("CREATE TABLE IF NOT EXISTS {} ()", ident(table)),
            }];
            for column in columns {
                out.push(format!(
                    "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
                    ident(table),
                    ident(&column.name),
                    column.kind.sql()
                ));
            }
            if !unique.is_empty() {
                out.push(format!(
                    "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ({})",
                    ident(&format!("{}_unique", table)),
                    ident(table),
                    unique.iter().map(|c| ident(c)).collect::<Vec<_>>().join(", ")
                ));
            }
            if *notify {
                out.push(format!(
                    "CREATE OR REPLACE TRIGGER {} AFTER INSERT OR UPDATE OR DELETE ON {} \
                     FOR EACH ROW EXECUTE FUNCTION notify_subscribers()",
                    ident(&format!("{}_notify", table)),
                    ident(table)
                ));
            }
            out
        }
        Statement::DropTable { table } => {
            vec![format!("DROP TABLE IF EXISTS {}", ident(table))]
        }
        _ => Vec::new(),
    }
}

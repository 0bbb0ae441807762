//! Builds parameterized INSERT, SELECT, UPDATE, DELETE from a table spec.

use crate::config::{FieldType, TableSpec};
use crate::store::{Condition, Row, Selection};
use serde_json::Value;

/// Quote identifier for PostgreSQL (safe: only from the resolved schema).
fn quoted(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

/// Full qualified table name.
fn qualified_table(schema: &str, table: &str) -> String {
    format!("{}.{}", quoted(schema), quoted(table))
}

#[derive(Debug)]
pub struct QueryBuf {
    pub sql: String,
    pub params: Vec<Value>,
}

impl QueryBuf {
    fn new() -> Self {
        QueryBuf {
            sql: String::new(),
            params: Vec::new(),
        }
    }

    fn push_param(&mut self, v: Value) -> u32 {
        let n = self.params.len() as u32 + 1;
        self.params.push(v);
        n
    }
}

/// Cast applied to a placeholder so text-encoded values land in the right column type.
fn pg_cast(ty: &FieldType, array: bool) -> Option<String> {
    let base = match ty {
        FieldType::String | FieldType::Text => "text",
        FieldType::Integer => "integer",
        FieldType::BigInt => "bigint",
        FieldType::Float => "double precision",
        FieldType::Decimal => "numeric",
        FieldType::Boolean => "boolean",
        FieldType::Uuid => "uuid",
        FieldType::Date => "date",
        FieldType::DateTime => "timestamptz",
        FieldType::Json => "jsonb",
        // Enum and spatial column types are named by the emitter; let the server infer.
        FieldType::Enum | FieldType::Point | FieldType::Polygon | FieldType::Geometry | FieldType::Unknown(_) => {
            return None
        }
    };
    // Arrays travel as JSON and are not cast element-wise.
    if array {
        return None;
    }
    Some(base.to_string())
}

fn placeholder(table: &TableSpec, column: &str, n: u32) -> String {
    table
        .column(column)
        .and_then(|c| pg_cast(&c.ty, c.array))
        .map(|t| format!("${}::{}", n, t))
        .unwrap_or_else(|| format!("${}", n))
}

/// SELECT list: numeric, enum and spatial columns as text so every cell decodes.
fn select_column_list(table: &TableSpec) -> String {
    table
        .columns
        .iter()
        .map(|c| {
            let q = quoted(&c.name);
            match c.ty {
                FieldType::Decimal | FieldType::Enum | FieldType::Point | FieldType::Polygon | FieldType::Geometry => {
                    format!("{}::text AS {}", q, q)
                }
                _ => q,
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn where_clause(q: &mut QueryBuf, table: &TableSpec, conditions: &[Condition]) -> String {
    let mut parts = Vec::new();
    for cond in conditions {
        match cond {
            Condition::Eq(col, v) => {
                let n = q.push_param(v.clone());
                parts.push(format!("{} = {}", quoted(col), placeholder(table, col, n)));
            }
            Condition::In(_, vs) if vs.is_empty() => parts.push("1 = 0".to_string()),
            Condition::In(col, vs) => {
                let phs: Vec<String> = vs
                    .iter()
                    .map(|v| {
                        let n = q.push_param(v.clone());
                        placeholder(table, col, n)
                    })
                    .collect();
                parts.push(format!("{} IN ({})", quoted(col), phs.join(", ")));
            }
            Condition::IsNull(col) => parts.push(format!("{} IS NULL", quoted(col))),
        }
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", parts.join(" AND "))
    }
}

fn order_by_key(table: &TableSpec) -> String {
    if table.primary_key.is_empty() {
        return String::new();
    }
    let cols: Vec<String> = table.primary_key.iter().map(|c| quoted(c)).collect();
    format!(" ORDER BY {}", cols.join(", "))
}

/// SELECT with conjunctive conditions, ORDER BY primary key, optional LIMIT/OFFSET.
pub fn select(schema: &str, table: &TableSpec, selection: &Selection) -> QueryBuf {
    let mut q = QueryBuf::new();
    let where_sql = where_clause(&mut q, table, &selection.conditions);
    let limit_clause = selection.limit.map(|n| format!(" LIMIT {}", n)).unwrap_or_default();
    let offset_clause = selection.offset.map(|n| format!(" OFFSET {}", n)).unwrap_or_default();
    q.sql = format!(
        "SELECT {} FROM {}{}{}{}{}",
        select_column_list(table),
        qualified_table(schema, &table.name),
        where_sql,
        order_by_key(table),
        limit_clause,
        offset_clause
    );
    q
}

/// INSERT of the columns present in `row`. Absent columns take the database default.
pub fn insert(schema: &str, table: &TableSpec, row: &Row) -> QueryBuf {
    let mut q = QueryBuf::new();
    let mut cols = Vec::new();
    let mut placeholders = Vec::new();
    for c in &table.columns {
        let Some(val) = row.get(&c.name) else { continue };
        let n = q.push_param(val.clone());
        cols.push(quoted(&c.name));
        placeholders.push(placeholder(table, &c.name, n));
    }
    let target = qualified_table(schema, &table.name);
    q.sql = if cols.is_empty() {
        format!("INSERT INTO {} DEFAULT VALUES RETURNING {}", target, select_column_list(table))
    } else {
        format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING {}",
            target,
            cols.join(", "),
            placeholders.join(", "),
            select_column_list(table)
        )
    };
    q
}

/// UPDATE ... SET only known columns present in `changes`. With no changes this degrades to a SELECT.
pub fn update(schema: &str, table: &TableSpec, conditions: &[Condition], changes: &Row) -> QueryBuf {
    let mut q = QueryBuf::new();
    let mut sets = Vec::new();
    for c in &table.columns {
        let Some(v) = changes.get(&c.name) else { continue };
        let n = q.push_param(v.clone());
        sets.push(format!("{} = {}", quoted(&c.name), placeholder(table, &c.name, n)));
    }
    if sets.is_empty() {
        return select(schema, table, &Selection::filter(conditions.to_vec()));
    }
    let where_sql = where_clause(&mut q, table, conditions);
    q.sql = format!(
        "UPDATE {} SET {}{} RETURNING {}",
        qualified_table(schema, &table.name),
        sets.join(", "),
        where_sql,
        select_column_list(table)
    );
    q
}

pub fn delete(schema: &str, table: &TableSpec, conditions: &[Condition]) -> QueryBuf {
    let mut q = QueryBuf::new();
    let where_sql = where_clause(&mut q, table, conditions);
    q.sql = format!(
        "DELETE FROM {}{} RETURNING {}",
        qualified_table(schema, &table.name),
        where_sql,
        select_column_list(table)
    );
    q
}

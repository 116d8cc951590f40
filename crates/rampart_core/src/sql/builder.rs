//! Statement builders.
//!
//! Pure functions, one per statement family. Each returns the SQL text plus
//! the values to bind; identifiers are quoted, values are always `$n`
//! placeholders. The only text spliced in verbatim is [`RawCondition`].

use std::collections::HashSet;
use std::str::FromStr;

use serde_json::{Map, Value};
use tokio_postgres::types::ToSql;

use super::condition::{RawCondition, RowFilter};
use super::ident::{quote_identifier, quote_literal, quote_role, TableRef};
use super::value::SqlValue;
use crate::error::{RampartError, RampartResult};
use crate::models::{
    AlterTableAction, ColumnDefinition, ColumnDescriptor, DefaultValue, PolicyDefinition,
    RowSecuritySettings,
};

/// SQL text with its bound values.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self { sql: sql.into(), params: Vec::new() }
    }

    fn with_params(sql: String, params: Vec<SqlValue>) -> Self {
        Self { sql, params }
    }

    /// Parameters in the form the driver expects.
    pub fn bind_params(&self) -> Vec<&(dyn ToSql + Sync)> {
        self.params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
    }
}

/// ORDER BY direction. Only these two keywords ever reach the SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

impl FromStr for SortDirection {
    type Err = RampartError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("asc") {
            Ok(Self::Asc)
        } else if s.eq_ignore_ascii_case("desc") {
            Ok(Self::Desc)
        } else {
            Err(RampartError::invalid_request_with_hint(
                format!("Invalid sort direction: {s}"),
                "Use ASC or DESC",
            ))
        }
    }
}

/// A single-column sort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub column: String,
    pub direction: SortDirection,
}

impl OrderBy {
    /// Build from optional request fields. No column means no ordering.
    pub fn from_request(
        column: Option<&str>,
        direction: Option<&str>,
    ) -> RampartResult<Option<Self>> {
        let direction = direction
            .filter(|d| !d.trim().is_empty())
            .map(|d| d.trim().parse())
            .transpose()?
            .unwrap_or_default();
        Ok(column
            .filter(|c| !c.is_empty())
            .map(|c| Self { column: c.to_string(), direction }))
    }
}

fn push_where(
    sql: &mut String,
    filter: Option<&RowFilter>,
    params: &mut Vec<SqlValue>,
) -> RampartResult<()> {
    if let Some(condition) = filter.map(|f| f.render(params)).transpose()?.flatten() {
        sql.push_str(" WHERE ");
        sql.push_str(&condition);
    }
    Ok(())
}

fn required_condition(filter: &RowFilter, params: &mut Vec<SqlValue>) -> RampartResult<String> {
    filter.render(params)?.ok_or_else(|| RampartError::missing("condition"))
}

// ========== Row access ==========

/// `SELECT * FROM t [WHERE ..] [ORDER BY ..] LIMIT $n OFFSET $m`
pub fn select_page(
    table: &TableRef,
    filter: Option<&RowFilter>,
    order: Option<&OrderBy>,
    limit: u32,
    offset: u64,
) -> RampartResult<Statement> {
    let mut params = Vec::new();
    let mut sql = format!("SELECT * FROM {table}");
    push_where(&mut sql, filter, &mut params)?;

    if let Some(order) = order {
        sql.push_str(&format!(
            " ORDER BY {} {}",
            quote_identifier(&order.column)?,
            order.direction.as_sql()
        ));
    }

    params.push(SqlValue::from(limit as u64));
    sql.push_str(&format!(" LIMIT ${}", params.len()));
    params.push(SqlValue::from(offset));
    sql.push_str(&format!(" OFFSET ${}", params.len()));

    Ok(Statement::with_params(sql, params))
}

/// `SELECT count(*) AS total FROM t [WHERE ..]`
pub fn count_rows(table: &TableRef, filter: Option<&RowFilter>) -> RampartResult<Statement> {
    let mut params = Vec::new();
    let mut sql = format!("SELECT count(*) AS total FROM {table}");
    push_where(&mut sql, filter, &mut params)?;
    Ok(Statement::with_params(sql, params))
}

/// `INSERT INTO t (..) VALUES ($1, ..) RETURNING *`
///
/// Columns the server generates (identity or `nextval` defaults) are left
/// out when the caller sends null for them. Non-null values are kept.
pub fn insert_row(
    table: &TableRef,
    values: &Map<String, Value>,
    columns: &[ColumnDescriptor],
) -> RampartResult<Statement> {
    let auto_generated: HashSet<&str> = columns
        .iter()
        .filter(|c| c.is_auto_generated())
        .map(|c| c.name.as_str())
        .collect();

    let mut names = Vec::new();
    let mut params = Vec::new();
    for (column, value) in values {
        if value.is_null() && auto_generated.contains(column.as_str()) {
            continue;
        }
        names.push(quote_identifier(column)?);
        params.push(SqlValue(value.clone()));
    }

    if names.is_empty() {
        return Ok(Statement::new(format!("INSERT INTO {table} DEFAULT VALUES RETURNING *")));
    }

    let placeholders: Vec<String> = (1..=params.len()).map(|i| format!("${i}")).collect();
    let sql = format!(
        "INSERT INTO {table} ({}) VALUES ({}) RETURNING *",
        names.join(", "),
        placeholders.join(", ")
    );
    Ok(Statement::with_params(sql, params))
}

/// `UPDATE t SET "a" = $1, .. WHERE <condition> RETURNING *`
pub fn update_rows(
    table: &TableRef,
    values: &Map<String, Value>,
    filter: &RowFilter,
) -> RampartResult<Statement> {
    if values.is_empty() {
        return Err(RampartError::missing("values"));
    }

    let mut params = Vec::with_capacity(values.len());
    let mut assignments = Vec::with_capacity(values.len());
    for (column, value) in values {
        params.push(SqlValue(value.clone()));
        assignments.push(format!("{} = ${}", quote_identifier(column)?, params.len()));
    }
    let condition = required_condition(filter, &mut params)?;

    let sql = format!(
        "UPDATE {table} SET {} WHERE {condition} RETURNING *",
        assignments.join(", ")
    );
    Ok(Statement::with_params(sql, params))
}

/// `DELETE FROM t WHERE <condition> RETURNING *`
pub fn delete_rows(table: &TableRef, filter: &RowFilter) -> RampartResult<Statement> {
    let mut params = Vec::new();
    let condition = required_condition(filter, &mut params)?;
    Ok(Statement::with_params(
        format!("DELETE FROM {table} WHERE {condition} RETURNING *"),
        params,
    ))
}

// ========== Table DDL ==========

/// One `CREATE TABLE` with inline column constraints.
///
/// A single primary-key column is declared inline; several become a
/// table-level `PRIMARY KEY (..)` constraint.
pub fn create_table(table: &TableRef, columns: &[ColumnDefinition]) -> RampartResult<Statement> {
    if columns.is_empty() {
        return Err(RampartError::missing("columns"));
    }

    let mut seen = HashSet::new();
    for column in columns {
        if !seen.insert(column.name.as_str()) {
            return Err(RampartError::invalid_request(format!(
                "Column {:?} is defined more than once",
                column.name
            )));
        }
    }

    let pk_columns: Vec<&ColumnDefinition> = columns.iter().filter(|c| c.primary_key).collect();
    let inline_pk = pk_columns.len() == 1;

    let mut parts = Vec::with_capacity(columns.len() + 1);
    for column in columns {
        parts.push(column_sql(table, column, inline_pk)?);
    }
    if pk_columns.len() > 1 {
        let names = pk_columns
            .iter()
            .map(|c| quote_identifier(&c.name))
            .collect::<RampartResult<Vec<_>>>()?;
        parts.push(format!("PRIMARY KEY ({})", names.join(", ")));
    }

    Ok(Statement::new(format!("CREATE TABLE {table} ({})", parts.join(", "))))
}

fn column_sql(
    table: &TableRef,
    column: &ColumnDefinition,
    inline_pk: bool,
) -> RampartResult<String> {
    let mut sql = format!("{} {}", quote_identifier(&column.name)?, column.data_type);

    if column.primary_key && inline_pk {
        sql.push_str(" PRIMARY KEY");
    }
    if column.not_null {
        sql.push_str(" NOT NULL");
    }
    if column.unique {
        sql.push_str(" UNIQUE");
    }
    if let Some(default) = &column.default {
        sql.push_str(" DEFAULT ");
        sql.push_str(&default_sql(default)?);
    }
    if let Some(fk) = &column.references {
        sql.push_str(&format!(
            " REFERENCES {} ({})",
            table.sibling(&fk.table)?,
            quote_identifier(&fk.column)?
        ));
        if let Some(action) = fk.on_delete {
            sql.push_str(" ON DELETE ");
            sql.push_str(action.as_sql());
        }
        if let Some(action) = fk.on_update {
            sql.push_str(" ON UPDATE ");
            sql.push_str(action.as_sql());
        }
    }
    Ok(sql)
}

fn default_sql(default: &DefaultValue) -> RampartResult<String> {
    match default {
        DefaultValue::Literal(Value::Null) => Ok("NULL".to_string()),
        DefaultValue::Literal(Value::Bool(b)) => Ok(if *b { "TRUE" } else { "FALSE" }.to_string()),
        DefaultValue::Literal(Value::Number(n)) => Ok(n.to_string()),
        DefaultValue::Literal(Value::String(s)) => quote_literal(s),
        DefaultValue::Literal(other) => quote_literal(&other.to_string()),
        DefaultValue::Function(function) => Ok(function.as_sql().to_string()),
        DefaultValue::Expression(expr) => {
            let raw = RawCondition::trusted(expr.as_str());
            if raw.is_blank() {
                return Err(RampartError::missing("default.value"));
            }
            Ok(format!("({})", raw.as_sql()))
        }
    }
}

/// Exactly one `ALTER TABLE` for the requested change.
pub fn alter_table(table: &TableRef, action: &AlterTableAction) -> RampartResult<Statement> {
    let sql = match action {
        AlterTableAction::AddColumn { column } => {
            format!("ALTER TABLE {table} ADD COLUMN {}", column_sql(table, column, true)?)
        }
        AlterTableAction::DropColumn { column, cascade } => format!(
            "ALTER TABLE {table} DROP COLUMN {}{}",
            quote_identifier(column)?,
            if *cascade { " CASCADE" } else { "" }
        ),
        AlterTableAction::RenameColumn { from, to } => format!(
            "ALTER TABLE {table} RENAME COLUMN {} TO {}",
            quote_identifier(from)?,
            quote_identifier(to)?
        ),
        AlterTableAction::RenameTable { to } => {
            format!("ALTER TABLE {table} RENAME TO {}", quote_identifier(to)?)
        }
    };
    Ok(Statement::new(sql))
}

pub fn drop_table(table: &TableRef, cascade: bool) -> Statement {
    Statement::new(format!("DROP TABLE {table}{}", if cascade { " CASCADE" } else { "" }))
}

// ========== Row-level security ==========

pub fn enable_row_security(table: &TableRef) -> Statement {
    Statement::new(format!("ALTER TABLE {table} ENABLE ROW LEVEL SECURITY"))
}

/// One `ALTER TABLE` carrying the requested ENABLE/FORCE switches.
pub fn set_row_security(
    table: &TableRef,
    settings: &RowSecuritySettings,
) -> RampartResult<Statement> {
    let mut actions = Vec::with_capacity(2);
    match settings.enabled {
        Some(true) => actions.push("ENABLE ROW LEVEL SECURITY"),
        Some(false) => actions.push("DISABLE ROW LEVEL SECURITY"),
        None => {}
    }
    match settings.forced {
        Some(true) => actions.push("FORCE ROW LEVEL SECURITY"),
        Some(false) => actions.push("NO FORCE ROW LEVEL SECURITY"),
        None => {}
    }
    if actions.is_empty() {
        return Err(RampartError::missing("enabled or forced"));
    }
    Ok(Statement::new(format!("ALTER TABLE {table} {}", actions.join(", "))))
}

/// `CREATE POLICY "p" ON t [AS RESTRICTIVE] FOR <cmd> [TO ..] [USING (..)] [WITH CHECK (..)]`
pub fn create_policy(table: &TableRef, policy: &PolicyDefinition) -> RampartResult<Statement> {
    let name = quote_identifier(&policy.name)?;
    let command = policy.command;

    // Policy clauses are operator-written SQL, like row filters.
    let using = policy
        .using_expression
        .as_deref()
        .map(RawCondition::trusted)
        .filter(|c| !c.is_blank());
    let with_check = policy
        .with_check_expression
        .as_deref()
        .map(RawCondition::trusted)
        .filter(|c| !c.is_blank());

    if using.is_some() && !command.allows_using() {
        return Err(RampartError::invalid_request(format!(
            "{} policies cannot have a USING clause",
            command.as_sql()
        )));
    }
    if with_check.is_some() && !command.allows_with_check() {
        return Err(RampartError::invalid_request(format!(
            "{} policies cannot have a WITH CHECK clause",
            command.as_sql()
        )));
    }

    let mut sql = format!("CREATE POLICY {name} ON {table}");
    if !policy.permissive {
        sql.push_str(" AS RESTRICTIVE");
    }
    sql.push_str(" FOR ");
    sql.push_str(command.as_sql());

    let roles = policy
        .roles
        .iter()
        .filter(|r| !r.trim().is_empty())
        .map(|r| quote_role(r))
        .collect::<RampartResult<Vec<_>>>()?;
    if !roles.is_empty() {
        sql.push_str(" TO ");
        sql.push_str(&roles.join(", "));
    }
    if let Some(using) = using {
        sql.push_str(&format!(" USING ({})", using.as_sql()));
    }
    if let Some(check) = with_check {
        sql.push_str(&format!(" WITH CHECK ({})", check.as_sql()));
    }

    Ok(Statement::new(sql))
}

pub fn drop_policy(table: &TableRef, name: &str, if_exists: bool) -> RampartResult<Statement> {
    Ok(Statement::new(format!(
        "DROP POLICY {}{} ON {table}",
        if if_exists { "IF EXISTS " } else { "" },
        quote_identifier(name)?
    )))
}

/// Replace-by-name: enable RLS, drop any policy of that name, create it.
///
/// The statements are meant to run in one transaction.
pub fn upsert_policy(table: &TableRef, policy: &PolicyDefinition) -> RampartResult<Vec<Statement>> {
    let create = create_policy(table, policy)?;
    Ok(vec![enable_row_security(table), drop_policy(table, &policy.name, true)?, create])
}

//! Table DDL commands.

use super::execute_atomically;
use crate::error::RampartResult;
use crate::models::{AlterTableAction, ConnectionSpec, CreateTableRequest, DropTableRequest};
use crate::sql::builder;
use crate::state::RampartState;

/// Create a table from an ordered list of column definitions.
///
/// A failing statement (for instance a foreign key to a missing column)
/// leaves no table behind.
pub async fn create_table(
    state: &RampartState,
    spec: &ConnectionSpec,
    table_name: &str,
    request: CreateTableRequest,
) -> RampartResult<()> {
    let table = state.table(table_name)?;
    let statement = builder::create_table(&table, &request.columns)?;

    let mut conn = state.acquire(spec).await?;
    execute_atomically(&mut conn, &[statement]).await?;
    tracing::info!(table = %table, columns = request.columns.len(), "Table created");
    Ok(())
}

/// Apply one ALTER TABLE action.
pub async fn alter_table(
    state: &RampartState,
    spec: &ConnectionSpec,
    table_name: &str,
    action: AlterTableAction,
) -> RampartResult<()> {
    let table = state.table(table_name)?;
    let statement = builder::alter_table(&table, &action)?;

    let mut conn = state.acquire(spec).await?;
    execute_atomically(&mut conn, &[statement]).await?;
    tracing::info!(table = %table, action = ?action, "Table altered");
    Ok(())
}

pub async fn drop_table(
    state: &RampartState,
    spec: &ConnectionSpec,
    table_name: &str,
    request: DropTableRequest,
) -> RampartResult<()> {
    let table = state.table(table_name)?;
    let statement = builder::drop_table(&table, request.cascade);

    let mut conn = state.acquire(spec).await?;
    execute_atomically(&mut conn, &[statement]).await?;
    tracing::info!(table = %table, cascade = request.cascade, "Table dropped");
    Ok(())
}

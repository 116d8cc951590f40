//! Table browsing and row editing commands.

use futures_util::try_join;
use tokio_postgres::GenericClient;

use crate::error::{RampartError, RampartResult};
use crate::models::{
    ConnectionSpec, DeleteRowsRequest, FetchRowsRequest, InsertRowRequest, Pagination, QueryResult,
    RowsPage, TableDetails, UpdateRowsRequest,
};
use crate::services::{QueryService, SchemaService};
use crate::sql::{builder, OrderBy, Statement};
use crate::state::RampartState;

/// Structure, keys, sample rows and row count of one table.
pub async fn describe_table(
    state: &RampartState,
    spec: &ConnectionSpec,
    table_name: &str,
) -> RampartResult<TableDetails> {
    let table = state.table(table_name)?;
    let mut conn = state.acquire(spec).await?;
    SchemaService::describe_table(conn.client_mut(), &table, state.config().sample_row_limit).await
}

/// One page of rows plus page bookkeeping.
pub async fn fetch_rows(
    state: &RampartState,
    spec: &ConnectionSpec,
    table_name: &str,
    request: FetchRowsRequest,
) -> RampartResult<RowsPage> {
    let table = state.table(table_name)?;
    let FetchRowsRequest { page, page_size, order_by, order_direction, selection } = request;
    Pagination::check(page, page_size, state.config().max_page_size)?;

    let order = OrderBy::from_request(order_by.as_deref(), order_direction.as_deref())?;
    let filter = selection.into_filter()?;
    let select = builder::select_page(
        &table,
        filter.as_ref(),
        order.as_ref(),
        page_size,
        Pagination::offset(page, page_size),
    )?;
    let count = builder::count_rows(&table, filter.as_ref())?;

    let conn = state.acquire(spec).await?;
    let client = conn.client();
    let (result, total_rows) =
        try_join!(QueryService::execute(client, &select), count_total(client, &count))?;

    tracing::debug!(table = %table, page, page_size, total_rows, "Fetched rows");
    Ok(RowsPage {
        columns: result.columns,
        rows: result.rows,
        pagination: Pagination::new(page, page_size, total_rows),
    })
}

async fn count_total<C>(client: &C, statement: &Statement) -> RampartResult<u64>
where
    C: GenericClient + Sync,
{
    let row = client.query_one(statement.sql.as_str(), &statement.bind_params()).await?;
    let total: i64 = row.get("total");
    Ok(total.max(0) as u64)
}

/// Insert one row and return it as stored.
///
/// Server-generated columns left null by the caller are omitted so their
/// defaults apply.
pub async fn insert_row(
    state: &RampartState,
    spec: &ConnectionSpec,
    table_name: &str,
    request: InsertRowRequest,
) -> RampartResult<QueryResult> {
    let table = state.table(table_name)?;
    let conn = state.acquire(spec).await?;

    let columns = SchemaService::load_columns(conn.client(), &table).await?;
    if columns.is_empty() {
        return Err(RampartError::not_found(format!("Table {table} does not exist")));
    }
    let statement = builder::insert_row(&table, &request.values, &columns)?;
    QueryService::execute(conn.client(), &statement).await
}

/// Update the selected rows and return them. Matching nothing is `NotFound`.
pub async fn update_rows(
    state: &RampartState,
    spec: &ConnectionSpec,
    table_name: &str,
    request: UpdateRowsRequest,
) -> RampartResult<QueryResult> {
    let table = state.table(table_name)?;
    let filter = request.selection.into_required_filter()?;
    let statement = builder::update_rows(&table, &request.values, &filter)?;

    let conn = state.acquire(spec).await?;
    let result = QueryService::execute(conn.client(), &statement).await?;
    require_affected(result, "updated")
}

/// Delete the selected rows and return them. Matching nothing is `NotFound`.
pub async fn delete_rows(
    state: &RampartState,
    spec: &ConnectionSpec,
    table_name: &str,
    request: DeleteRowsRequest,
) -> RampartResult<QueryResult> {
    let table = state.table(table_name)?;
    let filter = request.selection.into_required_filter()?;
    let statement = builder::delete_rows(&table, &filter)?;

    let conn = state.acquire(spec).await?;
    let result = QueryService::execute(conn.client(), &statement).await?;
    require_affected(result, "deleted")
}

fn require_affected(result: QueryResult, verb: &str) -> RampartResult<QueryResult> {
    if result.row_count == 0 {
        return Err(RampartError::not_found(format!("No rows matched the condition; nothing {verb}")));
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::unreachable_spec;
    use crate::models::RowSelection;
    use serde_json::{json, Map};

    #[tokio::test]
    async fn test_page_zero_rejected_before_connecting() {
        let state = RampartState::default();
        let request = FetchRowsRequest { page: 0, ..FetchRowsRequest::default() };
        let result = fetch_rows(&state, &unreachable_spec(), "users", request).await;
        assert!(matches!(result, Err(RampartError::InvalidRequest { .. })));
    }

    #[tokio::test]
    async fn test_oversized_page_rejected() {
        let state = RampartState::default();
        let request = FetchRowsRequest { page_size: 5000, ..FetchRowsRequest::default() };
        let result = fetch_rows(&state, &unreachable_spec(), "users", request).await;
        assert!(matches!(result, Err(RampartError::InvalidRequest { .. })));
    }

    #[tokio::test]
    async fn test_bad_sort_direction_rejected() {
        let state = RampartState::default();
        let request = FetchRowsRequest {
            order_by: Some("id".into()),
            order_direction: Some("ASC; DROP TABLE users".into()),
            ..FetchRowsRequest::default()
        };
        let result = fetch_rows(&state, &unreachable_spec(), "users", request).await;
        assert!(matches!(result, Err(RampartError::InvalidRequest { .. })));
    }

    #[tokio::test]
    async fn test_update_without_condition_rejected() {
        let state = RampartState::default();
        let values: Map<String, serde_json::Value> =
            json!({"name": "x"}).as_object().cloned().unwrap();
        let request = UpdateRowsRequest { values, selection: RowSelection::default() };
        let result = update_rows(&state, &unreachable_spec(), "users", request).await;
        assert!(matches!(result, Err(RampartError::MissingParameter { .. })));
    }

    #[tokio::test]
    async fn test_delete_with_blank_condition_rejected() {
        let state = RampartState::default();
        let request = DeleteRowsRequest { selection: RowSelection::raw("   ") };
        let result = delete_rows(&state, &unreachable_spec(), "users", request).await;
        assert!(matches!(result, Err(RampartError::MissingParameter { .. })));
    }

    #[tokio::test]
    async fn test_invalid_table_name_rejected() {
        let state = RampartState::default();
        let result = describe_table(&state, &unreachable_spec(), &"x".repeat(64)).await;
        assert!(matches!(result, Err(RampartError::InvalidIdentifier { .. })));
    }

    #[test]
    fn test_zero_affected_rows_is_not_found() {
        let empty = QueryResult { columns: vec!["id".into()], ..QueryResult::default() };
        assert!(matches!(require_affected(empty, "updated"), Err(RampartError::NotFound { .. })));

        let one = QueryResult { row_count: 1, ..QueryResult::default() };
        assert!(require_affected(one, "updated").is_ok());
    }
}

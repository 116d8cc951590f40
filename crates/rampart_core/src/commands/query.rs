//! Ad-hoc SQL command.

use crate::error::{RampartError, RampartResult};
use crate::models::{ConnectionSpec, QueryResult};
use crate::services::QueryService;
use crate::state::RampartState;

/// Run operator-written SQL as-is and return its normalized result.
pub async fn run_query(
    state: &RampartState,
    spec: &ConnectionSpec,
    sql: &str,
) -> RampartResult<QueryResult> {
    if sql.trim().is_empty() {
        return Err(RampartError::missing("sql"));
    }

    let conn = state.acquire(spec).await?;
    let result = QueryService::run_script(conn.client(), sql).await;
    match &result {
        Ok(r) => tracing::debug!(row_count = r.row_count, columns = r.columns.len(), "Query completed"),
        Err(e) => tracing::warn!(category = e.category(), code = ?e.pg_code(), "Query failed"),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::unreachable_spec;

    #[tokio::test]
    async fn test_blank_sql_rejected() {
        let state = RampartState::default();
        let result = run_query(&state, &unreachable_spec(), " \n ").await;
        assert!(matches!(result, Err(RampartError::MissingParameter { .. })));
    }
}

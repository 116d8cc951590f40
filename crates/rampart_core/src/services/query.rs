//! Statement execution and result normalization.
//!
//! Statements are prepared first so the column list comes from the server
//! even when no rows come back. Row-returning statements report the number
//! of rows; other statements report the engine's affected-row count.

use std::time::Instant;

use serde_json::{Map, Value as JsonValue};
use tokio_postgres::{Client, GenericClient, SimpleQueryMessage};

use super::normalize::{column_labels, row_to_json};
use crate::error::{RampartError, RampartResult};
use crate::models::QueryResult;
use crate::sql::Statement;

/// SQLSTATE raised when several commands are sent to `prepare`.
const SYNTAX_ERROR: &str = "42601";

/// Service for executing statements and normalizing their results.
pub struct QueryService;

impl QueryService {
    /// Execute a built statement with its bound parameters.
    ///
    /// Works on a client or inside a transaction.
    pub async fn execute<C>(client: &C, statement: &Statement) -> RampartResult<QueryResult>
    where
        C: GenericClient + Sync,
    {
        let start = Instant::now();
        let prepared = client.prepare(&statement.sql).await?;
        let columns = column_labels(prepared.columns().iter().map(|c| c.name()));
        let params = statement.bind_params();

        let result = if columns.is_empty() {
            let affected = client.execute(&prepared, &params).await?;
            QueryResult { columns, rows: Vec::new(), row_count: affected }
        } else {
            let rows = client.query(&prepared, &params).await?;
            let rows = rows
                .iter()
                .map(|row| row_to_json(row, &columns))
                .collect::<RampartResult<Vec<_>>>()?;
            QueryResult { columns, row_count: rows.len() as u64, rows }
        };

        tracing::debug!(
            row_count = result.row_count,
            params = params.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Statement executed"
        );
        Ok(result)
    }

    /// Execute operator-supplied SQL with no parameters.
    ///
    /// A script of several statements cannot be prepared; it is sent
    /// through the simple query protocol instead. The last statement's
    /// result is returned, with every value in its text form.
    pub async fn run_script(client: &Client, sql: &str) -> RampartResult<QueryResult> {
        if sql.trim().is_empty() {
            return Err(RampartError::missing("sql"));
        }

        match Self::execute(client, &Statement::new(sql)).await {
            Err(RampartError::QueryExecutionFailed { code: Some(code), message, .. })
                if code == SYNTAX_ERROR && message.contains("multiple commands") =>
            {
                tracing::debug!("Falling back to simple query protocol for multi-statement script");
                Self::simple_query(client, sql).await
            }
            other => other,
        }
    }

    async fn simple_query(client: &Client, sql: &str) -> RampartResult<QueryResult> {
        let messages = client.simple_query(sql).await?;

        let mut result = QueryResult::default();
        let mut in_result_set = false;
        for message in messages {
            match message {
                SimpleQueryMessage::RowDescription(columns) => {
                    result = QueryResult {
                        columns: column_labels(columns.iter().map(|c| c.name())),
                        ..QueryResult::default()
                    };
                    in_result_set = true;
                }
                SimpleQueryMessage::Row(row) => {
                    let mut object = Map::with_capacity(result.columns.len());
                    for (i, label) in result.columns.iter().enumerate() {
                        let value = row
                            .try_get(i)?
                            .map(|v| JsonValue::String(v.to_string()))
                            .unwrap_or(JsonValue::Null);
                        object.insert(label.clone(), value);
                    }
                    result.rows.push(object);
                    result.row_count += 1;
                }
                SimpleQueryMessage::CommandComplete(affected) => {
                    if !in_result_set {
                        result = QueryResult { row_count: affected, ..QueryResult::default() };
                    }
                    in_result_set = false;
                }
                _ => {}
            }
        }
        Ok(result)
    }
}

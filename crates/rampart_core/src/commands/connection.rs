//! Connection commands.

use std::time::Instant;

use crate::error::RampartResult;
use crate::models::{ConnectResponse, ConnectionSpec, ConnectionTestResult};
use crate::services::SchemaService;
use crate::state::RampartState;

/// Check that a spec reaches a server, reporting its version and latency.
pub async fn test_connection(
    state: &RampartState,
    spec: &ConnectionSpec,
) -> RampartResult<ConnectionTestResult> {
    let start = Instant::now();
    let conn = state.acquire(spec).await?;
    let row = conn.client().query_one("SELECT version()", &[]).await?;
    let server_version: String = row.get(0);
    let latency_ms = start.elapsed().as_millis() as u64;
    conn.release();

    tracing::info!(host = %spec.host, database = %spec.database, latency_ms, "Connection test succeeded");
    Ok(ConnectionTestResult { server_version, latency_ms })
}

/// Connect and list the tables of the application schema.
pub async fn connect(state: &RampartState, spec: &ConnectionSpec) -> RampartResult<ConnectResponse> {
    let conn = state.acquire(spec).await?;
    let tables = SchemaService::list_tables(conn.client(), &state.config().default_schema).await?;

    tracing::info!(
        host = %spec.host,
        database = %spec.database,
        tables = tables.len(),
        tunneled = spec.tunnel.is_some(),
        "Connected"
    );
    Ok(ConnectResponse { tables })
}

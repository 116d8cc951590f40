//! Request/response operations exposed to the UI layer.
//!
//! Each command takes the shared [`RampartState`](crate::state::RampartState),
//! a complete [`ConnectionSpec`](crate::models::ConnectionSpec) and its own
//! arguments. Inputs are validated and statements built before any
//! connection is opened; the connection (and tunnel) is released when the
//! command returns, on every path.

pub mod connection;
pub mod ddl;
pub mod policy;
pub mod query;
pub mod table;

pub use connection::{connect, test_connection};
pub use ddl::{alter_table, create_table, drop_table};
pub use policy::{delete_policy, list_policies, set_row_security, upsert_policy};
pub use query::run_query;
pub use table::{delete_rows, describe_table, fetch_rows, insert_row, update_rows};

use crate::error::RampartResult;
use crate::services::PgConnection;
use crate::sql::Statement;

/// Run `statements` in order inside one transaction.
async fn execute_atomically(conn: &mut PgConnection, statements: &[Statement]) -> RampartResult<()> {
    let tx = conn.client_mut().transaction().await?;
    for statement in statements {
        tracing::debug!(sql = %statement.sql, "Executing DDL");
        tx.execute(statement.sql.as_str(), &statement.bind_params()).await?;
    }
    tx.commit().await?;
    Ok(())
}

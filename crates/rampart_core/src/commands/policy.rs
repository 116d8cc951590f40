//! Row-level security commands.

use super::execute_atomically;
use crate::error::{RampartError, RampartResult};
use crate::models::{ConnectionSpec, PolicyDefinition, PolicyListing, RowSecuritySettings, TableRlsState};
use crate::services::SchemaService;
use crate::sql::builder;
use crate::state::RampartState;

/// Policies and RLS switches in the application schema, optionally for one table.
pub async fn list_policies(
    state: &RampartState,
    spec: &ConnectionSpec,
    table_filter: Option<&str>,
) -> RampartResult<PolicyListing> {
    let table_filter = table_filter.filter(|t| !t.trim().is_empty());
    if let Some(name) = table_filter {
        state.table(name)?;
    }

    let conn = state.acquire(spec).await?;
    SchemaService::list_policies(conn.client(), &state.config().default_schema, table_filter).await
}

/// Create a policy, replacing any policy of the same name on the table.
///
/// Enables RLS on the table first. All three steps run in one transaction.
pub async fn upsert_policy(
    state: &RampartState,
    spec: &ConnectionSpec,
    table_name: &str,
    policy: PolicyDefinition,
) -> RampartResult<()> {
    let table = state.table(table_name)?;
    if policy.name.trim().is_empty() {
        return Err(RampartError::missing("policy.name"));
    }
    let statements = builder::upsert_policy(&table, &policy)?;

    let mut conn = state.acquire(spec).await?;
    execute_atomically(&mut conn, &statements).await?;
    tracing::info!(table = %table, policy = %policy.name, command = policy.command.as_sql(), "Policy saved");
    Ok(())
}

/// Drop a policy by name. A missing policy is an engine error.
pub async fn delete_policy(
    state: &RampartState,
    spec: &ConnectionSpec,
    table_name: &str,
    policy_name: &str,
) -> RampartResult<()> {
    let table = state.table(table_name)?;
    if policy_name.trim().is_empty() {
        return Err(RampartError::missing("policyName"));
    }
    let statement = builder::drop_policy(&table, policy_name, false)?;

    let mut conn = state.acquire(spec).await?;
    execute_atomically(&mut conn, &[statement]).await?;
    tracing::info!(table = %table, policy = policy_name, "Policy dropped");
    Ok(())
}

/// Turn RLS enforcement on or off, and force it for the table owner.
///
/// Returns the table's switches as read back afterwards.
pub async fn set_row_security(
    state: &RampartState,
    spec: &ConnectionSpec,
    table_name: &str,
    settings: RowSecuritySettings,
) -> RampartResult<TableRlsState> {
    let table = state.table(table_name)?;
    let statement = builder::set_row_security(&table, &settings)?;

    let mut conn = state.acquire(spec).await?;
    execute_atomically(&mut conn, &[statement]).await?;

    let listing =
        SchemaService::list_policies(conn.client(), table.schema(), Some(table.name())).await?;
    listing
        .tables_with_rls
        .into_iter()
        .next()
        .ok_or_else(|| RampartError::not_found(format!("Table {table} does not exist")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::unreachable_spec;
    use crate::models::PolicyCommand;

    #[tokio::test]
    async fn test_insert_policy_with_using_rejected() {
        let state = RampartState::default();
        let policy = PolicyDefinition::new("own_rows", PolicyCommand::Insert).using("owner = current_user");
        let result = upsert_policy(&state, &unreachable_spec(), "documents", policy).await;
        assert!(matches!(result, Err(RampartError::InvalidRequest { .. })));
    }

    #[tokio::test]
    async fn test_unnamed_policy_rejected() {
        let state = RampartState::default();
        let policy = PolicyDefinition::new("  ", PolicyCommand::Select);
        let result = upsert_policy(&state, &unreachable_spec(), "documents", policy).await;
        assert!(matches!(result, Err(RampartError::MissingParameter { .. })));

        let result = delete_policy(&state, &unreachable_spec(), "documents", "").await;
        assert!(matches!(result, Err(RampartError::MissingParameter { .. })));
    }

    #[tokio::test]
    async fn test_empty_settings_rejected() {
        let state = RampartState::default();
        let settings = RowSecuritySettings { enabled: None, forced: None };
        let result = set_row_security(&state, &unreachable_spec(), "documents", settings).await;
        assert!(matches!(result, Err(RampartError::MissingParameter { .. })));
    }
}

//! Schema introspection service.
//!
//! Queries PostgreSQL system catalogs for table lists, column metadata,
//! key maps and row-level security state. Nothing is cached: every call
//! reads the catalogs again.

use futures_util::try_join;
use tokio_postgres::{Client, GenericClient, IsolationLevel};

use super::query::QueryService;
use crate::error::{RampartError, RampartResult};
use crate::models::{
    ColumnDescriptor, ForeignKeyDescriptor, PolicyCommand, PolicyListing, QueryResult, RlsPolicy,
    TableDescriptor, TableDetails, TableRlsState,
};
use crate::sql::{builder, TableRef};

/// Schema introspection service.
pub struct SchemaService;

fn catalog_error(err: tokio_postgres::Error) -> RampartError {
    RampartError::from(err).into_schema_error()
}

impl SchemaService {
    /// Ordinary and partitioned tables in `schema`, alphabetically.
    pub async fn list_tables<C>(client: &C, schema: &str) -> RampartResult<Vec<String>>
    where
        C: GenericClient + Sync,
    {
        let rows = client
            .query(
                r#"
                SELECT c.relname AS name
                FROM pg_catalog.pg_class c
                JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
                WHERE n.nspname = $1
                  AND c.relkind IN ('r', 'p')
                ORDER BY c.relname
                "#,
                &[&schema],
            )
            .await
            .map_err(catalog_error)?;

        Ok(rows.into_iter().map(|row| row.get("name")).collect())
    }

    /// Structure, keys, a bounded sample and the row count of one table.
    ///
    /// Everything is read inside one read-only REPEATABLE READ transaction,
    /// so the four parts describe the same snapshot. Any failure fails the
    /// whole call.
    pub async fn describe_table(
        client: &mut Client,
        table: &TableRef,
        sample_limit: u32,
    ) -> RampartResult<TableDetails> {
        tracing::debug!(table = %table, "Describing table");

        let tx = client
            .build_transaction()
            .isolation_level(IsolationLevel::RepeatableRead)
            .read_only(true)
            .start()
            .await
            .map_err(catalog_error)?;

        let columns = Self::load_columns(&tx, table).await?;
        if columns.is_empty() {
            return Err(RampartError::not_found(format!("Table {table} does not exist")));
        }

        let (primary_keys, foreign_keys, sample, total_rows) = try_join!(
            Self::load_primary_keys(&tx, table),
            Self::load_foreign_keys(&tx, table),
            Self::load_sample(&tx, table, sample_limit),
            Self::count_rows(&tx, table),
        )?;

        tx.commit().await.map_err(catalog_error)?;

        Ok(TableDetails {
            descriptor: TableDescriptor {
                name: table.name().to_string(),
                columns,
                primary_keys,
                foreign_keys,
            },
            sample,
            total_rows,
        })
    }

    /// Columns of a table in ordinal order. Empty when the table is missing.
    pub async fn load_columns<C>(client: &C, table: &TableRef) -> RampartResult<Vec<ColumnDescriptor>>
    where
        C: GenericClient + Sync,
    {
        let rows = client
            .query(
                r#"
                SELECT
                    a.attname AS name,
                    pg_catalog.format_type(a.atttypid, NULL) AS data_type,
                    NOT a.attnotnull AS nullable,
                    pg_get_expr(d.adbin, d.adrelid) AS default_expression,
                    CASE WHEN a.atttypid IN (1042, 1043) AND a.atttypmod > 0
                         THEN a.atttypmod - 4
                    END AS max_length,
                    a.attidentity <> '' AS is_identity
                FROM pg_catalog.pg_attribute a
                JOIN pg_catalog.pg_class c ON c.oid = a.attrelid
                JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
                LEFT JOIN pg_catalog.pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
                WHERE n.nspname = $1
                  AND c.relname = $2
                  AND c.relkind IN ('r', 'p')
                  AND a.attnum > 0
                  AND NOT a.attisdropped
                ORDER BY a.attnum
                "#,
                &[&table.schema(), &table.name()],
            )
            .await
            .map_err(catalog_error)?;

        Ok(rows
            .into_iter()
            .map(|row| ColumnDescriptor {
                name: row.get("name"),
                data_type: row.get("data_type"),
                nullable: row.get("nullable"),
                default_expression: row.get("default_expression"),
                max_length: row.get("max_length"),
                is_identity: row.get("is_identity"),
            })
            .collect())
    }

    /// Primary key columns in key order.
    pub async fn load_primary_keys<C>(client: &C, table: &TableRef) -> RampartResult<Vec<String>>
    where
        C: GenericClient + Sync,
    {
        let rows = client
            .query(
                r#"
                SELECT a.attname AS name
                FROM pg_catalog.pg_constraint con
                JOIN pg_catalog.pg_class c ON c.oid = con.conrelid
                JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
                CROSS JOIN LATERAL unnest(con.conkey) WITH ORDINALITY AS k(attnum, position)
                JOIN pg_catalog.pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.attnum
                WHERE n.nspname = $1
                  AND c.relname = $2
                  AND con.contype = 'p'
                ORDER BY k.position
                "#,
                &[&table.schema(), &table.name()],
            )
            .await
            .map_err(catalog_error)?;

        Ok(rows.into_iter().map(|row| row.get("name")).collect())
    }

    /// Foreign keys as column-to-column edges.
    ///
    /// A composite key contributes one edge per column pair.
    pub async fn load_foreign_keys<C>(
        client: &C,
        table: &TableRef,
    ) -> RampartResult<Vec<ForeignKeyDescriptor>>
    where
        C: GenericClient + Sync,
    {
        let rows = client
            .query(
                r#"
                SELECT
                    a.attname AS column_name,
                    rc.relname AS referenced_table,
                    ra.attname AS referenced_column
                FROM pg_catalog.pg_constraint con
                JOIN pg_catalog.pg_class c ON c.oid = con.conrelid
                JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
                JOIN pg_catalog.pg_class rc ON rc.oid = con.confrelid
                CROSS JOIN LATERAL unnest(con.conkey, con.confkey) AS k(attnum, ref_attnum)
                JOIN pg_catalog.pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.attnum
                JOIN pg_catalog.pg_attribute ra ON ra.attrelid = con.confrelid AND ra.attnum = k.ref_attnum
                WHERE n.nspname = $1
                  AND c.relname = $2
                  AND con.contype = 'f'
                ORDER BY con.conname, a.attnum
                "#,
                &[&table.schema(), &table.name()],
            )
            .await
            .map_err(catalog_error)?;

        Ok(rows
            .into_iter()
            .map(|row| ForeignKeyDescriptor {
                column: row.get("column_name"),
                referenced_table: row.get("referenced_table"),
                referenced_column: row.get("referenced_column"),
            })
            .collect())
    }

    async fn load_sample<C>(client: &C, table: &TableRef, limit: u32) -> RampartResult<QueryResult>
    where
        C: GenericClient + Sync,
    {
        let statement = builder::select_page(table, None, None, limit, 0)?;
        QueryService::execute(client, &statement)
            .await
            .map_err(RampartError::into_schema_error)
    }

    async fn count_rows<C>(client: &C, table: &TableRef) -> RampartResult<i64>
    where
        C: GenericClient + Sync,
    {
        let statement = builder::count_rows(table, None)?;
        let row = client
            .query_one(statement.sql.as_str(), &statement.bind_params())
            .await
            .map_err(catalog_error)?;
        Ok(row.get("total"))
    }

    /// RLS policies and per-table RLS switches in `schema`.
    ///
    /// Without a filter, `tables_with_rls` lists tables that have RLS
    /// enabled or forced, or carry policies. With a filter, it reports that
    /// one table whatever its state.
    pub async fn list_policies<C>(
        client: &C,
        schema: &str,
        table_filter: Option<&str>,
    ) -> RampartResult<PolicyListing>
    where
        C: GenericClient + Sync,
    {
        let policy_rows = client
            .query(
                r#"
                SELECT
                    schemaname::text AS schema_name,
                    tablename::text AS table_name,
                    policyname::text AS name,
                    permissive = 'PERMISSIVE' AS permissive,
                    cmd AS command,
                    qual AS using_expression,
                    with_check AS with_check_expression,
                    roles::text[] AS roles
                FROM pg_catalog.pg_policies
                WHERE schemaname = $1
                  AND ($2::text IS NULL OR tablename = $2::text)
                ORDER BY tablename, policyname
                "#,
                &[&schema, &table_filter],
            )
            .await
            .map_err(catalog_error)?;

        let mut policies = Vec::with_capacity(policy_rows.len());
        for row in policy_rows {
            let command: String = row.get("command");
            policies.push(RlsPolicy {
                schema: row.get("schema_name"),
                table: row.get("table_name"),
                name: row.get("name"),
                permissive: row.get("permissive"),
                command: command.parse::<PolicyCommand>().map_err(|_| {
                    RampartError::schema_query(format!("Unexpected policy command {command}"))
                })?,
                using_expression: row.get("using_expression"),
                with_check_expression: row.get("with_check_expression"),
                roles: row.get("roles"),
            });
        }

        let state_rows = client
            .query(
                r#"
                SELECT
                    c.relname AS table_name,
                    c.relrowsecurity AS rls_enabled,
                    c.relforcerowsecurity AS rls_forced
                FROM pg_catalog.pg_class c
                JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
                WHERE n.nspname = $1
                  AND c.relkind IN ('r', 'p')
                  AND ($2::text IS NULL OR c.relname = $2::text)
                  AND (
                      $2::text IS NOT NULL
                      OR c.relrowsecurity
                      OR c.relforcerowsecurity
                      OR EXISTS (SELECT 1 FROM pg_catalog.pg_policy p WHERE p.polrelid = c.oid)
                  )
                ORDER BY c.relname
                "#,
                &[&schema, &table_filter],
            )
            .await
            .map_err(catalog_error)?;

        let tables_with_rls = state_rows
            .into_iter()
            .map(|row| TableRlsState {
                table: row.get("table_name"),
                rls_enabled: row.get("rls_enabled"),
                rls_forced: row.get("rls_forced"),
            })
            .collect();

        tracing::debug!(schema, policies = policies.len(), "Listed RLS policies");
        Ok(PolicyListing { policies, tables_with_rls })
    }
}

//! Data models for the Rampart core.
//!
//! This module contains all core data structures:
//! - `connection` - ConnectionSpec, TunnelSpec, SslMode, Secret
//! - `schema` - TableDescriptor, ColumnDescriptor, RLS policy listings
//! - `query` - QueryResult, Pagination, RowsPage
//! - `ddl` - ColumnType allow-list, ColumnDefinition, AlterTableAction
//! - `request` - Operation payloads (fetch, insert, update, policy, ...)
//! - `error` - ErrorResponse for the UI layer

pub mod connection;
pub mod ddl;
pub mod error;
pub mod query;
pub mod request;
pub mod schema;

pub use connection::{ConnectionSpec, Endpoint, Secret, SslMode, TunnelAuth, TunnelSpec};
pub use ddl::{
    AlterTableAction, ColumnDefinition, ColumnType, DefaultFunction, DefaultValue,
    ForeignKeyReference, ReferentialAction,
};
pub use error::{ErrorKind, ErrorResponse};
pub use query::{ConnectResponse, ConnectionTestResult, Pagination, QueryResult, RowsPage};
pub use request::{
    CreateTableRequest, DeleteRowsRequest, DropTableRequest, FetchRowsRequest, InsertRowRequest,
    PolicyDefinition, RowSecuritySettings, RowSelection, UpdateRowsRequest,
};
pub use schema::{
    ColumnDescriptor, ForeignKeyDescriptor, PolicyCommand, PolicyListing, RlsPolicy, TableDescriptor,
    TableDetails, TableRlsState,
};

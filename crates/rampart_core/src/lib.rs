//! Core of the Rampart PostgreSQL administration tool.
//!
//! This crate turns structured requests from the UI layer into safely
//! parameterized SQL, runs them on a per-request connection (optionally
//! through an SSH tunnel) and normalizes the results:
//!
//! - **error**: Error taxonomy with PostgreSQL-specific details
//! - **config**: Timeouts, pool sizing and the application schema
//! - **logging**: Structured logging setup
//! - **models**: Connection specs, schema descriptors, requests and results
//! - **sql**: Identifier quoting, bound values and statement builders
//! - **services**: Tunnels, pools, provisioning, introspection, execution
//! - **state**: Process-wide service state
//! - **commands**: One async function per UI operation

pub mod commands;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod services;
pub mod sql;
pub mod state;

pub use config::CoreConfig;
pub use error::{RampartError, RampartResult};
pub use models::{
    ConnectionSpec, ErrorResponse, PolicyListing, QueryResult, RowsPage, SslMode, TableDescriptor,
    TableDetails, TunnelSpec,
};
pub use services::{Provisioner, QueryService, SchemaService, ScopedConnection};
pub use state::RampartState;

//! Backend services for the Rampart core.
//!
//! - `tunnel` - SSH tunnels via russh, one per request
//! - `pool` - Keyed deadpool-postgres pools for direct connections
//! - `connection` - Per-request provisioning with guaranteed release
//! - `schema` - Catalog introspection (tables, columns, keys, RLS)
//! - `query` - Statement execution
//! - `normalize` - Row to JSON conversion

pub mod connection;
pub mod normalize;
pub mod pool;
pub mod query;
pub mod schema;
pub mod tunnel;

pub use connection::{DbConnector, PgConnection, PgConnector, Provisioner, ScopedConnection};
pub use normalize::{column_labels, row_to_json};
pub use pool::{PoolKey, PoolRegistry};
pub use query::QueryService;
pub use schema::SchemaService;
pub use tunnel::{SshTunnelConnector, TunnelConnector, TunnelError, TunnelHandle, TunnelState};

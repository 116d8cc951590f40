//! Process-wide service state.
//!
//! Holds only the configuration and the connection provisioner (with its
//! keyed pools). No per-user or per-screen state lives here: every command
//! receives its full connection spec and target table as arguments.

use crate::config::CoreConfig;
use crate::error::RampartResult;
use crate::models::ConnectionSpec;
use crate::services::{PgConnection, Provisioner, ScopedConnection};
use crate::sql::TableRef;

/// Shared state handed to every command.
pub struct RampartState {
    config: CoreConfig,
    provisioner: Provisioner,
}

impl RampartState {
    pub fn new(config: CoreConfig) -> Self {
        let provisioner = Provisioner::from_config(&config);
        tracing::info!(
            schema = %config.default_schema,
            pool_max_size = config.pool_max_size,
            connect_timeout_secs = config.connect_timeout_secs,
            "RampartState initialized"
        );
        Self { config, provisioner }
    }

    /// State configured from `RAMPART_*` environment variables.
    pub fn from_env() -> Self {
        Self::new(CoreConfig::from_env())
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn provisioner(&self) -> &Provisioner {
        &self.provisioner
    }

    /// Open a tunnel (if requested) and a database session for one request.
    pub async fn acquire(&self, spec: &ConnectionSpec) -> RampartResult<ScopedConnection<PgConnection>> {
        self.provisioner.acquire(spec).await
    }

    /// Resolve a caller-supplied table name in the application schema.
    pub fn table(&self, name: &str) -> RampartResult<TableRef> {
        TableRef::new(self.config.default_schema.clone(), name)
    }

    /// Close pools that have been idle past their lifetime.
    pub fn reap_idle_pools(&self) -> usize {
        self.provisioner.connector().pools().reap_idle()
    }
}

impl Default for RampartState {
    fn default() -> Self {
        Self::new(CoreConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RampartError;

    #[test]
    fn test_table_uses_default_schema() {
        let config = CoreConfig { default_schema: "app".into(), ..CoreConfig::default() };
        let state = RampartState::new(config);
        let table = state.table("users").unwrap();
        assert_eq!(table.schema(), "app");
        assert_eq!(table.to_string(), r#""app"."users""#);
    }

    #[test]
    fn test_table_rejects_bad_names() {
        let state = RampartState::default();
        assert!(matches!(state.table(""), Err(RampartError::MissingParameter { .. })));
        assert!(matches!(state.table("a\0b"), Err(RampartError::InvalidIdentifier { .. })));
    }

    #[tokio::test]
    async fn test_no_pools_before_first_request() {
        let state = RampartState::default();
        assert!(state.provisioner().connector().pools().is_empty());
        assert_eq!(state.reap_idle_pools(), 0);
    }
}

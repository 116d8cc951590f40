//! Runtime configuration for the core services.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunable limits shared by every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CoreConfig {
    /// Bound on TCP, SSH and PostgreSQL connection establishment
    pub connect_timeout_secs: u64,
    /// Maximum connections per keyed pool
    pub pool_max_size: usize,
    /// How long a request waits for a free pooled connection
    pub pool_wait_timeout_secs: u64,
    /// Idle lifetime of a keyed pool before it is reaped
    pub pool_idle_secs: u64,
    /// Row cap for the sample returned by describeTable
    pub sample_row_limit: u32,
    /// Upper bound for fetchRows page size
    pub max_page_size: u32,
    /// The application schema introspection and DML operate in
    pub default_schema: String,
    /// Sent to PostgreSQL as `application_name`
    pub application_name: String,
    /// Optional server-side statement timeout
    pub statement_timeout_secs: Option<u64>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 5,
            pool_max_size: 4,
            pool_wait_timeout_secs: 10,
            pool_idle_secs: 300,
            sample_row_limit: 10,
            max_page_size: 1000,
            default_schema: "public".to_string(),
            application_name: "rampart".to_string(),
            statement_timeout_secs: None,
        }
    }
}

impl CoreConfig {
    /// Build a config from defaults overridden by `RAMPART_*` variables.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        override_parsed(&lookup, "RAMPART_CONNECT_TIMEOUT_SECS", &mut config.connect_timeout_secs);
        override_parsed(&lookup, "RAMPART_POOL_MAX_SIZE", &mut config.pool_max_size);
        override_parsed(&lookup, "RAMPART_POOL_WAIT_TIMEOUT_SECS", &mut config.pool_wait_timeout_secs);
        override_parsed(&lookup, "RAMPART_POOL_IDLE_SECS", &mut config.pool_idle_secs);
        override_parsed(&lookup, "RAMPART_SAMPLE_ROWS", &mut config.sample_row_limit);
        override_parsed(&lookup, "RAMPART_MAX_PAGE_SIZE", &mut config.max_page_size);

        if let Some(schema) = lookup("RAMPART_SCHEMA").filter(|s| !s.trim().is_empty()) {
            config.default_schema = schema;
        }
        if let Some(secs) = lookup("RAMPART_STATEMENT_TIMEOUT_SECS") {
            match secs.parse() {
                Ok(secs) => config.statement_timeout_secs = Some(secs),
                Err(_) => tracing::warn!(value = %secs, "Ignoring RAMPART_STATEMENT_TIMEOUT_SECS"),
            }
        }

        config
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn pool_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_wait_timeout_secs)
    }

    pub fn pool_idle(&self) -> Duration {
        Duration::from_secs(self.pool_idle_secs)
    }
}

fn override_parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(value) => *target = value,
            Err(_) => tracing::warn!(variable = key, value = %raw, "Ignoring unparseable setting"),
        }
    }
}

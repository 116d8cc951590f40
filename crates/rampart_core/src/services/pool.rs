//! Keyed pools of direct database connections.
//!
//! One deadpool-postgres pool per distinct target (host, port, database,
//! user, credential, TLS settings). Each request still checks out its own
//! connection; the pool only saves the handshake. Pools nobody has used for
//! `pool_idle_secs` are closed.
//!
//! A connection handed back by one request is reset before the next request
//! gets it: any open or aborted transaction is rolled back, then session
//! settings, cursors, temp tables, listeners and advisory locks are cleared.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::time::Instant;

use deadpool_postgres::{Hook, HookError, Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use parking_lot::Mutex;

use super::connection::{pg_config, TlsSetting};
use crate::config::CoreConfig;
use crate::error::{RampartError, RampartResult};
use crate::models::{ConnectionSpec, SslMode};

/// Identity of a connection target.
///
/// The credential is folded into a hash so two users of the same server
/// never share a pool, without keeping a second copy of the secret.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    host: String,
    port: u16,
    database: String,
    username: String,
    credential: u64,
    ssl_mode: SslMode,
    ssl_ca_cert: Option<PathBuf>,
}

impl PoolKey {
    pub fn for_spec(spec: &ConnectionSpec) -> Self {
        let mut hasher = DefaultHasher::new();
        spec.password.hash(&mut hasher);
        Self {
            host: spec.host.clone(),
            port: spec.port,
            database: spec.database.clone(),
            username: spec.username.clone(),
            credential: hasher.finish(),
            ssl_mode: spec.ssl_mode,
            ssl_ca_cert: spec.ssl_ca_cert.clone(),
        }
    }
}

struct PoolEntry {
    pool: Pool,
    last_used: Instant,
}

impl PoolEntry {
    fn in_use(&self) -> bool {
        let status = self.pool.status();
        (status.size as i64) - (status.available as i64) > 0
    }
}

/// Roll back whatever transaction the previous holder left open.
///
/// Runs before `RecyclingMethod::Clean`, whose reset statements would
/// otherwise fail in an aborted transaction or be undone with an open one.
/// `DISCARD ALL` is avoided because it drops the type lookup statements
/// tokio-postgres keeps prepared for the life of the client.
fn rollback_open_transaction() -> Hook {
    Hook::async_fn(|client, _| {
        Box::pin(async move {
            client.simple_query("ROLLBACK").await.map_err(|e| {
                tracing::warn!(error = %e, "Discarding pooled connection that could not roll back");
                HookError::Backend(e)
            })?;
            Ok(())
        })
    })
}

/// Registry of keyed pools shared by all requests.
pub struct PoolRegistry {
    config: CoreConfig,
    pools: Mutex<HashMap<PoolKey, PoolEntry>>,
}

impl PoolRegistry {
    pub fn new(config: CoreConfig) -> Self {
        Self { config, pools: Mutex::new(HashMap::new()) }
    }

    /// Get the pool for this target, creating it if needed.
    ///
    /// Creating a pool does not connect; the first checkout does.
    pub fn pool_for(&self, spec: &ConnectionSpec) -> RampartResult<(PoolKey, Pool)> {
        self.reap_idle();

        let key = PoolKey::for_spec(spec);
        let mut pools = self.pools.lock();
        if let Some(entry) = pools.get_mut(&key) {
            entry.last_used = Instant::now();
            return Ok((key, entry.pool.clone()));
        }

        let pool = self.build_pool(spec)?;
        tracing::info!(
            host = %spec.host,
            port = spec.port,
            database = %spec.database,
            ssl_mode = spec.ssl_mode.as_str(),
            "Connection pool created"
        );
        pools.insert(key.clone(), PoolEntry { pool: pool.clone(), last_used: Instant::now() });
        Ok((key, pool))
    }

    fn build_pool(&self, spec: &ConnectionSpec) -> RampartResult<Pool> {
        let pg_config = pg_config(spec, &spec.target(), &self.config);
        let manager_config = ManagerConfig { recycling_method: RecyclingMethod::Clean };

        let manager = match TlsSetting::for_spec(spec, false)? {
            TlsSetting::Plain(tls) => Manager::from_config(pg_config, tls, manager_config),
            TlsSetting::Native(tls) => Manager::from_config(pg_config, tls, manager_config),
        };

        Pool::builder(manager)
            .max_size(self.config.pool_max_size)
            .wait_timeout(Some(self.config.pool_wait_timeout()))
            .create_timeout(Some(self.config.connect_timeout()))
            .recycle_timeout(Some(self.config.connect_timeout()))
            .runtime(Runtime::Tokio1)
            .pre_recycle(rollback_open_transaction())
            .build()
            .map_err(|e| RampartError::internal(format!("Failed to create pool: {e}")))
    }

    /// Close and forget the pool for `key`, e.g. after an auth failure.
    pub fn evict(&self, key: &PoolKey) {
        if let Some(entry) = self.pools.lock().remove(key) {
            entry.pool.close();
            tracing::info!(host = %key.host, database = %key.database, "Connection pool evicted");
        }
    }

    /// Close pools idle longer than the configured lifetime.
    ///
    /// Pools with checked-out connections are kept. Returns how many closed.
    pub fn reap_idle(&self) -> usize {
        let idle = self.config.pool_idle();
        let mut pools = self.pools.lock();
        let before = pools.len();
        pools.retain(|key, entry| {
            let keep = entry.last_used.elapsed() < idle || entry.in_use();
            if !keep {
                entry.pool.close();
                tracing::debug!(host = %key.host, database = %key.database, "Idle connection pool closed");
            }
            keep
        });
        before - pools.len()
    }

    pub fn len(&self) -> usize {
        self.pools.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.lock().is_empty()
    }

    /// Close every pool.
    pub fn close_all(&self) {
        for (_, entry) in self.pools.lock().drain() {
            entry.pool.close();
        }
    }
}

impl Drop for PoolRegistry {
    fn drop(&mut self) {
        self.close_all();
    }
}

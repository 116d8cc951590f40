//! Per-request connection provisioning.
//!
//! Every operation gets its own [`ScopedConnection`]: an SSH tunnel when the
//! spec asks for one, then a database connection pointed at the tunnel's
//! local port (or straight at the server). Releasing the scope closes the
//! database connection first and the tunnel second, exactly once, whether
//! the operation succeeded or not.
//!
//! Direct connections are checked out of keyed pools ([`PoolRegistry`]).
//! Tunneled connections are dedicated clients since the tunnel's local port
//! only exists for the one request.

use std::ops::{Deref, DerefMut};
use std::time::Duration;

use async_trait::async_trait;
use native_tls::{Certificate, TlsConnector};
use postgres_native_tls::MakeTlsConnector;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_postgres::NoTls;
use uuid::Uuid;

use super::pool::PoolRegistry;
use super::tunnel::{SshTunnelConnector, TunnelConnector, TunnelHandle};
use crate::config::CoreConfig;
use crate::error::{RampartError, RampartResult};
use crate::models::{ConnectionSpec, Endpoint, SslMode};

/// TLS connector chosen for a spec's `ssl_mode`.
pub(crate) enum TlsSetting {
    Plain(NoTls),
    Native(MakeTlsConnector),
}

impl TlsSetting {
    /// Build the connector for `spec`.
    ///
    /// `prefer` and `require` encrypt without verifying. `verify-ca` checks
    /// the chain against the configured CA. `verify-full` also checks the
    /// hostname, except through a tunnel where the client only sees 127.0.0.1.
    pub(crate) fn for_spec(spec: &ConnectionSpec, tunneled: bool) -> RampartResult<Self> {
        let connector = match spec.ssl_mode {
            SslMode::Disable => return Ok(Self::Plain(NoTls)),
            SslMode::Prefer | SslMode::Require => {
                TlsConnector::builder().danger_accept_invalid_certs(true).build()
            }
            SslMode::VerifyCa | SslMode::VerifyFull => {
                let path = spec.ssl_ca_cert.as_ref().ok_or_else(|| RampartError::missing("sslCaCert"))?;
                let pem = std::fs::read(path).map_err(|e| {
                    RampartError::invalid_request_with_hint(
                        format!("Failed to read CA certificate {}: {e}", path.display()),
                        "Check the sslCaCert path",
                    )
                })?;
                let cert = Certificate::from_pem(&pem).map_err(|e| {
                    RampartError::invalid_request_with_hint(
                        format!("Invalid CA certificate: {e}"),
                        "sslCaCert must point at a PEM encoded certificate",
                    )
                })?;

                let mut builder = TlsConnector::builder();
                builder.add_root_certificate(cert);
                if spec.ssl_mode == SslMode::VerifyCa || tunneled {
                    builder.danger_accept_invalid_hostnames(true);
                }
                builder.build()
            }
        }
        .map_err(|e| RampartError::internal(format!("Failed to create TLS connector: {e}")))?;

        Ok(Self::Native(MakeTlsConnector::new(connector)))
    }
}

/// tokio-postgres settings for reaching `endpoint` with `spec`'s credentials.
pub(crate) fn pg_config(
    spec: &ConnectionSpec,
    endpoint: &Endpoint,
    config: &CoreConfig,
) -> tokio_postgres::Config {
    let mut pg_config = tokio_postgres::Config::new();
    pg_config
        .host(&endpoint.host)
        .port(endpoint.port)
        .dbname(&spec.database)
        .user(&spec.username)
        .application_name(&config.application_name)
        .connect_timeout(config.connect_timeout())
        .keepalives(true)
        .keepalives_idle(Duration::from_secs(60))
        .ssl_mode(match spec.ssl_mode {
            SslMode::Disable => tokio_postgres::config::SslMode::Disable,
            SslMode::Prefer => tokio_postgres::config::SslMode::Prefer,
            _ => tokio_postgres::config::SslMode::Require,
        });

    if let Some(password) = &spec.password {
        pg_config.password(password.expose());
    }
    if let Some(secs) = config.statement_timeout_secs {
        pg_config.options(&format!("-c statement_timeout={}", secs * 1000));
    }

    pg_config
}

/// A live database session for one request.
pub enum PgConnection {
    /// Checked out of a keyed pool; returned to it on drop.
    Pooled(deadpool_postgres::Object),
    /// Owned client whose driver task is stopped on drop.
    Dedicated { client: tokio_postgres::Client, driver: JoinHandle<()> },
}

impl PgConnection {
    pub fn client(&self) -> &tokio_postgres::Client {
        match self {
            Self::Pooled(object) => &***object,
            Self::Dedicated { client, .. } => client,
        }
    }

    /// Mutable access, needed to open a transaction.
    pub fn client_mut(&mut self) -> &mut tokio_postgres::Client {
        match self {
            Self::Pooled(object) => &mut ***object,
            Self::Dedicated { client, .. } => client,
        }
    }

    pub fn is_pooled(&self) -> bool {
        matches!(self, Self::Pooled(_))
    }
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        if let Self::Dedicated { driver, .. } = self {
            driver.abort();
        }
    }
}

impl std::fmt::Debug for PgConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pooled(_) => f.write_str("PgConnection::Pooled"),
            Self::Dedicated { .. } => f.write_str("PgConnection::Dedicated"),
        }
    }
}

/// Opens database sessions. The seam the provisioner is tested through.
#[async_trait]
pub trait DbConnector: Send + Sync {
    type Connection: Send;

    /// Connect to `endpoint` using the credentials in `spec`.
    ///
    /// `tunneled` is set when `endpoint` is a tunnel's local port rather
    /// than `spec.target()`.
    async fn connect(
        &self,
        spec: &ConnectionSpec,
        endpoint: &Endpoint,
        tunneled: bool,
    ) -> RampartResult<Self::Connection>;
}

/// The PostgreSQL connector used in production.
pub struct PgConnector {
    config: CoreConfig,
    pools: PoolRegistry,
}

impl PgConnector {
    pub fn new(config: CoreConfig) -> Self {
        let pools = PoolRegistry::new(config.clone());
        Self { config, pools }
    }

    pub fn pools(&self) -> &PoolRegistry {
        &self.pools
    }

    async fn connect_pooled(&self, spec: &ConnectionSpec) -> RampartResult<PgConnection> {
        let (key, pool) = self.pools.pool_for(spec)?;
        match pool.get().await {
            Ok(object) => Ok(PgConnection::Pooled(object)),
            Err(e) => {
                let err = RampartError::from(e);
                if matches!(err, RampartError::ConnectionRefused { .. }) {
                    self.pools.evict(&key);
                }
                Err(err)
            }
        }
    }

    async fn connect_dedicated(
        &self,
        spec: &ConnectionSpec,
        endpoint: &Endpoint,
    ) -> RampartResult<PgConnection> {
        let pg_config = pg_config(spec, endpoint, &self.config);
        let connecting = async {
            let (client, driver) = match TlsSetting::for_spec(spec, true)? {
                TlsSetting::Plain(tls) => {
                    let (client, connection) = pg_config.connect(tls).await?;
                    (client, spawn_driver(connection))
                }
                TlsSetting::Native(tls) => {
                    let (client, connection) = pg_config.connect(tls).await?;
                    (client, spawn_driver(connection))
                }
            };
            Ok::<_, RampartError>(PgConnection::Dedicated { client, driver })
        };

        match tokio::time::timeout(self.config.connect_timeout(), connecting).await {
            Ok(result) => result,
            Err(_) => Err(RampartError::connection_refused_with_hint(
                format!("Timed out connecting to {endpoint} through the SSH tunnel"),
                "The tunnel is up but the database did not answer. Check the target host and port.",
            )),
        }
    }
}

fn spawn_driver<S, T>(connection: tokio_postgres::Connection<S, T>) -> JoinHandle<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::warn!(error = %e, "Database connection closed with error");
        }
    })
}

#[async_trait]
impl DbConnector for PgConnector {
    type Connection = PgConnection;

    async fn connect(
        &self,
        spec: &ConnectionSpec,
        endpoint: &Endpoint,
        tunneled: bool,
    ) -> RampartResult<PgConnection> {
        if tunneled {
            self.connect_dedicated(spec, endpoint).await
        } else {
            self.connect_pooled(spec).await
        }
    }
}

/// Opens a tunnel (when asked) and a database session for each request.
pub struct Provisioner<C = PgConnector, T = SshTunnelConnector> {
    connector: C,
    tunnels: T,
}

impl Provisioner {
    /// The production provisioner: pooled PostgreSQL behind optional russh tunnels.
    pub fn from_config(config: &CoreConfig) -> Self {
        Self::new(PgConnector::new(config.clone()), SshTunnelConnector::new(config.connect_timeout()))
    }
}

impl<C: DbConnector, T: TunnelConnector> Provisioner<C, T> {
    pub fn new(connector: C, tunnels: T) -> Self {
        Self { connector, tunnels }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Validate `spec`, open its tunnel if any, then connect.
    ///
    /// A tunnel failure is reported as such and no database connection is
    /// attempted. A database failure closes the tunnel before returning.
    pub async fn acquire(&self, spec: &ConnectionSpec) -> RampartResult<ScopedConnection<C::Connection>> {
        spec.validate()?;

        let tunnel = match &spec.tunnel {
            Some(tunnel_spec) => Some(
                self.tunnels
                    .open(tunnel_spec, &spec.target())
                    .await
                    .map_err(|source| RampartError::TunnelFailure { source })?,
            ),
            None => None,
        };

        let endpoint = match &tunnel {
            Some(handle) => handle.local_endpoint(),
            None => spec.target(),
        };

        let connection = match self.connector.connect(spec, &endpoint, tunnel.is_some()).await {
            Ok(connection) => connection,
            Err(e) => {
                if let Some(handle) = &tunnel {
                    handle.close();
                }
                return Err(e);
            }
        };

        let scope = ScopedConnection { id: Uuid::new_v4(), connection, tunnel };
        tracing::debug!(
            scope_id = %scope.id,
            database = %spec.database,
            endpoint = %endpoint,
            tunneled = scope.tunnel.is_some(),
            "Connection acquired"
        );
        Ok(scope)
    }
}

/// One request's database session plus the tunnel it runs through.
///
/// Field order is drop order: the session closes before the tunnel.
pub struct ScopedConnection<Conn> {
    id: Uuid,
    connection: Conn,
    tunnel: Option<TunnelHandle>,
}

impl<Conn> ScopedConnection<Conn> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn tunnel(&self) -> Option<&TunnelHandle> {
        self.tunnel.as_ref()
    }

    /// Release the session and tunnel now instead of at end of scope.
    pub fn release(self) {
        drop(self);
    }
}

impl<Conn> Deref for ScopedConnection<Conn> {
    type Target = Conn;

    fn deref(&self) -> &Conn {
        &self.connection
    }
}

impl<Conn> DerefMut for ScopedConnection<Conn> {
    fn deref_mut(&mut self) -> &mut Conn {
        &mut self.connection
    }
}

impl<Conn> Drop for ScopedConnection<Conn> {
    fn drop(&mut self) {
        tracing::debug!(scope_id = %self.id, "Connection released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::tunnel::{TunnelError, TunnelState};
    use crate::models::TunnelSpec;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct Counters {
        opened: AtomicUsize,
        closed: AtomicUsize,
        tunnel_alive_at_close: AtomicBool,
    }

    struct MockConnection {
        counters: Arc<Counters>,
        tunnel_token: Option<CancellationToken>,
    }

    impl Drop for MockConnection {
        fn drop(&mut self) {
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
            if let Some(token) = &self.tunnel_token {
                self.counters.tunnel_alive_at_close.store(!token.is_cancelled(), Ordering::SeqCst);
            }
        }
    }

    #[derive(Default)]
    struct MockConnector {
        counters: Arc<Counters>,
        calls: AtomicUsize,
        endpoints: Mutex<Vec<(Endpoint, bool)>>,
        fail: bool,
        tunnel_tokens: Arc<Mutex<Vec<CancellationToken>>>,
    }

    #[async_trait]
    impl DbConnector for MockConnector {
        type Connection = MockConnection;

        async fn connect(
            &self,
            _spec: &ConnectionSpec,
            endpoint: &Endpoint,
            tunneled: bool,
        ) -> RampartResult<MockConnection> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.endpoints.lock().push((endpoint.clone(), tunneled));
            if self.fail {
                return Err(RampartError::connection_refused("connection refused"));
            }
            self.counters.opened.fetch_add(1, Ordering::SeqCst);
            Ok(MockConnection {
                counters: self.counters.clone(),
                tunnel_token: self.tunnel_tokens.lock().last().cloned(),
            })
        }
    }

    #[derive(Default)]
    struct MockTunnels {
        fail: Option<TunnelError>,
        tokens: Arc<Mutex<Vec<CancellationToken>>>,
    }

    #[async_trait]
    impl TunnelConnector for MockTunnels {
        async fn open(&self, _spec: &TunnelSpec, target: &Endpoint) -> Result<TunnelHandle, TunnelError> {
            if let Some(err) = &self.fail {
                return Err(err.clone());
            }
            let token = CancellationToken::new();
            self.tokens.lock().push(token.clone());
            let local = "127.0.0.1:40000".parse().unwrap();
            Ok(TunnelHandle::ready(local, target.clone(), token))
        }
    }

    fn direct_spec() -> ConnectionSpec {
        ConnectionSpec::new("db.internal", 5432, "admin", "app").with_password("pw")
    }

    fn tunneled_spec() -> ConnectionSpec {
        direct_spec().with_tunnel(TunnelSpec::with_password("bastion", 22, "ops", "pw"))
    }

    fn provisioner(connector: MockConnector, tunnels: MockTunnels) -> Provisioner<MockConnector, MockTunnels> {
        Provisioner::new(connector, tunnels)
    }

    #[tokio::test]
    async fn test_direct_connection_uses_target() {
        let p = provisioner(MockConnector::default(), MockTunnels::default());
        let scope = p.acquire(&direct_spec()).await.unwrap();
        assert!(scope.tunnel().is_none());
        drop(scope);

        let endpoints = p.connector().endpoints.lock();
        assert_eq!(endpoints[0], (Endpoint::new("db.internal", 5432), false));
        assert_eq!(p.connector().counters.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tunneled_connection_targets_local_port() {
        let tokens = Arc::new(Mutex::new(Vec::new()));
        let connector = MockConnector { tunnel_tokens: tokens.clone(), ..Default::default() };
        let tunnels = MockTunnels { tokens: tokens.clone(), ..Default::default() };
        let p = provisioner(connector, tunnels);

        let scope = p.acquire(&tunneled_spec()).await.unwrap();
        let tunnel = scope.tunnel().unwrap();
        assert_eq!(tunnel.target(), &Endpoint::new("db.internal", 5432));
        assert_eq!(tunnel.state(), TunnelState::Ready);
        scope.release();

        let counters = &p.connector().counters;
        assert_eq!(p.connector().endpoints.lock()[0], (Endpoint::new("127.0.0.1", 40000), true));
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
        assert!(counters.tunnel_alive_at_close.load(Ordering::SeqCst));
        assert!(tokens.lock()[0].is_cancelled());
    }

    #[tokio::test]
    async fn test_tunnel_failure_skips_database() {
        let tunnels = MockTunnels { fail: Some(TunnelError::auth("bad password")), ..Default::default() };
        let p = provisioner(MockConnector::default(), tunnels);

        match p.acquire(&tunneled_spec()).await {
            Err(RampartError::TunnelFailure { source: TunnelError::Auth { .. } }) => {}
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
        assert_eq!(p.connector().calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_database_failure_closes_tunnel() {
        let tokens = Arc::new(Mutex::new(Vec::new()));
        let connector = MockConnector { fail: true, ..Default::default() };
        let tunnels = MockTunnels { tokens: tokens.clone(), ..Default::default() };
        let p = provisioner(connector, tunnels);

        let result = p.acquire(&tunneled_spec()).await;
        assert!(matches!(result, Err(RampartError::ConnectionRefused { .. })));
        assert!(tokens.lock()[0].is_cancelled());
    }

    #[tokio::test]
    async fn test_invalid_spec_opens_nothing() {
        let tokens = Arc::new(Mutex::new(Vec::new()));
        let tunnels = MockTunnels { tokens: tokens.clone(), ..Default::default() };
        let p = provisioner(MockConnector::default(), tunnels);

        let mut spec = tunneled_spec();
        spec.username.clear();
        let result = p.acquire(&spec).await;
        assert!(matches!(result, Err(RampartError::MissingParameter { .. })));
        assert!(tokens.lock().is_empty());
        assert_eq!(p.connector().calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_repeated_requests_leak_nothing() {
        let tokens = Arc::new(Mutex::new(Vec::new()));
        let tunnels = MockTunnels { tokens: tokens.clone(), ..Default::default() };
        let p = provisioner(MockConnector::default(), tunnels);

        for i in 0..20 {
            let spec = if i % 2 == 0 { direct_spec() } else { tunneled_spec() };
            let scope = p.acquire(&spec).await.unwrap();
            assert!(scope.id() != Uuid::nil());
        }

        let counters = &p.connector().counters;
        assert_eq!(counters.opened.load(Ordering::SeqCst), 20);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 20);
        let tokens = tokens.lock();
        assert_eq!(tokens.len(), 10);
        assert!(tokens.iter().all(CancellationToken::is_cancelled));
    }

    #[test]
    fn test_pg_config_points_at_endpoint() {
        let config = CoreConfig { statement_timeout_secs: Some(30), ..CoreConfig::default() };
        let pg = pg_config(&direct_spec(), &Endpoint::new("127.0.0.1", 40000), &config);

        assert_eq!(pg.get_hosts(), &[tokio_postgres::config::Host::Tcp("127.0.0.1".into())]);
        assert_eq!(pg.get_ports(), &[40000]);
        assert_eq!(pg.get_dbname(), Some("app"));
        assert_eq!(pg.get_application_name(), Some("rampart"));
        assert_eq!(pg.get_options(), Some("-c statement_timeout=30000"));
        assert_eq!(pg.get_password(), Some("pw".as_bytes()));
    }

    #[test]
    fn test_tls_setting_follows_ssl_mode() {
        let mut spec = direct_spec();
        assert!(matches!(TlsSetting::for_spec(&spec, false), Ok(TlsSetting::Plain(_))));

        spec.ssl_mode = SslMode::Require;
        assert!(matches!(TlsSetting::for_spec(&spec, false), Ok(TlsSetting::Native(_))));

        spec.ssl_mode = SslMode::VerifyFull;
        spec.ssl_ca_cert = Some("/nonexistent/ca.pem".into());
        assert!(matches!(
            TlsSetting::for_spec(&spec, false),
            Err(RampartError::InvalidRequest { .. })
        ));
    }
}

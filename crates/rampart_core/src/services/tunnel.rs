//! SSH tunnels for reaching databases behind a jump host.
//!
//! A tunnel lives for one request. It binds an OS-assigned port on
//! 127.0.0.1, forwards exactly one downstream connection through a
//! `direct-tcpip` channel, and is torn down when its [`TunnelHandle`] is
//! closed or dropped.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use russh::client;
use russh_keys::key::KeyPair;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::{Endpoint, TunnelAuth, TunnelSpec};

/// Why a tunnel could not be opened.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize)]
#[serde(tag = "kind", content = "data")]
pub enum TunnelError {
    /// Credentials or host key rejected.
    #[error("SSH authentication failed: {message}")]
    #[serde(rename = "TunnelAuthError")]
    Auth { message: String },

    /// Host unreachable, handshake timed out, or forwarding refused.
    #[error("SSH network error: {message}")]
    #[serde(rename = "TunnelNetworkError")]
    Network { message: String },
}

impl TunnelError {
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth { message: message.into() }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Serialized name of the failure, as reported to the UI.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "TunnelAuthError",
            Self::Network { .. } => "TunnelNetworkError",
        }
    }

    pub fn hint(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "Check the SSH username, password or key, and the pinned host key",
            Self::Network { .. } => {
                "Verify the SSH host is reachable and allows TCP forwarding to the database"
            }
        }
    }
}

/// Lifecycle of one tunnel.
///
/// `Idle -> Connecting -> Ready -> Closed`, or `Connecting -> Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Idle,
    Connecting,
    Ready,
    Closed,
    Failed,
}

impl TunnelState {
    /// Whether `self -> next` is a legal step.
    pub fn can_become(self, next: TunnelState) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Connecting)
                | (Self::Connecting, Self::Ready)
                | (Self::Connecting, Self::Failed)
                | (Self::Ready, Self::Closed)
        )
    }
}

/// An open tunnel. Closing is idempotent; dropping closes.
pub struct TunnelHandle {
    id: Uuid,
    local_addr: SocketAddr,
    target: Endpoint,
    state: Arc<Mutex<TunnelState>>,
    cancel: CancellationToken,
}

impl TunnelHandle {
    /// A tunnel in `Idle`, with its local port already bound.
    ///
    /// Cancelling `cancel` must stop the forwarding task.
    pub fn new(local_addr: SocketAddr, target: Endpoint, cancel: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            local_addr,
            target,
            state: Arc::new(Mutex::new(TunnelState::Idle)),
            cancel,
        }
    }

    /// A tunnel that has already reached `Ready`.
    pub fn ready(local_addr: SocketAddr, target: Endpoint, cancel: CancellationToken) -> Self {
        let handle = Self::new(local_addr, target, cancel);
        handle.advance(TunnelState::Connecting);
        handle.advance(TunnelState::Ready);
        handle
    }

    /// Move to `next` if that is a legal step. Returns whether it moved.
    pub fn advance(&self, next: TunnelState) -> bool {
        let mut state = self.state.lock();
        if !state.can_become(next) {
            return false;
        }
        *state = next;
        true
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Where the database client should connect instead of the real host.
    pub fn local_endpoint(&self) -> Endpoint {
        Endpoint::new(self.local_addr.ip().to_string(), self.local_addr.port())
    }

    /// The database server on the far side of the tunnel.
    pub fn target(&self) -> &Endpoint {
        &self.target
    }

    pub fn state(&self) -> TunnelState {
        *self.state.lock()
    }

    /// Tear the tunnel down. A no-op unless the tunnel is `Ready`.
    pub fn close(&self) {
        if self.advance(TunnelState::Closed) {
            self.cancel.cancel();
            tracing::info!(tunnel_id = %self.id, local = %self.local_addr, "SSH tunnel closed");
        }
    }

    fn shared_state(&self) -> Arc<Mutex<TunnelState>> {
        self.state.clone()
    }
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for TunnelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelHandle")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr)
            .field("target", &self.target)
            .field("state", &self.state())
            .finish()
    }
}

/// Opens tunnels. The seam the connection provisioner is tested through.
#[async_trait]
pub trait TunnelConnector: Send + Sync {
    /// Authenticate to `spec.host` and forward a local port to `target`.
    async fn open(&self, spec: &TunnelSpec, target: &Endpoint) -> Result<TunnelHandle, TunnelError>;
}

/// SSH client handler for russh.
struct TunnelClient {
    expected_fingerprint: Option<String>,
    key_rejected: Arc<AtomicBool>,
}

#[async_trait]
impl client::Handler for TunnelClient {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        let actual = server_public_key.fingerprint();
        match &self.expected_fingerprint {
            Some(expected) if !fingerprints_match(expected, &actual) => {
                tracing::warn!(fingerprint = %actual, "SSH host key does not match the pinned key");
                self.key_rejected.store(true, Ordering::SeqCst);
                Ok(false)
            }
            Some(_) => Ok(true),
            None => {
                tracing::info!(fingerprint = %actual, "Accepting unpinned SSH host key");
                Ok(true)
            }
        }
    }
}

/// Compare fingerprints ignoring the `SHA256:` prefix and base64 padding.
fn fingerprints_match(expected: &str, actual: &str) -> bool {
    fn normalize(s: &str) -> &str {
        let s = s.trim();
        s.strip_prefix("SHA256:").unwrap_or(s).trim_end_matches('=')
    }
    normalize(expected) == normalize(actual)
}

/// russh-backed tunnel connector.
#[derive(Debug, Clone)]
pub struct SshTunnelConnector {
    connect_timeout: Duration,
}

impl SshTunnelConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Connect, authenticate and open the forwarding channel.
    async fn establish(
        &self,
        spec: &TunnelSpec,
        target: &Endpoint,
    ) -> Result<(client::Handle<TunnelClient>, russh::Channel<client::Msg>), TunnelError> {
        let key_rejected = Arc::new(AtomicBool::new(false));
        let handler = TunnelClient {
            expected_fingerprint: spec.host_key_fingerprint.clone(),
            key_rejected: key_rejected.clone(),
        };
        let config = Arc::new(client::Config::default());

        let mut session = client::connect(config, (spec.host.as_str(), spec.port), handler)
            .await
            .map_err(|e| {
                if key_rejected.load(Ordering::SeqCst) {
                    TunnelError::auth("server host key does not match the pinned fingerprint")
                } else {
                    TunnelError::network(format!(
                        "failed to connect to {}:{}: {e}",
                        spec.host, spec.port
                    ))
                }
            })?;

        let auth = spec.auth().map_err(|e| TunnelError::auth(e.to_string()))?;
        let authenticated = match auth {
            TunnelAuth::Password(password) => session
                .authenticate_password(spec.username.as_str(), password.expose())
                .await
                .map_err(|e| TunnelError::network(format!("password authentication failed: {e}")))?,
            TunnelAuth::PrivateKey { key, passphrase } => {
                let key = decode_key(key.expose(), passphrase.map(|p| p.expose()))?;
                session
                    .authenticate_publickey(spec.username.as_str(), key)
                    .await
                    .map_err(|e| TunnelError::network(format!("key authentication failed: {e}")))?
            }
        };
        if !authenticated {
            return Err(TunnelError::auth(format!(
                "{}@{} rejected the supplied credentials",
                spec.username, spec.host
            )));
        }
        tracing::info!(user = %spec.username, host = %spec.host, "SSH authentication successful");

        let channel = session
            .channel_open_direct_tcpip(target.host.as_str(), target.port as u32, "127.0.0.1", 0)
            .await
            .map_err(|e| TunnelError::network(format!("failed to open forwarding channel: {e}")))?;

        Ok((session, channel))
    }
}

fn decode_key(key: &str, passphrase: Option<&str>) -> Result<Arc<KeyPair>, TunnelError> {
    russh_keys::decode_secret_key(key, passphrase).map(Arc::new).map_err(|e| {
        let hint = if passphrase.is_some() {
            "check the key passphrase"
        } else {
            "the key may be encrypted; provide its passphrase"
        };
        TunnelError::auth(format!("could not read private key ({hint}): {e}"))
    })
}

#[async_trait]
impl TunnelConnector for SshTunnelConnector {
    async fn open(&self, spec: &TunnelSpec, target: &Endpoint) -> Result<TunnelHandle, TunnelError> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| TunnelError::network(format!("failed to bind local port: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TunnelError::network(format!("failed to read local port: {e}")))?;

        let cancel = CancellationToken::new();
        let handle = TunnelHandle::new(local_addr, target.clone(), cancel.clone());
        handle.advance(TunnelState::Connecting);
        tracing::info!(
            tunnel_id = %handle.id(),
            ssh_host = %spec.host,
            ssh_port = spec.port,
            target = %target,
            state = ?handle.state(),
            "Opening SSH tunnel"
        );

        let attempt = tokio::time::timeout(self.connect_timeout, self.establish(spec, target));
        let established = match attempt.await {
            Ok(result) => result,
            Err(_) => Err(TunnelError::network(format!(
                "timed out after {}s connecting to {}:{}",
                self.connect_timeout.as_secs(),
                spec.host,
                spec.port
            ))),
        };
        let (session, channel) = match established {
            Ok(parts) => parts,
            Err(e) => {
                handle.advance(TunnelState::Failed);
                tracing::warn!(
                    tunnel_id = %handle.id(),
                    ssh_host = %spec.host,
                    state = ?handle.state(),
                    error = %e,
                    "SSH tunnel failed"
                );
                return Err(e);
            }
        };

        handle.advance(TunnelState::Ready);
        tracing::info!(tunnel_id = %handle.id(), local = %local_addr, target = %target, "SSH tunnel ready");

        tokio::spawn(forward_once(
            handle.id(),
            listener,
            session,
            channel,
            cancel,
            handle.shared_state(),
        ));

        Ok(handle)
    }
}

/// Accept a single downstream connection and pipe it through the channel.
async fn forward_once(
    tunnel_id: Uuid,
    listener: TcpListener,
    session: client::Handle<TunnelClient>,
    channel: russh::Channel<client::Msg>,
    cancel: CancellationToken,
    state: Arc<Mutex<TunnelState>>,
) {
    let accepted = tokio::select! {
        accepted = listener.accept() => Some(accepted),
        _ = cancel.cancelled() => None,
    };
    // Later connection attempts are refused.
    drop(listener);

    match accepted {
        Some(Ok((mut local, peer))) => {
            tracing::debug!(%tunnel_id, %peer, "Tunnel accepted downstream connection");
            let mut remote = channel.into_stream();
            tokio::select! {
                result = tokio::io::copy_bidirectional(&mut local, &mut remote) => {
                    match result {
                        Ok((up, down)) => tracing::debug!(%tunnel_id, up, down, "Tunnel stream finished"),
                        Err(e) => tracing::warn!(%tunnel_id, error = %e, "Tunnel forwarding error"),
                    }
                }
                _ = cancel.cancelled() => {}
            }
        }
        Some(Err(e)) => tracing::warn!(%tunnel_id, error = %e, "Failed to accept tunnel connection"),
        None => {}
    }

    if let Err(e) = session.disconnect(russh::Disconnect::ByApplication, "", "en").await {
        tracing::debug!(%tunnel_id, error = %e, "SSH disconnect failed");
    }

    let mut state = state.lock();
    if state.can_become(TunnelState::Closed) {
        *state = TunnelState::Closed;
    }
}

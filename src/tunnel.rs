//! Multi-hop ssh tunnel with a self-healing keepalive loop.
//!
//! Hop 0 is dialed directly. Every following hop is reached through a
//! `direct-tcpip` stream of the previous client and gets its own ssh
//! handshake on top of it. The last client of the chain is the egress
//! point into the remote network.
//!
//! The chain is built once by [`TunnelManager::start`] (a failure there is
//! fatal). From then on a single background task owns the tunnel: it waits
//! for the chain to die, rebuilds it from hop 0 every [`RECONNECT_INTERVAL`]
//! until it succeeds, and publishes each state change through a
//! `tokio::sync::watch` channel. Request handlers only ever read snapshots.

use crate::config::HopSpec;
use crate::error::TunnelError;
use crate::secrets::SecretError;
use async_trait::async_trait;
use futures::future::select_all;
use log::{debug, error, info, warn};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use zeroize::Zeroizing;

/// Pause between two failed attempts to rebuild the chain.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(3);

pub trait TunnelIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> TunnelIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Raw byte stream opened inside the remote network.
pub type TunnelStream = Box<dyn TunnelIo>;

/// One way of proving who we are to a hop.
#[derive(Clone)]
pub enum Credential {
    Password(Zeroizing<String>),
    /// PEM or OpenSSH encoded private key.
    PrivateKey(Zeroizing<String>),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Password(_) => write!(f, "Password(***)"),
            Credential::PrivateKey(_) => write!(f, "PrivateKey(***)"),
        }
    }
}

/// Resolved user name plus the credentials to try, in order.
#[derive(Debug, Clone)]
pub struct Login {
    pub user: String,
    pub credentials: Vec<Credential>,
}

/// Resolves the hop's secrets into an ordered list of credentials:
/// password first, then public key. Unset fields are skipped.
pub fn authenticate(hop: &HopSpec) -> Result<Login, SecretError> {
    let user = hop.user.resolve()?.trim().to_string();
    let mut credentials = Vec::with_capacity(2);
    if !hop.pass.is_empty() {
        credentials.push(Credential::Password(hop.pass.resolve()?));
    }
    if !hop.key.is_empty() {
        credentials.push(Credential::PrivateKey(hop.key.resolve()?));
    }
    Ok(Login { user, credentials })
}

/// A live ssh client for one hop.
#[async_trait]
pub trait SshClient: Send + Sync {
    /// Opens a raw stream to `address` (`host:port`) from this hop.
    async fn open_stream(&self, address: &str) -> Result<TunnelStream, TunnelError>;

    /// Resolves once the underlying session has ended, for whatever reason.
    async fn closed(&self);

    async fn close(&self);
}

/// Produces authenticated clients. `via` is `None` for hop 0, which is
/// dialed directly, and the stream opened by the previous hop otherwise.
#[async_trait]
pub trait SshConnector: Send + Sync {
    async fn connect(
        &self,
        index: usize,
        hop: &HopSpec,
        login: Login,
        via: Option<TunnelStream>,
    ) -> Result<Box<dyn SshClient>, TunnelError>;
}

/// Anything that can open streams into the remote network.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, address: &str) -> Result<TunnelStream, TunnelError>;
}

/// A fully established chain of clients, hop 0 first.
pub struct Tunnel {
    hops: Vec<Box<dyn SshClient>>,
}

impl Tunnel {
    fn len(&self) -> usize {
        self.hops.len()
    }

    pub async fn dial(&self, address: &str) -> Result<TunnelStream, TunnelError> {
        match self.hops.last() {
            Some(egress) => egress.open_stream(address).await,
            None => Err(TunnelError::Unavailable("tunnel has no hops".to_string())),
        }
    }

    /// Resolves as soon as any hop of the chain goes away.
    pub async fn closed(&self) {
        if self.hops.is_empty() {
            return;
        }
        select_all(self.hops.iter().map(|hop| hop.closed())).await;
    }

    pub async fn close(&self) {
        close_chain(&self.hops).await;
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel").field("hops", &self.hops.len()).finish()
    }
}

async fn close_chain(chain: &[Box<dyn SshClient>]) {
    for client in chain.iter().rev() {
        client.close().await;
    }
}

/// Builds complete chains from the configured hops.
pub struct ChainBuilder {
    hops: Vec<HopSpec>,
    connector: Arc<dyn SshConnector>,
}

impl ChainBuilder {
    pub fn new(hops: Vec<HopSpec>, connector: Arc<dyn SshConnector>) -> Self {
        Self { hops, connector }
    }

    /// Connects every hop in order. The first failure closes what was
    /// already established and is returned as is.
    pub async fn build(&self) -> Result<Tunnel, TunnelError> {
        info!("establishing tunnel connection...");
        if self.hops.is_empty() {
            return Err(TunnelError::Unavailable("no hops configured".to_string()));
        }

        let mut chain: Vec<Box<dyn SshClient>> = Vec::with_capacity(self.hops.len());
        for (index, hop) in self.hops.iter().enumerate() {
            match self.connect_hop(index, hop, chain.last()).await {
                Ok(client) => {
                    debug!("hop {} ({}) connected", index, hop.address());
                    chain.push(client);
                }
                Err(e) => {
                    close_chain(&chain).await;
                    return Err(e);
                }
            }
        }
        Ok(Tunnel { hops: chain })
    }

    async fn connect_hop(
        &self,
        index: usize,
        hop: &HopSpec,
        previous: Option<&Box<dyn SshClient>>,
    ) -> Result<Box<dyn SshClient>, TunnelError> {
        let login = authenticate(hop).map_err(|e| TunnelError::secret(index, e))?;
        let via = match previous {
            None => None,
            Some(client) => {
                let address = hop.address();
                let stream = client
                    .open_stream(&address)
                    .await
                    .map_err(|e| TunnelError::Dial {
                        index,
                        address,
                        reason: e.to_string(),
                    })?;
                Some(stream)
            }
        };
        self.connector.connect(index, hop, login, via).await
    }
}

/// What request handlers see of the tunnel.
#[derive(Clone)]
pub enum TunnelState {
    Disconnected { last_error: Option<String> },
    Connecting,
    Connected(Arc<Tunnel>),
}

impl TunnelState {
    pub fn is_connected(&self) -> bool {
        matches!(self, TunnelState::Connected(_))
    }
}

impl fmt::Debug for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelState::Disconnected { last_error } => f
                .debug_struct("Disconnected")
                .field("last_error", last_error)
                .finish(),
            TunnelState::Connecting => write!(f, "Connecting"),
            TunnelState::Connected(tunnel) => f.debug_tuple("Connected").field(tunnel).finish(),
        }
    }
}

/// Owner of the tunnel. Dropping the manager stops the keepalive task.
pub struct TunnelManager {
    state: watch::Receiver<TunnelState>,
    keepalive: JoinHandle<()>,
}

impl TunnelManager {
    /// Builds the first chain and starts the keepalive task. Any error
    /// here is returned to the caller, there is no retry yet.
    pub async fn start(
        hops: Vec<HopSpec>,
        connector: Arc<dyn SshConnector>,
    ) -> Result<Self, TunnelError> {
        Self::start_with_interval(hops, connector, RECONNECT_INTERVAL).await
    }

    pub async fn start_with_interval(
        hops: Vec<HopSpec>,
        connector: Arc<dyn SshConnector>,
        interval: Duration,
    ) -> Result<Self, TunnelError> {
        let builder = ChainBuilder::new(hops, connector);
        let tunnel = Arc::new(builder.build().await?);
        info!("tunnel established through {} hop(s)", tunnel.len());

        let (state_tx, state_rx) = watch::channel(TunnelState::Connected(tunnel.clone()));
        let keepalive = tokio::spawn(keepalive(builder, tunnel, state_tx, interval));

        Ok(Self {
            state: state_rx,
            keepalive,
        })
    }

    pub fn state(&self) -> TunnelState {
        self.state.borrow().clone()
    }

    /// Change notifications, mostly useful for waiting on a reconnect.
    pub fn subscribe(&self) -> watch::Receiver<TunnelState> {
        self.state.clone()
    }

    pub async fn dial(&self, address: &str) -> Result<TunnelStream, TunnelError> {
        let tunnel = match self.state() {
            TunnelState::Connected(tunnel) => tunnel,
            TunnelState::Connecting => {
                return Err(TunnelError::Unavailable("reconnecting".to_string()));
            }
            TunnelState::Disconnected { last_error } => {
                return Err(TunnelError::Unavailable(
                    last_error.unwrap_or_else(|| "disconnected".to_string()),
                ));
            }
        };
        debug!("dialing {} through the tunnel", address);
        tunnel.dial(address).await
    }
}

#[async_trait]
impl Dialer for TunnelManager {
    async fn dial(&self, address: &str) -> Result<TunnelStream, TunnelError> {
        TunnelManager::dial(self, address).await
    }
}

impl Drop for TunnelManager {
    fn drop(&mut self) {
        self.keepalive.abort();
    }
}

async fn keepalive(
    builder: ChainBuilder,
    mut tunnel: Arc<Tunnel>,
    state: watch::Sender<TunnelState>,
    interval: Duration,
) {
    loop {
        tunnel.closed().await;
        warn!("tunnel connection lost");
        tunnel.close().await;
        state.send_replace(TunnelState::Disconnected {
            last_error: Some("tunnel connection lost".to_string()),
        });
        tunnel = reconnect(&builder, &state, interval).await;
    }
}

async fn reconnect(
    builder: &ChainBuilder,
    state: &watch::Sender<TunnelState>,
    interval: Duration,
) -> Arc<Tunnel> {
    loop {
        state.send_replace(TunnelState::Connecting);
        match builder.build().await {
            Ok(tunnel) => {
                let tunnel = Arc::new(tunnel);
                info!("tunnel re-established through {} hop(s)", tunnel.len());
                state.send_replace(TunnelState::Connected(tunnel.clone()));
                return tunnel;
            }
            Err(e) => {
                error!("{}", e);
                state.send_replace(TunnelState::Disconnected {
                    last_error: Some(e.to_string()),
                });
                tokio::time::sleep(interval).await;
            }
        }
    }
}

/// Splits `host:port`, accepting bracketed ipv6 literals.
pub fn split_host_port(address: &str) -> Result<(String, u16), TunnelError> {
    let invalid = |reason: &str| TunnelError::Channel {
        address: address.to_string(),
        reason: reason.to_string(),
    };
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| invalid("missing port"))?;
    let port = port.parse::<u16>().map_err(|_| invalid("invalid port"))?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(invalid("missing host"));
    }
    Ok((host.to_string(), port))
}

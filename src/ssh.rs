//! [`SshConnector`] backed by `russh`.

use crate::config::HopSpec;
use crate::error::TunnelError;
use crate::tunnel::{Credential, Login, SshClient, SshConnector, TunnelStream, split_host_port};
use async_trait::async_trait;
use log::{debug, warn};
use russh::Disconnect;
use russh::client::{self, Handle};
use russh_keys::key;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_util::sync::{CancellationToken, DropGuard};

/// Session callbacks. russh drops the handler when the session task ends,
/// which cancels the liveness token of the owning client.
struct TunnelHandler {
    _alive: DropGuard,
}

#[async_trait]
impl client::Handler for TunnelHandler {
    type Error = russh::Error;

    // No known_hosts store: every server key is accepted.
    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

pub struct RusshClient {
    address: String,
    handle: Handle<TunnelHandler>,
    alive: CancellationToken,
}

#[async_trait]
impl SshClient for RusshClient {
    async fn open_stream(&self, address: &str) -> Result<TunnelStream, TunnelError> {
        let (host, port) = split_host_port(address)?;
        let channel = self
            .handle
            .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
            .await
            .map_err(|e| TunnelError::Channel {
                address: address.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn closed(&self) {
        self.alive.cancelled().await
    }

    async fn close(&self) {
        if self.alive.is_cancelled() {
            return;
        }
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            debug!("disconnect from {}: {}", self.address, e);
        }
        self.alive.cancel();
    }
}

#[derive(Default)]
pub struct RusshConnector {
    config: Arc<client::Config>,
}

impl RusshConnector {
    pub fn new(config: client::Config) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl SshConnector for RusshConnector {
    async fn connect(
        &self,
        index: usize,
        hop: &HopSpec,
        login: Login,
        via: Option<TunnelStream>,
    ) -> Result<Box<dyn SshClient>, TunnelError> {
        let address = hop.address();
        let stream: TunnelStream = match via {
            Some(stream) => stream,
            None => {
                let tcp = TcpStream::connect(&address)
                    .await
                    .map_err(|e| TunnelError::Dial {
                        index,
                        address: address.clone(),
                        reason: e.to_string(),
                    })?;
                let _ = tcp.set_nodelay(true);
                Box::new(tcp)
            }
        };

        let alive = CancellationToken::new();
        let handler = TunnelHandler {
            _alive: alive.clone().drop_guard(),
        };
        let mut handle = client::connect_stream(self.config.clone(), stream, handler)
            .await
            .map_err(|e| TunnelError::Handshake {
                index,
                address: address.clone(),
                reason: e.to_string(),
            })?;

        sign_in(&mut handle, index, &address, login).await?;

        Ok(Box::new(RusshClient {
            address,
            handle,
            alive,
        }))
    }
}

/// Tries the credentials in order, the first accepted one wins.
async fn sign_in(
    handle: &mut Handle<TunnelHandler>,
    index: usize,
    address: &str,
    login: Login,
) -> Result<(), TunnelError> {
    for credential in &login.credentials {
        let accepted = match credential {
            Credential::Password(password) => {
                handle
                    .authenticate_password(login.user.clone(), password.as_str())
                    .await
            }
            Credential::PrivateKey(pem) => match russh_keys::decode_secret_key(pem.as_str(), None) {
                Ok(key) => {
                    handle
                        .authenticate_publickey(login.user.clone(), Arc::new(key))
                        .await
                }
                Err(e) => {
                    warn!("hop {} ({}): unusable private key: {}", index, address, e);
                    continue;
                }
            },
        };
        match accepted {
            Ok(true) => {
                debug!("hop {} ({}): authenticated as {}", index, address, login.user);
                return Ok(());
            }
            Ok(false) => debug!("hop {} ({}): {:?} rejected", index, address, credential),
            Err(e) => {
                return Err(TunnelError::Handshake {
                    index,
                    address: address.to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }

    if let Err(e) = handle
        .disconnect(Disconnect::ByApplication, "", "English")
        .await
    {
        debug!("disconnect from {}: {}", address, e);
    }
    Err(TunnelError::Auth {
        index,
        address: address.to_string(),
        user: login.user,
    })
}

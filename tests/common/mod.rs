#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use hopgate::config::HopSpec;
use hopgate::error::TunnelError;
use hopgate::relay::RelayEngine;
use hopgate::secrets::Secret;
use hopgate::tunnel::{Login, SshClient, SshConnector, TunnelStream};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1 as client_http1;
use hyper::server::conn::http1 as server_http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;

pub type Events = Arc<Mutex<Vec<String>>>;

/// Stands in for the remote network: `host:port` as seen from the last
/// hop mapped to a listener on loopback.
#[derive(Clone, Default)]
pub struct RemoteNetwork {
    routes: Arc<Mutex<HashMap<String, SocketAddr>>>,
    dialed: Arc<Mutex<Vec<String>>>,
}

impl RemoteNetwork {
    pub fn serve(&self, address: &str, local: SocketAddr) {
        self.routes
            .lock()
            .unwrap()
            .insert(address.to_string(), local);
    }

    pub fn dialed(&self) -> Vec<String> {
        self.dialed.lock().unwrap().clone()
    }

    async fn open(&self, address: &str) -> Result<TunnelStream, TunnelError> {
        self.dialed.lock().unwrap().push(address.to_string());
        // next hop of the chain: the ssh layer is mocked, any stream will do
        if address.ends_with(":22") {
            let (near, _far) = tokio::io::duplex(64);
            return Ok(Box::new(near));
        }
        let local = self.routes.lock().unwrap().get(address).copied();
        match local {
            Some(local) => {
                let stream = TcpStream::connect(local)
                    .await
                    .map_err(|e| TunnelError::Channel {
                        address: address.to_string(),
                        reason: e.to_string(),
                    })?;
                Ok(Box::new(stream))
            }
            None => Err(TunnelError::Channel {
                address: address.to_string(),
                reason: "connection refused".to_string(),
            }),
        }
    }
}

pub struct LoopbackClient {
    index: usize,
    alive: CancellationToken,
    network: RemoteNetwork,
    events: Events,
}

#[async_trait]
impl SshClient for LoopbackClient {
    async fn open_stream(&self, address: &str) -> Result<TunnelStream, TunnelError> {
        self.network.open(address).await
    }

    async fn closed(&self) {
        self.alive.cancelled().await
    }

    async fn close(&self) {
        self.events
            .lock()
            .unwrap()
            .push(format!("close {}", self.index));
        self.alive.cancel();
    }
}

/// Connector whose sessions are tokens: cancelling one simulates the
/// server dropping the connection.
#[derive(Default)]
pub struct LoopbackConnector {
    pub network: RemoteNetwork,
    pub events: Events,
    pub reject_hops: Mutex<HashSet<usize>>,
    pub unreachable: AtomicBool,
    pub attempts: AtomicUsize,
    sessions: Mutex<Vec<CancellationToken>>,
}

impl LoopbackConnector {
    pub fn new(network: RemoteNetwork) -> Self {
        Self {
            network,
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().unwrap().clear();
    }

    pub fn drop_sessions(&self) {
        for session in self.sessions.lock().unwrap().drain(..) {
            session.cancel();
        }
    }
}

#[async_trait]
impl SshConnector for LoopbackConnector {
    async fn connect(
        &self,
        index: usize,
        hop: &HopSpec,
        login: Login,
        _via: Option<TunnelStream>,
    ) -> Result<Box<dyn SshClient>, TunnelError> {
        if index == 0 {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.unreachable.load(Ordering::SeqCst) {
                return Err(TunnelError::Dial {
                    index,
                    address: hop.address(),
                    reason: "connection refused".to_string(),
                });
            }
        }
        self.events
            .lock()
            .unwrap()
            .push(format!("connect {}", index));
        if self.reject_hops.lock().unwrap().contains(&index) {
            return Err(TunnelError::Auth {
                index,
                address: hop.address(),
                user: login.user,
            });
        }
        let alive = CancellationToken::new();
        self.sessions.lock().unwrap().push(alive.clone());
        Ok(Box::new(LoopbackClient {
            index,
            alive,
            network: self.network.clone(),
            events: self.events.clone(),
        }))
    }
}

pub fn hop(host: &str) -> HopSpec {
    HopSpec {
        host: host.to_string(),
        port: 22,
        user: Secret::parse("ops"),
        pass: Secret::parse("secret"),
        key: Secret::Empty,
    }
}

/// What the upstream saw, echoed back in response headers.
async fn echo(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().to_string();
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_default();
    let host = req
        .headers()
        .get("host")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let marker = req.headers().get("x-request-marker").cloned();
    let body = req.into_body().collect().await.unwrap().to_bytes();

    let mut response = Response::builder()
        .status(StatusCode::CREATED)
        .header("content-type", "application/json")
        .header("set-cookie", "a=1")
        .header("set-cookie", "b=2")
        .header("x-seen-method", method)
        .header("x-seen-path", path)
        .header("x-seen-host", host);
    if let Some(marker) = marker {
        response = response.header("x-request-marker", marker);
    }
    Ok(response.body(Full::new(body)).unwrap())
}

pub async fn start_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let _ = server_http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(echo))
                    .await;
            });
        }
    });
    addr
}

/// An https upstream with a self-signed certificate for `host`, plus a
/// connector that trusts exactly that certificate.
pub struct TlsUpstream {
    pub addr: SocketAddr,
    pub connector: TlsConnector,
    /// SNI of every accepted handshake, in order.
    pub server_names: Arc<Mutex<Vec<String>>>,
}

pub async fn start_tls_upstream(host: &str) -> TlsUpstream {
    hopgate::transport::ensure_crypto_provider();
    let certified = rcgen::generate_simple_self_signed(vec![host.to_string()]).unwrap();
    let cert = certified.cert.der().clone();
    let key = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());

    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert.clone()], PrivateKeyDer::Pkcs8(key))
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(server_config));

    let mut roots = RootCertStore::empty();
    roots.add(cert).unwrap();
    let client_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(client_config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server_names: Arc<Mutex<Vec<String>>> = Arc::default();
    let seen = server_names.clone();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            let acceptor = acceptor.clone();
            let seen = seen.clone();
            tokio::spawn(async move {
                let Ok(tls) = acceptor.accept(stream).await else {
                    return;
                };
                let name = tls.get_ref().1.server_name().unwrap_or("").to_string();
                seen.lock().unwrap().push(name);
                let _ = server_http1::Builder::new()
                    .serve_connection(TokioIo::new(tls), service_fn(echo))
                    .await;
            });
        }
    });

    TlsUpstream {
        addr,
        connector,
        server_names,
    }
}

pub async fn start_relay(engine: RelayEngine) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(hopgate::server::serve(listener, Arc::new(engine)));
    addr
}

pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// One request over a fresh local connection, the way a browser pointed
/// at `virtual_host` would send it.
pub async fn send(
    relay: SocketAddr,
    method: &str,
    virtual_host: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: &'static str,
) -> Reply {
    let stream = TcpStream::connect(relay).await.unwrap();
    let (mut sender, conn) = client_http1::handshake(TokioIo::new(stream)).await.unwrap();
    tokio::spawn(conn);

    let mut req = Request::builder()
        .method(method)
        .uri(path)
        .header("host", virtual_host);
    for (name, value) in headers {
        req = req.header(*name, *value);
    }
    let req = req.body(Full::new(Bytes::from_static(body.as_bytes()))).unwrap();

    let response = sender.send_request(req).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    Reply {
        status,
        headers,
        body,
    }
}

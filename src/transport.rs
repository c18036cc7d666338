//! One reusable HTTP/1.1 transport per remote address.
//!
//! Connections are never dialed directly: every transport opens its
//! streams through the tunnel, and wraps them in TLS (server name = real
//! host) when the route is https.

use crate::error::RelayError;
use crate::resolver::{Resolved, Scheme};
use crate::tunnel::Dialer;
use bytes::Bytes;
use http::Uri;
use http_body_util::combinators::UnsyncBoxBody;
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use log::{debug, warn};
use rustls::pki_types::ServerName;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;

/// Body type flowing through the relay in both directions.
pub type RelayBody = UnsyncBoxBody<Bytes, hyper::Error>;

static CRYPTO_PROVIDER_INIT: Once = Once::new();

pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::aws_lc_rs::default_provider()
            .install_default()
            .is_err()
        {
            debug!("Rustls crypto provider already installed");
        }
    });
}

/// Trust anchors for https upstreams: the system store, so internal CAs
/// installed on the machine are honored, plus the Mozilla root set.
pub fn trusted_roots() -> rustls::RootCertStore {
    let mut roots = rustls::RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    if !native.errors.is_empty() {
        warn!(
            "native certificate loading reported {} issues; continuing with available roots",
            native.errors.len()
        );
    }
    debug!("{} system roots loaded, {} ignored", added, ignored);
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    roots
}

pub fn default_tls_connector() -> TlsConnector {
    ensure_crypto_provider();
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(trusted_roots())
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

pub struct Transport {
    address: String,
    host: String,
    scheme: Scheme,
    dialer: Arc<dyn Dialer>,
    tls: Option<TlsConnector>,
    idle: Mutex<Vec<http1::SendRequest<RelayBody>>>,
}

impl Transport {
    pub fn new(resolved: &Resolved, dialer: Arc<dyn Dialer>, tls: Option<TlsConnector>) -> Self {
        Self {
            address: resolved.address.clone(),
            host: resolved.host.clone(),
            scheme: resolved.scheme,
            dialer,
            tls: if resolved.scheme.is_tls() { tls } else { None },
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Sends `req` to the remote end. The request is written in origin
    /// form; method, headers and body are passed through untouched.
    pub async fn round_trip(
        &self,
        mut req: Request<RelayBody>,
    ) -> Result<Response<Incoming>, RelayError> {
        *req.uri_mut() = origin_form(req.uri())?;

        let mut sender = match self.take_idle() {
            Some(sender) => sender,
            None => self.connect().await?,
        };
        let response = sender
            .send_request(req)
            .await
            .map_err(RelayError::RoundTrip)?;
        self.put_idle(sender);
        Ok(response)
    }

    /// Drops every pooled connection that is not carrying a request.
    pub fn close_idle_connections(&self) {
        if let Ok(mut idle) = self.idle.lock() {
            idle.clear();
        }
    }

    pub fn idle_connections(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }

    fn take_idle(&self) -> Option<http1::SendRequest<RelayBody>> {
        let mut idle = self.idle.lock().ok()?;
        while let Some(sender) = idle.pop() {
            if sender.is_ready() {
                debug!("reusing connection to {}", self.address);
                return Some(sender);
            }
        }
        None
    }

    fn put_idle(&self, sender: http1::SendRequest<RelayBody>) {
        if sender.is_closed() {
            return;
        }
        if let Ok(mut idle) = self.idle.lock() {
            idle.push(sender);
        }
    }

    async fn connect(&self) -> Result<http1::SendRequest<RelayBody>, RelayError> {
        debug!("opening connection to {} ({})", self.address, self.scheme);
        let stream = self.dialer.dial(&self.address).await?;
        match &self.tls {
            Some(tls) => {
                let name = ServerName::try_from(self.host.clone())
                    .map_err(|_| RelayError::ServerName(self.host.clone()))?;
                let stream = tls
                    .connect(name, stream)
                    .await
                    .map_err(|source| RelayError::Tls {
                        host: self.host.clone(),
                        source,
                    })?;
                self.handshake(stream).await
            }
            None => self.handshake(stream).await,
        }
    }

    async fn handshake<S>(&self, stream: S) -> Result<http1::SendRequest<RelayBody>, RelayError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(RelayError::Handshake)?;

        let address = self.address.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("connection to {} closed: {}", address, e);
            }
        });

        Ok(sender)
    }
}

fn origin_form(uri: &Uri) -> Result<Uri, RelayError> {
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let uri = path.parse::<Uri>().map_err(http::Error::from)?;
    Ok(uri)
}

/// Address keyed transport pool. Entries are created on first use and
/// live as long as the cache.
pub struct TransportCache {
    dialer: Arc<dyn Dialer>,
    tls: TlsConnector,
    transports: Mutex<HashMap<String, Arc<Transport>>>,
}

impl TransportCache {
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self::with_tls(dialer, default_tls_connector())
    }

    pub fn with_tls(dialer: Arc<dyn Dialer>, tls: TlsConnector) -> Self {
        Self {
            dialer,
            tls,
            transports: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, resolved: &Resolved) -> Arc<Transport> {
        let mut transports = self
            .transports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        transports
            .entry(resolved.address.clone())
            .or_insert_with(|| {
                debug!("new transport for {}", resolved.address);
                Arc::new(Transport::new(
                    resolved,
                    self.dialer.clone(),
                    Some(self.tls.clone()),
                ))
            })
            .clone()
    }

    pub fn len(&self) -> usize {
        self.transports
            .lock()
            .map(|transports| transports.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

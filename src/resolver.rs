//! Mapping between the virtual hostnames the local caller uses and the
//! real hosts inside the remote network.
//!
//! `api.example.com.tun.local:2046` (virtual, resolves to 127.0.0.1) maps to
//! `api.example.com`, which the route table knows is served over https, so
//! the tunnel is asked for `api.example.com:443`.

use crate::config::join_host_port;
use crate::error::{ConfigError, RelayError};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    /// Only the default ports are reachable, there is no custom port
    /// passthrough.
    pub fn port(self) -> &'static str {
        match self {
            Scheme::Http => "80",
            Scheme::Https => "443",
        }
    }

    pub fn is_tls(self) -> bool {
        self == Scheme::Https
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host to scheme table. Built once at startup, read only afterwards.
#[derive(Debug, Clone, Default)]
pub struct RemoteRoutes {
    routes: HashMap<String, Scheme>,
}

impl RemoteRoutes {
    pub fn insert(&mut self, host: String, scheme: Scheme) -> Result<(), ConfigError> {
        match self.routes.get(&host) {
            Some(existing) if *existing != scheme => Err(ConfigError::ConflictingScheme {
                host,
                first: existing.to_string(),
                second: scheme.to_string(),
            }),
            _ => {
                self.routes.insert(host, scheme);
                Ok(())
            }
        }
    }

    pub fn get(&self, host: &str) -> Option<Scheme> {
        self.routes.get(host).copied()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Everything the relay needs to know about where a request goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub host: String,
    pub scheme: Scheme,
    /// `host:port` as dialed through the tunnel.
    pub address: String,
}

#[derive(Debug, Clone)]
pub struct AddressResolver {
    wild: String,
    routes: RemoteRoutes,
}

impl AddressResolver {
    pub fn new(wild: impl Into<String>, routes: RemoteRoutes) -> Self {
        Self {
            wild: wild.into(),
            routes,
        }
    }

    pub fn strip<'a>(&self, virtual_host: &'a str) -> &'a str {
        strip(virtual_host, &self.wild)
    }

    pub fn classify(&self, real_host: &str) -> Result<Scheme, RelayError> {
        self.routes
            .get(real_host)
            .ok_or_else(|| RelayError::UnknownHost(real_host.to_string()))
    }

    pub fn resolve(&self, virtual_host: &str) -> Result<Resolved, RelayError> {
        let host = self.strip(virtual_host);
        let scheme = self.classify(host)?;
        Ok(Resolved {
            host: host.to_string(),
            scheme,
            address: join_host_port(host, scheme.port()),
        })
    }
}

/// Cuts the wildcard suffix and whatever follows it (the local port).
/// Hosts that do not carry the suffix, or consist of nothing but the
/// suffix, come back unchanged.
pub fn strip<'a>(virtual_host: &'a str, wild: &str) -> &'a str {
    if wild.is_empty() {
        return virtual_host;
    }
    match virtual_host.find(wild) {
        Some(index) if index > 0 => &virtual_host[..index],
        _ => virtual_host,
    }
}

pub fn port(scheme: Scheme) -> &'static str {
    scheme.port()
}

/// The url a user types locally to reach `real_host`. Display only.
pub fn local_display_url(real_host: &str, wild: &str, local_port: u16) -> String {
    let host = format!("{}{}", real_host, wild);
    match local_port {
        80 => format!("http://{}", host),
        port => format!("http://{}", join_host_port(&host, port)),
    }
}

use crate::error::ConfigError;
use crate::resolver::{RemoteRoutes, Scheme};
use crate::secrets::Secret;
use log::warn;
use serde::{Deserialize, Deserializer};
use std::path::PathBuf;

/// Configuration compiled into the binary, used when `--conf` is not given.
pub const DEFAULT_CONFIG: &str = include_str!("../conf/hopgate.json");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Trace => log::LevelFilter::Trace,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutputType {
    Stdout,
    Stderr,
    File,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogTarget {
    #[serde(rename = "type")]
    pub output_type: LogOutputType,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub level: Option<LogLevel>,
    /// Only records whose log target starts with this prefix, e.g.
    /// `hopgate::trace` to split round-trip dumps into their own file.
    #[serde(default)]
    pub only: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: Option<LogLevel>,
    #[serde(default)]
    pub format: Option<LogFormat>,
    #[serde(default)]
    pub targets: Option<Vec<LogTarget>>,
}

/// One machine on the way into the remote network. Password and public
/// key auth are both tried (RFC 4252), the first that succeeds wins.
#[derive(Debug, Clone, Deserialize)]
pub struct HopSpec {
    #[serde(alias = "Host")]
    pub host: String,
    #[serde(alias = "Port", deserialize_with = "port_from_any")]
    pub port: u16,
    #[serde(alias = "User")]
    pub user: Secret,
    #[serde(alias = "Pass", default)]
    pub pass: Secret,
    #[serde(alias = "Key", default)]
    pub key: Secret,
}

impl HopSpec {
    pub fn address(&self) -> String {
        join_host_port(&self.host, self.port)
    }
}

// Ports are accepted as strings too, older configuration files quote them.
fn port_from_any<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortValue {
        Number(u16),
        Text(String),
    }

    match PortValue::deserialize(deserializer)? {
        PortValue::Number(port) => Ok(port),
        PortValue::Text(text) => text
            .trim()
            .parse::<u16>()
            .map_err(|e| serde::de::Error::custom(format!("invalid port {:?}: {}", text, e))),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Wildcard dns suffix that resolves to 127.0.0.1, e.g. `.tun.local`.
    #[serde(alias = "Wild")]
    pub wild: String,
    /// Remote http(s) urls to relay.
    #[serde(alias = "Urls")]
    pub urls: Vec<String>,
    /// Hops of the ssh tunnel, in dialing order.
    #[serde(alias = "Hops")]
    pub hops: Vec<HopSpec>,
    /// Upper bound on reaching the upstream and receiving its response head.
    /// Body streaming is not bounded. Unset means wait forever.
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(content)?;
        Ok(config)
    }

    pub fn embedded() -> Result<Self, ConfigError> {
        Self::from_json(DEFAULT_CONFIG)
    }

    /// Checks everything that can be checked without touching the network
    /// and builds the host to scheme table.
    pub fn validate(&self) -> Result<RemoteRoutes, ConfigError> {
        if self.hops.is_empty() {
            return Err(ConfigError::NoHops);
        }
        for (index, hop) in self.hops.iter().enumerate() {
            if hop.host.trim().is_empty() {
                return Err(ConfigError::InvalidHop {
                    index,
                    reason: "host is empty".to_string(),
                });
            }
            if hop.port == 0 {
                return Err(ConfigError::InvalidHop {
                    index,
                    reason: "port must not be 0".to_string(),
                });
            }
            if hop.pass.is_empty() && hop.key.is_empty() {
                return Err(ConfigError::InvalidHop {
                    index,
                    reason: "neither pass nor key is configured".to_string(),
                });
            }
        }
        self.routes()
    }

    pub fn routes(&self) -> Result<RemoteRoutes, ConfigError> {
        let mut routes = RemoteRoutes::default();
        for raw in &self.urls {
            let remote = parse_remote_url(raw)?;
            if let Some(port) = remote.ignored_port {
                warn!(
                    "{}: port {} ignored, remote {} is reached on port {}",
                    raw,
                    port,
                    remote.host,
                    remote.scheme.port()
                );
            }
            routes.insert(remote.host, remote.scheme)?;
        }
        Ok(routes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteUrl {
    pub host: String,
    pub scheme: Scheme,
    pub ignored_port: Option<u16>,
}

pub fn parse_remote_url(raw: &str) -> Result<RemoteUrl, ConfigError> {
    let url = url::Url::parse(raw).map_err(|source| ConfigError::Url {
        url: raw.to_string(),
        source,
    })?;

    let scheme = match url.scheme() {
        "http" => Scheme::Http,
        "https" => Scheme::Https,
        other => {
            return Err(ConfigError::UnsupportedScheme {
                url: raw.to_string(),
                scheme: other.to_string(),
            });
        }
    };

    let host = url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| ConfigError::MissingHost(raw.to_string()))?
        .to_string();

    Ok(RemoteUrl {
        host,
        scheme,
        // `Url::port` is None for the scheme's default port.
        ignored_port: url.port(),
    })
}

/// `host:port`, bracketing ipv6 literals.
pub fn join_host_port(host: &str, port: impl std::fmt::Display) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> &'static str {
        r#"{
            "wild": ".tun.local",
            "urls": ["https://api.example.com", "http://grafana.internal"],
            "hops": [
                {"host": "bastion", "port": "2222", "user": "ops", "pass": "ENV:PASS"},
                {"host": "10.0.0.5", "port": 22, "user": "ops", "key": "FILE:~/.ssh/id_rsa"}
            ]
        }"#
    }

    #[test]
    fn parses_string_and_numeric_ports() {
        let config = Config::from_json(sample()).unwrap();
        assert_eq!(config.hops[0].port, 2222);
        assert_eq!(config.hops[1].port, 22);
        assert_eq!(config.hops[0].address(), "bastion:2222");
        assert_eq!(config.hops[0].pass, Secret::Env("PASS".to_string()));
        assert!(config.hops[0].key.is_empty());
        assert!(config.request_timeout_secs.is_none());
    }

    #[test]
    fn accepts_capitalized_field_names() {
        let config = Config::from_json(
            r#"{
                "Wild": ".w",
                "Urls": ["http://a"],
                "Hops": [{"Host": "h", "Port": "22", "User": "u", "Pass": "p", "Key": ""}]
            }"#,
        )
        .unwrap();
        assert_eq!(config.wild, ".w");
        assert_eq!(config.hops[0].host, "h");
    }

    #[test]
    fn validate_builds_routes() {
        let config = Config::from_json(sample()).unwrap();
        let routes = config.validate().unwrap();
        assert_eq!(routes.get("api.example.com"), Some(Scheme::Https));
        assert_eq!(routes.get("grafana.internal"), Some(Scheme::Http));
    }

    #[test]
    fn rejects_unsupported_scheme() {
        let err = parse_remote_url("ftp://files.example.com").unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedScheme { .. }));
        assert!(err.to_string().contains("ftp"));
    }

    #[test]
    fn rejects_conflicting_schemes_for_one_host() {
        let mut config = Config::from_json(sample()).unwrap();
        config.urls = vec![
            "http://api.example.com".to_string(),
            "https://api.example.com".to_string(),
        ];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ConflictingScheme { .. })
        ));
    }

    #[test]
    fn duplicate_url_with_same_scheme_is_fine() {
        let mut config = Config::from_json(sample()).unwrap();
        config.urls = vec![
            "https://api.example.com".to_string(),
            "https://api.example.com/v2".to_string(),
        ];
        assert_eq!(config.validate().unwrap().len(), 1);
    }

    #[test]
    fn custom_port_is_recorded_but_not_routed() {
        let remote = parse_remote_url("https://api.example.com:8443").unwrap();
        assert_eq!(remote.host, "api.example.com");
        assert_eq!(remote.ignored_port, Some(8443));
        let remote = parse_remote_url("https://api.example.com:443").unwrap();
        assert_eq!(remote.ignored_port, None);
    }

    #[test]
    fn rejects_hops_without_credentials() {
        let mut config = Config::from_json(sample()).unwrap();
        config.hops[0].pass = Secret::Empty;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidHop { index: 0, .. })
        ));
        config.hops.clear();
        assert!(matches!(config.validate(), Err(ConfigError::NoHops)));
    }

    #[test]
    fn embedded_config_is_valid() {
        let config = Config::embedded().unwrap();
        assert!(config.validate().is_ok());
        assert!(!config.wild.is_empty());
    }

    #[test]
    fn join_host_port_brackets_ipv6() {
        assert_eq!(join_host_port("example.com", 443), "example.com:443");
        assert_eq!(join_host_port("::1", "80"), "[::1]:80");
    }
}

use serde::{Deserialize, Deserializer};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;
use zeroize::Zeroizing;

const ENV_PREFIX: &str = "ENV:";
const FILE_PREFIX: &str = "FILE:";

/// Errors produced while resolving a secret reference.
#[derive(Error, Debug)]
pub enum SecretError {
    #[error("environment variable {0} is not set")]
    MissingEnv(String),

    #[error("unable to locate the home directory to expand {0}")]
    MissingHomeDir(String),

    #[error("filekey: {path}, {source}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// A configuration value that is either given inline or read from somewhere
/// else when a connection is made.
///
/// `ENV:NAME` reads the environment variable `NAME`, `FILE:path` reads the
/// whole file at `path` (a leading `~` is the home directory of the process
/// owner, which is root's home under `sudo`). Anything else is a literal.
#[derive(Clone, PartialEq, Eq, Default)]
pub enum Secret {
    #[default]
    Empty,
    Literal(String),
    Env(String),
    File(String),
}

impl Secret {
    pub fn parse(raw: &str) -> Self {
        if raw.is_empty() {
            Secret::Empty
        } else if let Some(name) = raw.strip_prefix(ENV_PREFIX) {
            Secret::Env(name.to_string())
        } else if let Some(path) = raw.strip_prefix(FILE_PREFIX) {
            Secret::File(path.to_string())
        } else {
            Secret::Literal(raw.to_string())
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Secret::Empty)
    }

    /// Resolves the value. Called on every (re)connection so rotated
    /// credentials are picked up without a restart.
    pub fn resolve(&self) -> Result<Zeroizing<String>, SecretError> {
        match self {
            Secret::Empty => Ok(Zeroizing::new(String::new())),
            Secret::Literal(value) => Ok(Zeroizing::new(value.clone())),
            Secret::Env(name) => std::env::var(name)
                .map(Zeroizing::new)
                .map_err(|_| SecretError::MissingEnv(name.clone())),
            Secret::File(path) => {
                let full = expand_home(path)?;
                fs::read_to_string(&full)
                    .map(Zeroizing::new)
                    .map_err(|source| SecretError::Unreadable {
                        path: path.clone(),
                        source,
                    })
            }
        }
    }
}

// Literals never end up in logs.
impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Secret::Empty => write!(f, "Secret::Empty"),
            Secret::Literal(_) => write!(f, "Secret::Literal(***)"),
            Secret::Env(name) => write!(f, "Secret::Env({})", name),
            Secret::File(path) => write!(f, "Secret::File({})", path),
        }
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Secret::parse(&raw))
    }
}

fn expand_home(path: &str) -> Result<PathBuf, SecretError> {
    match path.strip_prefix('~') {
        Some(rest) => {
            let home =
                dirs::home_dir().ok_or_else(|| SecretError::MissingHomeDir(path.to_string()))?;
            let rest = rest.trim_start_matches(['/', '\\']);
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}

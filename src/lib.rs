pub mod config;
pub mod error;
pub mod logging;
pub mod relay;
pub mod resolver;
pub mod secrets;
pub mod server;
pub mod ssh;
pub mod trace;
pub mod transport;
pub mod tunnel;

pub use config::Config;
pub use error::{ConfigError, RelayError, TunnelError};
pub use relay::RelayEngine;
pub use resolver::{AddressResolver, RemoteRoutes, Scheme};
pub use server::RelayServer;
pub use transport::TransportCache;
pub use tunnel::TunnelManager;

use anyhow::Context;
use clap::{ArgAction, Parser};
use hopgate::config::{Config, DEFAULT_CONFIG, LogLevel, parse_remote_url};
use hopgate::logging::{CustomLogger, init_fallback};
use hopgate::resolver::local_display_url;
use hopgate::ssh::RusshConnector;
use hopgate::trace::Tracer;
use hopgate::{AddressResolver, RelayEngine, RelayServer, TransportCache, TunnelManager};
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

#[derive(Parser)]
#[clap(
    version,
    about = "Relay local http requests to remote http(s) services through a chain of ssh hops"
)]
struct Args {
    #[clap(
        long,
        value_name = "PORT",
        default_value_t = 2046,
        help = "Local serving port on 127.0.0.1"
    )]
    port: u16,

    #[clap(
        long,
        value_name = "BOOL",
        default_value_t = true,
        action = ArgAction::Set,
        help = "Trace every http roundtrip"
    )]
    trace: bool,

    #[clap(long, value_name = "FILE", help = "Use a custom configuration file")]
    conf: Option<String>,

    #[clap(long, help = "Print the builtin configuration (a starting point for customization)")]
    view: bool,
}

fn version_tag() -> String {
    format!("{} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.view {
        println!("{}", DEFAULT_CONFIG);
        return Ok(());
    }

    let config = match &args.conf {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load configuration file {}", path))?,
        None => Config::embedded().context("Builtin configuration is broken")?,
    };

    match config.logging.clone() {
        Some(logging) => CustomLogger::init(logging).context("Failed to initialize logging")?,
        None => init_fallback(LogLevel::Info),
    }

    let routes = config.validate().context("Invalid configuration")?;

    println!("{}", version_tag());
    println!("{}", tips(&config, args.port));

    let tunnel = TunnelManager::start(config.hops.clone(), Arc::new(RusshConnector::default()))
        .await
        .context("Failed to establish the ssh tunnel")?;

    let engine = RelayEngine::new(
        AddressResolver::new(config.wild.clone(), routes),
        TransportCache::new(Arc::new(tunnel)),
        Tracer::new(args.trace),
    )
    .with_timeout(config.request_timeout_secs.map(Duration::from_secs));

    let server = RelayServer::new(Arc::new(engine), args.port);
    let server_handle = tokio::spawn(server.run());

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
        result = server_handle => {
            match result {
                Ok(Err(e)) => {
                    error!("Server error: {}", e);
                    return Err(e).context("Relay server stopped");
                }
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
    }

    info!("Relay stopped. Goodbye!");
    Ok(())
}

/// Remote url to local url table printed at startup.
fn tips(config: &Config, port: u16) -> String {
    let mut rows = vec![
        [
            "#relay".to_string(),
            "Remote http(s)".to_string(),
            "Local http".to_string(),
        ],
        [
            "------".to_string(),
            "--------------".to_string(),
            "----------".to_string(),
        ],
    ];
    for (i, raw) in config.urls.iter().enumerate() {
        // urls were checked by validate
        let local = parse_remote_url(raw)
            .map(|remote| local_display_url(&remote.host, &config.wild, port))
            .unwrap_or_default();
        rows.push([(i + 1).to_string(), raw.clone(), local]);
    }

    let width = |col: usize| rows.iter().map(|row| row[col].len()).max().unwrap_or(0);
    let (w0, w1) = (width(0), width(1));
    rows.iter()
        .map(|row| format!("{:<w0$} | {:<w1$} | {}", row[0], row[1], row[2]))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tips_lists_every_url() {
        let mut config = Config::embedded().unwrap();
        config.wild = ".tun.local".to_string();
        config.urls = vec![
            "https://api.example.com".to_string(),
            "http://grafana.internal".to_string(),
        ];

        let table = tips(&config, 2046);
        let lines: Vec<_> = table.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("#relay | Remote http(s)"));
        assert_eq!(
            lines[2],
            "1      | https://api.example.com | http://api.example.com.tun.local:2046"
        );
        assert!(lines[3].ends_with("| http://grafana.internal.tun.local:2046"));

        let table = tips(&config, 80);
        assert!(table.contains("http://api.example.com.tun.local\n"));
    }

    #[test]
    fn trace_flag_takes_explicit_value() {
        let args = Args::parse_from(["hopgate"]);
        assert!(args.trace);
        assert_eq!(args.port, 2046);
        let args = Args::parse_from(["hopgate", "--trace", "false", "--port", "8080"]);
        assert!(!args.trace);
        assert_eq!(args.port, 8080);
    }
}

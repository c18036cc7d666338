use crate::relay::RelayEngine;
use http_body_util::BodyExt;
use hyper::Request;
use hyper::body::Incoming;
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use log::{debug, error, info};
use std::convert::Infallible;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;

/// Local listener. Only loopback is ever bound: the virtual hosts
/// resolve to 127.0.0.1 and nothing else should reach the tunnel.
pub struct RelayServer {
    engine: Arc<RelayEngine>,
    addr: SocketAddr,
}

impl RelayServer {
    pub fn new(engine: Arc<RelayEngine>, port: u16) -> Self {
        Self {
            engine,
            addr: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
        }
    }

    pub async fn run(self) -> std::io::Result<()> {
        info!("Binding HTTP listener to: {}", self.addr);
        let listener = TcpListener::bind(self.addr).await?;
        serve(listener, self.engine).await
    }
}

/// Accepts connections until the listener fails, one task per connection.
pub async fn serve(listener: TcpListener, engine: Arc<RelayEngine>) -> std::io::Result<()> {
    info!("Relay listening on: http://{}", listener.local_addr()?);

    loop {
        let (stream, remote_addr) = listener.accept().await?;
        let _ = stream.set_nodelay(true);
        debug!("Accepted connection from {}", remote_addr);

        let engine = engine.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let engine = engine.clone();
                async move {
                    let req = req.map(|body| body.boxed_unsync());
                    Ok::<_, Infallible>(engine.handle(req).await)
                }
            });

            if let Err(err) = ServerBuilder::new()
                .keep_alive(true)
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                error!("Error serving HTTP connection from {}: {}", remote_addr, err);
            }
        });
    }
}

//! Per request relay: virtual host in, remote response out.

use crate::error::RelayError;
use crate::resolver::{AddressResolver, Resolved};
use crate::trace::{TraceEvent, Tracer};
use crate::transport::{RelayBody, TransportCache};
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST, X_CONTENT_TYPE_OPTIONS};
use http::request::Parts;
use http::{HeaderValue, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub fn full(bytes: impl Into<Bytes>) -> RelayBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub struct RelayEngine {
    resolver: AddressResolver,
    cache: TransportCache,
    tracer: Tracer,
    round: AtomicU64,
    timeout: Option<Duration>,
}

impl RelayEngine {
    pub fn new(resolver: AddressResolver, cache: TransportCache, tracer: Tracer) -> Self {
        Self {
            resolver,
            cache,
            tracer,
            round: AtomicU64::new(0),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Round ids start at 1 and are unique for the life of the engine.
    pub fn next_round(&self) -> u64 {
        self.round.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Relays one request. Never fails: anything that goes wrong becomes a
    /// 500 carrying the error text.
    pub async fn handle(&self, req: Request<RelayBody>) -> Response<RelayBody> {
        let round = self.next_round();
        match self.relay(round, req).await {
            Ok(response) => response,
            Err(e) => {
                debug!("#{} relay failed: {}", round, e);
                self.tracer.emit(round, TraceEvent::Error(&e));
                error_response(&e)
            }
        }
    }

    async fn relay(
        &self,
        round: u64,
        req: Request<RelayBody>,
    ) -> Result<Response<RelayBody>, RelayError> {
        let (mut parts, body) = req.into_parts();
        let resolved = self.rewrite(&mut parts);
        let body = self.trace_request(round, &parts, body).await?;
        let resolved = resolved?;

        let transport = self.cache.get(&resolved);
        debug!(
            "#{} relaying to {}://{}",
            round,
            transport.scheme().as_str(),
            transport.address()
        );
        let req = Request::from_parts(parts, body);
        // Covers dial, handshake and the response head, not the body.
        let result = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, transport.round_trip(req))
                .await
                .unwrap_or_else(|_| Err(RelayError::Timeout(limit))),
            None => transport.round_trip(req).await,
        };
        transport.close_idle_connections();

        let (parts, body) = result?.into_parts();
        let body = if self.tracer.wants_body(&parts.headers) {
            let bytes = body
                .collect()
                .await
                .map_err(RelayError::ResponseBody)?
                .to_bytes();
            self.tracer.emit(
                round,
                TraceEvent::Response {
                    status: parts.status,
                    version: parts.version,
                    headers: &parts.headers,
                    body: Some(&bytes),
                },
            );
            full(bytes)
        } else {
            self.tracer.emit(
                round,
                TraceEvent::Response {
                    status: parts.status,
                    version: parts.version,
                    headers: &parts.headers,
                    body: None,
                },
            );
            body.boxed_unsync()
        };
        Ok(Response::from_parts(parts, body))
    }

    /// Points the request at the real host: absolute uri with the remote
    /// scheme and address, `Host` set to the real host name.
    fn rewrite(&self, parts: &mut Parts) -> Result<Resolved, RelayError> {
        let virtual_host = virtual_host(parts).ok_or(RelayError::MissingHost)?;
        let resolved = self.resolver.resolve(&virtual_host)?;

        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        parts.uri = Uri::builder()
            .scheme(resolved.scheme.as_str())
            .authority(resolved.address.as_str())
            .path_and_query(path)
            .build()?;
        let host = HeaderValue::from_str(&resolved.host).map_err(http::Error::from)?;
        parts.headers.insert(HOST, host);
        Ok(resolved)
    }

    async fn trace_request(
        &self,
        round: u64,
        parts: &Parts,
        body: RelayBody,
    ) -> Result<RelayBody, RelayError> {
        if !self.tracer.is_enabled() {
            return Ok(body);
        }
        let (body, bytes) = if self.tracer.wants_body(&parts.headers) {
            let bytes = body.collect().await.map_err(RelayError::Body)?.to_bytes();
            (full(bytes.clone()), Some(bytes))
        } else {
            (body, None)
        };
        self.tracer.emit(
            round,
            TraceEvent::Request {
                method: &parts.method,
                uri: &parts.uri,
                version: parts.version,
                headers: &parts.headers,
                body: bytes.as_ref(),
            },
        );
        Ok(body)
    }
}

fn virtual_host(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .filter(|host| !host.is_empty())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(|a| a.as_str().to_string()))
}

pub fn error_response(err: &RelayError) -> Response<RelayBody> {
    let mut response = Response::new(full(format!("{}\n", err)));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    let headers = response.headers_mut();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    response
}

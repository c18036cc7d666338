//! Round-trip dumps for debugging the remote APIs.
//!
//! Every inbound request gets a round id; its request dump and its
//! response (or error) dump carry the same `#id` so the two can be paired
//! in interleaved output.

use crate::error::TraceError;
use bytes::Bytes;
use http::header::{CONTENT_ENCODING, CONTENT_TYPE};
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use log::{info, warn};
use std::fmt::{self, Write};

pub const TRACE_TARGET: &str = "hopgate::trace";

const COMPRESSED: [&str; 4] = ["gzip", "compress", "deflate", "br"];

/// Whether a body is worth dumping. Compressed bodies never are, and of
/// the readable ones only json is kept to bound log volume.
pub fn should_dump_body(headers: &HeaderMap) -> bool {
    let encoding = header_str(headers, CONTENT_ENCODING);
    if COMPRESSED.iter().any(|c| encoding.contains(c)) {
        return false;
    }
    header_str(headers, CONTENT_TYPE).contains("application/json")
}

fn header_str(headers: &HeaderMap, name: http::header::HeaderName) -> &str {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
}

/// What one dump describes.
pub enum TraceEvent<'a> {
    Request {
        method: &'a Method,
        uri: &'a Uri,
        version: Version,
        headers: &'a HeaderMap,
        body: Option<&'a Bytes>,
    },
    Response {
        status: StatusCode,
        version: Version,
        headers: &'a HeaderMap,
        body: Option<&'a Bytes>,
    },
    Error(&'a dyn fmt::Display),
}

#[derive(Debug, Clone, Copy)]
pub struct Tracer {
    enabled: bool,
}

impl Tracer {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Bodies are only worth holding in memory when they will be dumped.
    pub fn wants_body(&self, headers: &HeaderMap) -> bool {
        self.enabled && should_dump_body(headers)
    }

    pub fn emit(&self, round: u64, event: TraceEvent<'_>) {
        if !self.enabled {
            return;
        }
        match render(round, &event) {
            Ok(dump) => info!(target: TRACE_TARGET, "{}", dump),
            Err(e) => warn!(target: TRACE_TARGET, "#{} dump failed: {}", round, e),
        }
    }
}

pub fn render(round: u64, event: &TraceEvent<'_>) -> Result<String, TraceError> {
    let mut out = String::new();
    writeln!(out, "#{}", round)?;
    match event {
        TraceEvent::Request {
            method,
            uri,
            version,
            headers,
            body,
        } => {
            let target = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
            writeln!(out, "{} {} {:?}", method, target, version)?;
            if let Some(host) = uri.host() {
                if !headers.contains_key(http::header::HOST) {
                    writeln!(out, "host: {}", host)?;
                }
            }
            write_headers(&mut out, headers, *body)?;
        }
        TraceEvent::Response {
            status,
            version,
            headers,
            body,
        } => {
            writeln!(out, "{:?} {}", version, status)?;
            write_headers(&mut out, headers, *body)?;
        }
        TraceEvent::Error(err) => writeln!(out, "{}", err)?,
    }
    Ok(out)
}

fn write_headers(out: &mut String, headers: &HeaderMap, body: Option<&Bytes>) -> fmt::Result {
    for (name, value) in headers {
        match value.to_str() {
            Ok(value) => writeln!(out, "{}: {}", name, value)?,
            Err(_) => writeln!(out, "{}: {:?}", name, value.as_bytes())?,
        }
    }
    writeln!(out)?;
    if let Some(body) = body {
        writeln!(out, "{}", String::from_utf8_lossy(body))?;
    }
    Ok(())
}

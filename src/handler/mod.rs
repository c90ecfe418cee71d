//! Protocol handlers and content resolution.
//!
//! # Data Flow
//! ```text
//! Connection (from listener)
//!     → ProtocolHandler::serve_conn
//!         → read        (one request line, deadline bound)
//!         → parse       (finger / gopher grammar → route + extra)
//!         → process     (resolver.rs: cache → fs → template + fetch.rs)
//!         → write       (bytes or streamed file)
//!
//! Cron (synthetic Connection)
//!     → ProtocolHandler::serve_crontab
//!         → process with force_cache_update
//! ```
//!
//! # Design Decisions
//! - Closed set of handlers resolved once from the config name ([`HandlerKind`])
//! - Handlers share the pipeline through free functions in `pipeline.rs`;
//!   each one only overrides what its protocol changes
//! - A request always gets a well-formed answer; errors surface only for
//!   I/O failures on the connection itself

pub mod exposition;
pub mod fetch;
pub mod finger;
pub mod gopher;
pub mod pipeline;
pub mod resolver;
pub mod template;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::cache::CacheStatus;
use crate::net::connection::{Connection, ConnectionError};

pub const CRLF: &str = "\r\n";

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("unknown handler {0}")]
    UnknownHandler(String),

    #[error("unable to read request: {0}")]
    Read(#[source] ConnectionError),

    #[error("unable to parse request: {0}")]
    Parse(String),

    #[error("unable to write response: {0}")]
    Write(#[source] ConnectionError),

    #[error("post-processing failed: {0}")]
    PostProcess(String),
}

/// Response body ready to be written.
#[derive(Debug)]
pub enum Payload {
    Bytes(Bytes),
    /// Static file streamed without caching.
    File(tokio::fs::File),
}

impl Payload {
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Payload::Bytes(b) => Some(b),
            Payload::File(_) => None,
        }
    }
}

/// Result of resolving a route.
#[derive(Debug)]
pub struct Outcome {
    pub payload: Payload,
    pub code: u16,
    pub cache_status: CacheStatus,
    /// Built-in error text; never written to the cache.
    pub builtin_error: bool,
}

/// A parsed request line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub route: String,
    /// Protocol extension data (gopher `URL:` target).
    pub extra: Option<String>,
}

/// Capabilities a wire protocol provides to the server.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Serve one accepted connection end to end.
    async fn serve_conn(&self, conn: &mut Connection) -> Result<(), HandlerError>;

    /// Re-render a route for the scheduler, replacing its cache entry.
    async fn serve_crontab(&self, conn: &mut Connection, route: &str) -> Result<Outcome, HandlerError>;

    /// Add protocol helpers to a template environment.
    fn register_template_functions(&self, env: &mut minijinja::Environment<'static>, conn: &Connection);

    /// Describe handler-specific metrics. Called once at startup.
    fn register_metrics(&self) {}

    async fn read(&self, conn: &mut Connection) -> Result<String, HandlerError> {
        pipeline::read_request_line(conn).await
    }

    fn parse(&self, conn: &mut Connection, line: &str) -> Result<Request, HandlerError>;

    async fn process(
        &self,
        conn: &mut Connection,
        request: &Request,
        force_cache_update: bool,
    ) -> Result<Outcome, HandlerError>;

    /// Rewrite a rendered template before it is cached.
    fn post_process(&self, _conn: &Connection, rendered: String) -> Result<String, HandlerError> {
        Ok(rendered)
    }

    async fn write(&self, conn: &mut Connection, payload: Payload) -> Result<(), HandlerError> {
        pipeline::write_payload(conn, payload).await
    }

    /// Minimal body for a failing error route, without the trailing CRLF.
    fn error_payload(&self, code: u16) -> Bytes {
        Bytes::from(status_text(code))
    }
}

/// Human readable status line shared by the handlers.
pub fn status_text(code: u16) -> &'static str {
    match code {
        200 => "OK (200)",
        404 => "Not found (404)",
        _ => "Internal Server Error (500)",
    }
}

/// The handlers this server ships.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Finger,
    Gopher,
}

impl HandlerKind {
    pub fn from_name(name: &str) -> Result<Self, HandlerError> {
        match name {
            "finger" => Ok(Self::Finger),
            "gopher" => Ok(Self::Gopher),
            other => Err(HandlerError::UnknownHandler(other.to_string())),
        }
    }

    pub fn build(self) -> Arc<dyn ProtocolHandler> {
        match self {
            Self::Finger => Arc::new(finger::FingerHandler),
            Self::Gopher => Arc::new(gopher::GopherHandler),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_known_names() {
        assert_eq!(HandlerKind::from_name("finger").unwrap(), HandlerKind::Finger);
        assert_eq!(HandlerKind::from_name("gopher").unwrap().build().name(), "gopher");
        assert!(matches!(
            HandlerKind::from_name("gemini"),
            Err(HandlerError::UnknownHandler(ref n)) if n == "gemini"
        ));
    }
}

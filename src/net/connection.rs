//! Connection state machine and per-request context.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Wrap the (possibly TLS, possibly proxied) stream in buffered halves
//! - Enforce read/write deadlines and the request-line size limit
//! - Track the state machine and the result code of the request
//!
//! # State Machine
//! ```text
//! New → Reading → Parsing → Processing → Writing → Finished
//!          ↓         ↓          ↓           ↓
//!   ReadingError ParsingError ProcessingError WritingError
//!
//! Cron → Processing (synthetic connections skip read and parse)
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use thiserror::Error;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf,
    Take, WriteHalf,
};
use tokio::net::TcpStream;
use tokio::time::Instant;
use uuid::Uuid;

use crate::cache::CacheHandle;
use crate::config::SpaceConfig;
use crate::context::ServeContext;
use crate::handler::fetch::Fetcher;
use crate::observability::MetricsSink;

/// Largest request line accepted, in bytes.
pub const MAX_REQUEST_SIZE: u64 = 512;
pub const READ_TIMEOUT: Duration = Duration::from_secs(60);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(60);

/// Any byte stream a connection can run on.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("read deadline exceeded")]
    ReadTimeout,

    #[error("write deadline exceeded")]
    WriteTimeout,

    #[error("connection has no stream")]
    NoStream,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Random UUID v4 for an accepted socket.
    ///
    /// Falls back to the socket's address in memory when the OS random source
    /// fails, and to the nil UUID when there is no socket at all.
    pub fn generate(socket: Option<&TcpStream>) -> Self {
        let Some(socket) = socket else {
            return Self::nil();
        };

        let mut bytes = [0u8; 16];
        match rand::rngs::OsRng.try_fill_bytes(&mut bytes) {
            Ok(()) => Self(uuid::Builder::from_random_bytes(bytes).into_uuid().to_string()),
            Err(e) => {
                tracing::warn!(error = %e, "Random source failed, using pointer id");
                Self(format!("{:p}", socket))
            }
        }
    }

    pub fn nil() -> Self {
        Self(Uuid::nil().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Connection state for lifecycle tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Reading,
    ReadingError,
    Parsing,
    ParsingError,
    Processing,
    ProcessingError,
    Writing,
    WritingError,
    Finished,
    /// Synthetic connection fired by the scheduler.
    Cron,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Reading => "reading",
            Self::ReadingError => "reading_error",
            Self::Parsing => "parsing",
            Self::ParsingError => "parsing_error",
            Self::Processing => "processing",
            Self::ProcessingError => "processing_error",
            Self::Writing => "writing",
            Self::WritingError => "writing_error",
            Self::Finished => "finished",
            Self::Cron => "cron",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::ReadingError | Self::ParsingError | Self::ProcessingError | Self::WritingError
        )
    }

    pub fn is_terminal(&self) -> bool {
        self.is_error() || *self == Self::Finished
    }

    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (New, Reading)
                | (Reading, ReadingError)
                | (Reading, Parsing)
                | (Parsing, ParsingError)
                | (Parsing, Processing)
                | (Cron, Processing)
                | (Processing, ProcessingError)
                | (Processing, Writing)
                | (Processing, Finished)
                | (Writing, WritingError)
                | (Writing, Finished)
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Socket facts known once the handshake is done.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub sni: Option<String>,
}

/// Read/write deadlines and the request size cap.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_request_size: u64,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            read_timeout: READ_TIMEOUT,
            write_timeout: WRITE_TIMEOUT,
            max_request_size: MAX_REQUEST_SIZE,
        }
    }
}

/// One request from accept (or cron fire) to close.
pub struct Connection {
    pub id: ConnectionId,
    reader: Option<BufReader<Take<ReadHalf<BoxedStream>>>>,
    writer: Option<BufWriter<WriteHalf<BoxedStream>>>,
    read_deadline: Instant,
    write_deadline: Instant,

    pub started: Instant,
    pub ended: Option<Instant>,

    /// Domain used in responses (gopher menus).
    pub domain: String,
    /// Port used in responses.
    pub port: u16,
    /// Server name requested in the TLS handshake, when it matched.
    pub sni: Option<String>,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,

    state: ConnectionState,
    /// Result code: 200, 404 or 500.
    pub code: u16,

    pub config: Arc<SpaceConfig>,
    pub cache: CacheHandle,
    pub metrics: MetricsSink,
    pub fetcher: Fetcher,
}

impl Connection {
    /// Wrap an accepted stream. Deadlines start now.
    pub fn new(stream: BoxedStream, info: ConnectionInfo, ctx: &ServeContext, limits: ConnectionLimits) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let started = Instant::now();

        Self {
            id: info.id,
            reader: Some(BufReader::new(read_half.take(limits.max_request_size))),
            writer: Some(BufWriter::new(write_half)),
            read_deadline: started + limits.read_timeout,
            write_deadline: started + limits.write_timeout,
            started,
            ended: None,
            domain: String::new(),
            port: 0,
            sni: info.sni,
            local_addr: info.local_addr,
            remote_addr: info.remote_addr,
            state: ConnectionState::New,
            code: 0,
            config: ctx.snapshot(),
            cache: ctx.cache.clone(),
            metrics: ctx.metrics.clone(),
            fetcher: ctx.fetcher.clone(),
        }
    }

    /// A socketless connection for scheduled renders.
    pub fn synthetic(ctx: &ServeContext, listener_addr: Option<SocketAddr>) -> Self {
        let addr = listener_addr.unwrap_or(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0));
        let started = Instant::now();

        Self {
            id: ConnectionId::generate(None),
            reader: None,
            writer: None,
            read_deadline: started,
            write_deadline: started,
            started,
            ended: None,
            domain: String::new(),
            port: 0,
            sni: None,
            local_addr: addr,
            remote_addr: addr,
            state: ConnectionState::Cron,
            code: 0,
            config: ctx.snapshot(),
            cache: ctx.cache.clone(),
            metrics: ctx.metrics.clone(),
            fetcher: ctx.fetcher.clone(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Move to `next` if the state machine allows it.
    pub fn set_state(&mut self, next: ConnectionState) -> bool {
        if !self.state.can_transition_to(next) {
            tracing::warn!(
                connection = %self.id,
                from = %self.state,
                to = %next,
                "Rejected state transition"
            );
            return false;
        }

        tracing::trace!(connection = %self.id, from = %self.state, to = %next, "State transition");
        self.state = next;
        if next.is_terminal() {
            self.ended = Some(Instant::now());
        }
        true
    }

    /// Read one request line, up to the size cap, before the read deadline.
    ///
    /// The trailing newline is kept; an unterminated line is returned as-is.
    /// Invalid UTF-8 is replaced rather than rejected.
    pub async fn read_line(&mut self) -> Result<String, ConnectionError> {
        let reader = self.reader.as_mut().ok_or(ConnectionError::NoStream)?;
        let mut line = Vec::new();
        tokio::time::timeout_at(self.read_deadline, reader.read_until(b'\n', &mut line))
            .await
            .map_err(|_| ConnectionError::ReadTimeout)??;
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        let writer = self.writer.as_mut().ok_or(ConnectionError::NoStream)?;
        tokio::time::timeout_at(self.write_deadline, writer.write_all(data))
            .await
            .map_err(|_| ConnectionError::WriteTimeout)??;
        Ok(())
    }

    /// Stream a reader (an open file) to the client.
    pub async fn copy_from<R>(&mut self, source: &mut R) -> Result<u64, ConnectionError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let writer = self.writer.as_mut().ok_or(ConnectionError::NoStream)?;
        let copied = tokio::time::timeout_at(self.write_deadline, tokio::io::copy(source, writer))
            .await
            .map_err(|_| ConnectionError::WriteTimeout)??;
        Ok(copied)
    }

    pub async fn flush(&mut self) -> Result<(), ConnectionError> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        tokio::time::timeout_at(self.write_deadline, writer.flush())
            .await
            .map_err(|_| ConnectionError::WriteTimeout)??;
        Ok(())
    }

    /// Flush and shut down the write side. Idempotent.
    pub async fn close(&mut self) -> Result<(), ConnectionError> {
        self.flush().await?;
        if let Some(mut writer) = self.writer.take() {
            let _ = tokio::time::timeout_at(self.write_deadline, writer.shutdown()).await;
        }
        self.reader = None;
        if self.ended.is_none() {
            self.ended = Some(Instant::now());
        }
        Ok(())
    }

    pub fn elapsed(&self) -> Duration {
        self.ended.unwrap_or_else(Instant::now) - self.started
    }

    pub fn is_synthetic(&self) -> bool {
        self.writer.is_none() && self.state == ConnectionState::Cron
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("code", &self.code)
            .field("domain", &self.domain)
            .field("port", &self.port)
            .field("sni", &self.sni)
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nil_id_without_socket() {
        assert_eq!(
            ConnectionId::generate(None).as_str(),
            "00000000-0000-0000-0000-000000000000"
        );
    }

    #[tokio::test]
    async fn random_ids_are_unique_v4() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).await.unwrap();

        let id1 = ConnectionId::generate(Some(&stream));
        let id2 = ConnectionId::generate(Some(&stream));
        assert_ne!(id1, id2);

        let parsed = Uuid::parse_str(id1.as_str()).unwrap();
        assert_eq!(parsed.get_version_num(), 4);
    }

    #[test]
    fn happy_path_transitions() {
        use ConnectionState::*;
        let path = [New, Reading, Parsing, Processing, Writing, Finished];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(Cron.can_transition_to(Processing));
    }

    #[test]
    fn error_states_are_terminal() {
        use ConnectionState::*;
        let all = [
            New, Reading, ReadingError, Parsing, ParsingError, Processing, ProcessingError, Writing,
            WritingError, Finished, Cron,
        ];
        for state in [ReadingError, ParsingError, ProcessingError, WritingError, Finished] {
            assert!(state.is_terminal());
            for next in all {
                assert!(!state.can_transition_to(next));
            }
        }
    }

    #[test]
    fn no_cycles_or_skips() {
        use ConnectionState::*;
        assert!(!Parsing.can_transition_to(Reading));
        assert!(!New.can_transition_to(Processing));
        assert!(!Cron.can_transition_to(Reading));
        assert!(!Writing.can_transition_to(Processing));
    }
}

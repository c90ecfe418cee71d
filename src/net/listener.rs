//! TCP listener with graceful drain.
//!
//! # Responsibilities
//! - Bind the configured address and build the TLS acceptor (ACME or PEM)
//! - Accept connections and spawn one task per connection
//! - Unwrap PROXY protocol headers and run the TLS handshake in that task
//! - Track active connections for the gauge and for draining
//! - Stop accepting on shutdown and wait for in-flight connections

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use arc_swap::{ArcSwap, ArcSwapOption};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{ListenerConfig, ProxyProtocolMode, TlsConfig};
use crate::context::ServeContext;
use crate::net::acme::{AcmeError, AcmeManager};
use crate::net::connection::{BoxedStream, Connection, ConnectionId, ConnectionInfo, ConnectionLimits};
use crate::net::proxy_protocol::{self, ProxyProtocolError};
use crate::net::tls::{self, CertResolver, TlsAcceptor, TlsError};
use crate::observability::MetricsSink;

pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("invalid listener address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to accept: {0}")]
    Accept(#[source] std::io::Error),

    #[error("listener is not bound")]
    NotBound,

    #[error("tls setup failed: {0}")]
    Tls(#[from] TlsError),

    #[error("certificate management failed: {0}")]
    Acme(#[from] AcmeError),

    #[error("tls is enabled without acme or cert/key files")]
    NoCertificateSource,
}

/// Per-connection setup failures, logged by the connection task.
#[derive(Debug, Error)]
enum SetupError {
    #[error("proxy protocol: {0}")]
    Proxy(#[from] ProxyProtocolError),

    #[error("tls: {0}")]
    Tls(#[from] TlsError),

    #[error("setup exceeded the read deadline")]
    Timeout,
}

/// How long shutdown waits for in-flight connections.
#[derive(Debug, Clone, Copy)]
pub struct DrainPolicy {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for DrainPolicy {
    fn default() -> Self {
        Self {
            poll_interval: DRAIN_POLL_INTERVAL,
            timeout: DRAIN_TIMEOUT,
        }
    }
}

/// What a reload did to the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    /// The socket is closed; the owner must build a new listener.
    Stopped,
    /// Still serving with the same socket.
    Kept,
}

/// Entry of the active-connection table.
#[derive(Debug, Clone)]
pub struct ActiveConnection {
    pub remote_addr: SocketAddr,
    pub started: Instant,
    pub sni: Option<String>,
}

/// Connections currently being served.
#[derive(Debug, Default)]
pub struct ActiveConnections {
    inner: RwLock<HashMap<ConnectionId, ActiveConnection>>,
}

impl ActiveConnections {
    pub fn len(&self) -> usize {
        self.inner.read().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &ConnectionId) -> Option<ActiveConnection> {
        self.inner.read().ok().and_then(|t| t.get(id).cloned())
    }

    fn register(self: &Arc<Self>, id: ConnectionId, remote_addr: SocketAddr, metrics: MetricsSink) -> ActiveGuard {
        let entry = ActiveConnection {
            remote_addr,
            started: Instant::now(),
            sni: None,
        };
        let count = match self.inner.write() {
            Ok(mut table) => {
                table.insert(id.clone(), entry);
                table.len()
            }
            Err(_) => 0,
        };
        metrics.active_connections(count);

        ActiveGuard {
            table: Arc::clone(self),
            id,
            metrics,
            started: Instant::now(),
            code: 0,
        }
    }

    fn set_sni(&self, id: &ConnectionId, sni: &str) {
        if let Ok(mut table) = self.inner.write() {
            if let Some(entry) = table.get_mut(id) {
                entry.sni = Some(sni.to_string());
            }
        }
    }
}

/// Removes its entry when the connection task ends, however it ends.
struct ActiveGuard {
    table: Arc<ActiveConnections>,
    id: ConnectionId,
    metrics: MetricsSink,
    started: Instant,
    code: u16,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let count = match self.table.inner.write() {
            Ok(mut table) => {
                table.remove(&self.id);
                table.len()
            }
            Err(_) => 0,
        };
        self.metrics.active_connections(count);
        self.metrics.connection_duration(self.code, self.started.elapsed());
    }
}

/// The space's TCP listener.
pub struct TcpListenerService {
    config: ArcSwap<ListenerConfig>,
    ctx: ServeContext,
    limits: ConnectionLimits,
    drain: DrainPolicy,

    socket: Mutex<Option<TcpListener>>,
    local_addr: Option<SocketAddr>,
    tls: ArcSwapOption<TlsAcceptor>,
    renewal: Mutex<Option<JoinHandle<()>>>,

    active: Arc<ActiveConnections>,
    shutting_down: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl TcpListenerService {
    /// Capture the listener settings. Nothing is bound yet.
    pub fn initialize(config: &ListenerConfig, ctx: ServeContext) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config: ArcSwap::from_pointee(config.clone()),
            ctx,
            limits: ConnectionLimits::default(),
            drain: DrainPolicy::default(),
            socket: Mutex::new(None),
            local_addr: None,
            tls: ArcSwapOption::empty(),
            renewal: Mutex::new(None),
            active: Arc::new(ActiveConnections::default()),
            shutting_down: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    pub fn with_limits(mut self, limits: ConnectionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_drain_policy(mut self, drain: DrainPolicy) -> Self {
        self.drain = drain;
        self
    }

    /// Bind the socket and prepare TLS.
    pub async fn listen(&mut self) -> Result<SocketAddr, ListenerError> {
        let config = self.config.load_full();
        let addr: SocketAddr = config
            .address
            .parse()
            .map_err(|e: std::net::AddrParseError| ListenerError::InvalidAddress {
                address: config.address.clone(),
                reason: e.to_string(),
            })?;

        if let Some(tls) = &config.tls {
            self.install_tls(tls, &config.domains).await?;
        }

        let listener = TcpListener::bind(addr).await.map_err(|source| ListenerError::Bind {
            address: config.address.clone(),
            source,
        })?;
        let local_addr = listener.local_addr().map_err(|source| ListenerError::Bind {
            address: config.address.clone(),
            source,
        })?;

        tracing::info!(
            address = %local_addr,
            domains = ?config.domains,
            tls = config.tls.is_some(),
            proxy_protocol = ?config.proxy_protocol,
            "Listener bound"
        );

        self.local_addr = Some(local_addr);
        if let Ok(mut socket) = self.socket.lock() {
            *socket = Some(listener);
        }
        Ok(local_addr)
    }

    async fn install_tls(&self, tls: &TlsConfig, domains: &[String]) -> Result<(), ListenerError> {
        let (key, acme) = match (&tls.acme, &tls.cert, &tls.key) {
            (Some(acme), _, _) => {
                let manager = Arc::new(AcmeManager::new(acme, domains)?);
                let (cert, _) = manager.ensure_certificate().await?;
                let key = tls::certified_key_from_pem(cert.cert_pem.as_bytes(), cert.key_pem.as_bytes(), "acme")?;
                (key, Some(manager))
            }
            (None, Some(cert), Some(key)) => (tls::load_pem_files(cert, key).await?, None),
            _ => return Err(ListenerError::NoCertificateSource),
        };

        let resolver = Arc::new(CertResolver::new(key));
        let acceptor = TlsAcceptor::new(Arc::clone(&resolver), domains)?;
        self.tls.store(Some(Arc::new(acceptor)));

        let renewal = acme.map(|manager| manager.spawn_renewal(resolver));
        if let Ok(mut slot) = self.renewal.lock() {
            if let Some(previous) = std::mem::replace(&mut *slot, renewal) {
                previous.abort();
            }
        }
        Ok(())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn active(&self) -> &Arc<ActiveConnections> {
        &self.active
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Accept loop. Returns once shutdown closes the socket, or on a fatal
    /// accept error.
    pub async fn serve(&self) -> Result<(), ListenerError> {
        let listener = self
            .socket
            .lock()
            .ok()
            .and_then(|mut socket| socket.take())
            .ok_or(ListenerError::NotBound)?;
        let local_addr = listener.local_addr().map_err(ListenerError::Accept)?;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tracing::info!(address = %local_addr, "Accepting connections");

        while !self.is_shutting_down() {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) if is_transient(&e) => {
                        tracing::debug!(error = %e, "Transient accept error");
                        continue;
                    }
                    Err(e) => {
                        if self.is_shutting_down() {
                            break;
                        }
                        return Err(ListenerError::Accept(e));
                    }
                },
                _ = shutdown_rx.changed() => break,
            };

            let id = ConnectionId::generate(Some(&stream));
            let guard = self.active.register(id.clone(), peer, self.ctx.metrics.clone());
            tracing::debug!(connection = %id, peer = %peer, "Connection accepted");

            let task = ConnectionTask {
                ctx: self.ctx.clone(),
                tls: self.tls.load_full(),
                proxy_mode: self.config.load().proxy_protocol,
                limits: self.limits,
                active: Arc::clone(&self.active),
            };
            tokio::spawn(task.run(stream, id, peer, local_addr, guard));
        }

        drop(listener);
        tracing::info!(address = %local_addr, "Listener closed");
        Ok(())
    }

    /// Stop accepting, then wait for active connections up to the drain timeout.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        if let Ok(mut socket) = self.socket.lock() {
            socket.take();
        }
        if let Ok(mut renewal) = self.renewal.lock() {
            if let Some(handle) = renewal.take() {
                handle.abort();
            }
        }

        let deadline = Instant::now() + self.drain.timeout;
        loop {
            let remaining = self.active.len();
            if remaining == 0 {
                tracing::info!("All connections drained");
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!(remaining, "Drain timeout, abandoning connections");
                break;
            }
            tracing::debug!(remaining, "Waiting for connections to finish");
            tokio::time::sleep(self.drain.poll_interval).await;
        }
    }

    /// Apply a reloaded listener section.
    pub async fn reset(&self, config: &ListenerConfig) -> Result<ResetOutcome, ListenerError> {
        let current = self.config.load_full();
        let rebind = config.address != current.address
            || config.proxy_protocol != current.proxy_protocol
            || config.domains != current.domains;

        if rebind {
            tracing::info!(
                old = %current.address,
                new = %config.address,
                "Listener settings changed, stopping listener"
            );
            self.shutdown().await;
            return Ok(ResetOutcome::Stopped);
        }

        if config.tls != current.tls {
            match &config.tls {
                Some(tls) => self.install_tls(tls, &config.domains).await?,
                None => {
                    self.tls.store(None);
                    if let Ok(mut renewal) = self.renewal.lock() {
                        if let Some(handle) = renewal.take() {
                            handle.abort();
                        }
                    }
                }
            }
            tracing::info!(tls = config.tls.is_some(), "TLS settings reloaded");
        }
        self.config.store(Arc::new(config.clone()));
        Ok(ResetOutcome::Kept)
    }
}

impl std::fmt::Debug for TcpListenerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpListenerService")
            .field("address", &self.config.load().address)
            .field("local_addr", &self.local_addr)
            .field("active", &self.active.len())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionAborted | std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::Interrupted
    )
}

/// What a connection task needs from the listener.
struct ConnectionTask {
    ctx: ServeContext,
    tls: Option<Arc<TlsAcceptor>>,
    proxy_mode: Option<ProxyProtocolMode>,
    limits: ConnectionLimits,
    active: Arc<ActiveConnections>,
}

impl ConnectionTask {
    async fn run(self, stream: TcpStream, id: ConnectionId, peer: SocketAddr, local_addr: SocketAddr, mut guard: ActiveGuard) {
        let setup = tokio::time::timeout(self.limits.read_timeout, self.setup(stream, peer));
        let (stream, remote_addr, sni) = match setup.await {
            Ok(Ok(ready)) => ready,
            Ok(Err(e)) => {
                tracing::warn!(connection = %id, peer = %peer, error = %e, "Connection setup failed");
                return;
            }
            Err(_) => {
                tracing::warn!(connection = %id, peer = %peer, error = %SetupError::Timeout, "Connection setup failed");
                return;
            }
        };

        if let Some(name) = &sni {
            self.active.set_sni(&id, name);
        }

        let info = ConnectionInfo {
            id: id.clone(),
            local_addr,
            remote_addr,
            sni,
        };
        let mut conn = Connection::new(stream, info, &self.ctx, self.limits);

        let result = self.ctx.handler.serve_conn(&mut conn).await;
        if let Err(e) = conn.close().await {
            tracing::debug!(connection = %id, error = %e, "Close failed");
        }
        guard.code = conn.code;

        match result {
            Ok(()) => tracing::debug!(
                connection = %id,
                state = %conn.state(),
                duration_us = conn.elapsed().as_micros() as u64,
                "Connection finished"
            ),
            Err(e) => tracing::warn!(
                connection = %id,
                remote = %remote_addr,
                state = %conn.state(),
                error = %e,
                "Connection failed"
            ),
        }
    }

    /// PROXY header, then TLS. Returns the stream, the client address and the SNI.
    async fn setup(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(BoxedStream, SocketAddr, Option<String>), SetupError> {
        let (stream, remote_addr): (BoxedStream, SocketAddr) = match self.proxy_mode {
            Some(mode) => {
                let (stream, header) = proxy_protocol::accept(stream, mode).await?;
                let remote = header.map(|h| h.source).unwrap_or(peer);
                (Box::new(stream), remote)
            }
            None => (Box::new(stream), peer),
        };

        match &self.tls {
            Some(acceptor) => {
                let (stream, sni) = acceptor.accept(stream).await?;
                Ok((Box::new(stream), remote_addr, sni))
            }
            None => Ok((stream, remote_addr, None)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_removes_entry_on_drop() {
        let table = Arc::new(ActiveConnections::default());
        let id = ConnectionId::generate(None);
        let guard = table.register(id.clone(), "127.0.0.1:1234".parse().unwrap(), MetricsSink::disabled());
        assert_eq!(table.len(), 1);

        table.set_sni(&id, "finger.example");
        assert_eq!(table.get(&id).unwrap().sni.as_deref(), Some("finger.example"));

        drop(guard);
        assert!(table.is_empty());
    }

    #[test]
    fn transient_accept_errors() {
        assert!(is_transient(&std::io::Error::from(std::io::ErrorKind::ConnectionAborted)));
        assert!(!is_transient(&std::io::Error::from(std::io::ErrorKind::PermissionDenied)));
    }
}

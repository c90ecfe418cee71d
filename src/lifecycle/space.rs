//! Space supervisor: one cache, one cron scheduler and one listener.
//!
//! # Responsibilities
//! - Build whichever subcomponent is missing on `initialize`
//! - Spawn the accept loop and report how it ended
//! - Live-patch or tear down subcomponents on `reset`
//! - Publish each configuration generation to new connections

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cache::TtlCache;
use crate::config::{CacheConfig, SpaceConfig};
use crate::context::ServeContext;
use crate::cron::{CronError, CronScheduler};
use crate::net::listener::{DrainPolicy, ListenerError, ResetOutcome, TcpListenerService};

#[derive(Debug, Error)]
pub enum SpaceError {
    #[error("cron setup failed: {0}")]
    Cron(#[from] CronError),

    #[error("listener failed: {0}")]
    Listener(#[from] ListenerError),

    #[error("space is not initialized")]
    NotInitialized,
}

/// Reported when an accept loop ends.
#[derive(Debug)]
pub struct ServeEnded {
    pub address: Option<SocketAddr>,
    pub result: Result<(), ListenerError>,
}

pub struct Space {
    ctx: ServeContext,
    cache_config: CacheConfig,
    drain: DrainPolicy,

    cache: Option<Arc<TtlCache>>,
    cron: Option<CronScheduler>,
    listener: Option<Arc<TcpListenerService>>,
    serving: Option<JoinHandle<()>>,

    events: mpsc::UnboundedSender<ServeEnded>,
}

impl Space {
    pub fn new(ctx: ServeContext, events: mpsc::UnboundedSender<ServeEnded>) -> Self {
        let cache_config = ctx.snapshot().cache.clone();
        Self {
            ctx,
            cache_config,
            drain: DrainPolicy::default(),
            cache: None,
            cron: None,
            listener: None,
            serving: None,
            events,
        }
    }

    pub fn with_drain_policy(mut self, drain: DrainPolicy) -> Self {
        self.drain = drain;
        self
    }

    pub fn context(&self) -> &ServeContext {
        &self.ctx
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr())
    }

    /// Create missing subcomponents. Binds the listener socket.
    pub async fn initialize(&mut self) -> Result<(), SpaceError> {
        let config = self.ctx.snapshot();

        if self.cache.is_none() {
            self.cache_config = config.cache.clone();
            self.cache = config.cache.memory.as_ref().map(|memory| {
                let cache = Arc::new(TtlCache::new(
                    config.cache.expiration,
                    Duration::from_secs(memory.cleanup),
                ));
                cache.start();
                cache
            });
            self.ctx.cache.set(self.cache.clone());
            tracing::info!(
                enabled = self.ctx.cache.is_enabled(),
                expiration = config.cache.expiration,
                "Cache initialized"
            );
        }

        if self.cron.is_none() {
            let cron = CronScheduler::new(&config)?;
            tracing::info!(entries = cron.len(), "Cron initialized");
            self.cron = Some(cron);
        }

        if self.listener.is_none() {
            let mut listener =
                TcpListenerService::initialize(&config.listener, self.ctx.clone()).with_drain_policy(self.drain);
            listener.listen().await?;
            self.listener = Some(Arc::new(listener));
        }

        Ok(())
    }

    /// Start cron entries and, unless already running, the accept loop.
    pub fn start(&mut self) -> Result<(), SpaceError> {
        let listener = self.listener.clone().ok_or(SpaceError::NotInitialized)?;
        let address = listener.local_addr();

        if let Some(cron) = self.cron.as_mut() {
            cron.start(&self.ctx, address);
        }

        if self.is_serving() {
            return Ok(());
        }

        let events = self.events.clone();
        self.serving = Some(tokio::spawn(async move {
            let result = listener.serve().await;
            if let Err(e) = &result {
                tracing::error!(error = %e, "Accept loop failed");
            }
            let _ = events.send(ServeEnded { address, result });
        }));
        Ok(())
    }

    pub fn is_serving(&self) -> bool {
        self.serving.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Apply a new configuration generation.
    ///
    /// Call [`initialize`](Self::initialize) and [`start`](Self::start)
    /// afterwards to rebuild what was torn down.
    pub async fn reset(&mut self, config: Arc<SpaceConfig>) -> Result<(), SpaceError> {
        self.ctx.config.store(Arc::clone(&config));

        let cache_changed = config.cache.expiration != self.cache_config.expiration
            || config.cache.memory != self.cache_config.memory;
        if cache_changed {
            if let Some(cache) = self.cache.take() {
                cache.shutdown();
            }
            self.ctx.cache.set(None);
            tracing::info!("Cache settings changed, cache will be rebuilt");
        } else if let Some(cache) = &self.cache {
            cache.flush();
        }

        if let Some(mut cron) = self.cron.take() {
            cron.shutdown();
        }

        if let Some(listener) = self.listener.clone() {
            if listener.reset(&config.listener).await? == ResetOutcome::Stopped {
                if let Some(serving) = self.serving.take() {
                    let _ = serving.await;
                }
                self.listener = None;
            }
        }

        tracing::info!("Space reset");
        Ok(())
    }

    pub fn flush_cache(&self) {
        match &self.cache {
            Some(cache) => cache.flush(),
            None => tracing::debug!("No cache to flush"),
        }
    }

    /// Stop accepting, drain, then stop cron and drop the cache.
    pub async fn shutdown(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.shutdown().await;
        }
        if let Some(serving) = self.serving.take() {
            let _ = serving.await;
        }
        if let Some(mut cron) = self.cron.take() {
            cron.shutdown();
        }
        if let Some(cache) = self.cache.take() {
            cache.shutdown();
        }
        self.ctx.cache.set(None);
        tracing::info!("Space stopped");
    }
}

impl std::fmt::Debug for Space {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Space")
            .field("cache", &self.cache.is_some())
            .field("cron", &self.cron.as_ref().map(|c| c.len()))
            .field("listener", &self.local_addr())
            .field("serving", &self.is_serving())
            .finish()
    }
}

//! Process supervisor: configuration, signals and the space.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{load_config, ConfigError, ServerConfig};
use crate::context::ServeContext;
use crate::handler::fetch::{FetchError, Fetcher};
use crate::handler::{HandlerError, HandlerKind};
use crate::lifecycle::signals::{ControlEvent, Signals};
use crate::lifecycle::space::{ServeEnded, Space, SpaceError};
use crate::net::ListenerError;
use crate::observability::{init_logging, metrics, Logging, LoggingError, MetricsSink};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("logging setup failed: {0}")]
    Logging(#[from] LoggingError),

    #[error("handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("http client setup failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("space error: {0}")]
    Space(#[from] SpaceError),

    #[error("unable to register signal handlers: {0}")]
    Signals(#[source] std::io::Error),

    #[error("accept loop ended: {0}")]
    AcceptLoop(#[source] ListenerError),
}

pub struct Manager {
    config_path: PathBuf,
    logging: Logging,
    handler_name: String,
    space: Space,
    events: mpsc::UnboundedReceiver<ServeEnded>,
    _metrics_pump: JoinHandle<()>,
}

impl Manager {
    /// Load the configuration, install logging and metrics, bring the space up.
    pub async fn start(config_path: PathBuf) -> Result<Self, ManagerError> {
        let config = load_config(&config_path)?;
        let logging = init_logging(&config.log)?;
        tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            config = %config_path.display(),
            "ttserver starting"
        );

        let (sink, rx) = MetricsSink::channel(config.prometheus.chan_size);
        let metrics_pump = metrics::spawn_pump(rx);
        if let Err(e) = metrics::init_metrics(&config.prometheus) {
            tracing::error!(address = %config.prometheus.address, error = %e, "Metrics exporter unavailable");
        }

        let ServerConfig { space, .. } = config;
        let handler_name = space.handler_name().unwrap_or_default().to_string();
        let handler = HandlerKind::from_name(&handler_name)?.build();
        handler.register_metrics();

        let ctx = ServeContext::new(Arc::new(space), sink, Fetcher::with_defaults()?, handler);
        let (tx, events) = mpsc::unbounded_channel();
        let mut space = Space::new(ctx, tx);
        space.initialize().await?;
        space.start()?;

        tracing::info!(handler = %handler_name, address = ?space.local_addr(), "Space serving");
        Ok(Self {
            config_path,
            logging,
            handler_name,
            space,
            events,
            _metrics_pump: metrics_pump,
        })
    }

    /// Serve until a terminate signal or a fatal error.
    pub async fn run(mut self) -> Result<(), ManagerError> {
        let mut signals = Signals::register().map_err(ManagerError::Signals)?;

        loop {
            tokio::select! {
                event = signals.recv() => match event {
                    Some(ControlEvent::Reload) => {
                        if let Err(e) = self.reload().await {
                            tracing::error!(error = %e, "Reload failed, shutting down");
                            self.space.shutdown().await;
                            return Err(e);
                        }
                    }
                    Some(ControlEvent::FlushCache) => self.space.flush_cache(),
                    Some(ControlEvent::Terminate) | None => {
                        self.space.shutdown().await;
                        tracing::info!("Shutdown complete");
                        return Ok(());
                    }
                },
                Some(ended) = self.events.recv() => match ended.result {
                    Ok(()) => tracing::debug!(address = ?ended.address, "Accept loop stopped"),
                    Err(e) => {
                        self.space.shutdown().await;
                        return Err(ManagerError::AcceptLoop(e));
                    }
                },
            }
        }
    }

    async fn reload(&mut self) -> Result<(), ManagerError> {
        let config = load_config(&self.config_path)?;
        self.logging.apply(&config.log)?;

        let ServerConfig { space, .. } = config;
        if space.handler_name() != Some(self.handler_name.as_str()) {
            tracing::warn!(
                current = %self.handler_name,
                requested = space.handler_name().unwrap_or_default(),
                "Handler cannot change on reload, keeping the current one"
            );
        }

        self.space.reset(Arc::new(space)).await?;
        self.space.initialize().await?;
        self.space.start()?;
        tracing::info!(address = ?self.space.local_addr(), "Configuration reloaded");
        Ok(())
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("config_path", &self.config_path)
            .field("handler", &self.handler_name)
            .field("space", &self.space)
            .finish()
    }
}

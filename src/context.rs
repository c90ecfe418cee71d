//! Shared state handed to every connection of a space.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::cache::CacheHandle;
use crate::config::SpaceConfig;
use crate::handler::fetch::Fetcher;
use crate::handler::ProtocolHandler;
use crate::observability::MetricsSink;

/// Everything a connection needs besides its socket.
///
/// Cheap to clone; the config snapshot is swapped in place on reload and
/// each connection takes its own snapshot when it is created.
#[derive(Clone)]
pub struct ServeContext {
    pub config: Arc<ArcSwap<SpaceConfig>>,
    pub cache: CacheHandle,
    pub metrics: MetricsSink,
    pub fetcher: Fetcher,
    pub handler: Arc<dyn ProtocolHandler>,
}

impl ServeContext {
    pub fn new(
        config: Arc<SpaceConfig>,
        metrics: MetricsSink,
        fetcher: Fetcher,
        handler: Arc<dyn ProtocolHandler>,
    ) -> Self {
        Self {
            config: Arc::new(ArcSwap::new(config)),
            cache: CacheHandle::new(),
            metrics,
            fetcher,
            handler,
        }
    }

    /// Current config generation.
    pub fn snapshot(&self) -> Arc<SpaceConfig> {
        self.config.load_full()
    }
}

impl std::fmt::Debug for ServeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServeContext")
            .field("handler", &self.handler.name())
            .field("cache", &self.cache)
            .finish()
    }
}

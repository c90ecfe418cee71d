//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (JSON)
//!     → loader.rs (parse, defaults, TTSERVER_LISTENER_ADDRESS override)
//!     → validation.rs (semantic checks)
//!     → loader.rs (resolve paths under basedir, synthesize 404/500)
//!     → routes.rs (RouteTable: literal, regex, derived)
//!     → ServerConfig (immutable except derived routes)
//!     → space shared via Arc<ArcSwap<SpaceConfig>>
//!
//! On SIGHUP:
//!     manager re-runs the loader
//!     → Space::reset swaps the SpaceConfig snapshot
//!     → in-flight connections keep their old snapshot
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod routes;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use routes::{ContentSource, FetchKind, FetchSpec, MatchedRoute, Route, RouteTable};
pub use schema::{
    CacheConfig, ListenerConfig, LogConfig, LogFormat, LogTarget, PrometheusConfig, ProxyProtocolMode,
    ServerConfig, SpaceConfig, TlsConfig,
};

//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured tracing events, reloadable level)
//!     → metrics.rs (MetricsSink → bounded channel → pump → recorder)
//!
//! Consumers:
//!     → stderr / stdout (text or JSON)
//!     → Prometheus scrape endpoint
//! ```
//!
//! # Design Decisions
//! - Structured fields (`connection`, `route`, `code`, `cache`) on every event
//! - Emitting a metric never blocks a connection
//! - The connection id flows through every log line of a request

pub mod logging;
pub mod metrics;

pub use self::logging::{init_logging, Logging, LoggingError};
pub use self::metrics::{MetricEvent, MetricsError, MetricsSink};

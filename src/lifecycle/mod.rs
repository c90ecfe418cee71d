//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (manager.rs):
//!     Load config → logging → metrics → handler → Space::initialize → start
//!
//! Signals (signals.rs):
//!     SIGHUP  → reload: load config → log level → Space::reset → initialize → start
//!     SIGUSR1 → cache flush
//!     SIGTERM/SIGINT → Space::shutdown → exit 0
//!
//! Space (space.rs):
//!     { TtlCache, CronScheduler, TcpListenerService }
//!     reset tears down what changed; initialize rebuilds what is missing
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop accept, drain, stop cron, drop cache
//! - Drain has a timeout: stragglers are left to their own deadlines
//! - A failed reload or accept loop is fatal

pub mod manager;
pub mod signals;
pub mod space;

pub use manager::{Manager, ManagerError};
pub use space::{Space, SpaceError};

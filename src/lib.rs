//! Finger and gopher text-server runtime.

pub mod cache;
pub mod config;
pub mod context;
pub mod cron;
pub mod handler;
pub mod lifecycle;
pub mod net;
pub mod observability;

pub use config::schema::ServerConfig;
pub use context::ServeContext;
pub use lifecycle::{Manager, Space};

//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, active-connection table)
//!     → spawned task:
//!         → proxy_protocol.rs (optional PROXY v1/v2 header)
//!         → tls.rs (optional handshake, SNI capture)
//!         → connection.rs (deadlines, state machine)
//!         → ProtocolHandler::serve_conn
//!
//! Certificates:
//!     acme.rs (DNS-01 issuance, 12h renewal) → tls.rs CertResolver::swap
//! ```
//!
//! # Design Decisions
//! - The accept loop never waits on a client; header reads and handshakes
//!   run in the connection task under the read deadline
//! - Each connection is tracked until its task ends so shutdown can drain
//! - TLS is optional and handled transparently

pub mod acme;
pub mod connection;
pub mod listener;
pub mod proxy_protocol;
pub mod tls;

pub use listener::{ListenerError, ResetOutcome, TcpListenerService};

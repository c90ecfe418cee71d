//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGTERM, SIGINT, SIGHUP, SIGUSR1)
//! - Translate signals to [`ControlEvent`]s for the manager loop
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - SIGHUP triggers config reload, not shutdown

use tokio::signal::unix::{signal, Signal, SignalKind};

/// What the manager is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    Reload,
    FlushCache,
    Terminate,
}

pub struct Signals {
    hangup: Signal,
    user1: Signal,
    terminate: Signal,
    interrupt: Signal,
}

impl Signals {
    pub fn register() -> std::io::Result<Self> {
        Ok(Self {
            hangup: signal(SignalKind::hangup())?,
            user1: signal(SignalKind::user_defined1())?,
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
        })
    }

    /// Wait for the next signal. `None` once the signal streams are gone.
    pub async fn recv(&mut self) -> Option<ControlEvent> {
        let event = tokio::select! {
            s = self.hangup.recv() => s.map(|_| ControlEvent::Reload),
            s = self.user1.recv() => s.map(|_| ControlEvent::FlushCache),
            s = self.terminate.recv() => s.map(|_| ControlEvent::Terminate),
            s = self.interrupt.recv() => s.map(|_| ControlEvent::Terminate),
        };
        if let Some(event) = event {
            tracing::info!(event = ?event, "Signal received");
        }
        event
    }
}

impl std::fmt::Debug for Signals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Signals")
    }
}

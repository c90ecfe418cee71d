//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Accept metric events from connections without blocking them
//! - Apply events to the `metrics` recorder from a single pump task
//! - Expose a Prometheus-compatible scrape endpoint
//!
//! # Metrics
//! - `ttserver_process_duration_microseconds` (histogram): route resolution time by route, code
//! - `ttserver_route_cache_status_total` (counter): cache outcome by route, status
//! - `ttserver_active_connections` (gauge): current connection count
//! - `ttserver_connection_duration_microseconds` (histogram): connection lifetime by code
//!
//! # Design Decisions
//! - Bounded channel: a full sink drops the event and logs, never blocks
//! - The exporter is installed once per process; later config changes are
//!   logged and ignored

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cache::CacheStatus;
use crate::config::PrometheusConfig;

pub const PROCESS_DURATION: &str = "ttserver_process_duration_microseconds";
pub const CACHE_STATUS: &str = "ttserver_route_cache_status_total";
pub const ACTIVE_CONNECTIONS: &str = "ttserver_active_connections";
pub const CONNECTION_DURATION: &str = "ttserver_connection_duration_microseconds";

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metrics channel is full, event dropped")]
    ChannelFull,

    #[error("metrics channel is closed")]
    ChannelClosed,

    #[error("invalid prometheus address {0}")]
    InvalidAddress(String),

    #[error("unable to install prometheus exporter: {0}")]
    Install(String),
}

/// A single observation.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricEvent {
    ProcessDuration { route: String, code: u16, micros: u64 },
    CacheStatus { route: String, status: CacheStatus },
    ActiveConnections(usize),
    ConnectionDuration { code: u16, micros: u64 },
}

/// Cloneable, non-blocking emitter handed to every component that measures.
#[derive(Debug, Clone)]
pub struct MetricsSink {
    tx: Option<mpsc::Sender<MetricEvent>>,
}

impl MetricsSink {
    /// Create a sink and the receiving end to pass to [`spawn_pump`].
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<MetricEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that drops everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Queue an event. Failures are logged and swallowed.
    pub fn emit(&self, event: MetricEvent) {
        if let Err(e) = self.try_emit(event) {
            match e {
                MetricsError::ChannelFull => tracing::warn!(error = %e, "Metric dropped"),
                _ => tracing::debug!(error = %e, "Metric dropped"),
            }
        }
    }

    pub fn try_emit(&self, event: MetricEvent) -> Result<(), MetricsError> {
        let Some(tx) = &self.tx else {
            return Ok(());
        };
        tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => MetricsError::ChannelFull,
            mpsc::error::TrySendError::Closed(_) => MetricsError::ChannelClosed,
        })
    }

    pub fn process_duration(&self, route: &str, code: u16, elapsed: Duration) {
        self.emit(MetricEvent::ProcessDuration {
            route: route.to_string(),
            code,
            micros: elapsed.as_micros() as u64,
        });
    }

    pub fn cache_status(&self, route: &str, status: CacheStatus) {
        self.emit(MetricEvent::CacheStatus {
            route: route.to_string(),
            status,
        });
    }

    pub fn active_connections(&self, count: usize) {
        self.emit(MetricEvent::ActiveConnections(count));
    }

    pub fn connection_duration(&self, code: u16, elapsed: Duration) {
        self.emit(MetricEvent::ConnectionDuration {
            code,
            micros: elapsed.as_micros() as u64,
        });
    }
}

/// Register metric descriptions with the recorder.
pub fn describe_metrics() {
    describe_histogram!(PROCESS_DURATION, Unit::Microseconds, "Time spent resolving a route");
    describe_counter!(CACHE_STATUS, "Cache outcome per resolved route");
    describe_gauge!(ACTIVE_CONNECTIONS, "Connections currently being served");
    describe_histogram!(CONNECTION_DURATION, Unit::Microseconds, "Connection lifetime");
}

/// Drain the event channel into the global recorder until every sink is dropped.
pub fn spawn_pump(mut rx: mpsc::Receiver<MetricEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            record(event);
        }
        tracing::debug!("Metrics pump stopped");
    })
}

fn record(event: MetricEvent) {
    match event {
        MetricEvent::ProcessDuration { route, code, micros } => {
            histogram!(PROCESS_DURATION, "route" => route, "code" => code.to_string()).record(micros as f64);
        }
        MetricEvent::CacheStatus { route, status } => {
            counter!(CACHE_STATUS, "route" => route, "status" => status.as_str()).increment(1);
        }
        MetricEvent::ActiveConnections(count) => {
            gauge!(ACTIVE_CONNECTIONS).set(count as f64);
        }
        MetricEvent::ConnectionDuration { code, micros } => {
            histogram!(CONNECTION_DURATION, "code" => code.to_string()).record(micros as f64);
        }
    }
}

/// Install the Prometheus exporter with its own HTTP listener.
pub fn init_metrics(config: &PrometheusConfig) -> Result<SocketAddr, MetricsError> {
    let addr: SocketAddr = config
        .address
        .parse()
        .map_err(|_| MetricsError::InvalidAddress(config.address.clone()))?;

    let mut builder = PrometheusBuilder::new().with_http_listener(addr);
    if config.summary_max_age > 0 {
        builder = builder
            .set_bucket_duration(Duration::from_secs(config.summary_max_age))
            .map_err(|e| MetricsError::Install(e.to_string()))?;
    }
    builder
        .install()
        .map_err(|e| MetricsError::Install(e.to_string()))?;

    describe_metrics();
    tracing::info!(address = %addr, endpoint = %config.endpoint, "Metrics exporter listening");
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_sink_drops_without_blocking() {
        let (sink, mut rx) = MetricsSink::channel(1);

        sink.active_connections(1);
        assert!(matches!(
            sink.try_emit(MetricEvent::ActiveConnections(2)),
            Err(MetricsError::ChannelFull)
        ));
        sink.active_connections(3);

        assert_eq!(rx.recv().await, Some(MetricEvent::ActiveConnections(1)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn events_carry_labels() {
        let (sink, mut rx) = MetricsSink::channel(8);

        sink.process_duration("index", 200, Duration::from_micros(1500));
        sink.cache_status("index", CacheStatus::Hit);

        assert_eq!(
            rx.recv().await,
            Some(MetricEvent::ProcessDuration {
                route: "index".to_string(),
                code: 200,
                micros: 1500
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(MetricEvent::CacheStatus {
                route: "index".to_string(),
                status: CacheStatus::Hit
            })
        );
    }

    #[test]
    fn disabled_sink_accepts_everything() {
        let sink = MetricsSink::disabled();
        assert!(sink.try_emit(MetricEvent::ActiveConnections(1)).is_ok());
    }

    #[test]
    fn closed_sink_reports_closed() {
        let (sink, rx) = MetricsSink::channel(4);
        drop(rx);
        assert!(matches!(
            sink.try_emit(MetricEvent::ActiveConnections(1)),
            Err(MetricsError::ChannelClosed)
        ));
    }
}

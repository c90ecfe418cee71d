//! Scheduled cache refreshes.
//!
//! Every literal route with a `cron` expression gets one task. Each fire
//! builds a socketless [`Connection`] and asks the handler to re-render the
//! route, replacing its cache entry.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::SpaceConfig;
use crate::context::ServeContext;
use crate::handler::Outcome;
use crate::net::connection::Connection;

#[derive(Debug, Error)]
pub enum CronError {
    #[error("invalid cron expression {expression:?} for route {route}: {reason}")]
    InvalidExpression {
        route: String,
        expression: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
struct CronEntry {
    route: String,
    schedule: Schedule,
}

/// Cron entries of one configuration generation.
#[derive(Debug, Default)]
pub struct CronScheduler {
    entries: Vec<CronEntry>,
    tasks: Vec<JoinHandle<()>>,
}

impl CronScheduler {
    /// Parse the cron expressions of `config`. Any invalid expression fails
    /// the whole scheduler.
    pub fn new(config: &SpaceConfig) -> Result<Self, CronError> {
        for pattern in config.table.pattern_routes() {
            if pattern.route.cron.is_some() {
                tracing::warn!(route = %pattern.route.name, "Cron is not supported on regex routes, skipping");
            }
        }

        let mut entries = Vec::new();
        for route in config.table.literal_routes() {
            let Some(expression) = route.cron.as_deref() else {
                continue;
            };
            if expression.trim().is_empty() {
                tracing::warn!(route = %route.name, "Empty cron expression, skipping");
                continue;
            }

            let schedule = Schedule::from_str(expression).map_err(|e| CronError::InvalidExpression {
                route: route.name.clone(),
                expression: expression.to_string(),
                reason: e.to_string(),
            })?;
            entries.push(CronEntry {
                route: route.name.clone(),
                schedule,
            });
        }

        Ok(Self {
            entries,
            tasks: Vec::new(),
        })
    }

    pub fn routes(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.route.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Spawn one task per entry. Synthetic connections report `listener_addr`
    /// as both ends.
    pub fn start(&mut self, ctx: &ServeContext, listener_addr: Option<SocketAddr>) {
        self.shutdown();
        for entry in &self.entries {
            let entry = entry.clone();
            let ctx = ctx.clone();
            tracing::info!(route = %entry.route, "Cron entry scheduled");

            self.tasks.push(tokio::spawn(async move {
                for next in entry.schedule.upcoming(Utc) {
                    let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    tokio::time::sleep(wait).await;
                    if let Err(e) = fire(&ctx, listener_addr, &entry.route).await {
                        tracing::error!(route = %entry.route, error = %e, "Cron run failed");
                    }
                }
            }));
        }
    }

    /// Stop every entry.
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for CronScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One scheduled render of `route`.
pub async fn fire(
    ctx: &ServeContext,
    listener_addr: Option<SocketAddr>,
    route: &str,
) -> Result<Outcome, crate::handler::HandlerError> {
    let mut conn = Connection::synthetic(ctx, listener_addr);
    tracing::debug!(connection = %conn.id, route = %route, "Cron fire");
    ctx.handler.serve_crontab(&mut conn, route).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::loader::load_config_str;

    fn space(routes: &str) -> (tempfile::TempDir, SpaceConfig) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.tpl"), "hello").unwrap();
        std::fs::write(dir.path().join("news.tpl"), "news").unwrap();
        let raw = format!(
            r#"{{"space": {{"handler": {{"name": "finger"}}, "basedir": {:?}, "routes": {routes}}}}}"#,
            dir.path().display().to_string()
        );
        let config = load_config_str(&raw, dir.path(), None).unwrap();
        (dir, config.space)
    }

    #[test]
    fn only_literal_routes_with_expressions() {
        let (_dir, config) = space(
            r#"{"news": {"cron": "0 */5 * * * *"}, "index": {}, "empty": {"template": "index.tpl", "cron": ""}, "~^img/(.+)$": {"template": "index.tpl", "cron": "0 * * * * *"}}"#,
        );
        let scheduler = CronScheduler::new(&config).unwrap();
        assert_eq!(scheduler.routes().collect::<Vec<_>>(), vec!["news"]);
    }

    #[test]
    fn invalid_expression_fails() {
        let (_dir, config) = space(r#"{"news": {"cron": "every minute"}}"#);
        assert!(matches!(
            CronScheduler::new(&config),
            Err(CronError::InvalidExpression { .. })
        ));
    }
}

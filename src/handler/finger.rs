//! Finger (RFC 1288) handler.
//!
//! The query line `[/W] [user][@host...]` selects the route `user`; hosts
//! are parsed and ignored. An empty query is the `index` route.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::handler::{pipeline, resolver, HandlerError, Outcome, ProtocolHandler, Request};
use crate::net::connection::Connection;

static QUERY: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^\s*(?P<U>[\w\-./]+)?(?P<H>(@[\w\-.]+)+)*").ok());

/// A parsed finger query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FingerQuery {
    pub username: String,
    pub hostnames: Vec<String>,
}

impl FingerQuery {
    pub fn parse(line: &str) -> Self {
        let line = line.trim_start();
        let line = match line.strip_prefix("/W") {
            Some(rest) if rest.is_empty() || rest.starts_with(char::is_whitespace) => rest,
            _ => line,
        };

        let Some(caps) = QUERY.as_ref().and_then(|re| re.captures(line)) else {
            return Self::default();
        };

        let mut username = caps.name("U").map(|m| m.as_str()).unwrap_or_default();
        username = username.strip_suffix(".tpl").unwrap_or(username);
        let username = username.trim_end_matches('/').to_string();

        let hostnames = caps
            .name("H")
            .map(|m| {
                m.as_str()
                    .split('@')
                    .filter(|h| !h.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Self { username, hostnames }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FingerHandler;

#[async_trait]
impl ProtocolHandler for FingerHandler {
    fn name(&self) -> &'static str {
        "finger"
    }

    async fn serve_conn(&self, conn: &mut Connection) -> Result<(), HandlerError> {
        pipeline::serve_conn(self, conn).await
    }

    async fn serve_crontab(&self, conn: &mut Connection, route: &str) -> Result<Outcome, HandlerError> {
        pipeline::serve_crontab(self, conn, route).await
    }

    fn register_template_functions(&self, _env: &mut minijinja::Environment<'static>, _conn: &Connection) {}

    fn parse(&self, _conn: &mut Connection, line: &str) -> Result<Request, HandlerError> {
        let query = FingerQuery::parse(line);
        Ok(Request {
            route: query.username,
            extra: None,
        })
    }

    async fn process(
        &self,
        conn: &mut Connection,
        request: &Request,
        force_cache_update: bool,
    ) -> Result<Outcome, HandlerError> {
        Ok(resolver::resolve(self, conn, &request.route, force_cache_update).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_user_and_hosts() {
        let q = FingerQuery::parse("alice@example.org@relay");
        assert_eq!(q.username, "alice");
        assert_eq!(q.hostnames, vec!["example.org".to_string(), "relay".to_string()]);
    }

    #[test]
    fn empty_and_verbose_queries() {
        assert_eq!(FingerQuery::parse("").username, "");
        assert_eq!(FingerQuery::parse("   ").username, "");
        assert_eq!(FingerQuery::parse("/W bob").username, "bob");
        assert_eq!(FingerQuery::parse("/W").username, "");
    }

    #[test]
    fn strips_template_suffix_and_slashes() {
        assert_eq!(FingerQuery::parse("news.tpl").username, "news");
        assert_eq!(FingerQuery::parse("blog/2024/").username, "blog/2024");
        assert_eq!(FingerQuery::parse("img/cat.png").username, "img/cat.png");
    }

    #[test]
    fn stops_at_unsupported_characters() {
        assert_eq!(FingerQuery::parse("carol smith").username, "carol");
        assert_eq!(FingerQuery::parse("dave;rm").username, "dave");
    }
}

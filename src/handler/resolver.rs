//! Cache-aside content resolution.
//!
//! # Data Flow
//! ```text
//! route
//!     → RouteTable::lookup ──none──→ 404 fallback (not cached)
//!     → cache get ──hit──→ HIT
//!     → fs check ──missing──→ 404 fallback ──────────────┐
//!     → file: stream (no cache) or read ──error──→ 500 ───┤
//!     → template: fetch + render ──error──→ 500 fallback ─┤
//!     → store (add / replace_if_exists) ←────────────────┘
//!     → metrics (always)
//! ```
//!
//! # Design Decisions
//! - Fallbacks recurse through [`resolve`] once: an error route that fails
//!   itself answers with the handler's built-in payload
//! - Built-in payloads, streamed files and incomplete renders never reach
//!   the cache
//! - Fallback answers are stored under the failing route with their code
//! - The cache key is the matched route's name; metrics use the requested one

use std::sync::Arc;
use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::future::BoxFuture;

use crate::cache::{CacheStatus, CachedPayload, Expiration, TtlCache};
use crate::config::ContentSource;
use crate::handler::{template, Outcome, Payload, ProtocolHandler, CRLF};
use crate::net::connection::Connection;

/// Resolve `route` into a response. Never fails: every error path ends in a
/// 404 or 500 answer.
pub fn resolve<'a, H>(
    handler: &'a H,
    conn: &'a mut Connection,
    route: &'a str,
    force_cache_update: bool,
) -> BoxFuture<'a, Outcome>
where
    H: ProtocolHandler + ?Sized,
{
    Box::pin(async move {
        let started = Instant::now();
        let outcome = resolve_uncounted(handler, conn, route, force_cache_update).await;

        conn.metrics.process_duration(route, outcome.code, started.elapsed());
        conn.metrics.cache_status(route, outcome.cache_status);
        tracing::debug!(
            connection = %conn.id,
            route = %route,
            code = outcome.code,
            cache = %outcome.cache_status,
            "Route resolved"
        );
        outcome
    })
}

async fn resolve_uncounted<H>(handler: &H, conn: &mut Connection, route: &str, force: bool) -> Outcome
where
    H: ProtocolHandler + ?Sized,
{
    let config = Arc::clone(&conn.config);
    let Some(matched) = config.table.lookup(route).await else {
        tracing::error!(connection = %conn.id, route = %route, "No configuration for route");
        return fallback(handler, conn, route, 404).await;
    };

    let key = matched.route.name.as_str();
    let cache = conn.cache.get().filter(|c| c.is_enabled());
    if !force {
        if let Some(hit) = cache.as_ref().and_then(|c| c.get(key)) {
            return Outcome {
                payload: Payload::Bytes(hit.data),
                code: hit.code,
                cache_status: CacheStatus::Hit,
                builtin_error: false,
            };
        }
    }

    let path = matched.content_path(config.table.base_dir());
    let exists = match &path {
        Some(path) => tokio::fs::metadata(path).await.is_ok_and(|m| m.is_file()),
        None => false,
    };
    let Some(path) = path.filter(|_| exists) else {
        tracing::error!(connection = %conn.id, route = %route, "Not found on filesystem");
        let outcome = fallback(handler, conn, route, 404).await;
        return store(cache.as_deref(), key, matched.route.expiration, force, outcome);
    };

    let outcome = match &matched.route.source {
        ContentSource::File(_) => {
            let file = match tokio::fs::File::open(&path).await {
                Ok(file) => file,
                Err(e) => {
                    tracing::error!(connection = %conn.id, path = %path.display(), error = %e, "Unable to open file");
                    let outcome = fallback(handler, conn, route, 500).await;
                    return store(cache.as_deref(), key, matched.route.expiration, force, outcome);
                }
            };
            if cache.is_none() {
                return Outcome {
                    payload: Payload::File(file),
                    code: 200,
                    cache_status: CacheStatus::NoCache,
                    builtin_error: false,
                };
            }
            match tokio::fs::read(&path).await {
                Ok(data) => ok(Bytes::from(data)),
                Err(e) => {
                    tracing::error!(connection = %conn.id, path = %path.display(), error = %e, "Unable to read file");
                    fallback(handler, conn, route, 500).await
                }
            }
        }
        ContentSource::Template(_) => match template::render(handler, conn, route, &matched, &path).await {
            Ok(rendered) if !rendered.complete => {
                let mut outcome = ok(rendered.data);
                outcome.cache_status = CacheStatus::NoCache;
                return outcome;
            }
            Ok(rendered) => ok(rendered.data),
            Err(e) => {
                tracing::error!(connection = %conn.id, route = %route, error = %e, "Template failed");
                fallback(handler, conn, route, 500).await
            }
        },
    };

    store(cache.as_deref(), key, matched.route.expiration, force, outcome)
}

fn ok(data: Bytes) -> Outcome {
    Outcome {
        payload: Payload::Bytes(data),
        code: 200,
        cache_status: CacheStatus::Miss,
        builtin_error: false,
    }
}

/// Answer with the `"404"` / `"500"` route, or the built-in payload when the
/// failing route is itself an error route.
async fn fallback<H>(handler: &H, conn: &mut Connection, route: &str, code: u16) -> Outcome
where
    H: ProtocolHandler + ?Sized,
{
    if route == "404" || route == "500" {
        let code: u16 = route.parse().unwrap_or(code);
        let body = handler.error_payload(code);
        let mut data = BytesMut::with_capacity(body.len() + CRLF.len());
        data.put_slice(&body);
        data.put_slice(CRLF.as_bytes());
        return Outcome {
            payload: Payload::Bytes(data.freeze()),
            code,
            cache_status: CacheStatus::NoCache,
            builtin_error: true,
        };
    }

    let error_route = if code == 404 { "404" } else { "500" };
    let mut outcome = resolve(handler, conn, error_route, false).await;
    outcome.code = code;
    outcome
}

fn store(cache: Option<&TtlCache>, key: &str, expiration: i64, force: bool, mut outcome: Outcome) -> Outcome {
    let cacheable = match (&outcome.payload, outcome.builtin_error) {
        (Payload::Bytes(data), false) => Some(data.clone()),
        _ => None,
    };
    let (Some(cache), Some(data), Some(expiration)) = (cache, cacheable, Expiration::from_secs(expiration)) else {
        outcome.cache_status = CacheStatus::NoCache;
        return outcome;
    };

    let payload = CachedPayload {
        data,
        code: outcome.code,
    };
    outcome.cache_status = if force && cache.replace_if_exists(key, payload.clone(), expiration) {
        CacheStatus::Replace
    } else {
        if !force {
            cache.add(key, payload, expiration);
        }
        CacheStatus::Miss
    };
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn bytes_outcome(data: &'static str, code: u16) -> Outcome {
        let mut outcome = ok(Bytes::from_static(data.as_bytes()));
        outcome.code = code;
        outcome
    }

    #[test]
    fn store_adds_then_keeps_first_writer() {
        let cache = TtlCache::new(300, Duration::ZERO);

        let first = store(Some(&cache), "index", 60, false, bytes_outcome("one", 200));
        assert_eq!(first.cache_status, CacheStatus::Miss);
        let second = store(Some(&cache), "index", 60, false, bytes_outcome("two", 200));
        assert_eq!(second.cache_status, CacheStatus::Miss);

        assert_eq!(cache.get("index").unwrap().data, Bytes::from_static(b"one"));
    }

    #[test]
    fn forced_store_replaces_or_adds() {
        let cache = TtlCache::new(300, Duration::ZERO);

        let added = store(Some(&cache), "news", 60, true, bytes_outcome("v1", 200));
        assert_eq!(added.cache_status, CacheStatus::Miss);
        let replaced = store(Some(&cache), "news", 60, true, bytes_outcome("v2", 200));
        assert_eq!(replaced.cache_status, CacheStatus::Replace);

        assert_eq!(cache.get("news").unwrap().data, Bytes::from_static(b"v2"));
    }

    #[test]
    fn store_skips_uncacheable_outcomes() {
        let cache = TtlCache::new(300, Duration::ZERO);

        let negative = store(Some(&cache), "a", -1, false, bytes_outcome("x", 200));
        assert_eq!(negative.cache_status, CacheStatus::NoCache);

        let mut builtin = bytes_outcome("Not found (404)\r\n", 404);
        builtin.builtin_error = true;
        let builtin = store(Some(&cache), "b", 60, false, builtin);
        assert_eq!(builtin.cache_status, CacheStatus::NoCache);

        let none = store(None, "c", 60, false, bytes_outcome("x", 200));
        assert_eq!(none.cache_status, CacheStatus::NoCache);

        assert!(cache.is_empty());
    }

    #[test]
    fn store_keeps_fallback_code() {
        let cache = TtlCache::new(300, Duration::ZERO);
        store(Some(&cache), "gone", 0, false, bytes_outcome("missing page", 404));

        let cached = cache.get("gone").unwrap();
        assert_eq!(cached.code, 404);
    }
}

//! Bounded-parallelism fetching of external template data.
//!
//! # Responsibilities
//! - Validate and request fetch URIs over HTTP(S)
//! - Decode the body by fetch kind (html, json, feed, prometheus)
//! - Run a render's fetches at most `pool_size` at a time, each under a timeout
//!
//! # Design Decisions
//! - One `reqwest::Client` per process, cloned into every connection
//! - A failed fetch is reported per job; the caller decides how to degrade

use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use serde_json::{json, Value};
use thiserror::Error;
use url::Url;

use crate::config::FetchKind;
use crate::handler::exposition;

pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
pub const FETCH_POOL_SIZE: usize = 5;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid uri {uri}: {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid feed: {0}")]
    Feed(String),

    #[error("invalid prometheus exposition: {0}")]
    Exposition(#[from] exposition::ExpositionError),
}

/// One fetch of a render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchJob {
    pub name: String,
    pub kind: FetchKind,
    /// Already substituted.
    pub uri: String,
}

#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    timeout: Duration,
    pool_size: usize,
}

impl Fetcher {
    pub fn new(timeout: Duration, pool_size: usize) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("ttserver/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            timeout,
            pool_size: pool_size.max(1),
        })
    }

    /// Fetcher with the production limits.
    pub fn with_defaults() -> Result<Self, FetchError> {
        Self::new(FETCH_TIMEOUT, FETCH_POOL_SIZE)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Fetch and decode one URI.
    pub async fn fetch(&self, kind: FetchKind, uri: &str) -> Result<Value, FetchError> {
        let url = Url::parse(uri).map_err(|e| FetchError::InvalidUri {
            uri: uri.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(FetchError::InvalidUri {
                uri: uri.to_string(),
                reason: format!("unsupported scheme {}", url.scheme()),
            });
        }

        tokio::time::timeout(self.timeout, self.request(kind, url))
            .await
            .map_err(|_| FetchError::Timeout(self.timeout))?
    }

    async fn request(&self, kind: FetchKind, url: Url) -> Result<Value, FetchError> {
        let response = self.client.get(url).send().await?.error_for_status()?;

        match kind {
            FetchKind::Html => Ok(Value::String(response.text().await?)),
            FetchKind::Json => Ok(serde_json::from_slice(&response.bytes().await?)?),
            FetchKind::Feed => {
                let body = response.bytes().await?;
                let feed = feed_rs::parser::parse(&body[..]).map_err(|e| FetchError::Feed(e.to_string()))?;
                Ok(feed_value(feed))
            }
            FetchKind::Metrics => Ok(exposition::parse(&response.text().await?)?),
        }
    }

    /// Run every job, at most `pool_size` concurrently. Results come back
    /// in completion order.
    pub async fn fetch_all(&self, jobs: Vec<FetchJob>) -> Vec<(FetchJob, Result<Value, FetchError>)> {
        stream::iter(jobs)
            .map(|job| async move {
                let result = self.fetch(job.kind, &job.uri).await;
                (job, result)
            })
            .buffer_unordered(self.pool_size)
            .collect()
            .await
    }
}

fn feed_value(feed: feed_rs::model::Feed) -> Value {
    let text = |t: &Option<feed_rs::model::Text>| t.as_ref().map(|t| t.content.clone());

    let items: Vec<Value> = feed
        .entries
        .iter()
        .map(|entry| {
            json!({
                "id": entry.id,
                "title": text(&entry.title),
                "link": entry.links.first().map(|l| l.href.clone()),
                "description": text(&entry.summary),
                "content": entry.content.as_ref().and_then(|c| c.body.clone()),
                "published": entry.published.map(|d| d.to_rfc3339()),
                "updated": entry.updated.map(|d| d.to_rfc3339()),
                "authors": entry.authors.iter().map(|a| a.name.clone()).collect::<Vec<_>>(),
            })
        })
        .collect();

    json!({
        "title": text(&feed.title),
        "description": text(&feed.description),
        "link": feed.links.first().map(|l| l.href.clone()),
        "updated": feed.updated.map(|d| d.to_rfc3339()),
        "items": items,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_invalid_and_non_http_uris() {
        let fetcher = Fetcher::with_defaults().unwrap();

        assert!(matches!(
            fetcher.fetch(FetchKind::Html, "not a uri").await,
            Err(FetchError::InvalidUri { .. })
        ));
        assert!(matches!(
            fetcher.fetch(FetchKind::Html, "file:///etc/passwd").await,
            Err(FetchError::InvalidUri { .. })
        ));
    }

    #[test]
    fn feed_is_flattened() {
        let rss = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
  <title>News</title><link>http://example.org/</link><description>Daily</description>
  <item><title>First</title><link>http://example.org/1</link><description>One</description></item>
</channel></rss>"#;
        let feed = feed_rs::parser::parse(rss.as_bytes()).unwrap();
        let value = feed_value(feed);

        assert_eq!(value["title"], "News");
        assert_eq!(value["description"], "Daily");
        assert_eq!(value["items"][0]["title"], "First");
        assert_eq!(value["items"][0]["link"], "http://example.org/1");
    }
}

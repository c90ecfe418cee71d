//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from the JSON config file.
//! Missing sections fall back to their `Default` impls, so a config file only
//! needs to name the handler.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

use crate::config::routes::RouteTable;

/// Root configuration for the server.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Logging settings.
    pub log: LogConfig,

    /// Prometheus exporter settings.
    pub prometheus: PrometheusConfig,

    /// The served space: handler, cache, listener and routes.
    pub space: SpaceConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    /// Minimum level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,

    /// Output format.
    pub format: LogFormat,

    /// Output destination.
    pub to: LogTarget,

    /// Syslog address, only meaningful with `to = "syslog"`.
    pub syslog: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            to: LogTarget::Stderr,
            syslog: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogTarget {
    Stderr,
    Stdout,
    Discard,
    Syslog,
}

/// Prometheus exporter configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct PrometheusConfig {
    /// Scrape endpoint bind address.
    pub address: String,

    /// Scrape path. The exporter answers on any path; kept for compatibility.
    pub endpoint: String,

    /// Sliding window for summaries, in seconds.
    pub summary_max_age: u64,

    /// Capacity of the metrics event channel.
    pub chan_size: usize,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:9777".to_string(),
            endpoint: "/metrics".to_string(),
            summary_max_age: 600,
            chan_size: 1024,
        }
    }
}

/// A served space.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct SpaceConfig {
    /// Protocol handler selection.
    pub handler: Option<HandlerConfig>,

    /// Response cache.
    pub cache: CacheConfig,

    /// TCP listener.
    pub listener: ListenerConfig,

    /// Directory that every route path is resolved under.
    pub basedir: Option<PathBuf>,

    /// Route definitions, in declaration order.
    pub routes: RouteEntries,

    /// Site-wide header template, detected by the loader.
    #[serde(skip)]
    pub header: Option<PathBuf>,

    /// Site-wide footer template, detected by the loader.
    #[serde(skip)]
    pub footer: Option<PathBuf>,

    /// Resolved routes, built by the loader.
    #[serde(skip)]
    pub table: RouteTable,
}

impl SpaceConfig {
    /// Base directory after loading; the loader always fills it in.
    pub fn base_dir(&self) -> PathBuf {
        self.basedir.clone().unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn handler_name(&self) -> Option<&str> {
        self.handler.as_ref().map(|h| h.name.as_str())
    }

    pub fn handler_parameter(&self, key: &str) -> Option<&str> {
        self.handler
            .as_ref()
            .and_then(|h| h.parameters.get(key))
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

/// Protocol handler selection.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Default)]
pub struct HandlerConfig {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// Cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// Default entry lifetime in seconds. Zero or less disables caching.
    pub expiration: i64,

    /// In-memory backend. `null` removes the cache entirely.
    #[serde(default = "default_memory")]
    pub memory: Option<MemoryCacheConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            expiration: 300,
            memory: default_memory(),
        }
    }
}

fn default_memory() -> Option<MemoryCacheConfig> {
    Some(MemoryCacheConfig::default())
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct MemoryCacheConfig {
    /// Sweep interval in seconds. Zero disables the sweeper.
    pub cleanup: u64,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self { cleanup: 350 }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "127.0.0.1:7575").
    pub address: String,

    /// Domains served; also the TLS certificate names.
    pub domains: Vec<String>,

    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,

    /// PROXY protocol mode.
    #[serde(rename = "proxyprotocol")]
    pub proxy_protocol: Option<ProxyProtocolMode>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:7575".to_string(),
            domains: vec!["localhost".to_string()],
            tls: None,
            proxy_protocol: None,
        }
    }
}

/// Accepted PROXY protocol header versions.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocolMode {
    V1,
    V2,
    /// Either version.
    Enabled,
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Default)]
pub struct TlsConfig {
    /// Automatic certificate management.
    #[serde(default)]
    pub acme: Option<AcmeConfig>,

    /// Path to a PEM certificate chain, used when `acme` is absent.
    #[serde(default)]
    pub cert: Option<PathBuf>,

    /// Path to a PEM private key, used when `acme` is absent.
    #[serde(default)]
    pub key: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Default)]
pub struct AcmeConfig {
    #[serde(default)]
    pub dnsprovider: Option<String>,

    #[serde(default)]
    pub email: Option<String>,

    /// Production directory URL.
    #[serde(default)]
    pub ca: Option<String>,

    /// Staging directory URL.
    #[serde(default)]
    pub testca: Option<String>,

    /// Use the staging directory.
    #[serde(default)]
    pub staging: bool,

    #[serde(default)]
    pub storage: Option<AcmeStorageConfig>,
}

impl AcmeConfig {
    pub fn directory_url(&self) -> &str {
        let url = if self.staging { &self.testca } else { &self.ca };
        url.as_deref().unwrap_or_default()
    }

    pub fn storage_path(&self) -> PathBuf {
        self.storage
            .as_ref()
            .and_then(|s| s.file.as_ref())
            .and_then(|f| f.path.clone())
            .unwrap_or_else(|| PathBuf::from(super::loader::DEFAULT_ACME_STORAGE))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Default)]
pub struct AcmeStorageConfig {
    #[serde(default)]
    pub file: Option<AcmeFileStorageConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Default)]
pub struct AcmeFileStorageConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// A route as written in the config file.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct RouteConfig {
    /// Static file, relative to the base directory.
    pub file: Option<String>,

    /// Template, relative to the base directory. Wins over `file`.
    pub template: Option<String>,

    /// Named data fetches exposed to the template.
    pub fetch: BTreeMap<String, FetchConfig>,

    pub cache: Option<RouteCacheConfig>,

    /// Six-field cron expression (seconds first).
    pub cron: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct FetchConfig {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub uri: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct RouteCacheConfig {
    pub expiration: i64,
}

/// Route definitions keeping the order they were declared in.
///
/// Regex routes are tried in this order, so a plain map would make
/// matching depend on hashing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RouteEntries(pub Vec<(String, RouteConfig)>);

impl RouteEntries {
    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|(n, _)| n == name)
    }
}

impl<'de> Deserialize<'de> for RouteEntries {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = RouteEntries;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of route names to route definitions")
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries: Vec<(String, RouteConfig)> = Vec::new();
                while let Some((name, route)) = access.next_entry::<String, RouteConfig>()? {
                    // Later duplicates win, like a map would.
                    entries.retain(|(n, _)| n != &name);
                    entries.push((name, route));
                }
                Ok(RouteEntries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_sections() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"space": {"handler": {"name": "finger"}}}"#).unwrap();

        assert_eq!(config.log.level, "info");
        assert_eq!(config.prometheus.address, "127.0.0.1:9777");
        assert_eq!(config.prometheus.chan_size, 1024);
        assert_eq!(config.space.listener.address, "127.0.0.1:7575");
        assert_eq!(config.space.listener.domains, vec!["localhost".to_string()]);
        assert_eq!(config.space.cache.expiration, 300);
        assert_eq!(config.space.cache.memory, Some(MemoryCacheConfig { cleanup: 350 }));
    }

    #[test]
    fn null_memory_removes_cache() {
        let config: ServerConfig = serde_json::from_str(
            r#"{"space": {"cache": {"expiration": 60, "memory": null}}}"#,
        )
        .unwrap();

        assert_eq!(config.space.cache.expiration, 60);
        assert!(config.space.cache.memory.is_none());
    }

    #[test]
    fn routes_keep_declaration_order() {
        let config: ServerConfig = serde_json::from_str(
            r#"{"space": {"routes": {
                "~^z/(.+)$": {},
                "~^a/(.+)$": {},
                "index": {"cron": "0 * * * * *"}
            }}}"#,
        )
        .unwrap();

        let names: Vec<&str> = config.space.routes.0.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["~^z/(.+)$", "~^a/(.+)$", "index"]);
    }

    #[test]
    fn proxy_protocol_and_log_enums() {
        let config: ServerConfig = serde_json::from_str(
            r#"{
                "log": {"level": "debug", "format": "json", "to": "stdout"},
                "space": {"listener": {"proxyprotocol": "v2"}}
            }"#,
        )
        .unwrap();

        assert_eq!(config.log.format, LogFormat::Json);
        assert_eq!(config.log.to, LogTarget::Stdout);
        assert_eq!(config.space.listener.proxy_protocol, Some(ProxyProtocolMode::V2));
    }
}

//! Configuration loading from disk.
//!
//! Reads the JSON file, applies defaults and environment overrides,
//! validates, then resolves every route path under the base directory
//! and builds the [`RouteTable`].

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use thiserror::Error;

use crate::config::routes::{secure_join, ContentSource, FetchKind, FetchSpec, PatternRoute, Route, RouteTable};
use crate::config::schema::{RouteConfig, ServerConfig};
use crate::config::validation::{validate_config, ValidationError};

/// Environment variable overriding the listener address.
pub const LISTENER_ADDRESS_ENV: &str = "TTSERVER_LISTENER_ADDRESS";

pub const DEFAULT_ACME_CA: &str = "https://acme-v02.api.letsencrypt.org/directory";
pub const DEFAULT_ACME_TEST_CA: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";
pub const DEFAULT_ACME_STORAGE: &str = ".acme";

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),

    #[error("unable to get current working directory: {0}")]
    WorkingDirectory(std::io::Error),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate configuration from a JSON file.
pub fn load_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let cwd = std::env::current_dir().map_err(ConfigError::WorkingDirectory)?;
    let address = std::env::var(LISTENER_ADDRESS_ENV).ok().filter(|a| !a.is_empty());

    load_config_str(&content, &cwd, address)
}

/// Load from an in-memory document. `cwd` is the default base directory.
pub fn load_config_str(
    content: &str,
    cwd: &Path,
    address_override: Option<String>,
) -> Result<ServerConfig, ConfigError> {
    let mut config: ServerConfig = serde_json::from_str(content)?;

    if let Some(address) = address_override {
        config.space.listener.address = address;
    }

    apply_defaults(&mut config, cwd);
    validate_config(&config).map_err(ConfigError::Validation)?;
    resolve_space(&mut config);

    Ok(config)
}

fn apply_defaults(config: &mut ServerConfig, cwd: &Path) {
    let space = &mut config.space;

    let base = match space.basedir.take() {
        Some(dir) if dir.is_absolute() => dir,
        Some(dir) => cwd.join(dir),
        None => cwd.to_path_buf(),
    };
    space.basedir = Some(clean(&base));

    if let Some(acme) = space.listener.tls.as_mut().and_then(|t| t.acme.as_mut()) {
        if acme.ca.as_deref().map_or(true, str::is_empty) {
            acme.ca = Some(DEFAULT_ACME_CA.to_string());
        }
        if acme.testca.as_deref().map_or(true, str::is_empty) {
            acme.testca = Some(DEFAULT_ACME_TEST_CA.to_string());
        }
    }

    if !space.routes.contains("index") {
        space.routes.0.insert(0, ("index".to_string(), RouteConfig::default()));
    }
}

fn resolve_space(config: &mut ServerConfig) {
    let space = &mut config.space;
    let base = space.base_dir();
    let default_expiration = space.cache.expiration;

    space.header = secure_join(&base, "header.tpl").filter(|p| p.is_file());
    space.footer = secure_join(&base, "footer.tpl").filter(|p| p.is_file());

    let mut literal: HashMap<String, Arc<Route>> = HashMap::new();
    let mut patterns: Vec<PatternRoute> = Vec::new();

    for (name, raw) in &space.routes.0 {
        let Some(route) = resolve_route(&base, name, raw, default_expiration) else {
            continue;
        };

        match name.strip_prefix('~') {
            Some(pattern) => match Regex::new(pattern) {
                Ok(regex) => patterns.push(PatternRoute {
                    regex,
                    route: Arc::new(route),
                }),
                Err(e) => tracing::warn!(route = %name, error = %e, "Skipping regex route"),
            },
            None => {
                literal.insert(name.clone(), Arc::new(route));
            }
        }
    }

    for code in ["404", "500"] {
        if literal.contains_key(code) {
            continue;
        }
        if let Some(template) = secure_join(&base, &format!("{code}.tpl")) {
            literal.insert(
                code.to_string(),
                Arc::new(Route {
                    name: code.to_string(),
                    source: ContentSource::Template(template),
                    fetch: BTreeMap::new(),
                    expiration: 0,
                    cron: None,
                }),
            );
        }
    }

    tracing::debug!(
        literal = literal.len(),
        regex = patterns.len(),
        base_dir = %base.display(),
        "Routes resolved"
    );

    space.table = RouteTable::new(literal, patterns, base, default_expiration);
}

fn resolve_route(base: &Path, name: &str, raw: &RouteConfig, default_expiration: i64) -> Option<Route> {
    let non_empty = |s: &Option<String>| s.as_deref().filter(|v| !v.is_empty()).map(str::to_string);

    let source = if let Some(template) = non_empty(&raw.template) {
        ContentSource::Template(secure_join(base, &template)?)
    } else if let Some(file) = non_empty(&raw.file) {
        ContentSource::File(secure_join(base, &file)?)
    } else {
        ContentSource::Template(secure_join(base, &format!("{name}.tpl"))?)
    };

    let fetch = raw
        .fetch
        .iter()
        .filter_map(|(fetch_name, spec)| {
            let kind = FetchKind::parse(spec.kind.as_deref()?)?;
            let uri = spec.uri.clone()?;
            Some((fetch_name.clone(), FetchSpec { kind, uri }))
        })
        .collect();

    let cron = raw.cron.clone();
    let expiration = if cron.is_some() {
        0
    } else {
        raw.cache.as_ref().map_or(default_expiration, |c| c.expiration)
    };

    Some(Route {
        name: name.to_string(),
        source,
        fetch,
        expiration,
        cron,
    })
}

/// Lexically normalize a path, dropping `.` and folding `..`.
fn clean(path: &Path) -> PathBuf {
    use std::path::Component;

    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

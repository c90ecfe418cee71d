//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Required values: handler name, ACME email and DNS provider
//! - Route sanity: fetch specs complete, regex keys compile
//! - Site layout: `index.tpl` present in the base directory
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs after defaults are applied, before routes are built

use regex::Regex;
use thiserror::Error;

use crate::config::routes::{secure_join, FetchKind};
use crate::config::schema::ServerConfig;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("no handler configured")]
    MissingHandler,

    #[error("ACME has no dns provider configured")]
    MissingDnsProvider,

    #[error("ACME has no email configured")]
    MissingAcmeEmail,

    #[error("TLS needs either an acme section or both cert and key")]
    IncompleteTls,

    #[error("unable to find index template at {0}")]
    MissingIndex(String),

    #[error("fetch {fetch} of route {route} needs a type and an uri")]
    IncompleteFetch { route: String, fetch: String },

    #[error("fetch {fetch} of route {route} has unknown type {kind}")]
    UnknownFetchType { route: String, fetch: String, kind: String },

    #[error("route {route} has an invalid regular expression: {reason}")]
    InvalidRegex { route: String, reason: String },

    #[error("route {0} cannot resolve to a path under the base directory")]
    InvalidPath(String),

    #[error("listener has no domains")]
    NoDomains,
}

/// Validate a configuration whose defaults are already applied.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let space = &config.space;

    if space.handler_name().map_or(true, str::is_empty) {
        errors.push(ValidationError::MissingHandler);
    }

    if space.listener.domains.is_empty() {
        errors.push(ValidationError::NoDomains);
    }

    if let Some(tls) = &space.listener.tls {
        match &tls.acme {
            Some(acme) => {
                if acme.dnsprovider.as_deref().map_or(true, str::is_empty) {
                    errors.push(ValidationError::MissingDnsProvider);
                }
                if acme.email.as_deref().map_or(true, str::is_empty) {
                    errors.push(ValidationError::MissingAcmeEmail);
                }
            }
            None => {
                if tls.cert.is_none() || tls.key.is_none() {
                    errors.push(ValidationError::IncompleteTls);
                }
            }
        }
    }

    let base = space.base_dir();
    match secure_join(&base, "index.tpl") {
        Some(index) if index.is_file() => {}
        Some(index) => errors.push(ValidationError::MissingIndex(index.display().to_string())),
        None => errors.push(ValidationError::MissingIndex(base.display().to_string())),
    }

    for (name, route) in &space.routes.0 {
        if let Some(pattern) = name.strip_prefix('~') {
            if let Err(e) = Regex::new(pattern) {
                errors.push(ValidationError::InvalidRegex {
                    route: name.clone(),
                    reason: e.to_string(),
                });
            }
        } else {
            let relative = route
                .template
                .as_deref()
                .or(route.file.as_deref())
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("{name}.tpl"));
            if secure_join(&base, &relative).is_none() {
                errors.push(ValidationError::InvalidPath(name.clone()));
            }
        }

        for (fetch, spec) in &route.fetch {
            match (spec.kind.as_deref(), spec.uri.as_deref()) {
                (Some(kind), Some(uri)) if !kind.is_empty() && !uri.is_empty() => {
                    if FetchKind::parse(kind).is_none() {
                        errors.push(ValidationError::UnknownFetchType {
                            route: name.clone(),
                            fetch: fetch.clone(),
                            kind: kind.to_string(),
                        });
                    }
                }
                _ => errors.push(ValidationError::IncompleteFetch {
                    route: name.clone(),
                    fetch: fetch.clone(),
                }),
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

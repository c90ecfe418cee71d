//! Template rendering with fetched data.
//!
//! # Data Flow
//! ```text
//! route template + header.tpl + footer.tpl
//!     → fetch.rs (all fetch specs, `$n` substituted, bounded pool)
//!     → minijinja Environment (common + handler functions)
//!     → render → + CRLF → handler.post_process
//! ```
//!
//! # Design Decisions
//! - A fresh environment per render; templates are re-read from disk so
//!   edits show up on the next cache miss without a reload
//! - Fetch results are collected before the environment is built, so nothing
//!   non-`Send` is held across an await
//! - A failed fetch renders as `none` and marks the result incomplete

use std::path::{Path, PathBuf};

use bytes::Bytes;
use minijinja::Environment;
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::config::MatchedRoute;
use crate::handler::fetch::FetchJob;
use crate::handler::{HandlerError, ProtocolHandler, CRLF};
use crate::net::connection::Connection;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("unable to read template {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("template parsing error: {0}")]
    Syntax(#[source] minijinja::Error),

    #[error("template execution error: {0}")]
    Render(#[source] minijinja::Error),

    #[error(transparent)]
    PostProcess(#[from] HandlerError),
}

/// A rendered template.
#[derive(Debug)]
pub struct Rendered {
    pub data: Bytes,
    /// False when a fetch failed; the result must not be cached.
    pub complete: bool,
}

/// Render the template at `path` for `route`.
pub async fn render<H>(
    handler: &H,
    conn: &Connection,
    route: &str,
    matched: &MatchedRoute,
    path: &Path,
) -> Result<Rendered, TemplateError>
where
    H: ProtocolHandler + ?Sized,
{
    let main = read_source(path).await?;
    let mut partials = Vec::new();
    for partial in [conn.config.header.as_ref(), conn.config.footer.as_ref()].into_iter().flatten() {
        let name = partial
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        partials.push((name, read_source(partial).await?));
    }

    let (data, complete) = collect_data(conn, route, matched).await;

    let template_name = format!("{route}.tpl");
    let mut env = Environment::new();
    env.set_keep_trailing_newline(true);
    register_common_functions(&mut env);
    handler.register_template_functions(&mut env, conn);

    env.add_template_owned(template_name.clone(), main)
        .map_err(TemplateError::Syntax)?;
    for (name, source) in partials {
        env.add_template_owned(name, source).map_err(TemplateError::Syntax)?;
    }

    let mut rendered = env
        .get_template(&template_name)
        .and_then(|t| t.render(&data))
        .map_err(TemplateError::Render)?;
    rendered.push_str(CRLF);

    let processed = handler.post_process(conn, rendered)?;
    Ok(Rendered {
        data: Bytes::from(processed),
        complete,
    })
}

async fn read_source(path: &Path) -> Result<String, TemplateError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| TemplateError::Read {
            path: path.to_path_buf(),
            source,
        })
}

/// Build the `default` entry and run every fetch of the route.
async fn collect_data(conn: &Connection, route: &str, matched: &MatchedRoute) -> (Value, bool) {
    let mut data = Map::new();
    data.insert(
        "default".to_string(),
        json!({
            "route": route,
            "domain": conn.domain,
            "port": conn.port.to_string(),
            "local_address": conn.local_addr.ip().to_string(),
            "local_port": conn.local_addr.port().to_string(),
        }),
    );

    let jobs: Vec<FetchJob> = matched
        .route
        .fetch
        .iter()
        .map(|(name, spec)| FetchJob {
            name: name.clone(),
            kind: spec.kind,
            uri: matched.substitute(&spec.uri),
        })
        .collect();
    if jobs.is_empty() {
        return (Value::Object(data), true);
    }

    let mut complete = true;
    for (job, result) in conn.fetcher.fetch_all(jobs).await {
        let entry = match result {
            Ok(fetched) => {
                tracing::trace!(connection = %conn.id, fetch = %job.name, uri = %job.uri, "Fetch done");
                json!({
                    "route": route,
                    "domain": conn.domain,
                    "port": conn.port.to_string(),
                    "uri": job.uri,
                    "type": job.kind.as_str(),
                    "data": fetched,
                })
            }
            Err(e) => {
                tracing::error!(
                    connection = %conn.id,
                    fetch = %job.name,
                    uri = %job.uri,
                    error = %e,
                    "Fetch failed"
                );
                complete = false;
                Value::Null
            }
        };
        data.insert(job.name, entry);
    }

    (Value::Object(data), complete)
}

/// Text helpers available to every handler's templates.
pub fn register_common_functions(env: &mut Environment<'static>) {
    env.add_function("rpad", |width: usize, filler: String, text: String| {
        format!("{text}{}", repeat_fill(width, &filler, &text))
    });
    env.add_function("lpad", |width: usize, filler: String, text: String| {
        format!("{}{text}", repeat_fill(width, &filler, &text))
    });
    env.add_function("floating", |width: usize, filler: String, left: String, right: String| {
        let used = char_len(&left) + char_len(&right);
        let count = width.saturating_sub(used) / char_len(&filler).max(1);
        format!("{left}{}{right}", filler.repeat(count))
    });
    env.add_function("center", |width: usize, text: String| align(width, &text, Align::Center));
    env.add_function("ljust", |width: usize, text: String| align(width, &text, Align::Left));
    env.add_function("rjust", |width: usize, text: String| align(width, &text, Align::Right));
    env.add_function("underline", |ch: String, text: String| {
        format!("{text}{CRLF}{}", ch.repeat(char_len(&text)))
    });
    env.add_function("bytesize", |input: minijinja::Value| {
        format_bytes(input.to_string().trim().parse().unwrap_or(0.0))
    });
    env.add_function("duration", |input: minijinja::Value| {
        let secs = input.to_string().trim().parse::<f64>().unwrap_or(0.0);
        format_duration(secs.max(0.0) as u64)
    });
    env.add_function("build_version", || env!("CARGO_PKG_VERSION").to_string());
    env.add_function("build_date", || option_env!("TTSERVER_BUILD_DATE").unwrap_or("unknown").to_string());
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn repeat_fill(width: usize, filler: &str, text: &str) -> String {
    let count = width.saturating_sub(char_len(text)) / char_len(filler).max(1);
    filler.repeat(count)
}

#[derive(Clone, Copy)]
enum Align {
    Left,
    Center,
    Right,
}

fn align(width: usize, text: &str, how: Align) -> String {
    let pad = width.saturating_sub(char_len(text));
    match how {
        Align::Left => format!("{text}{}", " ".repeat(pad)),
        Align::Right => format!("{}{text}", " ".repeat(pad)),
        Align::Center => {
            let left = pad / 2;
            format!("{}{text}{}", " ".repeat(left), " ".repeat(pad - left))
        }
    }
}

fn format_bytes(n: f64) -> String {
    const UNITS: [&str; 7] = ["B", "KB", "MB", "GB", "TB", "PB", "EB"];
    let mut value = n;
    let mut unit = 0;
    while value.abs() >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

fn format_duration(total: u64) -> String {
    if total == 0 {
        return "0 seconds".to_string();
    }

    const UNITS: [(&str, u64); 5] = [
        ("week", 7 * 86_400),
        ("day", 86_400),
        ("hour", 3_600),
        ("minute", 60),
        ("second", 1),
    ];

    let mut rest = total;
    let mut parts = Vec::new();
    for (name, size) in UNITS {
        let count = rest / size;
        rest %= size;
        if count > 0 {
            let plural = if count == 1 { "" } else { "s" };
            parts.push(format!("{count} {name}{plural}"));
        }
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(src: &str) -> String {
        let mut env = Environment::new();
        register_common_functions(&mut env);
        env.render_str(src, ()).unwrap()
    }

    #[test]
    fn padding_helpers() {
        assert_eq!(eval(r#"{{ rpad(6, ".", "ab") }}"#), "ab....");
        assert_eq!(eval(r#"{{ lpad(6, "-=", "ab") }}"#), "-=-=ab");
        assert_eq!(eval(r#"{{ rpad(1, ".", "long") }}"#), "long");
        assert_eq!(eval(r#"{{ floating(10, ".", "ab", "cd") }}"#), "ab......cd");
    }

    #[test]
    fn alignment_helpers() {
        assert_eq!(eval(r#"[{{ center(7, "abc") }}]"#), "[  abc  ]");
        assert_eq!(eval(r#"[{{ ljust(5, "ab") }}]"#), "[ab   ]");
        assert_eq!(eval(r#"[{{ rjust(5, "ab") }}]"#), "[   ab]");
        assert_eq!(eval(r#"{{ underline("=", "Title") }}"#), "Title\r\n=====");
    }

    #[test]
    fn unit_helpers() {
        assert_eq!(eval("{{ bytesize(1536) }}"), "1.50 KB");
        assert_eq!(eval(r#"{{ bytesize("12") }}"#), "12.00 B");
        assert_eq!(eval("{{ duration(3725) }}"), "1 hour 2 minutes 5 seconds");
        assert_eq!(eval(r#"{{ duration("0") }}"#), "0 seconds");
        assert_eq!(eval("{{ build_version() }}"), env!("CARGO_PKG_VERSION"));
    }
}

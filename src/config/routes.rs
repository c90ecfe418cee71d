//! Resolved route table.
//!
//! # Responsibilities
//! - Hold literal routes, regex routes and on-demand derived routes
//! - Resolve a request name to a route plus its regex captures
//! - Memoize filesystem-derived routes for the life of the config
//!
//! # Design Decisions
//! - Literal map behind a `RwLock`: reads are concurrent, a derived route
//!   is inserted with a double check under the write lock
//! - Regex routes are immutable after loading and tried in declaration order
//! - Derived routes are never evicted; they die with the config generation

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Where a route's content comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentSource {
    /// Served as-is.
    File(PathBuf),
    /// Rendered with fetched data. May contain `$n` placeholders.
    Template(PathBuf),
}

/// Kind of external data a fetch produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchKind {
    Html,
    Feed,
    Json,
    #[serde(alias = "prometheus")]
    Metrics,
}

impl FetchKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "html" => Some(Self::Html),
            "feed" => Some(Self::Feed),
            "json" => Some(Self::Json),
            "metrics" | "prometheus" => Some(Self::Metrics),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Html => "html",
            Self::Feed => "feed",
            Self::Json => "json",
            Self::Metrics => "prometheus",
        }
    }
}

/// A named fetch attached to a route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchSpec {
    pub kind: FetchKind,
    /// May contain `$n` placeholders.
    pub uri: String,
}

/// A fully resolved route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Route name; also the cache key.
    pub name: String,
    pub source: ContentSource,
    pub fetch: BTreeMap<String, FetchSpec>,
    /// Seconds. Positive is a TTL, zero never expires, negative is not cached.
    pub expiration: i64,
    pub cron: Option<String>,
}

impl Route {
    pub fn is_template(&self) -> bool {
        matches!(self.source, ContentSource::Template(_))
    }
}

/// A route selected for a request, with the regex captures it matched with.
#[derive(Debug, Clone)]
pub struct MatchedRoute {
    pub route: Arc<Route>,
    /// Capture groups 1..n; empty for literal and derived routes.
    pub captures: Vec<String>,
}

impl MatchedRoute {
    /// Replace `$1`..`$n` in `input` with the captured groups.
    ///
    /// Higher indices go first so `$1` never eats the prefix of `$10`.
    pub fn substitute(&self, input: &str) -> String {
        let mut out = input.to_string();
        for (i, group) in self.captures.iter().enumerate().rev() {
            out = out.replace(&format!("${}", i + 1), group);
        }
        out
    }

    /// Content path after placeholder substitution, kept under `base`.
    ///
    /// Captures come from the request, so a substituted template path is
    /// re-joined under `base`. `None` when nothing is left of it.
    pub fn content_path(&self, base: &Path) -> Option<PathBuf> {
        match &self.route.source {
            ContentSource::File(p) => Some(p.clone()),
            ContentSource::Template(p) if self.captures.is_empty() => Some(p.clone()),
            ContentSource::Template(p) => {
                let substituted = PathBuf::from(self.substitute(&p.to_string_lossy()));
                let relative = substituted.strip_prefix(base).ok()?;
                secure_join(base, &relative.to_string_lossy())
            }
        }
    }
}

#[derive(Debug)]
pub struct PatternRoute {
    pub regex: Regex,
    pub route: Arc<Route>,
}

/// Route table for one configuration generation.
#[derive(Debug, Default)]
pub struct RouteTable {
    literal: RwLock<HashMap<String, Arc<Route>>>,
    patterns: Vec<PatternRoute>,
    base_dir: PathBuf,
    default_expiration: i64,
}

impl RouteTable {
    pub fn new(
        literal: HashMap<String, Arc<Route>>,
        patterns: Vec<PatternRoute>,
        base_dir: PathBuf,
        default_expiration: i64,
    ) -> Self {
        Self {
            literal: RwLock::new(literal),
            patterns,
            base_dir,
            default_expiration,
        }
    }

    /// Resolve a route name.
    ///
    /// Literal routes first, then regex routes in declaration order, then a
    /// search of the base directory for `<name>.tpl` and `<name>`.
    pub async fn lookup(&self, name: &str) -> Option<MatchedRoute> {
        if let Some(route) = self.literal_get(name) {
            return Some(MatchedRoute { route, captures: Vec::new() });
        }

        for pattern in &self.patterns {
            if let Some(caps) = pattern.regex.captures(name) {
                let captures = caps
                    .iter()
                    .skip(1)
                    .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
                    .collect();
                return Some(MatchedRoute {
                    route: Arc::clone(&pattern.route),
                    captures,
                });
            }
        }

        let derived = self.find_on_disk(name).await?;
        let mut literal = match self.literal.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let route = literal
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(derived))
            .clone();
        tracing::debug!(route = %name, "Derived route memoized");

        Some(MatchedRoute { route, captures: Vec::new() })
    }

    /// Literal routes, including derived ones.
    pub fn literal_routes(&self) -> Vec<Arc<Route>> {
        let literal = match self.literal.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut routes: Vec<Arc<Route>> = literal.values().cloned().collect();
        routes.sort_by(|a, b| a.name.cmp(&b.name));
        routes
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn pattern_routes(&self) -> &[PatternRoute] {
        &self.patterns
    }

    pub fn literal_len(&self) -> usize {
        match self.literal.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    fn literal_get(&self, name: &str) -> Option<Arc<Route>> {
        let literal = match self.literal.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        literal.get(name).cloned()
    }

    async fn find_on_disk(&self, name: &str) -> Option<Route> {
        let template = secure_join(&self.base_dir, &format!("{name}.tpl"))?;
        let source = if is_file(&template).await {
            ContentSource::Template(template)
        } else {
            let file = secure_join(&self.base_dir, name)?;
            if !is_file(&file).await {
                return None;
            }
            ContentSource::File(file)
        };

        Some(Route {
            name: name.to_string(),
            source,
            fetch: BTreeMap::new(),
            expiration: self.default_expiration,
            cron: None,
        })
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok_and(|m| m.is_file())
}

/// Join `relative` under `base` without ever leaving it.
///
/// `..` components are resolved lexically and clamped at `base`; absolute
/// inputs are treated as relative to `base`. Returns `None` for an empty
/// result that would point at `base` itself.
pub fn secure_join(base: &Path, relative: &str) -> Option<PathBuf> {
    use std::path::Component;

    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::ParentDir => {
                parts.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }

    if parts.is_empty() {
        return None;
    }

    let mut joined = base.to_path_buf();
    joined.extend(parts);
    Some(joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(name: &str, path: &str) -> Arc<Route> {
        Arc::new(Route {
            name: name.to_string(),
            source: ContentSource::Template(PathBuf::from(path)),
            fetch: BTreeMap::new(),
            expiration: 300,
            cron: None,
        })
    }

    fn table(dir: &Path, patterns: Vec<(&str, &str)>) -> RouteTable {
        let mut literal = HashMap::new();
        literal.insert("index".to_string(), route("index", "/site/index.tpl"));
        let patterns = patterns
            .into_iter()
            .map(|(re, name)| PatternRoute {
                regex: Regex::new(re).unwrap(),
                route: route(name, "/site/img.tpl"),
            })
            .collect();
        RouteTable::new(literal, patterns, dir.to_path_buf(), 300)
    }

    #[test]
    fn secure_join_clamps_parent_dirs() {
        let base = Path::new("/srv/site");
        assert_eq!(secure_join(base, "a/b.tpl"), Some(PathBuf::from("/srv/site/a/b.tpl")));
        assert_eq!(secure_join(base, "../../etc/passwd"), Some(PathBuf::from("/srv/site/etc/passwd")));
        assert_eq!(secure_join(base, "/etc/passwd"), Some(PathBuf::from("/srv/site/etc/passwd")));
        assert_eq!(secure_join(base, ".."), None);
    }

    #[tokio::test]
    async fn literal_wins_over_regex() {
        let dir = tempfile::tempdir().unwrap();
        let table = table(dir.path(), vec![("^.*$", "~^.*$")]);

        let matched = table.lookup("index").await.unwrap();
        assert_eq!(matched.route.name, "index");
        assert!(matched.captures.is_empty());
    }

    #[tokio::test]
    async fn regex_routes_match_in_declaration_order() {
        let dir = tempfile::tempdir().unwrap();
        let table = table(
            dir.path(),
            vec![("^img/(.+)$", "~^img/(.+)$"), ("^(.+)/(.+)$", "~^(.+)/(.+)$")],
        );

        let matched = table.lookup("img/cat.png").await.unwrap();
        assert_eq!(matched.route.name, "~^img/(.+)$");
        assert_eq!(matched.captures, vec!["cat.png".to_string()]);

        let matched = table.lookup("doc/readme").await.unwrap();
        assert_eq!(matched.route.name, "~^(.+)/(.+)$");
        assert_eq!(matched.captures, vec!["doc".to_string(), "readme".to_string()]);
    }

    #[test]
    fn substitute_replaces_high_indices_first() {
        let matched = MatchedRoute {
            route: route("r", "/site/$1.tpl"),
            captures: (1..=10).map(|i| format!("g{i}")).collect(),
        };
        assert_eq!(matched.substitute("$1-$10"), "g1-g10");
        assert_eq!(matched.content_path(Path::new("/site")), Some(PathBuf::from("/site/g1.tpl")));
    }

    #[test]
    fn captured_path_stays_under_base() {
        let matched = |capture: &str| MatchedRoute {
            route: route("r", "/srv/site/$1.tpl"),
            captures: vec![capture.to_string()],
        };
        let base = Path::new("/srv/site");

        assert_eq!(
            matched("../secret").content_path(base),
            Some(PathBuf::from("/srv/site/secret.tpl"))
        );
        assert_eq!(
            matched("a/../../../etc/passwd").content_path(base),
            Some(PathBuf::from("/srv/site/etc/passwd.tpl"))
        );
        assert_eq!(
            matched("/etc/passwd").content_path(base),
            Some(PathBuf::from("/srv/site/etc/passwd.tpl"))
        );
    }

    #[tokio::test]
    async fn derived_route_prefers_template_then_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("about.tpl"), "about").unwrap();
        std::fs::write(dir.path().join("logo.txt"), "logo").unwrap();
        let table = table(dir.path(), vec![]);

        let about = table.lookup("about").await.unwrap();
        assert_eq!(about.route.source, ContentSource::Template(dir.path().join("about.tpl")));

        let logo = table.lookup("logo.txt").await.unwrap();
        assert_eq!(logo.route.source, ContentSource::File(dir.path().join("logo.txt")));
        assert_eq!(logo.route.expiration, 300);

        assert!(table.lookup("missing").await.is_none());
        assert_eq!(table.literal_len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_lookups_memoize_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("news.tpl"), "news").unwrap();
        let table = Arc::new(table(dir.path(), vec![]));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let table = Arc::clone(&table);
                tokio::spawn(async move { table.lookup("news").await.unwrap().route })
            })
            .collect();
        let mut routes: Vec<Arc<Route>> = Vec::new();
        for handle in handles {
            routes.push(handle.await.unwrap());
        }

        assert_eq!(table.literal_len(), 2);
        for r in &routes {
            assert!(Arc::ptr_eq(r, &routes[0]));
        }
    }
}

//! Gopher (RFC 1436) handler.
//!
//! # Responsibilities
//! - Parse selectors, including the `URL:` extension for external links
//! - Pick the domain and port advertised in menu items
//! - Turn every untyped line of a rendered template into an info item
//! - Provide menu helpers to templates (`gmenu`, `ginfo`, `gurl`, ...)

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::cache::CacheStatus;
use crate::handler::{pipeline, resolver, HandlerError, Outcome, Payload, ProtocolHandler, Request, CRLF};
use crate::net::connection::Connection;

static SELECTOR: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^/*(?:(?P<ExtSelector>URL):(?P<ExtData>.*)|(?P<Selector>[\w/.\-]+)/*)").ok());

/// A line already shaped like a menu item.
static ITEM_LINE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"^([0123456789gIds;hi+TMc])(.*?\s+)(((URL|TITLE):.*?)\s+)?([\w\-.]+\s+\d+)$").ok()
});

pub const TAB: char = '\t';

/// Item types this server emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemType {
    Text,
    Menu,
    Error,
    Html,
    Info,
}

impl ItemType {
    pub fn as_char(&self) -> char {
        match self {
            Self::Text => '0',
            Self::Menu => '1',
            Self::Error => '3',
            Self::Html => 'h',
            Self::Info => 'i',
        }
    }
}

/// One menu line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GopherItem {
    pub kind: ItemType,
    /// `URL` for web links, `TITLE` for a menu title.
    pub extra: Option<&'static str>,
    pub description: String,
    pub selector: String,
    pub host: String,
    pub port: String,
}

impl GopherItem {
    /// An item that points nowhere (info and error lines).
    pub fn local(kind: ItemType, description: impl Into<String>) -> Self {
        Self {
            kind,
            extra: None,
            description: description.into(),
            selector: String::new(),
            host: "localhost".to_string(),
            port: "0".to_string(),
        }
    }
}

impl fmt::Display for GopherItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{TAB}", self.kind.as_char(), self.description)?;
        match (self.kind, self.extra) {
            (ItemType::Html, Some("URL")) => f.write_str("URL:")?,
            (ItemType::Info, Some("TITLE")) => f.write_str("TITLE")?,
            _ => {}
        }
        write!(f, "{}{TAB}{}{TAB}{}{CRLF}", self.selector, self.host, self.port)
    }
}

/// A parsed selector line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GopherQuery {
    pub selector: String,
    /// Target of a `URL:` selector.
    pub ext_data: Option<String>,
}

impl GopherQuery {
    pub fn parse(line: &str) -> Self {
        let Some(caps) = SELECTOR.as_ref().and_then(|re| re.captures(line)) else {
            return Self::default();
        };

        let mut query = Self::default();
        match caps.name("Selector").map(|m| m.as_str()).filter(|s| !s.is_empty()) {
            Some(selector) => query.selector = selector.to_string(),
            None => {
                if let Some(ext) = caps.name("ExtSelector") {
                    query.selector = ext.as_str().to_string();
                }
                query.ext_data = caps
                    .name("ExtData")
                    .map(|m| m.as_str().to_string())
                    .filter(|d| !d.is_empty());
            }
        }

        if let Some(stripped) = query.selector.strip_suffix(".tpl") {
            query.selector = stripped.to_string();
        }
        query.selector = query.selector.trim_end_matches('/').to_string();
        query
    }
}

/// Page returned for a `URL:` selector, sending gopher clients to the web.
pub fn redirect_page(url: &str) -> String {
    format!(
        "<HTML><HEAD><META HTTP-EQUIV=\"refresh\" content=\"2;URL={url}\"></HEAD><BODY>\
You are following an external link to a Web site. You will be automatically taken to the site shortly.\
<BR>If you do not get sent there, please click <A HREF=\"{url}\">here</A> to go to the web site.\
<P>The URL linked is: {url}<P><A HREF=\"{url}\">{url}</A><P>Thanks for using Gopher!</BODY></HTML>"
    )
}

/// Rewrite template output so every line is a valid menu item.
pub fn to_menu(rendered: &str) -> String {
    let mut out = String::with_capacity(rendered.len());
    for line in rendered.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let typed = ITEM_LINE.as_ref().is_some_and(|re| re.is_match(line));
        if typed {
            out.push_str(line);
            out.push_str(CRLF);
        } else {
            out.push_str(&GopherItem::local(ItemType::Info, line).to_string());
        }
    }
    out
}

#[derive(Debug, Default, Clone, Copy)]
pub struct GopherHandler;

impl GopherHandler {
    /// Domain and port advertised in menus.
    ///
    /// Domain: `response_domain` parameter, then the TLS server name, then the
    /// first listener domain, then the local address. Port: `response_port`
    /// parameter, then the local port.
    fn response_address(conn: &Connection) -> (String, u16) {
        let domain = conn
            .config
            .handler_parameter("response_domain")
            .map(str::to_string)
            .or_else(|| conn.sni.clone())
            .or_else(|| conn.config.listener.domains.first().cloned())
            .unwrap_or_else(|| conn.local_addr.ip().to_string());

        let port = conn
            .config
            .handler_parameter("response_port")
            .and_then(|p| match p.parse::<u16>() {
                Ok(port) => Some(port),
                Err(e) => {
                    tracing::warn!(value = %p, error = %e, "Ignoring invalid response_port");
                    None
                }
            })
            .unwrap_or_else(|| conn.local_addr.port());

        (domain, port)
    }
}

#[async_trait]
impl ProtocolHandler for GopherHandler {
    fn name(&self) -> &'static str {
        "gopher"
    }

    async fn serve_conn(&self, conn: &mut Connection) -> Result<(), HandlerError> {
        pipeline::serve_conn(self, conn).await
    }

    async fn serve_crontab(&self, conn: &mut Connection, route: &str) -> Result<Outcome, HandlerError> {
        let (domain, port) = Self::response_address(conn);
        conn.domain = domain;
        conn.port = port;
        pipeline::serve_crontab(self, conn, route).await
    }

    fn register_template_functions(&self, env: &mut minijinja::Environment<'static>, conn: &Connection) {
        env.add_function("gurl_for", |selector: String| {
            if selector.starts_with('/') {
                selector
            } else {
                format!("/{selector}")
            }
        });

        let (domain, port) = (conn.domain.clone(), conn.port.to_string());
        env.add_function("gmenu", move |selector: String, description: String| {
            GopherItem {
                kind: ItemType::Menu,
                extra: None,
                description,
                selector,
                host: domain.clone(),
                port: port.clone(),
            }
            .to_string()
        });

        env.add_function("ginfo", |text: String| {
            let mut lines: Vec<&str> = text.split('\n').collect();
            if lines.last() == Some(&"") {
                lines.pop();
            }
            lines
                .into_iter()
                .map(|line| GopherItem::local(ItemType::Info, line).to_string())
                .collect::<String>()
        });

        env.add_function("gerror", |text: String| GopherItem::local(ItemType::Error, text).to_string());

        env.add_function("gtitle", |text: String| {
            let mut item = GopherItem::local(ItemType::Info, text);
            item.extra = Some("TITLE");
            item.to_string()
        });

        let (domain, port) = (conn.domain.clone(), conn.port.to_string());
        env.add_function("gurl", move |url: String, description: String| {
            GopherItem {
                kind: ItemType::Html,
                extra: Some("URL"),
                description,
                selector: url,
                host: domain.clone(),
                port: port.clone(),
            }
            .to_string()
        });
    }

    fn parse(&self, conn: &mut Connection, line: &str) -> Result<Request, HandlerError> {
        let query = GopherQuery::parse(line);

        let (domain, port) = Self::response_address(conn);
        conn.domain = domain;
        conn.port = port;

        Ok(Request {
            route: query.selector,
            extra: query.ext_data,
        })
    }

    async fn process(
        &self,
        conn: &mut Connection,
        request: &Request,
        force_cache_update: bool,
    ) -> Result<Outcome, HandlerError> {
        if let ("URL", Some(url)) = (request.route.as_str(), request.extra.as_deref()) {
            return Ok(Outcome {
                payload: Payload::Bytes(Bytes::from(redirect_page(url))),
                code: 200,
                cache_status: CacheStatus::NoCache,
                builtin_error: false,
            });
        }

        Ok(resolver::resolve(self, conn, &request.route, force_cache_update).await)
    }

    fn post_process(&self, _conn: &Connection, rendered: String) -> Result<String, HandlerError> {
        Ok(to_menu(&rendered))
    }

    fn error_payload(&self, code: u16) -> Bytes {
        let item = GopherItem::local(ItemType::Error, crate::handler::status_text(code)).to_string();
        Bytes::from(item.trim_end_matches(CRLF).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_selectors() {
        assert_eq!(GopherQuery::parse("").selector, "");
        assert_eq!(GopherQuery::parse("/").selector, "");
        assert_eq!(GopherQuery::parse("/news/").selector, "news");
        assert_eq!(GopherQuery::parse("phlog/2024.tpl").selector, "phlog/2024");
        assert_eq!(GopherQuery::parse("img/cat.png").selector, "img/cat.png");
    }

    #[test]
    fn parses_url_extension() {
        let q = GopherQuery::parse("URL:https://example.org/a?b=c");
        assert_eq!(q.selector, "URL");
        assert_eq!(q.ext_data.as_deref(), Some("https://example.org/a?b=c"));

        let bare = GopherQuery::parse("URL:");
        assert_eq!(bare.selector, "URL");
        assert_eq!(bare.ext_data, None);
    }

    #[test]
    fn item_formatting() {
        let menu = GopherItem {
            kind: ItemType::Menu,
            extra: None,
            description: "News".to_string(),
            selector: "/news".to_string(),
            host: "gopher.example".to_string(),
            port: "70".to_string(),
        };
        assert_eq!(menu.to_string(), "1News\t/news\tgopher.example\t70\r\n");

        let mut title = GopherItem::local(ItemType::Info, "Welcome");
        title.extra = Some("TITLE");
        assert_eq!(title.to_string(), "iWelcome\tTITLE\tlocalhost\t0\r\n");

        let mut link = GopherItem::local(ItemType::Html, "Site");
        link.extra = Some("URL");
        link.selector = "https://example.org".to_string();
        assert_eq!(link.to_string(), "hSite\tURL:https://example.org\tlocalhost\t0\r\n");
    }

    #[test]
    fn untyped_lines_become_info_items() {
        let rendered = "Hello\r\n1News\t/news\tgopher.example\t70\r\n\r\n";
        assert_eq!(
            to_menu(rendered),
            "iHello\t\tlocalhost\t0\r\n1News\t/news\tgopher.example\t70\r\ni\t\tlocalhost\t0\r\n"
        );
    }

    #[test]
    fn error_payload_is_a_type_3_item() {
        let payload = GopherHandler.error_payload(404);
        assert_eq!(&payload[..], b"3Not found (404)\t\tlocalhost\t0");
    }

    #[test]
    fn redirect_page_links_target() {
        let page = redirect_page("https://example.org");
        assert!(page.contains("content=\"2;URL=https://example.org\""));
        assert!(page.contains("Thanks for using Gopher!"));
    }
}

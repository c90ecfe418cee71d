//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use ttserver::cache::TtlCache;
use ttserver::config::loader::load_config_str;
use ttserver::config::SpaceConfig;
use ttserver::context::ServeContext;
use ttserver::handler::fetch::Fetcher;
use ttserver::handler::{HandlerKind, Outcome, Payload};
use ttserver::net::connection::{Connection, ConnectionId, ConnectionInfo, ConnectionLimits};
use ttserver::observability::MetricsSink;

/// Request paths seen by a mock backend, in arrival order.
pub type SeenPaths = Arc<Mutex<Vec<String>>>;

/// Start a mock HTTP backend that answers every request with `body` and
/// records the request path.
pub async fn start_mock_backend(body: &'static str) -> (SocketAddr, SeenPaths) {
    let seen: SeenPaths = Arc::default();
    let recorder = Arc::clone(&seen);
    let addr = start_programmable_backend(move |path| {
        recorder.lock().unwrap().push(path);
        async move { (200, body.to_string()) }
    })
    .await;
    (addr, seen)
}

/// Start a mock backend that waits `delay` before answering.
pub async fn start_slow_backend(delay: Duration) -> SocketAddr {
    start_programmable_backend(move |_| async move {
        tokio::time::sleep(delay).await;
        (200, "{}".to_string())
    })
    .await
}

/// Start a programmable mock backend. The closure gets the request path.
pub async fn start_programmable_backend<F, Fut>(f: F) -> SocketAddr
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let f = Arc::new(f);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let f = f.clone();
                    tokio::spawn(async move {
                        let mut buf = vec![0u8; 4096];
                        let n = socket.read(&mut buf).await.unwrap_or(0);
                        let head = String::from_utf8_lossy(&buf[..n]);
                        let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();

                        let (status, body) = f(path).await;
                        let status_text = match status {
                            200 => "200 OK",
                            404 => "404 Not Found",
                            500 => "500 Internal Server Error",
                            _ => "200 OK",
                        };
                        let response = format!(
                            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            status_text,
                            body.len(),
                            body
                        );
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    addr
}

/// Write `files` into a fresh site directory. `index.tpl` is always present.
pub fn site(files: &[(&str, &str)]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.tpl"), "Welcome to {{ default.route }}").unwrap();
    for (name, content) in files {
        let path = dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }
    dir
}

/// Load a space section from JSON. `dir` is the default base directory.
pub fn space_config(dir: &Path, space: &str) -> SpaceConfig {
    let doc = format!(r#"{{"space": {space}}}"#);
    load_config_str(&doc, dir, None).unwrap().space
}

/// Context with the given handler and cache settings.
pub fn context(config: SpaceConfig, cache_expiration: Option<i64>, fetch_timeout: Duration) -> ServeContext {
    let handler = HandlerKind::from_name(config.handler_name().unwrap_or("finger"))
        .unwrap()
        .build();
    let fetcher = Fetcher::new(fetch_timeout, 5).unwrap();
    let ctx = ServeContext::new(Arc::new(config), MetricsSink::disabled(), fetcher, handler);
    if let Some(expiration) = cache_expiration {
        ctx.cache.set(Some(Arc::new(TtlCache::new(expiration, Duration::ZERO))));
    }
    ctx
}

/// Run one request line through the handler over an in-memory stream.
pub async fn request(ctx: &ServeContext, line: &str) -> (Vec<u8>, u16) {
    let mut raw = line.as_bytes().to_vec();
    raw.extend_from_slice(b"\r\n");
    request_bytes(ctx, &raw).await
}

/// Send `raw` as-is, terminator included.
pub async fn request_bytes(ctx: &ServeContext, raw: &[u8]) -> (Vec<u8>, u16) {
    let (mut client, server) = tokio::io::duplex(64 * 1024);
    let info = ConnectionInfo {
        id: ConnectionId::generate(None),
        local_addr: "127.0.0.1:7070".parse().unwrap(),
        remote_addr: "127.0.0.1:50000".parse().unwrap(),
        sni: None,
    };
    let mut conn = Connection::new(Box::new(server), info, ctx, ConnectionLimits::default());

    client.write_all(raw).await.unwrap();
    ctx.handler.serve_conn(&mut conn).await.unwrap();
    conn.close().await.unwrap();
    let code = conn.code;
    drop(conn);

    let mut out = Vec::new();
    client.read_to_end(&mut out).await.unwrap();
    (out, code)
}

/// Body of a resolved outcome, reading streamed files to the end.
pub async fn body(outcome: Outcome) -> Vec<u8> {
    match outcome.payload {
        Payload::Bytes(data) => data.to_vec(),
        Payload::File(mut file) => {
            let mut out = Vec::new();
            file.read_to_end(&mut out).await.unwrap();
            out
        }
    }
}

//! Listener and space lifecycle over real sockets.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;

use ttserver::lifecycle::Space;
use ttserver::net::listener::DrainPolicy;

mod common;

const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

async fn space(space_json: &str, drain: DrainPolicy) -> (tempfile::TempDir, Space) {
    let dir = common::site(&[("plan.tpl", "nothing planned")]);
    let config = common::space_config(dir.path(), space_json);
    let ctx = common::context(config, Some(300), FETCH_TIMEOUT);
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut space = Space::new(ctx, tx).with_drain_policy(drain);
    space.initialize().await.unwrap();
    space.start().unwrap();
    (dir, space)
}

async fn roundtrip(stream: &mut TcpStream, request: &[u8]) -> String {
    stream.write_all(request).await.unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    String::from_utf8(out).unwrap()
}

#[tokio::test]
async fn finger_over_tcp() {
    let (_dir, mut space) = space(
        r#"{"handler": {"name": "finger"}, "listener": {"address": "127.0.0.1:0"}}"#,
        DrainPolicy::default(),
    )
    .await;
    let addr = space.local_addr().unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    assert_eq!(roundtrip(&mut stream, b"plan@localhost\r\n").await, "nothing planned\r\n");

    let mut stream = TcpStream::connect(addr).await.unwrap();
    assert_eq!(roundtrip(&mut stream, b"\r\n").await, "Welcome to index\r\n");

    space.shutdown().await;
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn proxy_protocol_header_is_consumed() {
    let (_dir, mut space) = space(
        r#"{"handler": {"name": "finger"}, "listener": {"address": "127.0.0.1:0", "proxyprotocol": "v1"}}"#,
        DrainPolicy::default(),
    )
    .await;
    let addr = space.local_addr().unwrap();

    let mut proxied = TcpStream::connect(addr).await.unwrap();
    let body = roundtrip(&mut proxied, b"PROXY TCP4 203.0.113.7 127.0.0.1 51000 79\r\nplan\r\n").await;
    assert_eq!(body, "nothing planned\r\n");

    let mut direct = TcpStream::connect(addr).await.unwrap();
    assert_eq!(roundtrip(&mut direct, b"plan\r\n").await, "nothing planned\r\n");

    space.shutdown().await;
}

#[tokio::test]
async fn shutdown_gives_up_after_drain_timeout() {
    let drain = DrainPolicy {
        poll_interval: Duration::from_millis(50),
        timeout: Duration::from_millis(400),
    };
    let (_dir, mut space) = space(
        r#"{"handler": {"name": "finger"}, "listener": {"address": "127.0.0.1:0"}}"#,
        drain,
    )
    .await;
    let addr = space.local_addr().unwrap();

    // Connected but silent: the connection stays active until its read deadline.
    let _idle = TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    space.shutdown().await;
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(400), "returned after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "returned after {elapsed:?}");
}

#[tokio::test]
async fn reload_keeps_socket_when_listener_settings_match() {
    let space_json = r#"{"handler": {"name": "finger"}, "listener": {"address": "127.0.0.1:0"}}"#;
    let (dir, mut space) = space(space_json, DrainPolicy::default()).await;
    let addr = space.local_addr().unwrap();

    std::fs::write(dir.path().join("plan.tpl"), "planned again").unwrap();
    let reloaded = common::space_config(dir.path(), space_json);
    space.reset(std::sync::Arc::new(reloaded)).await.unwrap();
    space.initialize().await.unwrap();
    space.start().unwrap();

    assert_eq!(space.local_addr(), Some(addr));
    let mut stream = TcpStream::connect(addr).await.unwrap();
    assert_eq!(roundtrip(&mut stream, b"plan\r\n").await, "planned again\r\n");

    space.shutdown().await;
}

#[tokio::test]
async fn reload_rebinds_when_domains_change() {
    let (dir, mut space) = space(
        r#"{"handler": {"name": "finger"}, "listener": {"address": "127.0.0.1:0"}}"#,
        DrainPolicy::default(),
    )
    .await;
    let old = space.local_addr().unwrap();

    let reloaded = common::space_config(
        dir.path(),
        r#"{"handler": {"name": "finger"}, "listener": {"address": "127.0.0.1:0", "domains": ["finger.example"]}}"#,
    );
    space.reset(std::sync::Arc::new(reloaded)).await.unwrap();
    assert_eq!(space.local_addr(), None);

    space.initialize().await.unwrap();
    space.start().unwrap();
    let new = space.local_addr().unwrap();
    assert_ne!(old, new);

    let mut stream = TcpStream::connect(new).await.unwrap();
    assert_eq!(roundtrip(&mut stream, b"plan\r\n").await, "nothing planned\r\n");

    space.shutdown().await;
}

fn tls_connector(cert_pem: &str) -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    for der in rustls_pemfile::certs(&mut std::io::BufReader::new(cert_pem.as_bytes())) {
        roots.add(der.unwrap()).unwrap();
    }
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

async fn tls_roundtrip(connector: &TlsConnector, addr: std::net::SocketAddr, name: &'static str) -> String {
    let tcp = TcpStream::connect(addr).await.unwrap();
    let server_name = rustls::pki_types::ServerName::try_from(name).unwrap();
    let mut stream = connector.connect(server_name, tcp).await.unwrap();
    stream.write_all(b"/menu\r\n").await.unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    String::from_utf8(out).unwrap()
}

#[tokio::test]
async fn tls_sni_selects_menu_domain_and_unknown_names_get_default_certificate() {
    let names = ["gopher.example", "alt.example", "other.example"].map(str::to_string).to_vec();
    let cert = rcgen::generate_simple_self_signed(names).unwrap();
    let cert_pem = cert.cert.pem();
    let dir = common::site(&[
        ("menu.tpl", "{{ gmenu('/news', 'News') }}"),
        ("cert.pem", cert_pem.as_str()),
        ("key.pem", cert.key_pair.serialize_pem().as_str()),
    ]);
    let space_json = format!(
        r#"{{"handler": {{"name": "gopher"}}, "cache": {{"memory": null}}, "listener": {{"address": "127.0.0.1:0",
            "domains": ["gopher.example", "alt.example"],
            "tls": {{"cert": "{}", "key": "{}"}}}}}}"#,
        dir.path().join("cert.pem").display(),
        dir.path().join("key.pem").display()
    );
    let config = common::space_config(dir.path(), &space_json);
    let ctx = common::context(config, None, FETCH_TIMEOUT);
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut space = Space::new(ctx, tx);
    space.initialize().await.unwrap();
    space.start().unwrap();
    let addr = space.local_addr().unwrap();
    let connector = tls_connector(&cert_pem);

    let matched = tls_roundtrip(&connector, addr, "alt.example").await;
    assert!(matched.starts_with("1News\t/news\talt.example\t"), "{matched:?}");

    let unmatched = tls_roundtrip(&connector, addr, "other.example").await;
    assert!(unmatched.starts_with("1News\t/news\tgopher.example\t"), "{unmatched:?}");

    space.shutdown().await;
}

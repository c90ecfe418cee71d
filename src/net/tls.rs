//! TLS configuration and certificate loading.
//!
//! # Responsibilities
//! - Load PEM certificate chains and private keys
//! - Hold the serving certificate behind a swappable resolver (ACME renewals)
//! - Read the ClientHello first, record a matching SNI, then finish the handshake

use std::fmt;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("unable to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificate found in {0}")]
    NoCertificate(String),

    #[error("no private key found in {0}")]
    NoPrivateKey(String),

    #[error("tls error: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("handshake failed: {0}")]
    Handshake(#[source] std::io::Error),
}

/// Parse a PEM chain and key into a signing certificate.
pub fn certified_key_from_pem(cert_pem: &[u8], key_pem: &[u8], origin: &str) -> Result<CertifiedKey, TlsError> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(cert_pem))
        .collect::<Result<_, _>>()
        .map_err(|source| TlsError::Io {
            path: PathBuf::from(origin),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificate(origin.to_string()));
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut BufReader::new(key_pem))
        .map_err(|source| TlsError::Io {
            path: PathBuf::from(origin),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(origin.to_string()))?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)?;
    Ok(CertifiedKey::new(certs, signing_key))
}

/// Load a certificate and key from PEM files.
pub async fn load_pem_files(cert_path: &Path, key_path: &Path) -> Result<CertifiedKey, TlsError> {
    let read = |path: &Path| {
        let path = path.to_path_buf();
        async move {
            tokio::fs::read(&path)
                .await
                .map_err(|source| TlsError::Io { path, source })
        }
    };
    let cert = read(cert_path).await?;
    let key = read(key_path).await?;

    certified_key_from_pem(&cert, &key, &cert_path.display().to_string())
}

/// Serves one certificate that can be replaced while running.
pub struct CertResolver {
    current: ArcSwap<CertifiedKey>,
}

impl CertResolver {
    pub fn new(key: CertifiedKey) -> Self {
        Self {
            current: ArcSwap::from_pointee(key),
        }
    }

    /// Install a renewed certificate for new handshakes.
    pub fn swap(&self, key: CertifiedKey) {
        self.current.store(Arc::new(key));
        tracing::info!("TLS certificate replaced");
    }
}

impl fmt::Debug for CertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertResolver")
            .field("chain_len", &self.current.load().cert.len())
            .finish()
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.current.load_full())
    }
}

/// Server-side TLS for one listener.
#[derive(Clone)]
pub struct TlsAcceptor {
    config: Arc<ServerConfig>,
    resolver: Arc<CertResolver>,
    domains: Arc<[String]>,
}

impl TlsAcceptor {
    pub fn new(resolver: Arc<CertResolver>, domains: &[String]) -> Result<Self, TlsError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_cert_resolver(resolver.clone());

        Ok(Self {
            config: Arc::new(config),
            resolver,
            domains: domains.into(),
        })
    }

    pub fn resolver(&self) -> &Arc<CertResolver> {
        &self.resolver
    }

    /// Run the handshake. Returns the SNI when it names one of the
    /// listener's domains (exact, case-sensitive match).
    pub async fn accept<S>(&self, stream: S) -> Result<(TlsStream<S>, Option<String>), TlsError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let start = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream)
            .await
            .map_err(TlsError::Handshake)?;

        let sni = start
            .client_hello()
            .server_name()
            .filter(|name| self.domains.iter().any(|d| d == name))
            .map(str::to_string);

        let stream = start
            .into_stream(Arc::clone(&self.config))
            .await
            .map_err(TlsError::Handshake)?;

        Ok((stream, sni))
    }
}

impl fmt::Debug for TlsAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsAcceptor").field("domains", &self.domains).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed(name: &str) -> (String, String) {
        let cert = rcgen::generate_simple_self_signed(vec![name.to_string()]).unwrap();
        (cert.cert.pem(), cert.key_pair.serialize_pem())
    }

    #[test]
    fn loads_generated_pem() {
        let (cert, key) = self_signed("localhost");
        let certified = certified_key_from_pem(cert.as_bytes(), key.as_bytes(), "memory").unwrap();
        assert_eq!(certified.cert.len(), 1);
    }

    #[test]
    fn rejects_missing_parts() {
        let (cert, _) = self_signed("localhost");
        assert!(matches!(
            certified_key_from_pem(b"", b"", "empty"),
            Err(TlsError::NoCertificate(_))
        ));
        assert!(matches!(
            certified_key_from_pem(cert.as_bytes(), b"", "nokey"),
            Err(TlsError::NoPrivateKey(_))
        ));
    }

    fn connector(cert_pem: &str) -> tokio_rustls::TlsConnector {
        let mut roots = rustls::RootCertStore::empty();
        for der in rustls_pemfile::certs(&mut BufReader::new(cert_pem.as_bytes())) {
            roots.add(der.unwrap()).unwrap();
        }
        let client_config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
        tokio_rustls::TlsConnector::from(Arc::new(client_config))
    }

    /// Handshake as `server_name`; both ends stay open until both finish.
    async fn handshake(names: &[&str], domains: &[&str], server_name: &'static str) -> Option<String> {
        let cert = rcgen::generate_simple_self_signed(names.iter().map(|n| n.to_string()).collect::<Vec<_>>()).unwrap();
        let (cert_pem, key_pem) = (cert.cert.pem(), cert.key_pair.serialize_pem());
        let certified = certified_key_from_pem(cert_pem.as_bytes(), key_pem.as_bytes(), "memory").unwrap();
        let domains: Vec<String> = domains.iter().map(|d| d.to_string()).collect();
        let acceptor = TlsAcceptor::new(Arc::new(CertResolver::new(certified)), &domains).unwrap();

        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let name = rustls::pki_types::ServerName::try_from(server_name).unwrap();
        let connector = connector(&cert_pem);
        let (client, server) = tokio::join!(connector.connect(name, client_io), acceptor.accept(server_io));
        let _client = client.unwrap();
        let (_stream, sni) = server.unwrap();
        sni
    }

    #[tokio::test]
    async fn handshake_records_matching_sni() {
        let sni = handshake(&["finger.example"], &["finger.example"], "finger.example").await;
        assert_eq!(sni.as_deref(), Some("finger.example"));
    }

    #[tokio::test]
    async fn unknown_sni_gets_default_certificate() {
        let sni = handshake(&["finger.example", "other.example"], &["finger.example"], "other.example").await;
        assert_eq!(sni, None);
    }
}

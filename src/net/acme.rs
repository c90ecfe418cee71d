//! ACME certificate issuance with DNS-01 challenges.
//!
//! # Data Flow
//! ```text
//! AcmeManager::ensure_certificate
//!     → storage (cert.pem, key.pem, meta.json) fresh? → reuse
//!     → account.json or Account::create
//!     → new order → TXT _acme-challenge.<domain> via DNS provider API
//!     → challenges ready → poll → finalize (rcgen CSR) → store
//!
//! spawn_renewal: every 12h ensure_certificate → CertResolver::swap
//! ```
//!
//! # Design Decisions
//! - One certificate for all listener domains
//! - A stored certificate is reused until it is 60 days old
//! - Challenge records are removed even when the order fails

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount, NewOrder, OrderStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::schema::AcmeConfig;
use crate::net::tls::{certified_key_from_pem, CertResolver, TlsError};

pub const RENEW_AFTER: chrono::Duration = chrono::Duration::days(60);
pub const RENEWAL_CHECK_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);
const PROPAGATION_WAIT: Duration = Duration::from_secs(30);
const ORDER_POLL_ATTEMPTS: u32 = 10;

#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("unknown dns provider {0}")]
    UnknownProvider(String),

    #[error("environment variable {0} is not set")]
    MissingToken(&'static str),

    #[error("storage error on {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid stored data: {0}")]
    Json(#[from] serde_json::Error),

    #[error("acme protocol error: {0}")]
    Protocol(#[from] instant_acme::Error),

    #[error("csr generation failed: {0}")]
    Csr(#[from] rcgen::Error),

    #[error("dns provider request failed: {0}")]
    Dns(#[from] reqwest::Error),

    #[error("no dns zone found for {0}")]
    NoZone(String),

    #[error("order ended in state {0}")]
    OrderFailed(String),

    #[error("issued certificate is unusable: {0}")]
    Certificate(#[from] TlsError),
}

/// DNS APIs able to publish challenge records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsProviderKind {
    Cloudflare,
    DigitalOcean,
    Gandi,
    Hetzner,
}

impl DnsProviderKind {
    pub fn from_name(name: &str) -> Result<Self, AcmeError> {
        match name {
            "cloudflare" => Ok(Self::Cloudflare),
            "digitalocean" => Ok(Self::DigitalOcean),
            "gandi" | "gandiv5" => Ok(Self::Gandi),
            "hetzner" => Ok(Self::Hetzner),
            other => Err(AcmeError::UnknownProvider(other.to_string())),
        }
    }

    pub fn token_env(&self) -> &'static str {
        match self {
            Self::Cloudflare => "CLOUDFLARE_API_TOKEN",
            Self::DigitalOcean => "DO_API_TOKEN",
            Self::Gandi => "GANDI_API_TOKEN",
            Self::Hetzner => "HETZNER_API_TOKEN",
        }
    }
}

/// A published TXT record, kept for cleanup.
#[derive(Debug, Clone)]
struct TxtRecord {
    zone: String,
    /// Provider record id, or the relative name for Gandi.
    id: String,
}

/// Minimal client for the providers' record APIs.
#[derive(Debug, Clone)]
pub struct DnsClient {
    kind: DnsProviderKind,
    token: String,
    http: reqwest::Client,
}

impl DnsClient {
    pub fn from_env(kind: DnsProviderKind) -> Result<Self, AcmeError> {
        let token = std::env::var(kind.token_env())
            .ok()
            .filter(|t| !t.is_empty())
            .ok_or(AcmeError::MissingToken(kind.token_env()))?;
        Ok(Self {
            kind,
            token,
            http: reqwest::Client::builder().timeout(Duration::from_secs(30)).build()?,
        })
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        self.auth(self.http.get(url))
    }

    fn auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.kind {
            DnsProviderKind::Hetzner => request.header("Auth-API-Token", &self.token),
            _ => request.bearer_auth(&self.token),
        }
    }

    /// Find the managed zone for `domain`, longest suffix first.
    async fn find_zone(&self, domain: &str) -> Result<(String, String), AcmeError> {
        for zone in candidate_zones(domain) {
            let found = match self.kind {
                DnsProviderKind::Cloudflare => {
                    let body: Value = self
                        .get(&format!("https://api.cloudflare.com/client/v4/zones?name={zone}"))
                        .send()
                        .await?
                        .json()
                        .await?;
                    body["result"][0]["id"].as_str().map(str::to_string)
                }
                DnsProviderKind::Hetzner => {
                    let body: Value = self
                        .get(&format!("https://dns.hetzner.com/api/v1/zones?name={zone}"))
                        .send()
                        .await?
                        .json()
                        .await?;
                    body["zones"][0]["id"].as_str().map(str::to_string)
                }
                DnsProviderKind::DigitalOcean => {
                    let response = self
                        .get(&format!("https://api.digitalocean.com/v2/domains/{zone}"))
                        .send()
                        .await?;
                    response.status().is_success().then(|| zone.clone())
                }
                DnsProviderKind::Gandi => {
                    let response = self
                        .get(&format!("https://api.gandi.net/v5/livedns/domains/{zone}"))
                        .send()
                        .await?;
                    response.status().is_success().then(|| zone.clone())
                }
            };
            if let Some(id) = found {
                return Ok((zone, id));
            }
        }
        Err(AcmeError::NoZone(domain.to_string()))
    }

    async fn present(&self, fqdn: &str, value: &str) -> Result<TxtRecord, AcmeError> {
        let domain = fqdn.trim_start_matches("_acme-challenge.");
        let (zone, zone_id) = self.find_zone(domain).await?;
        let relative = relative_name(fqdn, &zone);

        let id = match self.kind {
            DnsProviderKind::Cloudflare => {
                let body: Value = self
                    .auth(self.http.post(format!(
                        "https://api.cloudflare.com/client/v4/zones/{zone_id}/dns_records"
                    )))
                    .json(&json!({"type": "TXT", "name": fqdn, "content": value, "ttl": 120}))
                    .send()
                    .await?
                    .error_for_status()?
                    .json()
                    .await?;
                body["result"]["id"].as_str().unwrap_or_default().to_string()
            }
            DnsProviderKind::DigitalOcean => {
                let body: Value = self
                    .auth(self.http.post(format!("https://api.digitalocean.com/v2/domains/{zone}/records")))
                    .json(&json!({"type": "TXT", "name": relative, "data": value, "ttl": 30}))
                    .send()
                    .await?
                    .error_for_status()?
                    .json()
                    .await?;
                body["domain_record"]["id"].to_string()
            }
            DnsProviderKind::Hetzner => {
                let body: Value = self
                    .auth(self.http.post("https://dns.hetzner.com/api/v1/records"))
                    .json(&json!({"type": "TXT", "name": relative, "value": value, "ttl": 60, "zone_id": zone_id}))
                    .send()
                    .await?
                    .error_for_status()?
                    .json()
                    .await?;
                body["record"]["id"].as_str().unwrap_or_default().to_string()
            }
            DnsProviderKind::Gandi => {
                self.auth(self.http.put(format!(
                    "https://api.gandi.net/v5/livedns/domains/{zone}/records/{relative}/TXT"
                )))
                .json(&json!({"rrset_values": [value], "rrset_ttl": 300}))
                .send()
                .await?
                .error_for_status()?;
                relative.clone()
            }
        };

        tracing::info!(record = %fqdn, zone = %zone, "ACME challenge record published");
        Ok(TxtRecord {
            zone: if self.kind == DnsProviderKind::Cloudflare { zone_id } else { zone },
            id,
        })
    }

    async fn cleanup(&self, record: &TxtRecord) -> Result<(), AcmeError> {
        let TxtRecord { zone, id } = record;
        let url = match self.kind {
            DnsProviderKind::Cloudflare => format!("https://api.cloudflare.com/client/v4/zones/{zone}/dns_records/{id}"),
            DnsProviderKind::DigitalOcean => format!("https://api.digitalocean.com/v2/domains/{zone}/records/{id}"),
            DnsProviderKind::Hetzner => format!("https://dns.hetzner.com/api/v1/records/{id}"),
            DnsProviderKind::Gandi => format!("https://api.gandi.net/v5/livedns/domains/{zone}/records/{id}/TXT"),
        };
        self.auth(self.http.delete(url)).send().await?.error_for_status()?;
        Ok(())
    }
}

/// `a.b.example.org` → `a.b.example.org`, `b.example.org`, `example.org`.
fn candidate_zones(domain: &str) -> Vec<String> {
    let labels: Vec<&str> = domain.trim_end_matches('.').split('.').collect();
    (0..labels.len().saturating_sub(1))
        .map(|i| labels[i..].join("."))
        .collect()
}

/// Record name relative to its zone (`@` for the apex).
fn relative_name(fqdn: &str, zone: &str) -> String {
    match fqdn.strip_suffix(zone) {
        Some("") => "@".to_string(),
        Some(prefix) => prefix.trim_end_matches('.').to_string(),
        None => fqdn.to_string(),
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CertificateMeta {
    domains: Vec<String>,
    issued_at: DateTime<Utc>,
}

/// A PEM certificate chain and its key.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub cert_pem: String,
    pub key_pem: String,
    pub issued_at: DateTime<Utc>,
}

/// Obtains and renews the listener certificate.
#[derive(Debug)]
pub struct AcmeManager {
    directory_url: String,
    email: String,
    domains: Vec<String>,
    storage: PathBuf,
    dns: DnsClient,
}

impl AcmeManager {
    pub fn new(config: &AcmeConfig, domains: &[String]) -> Result<Self, AcmeError> {
        let provider = config.dnsprovider.as_deref().unwrap_or_default();
        let dns = DnsClient::from_env(DnsProviderKind::from_name(provider)?)?;

        Ok(Self {
            directory_url: config.directory_url().to_string(),
            email: config.email.clone().unwrap_or_default(),
            domains: domains.to_vec(),
            storage: config.storage_path(),
            dns,
        })
    }

    /// Stored certificate when still fresh, a newly issued one otherwise.
    ///
    /// The flag is true when the certificate was just issued.
    pub async fn ensure_certificate(&self) -> Result<(IssuedCertificate, bool), AcmeError> {
        if let Some(stored) = self.load_stored().await? {
            if Utc::now() - stored.issued_at < RENEW_AFTER {
                tracing::debug!(issued_at = %stored.issued_at, "Reusing stored certificate");
                return Ok((stored, false));
            }
            tracing::info!(issued_at = %stored.issued_at, "Stored certificate due for renewal");
        }

        let issued = self.issue().await?;
        self.store(&issued).await?;
        Ok((issued, true))
    }

    /// Re-check the certificate every 12 hours and swap in renewals.
    pub fn spawn_renewal(self: Arc<Self>, resolver: Arc<CertResolver>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RENEWAL_CHECK_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                match self.ensure_certificate().await {
                    Ok((cert, true)) => {
                        match certified_key_from_pem(cert.cert_pem.as_bytes(), cert.key_pem.as_bytes(), "acme") {
                            Ok(key) => resolver.swap(key),
                            Err(e) => tracing::error!(error = %e, "Renewed certificate unusable"),
                        }
                    }
                    Ok((_, false)) => {}
                    Err(e) => tracing::error!(error = %e, "Certificate renewal failed"),
                }
            }
        })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.storage.join(name)
    }

    async fn load_stored(&self) -> Result<Option<IssuedCertificate>, AcmeError> {
        let Some(meta) = read_optional(&self.path("meta.json")).await? else {
            return Ok(None);
        };
        let meta: CertificateMeta = serde_json::from_slice(&meta)?;
        if meta.domains != self.domains {
            tracing::info!(stored = ?meta.domains, wanted = ?self.domains, "Stored certificate covers other domains");
            return Ok(None);
        }

        let cert = read_optional(&self.path("cert.pem")).await?;
        let key = read_optional(&self.path("key.pem")).await?;
        let (Some(cert), Some(key)) = (cert, key) else {
            return Ok(None);
        };

        Ok(Some(IssuedCertificate {
            cert_pem: String::from_utf8_lossy(&cert).into_owned(),
            key_pem: String::from_utf8_lossy(&key).into_owned(),
            issued_at: meta.issued_at,
        }))
    }

    async fn store(&self, issued: &IssuedCertificate) -> Result<(), AcmeError> {
        tokio::fs::create_dir_all(&self.storage)
            .await
            .map_err(|source| AcmeError::Storage {
                path: self.storage.clone(),
                source,
            })?;

        let meta = serde_json::to_vec_pretty(&CertificateMeta {
            domains: self.domains.clone(),
            issued_at: issued.issued_at,
        })?;
        write_file(&self.path("cert.pem"), issued.cert_pem.as_bytes()).await?;
        write_file(&self.path("key.pem"), issued.key_pem.as_bytes()).await?;
        write_file(&self.path("meta.json"), &meta).await
    }

    async fn account(&self) -> Result<Account, AcmeError> {
        let path = self.path("account.json");
        if let Some(raw) = read_optional(&path).await? {
            let credentials: AccountCredentials = serde_json::from_slice(&raw)?;
            return Ok(Account::from_credentials(credentials).await?);
        }

        let contact = format!("mailto:{}", self.email);
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &[contact.as_str()],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.directory_url,
            None,
        )
        .await?;

        tokio::fs::create_dir_all(&self.storage)
            .await
            .map_err(|source| AcmeError::Storage {
                path: self.storage.clone(),
                source,
            })?;
        write_file(&path, &serde_json::to_vec_pretty(&credentials)?).await?;
        tracing::info!(directory = %self.directory_url, "ACME account registered");
        Ok(account)
    }

    async fn issue(&self) -> Result<IssuedCertificate, AcmeError> {
        tracing::info!(domains = ?self.domains, directory = %self.directory_url, "Requesting certificate");
        let account = self.account().await?;

        let identifiers: Vec<Identifier> = self.domains.iter().map(|d| Identifier::Dns(d.clone())).collect();
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        let mut records = Vec::new();
        let result = self.complete_challenges(&mut order, &mut records).await;
        for record in &records {
            if let Err(e) = self.dns.cleanup(record).await {
                tracing::warn!(error = %e, "Unable to remove challenge record");
            }
        }
        result?;

        let mut params = rcgen::CertificateParams::new(self.domains.clone())?;
        params.distinguished_name = rcgen::DistinguishedName::new();
        let key_pair = rcgen::KeyPair::generate()?;
        let csr = params.serialize_request(&key_pair)?;
        order.finalize(csr.der()).await?;

        let mut cert_pem = None;
        for _ in 0..ORDER_POLL_ATTEMPTS {
            if let Some(pem) = order.certificate().await? {
                cert_pem = Some(pem);
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        let cert_pem = cert_pem.ok_or_else(|| AcmeError::OrderFailed("certificate not delivered".to_string()))?;
        let key_pem = key_pair.serialize_pem();

        certified_key_from_pem(cert_pem.as_bytes(), key_pem.as_bytes(), "acme")?;
        tracing::info!(domains = ?self.domains, "Certificate issued");
        Ok(IssuedCertificate {
            cert_pem,
            key_pem,
            issued_at: Utc::now(),
        })
    }

    async fn complete_challenges(
        &self,
        order: &mut instant_acme::Order,
        records: &mut Vec<TxtRecord>,
    ) -> Result<(), AcmeError> {
        let authorizations = order.authorizations().await?;
        let mut ready = Vec::new();

        for authz in &authorizations {
            match authz.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => continue,
                other => return Err(AcmeError::OrderFailed(format!("{other:?}"))),
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Dns01)
                .ok_or_else(|| AcmeError::OrderFailed("no dns-01 challenge offered".to_string()))?;
            #[allow(irrefutable_let_patterns)]
            let Identifier::Dns(domain) = &authz.identifier
            else {
                continue;
            };

            let fqdn = format!("_acme-challenge.{domain}");
            let value = order.key_authorization(challenge).dns_value();
            records.push(self.dns.present(&fqdn, &value).await?);
            ready.push(challenge.url.clone());
        }

        if ready.is_empty() {
            return Ok(());
        }

        tokio::time::sleep(PROPAGATION_WAIT).await;
        for url in &ready {
            order.set_challenge_ready(url).await?;
        }

        let mut delay = Duration::from_millis(500);
        for _ in 0..ORDER_POLL_ATTEMPTS {
            tokio::time::sleep(delay).await;
            let state = order.refresh().await?;
            match state.status {
                OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
                OrderStatus::Invalid => return Err(AcmeError::OrderFailed("invalid".to_string())),
                _ => delay = (delay * 2).min(Duration::from_secs(10)),
            }
        }
        Err(AcmeError::OrderFailed("timed out waiting for validation".to_string()))
    }
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, AcmeError> {
    match tokio::fs::read(path).await {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(AcmeError::Storage {
            path: path.to_path_buf(),
            source,
        }),
    }
}

async fn write_file(path: &Path, data: &[u8]) -> Result<(), AcmeError> {
    tokio::fs::write(path, data)
        .await
        .map_err(|source| AcmeError::Storage {
            path: path.to_path_buf(),
            source,
        })
}

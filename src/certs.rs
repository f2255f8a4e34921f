//! Certificate lifecycle: bootstrap self-signed certificate and ACME DNS-01 renewal
//!
//! Renewal is driven by [`CertificateManager::check`] on a fixed period.
//! Domains without a certificate, or whose certificate expires within the
//! renewal window, are reissued through a [`CertificateIssuer`]. A failed
//! issuance leaves the existing files untouched; the next eligible tick
//! simply tries again.
//!
//! # Key Storage
//! Private keys are written unencrypted with 0600 permissions on Unix.

use crate::config::{CertsConfig, Paths};
use crate::dns::{DnsBackend, DnsRecord};
use crate::error::{CertError, CommandResponse};
use crate::model::{self, CertificateBlock, SslInfo, Websites};
use crate::store::ConfigStore;
use chrono::Datelike;
use dashmap::DashMap;
use instant_acme::{
    Account, AuthorizationStatus, ChallengeType, Identifier, NewAccount, NewOrder, Order,
    OrderStatus,
};
use parking_lot::Mutex;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256, PKCS_RSA_SHA256,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::future::Future;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// The bootstrap certificate is re-verified at most this often
const BOOTSTRAP_CHECK_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

const BOOTSTRAP_NAMES: [&str; 2] = ["localhost", "127.0.0.1"];

const BOOTSTRAP_KEY_BITS: usize = 2048;

/// A freshly issued key and certificate chain, PEM encoded
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub key_pem: String,
    pub cert_pem: String,
}

/// Obtains a certificate covering `names`, publishing challenges through `dns`
pub trait CertificateIssuer: Send + Sync {
    fn issue(
        &self,
        names: &[String],
        dns: &dyn DnsBackend,
    ) -> impl Future<Output = Result<IssuedCertificate, CertError>> + Send;
}

/// TXT record answering the DNS-01 challenge for `identifier`
pub fn challenge_record(identifier: &str, value: String, ttl: u32) -> DnsRecord {
    DnsRecord::txt(format!("_acme-challenge.{identifier}"), value)
        .with_ttl(ttl)
        .unique()
}

/// ACME client restricted to DNS-01 challenges
#[derive(Debug, Clone)]
pub struct AcmeIssuer {
    directory_url: String,
    contact_email: Option<String>,
    challenge_ttl: u32,
    poll_interval: Duration,
    max_attempts: u32,
}

impl AcmeIssuer {
    pub fn new(settings: &CertsConfig) -> Self {
        Self {
            directory_url: settings.directory_url().to_string(),
            contact_email: settings.contact_email.clone(),
            challenge_ttl: settings.challenge_ttl,
            poll_interval: Duration::from_secs(2),
            max_attempts: 30,
        }
    }

    /// Answer every pending authorization and wait for the order to become ready
    async fn authorize(
        &self,
        order: &mut Order,
        dns: &dyn DnsBackend,
        published: &mut Vec<DnsRecord>,
    ) -> Result<(), CertError> {
        let authorizations = order.authorizations().await?;

        for authz in &authorizations {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }

            let identifier = match &authz.identifier {
                Identifier::Dns(domain) => domain.clone(),
            };

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Dns01)
                .ok_or_else(|| {
                    CertError::Acme(format!("dns-01 challenge not offered for {identifier}"))
                })?;

            let value = order.key_authorization(challenge).dns_value();
            let record = challenge_record(&identifier, value, self.challenge_ttl);
            debug!(domain = %identifier, record = %record.name, "Publishing DNS-01 challenge");
            dns.record(record.clone())?;
            published.push(record);

            order.set_challenge_ready(&challenge.url).await?;
        }

        let mut attempts = 0;
        loop {
            order.refresh().await?;
            let state = order.state();
            match state.status {
                OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
                OrderStatus::Invalid => {
                    return Err(CertError::Acme("order invalid".to_string()));
                }
                OrderStatus::Pending | OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > self.max_attempts {
                        return Err(CertError::Acme("authorization timeout".to_string()));
                    }
                    debug!(attempt = attempts, "Waiting for authorization");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    async fn finalize(&self, order: &mut Order, names: &[String]) -> Result<IssuedCertificate, CertError> {
        let mut params = CertificateParams::new(names.to_vec())?;
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, names[0].clone());

        let private_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let csr = params.serialize_request(&private_key)?;
        order.finalize(csr.der()).await?;

        let mut attempts = 0;
        let cert_pem = loop {
            order.refresh().await?;
            let state = order.state();
            match state.status {
                OrderStatus::Valid => match order.certificate().await? {
                    Some(cert) => break cert,
                    None => {
                        return Err(CertError::Acme(
                            "order valid but no certificate returned".to_string(),
                        ))
                    }
                },
                OrderStatus::Processing | OrderStatus::Ready => {
                    attempts += 1;
                    if attempts > self.max_attempts {
                        return Err(CertError::Acme("certificate timeout".to_string()));
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
                _ => {
                    return Err(CertError::Acme(format!(
                        "unexpected order status: {:?}",
                        state.status
                    )))
                }
            }
        };

        Ok(IssuedCertificate {
            key_pem: private_key.serialize_pem(),
            cert_pem,
        })
    }
}

impl CertificateIssuer for AcmeIssuer {
    async fn issue(
        &self,
        names: &[String],
        dns: &dyn DnsBackend,
    ) -> Result<IssuedCertificate, CertError> {
        if names.is_empty() {
            return Err(CertError::Acme("no names to certify".to_string()));
        }

        // A fresh account key per issuance
        let contact = self.contact_email.as_ref().map(|email| format!("mailto:{email}"));
        let contact: Vec<&str> = contact.iter().map(String::as_str).collect();
        let (account, _credentials) = Account::create(
            &NewAccount {
                contact: &contact,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.directory_url,
            None,
        )
        .await?;

        let identifiers: Vec<Identifier> = names.iter().map(|n| Identifier::Dns(n.clone())).collect();
        info!(domains = ?names, "Requesting new certificate");
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        let mut published = Vec::new();
        let authorized = self.authorize(&mut order, dns, &mut published).await;
        for record in &published {
            if let Err(e) = dns.delete(record) {
                warn!(record = %record.name, error = %e, "Failed to remove challenge record");
            }
        }
        authorized?;

        let issued = self.finalize(&mut order, names).await?;
        info!(domains = ?names, "Certificate obtained successfully");
        Ok(issued)
    }
}

/// Self-signed certificate for `names` with an ECDSA P-256 key, valid from today for `validity_days`
pub fn self_signed(names: &[String], validity_days: i64) -> Result<IssuedCertificate, CertError> {
    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
    self_signed_with(names, validity_days, key_pair)
}

/// Self-signed certificate for the control plane's own listener, with an RSA-2048 key
pub fn bootstrap_certificate(names: &[String], validity_days: i64) -> Result<IssuedCertificate, CertError> {
    let mut rng = rand::thread_rng();
    let key = RsaPrivateKey::new(&mut rng, BOOTSTRAP_KEY_BITS)
        .map_err(|e| CertError::Generate(format!("rsa key generation: {e}")))?;
    let pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| CertError::Generate(format!("rsa key encoding: {e}")))?;
    let key_pair = KeyPair::from_pem_and_sign_algo(&pem, &PKCS_RSA_SHA256)?;
    self_signed_with(names, validity_days, key_pair)
}

fn self_signed_with(
    names: &[String],
    validity_days: i64,
    key_pair: KeyPair,
) -> Result<IssuedCertificate, CertError> {
    let mut params = CertificateParams::new(names.to_vec())?;
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, "CandyPack");

    let now = chrono::Utc::now();
    let until = now + chrono::Duration::days(validity_days);
    params.not_before = rcgen::date_time_ymd(now.year(), now.month() as u8, now.day() as u8);
    params.not_after = rcgen::date_time_ymd(until.year(), until.month() as u8, until.day() as u8);

    let cert = params.self_signed(&key_pair)?;

    Ok(IssuedCertificate {
        key_pem: key_pair.serialize_pem(),
        cert_pem: cert.pem(),
    })
}

/// Expiry of the first certificate in a PEM bundle, in epoch milliseconds
pub fn expiry_from_pem(pem: &[u8]) -> Option<i64> {
    use x509_parser::prelude::*;

    let cert = rustls_pemfile::certs(&mut BufReader::new(pem)).next()?.ok()?;
    match X509Certificate::from_der(cert.as_ref()) {
        Ok((_, parsed)) => Some(parsed.validity().not_after.timestamp() * 1000),
        Err(e) => {
            error!(error = %e, "Failed to parse X.509 certificate");
            None
        }
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, CertError> {
    let data = read(path)?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(&data[..]))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertError::Tls(format!("failed to parse certificates from {}: {e}", path.display())))?;

    if certs.is_empty() {
        return Err(CertError::Tls(format!("no certificates found in {}", path.display())));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, CertError> {
    let data = read(path)?;
    let mut reader = BufReader::new(&data[..]);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| CertError::Tls(format!("failed to parse key from {}: {e}", path.display())))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    Err(CertError::Tls(format!("no private key found in {}", path.display())))
}

fn read(path: &Path) -> Result<Vec<u8>, CertError> {
    std::fs::read(path).map_err(io_error(path))
}

/// Write a certificate bundle, the key with owner-only permissions
fn save_bundle(issued: &IssuedCertificate, key_path: &Path, cert_path: &Path) -> Result<(), CertError> {
    if let Some(dir) = cert_path.parent() {
        std::fs::create_dir_all(dir).map_err(io_error(dir))?;
    }

    std::fs::write(cert_path, &issued.cert_pem).map_err(io_error(cert_path))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(key_path)
            .map_err(io_error(key_path))?;
        std::io::Write::write_all(&mut file, issued.key_pem.as_bytes()).map_err(io_error(key_path))?;
    }
    #[cfg(not(unix))]
    {
        std::fs::write(key_path, &issued.key_pem).map_err(io_error(key_path))?;
    }

    Ok(())
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CertError {
    let path = path.to_path_buf();
    move |source| CertError::Io { path, source }
}

/// A domain is due when no certificate expiry is known or it falls inside the renewal window
fn renewal_due(expiry: Option<i64>, now: i64, renew_before_days: i64) -> bool {
    match expiry {
        None => true,
        Some(expiry) => expiry - now < renew_before_days * DAY_MS,
    }
}

fn is_ip(name: &str) -> bool {
    name.parse::<IpAddr>().is_ok()
}

/// Clears a busy flag when dropped
struct BusyFlag<'a>(&'a AtomicBool);

impl Drop for BusyFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Removes a domain from the set of running renewals when dropped
struct Renewing<'a> {
    map: &'a DashMap<String, ()>,
    domain: String,
}

impl Drop for Renewing<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.domain);
    }
}

pub struct CertificateManager<I: CertificateIssuer> {
    store: Arc<ConfigStore>,
    dns: Arc<dyn DnsBackend>,
    issuer: I,
    settings: CertsConfig,
    checking: AtomicBool,
    renewing: DashMap<String, ()>,
    bootstrap_checked: Mutex<Option<Instant>>,
}

impl<I: CertificateIssuer> CertificateManager<I> {
    pub fn new(
        store: Arc<ConfigStore>,
        dns: Arc<dyn DnsBackend>,
        issuer: I,
        settings: CertsConfig,
    ) -> Self {
        Self {
            store,
            dns,
            issuer,
            settings,
            checking: AtomicBool::new(false),
            renewing: DashMap::new(),
            bootstrap_checked: Mutex::new(None),
        }
    }

    fn paths(&self) -> &Paths {
        self.store.paths()
    }

    /// Periodic reconciliation; overlapping calls return immediately
    pub async fn check(&self) {
        if self.checking.swap(true, Ordering::SeqCst) {
            debug!("Certificate check already running");
            return;
        }
        let _busy = BusyFlag(&self.checking);

        if self.bootstrap_due() {
            if let Err(e) = self.ensure_bootstrap() {
                error!(error = %e, "Failed to ensure bootstrap certificate");
            }
        }

        let sites = match self.store.get_as::<Websites>(model::WEBSITES) {
            Ok(sites) => sites,
            Err(e) => {
                error!(error = %e, "Cannot read websites for certificate check");
                return;
            }
        };

        for (domain, site) in sites {
            if is_ip(&domain) || domain == "localhost" {
                continue;
            }

            let expiry = self.recorded_expiry(&domain, site.cert.as_ref());
            if !renewal_due(expiry, model::now_ms(), self.settings.renew_before_days) {
                continue;
            }

            match self.renew_domain(&domain).await {
                Ok(()) => {}
                Err(CertError::InProgress(_)) => {}
                Err(e) => warn!(domain = %domain, error = %e, "Certificate renewal failed"),
            }
        }
    }

    fn bootstrap_due(&self) -> bool {
        let mut checked = self.bootstrap_checked.lock();
        let due = checked.map_or(true, |at| at.elapsed() >= BOOTSTRAP_CHECK_PERIOD);
        if due {
            *checked = Some(Instant::now());
        }
        due
    }

    /// Regenerate the bootstrap certificate when it expired or a file is missing.
    ///
    /// Returns true when a new certificate was written.
    pub fn ensure_bootstrap(&self) -> Result<bool, CertError> {
        let ssl: SslInfo = self.store.get_as(model::SSL)?;
        let key_path = self.paths().bootstrap_key();
        let cert_path = self.paths().bootstrap_cert();
        let now = model::now_ms();

        let unexpired = ssl.expiry.map_or(false, |expiry| expiry > now);
        if unexpired && key_path.is_file() && cert_path.is_file() {
            return Ok(false);
        }

        let names: Vec<String> = BOOTSTRAP_NAMES.iter().map(|n| n.to_string()).collect();
        let issued = bootstrap_certificate(&names, self.settings.bootstrap_validity_days)?;
        save_bundle(&issued, &key_path, &cert_path)?;

        let ssl = SslInfo {
            key: Some(key_path.display().to_string()),
            cert: Some(cert_path.display().to_string()),
            expiry: Some(now + self.settings.bootstrap_validity_days * DAY_MS),
        };
        self.store.set_as(model::SSL, &ssl)?;
        info!(path = %cert_path.display(), "Bootstrap certificate generated");
        Ok(true)
    }

    /// rustls configuration serving the bootstrap certificate
    pub fn bootstrap_tls_config(&self) -> Result<Arc<rustls::ServerConfig>, CertError> {
        let certs = load_certs(&self.paths().bootstrap_cert())?;
        let key = load_key(&self.paths().bootstrap_key())?;

        let config = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| CertError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| CertError::Tls(e.to_string()))?;

        Ok(Arc::new(config))
    }

    /// Recorded expiry, read from the certificate file when only the paths were recorded
    fn recorded_expiry(&self, domain: &str, block: Option<&CertificateBlock>) -> Option<i64> {
        let block = block?;
        if block.expiry.is_some() {
            return block.expiry;
        }
        let data = std::fs::read(block.cert.as_deref()?).ok()?;
        let expiry = expiry_from_pem(&data)?;

        let updated = self.store.update(model::WEBSITES, |sites: &mut Websites| {
            if let Some(cert) = sites.get_mut(domain).and_then(|s| s.cert.as_mut()) {
                cert.expiry = Some(expiry);
            }
        });
        if let Err(e) = updated {
            warn!(domain, error = %e, "Failed to record certificate expiry");
        }
        Some(expiry)
    }

    /// On-demand renewal of a domain or one of its subdomains
    pub async fn renew(&self, name: &str) -> Result<(), CertError> {
        let name = name.trim().trim_end_matches('.').to_lowercase();
        if is_ip(&name) {
            return Err(CertError::IpAddress(name));
        }

        let sites = self.store.get_as::<Websites>(model::WEBSITES)?;
        let domain = sites
            .values()
            .find(|site| site.certificate_names().contains(&name))
            .or_else(|| {
                sites
                    .values()
                    .find(|site| name.ends_with(&format!(".{}", site.domain)))
            })
            .map(|site| site.domain.clone())
            .ok_or_else(|| CertError::UnknownDomain(name.clone()))?;

        self.renew_domain(&domain).await
    }

    pub async fn renew_command(&self, name: &str) -> CommandResponse {
        let result = self.renew(name).await;
        CommandResponse::from_result(result, format!("Certificate renewed for {}", name.trim()))
    }

    async fn renew_domain(&self, domain: &str) -> Result<(), CertError> {
        if is_ip(domain) {
            return Err(CertError::IpAddress(domain.to_string()));
        }
        if self.renewing.insert(domain.to_string(), ()).is_some() {
            return Err(CertError::InProgress(domain.to_string()));
        }
        let _renewing = Renewing {
            map: &self.renewing,
            domain: domain.to_string(),
        };

        let sites = self.store.get_as::<Websites>(model::WEBSITES)?;
        let names = sites
            .get(domain)
            .map(|site| site.certificate_names())
            .ok_or_else(|| CertError::UnknownDomain(domain.to_string()))?;

        let issued = self.issuer.issue(&names, self.dns.as_ref()).await?;

        let key_path = self.paths().domain_key(domain);
        let cert_path = self.paths().domain_cert(domain);
        save_bundle(&issued, &key_path, &cert_path)?;

        let block = CertificateBlock {
            key: Some(key_path.display().to_string()),
            cert: Some(cert_path.display().to_string()),
            expiry: Some(model::now_ms() + self.settings.validity_days * DAY_MS),
        };
        self.store.update(model::WEBSITES, |sites: &mut Websites| {
            if let Some(site) = sites.get_mut(domain) {
                site.cert = Some(block);
            }
        })?;

        info!(domain, names = ?names, "Certificate installed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{MemoryDns, RecordType};
    use crate::model::WebsiteRecord;
    use rsa::pkcs8::DecodePrivateKey;
    use rsa::traits::PublicKeyParts;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeIssuer {
        fail: bool,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl CertificateIssuer for FakeIssuer {
        async fn issue(
            &self,
            names: &[String],
            dns: &dyn DnsBackend,
        ) -> Result<IssuedCertificate, CertError> {
            self.calls.lock().push(names.to_vec());
            let record = challenge_record(&names[0], "token".to_string(), 100);
            dns.record(record.clone())?;
            dns.delete(&record)?;
            if self.fail {
                return Err(CertError::Acme("rejected".to_string()));
            }
            self_signed(names, 90)
        }
    }

    fn manager(dir: &TempDir, issuer: FakeIssuer) -> (CertificateManager<FakeIssuer>, Arc<ConfigStore>, Arc<MemoryDns>) {
        let store = ConfigStore::open(Paths::new(dir.path())).unwrap();
        let dns = Arc::new(MemoryDns::new());
        let manager = CertificateManager::new(
            Arc::clone(&store),
            Arc::clone(&dns) as Arc<dyn DnsBackend>,
            issuer,
            CertsConfig::default(),
        );
        (manager, store, dns)
    }

    fn add_site(store: &ConfigStore, domain: &str) {
        store
            .update(model::WEBSITES, |sites: &mut Websites| {
                let mut site = WebsiteRecord::new(domain, "/srv/site");
                site.subdomain = vec!["www".to_string(), "www".to_string()];
                sites.insert(domain.to_string(), site);
            })
            .unwrap();
    }

    fn site(store: &ConfigStore, domain: &str) -> WebsiteRecord {
        store.get_as::<Websites>(model::WEBSITES).unwrap()[domain].clone()
    }

    #[test]
    fn test_challenge_record_shape() {
        let record = challenge_record("example.com", "abc".to_string(), 100);
        assert_eq!(record.name, "_acme-challenge.example.com");
        assert_eq!(record.record_type, RecordType::Txt);
        assert_eq!(record.ttl, Some(100));
        assert!(record.unique);
    }

    #[test]
    fn test_self_signed_expiry() {
        let issued = self_signed(&["localhost".to_string()], 365).unwrap();
        let expiry = expiry_from_pem(issued.cert_pem.as_bytes()).unwrap();
        let expected = model::now_ms() + 365 * DAY_MS;
        assert!((expiry - expected).abs() < 2 * DAY_MS);
    }

    #[test]
    fn test_bootstrap_regenerated_when_missing_or_expired() {
        let dir = TempDir::new().unwrap();
        let (manager, store, _) = manager(&dir, FakeIssuer::default());

        assert!(manager.ensure_bootstrap().unwrap());
        let ssl: SslInfo = store.get_as(model::SSL).unwrap();
        let key_pem = std::fs::read_to_string(store.paths().bootstrap_key()).unwrap();
        let key = RsaPrivateKey::from_pkcs8_pem(&key_pem).unwrap();
        assert_eq!(key.size() * 8, 2048);
        let expiry = ssl.expiry.unwrap();
        assert!(expiry > model::now_ms() + 364 * DAY_MS);
        assert!(store.paths().bootstrap_cert().is_file());
        assert!(store.paths().bootstrap_key().is_file());

        assert!(!manager.ensure_bootstrap().unwrap());

        // Files are external state: a valid expiry does not cover a missing file
        std::fs::remove_file(store.paths().bootstrap_cert()).unwrap();
        assert!(manager.ensure_bootstrap().unwrap());

        store
            .set_as(
                model::SSL,
                &SslInfo {
                    expiry: Some(model::now_ms() - 1),
                    ..ssl
                },
            )
            .unwrap();
        assert!(manager.ensure_bootstrap().unwrap());
    }

    #[test]
    fn test_bootstrap_tls_config_loads() {
        let dir = TempDir::new().unwrap();
        let (manager, _, _) = manager(&dir, FakeIssuer::default());
        assert!(manager.bootstrap_tls_config().is_err());

        manager.ensure_bootstrap().unwrap();
        manager.bootstrap_tls_config().unwrap();
    }

    #[tokio::test]
    async fn test_check_issues_missing_certificate() {
        let dir = TempDir::new().unwrap();
        let (manager, store, dns) = manager(&dir, FakeIssuer::default());
        add_site(&store, "example.com");
        add_site(&store, "10.0.0.1");

        manager.check().await;

        let calls = manager.issuer.calls.lock().clone();
        assert_eq!(
            calls,
            vec![vec!["example.com".to_string(), "www.example.com".to_string()]]
        );
        assert!(dns.is_empty());

        let cert = site(&store, "example.com").cert.unwrap();
        let expiry = cert.expiry.unwrap();
        let expected = model::now_ms() + 90 * DAY_MS;
        assert!((expiry - expected).abs() < 60_000);
        assert!(Path::new(cert.cert.as_deref().unwrap()).is_file());
        assert!(site(&store, "10.0.0.1").cert.is_none());
        assert!(store.paths().bootstrap_cert().is_file());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(cert.key.as_deref().unwrap())
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        // Valid for 90 days: nothing to do on the next pass
        manager.check().await;
        assert_eq!(manager.issuer.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_renews_inside_window() {
        let dir = TempDir::new().unwrap();
        let (manager, store, _) = manager(&dir, FakeIssuer::default());
        add_site(&store, "example.com");
        manager.renew("example.com").await.unwrap();

        store
            .update(model::WEBSITES, |sites: &mut Websites| {
                let cert = sites["example.com"].cert.as_mut().unwrap();
                cert.expiry = Some(model::now_ms() + 29 * DAY_MS);
            })
            .unwrap();

        manager.check().await;
        assert_eq!(manager.issuer.calls.lock().len(), 2);
    }

    #[test]
    fn test_renewal_window_boundary() {
        let now = 1_700_000_000_000;
        assert!(renewal_due(None, now, 30));
        assert!(renewal_due(Some(now + 30 * DAY_MS - 1), now, 30));
        assert!(!renewal_due(Some(now + 30 * DAY_MS), now, 30));
        assert!(!renewal_due(Some(now + 60 * DAY_MS), now, 30));
        assert!(renewal_due(Some(now - DAY_MS), now, 30));
    }

    #[tokio::test]
    async fn test_recorded_expiry_outside_window_is_not_reissued() {
        let dir = TempDir::new().unwrap();
        let (manager, store, _) = manager(&dir, FakeIssuer::default());
        add_site(&store, "example.com");
        store
            .update(model::WEBSITES, |sites: &mut Websites| {
                sites["example.com"].cert = Some(CertificateBlock {
                    key: Some(dir.path().join("gone.key").display().to_string()),
                    cert: Some(dir.path().join("gone.crt").display().to_string()),
                    expiry: Some(model::now_ms() + 60 * DAY_MS),
                });
            })
            .unwrap();

        manager.check().await;
        assert!(manager.issuer.calls.lock().is_empty());

        store
            .update(model::WEBSITES, |sites: &mut Websites| {
                let cert = sites["example.com"].cert.as_mut().unwrap();
                cert.expiry = Some(model::now_ms() + 30 * DAY_MS + 60_000);
            })
            .unwrap();
        manager.check().await;
        assert!(manager.issuer.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failed_renewal_keeps_existing_certificate() {
        let dir = TempDir::new().unwrap();
        let (manager, store, _) = manager(
            &dir,
            FakeIssuer {
                fail: true,
                ..Default::default()
            },
        );
        add_site(&store, "example.com");
        let old = CertificateBlock {
            key: Some("/old/key".to_string()),
            cert: Some("/old/cert".to_string()),
            expiry: Some(model::now_ms() + DAY_MS),
        };
        store
            .update(model::WEBSITES, |sites: &mut Websites| {
                sites["example.com"].cert = Some(old.clone());
            })
            .unwrap();

        assert!(matches!(
            manager.renew("example.com").await,
            Err(CertError::Acme(_))
        ));
        assert_eq!(site(&store, "example.com").cert, Some(old));

        let response = manager.renew_command("example.com").await;
        assert!(!response.result);
    }

    #[tokio::test]
    async fn test_rejects_ip_and_resolves_subdomain() {
        let dir = TempDir::new().unwrap();
        let (manager, store, _) = manager(&dir, FakeIssuer::default());
        add_site(&store, "example.com");

        assert!(matches!(
            manager.renew("192.168.1.10").await,
            Err(CertError::IpAddress(_))
        ));
        assert!(manager.issuer.calls.lock().is_empty());

        assert!(matches!(
            manager.renew("unknown.org").await,
            Err(CertError::UnknownDomain(_))
        ));

        let response = manager.renew_command("www.example.com").await;
        assert!(response.result, "{}", response.message);
        assert!(site(&store, "example.com").cert.is_some());
    }

    #[tokio::test]
    async fn test_expiry_read_from_certificate_file() {
        let dir = TempDir::new().unwrap();
        let (manager, store, _) = manager(&dir, FakeIssuer::default());
        add_site(&store, "example.com");

        let issued = self_signed(&["example.com".to_string()], 200).unwrap();
        let key_path = dir.path().join("example.key");
        let cert_path = dir.path().join("example.crt");
        save_bundle(&issued, &key_path, &cert_path).unwrap();
        store
            .update(model::WEBSITES, |sites: &mut Websites| {
                sites["example.com"].cert = Some(CertificateBlock {
                    key: Some(key_path.display().to_string()),
                    cert: Some(cert_path.display().to_string()),
                    expiry: None,
                });
            })
            .unwrap();

        manager.check().await;

        let expiry = site(&store, "example.com").cert.unwrap().expiry.unwrap();
        assert!(expiry > model::now_ms() + 190 * DAY_MS);
        assert!(manager.issuer.calls.lock().is_empty());
    }
}

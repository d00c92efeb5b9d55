//! Certificate authority for on-demand TLS interception
//!
//! The proxy terminates TLS with leaf certificates minted per hostname and
//! signed by a root the test environment trusts. The root is supplied as
//! PEM (inline or file paths) or generated in memory; nothing is ever
//! written to disk.

use crate::error::{Error, Result};
use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
  KeyUsagePurpose, SanType,
};
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

/// Leaf validity period in days (1 year).
const LEAF_VALID_DAYS: i64 = 365;
/// Leaves are backdated by one day to absorb clock skew.
const LEAF_BACKDATE_DAYS: i64 = 1;
/// Substitute subject for hostnames the certificate machinery rejects.
const FALLBACK_WILDCARD: &str = "*.invalid";

type CertifiedPair = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

/// Root CA plus a per-hostname leaf cache.
pub struct CertificateAuthority {
  issuer: Issuer<'static, KeyPair>,
  ca_cert_der: CertificateDer<'static>,
  ca_cert_pem: String,
  serial: AtomicU64,
  cache: Cache<String, Arc<CertifiedPair>>,
}

impl CertificateAuthority {
  /// Build from PEM-encoded root certificate and private key.
  pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
    let key_pair = KeyPair::from_pem(key_pem)
      .map_err(|e| Error::certificate(format!("failed to parse CA key: {}", e)))?;

    let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
      .map_err(|e| Error::certificate(format!("failed to parse CA certificate: {}", e)))?;

    let ca_cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::certificate("no certificate found in CA PEM"))?
      .map_err(|e| Error::certificate(format!("failed to decode CA PEM: {}", e)))?;

    Ok(Self::assemble(issuer, ca_cert_der, cert_pem.to_string()))
  }

  /// Build from paths to PEM-encoded root certificate and key files.
  pub async fn from_files(cert_path: &Path, key_path: &Path) -> Result<Self> {
    let cert_pem = fs::read_to_string(cert_path).await.map_err(|e| {
      Error::certificate(format!("failed to read {}: {}", cert_path.display(), e))
    })?;
    let key_pem = fs::read_to_string(key_path)
      .await
      .map_err(|e| Error::certificate(format!("failed to read {}: {}", key_path.display(), e)))?;
    Self::from_pem(&cert_pem, &key_pem)
  }

  /// Generate a fresh self-signed root, held only in memory.
  pub fn generate() -> Result<Self> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Decoy Mock Proxy CA");
    dn.push(DnType::OrganizationName, "decoy");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(LEAF_BACKDATE_DAYS);
    params.not_after = now + Duration::days(3650);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate(format!("failed to generate CA key pair: {}", e)))?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate(format!("failed to self-sign CA: {}", e)))?;

    let cert_pem = cert.pem();
    let ca_cert_der = CertificateDer::from(cert.der().to_vec());
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::certificate(format!("failed to create issuer: {}", e)))?;

    Ok(Self::assemble(issuer, ca_cert_der, cert_pem))
  }

  fn assemble(
    issuer: Issuer<'static, KeyPair>,
    ca_cert_der: CertificateDer<'static>,
    ca_cert_pem: String,
  ) -> Self {
    Self {
      issuer,
      ca_cert_der,
      ca_cert_pem,
      // Random base plus a counter keeps serials unique per instance
      // without coordinating with any other instance.
      serial: AtomicU64::new(rand::thread_rng().gen::<u64>()),
      cache: Cache::builder().build(),
    }
  }

  /// The root certificate in PEM form, for installation in client trust
  /// stores.
  pub fn ca_cert_pem(&self) -> &str {
    &self.ca_cert_pem
  }

  /// Get or mint the leaf chain and key for `hostname`.
  ///
  /// Leaves live in an unbounded cache for the lifetime of the instance;
  /// mock proxies are test-lifetime objects.
  pub async fn cert_for(&self, hostname: &str) -> Result<CertifiedPair> {
    if let Some(cached) = self.cache.get(hostname).await {
      let (chain, key) = cached.as_ref();
      return Ok((chain.clone(), key.clone_key()));
    }

    let (chain, key) = self.mint_leaf(hostname)?;
    self
      .cache
      .insert(
        hostname.to_string(),
        Arc::new((chain.clone(), key.clone_key())),
      )
      .await;
    Ok((chain, key))
  }

  fn next_serial(&self) -> u64 {
    self.serial.fetch_add(1, Ordering::Relaxed)
  }

  fn mint_leaf(&self, hostname: &str) -> Result<CertifiedPair> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(self.next_serial().into());

    let (subject, sans) = subject_and_sans(hostname);
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, subject.as_str());
    params.distinguished_name = dn;
    params.subject_alt_names = sans;

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(LEAF_BACKDATE_DAYS);
    params.not_after = now + Duration::days(LEAF_VALID_DAYS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate(format!("failed to generate leaf key pair: {}", e)))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate(format!("failed to sign leaf for {}: {}", hostname, e)))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::certificate("failed to serialize leaf key"))?;

    // Chain order: [leaf, root].
    Ok((vec![cert_der, self.ca_cert_der.clone()], key_der))
  }
}

/// Pick the certificate subject and SANs for a requested hostname.
///
/// IP literals get an iPAddress SAN alongside a dNSName with the textual
/// form; some clients check one, some the other. A hostname the SAN
/// machinery rejects falls back to a wildcard for the reserved `.invalid`
/// domain rather than failing the handshake setup.
fn subject_and_sans(hostname: &str) -> (String, Vec<SanType>) {
  if let Ok(ip) = hostname.parse::<IpAddr>() {
    let mut sans = vec![SanType::IpAddress(ip)];
    if let Ok(dns_name) = hostname.try_into() {
      sans.push(SanType::DnsName(dns_name));
    }
    return (hostname.to_string(), sans);
  }

  match hostname.try_into() {
    Ok(dns_name) => (hostname.to_string(), vec![SanType::DnsName(dns_name)]),
    Err(_) => {
      tracing::warn!(
        "hostname {:?} not usable as a certificate subject, serving {}",
        hostname,
        FALLBACK_WILDCARD
      );
      let dns_name = FALLBACK_WILDCARD
        .try_into()
        .expect("static wildcard name is valid");
      (FALLBACK_WILDCARD.to_string(), vec![SanType::DnsName(dns_name)])
    }
  }
}

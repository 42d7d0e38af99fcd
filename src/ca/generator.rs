//! CA and leaf certificate generation using rcgen.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use time::{Duration, OffsetDateTime};
use tracing::debug;

/// The result type for CA operations.
pub type CaResult<T> = Result<T, CaError>;

#[derive(Debug, thiserror::Error)]
pub enum CaError {
    #[error("failed to generate key pair: {0}")]
    KeyGeneration(#[from] rcgen::Error),
    #[error("failed to create signing key: {0}")]
    SigningKey(#[source] rustls::Error),
    #[error("invalid DNS name: {0}")]
    InvalidDnsName(String),
}

/// Root CA used to sign intercepted-host certificates.
///
/// Generated fresh on creation with a 7-day validity window. Clients must
/// trust this certificate for interception to go unnoticed.
pub struct CaState {
    ca_cert_der: CertificateDer<'static>,
    ca_cert_pem: String,
    ca_key_pair: KeyPair,
    ca_params: CertificateParams,
}

impl CaState {
    /// Generates a new CA key pair and self-signed certificate.
    pub fn generate() -> CaResult<Self> {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "wiretap root CA");
        dn.push(DnType::OrganizationName, "wiretap");

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::minutes(5); // Small buffer for clock skew
        params.not_after = now + Duration::days(7);

        let key_pair = KeyPair::generate()?;
        let ca_cert = params.self_signed(&key_pair)?;

        let ca_cert_pem = ca_cert.pem();
        let ca_cert_der = CertificateDer::from(ca_cert.der().to_vec());

        debug!("generated root CA certificate");

        Ok(Self {
            ca_cert_der,
            ca_cert_pem,
            ca_key_pair: key_pair,
            ca_params: params,
        })
    }

    /// Returns the CA certificate in PEM format, for client trust stores.
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Returns the CA certificate in DER format.
    pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
        &self.ca_cert_der
    }

    /// Generates a leaf certificate for the given (possibly wildcard)
    /// subject name, signed by this CA.
    pub fn create_certificate(&self, name: &str) -> CaResult<CertifiedKey> {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, name);

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        let san = if let Ok(ip) = name.parse::<IpAddr>() {
            SanType::IpAddress(ip)
        } else {
            SanType::DnsName(
                name.try_into()
                    .map_err(|_| CaError::InvalidDnsName(name.to_string()))?,
            )
        };
        params.subject_alt_names = vec![san];
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::minutes(5);
        params.not_after = now + Duration::days(2);

        let leaf_key_pair = KeyPair::generate()?;
        let issuer = Issuer::from_params(&self.ca_params, &self.ca_key_pair);
        let leaf_cert = params.signed_by(&leaf_key_pair, &issuer)?;

        let cert_der = CertificateDer::from(leaf_cert.der().to_vec());
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key_pair.serialize_der()));

        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der)
            .map_err(CaError::SigningKey)?;

        debug!("minted leaf certificate for {}", name);

        Ok(CertifiedKey::new(vec![cert_der], signing_key))
    }
}

/// Replaces the leftmost label of a multi-label hostname with `*`.
///
/// Hosts with fewer than three labels, and IP literals, are used verbatim
/// so the resulting certificate still matches what the client asked for.
pub fn wildcard_name(host: &str) -> String {
    let host = host.to_ascii_lowercase();
    if host.parse::<IpAddr>().is_ok() {
        return host;
    }
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() >= 3 {
        format!("*.{}", labels[1..].join("."))
    } else {
        host
    }
}

/// Cache of minted leaf certificates, keyed by wildcard-normalized name.
///
/// Minting happens at most once per name: lookups that miss take the write
/// lock, re-check, and generate while holding it.
pub struct CertCache {
    ca: Arc<CaState>,
    cache: RwLock<HashMap<String, Arc<CertifiedKey>>>,
    minted: AtomicUsize,
}

impl CertCache {
    /// Creates a new certificate cache backed by the given CA.
    pub fn new(ca: Arc<CaState>) -> Self {
        Self {
            ca,
            cache: RwLock::new(HashMap::new()),
            minted: AtomicUsize::new(0),
        }
    }

    /// Gets or mints a certified key for the given subject name.
    pub fn get_or_create(&self, name: &str) -> CaResult<Arc<CertifiedKey>> {
        if let Ok(cache) = self.cache.read()
            && let Some(key) = cache.get(name)
        {
            return Ok(Arc::clone(key));
        }

        let mut cache = self
            .cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(key) = cache.get(name) {
            return Ok(Arc::clone(key));
        }

        let certified_key = Arc::new(self.ca.create_certificate(name)?);
        self.minted.fetch_add(1, Ordering::Relaxed);
        cache.insert(name.to_string(), Arc::clone(&certified_key));
        Ok(certified_key)
    }

    /// Number of certificates minted so far (cache misses).
    pub fn minted_count(&self) -> usize {
        self.minted.load(Ordering::Relaxed)
    }

    /// Returns a reference to the underlying CA state.
    pub fn ca(&self) -> &CaState {
        &self.ca
    }
}

//! Project-local certificate authority
//!
//! On first start the daemon generates a CA keypair and a self-signed CA
//! certificate under `.procsi/` and persists both with owner-only
//! permissions. On subsequent starts the persisted material is loaded
//! back. The CA signs short-lived leaf certificates for every host the
//! proxy terminates TLS for; leafs are cached for the daemon's lifetime.
//!
//! Clients (browsers, curl, the replay executor) trust `ca.crt`; the
//! private key never leaves the state directory.

use crate::error::{ProcsiError, Result};
use crate::project::ProjectLayout;
use anyhow::Context;
use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    SanType, SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

/// A minted leaf: the certificate chain (leaf first, CA second) and the
/// leaf private key, ready for a rustls server config.
#[derive(Clone)]
pub struct LeafMaterial {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: Arc<PrivateKeyDer<'static>>,
}

/// The project CA: persisted cert + key, plus a per-host leaf cache.
pub struct CaStore {
    ca_cert: Certificate,
    ca_key: KeyPair,
    ca_cert_pem: String,
    leaf_cache: Mutex<HashMap<String, LeafMaterial>>,
}

impl CaStore {
    /// Load the CA from disk, generating and persisting it on first start.
    ///
    /// Failure here is fatal; the daemon cannot terminate TLS without a CA.
    pub fn load_or_create(layout: &ProjectLayout) -> Result<Self> {
        let cert_path = layout.ca_cert_path();
        let key_path = layout.ca_key_path();

        if cert_path.exists() && key_path.exists() {
            Self::load(&cert_path, &key_path)
        } else {
            let store = Self::generate()?;
            store.persist(&cert_path, &key_path)?;
            tracing::info!(cert = %cert_path.display(), "Generated project CA");
            Ok(store)
        }
    }

    fn generate() -> Result<Self> {
        let ca_key = KeyPair::generate()
            .map_err(|e| ProcsiError::Ca(format!("Failed to generate CA key: {e}")))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        let short_id: u32 = rand::random();
        dn.push(DnType::CommonName, format!("Procsi Local CA {short_id:08x}"));
        dn.push(DnType::OrganizationName, "procsi");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.serial_number = Some(SerialNumber::from(rand::random::<u64>().to_be_bytes().to_vec()));
        params.not_before = rcgen::date_time_ymd(2025, 1, 1);
        params.not_after = rcgen::date_time_ymd(2035, 1, 1);

        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| ProcsiError::Ca(format!("Failed to self-sign CA certificate: {e}")))?;
        let ca_cert_pem = ca_cert.pem();

        Ok(Self {
            ca_cert,
            ca_key,
            ca_cert_pem,
            leaf_cache: Mutex::new(HashMap::new()),
        })
    }

    fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_pem = std::fs::read_to_string(cert_path)
            .with_context(|| format!("Failed to read {}", cert_path.display()))?;
        let key_pem = std::fs::read_to_string(key_path)
            .with_context(|| format!("Failed to read {}", key_path.display()))?;

        let ca_key = KeyPair::from_pem(&key_pem)
            .map_err(|e| ProcsiError::Ca(format!("Failed to parse CA key: {e}")))?;
        let params = CertificateParams::from_ca_cert_pem(&cert_pem)
            .map_err(|e| ProcsiError::Ca(format!("Failed to parse CA certificate: {e}")))?;
        // Re-signing with the persisted key reconstructs a signing-capable
        // certificate carrying the persisted issuer name.
        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| ProcsiError::Ca(format!("Failed to rebuild CA certificate: {e}")))?;

        Ok(Self {
            ca_cert,
            ca_key,
            ca_cert_pem: cert_pem,
            leaf_cache: Mutex::new(HashMap::new()),
        })
    }

    fn persist(&self, cert_path: &Path, key_path: &Path) -> Result<()> {
        std::fs::write(cert_path, &self.ca_cert_pem)
            .with_context(|| format!("Failed to write {}", cert_path.display()))?;
        std::fs::write(key_path, self.ca_key.serialize_pem())
            .with_context(|| format!("Failed to write {}", key_path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            for path in [cert_path, key_path] {
                let mut perms = std::fs::metadata(path)?.permissions();
                perms.set_mode(0o600);
                std::fs::set_permissions(path, perms)?;
            }
        }
        Ok(())
    }

    /// The CA certificate in PEM form, for trust-anchor consumers.
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Issue (or fetch from cache) a leaf certificate for `host`.
    ///
    /// `host` is a DNS name or an IP address literal as it appeared in the
    /// CONNECT target.
    pub fn mint_leaf(&self, host: &str) -> Result<LeafMaterial> {
        if let Some(hit) = self.leaf_cache.lock().get(host) {
            return Ok(hit.clone());
        }

        let leaf_key = KeyPair::generate()
            .map_err(|e| ProcsiError::Ca(format!("Failed to generate leaf key for {host}: {e}")))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.is_ca = IsCa::ExplicitNoCa;
        params.serial_number = Some(SerialNumber::from(rand::random::<u64>().to_be_bytes().to_vec()));
        params.not_before = rcgen::date_time_ymd(2025, 1, 1);
        params.not_after = rcgen::date_time_ymd(2035, 1, 1);
        params.subject_alt_names = vec![match host.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(
                host.to_string()
                    .try_into()
                    .map_err(|e| ProcsiError::Ca(format!("Invalid host {host}: {e}")))?,
            ),
        }];

        let leaf_cert = params
            .signed_by(&leaf_key, &self.ca_cert, &self.ca_key)
            .map_err(|e| ProcsiError::Ca(format!("Failed to sign leaf for {host}: {e}")))?;

        let material = LeafMaterial {
            chain: vec![leaf_cert.der().clone(), self.ca_cert.der().clone()],
            key: Arc::new(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
                leaf_key.serialize_der(),
            ))),
        };
        self.leaf_cache
            .lock()
            .insert(host.to_string(), material.clone());
        Ok(material)
    }
}

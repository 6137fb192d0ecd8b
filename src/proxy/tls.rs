//! TLS termination for CONNECT tunnels
//!
//! The external TLS engine boundary: given a CONNECT target host, hand
//! back a rustls server config backed by a CA-signed leaf certificate.
//! Server configs are cached per host alongside the CA's leaf cache.

use crate::ca::CaStore;
use crate::error::{ProcsiError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

/// Mints per-host rustls acceptors from the project CA.
pub struct TlsMitm {
    ca: Arc<CaStore>,
    configs: Mutex<HashMap<String, Arc<ServerConfig>>>,
}

impl TlsMitm {
    pub fn new(ca: Arc<CaStore>) -> Self {
        // Several crates in the graph enable different rustls crypto
        // backends; config builders need one process-wide default.
        let _ = tokio_rustls::rustls::crypto::aws_lc_rs::default_provider().install_default();
        Self {
            ca,
            configs: Mutex::new(HashMap::new()),
        }
    }

    /// A TLS acceptor presenting a CA-signed certificate for `host`.
    pub fn acceptor_for(&self, host: &str) -> Result<TlsAcceptor> {
        if let Some(config) = self.configs.lock().get(host) {
            return Ok(TlsAcceptor::from(config.clone()));
        }

        let leaf = self.ca.mint_leaf(host)?;
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(leaf.chain.clone(), leaf.key.clone_key())
            .map_err(|e| ProcsiError::Ca(format!("Failed to build TLS config for {host}: {e}")))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        let config = Arc::new(config);
        self.configs.lock().insert(host.to_string(), config.clone());
        Ok(TlsAcceptor::from(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::ProjectLayout;

    #[test]
    fn test_acceptor_is_cached_per_host() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = ProjectLayout::new(tmp.path());
        layout.ensure_dirs().unwrap();
        let ca = Arc::new(CaStore::load_or_create(&layout).unwrap());
        let mitm = TlsMitm::new(ca);

        mitm.acceptor_for("api.example.test").unwrap();
        mitm.acceptor_for("api.example.test").unwrap();
        assert_eq!(mitm.configs.lock().len(), 1);

        mitm.acceptor_for("other.example.test").unwrap();
        assert_eq!(mitm.configs.lock().len(), 2);
    }
}

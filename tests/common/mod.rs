//! Shared fixtures for integration tests
//!
//! Boots a full daemon in a temporary project root, optionally seeding
//! interceptor scripts, and hands back a reqwest client wired through
//! the proxy plus an RPC helper against the control socket.

use flate2::write::GzEncoder;
use flate2::Compression;
use procsi::{Config, Daemon, ProjectLayout};
use serde_json::Value;
use std::io::Write as _;
use tempfile::TempDir;

pub struct TestDaemon {
    pub daemon: Daemon,
    pub layout: ProjectLayout,
    pub client: reqwest::Client,
    // Held for its Drop; removes the project root.
    _tmp: TempDir,
}

impl TestDaemon {
    /// Boot a daemon with the given interceptor scripts in place.
    pub async fn start_with_scripts(scripts: &[(&str, &str)]) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let layout = ProjectLayout::new(tmp.path());

        if !scripts.is_empty() {
            let dir = layout.interceptors_dir();
            std::fs::create_dir_all(&dir).unwrap();
            for (name, source) in scripts {
                std::fs::write(dir.join(name), source).unwrap();
            }
        }

        let daemon = Daemon::start(layout.clone(), Config::default())
            .await
            .unwrap();

        let proxy = format!("http://127.0.0.1:{}", daemon.proxy_port());
        let client = reqwest::Client::builder()
            .proxy(reqwest::Proxy::http(&proxy).unwrap())
            .build()
            .unwrap();

        Self {
            daemon,
            layout,
            client,
            _tmp: tmp,
        }
    }

    #[allow(dead_code)]
    pub async fn start() -> Self {
        Self::start_with_scripts(&[]).await
    }

    /// RPC call against the daemon's control socket.
    pub async fn rpc(&self, method: &str, params: Value) -> Value {
        procsi::control::call(&self.layout.control_socket_path(), method, Some(params))
            .await
            .unwrap()
    }

    /// The newest captured request row, fully materialized.
    #[allow(dead_code)]
    pub async fn latest_request(&self) -> Value {
        let summaries = self.rpc("listRequestsSummary", serde_json::json!({})).await;
        let id = summaries[0]["id"].as_str().unwrap();
        self.rpc("getRequest", serde_json::json!({ "id": id })).await
    }

    pub async fn shutdown(self) {
        self.daemon.shutdown().await;
    }
}

#[allow(dead_code)]
pub fn gzip_bytes(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Decode a base64 body field from a `getRequest` result.
#[allow(dead_code)]
pub fn decode_body(value: &Value) -> Vec<u8> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    STANDARD.decode(value.as_str().unwrap()).unwrap()
}

//! Project layout resolution
//!
//! Every procsi daemon is scoped to a single project root. All runtime
//! state lives under `<root>/.procsi/`: the CA material, the request
//! database, the control socket, port and pid files, and the user's
//! interceptor scripts. This module resolves those paths in one place so
//! no other component hardcodes a file name.

use crate::error::Result;
use anyhow::Context;
use std::path::{Path, PathBuf};

/// Name of the state directory under the project root.
const STATE_DIR: &str = ".procsi";

/// On-disk layout for a single project.
#[derive(Debug, Clone)]
pub struct ProjectLayout {
    root: PathBuf,
    state_dir: PathBuf,
}

impl ProjectLayout {
    /// Create a layout rooted at `project_root`.
    pub fn new<P: Into<PathBuf>>(project_root: P) -> Self {
        let root = project_root.into();
        let state_dir = root.join(STATE_DIR);
        Self { root, state_dir }
    }

    /// Resolve the project root from the environment.
    ///
    /// `PROJECT_ROOT` wins when set; otherwise the current directory is
    /// the project.
    pub fn from_env() -> Result<Self> {
        let root = match std::env::var("PROJECT_ROOT") {
            Ok(v) if !v.is_empty() => PathBuf::from(v),
            _ => std::env::current_dir().context("Failed to resolve current directory")?,
        };
        Ok(Self::new(root))
    }

    /// The project root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The `.procsi/` state directory.
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Local CA certificate (PEM).
    pub fn ca_cert_path(&self) -> PathBuf {
        self.state_dir.join("ca.crt")
    }

    /// Local CA private key (PEM, 0600).
    pub fn ca_key_path(&self) -> PathBuf {
        self.state_dir.join("ca.key")
    }

    /// Request repository database.
    pub fn db_path(&self) -> PathBuf {
        self.state_dir.join("requests.db")
    }

    /// Control-server socket (0600).
    pub fn control_socket_path(&self) -> PathBuf {
        self.state_dir.join("control.sock")
    }

    /// File recording the port the proxy is currently bound to.
    pub fn proxy_port_path(&self) -> PathBuf {
        self.state_dir.join("proxy.port")
    }

    /// Hint file recording the last successfully bound port.
    pub fn preferred_port_path(&self) -> PathBuf {
        self.state_dir.join("preferred.port")
    }

    /// PID of the running daemon.
    pub fn pid_path(&self) -> PathBuf {
        self.state_dir.join("daemon.pid")
    }

    /// Optional YAML configuration file.
    pub fn config_path(&self) -> PathBuf {
        self.state_dir.join("config.yaml")
    }

    /// Directory of user interceptor scripts. Not auto-created; it is
    /// owned by the user.
    pub fn interceptors_dir(&self) -> PathBuf {
        self.state_dir.join("interceptors")
    }

    /// Create the state directory if it does not exist yet.
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.state_dir).with_context(|| {
            format!("Failed to create state directory {}", self.state_dir.display())
        })?;
        Ok(())
    }
}

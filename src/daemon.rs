//! Daemon supervisor
//!
//! Boots the subsystems in dependency order (layout, CA, repository,
//! event log, loader, runner, proxy, control server), writes the pid and
//! port files, and tears everything down on SIGTERM/SIGINT: control
//! server first, then the proxy, the loader, the replay tracker, and
//! finally database compaction. Shutdown is idempotent.

use crate::ca::CaStore;
use crate::config::Config;
use crate::control::{ControlServer, ControlState};
use crate::error::{ProcsiError, Result};
use crate::events::EventLog;
use crate::interceptors::{InterceptorLoader, InterceptorRunner};
use crate::project::ProjectLayout;
use crate::proxy::{ProxyEngine, DAEMON_SESSION};
use crate::replay::{ReplayExecutor, ReplayTracker};
use crate::repo::RequestRepository;
use anyhow::Context;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A running daemon and its subsystem handles.
pub struct Daemon {
    layout: ProjectLayout,
    repo: Arc<RequestRepository>,
    loader: Arc<InterceptorLoader>,
    runner: Arc<InterceptorRunner>,
    replays: Arc<ReplayTracker>,
    proxy: Arc<ProxyEngine>,
    control: ControlServer,
    proxy_task: tokio::task::JoinHandle<()>,
    control_task: tokio::task::JoinHandle<()>,
    proxy_port: u16,
    stopped: AtomicBool,
}

impl Daemon {
    /// Boot every subsystem. Any failure here is fatal; nothing is left
    /// half-started except files the next boot overwrites.
    pub async fn start(layout: ProjectLayout, config: Config) -> Result<Self> {
        layout.ensure_dirs()?;

        let ca = Arc::new(CaStore::load_or_create(&layout)?);

        let repo = Arc::new(RequestRepository::open(
            &layout.db_path(),
            config.repository.max_stored_requests,
        )?);
        repo.ensure_session(DAEMON_SESSION, Some("daemon"), std::process::id(), None)?;

        let events = Arc::new(EventLog::new(config.events.capacity));

        let loader = Arc::new(InterceptorLoader::new(
            layout.interceptors_dir(),
            events.clone(),
        ));
        loader.reload()?;
        loader.start_watching()?;

        let runner = Arc::new(InterceptorRunner::new(
            repo.clone(),
            events.clone(),
            Duration::from_millis(config.interceptors.match_timeout_ms),
            Duration::from_millis(config.interceptors.handler_timeout_ms),
        ));

        let replays = Arc::new(ReplayTracker::new());
        replays.start_sweeper();

        let preferred_port = if config.proxy.port != 0 {
            config.proxy.port
        } else {
            read_port_hint(&layout).unwrap_or(0)
        };
        let (listener, proxy_port) = ProxyEngine::bind(preferred_port).await?;
        let proxy = Arc::new(ProxyEngine::new(
            repo.clone(),
            runner.clone(),
            loader.clone(),
            replays.clone(),
            ca.clone(),
            config.proxy.max_body_size,
        )?);
        let proxy_task = proxy.clone().spawn(listener);
        tracing::info!(port = proxy_port, "Proxy listening");

        write_runtime_files(&layout, proxy_port)?;

        let replay = Arc::new(ReplayExecutor::new(
            replays.clone(),
            proxy_port,
            ca.ca_cert_pem().to_string(),
        ));
        let state = Arc::new(ControlState {
            repo: repo.clone(),
            events,
            loader: loader.clone(),
            replay,
            proxy_port,
            started_at: Utc::now().timestamp_millis(),
        });
        let control = ControlServer::new(state, layout.control_socket_path());
        let control_task = control.spawn()?;

        Ok(Self {
            layout,
            repo,
            loader,
            runner,
            replays,
            proxy,
            control,
            proxy_task,
            control_task,
            proxy_port,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn proxy_port(&self) -> u16 {
        self.proxy_port
    }

    /// Block until SIGTERM or SIGINT.
    pub async fn wait_for_signal(&self) {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(stream) => stream,
                Err(error) => {
                    tracing::error!(%error, "Failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
                result = tokio::signal::ctrl_c() => {
                    if result.is_ok() {
                        tracing::info!("Received SIGINT");
                    }
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
    }

    /// Graceful teardown. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Shutting down");

        self.control.shutdown();
        self.control_task.abort();

        self.proxy.shutdown();
        self.proxy_task.abort();
        self.runner.cleanup_all();

        self.loader.close();
        self.replays.close();

        if let Err(error) = self.repo.compact() {
            tracing::warn!(%error, "Database compaction failed");
        }

        for path in [self.layout.pid_path(), self.layout.proxy_port_path()] {
            let _ = std::fs::remove_file(path);
        }
        tracing::info!("Shutdown complete");
    }
}

fn read_port_hint(layout: &ProjectLayout) -> Option<u16> {
    std::fs::read_to_string(layout.preferred_port_path())
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
}

fn write_runtime_files(layout: &ProjectLayout, proxy_port: u16) -> Result<()> {
    std::fs::write(layout.proxy_port_path(), format!("{proxy_port}\n"))
        .context("Failed to write proxy.port")?;
    // The hint survives shutdown so the next start reuses the port.
    std::fs::write(layout.preferred_port_path(), format!("{proxy_port}\n"))
        .context("Failed to write preferred.port")?;
    std::fs::write(layout.pid_path(), format!("{}\n", std::process::id()))
        .context("Failed to write daemon.pid")?;
    Ok(())
}

/// Read the pid of a running daemon, if any.
pub fn read_pid(layout: &ProjectLayout) -> Result<u32> {
    let raw = std::fs::read_to_string(layout.pid_path())
        .map_err(|_| ProcsiError::Daemon("daemon is not running (no pid file)".to_string()))?;
    raw.trim()
        .parse()
        .map_err(|_| ProcsiError::Daemon("corrupt pid file".to_string()).into())
}

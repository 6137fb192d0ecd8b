//! Procsi - per-project HTTP(S) capture and manipulation daemon library
//!
//! This library provides the daemon's runtime core: the interception
//! pipeline, the scriptable interceptor runtime, the request repository,
//! the control-plane RPC server, and the replay subsystem.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `project`: on-disk layout under `<root>/.procsi/`
//! - `ca`: the project-local certificate authority
//! - `repo`: SQLite-backed store of sessions, captures, and bookmarks
//! - `events`: ring buffer of interceptor-runtime events
//! - `interceptors`: script loader, handler runner, and script API
//! - `proxy`: the HTTP(S) terminating proxy engine
//! - `replay`: replay tracker and executor
//! - `control`: newline-delimited JSON-RPC over a unix socket
//! - `daemon`: the supervisor wiring it all together
//! - `config`, `error`, `cli`: the usual ambient pieces
//!
//! # Example
//!
//! ```no_run
//! use procsi::{Config, Daemon, ProjectLayout};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let layout = ProjectLayout::from_env()?;
//!     let config = Config::load(&layout.config_path())?;
//!     let daemon = Daemon::start(layout, config).await?;
//!     daemon.wait_for_signal().await;
//!     daemon.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod ca;
pub mod cli;
pub mod config;
pub mod control;
pub mod daemon;
pub mod error;
pub mod events;
pub mod interceptors;
pub mod project;
pub mod proxy;
pub mod replay;
pub mod repo;

// Re-export commonly used types
pub use config::Config;
pub use daemon::Daemon;
pub use error::{ProcsiError, Result};
pub use project::ProjectLayout;

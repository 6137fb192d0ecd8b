//! Procsi - per-project HTTP(S) capture and manipulation daemon
//!
//! Main entry point: parses the CLI, initializes tracing, and runs the
//! requested command.

use anyhow::Result;
use colored::Colorize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use procsi::cli::{Cli, Commands};
use procsi::config::Config;
use procsi::daemon::{self, Daemon};
use procsi::project::ProjectLayout;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();
    init_tracing(cli.verbose);

    let layout = match &cli.project_root {
        Some(root) => ProjectLayout::new(root.clone()),
        None => ProjectLayout::from_env()?,
    };

    match cli.command {
        Commands::Start { port } => {
            let mut config = Config::load(&layout.config_path())?;
            if port != 0 {
                config.proxy.port = port;
            }
            tracing::info!(root = %layout.root().display(), "Starting daemon");

            let daemon = Daemon::start(layout, config).await?;
            println!(
                "{} proxy on 127.0.0.1:{}",
                "procsi".green().bold(),
                daemon.proxy_port()
            );
            daemon.wait_for_signal().await;
            daemon.shutdown().await;
            Ok(())
        }
        Commands::Status => {
            let status =
                procsi::control::call(&layout.control_socket_path(), "status", None).await?;
            println!("{} {}", "procsi".green().bold(), "running".green());
            println!("  pid:        {}", status["pid"]);
            println!("  proxy port: {}", status["proxyPort"]);
            println!("  version:    {}", status["version"].as_str().unwrap_or("?"));
            let events = &status["events"];
            let errors = events["error"].to_string();
            println!(
                "  events:     {} info, {} warn, {} error",
                events["info"],
                events["warn"],
                if events["error"].as_u64().unwrap_or(0) > 0 {
                    errors.as_str().red().to_string()
                } else {
                    errors
                }
            );
            Ok(())
        }
        Commands::Stop => {
            let pid = daemon::read_pid(&layout)?;
            #[cfg(unix)]
            {
                let result = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
                if result != 0 {
                    anyhow::bail!("failed to signal pid {pid}");
                }
            }
            println!("{} sent SIGTERM to pid {}", "procsi".green().bold(), pid);
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("PROCSI_LOG_LEVEL")
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

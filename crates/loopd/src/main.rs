//! loopd - Agent Loop Orchestrator Daemon
//!
//! Main entry point for the daemon binary.

use clap::Parser;
use loopd::{Daemon, DaemonConfig};
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};

/// Orchestrator daemon process. Holds the single-instance PID lock, the
/// SQLite state database, and the local HTTP control plane that `loopctl`
/// talks to.
#[derive(Parser)]
#[command(name = "loopd")]
#[command(about = "Code-orchestration daemon: scheduler, worker loop, merge serializer")]
#[command(version)]
struct Cli {
    /// Path to the SQLite state database.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Path to the single-instance PID lock file.
    #[arg(long)]
    pid_path: Option<PathBuf>,

    /// Port for the local HTTP control plane.
    #[arg(long)]
    port: Option<u16>,

    /// Maximum number of concurrently-managed runs.
    #[arg(long)]
    max_jobs: Option<usize>,

    /// Seconds to wait for active jobs to finish during graceful shutdown.
    #[arg(long)]
    shutdown_timeout_sec: Option<u32>,
}

impl Cli {
    fn into_daemon_config(self) -> DaemonConfig {
        let mut config = DaemonConfig::default();
        if let Some(db_path) = self.db_path {
            config.db_path = db_path;
        }
        if let Some(pid_path) = self.pid_path {
            config.pid_path = pid_path;
        }
        if let Some(port) = self.port {
            config.listen_port = port;
        }
        if let Some(max_jobs) = self.max_jobs {
            config.max_jobs = max_jobs;
        }
        if let Some(shutdown_timeout_sec) = self.shutdown_timeout_sec {
            config.shutdown_timeout_sec = shutdown_timeout_sec;
        }
        config
    }
}

fn main() {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Cli::parse().into_daemon_config();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    runtime.block_on(async {
        match Daemon::new(config).await {
            Ok(daemon) => {
                let daemon_ref = &daemon;
                tokio::select! {
                    result = daemon.run() => {
                        if let Err(e) = result {
                            error!("daemon error: {}", e);
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("received SIGINT");
                        daemon_ref.shutdown();
                    }
                }
            }
            Err(e) => {
                error!("failed to initialize daemon: {}", e);
                std::process::exit(1);
            }
        }
    });
}

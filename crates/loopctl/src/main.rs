//! loopctl - CLI client for loopd
//!
//! Local control plane client for the orchestrator daemon: start a run,
//! list and inspect runs, stop one, watch its event stream, or request the
//! daemon's own shutdown.

mod client;
mod render;

use clap::{Parser, Subcommand};
use client::{Client, ClientError, StartJobRequest};
use loop_core::Config;
use std::path::PathBuf;

/// CLI client for the loopd orchestrator daemon.
#[derive(Parser)]
#[command(name = "loopctl")]
#[command(about = "Control plane for loopd, the agent-loop orchestrator daemon")]
#[command(version)]
struct Cli {
    /// Daemon address.
    #[arg(long, global = true, env = "LOOPD_ADDR", default_value = "http://127.0.0.1:7700")]
    addr: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Discover units under a specs directory and start a run.
    Start {
        /// Root of the target repository.
        workspace_root: PathBuf,
        /// Directory to walk for unit/task spec files.
        specs_dir: PathBuf,
        /// Config file overriding scheduler/worker/merge-queue defaults.
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// List every run the daemon's database knows about.
    List,

    /// Show a run's status and its units.
    Status {
        run_id: String,
    },

    /// Stop a running run.
    Stop {
        run_id: String,
    },

    /// Stream a run's event log until it reaches a terminal status.
    Watch {
        run_id: String,
    },

    /// Request a graceful daemon shutdown.
    Shutdown,

    /// Probe the daemon's health endpoint.
    Health,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let client = Client::new(&cli.addr);

    let requires_daemon = !matches!(cli.command, Command::Health);
    if requires_daemon {
        if let Err(e) = client.wait_for_ready().await {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }

    let result = match cli.command {
        Command::Start { workspace_root, specs_dir, config } => run_start(&client, workspace_root, specs_dir, config).await,
        Command::List => run_list(&client).await,
        Command::Status { run_id } => run_status(&client, &run_id).await,
        Command::Stop { run_id } => run_stop(&client, &run_id).await,
        Command::Watch { run_id } => run_watch(&client, &run_id).await,
        Command::Shutdown => run_shutdown(&client).await,
        Command::Health => run_health(&client).await,
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run_start(
    client: &Client,
    workspace_root: PathBuf,
    specs_dir: PathBuf,
    config_path: Option<PathBuf>,
) -> Result<(), ClientError> {
    let config = match config_path {
        Some(path) => Some(Config::from_file(&path).map_err(|e| ClientError::IoError(e.to_string()))?),
        None => None,
    };

    let req = StartJobRequest {
        workspace_root: workspace_root.to_string_lossy().to_string(),
        specs_dir: specs_dir.to_string_lossy().to_string(),
        config,
    };

    let run = client.start_job(req).await?;
    render::print_run_created(&run);
    Ok(())
}

async fn run_list(client: &Client) -> Result<(), ClientError> {
    let runs = client.list_jobs().await?;
    render::print_run_list(&runs);
    Ok(())
}

async fn run_status(client: &Client, run_id: &str) -> Result<(), ClientError> {
    let status = client.get_job_status(run_id).await?;
    render::print_run_details(&status.run, &status.units);
    Ok(())
}

async fn run_stop(client: &Client, run_id: &str) -> Result<(), ClientError> {
    client.stop_job(run_id).await?;
    println!("Run {run_id} stopped");
    Ok(())
}

async fn run_watch(client: &Client, run_id: &str) -> Result<(), ClientError> {
    client.watch_job(run_id).await
}

async fn run_shutdown(client: &Client) -> Result<(), ClientError> {
    client.shutdown().await?;
    println!("Shutdown requested");
    Ok(())
}

async fn run_health(client: &Client) -> Result<(), ClientError> {
    match client.check_health().await {
        Ok(true) => {
            println!("daemon at {} is healthy", client.addr());
            Ok(())
        }
        Ok(false) => {
            eprintln!("daemon at {} responded but reported unhealthy", client.addr());
            std::process::exit(1);
        }
        Err(err) => Err(err),
    }
}

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use keepd::core::{BackupOrchestrator, DeviceSnapshot};
use keepd::rpc::{RpcClient, RpcServer};
use keepd::{adapters, config, context, logging};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "keepd")]
#[command(about = "Removable drive trust and backup daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon
    Daemon(ServerArgs),
    /// Show trusted drives, runs and capabilities
    Status,
    /// List block devices as the daemon sees them
    Devices,
    /// Re-probe host tools and the backup engine
    Preflight,
    /// Print the effective configuration
    Config,
}

#[derive(Args, Serialize)]
struct ServerArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    state_dir: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    engine_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    rpc_bind: Option<SocketAddr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    json_logs: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    simulation: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.command {
        Commands::Daemon(args) => config::AppConfig::new(Some(args))?,
        _ => config::AppConfig::new(None::<&ServerArgs>)?,
    };

    match &cli.command {
        Commands::Daemon(_) => run_daemon(config).await.context("Failed to start daemon")?,
        Commands::Status => run_status(config.rpc_bind)
            .await
            .context("Failed to check status of daemon")?,
        Commands::Devices => run_devices(config.rpc_bind)
            .await
            .context("Failed to list devices")?,
        Commands::Preflight => print_call(config.rpc_bind, "preflight")
            .await
            .context("Failed to run preflight")?,
        Commands::Config => print!("{}", config.to_toml()?),
    }

    Ok(())
}

async fn run_daemon(config: config::AppConfig) -> Result<()> {
    logging::init(logging::LogConfig {
        json: config.json_logs,
        verbose: config.verbose,
    });

    std::fs::create_dir_all(&config.state_dir)
        .with_context(|| format!("Failed to create {}", config.state_dir.display()))?;
    let adapter = adapters::get_adapter(config.simulation, &config.state_dir)?;
    let ctx = context::AppContext::new(config, adapter)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        state_dir = %ctx.config.state_dir.display(),
        simulation = ctx.config.simulation,
        "keepd starting"
    );

    ctx.devices.refresh().await;
    let caps = ctx.probe.refresh().await;
    if !caps.engine {
        error!("restic not found; backups are unavailable until it is installed");
    }

    let shutdown = CancellationToken::new();
    let backups = Arc::new(BackupOrchestrator::new(ctx.clone()));

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(
        ctx.devices.clone().run(ctx.config.poll_interval(), shutdown.clone()),
    ));
    tasks.push(tokio::spawn(
        ctx.probe.clone().run(ctx.config.probe_interval(), shutdown.clone()),
    ));
    tasks.push(tokio::spawn(backups.clone().run_reconciler(shutdown.clone())));

    let server = RpcServer::bind(ctx.clone(), backups, ctx.config.rpc_bind).await?;
    let serve = server.serve(shutdown.clone());

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
        }
        signal.cancel();
    });

    let result = serve.await;
    shutdown.cancel();
    for task in tasks {
        let _ = task.await;
    }
    info!("keepd stopped");
    result
}

async fn run_status(addr: SocketAddr) -> Result<()> {
    let status: Value = RpcClient::new(addr).call_no_params("daemon.status").await?;

    println!("keepd {} (up {}s)", status["version"].as_str().unwrap_or("?"), status["uptime_secs"]);
    let drives = status["trusted_drives"].as_array().cloned().unwrap_or_default();
    if drives.is_empty() {
        println!("No trusted drives.");
    }
    for drive in drives {
        let id = drive["drive_id"].as_str().unwrap_or_default();
        let state = if status["running_drive_ids"]
            .as_array()
            .is_some_and(|ids| ids.iter().any(|v| v.as_str() == Some(id)))
        {
            "running"
        } else if drive["is_connected"].as_bool().unwrap_or(false) {
            "connected"
        } else {
            "offline"
        };
        let last = status["runs"][id]["last_run"]["status"].as_str().unwrap_or("never");
        println!(
            "  {:<24} {:<10} last run: {}",
            drive["label"].as_str().unwrap_or_default(),
            state,
            last
        );
    }
    Ok(())
}

async fn run_devices(addr: SocketAddr) -> Result<()> {
    let snapshot: DeviceSnapshot = RpcClient::new(addr)
        .call("devices.list", Some(serde_json::json!({ "refresh": true })))
        .await?;
    for device in &snapshot.devices {
        println!(
            "{} {} {}{}",
            device.path.display(),
            device.model.as_deref().unwrap_or("-"),
            device.size,
            if device.removable { " removable" } else { "" }
        );
        for p in &device.partitions {
            println!(
                "  {} {} {}",
                p.path.display(),
                p.fstype.as_deref().unwrap_or("unformatted"),
                p.primary_mount()
                    .map(|m| m.display().to_string())
                    .unwrap_or_default()
            );
        }
    }
    Ok(())
}

async fn print_call(addr: SocketAddr, method: &str) -> Result<()> {
    let result: Value = RpcClient::new(addr).call_no_params(method).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

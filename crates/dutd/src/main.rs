//! dutd - DUT provisioning worker daemon
//!
//! Owns one device-under-test for the lifetime of the process.
//!
//! Usage:
//!   dutd [--config dutd.toml] [--kind testbot] [serve]
//!   dutd [--config dutd.toml] flash <IMAGE>
//!
//! Without a config file the TestBot defaults are used.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dut_core::{FlashJob, FlashSource, WorkerCapability};
use dut_worker::{Collaborators, DaemonConfig, Worker};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "dutd")]
#[command(author, version, about = "DUT provisioning worker daemon")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, env = "DUTD_CONFIG")]
    config: Option<PathBuf>,

    /// Worker kind, overriding the config file
    #[arg(short, long)]
    kind: Option<String>,

    /// Storage device override, replacing the board default
    #[arg(long)]
    disk: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Set the worker up and hold the DUT until interrupted (default)
    Serve,

    /// Set the worker up, flash an image onto the DUT storage and tear down
    Flash {
        /// Raw or gzip-compressed disk image
        image: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "dutd=info,dut_testbot=debug,dut_core=info,dut_worker=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    tracing::info!("Starting dutd (DUT provisioning worker)");

    let mut config = match cli.config {
        Some(ref path) => {
            tracing::info!("Loading config from: {}", path.display());
            DaemonConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?
        }
        None => {
            tracing::info!("No config file provided, using defaults");
            DaemonConfig::default()
        }
    };
    if let Some(kind) = cli.kind {
        config.worker.kind = kind;
    }
    if let Some(disk) = cli.disk {
        config.worker.disk = Some(disk);
    }

    let worker = Worker::from_config(&config, Collaborators::default())
        .context("Failed to construct worker")?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(&worker).await,
        Commands::Flash { image } => flash(&worker, image).await,
    }
}

async fn serve(worker: &Worker) -> Result<()> {
    worker.setup().await.context("Worker setup failed")?;
    if let Some(status) = worker.status() {
        tracing::info!(state = %status.state, disk = %status.disk.display(), "Worker ready");
    }

    shutdown_signal().await;
    tracing::info!("Shutting down");

    worker.teardown().await.context("Teardown failed")?;
    Ok(())
}

async fn flash(worker: &Worker, image: PathBuf) -> Result<()> {
    let file = tokio::fs::File::open(&image)
        .await
        .with_context(|| format!("Failed to open image {}", image.display()))?;
    let size = file.metadata().await?.len();
    let source = FlashSource::from_reader(file).with_size_hint(size);
    let (job, mut progress) = FlashJob::new(source);

    worker.setup().await.context("Worker setup failed")?;

    let reporter = tokio::spawn(async move {
        while let Some(event) = progress.next().await {
            match event.percent() {
                Some(percent) => tracing::info!(
                    destination = %event.destination,
                    phase = %event.phase,
                    "{:.1}%",
                    percent
                ),
                None => tracing::info!(
                    destination = %event.destination,
                    phase = %event.phase,
                    bytes = event.bytes_done,
                    "Progress"
                ),
            }
        }
    });

    let result = worker.flash(job).await;
    let _ = reporter.await;

    if let Err(e) = worker.teardown().await {
        tracing::warn!(error = %e, "Teardown after flash failed");
    }
    result.with_context(|| format!("Flashing {} failed", image.display()))?;

    tracing::info!(image = %image.display(), "Image flashed");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => tracing::warn!(error = %e, "Cannot listen for SIGTERM"),
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}

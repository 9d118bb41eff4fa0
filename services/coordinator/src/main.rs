//! Coordinator Service
//!
//! The distinguished process of a weft instance: claims the PID file,
//! creates the shared-memory page pools, binds the coordination endpoint,
//! and serves the strand registry until told to stop. Strands refuse to
//! serve traffic until this process has let them through the startup
//! barrier, so a failure here keeps the instance down rather than half-up.

use anyhow::{Context, Result};
use clap::Parser;
use config::InstanceConfig;
use ipc::{Coordinator, CoordinatorConfig, MessengerConfig, PidFile};
use pagepool::{PagePool, PoolId};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "coordinator", about = "weft instance coordinator")]
struct Args {
    /// Configuration file (TOML); defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured socket directory
    #[arg(long)]
    socket_dir: Option<PathBuf>,

    /// Override the configured worker count
    #[arg(long)]
    workers: Option<u32>,

    /// Override the configured disk-process count
    #[arg(long)]
    diskers: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut instance = InstanceConfig::load(args.config.as_deref())?;
    if let Some(dir) = args.socket_dir {
        instance.socket_dir = dir;
    }
    if let Some(workers) = args.workers {
        instance.workers = workers;
    }
    if let Some(diskers) = args.diskers {
        instance.diskers = diskers;
    }

    if let Err(e) = run(instance).await {
        error!(error = %e, "coordinator failed");
        return Err(e);
    }
    Ok(())
}

async fn run(instance: InstanceConfig) -> Result<()> {
    std::fs::create_dir_all(&instance.socket_dir)
        .with_context(|| format!("creating {}", instance.socket_dir.display()))?;
    if let Some(parent) = instance.pid_file.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    // Refuse to double-start before any socket or segment is touched.
    let _pid_file = PidFile::acquire(&instance.pid_file)?;

    let _pools = create_pools(&instance)?;

    let coordinator_config = CoordinatorConfig {
        socket_dir: instance.socket_dir.clone(),
        cohort: instance.cohort(),
        messenger: MessengerConfig {
            retries: instance.messenger.retries,
            retry_delay: Duration::from_millis(instance.messenger.retry_delay_ms),
            send_deadline: Duration::from_millis(instance.messenger.send_deadline_ms),
        },
    };
    let mut coordinator = Coordinator::bind(coordinator_config)?;

    let mut ready = coordinator.ready();
    tokio::spawn(async move {
        if ready.wait_for(|ready| *ready).await.is_ok() {
            info!("every strand completed startup; instance is ready");
        }
    });

    tokio::select! {
        result = coordinator.run() => result?,
        signal = shutdown_signal() => info!(%signal, "shutting down"),
    }

    info!(
        ready = coordinator.registry().is_ready(),
        barrier_crossed = coordinator.registry().crossed(),
        "coordinator exiting"
    );
    Ok(())
}

/// Create every configured page pool; segments live until instance shutdown
fn create_pools(instance: &InstanceConfig) -> Result<Vec<PagePool>> {
    if instance.pools.is_empty() {
        return Ok(Vec::new());
    }
    std::fs::create_dir_all(&instance.shm_dir)
        .with_context(|| format!("creating {}", instance.shm_dir.display()))?;

    instance
        .pools
        .iter()
        .enumerate()
        .map(|(index, pool)| {
            let path = instance.shm_dir.join(format!("{}.shm", pool.name));
            PagePool::create(&path, PoolId(index as u32 + 1), pool.capacity, pool.page_size)
                .with_context(|| format!("creating page pool {}", pool.name))
        })
        .collect()
}

async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    }
}

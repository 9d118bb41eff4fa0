//! Shared fixtures for the cohort integration tests

use config::InstanceConfig;
use ipc::{
    AgentConfig, Coordinator, CoordinatorConfig, MessengerConfig, StartupLedger, StrandAgent,
};
use std::path::Path;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use wire::StrandCoord;

/// Retry/deadline settings tightened for test turnaround
pub fn fast_messenger() -> MessengerConfig {
    MessengerConfig {
        retries: 5,
        retry_delay: Duration::from_millis(10),
        send_deadline: Duration::from_millis(500),
    }
}

/// An instance configuration rooted in a per-test directory
pub fn test_instance(dir: &Path, workers: u32, diskers: u32) -> InstanceConfig {
    InstanceConfig {
        socket_dir: dir.join("sockets"),
        pid_file: dir.join("coordinator.pid"),
        shm_dir: dir.join("shm"),
        workers,
        diskers,
        ..InstanceConfig::default()
    }
}

/// Bind a Coordinator for the instance and serve it on a background task.
/// Returns the readiness latch observer alongside the serving task.
pub fn start_coordinator(
    instance: &InstanceConfig,
) -> (watch::Receiver<bool>, JoinHandle<ipc::Result<()>>) {
    std::fs::create_dir_all(&instance.socket_dir).unwrap();
    let mut coordinator = Coordinator::bind(CoordinatorConfig {
        socket_dir: instance.socket_dir.clone(),
        cohort: instance.cohort(),
        messenger: fast_messenger(),
    })
    .expect("coordinator should bind");

    let ready = coordinator.ready();
    let serving = tokio::spawn(async move { coordinator.run().await });
    (ready, serving)
}

/// Bind one strand agent with its own startup ledger
pub fn start_strand(instance: &InstanceConfig, kid: u32, tag: Option<&str>) -> StrandAgent {
    let ledger = StartupLedger::new(Duration::from_millis(10));
    let config = AgentConfig {
        socket_dir: instance.socket_dir.clone(),
        registration_timeout: Duration::from_secs(2),
        messenger: fast_messenger(),
    };
    StrandAgent::bind(StrandCoord::new(kid, tag.map(String::from)), config, ledger)
        .expect("strand endpoint should bind")
}

//! Instance Configuration
//!
//! One configuration type shared by the Coordinator binary, strand runners,
//! and tests. Values load from an optional TOML file with `WEFT_`-prefixed
//! environment overrides layered on top; every field has a default so an
//! empty configuration is a working single-box instance.

use anyhow::{Context, Result};
use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Whole-instance configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Directory holding every coordination endpoint
    pub socket_dir: PathBuf,

    /// The Coordinator's PID file
    pub pid_file: PathBuf,

    /// Directory holding shared-memory pool segments
    pub shm_dir: PathBuf,

    /// Worker strands (kid ids start at 1)
    pub workers: u32,

    /// Disk-process strands (kid ids continue after the workers)
    pub diskers: u32,

    /// Registration acknowledgment deadline, in milliseconds; fatal when
    /// exceeded
    pub registration_timeout_ms: u64,

    /// Startup-ledger debounce tick, in milliseconds
    pub ledger_tick_ms: u64,

    pub messenger: MessengerSettings,

    /// Shared-memory page pools created by the Coordinator at startup
    pub pools: Vec<PoolSettings>,
}

/// Messenger retry and deadline knobs
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct MessengerSettings {
    pub retries: u32,
    pub retry_delay_ms: u64,
    pub send_deadline_ms: u64,
}

/// Sizing of one shared-memory page pool
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PoolSettings {
    pub name: String,
    pub capacity: u32,
    pub page_size: u32,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            socket_dir: PathBuf::from("/tmp/weft"),
            pid_file: PathBuf::from("/tmp/weft/coordinator.pid"),
            shm_dir: PathBuf::from("/dev/shm/weft"),
            workers: 4,
            diskers: 0,
            registration_timeout_ms: 6_000,
            ledger_tick_ms: 10,
            messenger: MessengerSettings::default(),
            pools: Vec::new(),
        }
    }
}

impl Default for MessengerSettings {
    fn default() -> Self {
        Self {
            retries: 10,
            retry_delay_ms: 100,
            send_deadline_ms: 10_000,
        }
    }
}

impl InstanceConfig {
    /// Expected kids `1..=cohort`, excluding the Coordinator
    pub fn cohort(&self) -> u32 {
        self.workers + self.diskers
    }

    /// Load configuration: defaults, then the optional file, then `WEFT_`
    /// environment overrides (e.g. `WEFT_WORKERS=8`)
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            debug!(path = %path.display(), "loading configuration file");
            builder = builder.add_source(File::from(path));
        }

        let loaded: Self = builder
            .add_source(Environment::with_prefix("WEFT"))
            .build()
            .context("assembling configuration sources")?
            .try_deserialize()
            .context("deserializing instance configuration")?;

        info!(
            workers = loaded.workers,
            diskers = loaded.diskers,
            socket_dir = %loaded.socket_dir.display(),
            "instance configuration loaded"
        );
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_make_a_working_instance() {
        let config = InstanceConfig::default();
        assert_eq!(config.cohort(), 4);
        assert!(config.pools.is_empty());
        assert_eq!(config.messenger.retries, 10);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let loaded = InstanceConfig::load(None).unwrap();
        assert_eq!(loaded.workers, InstanceConfig::default().workers);
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weft.toml");
        std::fs::write(
            &path,
            r#"
socket_dir = "/run/weft"
workers = 2
diskers = 1

[messenger]
retries = 3

[[pools]]
name = "io-pages"
capacity = 1024
page_size = 4096
"#,
        )
        .unwrap();

        let loaded = InstanceConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.socket_dir, PathBuf::from("/run/weft"));
        assert_eq!(loaded.cohort(), 3);
        assert_eq!(loaded.messenger.retries, 3);
        // Unspecified fields keep their defaults.
        assert_eq!(loaded.messenger.retry_delay_ms, 100);
        assert_eq!(
            loaded.pools,
            vec![PoolSettings {
                name: "io-pages".to_string(),
                capacity: 1024,
                page_size: 4096,
            }]
        );
    }

    #[test]
    fn roundtrips_through_toml() {
        let config = InstanceConfig::default();
        let text = toml::to_string(&config).unwrap();
        let back: InstanceConfig = toml::from_str(&text).unwrap();
        assert_eq!(back, config);
    }
}

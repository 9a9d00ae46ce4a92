use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};
use tokio::fs;
use tracing::{info, warn};

use crate::models::PlatformType;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KernelConfig {
    pub listen_addr: String,
    pub database_url: String,
    pub compute: ComputeConf,
    pub platforms: PlatformsConf,
    pub scheduler: SchedulerConf,
    pub takeover: TakeoverConf,
    pub ssh: SshConf,
    pub metrics: MetricsConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ComputeConf {
    pub endpoint: String,
    pub token: String,
    pub tenant: String,
    pub project_id: String,
    pub user_id: String,
    pub availability_zone: String,
    pub network_id: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PlatformTypeConf {
    /// Disk-format tag identifying the bootable image for this platform type.
    pub image_disk_format: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PlatformsConf {
    pub a: PlatformTypeConf,
    pub b: PlatformTypeConf,
}

impl PlatformsConf {
    pub fn for_type(&self, platform_type: PlatformType) -> &PlatformTypeConf {
        match platform_type {
            PlatformType::A => &self.a,
            PlatformType::B => &self.b,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SchedulerConf {
    pub sync_interval_secs: u64,
    pub monitor_interval_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TakeoverConf {
    pub poll_attempts: u32,
    pub poll_interval_secs: u64,
    pub batch_size: usize,
    pub batch_pause_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SshConf {
    pub user: String,
    pub port: u16,
    pub identity_file: Option<String>,
    pub timeout_secs: u64,
    /// Literal the last configuration command prints when the compute service is healthy.
    pub success_marker: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MetricsConf {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub topic: String,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            database_url: "sqlite://./data/takeover.db".into(),
            compute: ComputeConf::default(),
            platforms: PlatformsConf::default(),
            scheduler: SchedulerConf::default(),
            takeover: TakeoverConf::default(),
            ssh: SshConf::default(),
            metrics: MetricsConf::default(),
        }
    }
}

impl Default for ComputeConf {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8774/v2.1".into(),
            token: String::new(),
            tenant: "admin".into(),
            project_id: "admin".into(),
            user_id: "admin".into(),
            availability_zone: "nova".into(),
            network_id: String::new(),
        }
    }
}

impl Default for PlatformsConf {
    fn default() -> Self {
        Self {
            a: PlatformTypeConf { image_disk_format: "vmdk".into() },
            b: PlatformTypeConf { image_disk_format: "raw".into() },
        }
    }
}

impl Default for SchedulerConf {
    fn default() -> Self {
        Self { sync_interval_secs: 600, monitor_interval_secs: 300 }
    }
}

impl SchedulerConf {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }
}

impl Default for TakeoverConf {
    fn default() -> Self {
        Self { poll_attempts: 60, poll_interval_secs: 1, batch_size: 6, batch_pause_secs: 10 }
    }
}

impl Default for SshConf {
    fn default() -> Self {
        Self {
            user: "root".into(),
            port: 22,
            identity_file: None,
            timeout_secs: 120,
            success_marker: "active (running)".into(),
        }
    }
}

impl Default for MetricsConf {
    fn default() -> Self {
        Self { mqtt_host: "localhost".into(), mqtt_port: 1883, topic: "takeover/metrics/samples@v1".into() }
    }
}

impl KernelConfig {
    pub fn from_yaml(txt: &str) -> Result<Self, serde_yaml::Error> {
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(txt)
    }
}

/// Loads `TAKEOVER_KERNEL_CONFIG` (default `kernel.yaml`), falling back to
/// defaults when the file is missing or invalid.
pub async fn load_config() -> KernelConfig {
    let path = std::env::var("TAKEOVER_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    load_config_from(&path).await
}

pub async fn load_config_from(path: &str) -> KernelConfig {
    if !Path::new(path).exists() {
        warn!(path, "no config file, using defaults");
        return KernelConfig::default();
    }
    let txt = fs::read_to_string(path).await.unwrap_or_default();
    match KernelConfig::from_yaml(&txt) {
        Ok(cfg) => {
            info!(path, "config loaded");
            cfg
        }
        Err(e) => {
            warn!(path, error = %e, "invalid config, using defaults");
            KernelConfig::default()
        }
    }
}

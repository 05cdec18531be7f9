// src/central/config.rs

//! Configuration for the cluster head, loaded from its own TOML file
//! (`shardd --central central.toml`).

use crate::config::MetricsConfig;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

fn default_cluster_name() -> String {
    "cluster".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_supervisor_address() -> String {
    "127.0.0.1:7211".to_string()
}
fn default_bind_interface() -> String {
    "0.0.0.0".to_string()
}
fn default_service_port() -> u16 {
    7220
}
fn default_tick_rate_hz() -> f64 {
    4.0
}
fn default_planet_process_name() -> String {
    "PlanetServer".to_string()
}
fn default_planet_restart_delay() -> Duration {
    Duration::from_secs(30)
}
fn default_request_db_save() -> bool {
    true
}
fn default_pending_attach_limit() -> usize {
    64
}
fn default_forward_buffer_limit() -> usize {
    4 * 1024 * 1024 // 4MB per scene-authority connection
}
fn default_metrics_post_interval() -> Duration {
    Duration::from_secs(60)
}

/// The validated cluster-head configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CentralConfig {
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Task-service endpoint of the local supervisor.
    #[serde(default = "default_supervisor_address")]
    pub supervisor_address: String,
    #[serde(default = "default_bind_interface")]
    pub bind_interface: String,
    /// Where game workers, scene authorities, and peripherals connect.
    #[serde(default = "default_service_port")]
    pub service_port: u16,
    #[serde(default = "default_tick_rate_hz")]
    pub tick_rate_hz: f64,
    /// Catalog template spawned when a scene needs a new authority.
    #[serde(default = "default_planet_process_name")]
    pub planet_process_name: String,
    #[serde(with = "humantime_serde", default = "default_planet_restart_delay")]
    pub planet_server_restart_delay: Duration,
    /// Ask the database worker to persist before a lost scene authority is
    /// respawned.
    #[serde(default = "default_request_db_save")]
    pub request_db_save_on_planet_crash: bool,
    /// Per-scene bound on game workers parked waiting for an authority.
    #[serde(default = "default_pending_attach_limit")]
    pub pending_attach_limit: usize,
    /// Cap on buffered forwarding bytes per scene-authority connection.
    #[serde(default = "default_forward_buffer_limit")]
    pub forward_buffer_limit: usize,
    #[serde(with = "humantime_serde", default = "default_metrics_post_interval")]
    pub metrics_post_interval: Duration,
    /// Treat a duplicate scene registration as fatal instead of superseding.
    #[serde(default)]
    pub fatal_duplicate_scene_registration: bool,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            cluster_name: default_cluster_name(),
            log_level: default_log_level(),
            supervisor_address: default_supervisor_address(),
            bind_interface: default_bind_interface(),
            service_port: default_service_port(),
            tick_rate_hz: default_tick_rate_hz(),
            planet_process_name: default_planet_process_name(),
            planet_server_restart_delay: default_planet_restart_delay(),
            request_db_save_on_planet_crash: default_request_db_save(),
            pending_attach_limit: default_pending_attach_limit(),
            forward_buffer_limit: default_forward_buffer_limit(),
            metrics_post_interval: default_metrics_post_interval(),
            fatal_duplicate_scene_registration: false,
            metrics: MetricsConfig::default(),
        }
    }
}

impl CentralConfig {
    /// Creates a new `CentralConfig` by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let config: CentralConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration for logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.trim().is_empty() {
            return Err(anyhow!("cluster_name cannot be empty"));
        }
        if self.service_port == 0 {
            return Err(anyhow!("service_port cannot be 0"));
        }
        if self.tick_rate_hz <= 0.0 {
            return Err(anyhow!("tick_rate_hz must be positive"));
        }
        if self.pending_attach_limit == 0 {
            return Err(anyhow!("pending_attach_limit cannot be 0"));
        }
        if self.forward_buffer_limit == 0 {
            return Err(anyhow!("forward_buffer_limit cannot be 0"));
        }
        if self.metrics.enabled && self.metrics.port == 0 {
            return Err(anyhow!("metrics.port cannot be 0"));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate_hz)
    }
}

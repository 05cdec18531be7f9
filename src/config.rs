// src/config.rs

//! Manages supervisor configuration: loading, resolving dynamic values, and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;
use sysinfo::System;
use tracing::warn;

/// Which transport carries control-plane frames between peers.
///
/// Both kinds deliver the same type-hash-prefixed frames; `Datagram` adds
/// in-crate reliability and ordering on top of UDP.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Tcp,
    Datagram,
}

/// Tuning for the reliable datagram channel. Ignored for `TransportKind::Tcp`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DatagramConfig {
    /// Offset added to the peer service port for the UDP bind.
    #[serde(default = "default_datagram_port_offset")]
    pub port_offset: u16,
    /// Base retransmission timeout for unacknowledged segments.
    #[serde(with = "humantime_serde", default = "default_retransmit_timeout")]
    pub retransmit_timeout: Duration,
    /// Maximum unacknowledged segments in flight per peer.
    #[serde(default = "default_send_window")]
    pub send_window: usize,
}

fn default_datagram_port_offset() -> u16 {
    100
}
fn default_retransmit_timeout() -> Duration {
    Duration::from_millis(200)
}
fn default_send_window() -> usize {
    128
}

impl Default for DatagramConfig {
    fn default() -> Self {
        Self {
            port_offset: default_datagram_port_offset(),
            retransmit_timeout: default_retransmit_timeout(),
            send_window: default_send_window(),
        }
    }
}

/// Liveness detection settings for worker processes on this node.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LivenessConfig {
    /// A worker missing keep-alives for longer than this is considered hung.
    /// Zero disables the check entirely.
    #[serde(with = "humantime_serde", default = "default_worker_timeout")]
    pub worker_timeout: Duration,
    /// Minimum spacing between successive force-core attempts on the same worker.
    #[serde(with = "humantime_serde", default = "default_escalation_interval")]
    pub escalation_interval: Duration,
}

fn default_worker_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_escalation_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            worker_timeout: default_worker_timeout(),
            escalation_interval: default_escalation_interval(),
        }
    }
}

/// Restart policy for always-restart process classes.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RestartConfig {
    /// Gates the restart of a crashed cluster head. The other always-restart
    /// classes are unconditional.
    #[serde(default = "default_restart_central")]
    pub restart_central: bool,
    /// Per-class restart delay in seconds, keyed by command-line substring.
    #[serde(default = "default_restart_delays")]
    pub delays: BTreeMap<String, u64>,
}

fn default_restart_central() -> bool {
    true
}
fn default_restart_delays() -> BTreeMap<String, u64> {
    BTreeMap::from([
        ("CentralServer".to_string(), 30),
        ("LogServer".to_string(), 5),
        ("MetricsServer".to_string(), 5),
        ("CommoditiesServer".to_string(), 15),
        ("CommodityServer".to_string(), 15),
        ("TransferServer".to_string(), 15),
    ])
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            restart_central: default_restart_central(),
            delays: default_restart_delays(),
        }
    }
}

/// System-time divergence detection between slaves and the master.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TimeCheckConfig {
    #[serde(with = "humantime_serde", default = "default_timecheck_interval")]
    pub interval: Duration,
    /// Maximum tolerated wall-clock divergence before the mismatch flag is raised.
    #[serde(with = "humantime_serde", default = "default_timecheck_tolerance")]
    pub tolerance: Duration,
}

fn default_timecheck_interval() -> Duration {
    Duration::from_secs(60)
}
fn default_timecheck_tolerance() -> Duration {
    Duration::from_secs(10)
}

impl Default for TimeCheckConfig {
    fn default() -> Self {
        Self {
            interval: default_timecheck_interval(),
            tolerance: default_timecheck_tolerance(),
        }
    }
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MetricsConfig {
    /// If true, an HTTP server will be started to expose Prometheus metrics
    /// and the JSON liveness dashboard.
    #[serde(default)]
    pub enabled: bool,
    /// The port for the metrics/status server.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    8878
}

/// Tuning for the adaptive per-tick inbound dispatch budget.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DispatchConfig {
    /// If false, each tick drains the full inbound queue.
    #[serde(default)]
    pub adaptive: bool,
    /// Baseline per-tick time budget in milliseconds.
    #[serde(default = "default_dispatch_base_time_ms")]
    pub base_time_ms: u64,
    /// Queue depth above which the drain keeps going regardless of the budget.
    #[serde(default = "default_dispatch_base_queue_size")]
    pub base_queue_size: usize,
    #[serde(default = "default_dispatch_smoothing")]
    pub smoothing_factor: f32,
    #[serde(default = "default_dispatch_high_watermark")]
    pub high_watermark_multiplier: f32,
    #[serde(default = "default_dispatch_low_watermark")]
    pub low_watermark_multiplier: f32,
    #[serde(default = "default_dispatch_min_time_ms")]
    pub min_time_ms: u64,
    #[serde(default = "default_dispatch_max_time_ms")]
    pub max_time_ms: u64,
}

fn default_dispatch_base_time_ms() -> u64 {
    50
}
fn default_dispatch_base_queue_size() -> usize {
    256
}
fn default_dispatch_smoothing() -> f32 {
    0.2
}
fn default_dispatch_high_watermark() -> f32 {
    1.5
}
fn default_dispatch_low_watermark() -> f32 {
    0.5
}
fn default_dispatch_min_time_ms() -> u64 {
    25
}
fn default_dispatch_max_time_ms() -> u64 {
    250
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            adaptive: false,
            base_time_ms: default_dispatch_base_time_ms(),
            base_queue_size: default_dispatch_base_queue_size(),
            smoothing_factor: default_dispatch_smoothing(),
            high_watermark_multiplier: default_dispatch_high_watermark(),
            low_watermark_multiplier: default_dispatch_low_watermark(),
            min_time_ms: default_dispatch_min_time_ms(),
            max_time_ms: default_dispatch_max_time_ms(),
        }
    }
}

/// A raw representation of the config file before validation and resolution.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default = "default_cluster_name")]
    cluster_name: String,
    #[serde(default = "default_catalog_file")]
    catalog_file: String,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default)]
    nodes: Vec<String>,
    #[serde(default)]
    node_label: Option<String>,
    #[serde(default = "default_bind_interface")]
    bind_interface: String,
    #[serde(default = "default_peer_service_port")]
    peer_service_port: u16,
    #[serde(default = "default_task_service_port")]
    task_service_port: u16,
    #[serde(default = "default_console_service_port")]
    console_service_port: u16,
    #[serde(default = "default_tick_rate_hz")]
    tick_rate_hz: f64,
    #[serde(default = "default_maximum_load")]
    maximum_load: f32,
    #[serde(default = "default_load_costs")]
    load_costs: BTreeMap<String, f32>,
    #[serde(default = "default_verify_cluster_name")]
    verify_cluster_name: bool,
    #[serde(default)]
    auto_start: bool,
    #[serde(default)]
    transport: TransportKind,
    #[serde(default)]
    datagram: DatagramConfig,
    #[serde(default)]
    liveness: LivenessConfig,
    #[serde(default)]
    restart: RestartConfig,
    #[serde(default)]
    time_check: TimeCheckConfig,
    #[serde(default)]
    dispatch: DispatchConfig,
    #[serde(default)]
    metrics: MetricsConfig,
}

fn default_cluster_name() -> String {
    "cluster".to_string()
}
fn default_catalog_file() -> String {
    "cluster.rc".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_bind_interface() -> String {
    "0.0.0.0".to_string()
}
fn default_peer_service_port() -> u16 {
    7210
}
fn default_task_service_port() -> u16 {
    7211
}
fn default_console_service_port() -> u16 {
    7212
}
fn default_tick_rate_hz() -> f64 {
    4.0
}
fn default_maximum_load() -> f32 {
    10.0
}
fn default_load_costs() -> BTreeMap<String, f32> {
    BTreeMap::from([
        ("ConnectionServer".to_string(), 1.0),
        ("PlanetServer".to_string(), 2.0),
        ("GameServer".to_string(), 1.0),
    ])
}
fn default_verify_cluster_name() -> bool {
    true
}

/// Represents the final, validated, and resolved supervisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub cluster_name: String,
    pub catalog_file: String,
    pub log_level: String,
    /// Addresses of every node in the cluster, in label order
    /// (`nodes[0]` is `node0`, the master).
    pub nodes: Vec<String>,
    /// Explicit label override for this host. When absent, the host name is
    /// matched against `nodes`.
    pub node_label: Option<String>,
    pub bind_interface: String,
    pub peer_service_port: u16,
    pub task_service_port: u16,
    pub console_service_port: u16,
    pub tick_rate_hz: f64,
    pub maximum_load: f32,
    /// Per-class spawn cost, keyed by process-name substring.
    pub load_costs: BTreeMap<String, f32>,
    pub verify_cluster_name: bool,
    pub auto_start: bool,
    pub transport: TransportKind,
    #[serde(default)]
    pub datagram: DatagramConfig,
    #[serde(default)]
    pub liveness: LivenessConfig,
    #[serde(default)]
    pub restart: RestartConfig,
    #[serde(default)]
    pub time_check: TimeCheckConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster_name: default_cluster_name(),
            catalog_file: default_catalog_file(),
            log_level: default_log_level(),
            nodes: Vec::new(),
            node_label: None,
            bind_interface: default_bind_interface(),
            peer_service_port: default_peer_service_port(),
            task_service_port: default_task_service_port(),
            console_service_port: default_console_service_port(),
            tick_rate_hz: default_tick_rate_hz(),
            maximum_load: default_maximum_load(),
            load_costs: default_load_costs(),
            verify_cluster_name: default_verify_cluster_name(),
            auto_start: false,
            transport: TransportKind::default(),
            datagram: DatagramConfig::default(),
            liveness: LivenessConfig::default(),
            restart: RestartConfig::default(),
            time_check: TimeCheckConfig::default(),
            dispatch: DispatchConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let raw: RawConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;

        let config = Config {
            cluster_name: raw.cluster_name,
            catalog_file: raw.catalog_file,
            log_level: raw.log_level,
            nodes: raw.nodes,
            node_label: raw.node_label,
            bind_interface: raw.bind_interface,
            peer_service_port: raw.peer_service_port,
            task_service_port: raw.task_service_port,
            console_service_port: raw.console_service_port,
            tick_rate_hz: raw.tick_rate_hz,
            maximum_load: raw.maximum_load,
            load_costs: raw.load_costs,
            verify_cluster_name: raw.verify_cluster_name,
            auto_start: raw.auto_start,
            transport: raw.transport,
            datagram: raw.datagram,
            liveness: raw.liveness,
            restart: raw.restart,
            time_check: raw.time_check,
            dispatch: raw.dispatch,
            metrics: raw.metrics,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.trim().is_empty() {
            return Err(anyhow!("cluster_name cannot be empty"));
        }
        if self.peer_service_port == 0 || self.task_service_port == 0 {
            return Err(anyhow!("service ports cannot be 0"));
        }
        if self.peer_service_port == self.task_service_port
            || self.peer_service_port == self.console_service_port
            || self.task_service_port == self.console_service_port
        {
            return Err(anyhow!(
                "peer, task, and console service ports must be distinct"
            ));
        }
        if self.tick_rate_hz <= 0.0 {
            return Err(anyhow!("tick_rate_hz must be positive"));
        }
        if self.maximum_load <= 0.0 {
            return Err(anyhow!("maximum_load must be positive"));
        }
        if self.tick_rate_hz > 60.0 {
            warn!(
                "tick_rate_hz is set to {}. The control plane is designed for low-rate ticks; this will burn CPU for no benefit.",
                self.tick_rate_hz
            );
        }
        if let Some(label) = &self.node_label {
            if !self.nodes.is_empty() && self.label_index(label).is_none() {
                return Err(anyhow!(
                    "node_label '{}' is outside the configured node list (0..{})",
                    label,
                    self.nodes.len()
                ));
            }
        }
        if self.dispatch.adaptive {
            if self.dispatch.min_time_ms == 0 {
                return Err(anyhow!(
                    "dispatch.min_time_ms cannot be 0 when adaptive dispatch is enabled"
                ));
            }
            if self.dispatch.max_time_ms < self.dispatch.min_time_ms {
                return Err(anyhow!(
                    "dispatch.max_time_ms cannot be below dispatch.min_time_ms"
                ));
            }
        }
        if self.metrics.enabled && self.metrics.port == 0 {
            return Err(anyhow!("metrics.port cannot be 0"));
        }
        Ok(())
    }

    /// The duration of one main-loop tick.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate_hz)
    }

    /// Parses a `nodeN` label into its index, bounds-checked against `nodes`.
    fn label_index(&self, label: &str) -> Option<usize> {
        let index: usize = label.strip_prefix("node")?.parse().ok()?;
        (index < self.nodes.len()).then_some(index)
    }

    /// Resolves this host's node label and index.
    ///
    /// An explicit `node_label` wins; otherwise the host name is matched
    /// against the configured node list. An empty node list degenerates to a
    /// single-node cluster where this host is the master.
    pub fn resolve_local_node(&self) -> (String, usize) {
        if let Some(label) = &self.node_label {
            let index = self.label_index(label).unwrap_or(0);
            return (label.clone(), index);
        }
        if self.nodes.is_empty() {
            return ("node0".to_string(), 0);
        }
        let host_name = System::host_name().unwrap_or_default();
        for (index, addr) in self.nodes.iter().enumerate() {
            if *addr == host_name {
                return (format!("node{index}"), index);
            }
        }
        warn!(
            "Could not find node for this host '{}' in the configured node list; assuming node0.",
            host_name
        );
        ("node0".to_string(), 0)
    }

    /// Looks up the spawn cost for a process class by substring match.
    pub fn load_cost(&self, process_name: &str) -> f32 {
        self.load_costs
            .iter()
            .find(|(class, _)| process_name.contains(class.as_str()))
            .map(|(_, cost)| *cost)
            .unwrap_or(0.0)
    }

    /// Looks up the restart delay for a command line by substring match.
    pub fn restart_delay(&self, command_line: &str) -> Duration {
        self.restart
            .delays
            .iter()
            .find(|(class, _)| command_line.contains(class.as_str()))
            .map(|(_, secs)| Duration::from_secs(*secs))
            .unwrap_or(Duration::ZERO)
    }
}

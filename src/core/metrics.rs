// src/core/metrics.rs

//! Defines and registers Prometheus metrics for control-plane monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    Gauge, IntCounter, IntGauge, TextEncoder, register_gauge, register_int_counter,
    register_int_gauge,
};

lazy_static! {
    // --- Supervisor gauges ---
    /// Number of child processes currently owned by this supervisor.
    pub static ref LOCAL_CHILDREN: IntGauge =
        register_int_gauge!("shardd_local_children", "Number of child processes owned by this supervisor.").unwrap();
    /// This node's current spawn-cost load.
    pub static ref CURRENT_LOAD: Gauge =
        register_gauge!("shardd_current_load", "Sum of spawn costs for processes owned by this node.").unwrap();
    /// Number of peer supervisors currently connected.
    pub static ref PEER_CONNECTIONS: IntGauge =
        register_int_gauge!("shardd_peer_connections", "Number of connected peer supervisors.").unwrap();
    /// Number of live task connections (workers, cluster head, peripherals).
    pub static ref TASK_CONNECTIONS: IntGauge =
        register_int_gauge!("shardd_task_connections", "Number of live task connections on this supervisor.").unwrap();
    /// Spawn requests waiting for capacity anywhere in the fleet.
    pub static ref QUEUED_SPAWNS: IntGauge =
        register_int_gauge!("shardd_queued_spawns", "Spawn requests queued for lack of fleet capacity.").unwrap();
    /// A slave's wall clock diverged beyond tolerance (1 for true, 0 for false).
    pub static ref SYSTEM_TIME_MISMATCH: IntGauge =
        register_int_gauge!("shardd_system_time_mismatch", "System time mismatch detected between nodes (1 for true, 0 for false).").unwrap();

    // --- Supervisor counters ---
    /// Total processes spawned locally since startup.
    pub static ref PROCESSES_SPAWNED_TOTAL: IntCounter =
        register_int_counter!("shardd_processes_spawned_total", "Total processes spawned on this node.").unwrap();
    /// Total child exits observed since startup.
    pub static ref PROCESSES_DIED_TOTAL: IntCounter =
        register_int_counter!("shardd_processes_died_total", "Total child process exits observed on this node.").unwrap();
    /// Total hung-worker escalations (forceCore or kill).
    pub static ref SERVER_HANGS_TOTAL: IntCounter =
        register_int_counter!("shardd_server_hangs_total", "Total keep-alive escalations issued against hung workers.").unwrap();
    /// Total automatic restarts promoted from the restart queue.
    pub static ref RESTARTS_PROMOTED_TOTAL: IntCounter =
        register_int_counter!("shardd_restarts_promoted_total", "Total restart requests promoted from the restart queue.").unwrap();

    // --- Cluster-head gauges ---
    /// Number of scenes currently in the Ready state.
    pub static ref READY_SCENES: IntGauge =
        register_int_gauge!("shardd_ready_scenes", "Scenes with a ready authority.").unwrap();
    /// Game workers parked waiting for a scene authority.
    pub static ref PENDING_ATTACHMENTS: IntGauge =
        register_int_gauge!("shardd_pending_attachments", "Game workers waiting for a scene authority to become ready.").unwrap();
    /// Whether the cluster is locked to the public (1 locked, 0 public).
    pub static ref CLUSTER_LOCKED: IntGauge =
        register_int_gauge!("shardd_cluster_locked", "Cluster lock state (1 locked, 0 public).").unwrap();

    // --- Cluster-head counters ---
    /// Pending attachments dropped because a scene's pending list overflowed.
    pub static ref PENDING_ATTACHMENTS_DROPPED_TOTAL: IntCounter =
        register_int_counter!("shardd_pending_attachments_dropped_total", "Pending scene attachments dropped due to the per-scene bound.").unwrap();
    /// Payload frames flushed to game workers by the forwarding gateway.
    pub static ref FORWARDED_FRAMES_TOTAL: IntCounter =
        register_int_counter!("shardd_forwarded_frames_total", "Payload frames dispatched by the forwarding gateway.").unwrap();
    /// Forwarding protocol faults that closed a scene-authority connection.
    pub static ref FORWARDING_FAULTS_TOTAL: IntCounter =
        register_int_counter!("shardd_forwarding_faults_total", "Forwarding protocol faults observed on scene-authority connections.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}

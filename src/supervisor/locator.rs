// src/supervisor/locator.rs

//! Tracks where every node is and how loaded it is.
//!
//! The master's placement decisions read this table; slaves keep only their
//! own entry plus whichever peers happen to be connected. Load numbers for
//! peers are optimistic projections corrected by `TaskLoadUpdate` heartbeats.

use crate::connection::{ConnectionHandle, ConnectionId};
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

/// One cluster node from the static configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEntry {
    pub address: String,
    pub label: String,
    pub index: usize,
}

/// A connected peer supervisor and its load accounting.
#[derive(Debug, Clone)]
pub struct PeerServer {
    pub label: String,
    pub conn_id: ConnectionId,
    pub handle: ConnectionHandle,
    pub current_load: f32,
    pub maximum_load: f32,
}

/// A load-only view of a peer, for the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerLoadView {
    pub label: String,
    pub current_load: f32,
    pub maximum_load: f32,
}

/// The per-process locator: this node's load plus the connected peer table.
#[derive(Debug)]
pub struct Locator {
    my_load: f32,
    my_maximum_load: f32,
    servers: HashMap<String, PeerServer>,
    /// Peers that disconnected and have not come back: label -> address.
    closed: BTreeMap<String, String>,
}

impl Locator {
    pub fn new(my_maximum_load: f32) -> Self {
        Self {
            my_load: 0.0,
            my_maximum_load,
            servers: HashMap::new(),
            closed: BTreeMap::new(),
        }
    }

    pub fn my_load(&self) -> f32 {
        self.my_load
    }

    pub fn my_maximum_load(&self) -> f32 {
        self.my_maximum_load
    }

    pub fn increment_my_load(&mut self, cost: f32) {
        self.my_load += cost;
    }

    pub fn decrement_my_load(&mut self, cost: f32) {
        if self.my_load - cost < 0.0 {
            warn!(
                "Load accounting underflow: {} - {} clamped to 0",
                self.my_load, cost
            );
            self.my_load = 0.0;
        } else {
            self.my_load -= cost;
        }
    }

    /// Registers (or re-registers) a connected peer.
    pub fn add_server(
        &mut self,
        label: &str,
        conn_id: ConnectionId,
        handle: ConnectionHandle,
        maximum_load: f32,
    ) {
        self.closed.remove(label);
        self.servers.insert(
            label.to_string(),
            PeerServer {
                label: label.to_string(),
                conn_id,
                handle,
                current_load: 0.0,
                maximum_load,
            },
        );
    }

    /// Drops a peer by connection, recording it as disconnected.
    pub fn remove_server_by_conn(&mut self, conn_id: ConnectionId, address: &str) {
        let Some(label) = self
            .servers
            .values()
            .find(|s| s.conn_id == conn_id)
            .map(|s| s.label.clone())
        else {
            return;
        };
        self.servers.remove(&label);
        self.closed.insert(label, address.to_string());
    }

    pub fn get_server(&self, label: &str) -> Option<&PeerServer> {
        self.servers.get(label)
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    pub fn server_labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.servers.keys().cloned().collect();
        labels.sort();
        labels
    }

    pub fn servers(&self) -> impl Iterator<Item = &PeerServer> {
        self.servers.values()
    }

    /// Optimistic projection after forwarding a spawn to a peer.
    pub fn increment_server_load(&mut self, label: &str, cost: f32) {
        if let Some(server) = self.servers.get_mut(label) {
            server.current_load += cost;
        }
    }

    /// Authoritative refresh from a peer's heartbeat.
    pub fn set_server_load(&mut self, label: &str, current_load: f32, maximum_load: f32) {
        if let Some(server) = self.servers.get_mut(label) {
            server.current_load = current_load;
            server.maximum_load = maximum_load;
        }
    }

    /// The scheduler's view of every connected peer.
    pub fn peer_load_views(&self) -> Vec<PeerLoadView> {
        self.servers
            .values()
            .map(|s| PeerLoadView {
                label: s.label.clone(),
                current_load: s.current_load,
                maximum_load: s.maximum_load,
            })
            .collect()
    }

    /// Disconnected-but-not-reconnected peers as `label (address)` CSV, for
    /// the operator alert path.
    pub fn closed_connections_csv(&self) -> String {
        self.closed
            .iter()
            .map(|(label, address)| format!("{label} ({address})"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

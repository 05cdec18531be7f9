// src/supervisor/mod.rs

//! The per-node supervisor daemon.
//!
//! One cooperative main loop owns every piece of control-plane state: the
//! child-process table, the peer table, spawn queues, keep-alive watches,
//! and the operator console. Connection tasks only move frames; everything
//! that mutates state happens here, once per tick.

pub mod console;
pub mod liveness;
pub mod locator;
pub mod restart;
pub mod scheduler;

use crate::config::{Config, TransportKind};
use crate::connection::datagram::DatagramNode;
use crate::connection::{
    ConnectionEvent, ConnectionHandle, ConnectionId, ConnectionIdAllocator, ServiceKind, handler,
    listener,
};
use crate::core::ShardError;
use crate::core::catalog::Catalog;
use crate::core::dispatch::DispatchController;
use crate::core::events::{EventBus, ProcessEvent};
use crate::core::metrics;
use crate::core::process::ProcessHost;
use crate::core::protocol::{ControlMessage, ServerRole, messages};
use crate::shutdown::await_shutdown_signal;
use chrono::Utc;
use console::ConsoleRequest;
use liveness::{Escalation, WorkerWatch, check_escalation};
use locator::{Locator, NodeEntry};
use restart::{RestartQueue, RestartRequest};
use scheduler::Placement;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{filter::EnvFilter, reload};

/// The master's node label. The supervisor carrying it hosts the scheduler
/// and spawns the cluster head.
pub const MASTER_LABEL: &str = "node0";

/// Handle to the logging filter, allowing dynamic log level changes via the
/// operator console.
pub type LogReloadHandle = Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>;

/// A spawn waiting out its configured delay.
#[derive(Debug, Clone)]
struct DelayedSpawn {
    process_name: String,
    options: String,
    node_label: String,
    time_queued: Instant,
    delay: Duration,
}

/// A spawn the scheduler could not place for lack of capacity.
#[derive(Debug, Clone)]
struct QueuedSpawn {
    process_name: String,
    options: String,
    node_label: String,
}

/// A spawn whose target node has no current connection.
#[derive(Debug, Clone)]
struct DeferredSpawn {
    /// Which peer connection carries the request once it exists.
    via_label: String,
    /// The label written into the forwarded request.
    request_label: String,
    process_name: String,
    options: String,
}

/// A forwarded spawn retained until the target node acknowledges it.
#[derive(Debug, Clone)]
struct OutstandingSpawnAck {
    node_label: String,
    request: messages::TaskSpawnProcess,
}

/// Book-keeping for one live connection.
#[derive(Debug)]
struct ConnInfo {
    service: ServiceKind,
    handle: ConnectionHandle,
    peer_addr: SocketAddr,
    role: Option<ServerRole>,
    node_label: Option<String>,
    command_line: String,
    sent_handshake: bool,
}

/// The node supervisor: state plus the channels feeding its main loop.
pub struct Supervisor {
    config: Config,
    catalog: Catalog,
    host: Arc<dyn ProcessHost>,
    node_label: String,
    nodes: Vec<NodeEntry>,
    locator: Locator,

    conns: HashMap<ConnectionId, ConnInfo>,
    /// Local children: pid -> command line.
    children: HashMap<u32, String>,
    /// Keep-alive watches per game-worker connection.
    watches: HashMap<ConnectionId, WorkerWatch>,
    central_conn: Option<ConnectionId>,

    deferred_spawns: Vec<DeferredSpawn>,
    delayed_spawns: Vec<DelayedSpawn>,
    queued_spawns: Vec<QueuedSpawn>,
    outstanding_acks: Vec<OutstandingSpawnAck>,
    restart_queue: RestartQueue,
    next_transaction_id: u64,

    /// Peers this node is responsible for dialing (lower indexes), waiting
    /// for their next attempt.
    pending_peers: Vec<NodeEntry>,
    /// Dialed peer connections, for re-queueing on loss.
    dialed: HashMap<ConnectionId, NodeEntry>,
    last_peer_dial: Instant,

    next_time_check: Instant,
    system_time_mismatch: bool,

    events: EventBus,
    log_reload_handle: Option<LogReloadHandle>,
    done: bool,
}

impl Supervisor {
    pub fn new(config: Config, catalog: Catalog, host: Arc<dyn ProcessHost>) -> Self {
        let (node_label, node_index) = config.resolve_local_node();
        let nodes: Vec<NodeEntry> = config
            .nodes
            .iter()
            .enumerate()
            .map(|(index, address)| NodeEntry {
                address: address.clone(),
                label: format!("node{index}"),
                index,
            })
            .collect();
        // Dial every peer with a smaller node index; they accept us.
        let pending_peers = nodes
            .iter()
            .filter(|n| n.index < node_index)
            .cloned()
            .collect();

        let locator = Locator::new(config.maximum_load);
        let next_time_check = Instant::now() + config.time_check.interval;
        Self {
            config,
            catalog,
            host,
            node_label,
            nodes,
            locator,
            conns: HashMap::new(),
            children: HashMap::new(),
            watches: HashMap::new(),
            central_conn: None,
            deferred_spawns: Vec::new(),
            delayed_spawns: Vec::new(),
            queued_spawns: Vec::new(),
            outstanding_acks: Vec::new(),
            restart_queue: RestartQueue::new(),
            next_transaction_id: 1,
            pending_peers,
            dialed: HashMap::new(),
            last_peer_dial: Instant::now() - Duration::from_secs(2),
            next_time_check,
            system_time_mismatch: false,
            events: EventBus::new(),
            log_reload_handle: None,
            done: false,
        }
    }

    /// Attaches the tracing reload handle so the console's `logLevel`
    /// command can swap the filter at runtime.
    pub fn set_log_reload_handle(&mut self, handle: LogReloadHandle) {
        self.log_reload_handle = Some(handle);
    }

    pub fn node_label(&self) -> &str {
        &self.node_label
    }

    pub fn is_master(&self) -> bool {
        self.node_label == MASTER_LABEL
    }

    fn next_transaction(&mut self) -> u64 {
        let id = self.next_transaction_id;
        self.next_transaction_id += 1;
        id
    }

    fn handshake(&self) -> ControlMessage {
        ControlMessage::TaskConnectionId(messages::TaskConnectionId {
            role: ServerRole::TaskManager,
            command_line: std::env::args().collect::<Vec<_>>().join(" "),
            cluster_name: self.config.cluster_name.clone(),
            node_label: self.node_label.clone(),
        })
    }

    fn load_update(&self) -> ControlMessage {
        ControlMessage::TaskLoadUpdate(messages::TaskLoadUpdate {
            node_label: self.node_label.clone(),
            current_load: self.locator.my_load(),
            maximum_load: self.locator.my_maximum_load(),
        })
    }

    /// Pushes this node's authoritative load to the master.
    fn send_load_update(&self) {
        if self.is_master() {
            return;
        }
        if let Some(master) = self.locator.get_server(MASTER_LABEL) {
            if let Err(e) = master.handle.send_message(&self.load_update()) {
                debug!("Could not send load update to master: {}", e);
            }
        }
    }

    fn send_to_central(&self, message: &ControlMessage) {
        let Some(conn_id) = self.central_conn else {
            debug!("No cluster head connection; dropping {}", message.name());
            return;
        };
        if let Some(info) = self.conns.get(&conn_id) {
            if let Err(e) = info.handle.send_message(message) {
                debug!("Send to cluster head failed: {}", e);
            }
        }
    }

    // --- Spawning -----------------------------------------------------------

    /// Starts a process by template name, honoring target-host rules and the
    /// configured spawn delay. Returns the PID for local launches, 0 for
    /// everything else (forwarded, deferred, queued, failed).
    pub fn start_server(
        &mut self,
        process_name: &str,
        options: &str,
        node_label: &str,
        spawn_delay: Duration,
    ) -> u32 {
        let Some(template) = self.catalog.get(process_name).cloned() else {
            warn!(
                "Process name {} not found in the supervisor catalog",
                process_name
            );
            return 0;
        };

        if !spawn_delay.is_zero() {
            self.delayed_spawns.push(DelayedSpawn {
                process_name: process_name.to_string(),
                options: options.to_string(),
                node_label: node_label.to_string(),
                time_queued: Instant::now(),
                delay: spawn_delay,
            });
            return 0;
        }

        let node_addresses: Vec<(String, String)> = self
            .nodes
            .iter()
            .map(|n| (n.address.clone(), n.label.clone()))
            .collect();
        let target = scheduler::resolve_target(
            &template.target_host,
            node_label,
            &self.node_label,
            &node_addresses,
        );
        let cost = self.config.load_cost(process_name);
        let placement = scheduler::decide(
            &target,
            self.is_master(),
            cost,
            self.locator.my_load(),
            self.locator.my_maximum_load(),
            &self.locator.peer_load_views(),
        );

        match placement {
            Placement::Local => self.start_server_local(&template, options),
            Placement::Forward { label } => {
                self.forward_spawn(&label, &label, process_name, options, cost);
                0
            }
            Placement::ForwardToMaster => {
                if self.locator.get_server(MASTER_LABEL).is_some() {
                    self.forward_spawn(MASTER_LABEL, "any", process_name, options, cost);
                } else {
                    debug!(
                        "Master not reachable; deferring spawn request for {}",
                        process_name
                    );
                    self.deferred_spawns.push(DeferredSpawn {
                        via_label: MASTER_LABEL.to_string(),
                        request_label: "any".to_string(),
                        process_name: process_name.to_string(),
                        options: options.to_string(),
                    });
                }
                0
            }
            Placement::Queue => {
                warn!(
                    "No available hosts to spawn process {} with cost {}, queueing request",
                    process_name, cost
                );
                self.queued_spawns.push(QueuedSpawn {
                    process_name: process_name.to_string(),
                    options: options.to_string(),
                    node_label: node_label.to_string(),
                });
                0
            }
            Placement::Defer { label } => {
                info!(
                    "Could not spawn {} on {}; node is unavailable. Deferring request.",
                    process_name, label
                );
                self.deferred_spawns.push(DeferredSpawn {
                    via_label: label.clone(),
                    request_label: label,
                    process_name: process_name.to_string(),
                    options: options.to_string(),
                });
                0
            }
        }
    }

    /// Launches a template on this host and updates local accounting.
    fn start_server_local(&mut self, template: &crate::core::catalog::ProcessTemplate, options: &str) -> u32 {
        let command_line = template.command_line(options);
        info!(
            "Starting process ({}) on node {} with current load {}",
            command_line,
            self.node_label,
            self.locator.my_load()
        );

        match self.host.spawn(&command_line) {
            Ok(pid) => {
                self.locator
                    .increment_my_load(self.config.load_cost(&template.name));
                self.children.insert(pid, command_line.clone());
                self.events.publish(ProcessEvent::Started {
                    pid,
                    host: self.node_label.clone(),
                    command_line,
                });
                self.send_load_update();
                pid
            }
            Err(e) => {
                warn!("Spawn of {} failed: {}", command_line, e);
                0
            }
        }
    }

    /// Sends a spawn request to a connected peer, with optimistic load
    /// projection and ack bookkeeping.
    fn forward_spawn(
        &mut self,
        via_label: &str,
        request_label: &str,
        process_name: &str,
        options: &str,
        cost: f32,
    ) {
        let transaction_id = self.next_transaction();
        let request = messages::TaskSpawnProcess {
            node_label: request_label.to_string(),
            process_name: process_name.to_string(),
            options: options.to_string(),
            transaction_id,
        };
        let Some(server) = self.locator.get_server(via_label) else {
            self.deferred_spawns.push(DeferredSpawn {
                via_label: via_label.to_string(),
                request_label: request_label.to_string(),
                process_name: process_name.to_string(),
                options: options.to_string(),
            });
            return;
        };
        if let Err(e) = server
            .handle
            .send_message(&ControlMessage::TaskSpawnProcess(request.clone()))
        {
            warn!("Spawn forward to {} failed: {}", via_label, e);
            return;
        }

        // Requests addressed to a concrete node are tracked until acked and
        // counted against that node immediately; "any" forwards are the
        // master's problem once sent.
        if request_label != "any" {
            self.locator.increment_server_load(via_label, cost);
            info!(
                "Spawn request for {} sent to {} with load cost {}",
                process_name, via_label, cost
            );
            self.outstanding_acks.push(OutstandingSpawnAck {
                node_label: via_label.to_string(),
                request,
            });
        }
    }

    /// Kills a local child if the request addresses this node; otherwise ignores it.
    fn kill_process(&mut self, kill: &messages::TaskKillProcess) {
        let my_address = self
            .nodes
            .iter()
            .find(|n| n.label == self.node_label)
            .map(|n| n.address.clone())
            .unwrap_or_default();
        let addressed_here = kill.host == self.node_label
            || kill.host == my_address
            || kill.host == "local"
            || kill.host == "localhost"
            || kill.host == "127.0.0.1";
        if !addressed_here {
            return;
        }

        let Some(command_line) = self.children.remove(&kill.pid) else {
            debug!("Kill request for unknown pid {} ignored", kill.pid);
            return;
        };
        if kill.force_core {
            self.host.force_core(kill.pid);
        } else {
            self.host.terminate(kill.pid);
        }
        self.locator
            .decrement_my_load(self.config.load_cost(&command_line));
        self.events.publish(ProcessEvent::Killed {
            host: self.node_label.clone(),
            command_line,
        });
        self.send_load_update();
    }

    /// Spawns the cluster-bootstrap processes, in dependency order.
    fn start_cluster(&mut self) {
        let _ = self.start_server("TransferServer", "", "local", Duration::ZERO);
        let _ = self.start_server("MetricsServer", "", "local", Duration::ZERO);
        let _ = self.start_server("LogServer", "", "local", Duration::ZERO);
        let options = format!("--cluster-name {}", self.config.cluster_name);
        let _ = self.start_server("CentralServer", &options, "local", Duration::ZERO);
    }

    /// Kills every local child.
    fn stop_cluster(&mut self) {
        let children = std::mem::take(&mut self.children);
        for (pid, command_line) in children {
            self.host.terminate(pid);
            self.locator
                .decrement_my_load(self.config.load_cost(&command_line));
            self.events.publish(ProcessEvent::Killed {
                host: self.node_label.clone(),
                command_line,
            });
        }
        self.send_load_update();
    }

    // --- Operator console ---------------------------------------------------

    /// Executes one operator command, returning the single-line reply.
    pub fn execute_command(&mut self, command: &str) -> String {
        let mut parts = command.split_whitespace();
        let verb = parts.next().unwrap_or("");
        let argument = parts.next();

        let result = match verb {
            "start" => {
                self.start_cluster();
                "start command issued and handled by the supervisor".to_string()
            }
            "stop" => {
                self.stop_cluster();
                "stop command issued and handled by the supervisor".to_string()
            }
            "public" => {
                self.send_to_central(&ControlMessage::SetConnectionServersPublic(
                    messages::SetConnectionServersPublic { public: true },
                ));
                "public command issued and handled by the supervisor".to_string()
            }
            "private" => {
                self.send_to_central(&ControlMessage::SetConnectionServersPublic(
                    messages::SetConnectionServersPublic { public: false },
                ));
                "private command issued and handled by the supervisor".to_string()
            }
            "taskConnectionCount" => self
                .conns
                .values()
                .filter(|c| c.service == ServiceKind::Task)
                .count()
                .to_string(),
            "exit" => {
                self.stop_cluster();
                self.done = true;
                "exiting".to_string()
            }
            "runState" => "running".to_string(),
            "logLevel" => match argument {
                Some(filter) => self.reload_log_filter(filter),
                None => "logLevel command requires a filter value".to_string(),
            },
            _ => "unknown command".to_string(),
        };
        info!("Execute command: {}.", result);
        result
    }

    /// Swaps the process-wide tracing filter through the reload handle.
    fn reload_log_filter(&self, filter: &str) -> String {
        let Some(handle) = &self.log_reload_handle else {
            return "log reload is not available".to_string();
        };
        match EnvFilter::try_new(filter) {
            Ok(new_filter) => match handle.reload(new_filter) {
                Ok(()) => format!("log level set to {filter}"),
                Err(e) => format!("log reload failed: {e}"),
            },
            Err(e) => format!("invalid log filter '{filter}': {e}"),
        }
    }

    // --- Inbound events -----------------------------------------------------

    fn handle_connection_event(&mut self, event: ConnectionEvent) -> Result<(), ShardError> {
        match event {
            ConnectionEvent::Opened {
                service,
                conn_id,
                peer_addr,
                handle,
            } => {
                let dialed_peer = self.dialed.contains_key(&conn_id);
                let mut info = ConnInfo {
                    service,
                    handle,
                    peer_addr,
                    role: None,
                    node_label: None,
                    command_line: String::new(),
                    sent_handshake: false,
                };
                if dialed_peer {
                    // We initiated this link; identify ourselves first.
                    if info.handle.send_message(&self.handshake()).is_ok() {
                        let _ = info.handle.send_message(&self.load_update());
                        info.sent_handshake = true;
                    }
                }
                self.conns.insert(conn_id, info);
                Ok(())
            }

            ConnectionEvent::Frame { conn_id, frame } => {
                match ControlMessage::from_frame(&frame) {
                    Ok(Some(message)) => self.handle_message(conn_id, message),
                    Ok(None) => {
                        debug!(
                            "Opaque frame ({:#010x}) on {} ignored",
                            frame.type_hash, conn_id
                        );
                        Ok(())
                    }
                    Err(e) => {
                        warn!("Bad frame on {}: {}", conn_id, e);
                        Ok(())
                    }
                }
            }

            ConnectionEvent::Closed { conn_id } => {
                self.on_connection_closed(conn_id);
                Ok(())
            }

            ConnectionEvent::DialFailed { conn_id, .. } => {
                if let Some(node) = self.dialed.remove(&conn_id) {
                    self.pending_peers.push(node);
                }
                Ok(())
            }
        }
    }

    fn on_connection_closed(&mut self, conn_id: ConnectionId) {
        let Some(info) = self.conns.remove(&conn_id) else {
            return;
        };
        self.watches.remove(&conn_id);
        if self.central_conn == Some(conn_id) {
            warn!("Cluster head connection lost");
            self.central_conn = None;
        }
        if info.service == ServiceKind::Peer {
            let address = info
                .node_label
                .as_deref()
                .and_then(|label| self.nodes.iter().find(|n| n.label == label))
                .map(|n| n.address.clone())
                .unwrap_or_else(|| info.peer_addr.to_string());
            self.locator.remove_server_by_conn(conn_id, &address);
            if let Some(node) = self.dialed.remove(&conn_id) {
                // Re-queue for the 1-second retry cadence.
                self.pending_peers.push(node);
            }
        }
    }

    fn handle_message(
        &mut self,
        conn_id: ConnectionId,
        message: ControlMessage,
    ) -> Result<(), ShardError> {
        match message {
            ControlMessage::TaskConnectionId(id) => self.handle_handshake(conn_id, id),

            ControlMessage::WorkerKeepAlive(ka) => {
                if let Some(watch) = self.watches.get_mut(&conn_id) {
                    if watch.pid == 0 && ka.pid != 0 {
                        watch.pid = ka.pid;
                        // Capture the command line from the process table for
                        // hang diagnostics.
                        watch.command_line =
                            self.host.read_command_line(ka.pid).unwrap_or_default();
                    }
                    watch.record_keepalive(Instant::now());
                } else {
                    debug!("Keep-alive from unidentified connection {}", conn_id);
                }
                Ok(())
            }

            ControlMessage::TaskSpawnProcess(req) => {
                let addressed_to_me =
                    req.node_label == self.node_label || req.node_label == "local";
                let _ = self.start_server(
                    &req.process_name,
                    &req.options,
                    &req.node_label,
                    Duration::ZERO,
                );
                if addressed_to_me {
                    // Acknowledge the attempt so the master clears its
                    // outstanding record.
                    if let Some(info) = self.conns.get(&conn_id) {
                        let ack = ControlMessage::TaskSpawnAck(messages::TaskSpawnAck {
                            transaction_id: req.transaction_id,
                        });
                        let _ = info.handle.send_message(&ack);
                    }
                }
                Ok(())
            }

            ControlMessage::TaskSpawnAck(ack) => {
                self.outstanding_acks
                    .retain(|o| o.request.transaction_id != ack.transaction_id);
                Ok(())
            }

            ControlMessage::TaskKillProcess(kill) => {
                self.kill_process(&kill);
                Ok(())
            }

            ControlMessage::ExcommunicateGameServer(ex) => {
                let kill = messages::TaskKillProcess {
                    host: ex.host,
                    pid: ex.pid,
                    force_core: true,
                };
                self.kill_process(&kill);
                // The excommunication is fleet-wide: every supervisor gets
                // the kill, whichever node the worker actually lives on.
                let broadcast = ControlMessage::TaskKillProcess(kill);
                for server in self.locator.servers() {
                    let _ = server.handle.send_message(&broadcast);
                }
                Ok(())
            }

            ControlMessage::ProcessDied(died) => {
                if self.is_master() {
                    info!(
                        "Process died on a slave node: {} (pid {}); advising the cluster head",
                        died.command_line, died.pid
                    );
                    self.send_to_central(&ControlMessage::ProcessDied(died));
                }
                Ok(())
            }

            ControlMessage::SystemTimeCheck(tc) => {
                if self.is_master() {
                    let now = Utc::now().timestamp();
                    let divergence = (now - tc.seconds).unsigned_abs();
                    if divergence > self.config.time_check.tolerance.as_secs() {
                        warn!(
                            "System time on {} diverges from master by {}s (tolerance {}s)",
                            tc.node_label,
                            divergence,
                            self.config.time_check.tolerance.as_secs()
                        );
                        self.system_time_mismatch = true;
                        metrics::SYSTEM_TIME_MISMATCH.set(1);
                    }
                }
                Ok(())
            }

            ControlMessage::TaskLoadUpdate(lu) => {
                self.locator
                    .set_server_load(&lu.node_label, lu.current_load, lu.maximum_load);
                Ok(())
            }

            other => {
                debug!("Unhandled message {} on {}", other.name(), conn_id);
                Ok(())
            }
        }
    }

    fn handle_handshake(
        &mut self,
        conn_id: ConnectionId,
        id: messages::TaskConnectionId,
    ) -> Result<(), ShardError> {
        // Cluster membership verification is the master's job and mismatch
        // is fatal: a foreign supervisor must never join the fleet.
        if id.role == ServerRole::TaskManager
            && self.is_master()
            && self.config.verify_cluster_name
            && id.cluster_name != self.config.cluster_name
        {
            error!(
                "Remote supervisor {} reported different cluster name: {} != {}",
                id.command_line, id.cluster_name, self.config.cluster_name
            );
            return Err(ShardError::ClusterNameMismatch {
                reported: id.cluster_name,
                local: self.config.cluster_name.clone(),
            });
        }

        let my_handshake = self.handshake();
        let my_load = self.load_update();

        let Some(info) = self.conns.get_mut(&conn_id) else {
            return Ok(());
        };
        info.role = Some(id.role);
        info.command_line = id.command_line;
        if id.role == ServerRole::TaskManager {
            info.node_label = Some(id.node_label.clone());
            if !info.sent_handshake {
                // We are the accepting side; identify ourselves back.
                if info.handle.send_message(&my_handshake).is_ok() {
                    info.sent_handshake = true;
                }
            }
        }
        let handle = info.handle.clone();

        match id.role {
            ServerRole::TaskManager => {
                info!("New supervisor connection active: {}", id.node_label);
                self.locator
                    .add_server(&id.node_label, conn_id, handle.clone(), 0.0);
                let _ = handle.send_message(&my_load);
                metrics::PEER_CONNECTIONS.set(self.locator.server_count() as i64);

                // Every spawn still outstanding against this label is resent
                // before anything new is scheduled to it.
                for outstanding in self
                    .outstanding_acks
                    .iter()
                    .filter(|o| o.node_label == id.node_label)
                {
                    let _ = handle.send_message(&ControlMessage::TaskSpawnProcess(
                        outstanding.request.clone(),
                    ));
                }
            }
            ServerRole::Central => {
                info!("New cluster head connection active");
                self.central_conn = Some(conn_id);
            }
            ServerRole::Game => {
                info!("New game worker connection active");
                self.watches.insert(conn_id, WorkerWatch::new());
            }
            ServerRole::Database => info!("New database worker connection active"),
            ServerRole::Metrics => info!("New metrics worker connection active"),
            ServerRole::Planet => info!("New scene authority connection active"),
            ServerRole::Chat => info!("New chat worker connection active"),
            ServerRole::Connection => info!("New connection gateway connection active"),
        }
        Ok(())
    }

    // --- Periodic work ------------------------------------------------------

    /// Polls the OS for exited children, notifies upstream, and queues
    /// restarts for the always-restart classes.
    fn check_child_exits(&mut self) {
        let dead: Vec<(u32, String)> = self
            .children
            .iter()
            .filter(|(pid, _)| !self.host.is_alive(**pid))
            .map(|(pid, cmd)| (*pid, cmd.clone()))
            .collect();

        for (pid, command_line) in dead {
            self.children.remove(&pid);
            warn!("PROCESS DIED: {}", command_line);

            let died = ControlMessage::ProcessDied(messages::ProcessDied {
                pid,
                command_line: command_line.clone(),
            });
            if self.is_master() {
                self.send_to_central(&died);
            } else if let Some(master) = self.locator.get_server(MASTER_LABEL) {
                let _ = master.handle.send_message(&died);
            }

            self.locator
                .decrement_my_load(self.config.load_cost(&command_line));
            self.events.publish(ProcessEvent::Aborted {
                host: self.node_label.clone(),
                command_line: command_line.clone(),
            });

            if !restart::restarts_disabled()
                && restart::is_restart_class(&command_line, self.config.restart.restart_central)
            {
                let delay = self.config.restart_delay(&command_line);
                self.restart_queue.push(RestartRequest {
                    command_line,
                    time_queued: Instant::now(),
                    delay,
                });
            }
            self.send_load_update();
        }
    }

    /// Promotes at most one eligible restart per tick.
    fn promote_restart(&mut self) {
        let Some(request) = self.restart_queue.promote_one(Instant::now()) else {
            return;
        };
        info!("Restarting crashed process: {}", request.command_line);
        match self.host.spawn(&request.command_line) {
            Ok(pid) => {
                self.locator
                    .increment_my_load(self.config.load_cost(&request.command_line));
                self.children.insert(pid, request.command_line.clone());
                self.events.publish(ProcessEvent::Started {
                    pid,
                    host: self.node_label.clone(),
                    command_line: request.command_line,
                });
                metrics::RESTARTS_PROMOTED_TOTAL.inc();
                self.send_load_update();
            }
            Err(e) => {
                warn!("Restart of {} failed: {}", request.command_line, e);
            }
        }
    }

    /// Flushes deferred spawns whose target node is now connected.
    fn flush_deferred_spawns(&mut self) {
        if self.deferred_spawns.is_empty() {
            return;
        }
        let deferred = std::mem::take(&mut self.deferred_spawns);
        for spawn in deferred {
            if self.locator.get_server(&spawn.via_label).is_some() {
                let cost = self.config.load_cost(&spawn.process_name);
                info!(
                    "Sent deferred spawn request for {} to {}",
                    spawn.process_name, spawn.via_label
                );
                self.forward_spawn(
                    &spawn.via_label,
                    &spawn.request_label,
                    &spawn.process_name,
                    &spawn.options,
                    cost,
                );
            } else {
                self.deferred_spawns.push(spawn);
            }
        }
    }

    /// Promotes at most one delayed spawn whose delay has elapsed.
    fn promote_delayed_spawn(&mut self) {
        let now = Instant::now();
        let Some(position) = self
            .delayed_spawns
            .iter()
            .position(|s| s.time_queued + s.delay <= now)
        else {
            return;
        };
        let spawn = self.delayed_spawns.remove(position);
        let _ = self.start_server(
            &spawn.process_name,
            &spawn.options,
            &spawn.node_label,
            Duration::ZERO,
        );
    }

    /// Re-runs every queued spawn through the scheduler. Requests that still
    /// cannot be placed re-queue themselves.
    fn run_spawn_request_queue(&mut self) {
        if self.queued_spawns.is_empty() {
            return;
        }
        let queued = std::mem::take(&mut self.queued_spawns);
        for spawn in queued {
            let _ = self.start_server(
                &spawn.process_name,
                &spawn.options,
                &spawn.node_label,
                Duration::ZERO,
            );
        }
    }

    /// Escalates against workers whose keep-alives stopped.
    fn check_worker_liveness(&mut self) {
        let timeout = self.config.liveness.worker_timeout;
        let interval = self.config.liveness.escalation_interval;
        if timeout.is_zero() {
            return;
        }
        let now = Instant::now();
        for watch in self.watches.values_mut() {
            let Some(escalation) = check_escalation(watch, now, timeout, interval) else {
                continue;
            };
            let silent_for = watch
                .last_keepalive
                .map(|t| now.duration_since(t).as_secs())
                .unwrap_or(0);
            metrics::SERVER_HANGS_TOTAL.inc();
            match escalation {
                Escalation::Kill => {
                    warn!(
                        "ServerHang: killing (kill) worker {},{} ({}) because it has not provided a keepalive message in {} seconds",
                        self.node_label, watch.pid, watch.command_line, silent_for
                    );
                    self.host.terminate(watch.pid);
                }
                Escalation::ForceCore => {
                    if !watch.logged_force_core {
                        watch.logged_force_core = true;
                        warn!(
                            "ServerHang: killing (forceCore) worker {},{} ({}) because it has not provided a keepalive message in {} seconds",
                            self.node_label, watch.pid, watch.command_line, silent_for
                        );
                    }
                    self.host.force_core(watch.pid);
                }
            }
        }
    }

    /// Slaves report their wall clock to the master; the master reports
    /// disconnected slaves to the cluster head.
    fn run_time_check(&mut self) {
        if Instant::now() < self.next_time_check {
            return;
        }
        self.next_time_check = Instant::now() + self.config.time_check.interval;

        if !self.is_master() {
            if let Some(master) = self.locator.get_server(MASTER_LABEL) {
                let msg = ControlMessage::SystemTimeCheck(messages::SystemTimeCheck {
                    node_label: self.node_label.clone(),
                    seconds: Utc::now().timestamp(),
                });
                let _ = master.handle.send_message(&msg);
            }
        } else {
            let csv = self.locator.closed_connections_csv();
            self.send_to_central(&ControlMessage::DisconnectedTaskManagers(
                messages::DisconnectedTaskManagers {
                    csv,
                    system_time_mismatch: self.system_time_mismatch,
                },
            ));
        }
    }

    fn refresh_gauges(&self) {
        metrics::LOCAL_CHILDREN.set(self.children.len() as i64);
        metrics::CURRENT_LOAD.set(self.locator.my_load() as f64);
        metrics::PEER_CONNECTIONS.set(self.locator.server_count() as i64);
        metrics::TASK_CONNECTIONS.set(
            self.conns
                .values()
                .filter(|c| c.service == ServiceKind::Task)
                .count() as i64,
        );
        metrics::QUEUED_SPAWNS.set(self.queued_spawns.len() as i64);
        metrics::SYSTEM_TIME_MISMATCH.set(i64::from(self.system_time_mismatch));
    }

    fn status_snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "mode": "supervisor",
            "node": self.node_label,
            "master": self.is_master(),
            "run_state": "running",
            "cluster_name": self.config.cluster_name,
            "current_load": self.locator.my_load(),
            "maximum_load": self.locator.my_maximum_load(),
            "children": self.children.len(),
            "peers": self.locator.server_labels(),
            "disconnected_peers": self.locator.closed_connections_csv(),
            "task_connections": self.conns.values().filter(|c| c.service == ServiceKind::Task).count(),
            "queued_spawns": self.queued_spawns.len(),
            "deferred_spawns": self.deferred_spawns.len(),
            "delayed_spawns": self.delayed_spawns.len(),
            "outstanding_acks": self.outstanding_acks.len(),
            "restart_queue": self.restart_queue.len(),
            "system_time_mismatch": self.system_time_mismatch,
        })
    }
}

/// Builds and runs a supervisor until shutdown. This is the entry point for
/// the default run mode.
pub async fn run(config: Config, log_reload_handle: LogReloadHandle) -> anyhow::Result<()> {
    let catalog = Catalog::load(&config.catalog_file);
    let host: Arc<dyn ProcessHost> = Arc::new(crate::core::process::OsProcessHost::new());
    let mut supervisor = Supervisor::new(config, catalog, host);
    supervisor.set_log_reload_handle(log_reload_handle);
    run_with(supervisor).await
}

/// Runs an already-constructed supervisor. Split from `run` so tests can
/// inject their own catalog and process host.
pub async fn run_with(mut supervisor: Supervisor) -> anyhow::Result<()> {
    let config = supervisor.config.clone();
    info!(
        "Supervisor starting as {} in cluster '{}'",
        supervisor.node_label, config.cluster_name
    );

    let ids = ConnectionIdAllocator::new();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<ConnectionEvent>();
    let (console_tx, mut console_rx) = mpsc::unbounded_channel::<ConsoleRequest>();
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let (status_tx, status_rx) = watch::channel(serde_json::Value::Null);

    // --- Services ---
    let task_listener = listener::bind(&config.bind_interface, config.task_service_port).await?;
    tokio::spawn(listener::run_listener(
        ServiceKind::Task,
        task_listener,
        ids.clone(),
        events_tx.clone(),
        shutdown_tx.subscribe(),
    ));

    let console_listener =
        listener::bind(&config.bind_interface, config.console_service_port).await?;
    tokio::spawn(console::run_console_listener(
        console_listener,
        console_tx,
        shutdown_tx.subscribe(),
    ));

    let mut datagram_peers = false;
    match config.transport {
        TransportKind::Tcp => {
            let peer_listener =
                listener::bind(&config.bind_interface, config.peer_service_port).await?;
            tokio::spawn(listener::run_listener(
                ServiceKind::Peer,
                peer_listener,
                ids.clone(),
                events_tx.clone(),
                shutdown_tx.subscribe(),
            ));
        }
        TransportKind::Datagram => {
            let udp_port = config.peer_service_port + config.datagram.port_offset;
            let mut node = DatagramNode::bind(
                &config.bind_interface,
                udp_port,
                config.datagram.clone(),
                ids.clone(),
                events_tx.clone(),
            )
            .await?;
            // Datagram channels form lazily; dial every lower-index peer once
            // and let retransmission carry the handshake until it lands.
            for peer in supervisor.pending_peers.drain(..) {
                let addr = format!(
                    "{}:{}",
                    peer.address,
                    config.peer_service_port + config.datagram.port_offset
                );
                match addr.parse() {
                    Ok(socket_addr) => node.dial(ServiceKind::Peer, socket_addr),
                    Err(e) => warn!("Bad peer address {}: {}", addr, e),
                }
            }
            tokio::spawn(node.run(ServiceKind::Peer, shutdown_tx.subscribe()));
            datagram_peers = true;
        }
    }

    if config.metrics.enabled {
        tokio::spawn(crate::core::metrics_server::run_metrics_server(
            config.metrics.port,
            status_rx,
            shutdown_tx.subscribe(),
        ));
    }

    // Lifecycle counters are driven by the event bus, not by the publish
    // sites, so any future observer sees the same stream metrics does.
    tokio::spawn(run_lifecycle_observer(
        supervisor.events.subscribe(),
        shutdown_tx.subscribe(),
    ));

    if config.auto_start {
        supervisor.start_cluster();
    }

    // --- Main loop ---
    let mut tick = time::interval(config.tick_interval());
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut dispatch = DispatchController::new(&config.dispatch);

    let shutdown_signal = await_shutdown_signal();
    tokio::pin!(shutdown_signal);

    let result = loop {
        tokio::select! {
            biased;

            _ = &mut shutdown_signal => {
                info!("Supervisor shutting down.");
                break Ok(());
            }

            _ = tick.tick() => {
                // (a) inbound frame dispatch, under the adaptive budget
                if let Err(e) = drain_events(
                    &mut supervisor,
                    &mut events_rx,
                    &mut dispatch,
                    &config,
                ) {
                    break Err(e.into());
                }

                // (b) operator console dispatch
                while let Ok(request) = console_rx.try_recv() {
                    let reply = supervisor.execute_command(&request.line);
                    let _ = request.reply_tx.send(reply);
                }

                // (c) periodic checks
                if !datagram_peers {
                    dial_pending_peers(&mut supervisor, &ids, &events_tx, &config);
                }
                supervisor.check_child_exits();
                supervisor.promote_restart();
                supervisor.flush_deferred_spawns();
                supervisor.promote_delayed_spawn();
                supervisor.run_spawn_request_queue();
                supervisor.check_worker_liveness();
                supervisor.run_time_check();
                supervisor.refresh_gauges();
                let _ = status_tx.send(supervisor.status_snapshot());

                if supervisor.done {
                    info!("Supervisor exiting on operator request.");
                    break Ok(());
                }
            }
        }
    };

    let _ = shutdown_tx.send(());
    result
}

/// Consumes process-lifecycle events and keeps the spawn/death counters
/// current. Runs until shutdown or until the bus closes.
async fn run_lifecycle_observer(
    mut events_rx: broadcast::Receiver<ProcessEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,

            event = events_rx.recv() => match event {
                Ok(ProcessEvent::Started { .. }) => metrics::PROCESSES_SPAWNED_TOTAL.inc(),
                Ok(ProcessEvent::Aborted { .. }) => metrics::PROCESSES_DIED_TOTAL.inc(),
                Ok(ProcessEvent::Killed { .. }) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Lifecycle observer lagged; {} events dropped", missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

/// Drains inbound connection events under the configured dispatch budget.
fn drain_events(
    supervisor: &mut Supervisor,
    events_rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>,
    dispatch: &mut DispatchController,
    config: &Config,
) -> Result<(), ShardError> {
    let start_queue = events_rx.len();
    if start_queue == 0 {
        return Ok(());
    }
    let start = Instant::now();

    let (budget_ms, queue_threshold) = if config.dispatch.adaptive {
        (
            dispatch.compute_time_budget(
                config.dispatch.base_time_ms,
                config.dispatch.base_queue_size,
                start_queue,
            ),
            dispatch.compute_queue_threshold(config.dispatch.base_queue_size, start_queue),
        )
    } else {
        (u64::MAX, config.dispatch.base_queue_size)
    };

    let mut processed = 0usize;
    loop {
        if events_rx.is_empty() {
            break;
        }
        let over_budget = (start.elapsed().as_millis() as u64) >= budget_ms;
        if over_budget && events_rx.len() <= queue_threshold {
            break;
        }
        let Ok(event) = events_rx.try_recv() else {
            break;
        };
        supervisor.handle_connection_event(event)?;
        processed += 1;
    }

    if config.dispatch.adaptive {
        dispatch.record_cycle(
            events_rx.len(),
            processed,
            start.elapsed().as_millis() as u64,
        );
    }
    Ok(())
}

/// Dials pending peers on a 1-second cadence.
fn dial_pending_peers(
    supervisor: &mut Supervisor,
    ids: &Arc<ConnectionIdAllocator>,
    events_tx: &mpsc::UnboundedSender<ConnectionEvent>,
    config: &Config,
) {
    if supervisor.pending_peers.is_empty() {
        return;
    }
    let now = Instant::now();
    if now.duration_since(supervisor.last_peer_dial) < Duration::from_secs(1) {
        return;
    }
    supervisor.last_peer_dial = now;

    for node in std::mem::take(&mut supervisor.pending_peers) {
        let target = format!("{}:{}", node.address, config.peer_service_port);
        let conn_id = ids.allocate();
        debug!("Dialing peer {} at {}", node.label, target);
        supervisor.dialed.insert(conn_id, node);
        let events_tx = events_tx.clone();
        tokio::spawn(handler::dial(ServiceKind::Peer, target, conn_id, events_tx));
    }
}

// src/central/mod.rs

//! The cluster head: fleet coordinator for scene topology, worker
//! registries, and the forwarding gateway.
//!
//! It is spawned by the master supervisor (`shardd --central central.toml`),
//! dials its local supervisor's task service as role `Central`, and accepts
//! game workers, scene authorities, and peripheral workers on its own
//! service port. Like the supervisor, one main loop owns all state.

pub mod config;
pub mod forwarding;
pub mod registry;
pub mod scenes;

use crate::connection::{
    ConnectionEvent, ConnectionHandle, ConnectionId, ConnectionIdAllocator, ServiceKind, handler,
    listener,
};
use crate::core::ShardError;
use crate::core::metrics;
use crate::core::protocol::{ControlMessage, ServerRole, WireFrame, message_type_hash, messages};
use crate::shutdown::await_shutdown_signal;
use chrono::Utc;
use config::CentralConfig;
use forwarding::{ForwardingStack, StackOutcome};
use once_cell::sync::Lazy;
use registry::ConnectionRegistry;
use scenes::{AttachOutcome, AuthorityEndpoint, RequestOutcome, SceneDirectory};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

static BEGIN_FORWARD_HASH: Lazy<u32> = Lazy::new(|| message_type_hash("BeginForward"));
static END_FORWARD_HASH: Lazy<u32> = Lazy::new(|| message_type_hash("EndForward"));

/// A scene waiting out its authority-respawn delay.
#[derive(Debug, Clone)]
struct SceneRespawn {
    scene_id: String,
    due: Instant,
}

/// The cluster head's state, owned by its main loop.
pub struct CentralServer {
    config: CentralConfig,
    registry: ConnectionRegistry,
    scenes: SceneDirectory,
    /// Forwarding state per scene-authority connection.
    forwarding: HashMap<ConnectionId, ForwardingStack>,
    supervisor_conn: Option<(ConnectionId, ConnectionHandle)>,
    supervisor_dialing: bool,
    is_locked: bool,
    startup_epoch: i64,
    disconnected_supervisors: String,
    system_time_mismatch: bool,
    respawns: Vec<SceneRespawn>,
    next_transaction_id: u64,
    next_metrics_post: Instant,
}

impl CentralServer {
    pub fn new(config: CentralConfig) -> Self {
        let scenes = SceneDirectory::new(config.pending_attach_limit);
        let next_metrics_post = Instant::now() + config.metrics_post_interval;
        Self {
            config,
            registry: ConnectionRegistry::new(),
            scenes,
            forwarding: HashMap::new(),
            supervisor_conn: None,
            supervisor_dialing: false,
            is_locked: false,
            startup_epoch: Utc::now().timestamp(),
            disconnected_supervisors: String::new(),
            system_time_mismatch: false,
            respawns: Vec::new(),
            next_transaction_id: 1,
            next_metrics_post,
        }
    }

    fn next_transaction(&mut self) -> u64 {
        let id = self.next_transaction_id;
        self.next_transaction_id += 1;
        id
    }

    fn handshake(&self) -> ControlMessage {
        ControlMessage::TaskConnectionId(messages::TaskConnectionId {
            role: ServerRole::Central,
            command_line: std::env::args().collect::<Vec<_>>().join(" "),
            cluster_name: self.config.cluster_name.clone(),
            node_label: String::new(),
        })
    }

    /// Asks the supervisor fleet for a new scene authority on any node.
    fn request_scene_authority_spawn(&mut self, scene_id: &str) {
        let transaction_id = self.next_transaction();
        let request = ControlMessage::TaskSpawnProcess(messages::TaskSpawnProcess {
            node_label: "any".to_string(),
            process_name: self.config.planet_process_name.clone(),
            options: format!("--scene {scene_id}"),
            transaction_id,
        });
        match &self.supervisor_conn {
            Some((_, handle)) => {
                info!("Requesting a new scene authority for '{}'", scene_id);
                if let Err(e) = handle.send_message(&request) {
                    warn!("Spawn request for scene '{}' failed: {}", scene_id, e);
                }
                self.scenes.mark_spawn_requested(scene_id);
            }
            None => {
                // No supervisor link right now; the respawn queue retries.
                warn!(
                    "No supervisor connection; delaying authority spawn for '{}'",
                    scene_id
                );
                self.respawns.push(SceneRespawn {
                    scene_id: scene_id.to_string(),
                    due: Instant::now() + Duration::from_secs(1),
                });
            }
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
                match service {
                    ServiceKind::Task => {
                        // Our dialed link to the local supervisor.
                        self.supervisor_dialing = false;
                        if handle.send_message(&self.handshake()).is_ok() {
                            info!("Connected to local supervisor at {}", peer_addr);
                            self.supervisor_conn = Some((conn_id, handle));
                        }
                    }
                    _ => {
                        self.registry.register(conn_id, handle, peer_addr);
                    }
                }
                Ok(())
            }

            ConnectionEvent::Frame { conn_id, frame } => self.handle_frame(conn_id, frame),

            ConnectionEvent::Closed { conn_id } => {
                self.on_connection_closed(conn_id);
                Ok(())
            }

            ConnectionEvent::DialFailed { .. } => {
                self.supervisor_dialing = false;
                Ok(())
            }
        }
    }

    fn on_connection_closed(&mut self, conn_id: ConnectionId) {
        if self
            .supervisor_conn
            .as_ref()
            .is_some_and(|(id, _)| *id == conn_id)
        {
            warn!("Supervisor connection lost; retrying");
            self.supervisor_conn = None;
            return;
        }

        self.forwarding.remove(&conn_id);
        let Some(conn) = self.registry.remove(conn_id) else {
            return;
        };
        match conn.role {
            Some(ServerRole::Planet) => self.on_authority_lost(conn_id),
            Some(ServerRole::Game) => self.scenes.on_worker_disconnect(conn_id),
            _ => {}
        }
    }

    /// Scene-authority teardown: save, notify, and schedule the respawn.
    fn on_authority_lost(&mut self, conn_id: ConnectionId) {
        let Some(scene_id) = self.scenes.on_authority_closed(conn_id) else {
            return;
        };

        if self.config.request_db_save_on_planet_crash {
            match self.registry.database() {
                Some(db) => {
                    info!(
                        "Requesting database save before respawning authority for '{}'",
                        scene_id
                    );
                    let _ = db.handle.send_message(&ControlMessage::CentralRequestSave(
                        messages::CentralRequestSave,
                    ));
                }
                None => warn!("No database worker connected for the crash save request"),
            }
        }

        let closed = ControlMessage::SceneAuthorityClosed(messages::SceneAuthorityClosed {
            scene_id: scene_id.clone(),
        });
        for worker in self.registry.with_role(ServerRole::Game) {
            let _ = worker.handle.send_message(&closed);
        }

        self.respawns.push(SceneRespawn {
            scene_id,
            due: Instant::now() + self.config.planet_server_restart_delay,
        });
    }

    /// Routes one frame. Scene-authority connections get the forwarding
    /// treatment before anything else: while a forwarding scope is open,
    /// every frame that is not `BeginForward`/`EndForward` buffers, typed or
    /// not.
    fn handle_frame(&mut self, conn_id: ConnectionId, frame: WireFrame) -> Result<(), ShardError> {
        if self.registry.role_of(conn_id) == Some(ServerRole::Planet) {
            return self.handle_authority_frame(conn_id, frame);
        }

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

    fn handle_authority_frame(
        &mut self,
        conn_id: ConnectionId,
        frame: WireFrame,
    ) -> Result<(), ShardError> {
        let stack = self
            .forwarding
            .entry(conn_id)
            .or_insert_with(|| ForwardingStack::new(self.config.forward_buffer_limit));

        let outcome = if frame.type_hash == *BEGIN_FORWARD_HASH {
            match ControlMessage::from_frame(&frame) {
                Ok(Some(ControlMessage::BeginForward(begin))) => stack.on_begin(begin.worker_ids),
                _ => StackOutcome::Fault(ShardError::ForwardingFault(
                    "malformed BeginForward".to_string(),
                )),
            }
        } else if frame.type_hash == *END_FORWARD_HASH {
            stack.on_end()
        } else if stack.is_active() {
            stack.on_payload(frame)
        } else {
            // Default receive path for scene-authority control messages.
            return match ControlMessage::from_frame(&frame) {
                Ok(Some(message)) => self.handle_message(conn_id, message),
                Ok(None) => {
                    debug!(
                        "Opaque frame ({:#010x}) outside any forwarding scope on {} ignored",
                        frame.type_hash, conn_id
                    );
                    Ok(())
                }
                Err(e) => {
                    warn!("Bad frame on scene authority {}: {}", conn_id, e);
                    Ok(())
                }
            };
        };

        match outcome {
            StackOutcome::Buffered => Ok(()),
            StackOutcome::Flush(sets) => {
                for set in sets {
                    for frame in &set.frames {
                        for worker_id in &set.destinations {
                            // Best-effort: dead workers drop silently, no retry.
                            if let Some(handle) = self.registry.worker_handle(*worker_id) {
                                let _ = handle.send_frame(frame.clone());
                            }
                            metrics::FORWARDED_FRAMES_TOTAL.inc();
                        }
                    }
                }
                Ok(())
            }
            StackOutcome::Fault(reason) => {
                error!(
                    "Forwarding protocol fault on {}: {}; closing connection",
                    conn_id, reason
                );
                metrics::FORWARDING_FAULTS_TOTAL.inc();
                self.forwarding.remove(&conn_id);
                // Dropping the registry record drops the last handle, which
                // closes the connection; the Closed event finishes teardown.
                self.registry.remove(conn_id);
                self.on_authority_lost(conn_id);
                Ok(())
            }
        }
    }

    fn handle_message(
        &mut self,
        conn_id: ConnectionId,
        message: ControlMessage,
    ) -> Result<(), ShardError> {
        match message {
            ControlMessage::TaskConnectionId(id) => {
                if let Some(worker_id) =
                    self.registry
                        .identify(conn_id, id.role, id.command_line.clone())
                {
                    info!("New game worker registered as worker {}", worker_id);
                } else {
                    info!("New {} connection active", id.role);
                }
                match id.role {
                    ServerRole::Planet => {
                        self.forwarding
                            .entry(conn_id)
                            .or_insert_with(|| ForwardingStack::new(self.config.forward_buffer_limit));
                    }
                    ServerRole::Connection => {
                        // Late-joining gateways inherit the current lock state.
                        if let Some(conn) = self.registry.get(conn_id) {
                            let msg = ControlMessage::SetConnectionServersPublic(
                                messages::SetConnectionServersPublic {
                                    public: !self.is_locked,
                                },
                            );
                            let _ = conn.handle.send_message(&msg);
                        }
                    }
                    _ => {}
                }
                Ok(())
            }

            ControlMessage::RequestSceneAuthority(req) => {
                if self.registry.role_of(conn_id) != Some(ServerRole::Game) {
                    debug!(
                        "Scene request from non-game connection {} ignored",
                        conn_id
                    );
                    return Ok(());
                }
                match self.scenes.request(&req.scene_id, conn_id) {
                    RequestOutcome::Ready(endpoint) => {
                        self.send_scene_authority(conn_id, &endpoint);
                    }
                    RequestOutcome::Parked { needs_spawn } => {
                        if needs_spawn {
                            self.request_scene_authority_spawn(&req.scene_id);
                        }
                    }
                }
                Ok(())
            }

            ControlMessage::AttachSceneAuthority(attach) => {
                let endpoint = AuthorityEndpoint {
                    address: attach.address,
                    port: attach.port,
                };
                match self.scenes.attach(&attach.scene_id, conn_id, endpoint) {
                    AttachOutcome::Attached => {
                        info!("Scene authority attached for '{}'", attach.scene_id);
                        Ok(())
                    }
                    AttachOutcome::Superseded { previous } => {
                        error!(
                            "Duplicate scene registration for '{}' (superseded authority on {})",
                            attach.scene_id, previous
                        );
                        if self.config.fatal_duplicate_scene_registration {
                            return Err(ShardError::InvalidState(format!(
                                "duplicate scene registration for '{}'",
                                attach.scene_id
                            )));
                        }
                        Ok(())
                    }
                }
            }

            ControlMessage::PlanetObjectId(msg) => {
                if let Some((endpoint, released)) =
                    self.scenes
                        .set_ready(&msg.scene_id, conn_id, msg.planet_object_id)
                {
                    for worker_conn in released {
                        self.send_scene_authority(worker_conn, &endpoint);
                    }
                }
                Ok(())
            }

            ControlMessage::SetConnectionServersPublic(msg) => {
                self.is_locked = !msg.public;
                info!(
                    "Cluster is now {}",
                    if self.is_locked { "private" } else { "public" }
                );
                metrics::CLUSTER_LOCKED.set(i64::from(self.is_locked));
                let fanout = ControlMessage::SetConnectionServersPublic(msg);
                for gateway in self.registry.with_role(ServerRole::Connection) {
                    let _ = gateway.handle.send_message(&fanout);
                }
                Ok(())
            }

            ControlMessage::ProcessDied(died) => {
                warn!(
                    "Fleet process died: {} (pid {})",
                    died.command_line, died.pid
                );
                Ok(())
            }

            ControlMessage::DisconnectedTaskManagers(report) => {
                if !report.csv.is_empty() {
                    warn!("Disconnected supervisors reported: {}", report.csv);
                }
                self.disconnected_supervisors = report.csv;
                self.system_time_mismatch = report.system_time_mismatch;
                Ok(())
            }

            other => {
                debug!("Unhandled message {} on {}", other.name(), conn_id);
                Ok(())
            }
        }
    }

    fn send_scene_authority(&self, worker_conn: ConnectionId, endpoint: &AuthorityEndpoint) {
        let Some(conn) = self.registry.get(worker_conn) else {
            return;
        };
        let msg = ControlMessage::SetSceneAuthority(messages::SetSceneAuthority {
            address: endpoint.address.clone(),
            port: endpoint.port,
        });
        if let Err(e) = conn.handle.send_message(&msg) {
            debug!("SetSceneAuthority to {} failed: {}", worker_conn, e);
        }
    }

    // --- Periodic work ------------------------------------------------------

    /// Promotes scene respawns whose delay elapsed.
    fn promote_respawns(&mut self) {
        let now = Instant::now();
        let due: Vec<String> = {
            let (due, rest): (Vec<SceneRespawn>, Vec<SceneRespawn>) = self
                .respawns
                .drain(..)
                .partition(|respawn| respawn.due <= now);
            self.respawns = rest;
            due.into_iter().map(|r| r.scene_id).collect()
        };
        for scene_id in due {
            // A replacement authority may have attached on its own while the
            // delay ran; only spawn when the scene is still authorityless.
            let absent = self
                .scenes
                .get(&scene_id)
                .map(|entry| entry.authority_conn.is_none())
                .unwrap_or(false);
            if absent {
                self.request_scene_authority_spawn(&scene_id);
            }
        }
    }

    /// Uploads the liveness counters to the database worker.
    fn post_metrics(&mut self) {
        if Instant::now() < self.next_metrics_post {
            return;
        }
        self.next_metrics_post = Instant::now() + self.config.metrics_post_interval;

        let Some(db) = self.registry.database() else {
            debug!("No database worker connected; skipping metrics upload");
            return;
        };
        let counters = vec![
            ("numChatServers".to_string(), self.registry.count(ServerRole::Chat) as i64),
            (
                "numConnectionServers".to_string(),
                self.registry.count(ServerRole::Connection) as i64,
            ),
            (
                "numDatabaseServers".to_string(),
                self.registry.count(ServerRole::Database) as i64,
            ),
            ("numGameServers".to_string(), self.registry.count(ServerRole::Game) as i64),
            (
                "numPlanetServers".to_string(),
                self.registry.count(ServerRole::Planet) as i64,
            ),
            ("population".to_string(), 0),
            ("isLocked".to_string(), i64::from(self.is_locked)),
            ("clusterStartupTime".to_string(), self.startup_epoch),
            (
                "systemTimeMismatch".to_string(),
                i64::from(self.system_time_mismatch),
            ),
            (
                "taskManagerDisconnected".to_string(),
                i64::from(!self.disconnected_supervisors.is_empty()),
            ),
        ];
        // Statistics sections are opaque pass-through; the control plane
        // does not populate or interpret them.
        let upload = ControlMessage::PostMetrics(messages::PostMetrics {
            counters,
            statistics: Vec::new(),
        });
        if let Err(e) = db.handle.send_message(&upload) {
            debug!("Metrics upload failed: {}", e);
        }
    }

    fn refresh_gauges(&self) {
        metrics::READY_SCENES.set(self.scenes.ready_count() as i64);
        metrics::PENDING_ATTACHMENTS.set(self.scenes.pending_count() as i64);
        metrics::CLUSTER_LOCKED.set(i64::from(self.is_locked));
    }

    fn status_snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "mode": "central",
            "run_state": "running",
            "cluster_name": self.config.cluster_name,
            "is_locked": self.is_locked,
            "cluster_startup_time": self.startup_epoch,
            "supervisor_connected": self.supervisor_conn.is_some(),
            "scenes": self.scenes.scene_ids(),
            "ready_scenes": self.scenes.ready_count(),
            "pending_attachments": self.scenes.pending_count(),
            "pending_respawns": self.respawns.len(),
            "num_chat_servers": self.registry.count(ServerRole::Chat),
            "num_connection_servers": self.registry.count(ServerRole::Connection),
            "num_database_servers": self.registry.count(ServerRole::Database),
            "num_game_servers": self.registry.count(ServerRole::Game),
            "num_planet_servers": self.registry.count(ServerRole::Planet),
            "disconnected_supervisors": self.disconnected_supervisors,
            "system_time_mismatch": self.system_time_mismatch,
        })
    }
}

/// Builds and runs the cluster head until shutdown.
pub async fn run(config: CentralConfig) -> anyhow::Result<()> {
    info!(
        "Cluster head starting for cluster '{}'",
        config.cluster_name
    );
    let mut central = CentralServer::new(config.clone());

    let ids = ConnectionIdAllocator::new();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<ConnectionEvent>();
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let (status_tx, status_rx) = watch::channel(serde_json::Value::Null);

    let service_listener = listener::bind(&config.bind_interface, config.service_port).await?;
    tokio::spawn(listener::run_listener(
        ServiceKind::Central,
        service_listener,
        ids.clone(),
        events_tx.clone(),
        shutdown_tx.subscribe(),
    ));

    if config.metrics.enabled {
        tokio::spawn(crate::core::metrics_server::run_metrics_server(
            config.metrics.port,
            status_rx,
            shutdown_tx.subscribe(),
        ));
    }

    let mut tick = time::interval(config.tick_interval());
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_supervisor_dial = Instant::now() - Duration::from_secs(2);

    let shutdown_signal = await_shutdown_signal();
    tokio::pin!(shutdown_signal);

    let result = loop {
        tokio::select! {
            biased;

            _ = &mut shutdown_signal => {
                info!("Cluster head shutting down.");
                break Ok(());
            }

            _ = tick.tick() => {
                // (a) inbound frame dispatch
                let mut failed: Option<ShardError> = None;
                while let Ok(event) = events_rx.try_recv() {
                    if let Err(e) = central.handle_connection_event(event) {
                        failed = Some(e);
                        break;
                    }
                }
                if let Some(e) = failed {
                    break Err(e.into());
                }

                // (b) periodic checks
                if central.supervisor_conn.is_none()
                    && !central.supervisor_dialing
                    && last_supervisor_dial.elapsed() >= Duration::from_secs(1)
                {
                    last_supervisor_dial = Instant::now();
                    central.supervisor_dialing = true;
                    let conn_id = ids.allocate();
                    tokio::spawn(handler::dial(
                        ServiceKind::Task,
                        config.supervisor_address.clone(),
                        conn_id,
                        events_tx.clone(),
                    ));
                }
                central.promote_respawns();
                central.post_metrics();
                central.refresh_gauges();
                let _ = status_tx.send(central.status_snapshot());
            }
        }
    };

    let _ = shutdown_tx.send(());
    result
}

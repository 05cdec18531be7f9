// src/central/scenes.rs

//! The scene directory: the single authoritative mapping of scene id to
//! scene-authority process, plus the game workers parked waiting for one.

use crate::connection::ConnectionId;
use crate::core::metrics;
use std::collections::{HashMap, VecDeque};
use tracing::{info, warn};

/// Where a scene's authority endpoint lives, as told to game workers.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthorityEndpoint {
    pub address: String,
    pub port: u16,
}

/// Lifecycle of one scene's authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneState {
    /// No authority; workers park and a spawn may be in flight.
    Absent,
    /// An authority connected but has not persisted its root object yet.
    Attaching,
    /// The authority is serving; pending workers have been released.
    Ready,
}

/// Per-scene record held by the cluster head.
#[derive(Debug)]
pub struct SceneEntry {
    pub state: SceneState,
    pub authority_conn: Option<ConnectionId>,
    pub endpoint: Option<AuthorityEndpoint>,
    pub planet_object_id: Option<u64>,
    /// Game workers waiting for this scene to become ready, oldest first.
    pub pending: VecDeque<ConnectionId>,
    /// Whether a replacement-authority spawn has already been requested.
    pub spawn_requested: bool,
}

impl SceneEntry {
    fn new() -> Self {
        Self {
            state: SceneState::Absent,
            authority_conn: None,
            endpoint: None,
            planet_object_id: None,
            pending: VecDeque::new(),
            spawn_requested: false,
        }
    }
}

/// Result of a scene-authority registration.
#[derive(Debug, PartialEq, Eq)]
pub enum AttachOutcome {
    Attached,
    /// A record already existed; the previous authority was superseded.
    Superseded { previous: ConnectionId },
}

/// Result of a game worker's scene request.
#[derive(Debug, PartialEq)]
pub enum RequestOutcome {
    /// The scene is ready; tell the worker where the authority lives.
    Ready(AuthorityEndpoint),
    /// The worker is parked; `needs_spawn` asks for a new authority.
    Parked { needs_spawn: bool },
}

/// All scene records plus the pending-attachment bound.
#[derive(Debug)]
pub struct SceneDirectory {
    scenes: HashMap<String, SceneEntry>,
    pending_limit: usize,
}

impl SceneDirectory {
    pub fn new(pending_limit: usize) -> Self {
        Self {
            scenes: HashMap::new(),
            pending_limit: pending_limit.max(1),
        }
    }

    pub fn get(&self, scene_id: &str) -> Option<&SceneEntry> {
        self.scenes.get(scene_id)
    }

    pub fn ready_count(&self) -> usize {
        self.scenes
            .values()
            .filter(|s| s.state == SceneState::Ready)
            .count()
    }

    pub fn pending_count(&self) -> usize {
        self.scenes.values().map(|s| s.pending.len()).sum()
    }

    pub fn scene_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.scenes.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Registers a scene authority. A record with a live authority is a
    /// duplicate registration: the new authority supersedes it.
    pub fn attach(
        &mut self,
        scene_id: &str,
        authority_conn: ConnectionId,
        endpoint: AuthorityEndpoint,
    ) -> AttachOutcome {
        let entry = self
            .scenes
            .entry(scene_id.to_string())
            .or_insert_with(SceneEntry::new);
        let previous = entry.authority_conn;
        entry.authority_conn = Some(authority_conn);
        entry.endpoint = Some(endpoint);
        entry.state = SceneState::Attaching;
        entry.planet_object_id = None;
        entry.spawn_requested = false;

        match previous {
            Some(previous) if previous != authority_conn => {
                warn!(
                    "Duplicate scene registration for '{}'; superseding authority on {}",
                    scene_id, previous
                );
                AttachOutcome::Superseded { previous }
            }
            _ => AttachOutcome::Attached,
        }
    }

    /// Marks a scene ready once its authority reports the persisted root
    /// object. Returns the drained pending workers, each owed exactly one
    /// `SetSceneAuthority`, along with the endpoint to announce.
    pub fn set_ready(
        &mut self,
        scene_id: &str,
        authority_conn: ConnectionId,
        planet_object_id: u64,
    ) -> Option<(AuthorityEndpoint, Vec<ConnectionId>)> {
        let entry = self.scenes.get_mut(scene_id)?;
        if entry.authority_conn != Some(authority_conn) {
            warn!(
                "PlanetObjectId for '{}' from a connection that is not its authority; ignoring",
                scene_id
            );
            return None;
        }
        entry.state = SceneState::Ready;
        entry.planet_object_id = Some(planet_object_id);
        let endpoint = entry.endpoint.clone()?;
        let released: Vec<ConnectionId> = entry.pending.drain(..).collect();
        info!(
            "Scene '{}' is ready (root object {}); releasing {} pending workers",
            scene_id,
            planet_object_id,
            released.len()
        );
        Some((endpoint, released))
    }

    /// Handles a game worker's request for a scene.
    pub fn request(&mut self, scene_id: &str, worker_conn: ConnectionId) -> RequestOutcome {
        let entry = self
            .scenes
            .entry(scene_id.to_string())
            .or_insert_with(SceneEntry::new);

        if entry.state == SceneState::Ready {
            if let Some(endpoint) = entry.endpoint.clone() {
                return RequestOutcome::Ready(endpoint);
            }
        }

        if !entry.pending.contains(&worker_conn) {
            entry.pending.push_back(worker_conn);
            // The pending list is bounded; a scene that cannot come up must
            // not accumulate workers without limit.
            while entry.pending.len() > self.pending_limit {
                let dropped = entry.pending.pop_front();
                warn!(
                    "Pending list for scene '{}' exceeded {} entries; dropping {:?}",
                    scene_id, self.pending_limit, dropped
                );
                metrics::PENDING_ATTACHMENTS_DROPPED_TOTAL.inc();
            }
        }

        let needs_spawn = entry.state == SceneState::Absent && !entry.spawn_requested;
        if needs_spawn {
            entry.spawn_requested = true;
        }
        RequestOutcome::Parked { needs_spawn }
    }

    /// Removes a disconnected worker from every pending list.
    pub fn on_worker_disconnect(&mut self, worker_conn: ConnectionId) {
        for entry in self.scenes.values_mut() {
            entry.pending.retain(|conn| *conn != worker_conn);
        }
    }

    /// Handles the loss of an authority connection. Returns the scene that
    /// lost its authority, if any; its pending list stays intact awaiting a
    /// replacement.
    pub fn on_authority_closed(&mut self, authority_conn: ConnectionId) -> Option<String> {
        let scene_id = self
            .scenes
            .iter()
            .find(|(_, entry)| entry.authority_conn == Some(authority_conn))
            .map(|(id, _)| id.clone())?;
        let entry = self.scenes.get_mut(&scene_id)?;
        entry.authority_conn = None;
        entry.endpoint = None;
        entry.planet_object_id = None;
        entry.state = SceneState::Absent;
        entry.spawn_requested = false;
        warn!("Scene '{}' lost its authority", scene_id);
        Some(scene_id)
    }

    /// Marks that a replacement spawn was requested for a scene.
    pub fn mark_spawn_requested(&mut self, scene_id: &str) {
        if let Some(entry) = self.scenes.get_mut(scene_id) {
            entry.spawn_requested = true;
        }
    }
}

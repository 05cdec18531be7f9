// src/core/protocol/messages.rs

//! The typed control-plane message set and its hash-based dispatch table.
//!
//! Messages are identified on the wire by the CRC-32 of their stable name.
//! The hashes for all known types are precomputed into a lookup table;
//! frames whose hash is not in the table decode to `None` and flow through
//! the receiver's default path as opaque payloads.

use crate::core::ShardError;
use crate::core::protocol::WireFrame;
use bincode::config;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum_macros::{Display, EnumString};

const CRC32: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// Computes the wire type hash for a message name.
pub fn message_type_hash(name: &str) -> u32 {
    CRC32.checksum(name.as_bytes())
}

/// The role a process declares in its `TaskConnectionId` handshake.
/// Message handling on a shared transport is specialized by this tag.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
    Display,
    EnumString,
)]
pub enum ServerRole {
    TaskManager,
    Central,
    Game,
    Database,
    Metrics,
    Planet,
    Chat,
    Connection,
}

// --- Message payloads ---
//
// One struct per wire message, mirroring the stable names used for the type
// hash. All derive both serde and bincode; the wire encoding is bincode with
// the standard configuration.

/// Role handshake, sent first on every control-plane connection.
///
/// `node_label` is only meaningful for `TaskManager` peers; other roles
/// leave it empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct TaskConnectionId {
    pub role: ServerRole,
    pub command_line: String,
    pub cluster_name: String,
    pub node_label: String,
}

/// A slave supervisor's wall clock, for divergence detection on the master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct SystemTimeCheck {
    pub node_label: String,
    pub seconds: i64,
}

/// Master's report of slaves that disconnected and have not reconnected,
/// plus its system-time divergence flag, for operator alerting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct DisconnectedTaskManagers {
    pub csv: String,
    pub system_time_mismatch: bool,
}

/// A spawn request routed between supervisors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct TaskSpawnProcess {
    pub node_label: String,
    pub process_name: String,
    pub options: String,
    pub transaction_id: u64,
}

/// Acknowledgement that a forwarded spawn request was attempted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct TaskSpawnAck {
    pub transaction_id: u64,
}

/// Kill (or force-core) a process on a specific host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct TaskKillProcess {
    pub host: String,
    pub pid: u32,
    pub force_core: bool,
}

/// A supervisor observed one of its children exit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct ProcessDied {
    pub pid: u32,
    pub command_line: String,
}

/// Fleet-wide decision to kill a game worker considered faulty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct ExcommunicateGameServer {
    pub host: String,
    pub pid: u32,
}

/// Authoritative load refresh from a slave, sent with its heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct TaskLoadUpdate {
    pub node_label: String,
    pub current_load: f32,
    pub maximum_load: f32,
}

/// A scene authority announces ownership of a scene to the cluster head,
/// including the endpoint game workers should attach to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct AttachSceneAuthority {
    pub scene_id: String,
    pub address: String,
    pub port: u16,
}

/// The scene authority has persisted its root object; the scene is ready.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct PlanetObjectId {
    pub scene_id: String,
    pub planet_object_id: u64,
}

/// Notification that a scene lost its authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct SceneAuthorityClosed {
    pub scene_id: String,
}

/// Tells a parked game worker where its scene authority lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct SetSceneAuthority {
    pub address: String,
    pub port: u16,
}

/// A game worker asks the cluster head for a scene's authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct RequestSceneAuthority {
    pub scene_id: String,
}

/// Ask the database worker to persist everything it can, ahead of a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct CentralRequestSave;

/// Open or lock the cluster to the public; fanned out to connection gateways.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct SetConnectionServersPublic {
    pub public: bool,
}

/// Opens a forwarding scope on a scene-authority connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct BeginForward {
    pub worker_ids: Vec<u32>,
}

/// Closes the innermost forwarding scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct EndForward;

/// Periodic liveness signal from a worker to its supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct WorkerKeepAlive {
    pub pid: u32,
}

/// Metrics upload to the database worker: named counters plus opaque
/// statistics sections that the control plane passes through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct PostMetrics {
    pub counters: Vec<(String, i64)>,
    pub statistics: Vec<(String, Vec<(String, i64)>)>,
}

/// A fully decoded control-plane message.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    TaskConnectionId(TaskConnectionId),
    SystemTimeCheck(SystemTimeCheck),
    DisconnectedTaskManagers(DisconnectedTaskManagers),
    TaskSpawnProcess(TaskSpawnProcess),
    TaskSpawnAck(TaskSpawnAck),
    TaskKillProcess(TaskKillProcess),
    ProcessDied(ProcessDied),
    ExcommunicateGameServer(ExcommunicateGameServer),
    TaskLoadUpdate(TaskLoadUpdate),
    AttachSceneAuthority(AttachSceneAuthority),
    PlanetObjectId(PlanetObjectId),
    SceneAuthorityClosed(SceneAuthorityClosed),
    SetSceneAuthority(SetSceneAuthority),
    RequestSceneAuthority(RequestSceneAuthority),
    CentralRequestSave(CentralRequestSave),
    SetConnectionServersPublic(SetConnectionServersPublic),
    BeginForward(BeginForward),
    EndForward(EndForward),
    WorkerKeepAlive(WorkerKeepAlive),
    PostMetrics(PostMetrics),
}

/// Discriminant used by the hash lookup table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageKind {
    TaskConnectionId,
    SystemTimeCheck,
    DisconnectedTaskManagers,
    TaskSpawnProcess,
    TaskSpawnAck,
    TaskKillProcess,
    ProcessDied,
    ExcommunicateGameServer,
    TaskLoadUpdate,
    AttachSceneAuthority,
    PlanetObjectId,
    SceneAuthorityClosed,
    SetSceneAuthority,
    RequestSceneAuthority,
    CentralRequestSave,
    SetConnectionServersPublic,
    BeginForward,
    EndForward,
    WorkerKeepAlive,
    PostMetrics,
}

const ALL_KINDS: [(&str, MessageKind); 20] = [
    ("TaskConnectionId", MessageKind::TaskConnectionId),
    ("SystemTimeCheck", MessageKind::SystemTimeCheck),
    ("DisconnectedTaskManagers", MessageKind::DisconnectedTaskManagers),
    ("TaskSpawnProcess", MessageKind::TaskSpawnProcess),
    ("TaskSpawnAck", MessageKind::TaskSpawnAck),
    ("TaskKillProcess", MessageKind::TaskKillProcess),
    ("ProcessDied", MessageKind::ProcessDied),
    ("ExcommunicateGameServer", MessageKind::ExcommunicateGameServer),
    ("TaskLoadUpdate", MessageKind::TaskLoadUpdate),
    ("AttachSceneAuthority", MessageKind::AttachSceneAuthority),
    ("PlanetObjectId", MessageKind::PlanetObjectId),
    ("SceneAuthorityClosed", MessageKind::SceneAuthorityClosed),
    ("SetSceneAuthority", MessageKind::SetSceneAuthority),
    ("RequestSceneAuthority", MessageKind::RequestSceneAuthority),
    ("CentralRequestSave", MessageKind::CentralRequestSave),
    ("SetConnectionServersPublic", MessageKind::SetConnectionServersPublic),
    ("BeginForward", MessageKind::BeginForward),
    ("EndForward", MessageKind::EndForward),
    ("WorkerKeepAlive", MessageKind::WorkerKeepAlive),
    ("PostMetrics", MessageKind::PostMetrics),
];

/// Precomputed hash -> kind lookup, built once at startup.
static HASH_TABLE: Lazy<HashMap<u32, MessageKind>> = Lazy::new(|| {
    let mut table = HashMap::with_capacity(ALL_KINDS.len());
    for (name, kind) in ALL_KINDS {
        let prev = table.insert(message_type_hash(name), kind);
        assert!(prev.is_none(), "type hash collision for message '{name}'");
    }
    table
});

fn decode_payload<T: bincode::Decode<()>>(
    name: &'static str,
    payload: &[u8],
) -> Result<T, ShardError> {
    bincode::decode_from_slice::<T, _>(payload, config::standard())
        .map(|(value, _)| value)
        .map_err(|e| ShardError::MalformedPayload(name, e.to_string()))
}

impl ControlMessage {
    /// The stable wire name of this message.
    pub fn name(&self) -> &'static str {
        match self {
            ControlMessage::TaskConnectionId(_) => "TaskConnectionId",
            ControlMessage::SystemTimeCheck(_) => "SystemTimeCheck",
            ControlMessage::DisconnectedTaskManagers(_) => "DisconnectedTaskManagers",
            ControlMessage::TaskSpawnProcess(_) => "TaskSpawnProcess",
            ControlMessage::TaskSpawnAck(_) => "TaskSpawnAck",
            ControlMessage::TaskKillProcess(_) => "TaskKillProcess",
            ControlMessage::ProcessDied(_) => "ProcessDied",
            ControlMessage::ExcommunicateGameServer(_) => "ExcommunicateGameServer",
            ControlMessage::TaskLoadUpdate(_) => "TaskLoadUpdate",
            ControlMessage::AttachSceneAuthority(_) => "AttachSceneAuthority",
            ControlMessage::PlanetObjectId(_) => "PlanetObjectId",
            ControlMessage::SceneAuthorityClosed(_) => "SceneAuthorityClosed",
            ControlMessage::SetSceneAuthority(_) => "SetSceneAuthority",
            ControlMessage::RequestSceneAuthority(_) => "RequestSceneAuthority",
            ControlMessage::CentralRequestSave(_) => "CentralRequestSave",
            ControlMessage::SetConnectionServersPublic(_) => "SetConnectionServersPublic",
            ControlMessage::BeginForward(_) => "BeginForward",
            ControlMessage::EndForward(_) => "EndForward",
            ControlMessage::WorkerKeepAlive(_) => "WorkerKeepAlive",
            ControlMessage::PostMetrics(_) => "PostMetrics",
        }
    }

    /// The wire type hash of this message.
    pub fn type_hash(&self) -> u32 {
        message_type_hash(self.name())
    }

    /// Encodes this message into a wire frame.
    pub fn to_frame(&self) -> Result<WireFrame, ShardError> {
        let cfg = config::standard();
        let payload = match self {
            ControlMessage::TaskConnectionId(m) => bincode::encode_to_vec(m, cfg)?,
            ControlMessage::SystemTimeCheck(m) => bincode::encode_to_vec(m, cfg)?,
            ControlMessage::DisconnectedTaskManagers(m) => bincode::encode_to_vec(m, cfg)?,
            ControlMessage::TaskSpawnProcess(m) => bincode::encode_to_vec(m, cfg)?,
            ControlMessage::TaskSpawnAck(m) => bincode::encode_to_vec(m, cfg)?,
            ControlMessage::TaskKillProcess(m) => bincode::encode_to_vec(m, cfg)?,
            ControlMessage::ProcessDied(m) => bincode::encode_to_vec(m, cfg)?,
            ControlMessage::ExcommunicateGameServer(m) => bincode::encode_to_vec(m, cfg)?,
            ControlMessage::TaskLoadUpdate(m) => bincode::encode_to_vec(m, cfg)?,
            ControlMessage::AttachSceneAuthority(m) => bincode::encode_to_vec(m, cfg)?,
            ControlMessage::PlanetObjectId(m) => bincode::encode_to_vec(m, cfg)?,
            ControlMessage::SceneAuthorityClosed(m) => bincode::encode_to_vec(m, cfg)?,
            ControlMessage::SetSceneAuthority(m) => bincode::encode_to_vec(m, cfg)?,
            ControlMessage::RequestSceneAuthority(m) => bincode::encode_to_vec(m, cfg)?,
            ControlMessage::CentralRequestSave(m) => bincode::encode_to_vec(m, cfg)?,
            ControlMessage::SetConnectionServersPublic(m) => bincode::encode_to_vec(m, cfg)?,
            ControlMessage::BeginForward(m) => bincode::encode_to_vec(m, cfg)?,
            ControlMessage::EndForward(m) => bincode::encode_to_vec(m, cfg)?,
            ControlMessage::WorkerKeepAlive(m) => bincode::encode_to_vec(m, cfg)?,
            ControlMessage::PostMetrics(m) => bincode::encode_to_vec(m, cfg)?,
        };
        Ok(WireFrame::new(self.type_hash(), payload))
    }

    /// Decodes a frame into a typed message.
    ///
    /// Returns `Ok(None)` for unknown type hashes: those frames are opaque
    /// payloads and flow through the receiver's default path.
    pub fn from_frame(frame: &WireFrame) -> Result<Option<ControlMessage>, ShardError> {
        let Some(kind) = HASH_TABLE.get(&frame.type_hash) else {
            return Ok(None);
        };
        let p = frame.payload.as_ref();
        let msg = match kind {
            MessageKind::TaskConnectionId => {
                ControlMessage::TaskConnectionId(decode_payload("TaskConnectionId", p)?)
            }
            MessageKind::SystemTimeCheck => {
                ControlMessage::SystemTimeCheck(decode_payload("SystemTimeCheck", p)?)
            }
            MessageKind::DisconnectedTaskManagers => ControlMessage::DisconnectedTaskManagers(
                decode_payload("DisconnectedTaskManagers", p)?,
            ),
            MessageKind::TaskSpawnProcess => {
                ControlMessage::TaskSpawnProcess(decode_payload("TaskSpawnProcess", p)?)
            }
            MessageKind::TaskSpawnAck => {
                ControlMessage::TaskSpawnAck(decode_payload("TaskSpawnAck", p)?)
            }
            MessageKind::TaskKillProcess => {
                ControlMessage::TaskKillProcess(decode_payload("TaskKillProcess", p)?)
            }
            MessageKind::ProcessDied => {
                ControlMessage::ProcessDied(decode_payload("ProcessDied", p)?)
            }
            MessageKind::ExcommunicateGameServer => ControlMessage::ExcommunicateGameServer(
                decode_payload("ExcommunicateGameServer", p)?,
            ),
            MessageKind::TaskLoadUpdate => {
                ControlMessage::TaskLoadUpdate(decode_payload("TaskLoadUpdate", p)?)
            }
            MessageKind::AttachSceneAuthority => {
                ControlMessage::AttachSceneAuthority(decode_payload("AttachSceneAuthority", p)?)
            }
            MessageKind::PlanetObjectId => {
                ControlMessage::PlanetObjectId(decode_payload("PlanetObjectId", p)?)
            }
            MessageKind::SceneAuthorityClosed => {
                ControlMessage::SceneAuthorityClosed(decode_payload("SceneAuthorityClosed", p)?)
            }
            MessageKind::SetSceneAuthority => {
                ControlMessage::SetSceneAuthority(decode_payload("SetSceneAuthority", p)?)
            }
            MessageKind::RequestSceneAuthority => {
                ControlMessage::RequestSceneAuthority(decode_payload("RequestSceneAuthority", p)?)
            }
            MessageKind::CentralRequestSave => {
                ControlMessage::CentralRequestSave(decode_payload("CentralRequestSave", p)?)
            }
            MessageKind::SetConnectionServersPublic => ControlMessage::SetConnectionServersPublic(
                decode_payload("SetConnectionServersPublic", p)?,
            ),
            MessageKind::BeginForward => {
                ControlMessage::BeginForward(decode_payload("BeginForward", p)?)
            }
            MessageKind::EndForward => {
                ControlMessage::EndForward(decode_payload("EndForward", p)?)
            }
            MessageKind::WorkerKeepAlive => {
                ControlMessage::WorkerKeepAlive(decode_payload("WorkerKeepAlive", p)?)
            }
            MessageKind::PostMetrics => {
                ControlMessage::PostMetrics(decode_payload("PostMetrics", p)?)
            }
        };
        Ok(Some(msg))
    }
}

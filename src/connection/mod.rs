// src/connection/mod.rs

//! Transport plumbing between control-plane processes.
//!
//! Connection tasks own the sockets; the main loop owns all state. The two
//! meet over channels: every reader forwards decoded frames into the main
//! loop's event queue, and the main loop writes through per-connection
//! handles drained by the connection task. Dropping a handle closes the
//! connection.

pub mod datagram;
pub mod handler;
pub mod listener;

use crate::core::ShardError;
use crate::core::protocol::{ControlMessage, WireFrame};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Identifies one live connection within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Allocates process-unique connection ids.
#[derive(Debug, Default)]
pub struct ConnectionIdAllocator {
    next: AtomicU64,
}

impl ConnectionIdAllocator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn allocate(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Which local service a connection arrived on (or was dialed for).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    /// Supervisor-to-supervisor links.
    Peer,
    /// Workers, the cluster head, and peripherals on a supervisor.
    Task,
    /// Worker-facing service on the cluster head.
    Central,
}

/// Events surfaced to a main loop by its connection tasks.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A connection is live (accepted or successfully dialed).
    Opened {
        service: ServiceKind,
        conn_id: ConnectionId,
        peer_addr: SocketAddr,
        handle: ConnectionHandle,
    },
    /// A decoded frame arrived.
    Frame {
        conn_id: ConnectionId,
        frame: WireFrame,
    },
    /// The connection is gone; the main loop must drop its handle.
    Closed { conn_id: ConnectionId },
    /// An outbound dial failed; the caller decides when to retry.
    DialFailed {
        service: ServiceKind,
        conn_id: ConnectionId,
    },
}

/// The main loop's write side of one connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub conn_id: ConnectionId,
    pub peer_addr: SocketAddr,
    outbound_tx: mpsc::UnboundedSender<WireFrame>,
}

impl ConnectionHandle {
    pub fn new(
        conn_id: ConnectionId,
        peer_addr: SocketAddr,
    ) -> (Self, mpsc::UnboundedReceiver<WireFrame>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        (
            Self {
                conn_id,
                peer_addr,
                outbound_tx,
            },
            outbound_rx,
        )
    }

    /// Queues a raw frame for sending. Fails only when the connection task
    /// is already gone.
    pub fn send_frame(&self, frame: WireFrame) -> Result<(), ShardError> {
        self.outbound_tx
            .send(frame)
            .map_err(|_| ShardError::ConnectionClosed)
    }

    /// Encodes and queues a typed control message.
    pub fn send_message(&self, message: &ControlMessage) -> Result<(), ShardError> {
        self.send_frame(message.to_frame()?)
    }

    /// Whether the connection task is still draining this handle.
    pub fn is_open(&self) -> bool {
        !self.outbound_tx.is_closed()
    }
}

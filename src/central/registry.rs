// src/central/registry.rs

//! The cluster head's table of worker connections, specialized by the role
//! each peer declares in its handshake.
//!
//! Role counts feed the liveness dashboard and metrics upload; they are
//! never inputs to routing decisions.

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::core::protocol::ServerRole;
use std::collections::HashMap;
use std::net::SocketAddr;

/// One registered connection on the cluster head's service.
#[derive(Debug)]
pub struct RegisteredConn {
    pub conn_id: ConnectionId,
    pub handle: ConnectionHandle,
    pub peer_addr: SocketAddr,
    pub role: Option<ServerRole>,
    pub command_line: String,
    /// Worker process identifier, assigned to game workers at registration;
    /// scene authorities address forwarded frames by this id.
    pub worker_id: Option<u32>,
}

/// Connection table with role indexes.
#[derive(Debug)]
pub struct ConnectionRegistry {
    conns: HashMap<ConnectionId, RegisteredConn>,
    workers_by_id: HashMap<u32, ConnectionId>,
    next_worker_id: u32,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            conns: HashMap::new(),
            workers_by_id: HashMap::new(),
            next_worker_id: 1,
        }
    }

    /// Records a freshly accepted, not-yet-identified connection.
    pub fn register(&mut self, conn_id: ConnectionId, handle: ConnectionHandle, peer_addr: SocketAddr) {
        self.conns.insert(
            conn_id,
            RegisteredConn {
                conn_id,
                handle,
                peer_addr,
                role: None,
                command_line: String::new(),
                worker_id: None,
            },
        );
    }

    /// Applies a handshake. Game workers get a worker id; the id is returned
    /// for logging.
    pub fn identify(
        &mut self,
        conn_id: ConnectionId,
        role: ServerRole,
        command_line: String,
    ) -> Option<u32> {
        let conn = self.conns.get_mut(&conn_id)?;
        conn.role = Some(role);
        conn.command_line = command_line;
        if role == ServerRole::Game {
            let worker_id = self.next_worker_id;
            self.next_worker_id += 1;
            conn.worker_id = Some(worker_id);
            self.workers_by_id.insert(worker_id, conn_id);
            return Some(worker_id);
        }
        None
    }

    /// Drops a connection, returning its record for teardown handling.
    pub fn remove(&mut self, conn_id: ConnectionId) -> Option<RegisteredConn> {
        let conn = self.conns.remove(&conn_id)?;
        if let Some(worker_id) = conn.worker_id {
            self.workers_by_id.remove(&worker_id);
        }
        Some(conn)
    }

    pub fn get(&self, conn_id: ConnectionId) -> Option<&RegisteredConn> {
        self.conns.get(&conn_id)
    }

    pub fn role_of(&self, conn_id: ConnectionId) -> Option<ServerRole> {
        self.conns.get(&conn_id).and_then(|c| c.role)
    }

    /// The live handle for a game worker id, if that worker is connected.
    pub fn worker_handle(&self, worker_id: u32) -> Option<&ConnectionHandle> {
        let conn_id = self.workers_by_id.get(&worker_id)?;
        self.conns.get(conn_id).map(|c| &c.handle)
    }

    pub fn count(&self, role: ServerRole) -> usize {
        self.conns
            .values()
            .filter(|c| c.role == Some(role))
            .count()
    }

    pub fn with_role(&self, role: ServerRole) -> impl Iterator<Item = &RegisteredConn> {
        self.conns.values().filter(move |c| c.role == Some(role))
    }

    /// The database worker the head uploads metrics and save requests to.
    pub fn database(&self) -> Option<&RegisteredConn> {
        self.with_role(ServerRole::Database).next()
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}

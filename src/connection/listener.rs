// src/connection/listener.rs

//! Accept loops for the control-plane TCP services.

use crate::connection::{
    ConnectionEvent, ConnectionHandle, ConnectionIdAllocator, ServiceKind,
};
use crate::connection::handler::run_connection;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};

/// Accepts connections on one service port until shutdown, spawning a
/// connection task per accepted socket.
pub async fn run_listener(
    service: ServiceKind,
    listener: TcpListener,
    ids: Arc<ConnectionIdAllocator>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => {
                info!("{:?} service listener shutting down.", service);
                break;
            }

            res = listener.accept() => {
                match res {
                    Ok((socket, peer_addr)) => {
                        accept_connection(service, socket, peer_addr, &ids, &events_tx);
                    }
                    Err(e) => {
                        error!("Failed to accept connection on {:?} service: {}", service, e);
                    }
                }
            }
        }
    }
}

fn accept_connection(
    service: ServiceKind,
    socket: tokio::net::TcpStream,
    peer_addr: SocketAddr,
    ids: &ConnectionIdAllocator,
    events_tx: &mpsc::UnboundedSender<ConnectionEvent>,
) {
    let conn_id = ids.allocate();
    info!("Accepted {} from {} on {:?} service", conn_id, peer_addr, service);

    let (handle, outbound_rx) = ConnectionHandle::new(conn_id, peer_addr);
    if events_tx
        .send(ConnectionEvent::Opened {
            service,
            conn_id,
            peer_addr,
            handle,
        })
        .is_err()
    {
        return;
    }

    let events_tx = events_tx.clone();
    tokio::spawn(async move {
        run_connection(socket, conn_id, peer_addr, events_tx, outbound_rx).await;
    });
}

/// Binds a service listener, mapping bind errors into a startup failure.
pub async fn bind(interface: &str, port: u16) -> anyhow::Result<TcpListener> {
    let addr: SocketAddr = format!("{interface}:{port}").parse()?;
    let listener = TcpListener::bind(addr).await?;
    Ok(listener)
}

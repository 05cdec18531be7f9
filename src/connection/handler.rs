// src/connection/handler.rs

//! The per-connection task: one `tokio::select!` loop over the framed socket
//! and the main loop's outbound queue.

use crate::connection::{ConnectionEvent, ConnectionHandle, ConnectionId, ServiceKind};
use crate::core::ShardError;
use crate::core::protocol::{FrameCodec, WireFrame};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// Runs one connection until the peer closes, an IO error occurs, or the
/// main loop drops the `ConnectionHandle`.
pub async fn run_connection(
    stream: TcpStream,
    conn_id: ConnectionId,
    peer_addr: SocketAddr,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    mut outbound_rx: mpsc::UnboundedReceiver<WireFrame>,
) {
    let mut framed = Framed::new(stream, FrameCodec);

    loop {
        tokio::select! {
            biased;

            maybe_frame = outbound_rx.recv() => {
                match maybe_frame {
                    Some(frame) => {
                        if let Err(e) = framed.send(frame).await {
                            warn!("Send error on {} ({}): {}", conn_id, peer_addr, e);
                            break;
                        }
                    }
                    // The main loop dropped the handle: active close.
                    None => {
                        debug!("{} ({}) closed locally.", conn_id, peer_addr);
                        break;
                    }
                }
            }

            result = framed.next() => {
                match result {
                    Some(Ok(frame)) => {
                        if events_tx.send(ConnectionEvent::Frame { conn_id, frame }).is_err() {
                            // The main loop is gone; nothing left to do.
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        if is_normal_disconnect(&e) {
                            debug!("Connection {} from {} closed by peer: {}", conn_id, peer_addr, e);
                        } else {
                            warn!("Connection error on {} ({}): {}", conn_id, peer_addr, e);
                        }
                        break;
                    }
                    None => {
                        debug!("Connection {} from {} closed by peer.", conn_id, peer_addr);
                        break;
                    }
                }
            }
        }
    }

    let _ = events_tx.send(ConnectionEvent::Closed { conn_id });
}

/// Dials a peer and hands the resulting connection to the main loop.
///
/// Failures surface as `DialFailed`; the caller owns the retry cadence.
pub async fn dial(
    service: ServiceKind,
    target: String,
    conn_id: ConnectionId,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
) {
    match TcpStream::connect(&target).await {
        Ok(stream) => {
            let peer_addr = stream
                .peer_addr()
                .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
            info!("Connected to {} ({:?} service) as {}", target, service, conn_id);
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
            run_connection(stream, conn_id, peer_addr, events_tx, outbound_rx).await;
        }
        Err(e) => {
            debug!("Dial to {} failed: {}", target, e);
            let _ = events_tx.send(ConnectionEvent::DialFailed { service, conn_id });
        }
    }
}

/// Helper function to check for non-critical disconnection errors.
fn is_normal_disconnect(e: &ShardError) -> bool {
    matches!(e, ShardError::Io(arc_err) if matches!(
        arc_err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionAborted
    ))
}

// tests/integration/transport_test.rs

//! Drives the TCP and datagram transports over the loopback interface:
//! accept, dial, exchange typed frames, observe teardown.

use shardd::config::DatagramConfig;
use shardd::connection::datagram::DatagramNode;
use shardd::connection::{
    ConnectionEvent, ConnectionHandle, ConnectionId, ConnectionIdAllocator, ServiceKind, handler,
    listener,
};
use shardd::core::protocol::{ControlMessage, messages};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn next_event(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a connection event")
        .expect("event channel closed")
}

fn keepalive(pid: u32) -> ControlMessage {
    ControlMessage::WorkerKeepAlive(messages::WorkerKeepAlive { pid })
}

#[tokio::test]
async fn test_tcp_dial_accept_and_frame_exchange() {
    let ids = ConnectionIdAllocator::new();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, _) = broadcast::channel(1);

    let listener_socket = listener::bind("127.0.0.1", 0).await.unwrap();
    let port = listener_socket.local_addr().unwrap().port();
    tokio::spawn(listener::run_listener(
        ServiceKind::Task,
        listener_socket,
        ids.clone(),
        events_tx.clone(),
        shutdown_tx.subscribe(),
    ));

    let dial_conn_id = ids.allocate();
    tokio::spawn(handler::dial(
        ServiceKind::Task,
        format!("127.0.0.1:{port}"),
        dial_conn_id,
        events_tx.clone(),
    ));

    // Both sides surface an Opened event on the shared queue.
    let mut dialer: Option<ConnectionHandle> = None;
    let mut accepted: Option<(ConnectionId, ConnectionHandle)> = None;
    while dialer.is_none() || accepted.is_none() {
        match next_event(&mut events_rx).await {
            ConnectionEvent::Opened {
                conn_id, handle, ..
            } if conn_id == dial_conn_id => dialer = Some(handle),
            ConnectionEvent::Opened {
                conn_id, handle, ..
            } => accepted = Some((conn_id, handle)),
            other => panic!("unexpected event {other:?}"),
        }
    }
    let dialer = dialer.unwrap();
    let (accepted_id, _accepted_handle) = accepted.unwrap();

    // A frame from the dialer arrives tagged with the acceptor's conn id.
    dialer.send_message(&keepalive(1234)).unwrap();
    loop {
        match next_event(&mut events_rx).await {
            ConnectionEvent::Frame { conn_id, frame } => {
                assert_eq!(conn_id, accepted_id);
                let decoded = ControlMessage::from_frame(&frame).unwrap().unwrap();
                assert_eq!(decoded, keepalive(1234));
                break;
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    // Dropping the dialer's handle closes the link; the acceptor side
    // observes the loss.
    drop(dialer);
    let mut saw_accepted_close = false;
    while !saw_accepted_close {
        if let ConnectionEvent::Closed { conn_id } = next_event(&mut events_rx).await {
            if conn_id == accepted_id {
                saw_accepted_close = true;
            }
        }
    }
}

#[tokio::test]
async fn test_dial_failure_is_reported() {
    let ids = ConnectionIdAllocator::new();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();

    let conn_id = ids.allocate();
    // Port 1 on loopback is about as reliably closed as it gets.
    tokio::spawn(handler::dial(
        ServiceKind::Peer,
        "127.0.0.1:1".to_string(),
        conn_id,
        events_tx,
    ));

    match next_event(&mut events_rx).await {
        ConnectionEvent::DialFailed {
            conn_id: failed, ..
        } => assert_eq!(failed, conn_id),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_datagram_channel_frame_exchange() {
    let config = DatagramConfig {
        port_offset: 0,
        retransmit_timeout: Duration::from_millis(100),
        send_window: 32,
    };

    let ids_a = ConnectionIdAllocator::new();
    let ids_b = ConnectionIdAllocator::new();
    let (events_a_tx, mut events_a_rx) = mpsc::unbounded_channel();
    let (events_b_tx, mut events_b_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, _) = broadcast::channel(1);

    // Bind both ends on ephemeral ports, then point A at B.
    let node_b = DatagramNode::bind("127.0.0.1", 0, config.clone(), ids_b, events_b_tx)
        .await
        .unwrap();
    let b_addr = node_b.local_addr().unwrap();
    let mut node_a = DatagramNode::bind("127.0.0.1", 0, config.clone(), ids_a, events_a_tx)
        .await
        .unwrap();

    node_a.dial(ServiceKind::Peer, b_addr);
    tokio::spawn(node_a.run(ServiceKind::Peer, shutdown_tx.subscribe()));
    tokio::spawn(node_b.run(ServiceKind::Peer, shutdown_tx.subscribe()));

    // A's channel opens immediately on dial.
    let a_handle = match next_event(&mut events_a_rx).await {
        ConnectionEvent::Opened { handle, .. } => handle,
        other => panic!("unexpected event {other:?}"),
    };

    a_handle.send_message(&keepalive(77)).unwrap();

    // B opens its side lazily on the first datagram, then delivers the frame.
    let mut delivered = None;
    while delivered.is_none() {
        match next_event(&mut events_b_rx).await {
            ConnectionEvent::Opened { .. } => {}
            ConnectionEvent::Frame { frame, .. } => delivered = Some(frame),
            other => panic!("unexpected event {other:?}"),
        }
    }
    let decoded = ControlMessage::from_frame(&delivered.unwrap()).unwrap().unwrap();
    assert_eq!(decoded, keepalive(77));
}

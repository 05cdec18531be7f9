// src/connection/datagram.rs

//! The reliable ordered datagram channel.
//!
//! Control-plane peers can run over UDP instead of TCP; this module supplies
//! the reliability and ordering the raw socket lacks. Each direction carries
//! sequenced `Data` segments acknowledged cumulatively; unacknowledged
//! segments are retransmitted on a timer, and out-of-order arrivals are
//! parked in a reorder buffer until the gap fills. Delivered bytes are whole
//! wire frames, so the channel plugs into the same `ConnectionEvent` flow as
//! the TCP transport.

use crate::config::DatagramConfig;
use crate::connection::{
    ConnectionEvent, ConnectionHandle, ConnectionId, ConnectionIdAllocator, ServiceKind,
};
use crate::core::ShardError;
use crate::core::protocol::WireFrame;
use bincode::config;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio::time;
use tracing::{debug, info, warn};

const UDP_BUFFER_SIZE: usize = 65535;

/// One datagram on the wire.
#[derive(Debug, Clone, PartialEq, bincode::Encode, bincode::Decode)]
pub enum Segment {
    /// A sequenced chunk carrying one complete wire frame.
    Data { seq: u64, frame: Vec<u8> },
    /// Cumulative acknowledgement: every sequence below `next_expected`
    /// has been delivered in order.
    Ack { next_expected: u64 },
}

impl Segment {
    pub fn encode(&self) -> Result<Vec<u8>, ShardError> {
        Ok(bincode::encode_to_vec(self, config::standard())?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ShardError> {
        let (segment, _) = bincode::decode_from_slice(bytes, config::standard())?;
        Ok(segment)
    }
}

#[derive(Debug)]
struct InFlight {
    frame: Vec<u8>,
    last_sent: Instant,
}

/// The sequencing state machine for one peer, independent of any socket.
///
/// Callers feed it frames to send and segments received, and drain the
/// segments it wants on the wire plus the frames it has delivered in order.
#[derive(Debug)]
pub struct ReliableEndpoint {
    send_window: usize,
    retransmit_timeout: Duration,
    next_seq_out: u64,
    in_flight: BTreeMap<u64, InFlight>,
    pending_send: VecDeque<Vec<u8>>,
    next_expected_in: u64,
    reorder: BTreeMap<u64, Vec<u8>>,
}

impl ReliableEndpoint {
    pub fn new(config: &DatagramConfig) -> Self {
        Self {
            send_window: config.send_window.max(1),
            retransmit_timeout: config.retransmit_timeout,
            next_seq_out: 0,
            in_flight: BTreeMap::new(),
            pending_send: VecDeque::new(),
            next_expected_in: 0,
            reorder: BTreeMap::new(),
        }
    }

    /// Queues frame bytes for transmission. Returns the segments to put on
    /// the wire right now (empty when the window is full).
    pub fn send(&mut self, frame: Vec<u8>, now: Instant) -> Vec<Segment> {
        self.pending_send.push_back(frame);
        self.admit_pending(now)
    }

    fn admit_pending(&mut self, now: Instant) -> Vec<Segment> {
        let mut out = Vec::new();
        while self.in_flight.len() < self.send_window {
            let Some(frame) = self.pending_send.pop_front() else {
                break;
            };
            let seq = self.next_seq_out;
            self.next_seq_out += 1;
            self.in_flight.insert(
                seq,
                InFlight {
                    frame: frame.clone(),
                    last_sent: now,
                },
            );
            out.push(Segment::Data { seq, frame });
        }
        out
    }

    /// Consumes a received segment. Returns `(delivered frames, segments to
    /// send)`; delivery is strictly in sequence order.
    pub fn on_segment(&mut self, segment: Segment, now: Instant) -> (Vec<Vec<u8>>, Vec<Segment>) {
        match segment {
            Segment::Ack { next_expected } => {
                self.in_flight.retain(|seq, _| *seq >= next_expected);
                (Vec::new(), self.admit_pending(now))
            }
            Segment::Data { seq, frame } => {
                let mut delivered = Vec::new();
                if seq < self.next_expected_in {
                    // Duplicate of something already delivered; the ack for
                    // it must have been lost, so repeat it.
                    return (delivered, vec![self.ack()]);
                }
                self.reorder.insert(seq, frame);
                while let Some(frame) = self.reorder.remove(&self.next_expected_in) {
                    delivered.push(frame);
                    self.next_expected_in += 1;
                }
                (delivered, vec![self.ack()])
            }
        }
    }

    fn ack(&self) -> Segment {
        Segment::Ack {
            next_expected: self.next_expected_in,
        }
    }

    /// Returns segments whose retransmission timer expired, refreshing their
    /// timers. Called on a cadence by the channel task.
    pub fn poll_retransmit(&mut self, now: Instant) -> Vec<Segment> {
        let mut out = Vec::new();
        for (seq, in_flight) in self.in_flight.iter_mut() {
            if now.duration_since(in_flight.last_sent) >= self.retransmit_timeout {
                in_flight.last_sent = now;
                out.push(Segment::Data {
                    seq: *seq,
                    frame: in_flight.frame.clone(),
                });
            }
        }
        out
    }

    /// Unacknowledged segment count, for tests and status.
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }
}

/// Runs one reliable datagram channel against a peer over a shared socket.
async fn run_channel(
    socket: Arc<UdpSocket>,
    peer_addr: SocketAddr,
    conn_id: ConnectionId,
    config: DatagramConfig,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    mut outbound_rx: mpsc::UnboundedReceiver<WireFrame>,
    mut inbound_rx: mpsc::UnboundedReceiver<Segment>,
) {
    let mut endpoint = ReliableEndpoint::new(&config);
    let mut rng = SmallRng::from_entropy();
    // Jittered retransmit cadence so a fleet restart does not synchronize
    // every channel's timer.
    let poll_interval = config.retransmit_timeout / 2
        + Duration::from_millis(rng.gen_range(0..=config.retransmit_timeout.as_millis().max(2) as u64 / 2));
    let mut retransmit_timer = time::interval(poll_interval.max(Duration::from_millis(10)));

    async fn put(socket: &UdpSocket, peer: SocketAddr, segments: Vec<Segment>) {
        for segment in segments {
            match segment.encode() {
                Ok(bytes) => {
                    if let Err(e) = socket.send_to(&bytes, peer).await {
                        debug!("Datagram send to {} failed: {}", peer, e);
                    }
                }
                Err(e) => warn!("Segment encode failed: {}", e),
            }
        }
    }

    loop {
        tokio::select! {
            biased;

            maybe_frame = outbound_rx.recv() => {
                match maybe_frame {
                    Some(frame) => {
                        match frame.encode_to_vec() {
                            Ok(bytes) => {
                                let segments = endpoint.send(bytes, Instant::now());
                                put(&socket, peer_addr, segments).await;
                            }
                            Err(e) => warn!("Frame encode failed on {}: {}", conn_id, e),
                        }
                    }
                    None => {
                        debug!("{} ({}) datagram channel closed locally.", conn_id, peer_addr);
                        break;
                    }
                }
            }

            maybe_segment = inbound_rx.recv() => {
                match maybe_segment {
                    Some(segment) => {
                        let (delivered, responses) = endpoint.on_segment(segment, Instant::now());
                        put(&socket, peer_addr, responses).await;
                        for bytes in delivered {
                            match WireFrame::decode_from_slice(&bytes) {
                                Ok(frame) => {
                                    if events_tx.send(ConnectionEvent::Frame { conn_id, frame }).is_err() {
                                        return;
                                    }
                                }
                                Err(e) => {
                                    warn!("Undecodable frame on {} from {}: {}", conn_id, peer_addr, e);
                                }
                            }
                        }
                    }
                    None => break,
                }
            }

            _ = retransmit_timer.tick() => {
                let segments = endpoint.poll_retransmit(Instant::now());
                if !segments.is_empty() {
                    debug!("Retransmitting {} segments to {}", segments.len(), peer_addr);
                    put(&socket, peer_addr, segments).await;
                }
            }
        }
    }

    let _ = events_tx.send(ConnectionEvent::Closed { conn_id });
}

/// Shared socket plus the demux table routing inbound segments to channels.
pub struct DatagramNode {
    socket: Arc<UdpSocket>,
    config: DatagramConfig,
    ids: Arc<ConnectionIdAllocator>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    channels: HashMap<SocketAddr, mpsc::UnboundedSender<Segment>>,
}

impl DatagramNode {
    pub async fn bind(
        interface: &str,
        port: u16,
        config: DatagramConfig,
        ids: Arc<ConnectionIdAllocator>,
        events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> anyhow::Result<Self> {
        let addr: SocketAddr = format!("{interface}:{port}").parse()?;
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Datagram service listening on UDP {}", addr);
        Ok(Self {
            socket,
            config,
            ids,
            events_tx,
            channels: HashMap::new(),
        })
    }

    /// The locally bound UDP address.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Opens (or reuses) the channel to a peer, emitting `Opened` for new ones.
    fn open_channel(&mut self, service: ServiceKind, peer_addr: SocketAddr) {
        if self.channels.contains_key(&peer_addr) {
            return;
        }
        let conn_id = self.ids.allocate();
        let (handle, outbound_rx) = ConnectionHandle::new(conn_id, peer_addr);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        self.channels.insert(peer_addr, inbound_tx);

        if self
            .events_tx
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

        tokio::spawn(run_channel(
            self.socket.clone(),
            peer_addr,
            conn_id,
            self.config.clone(),
            self.events_tx.clone(),
            outbound_rx,
            inbound_rx,
        ));
    }

    /// Dials a peer proactively (client side of the channel).
    pub fn dial(&mut self, service: ServiceKind, peer_addr: SocketAddr) {
        self.open_channel(service, peer_addr);
    }

    /// Receives and demuxes datagrams until shutdown. Unknown sources open
    /// server-side channels on the given service.
    pub async fn run(mut self, service: ServiceKind, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut buf = vec![0u8; UDP_BUFFER_SIZE];
        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("Datagram service shutting down.");
                    break;
                }

                res = self.socket.recv_from(&mut buf) => {
                    match res {
                        Ok((len, src)) => {
                            let segment = match Segment::decode(&buf[..len]) {
                                Ok(s) => s,
                                Err(e) => {
                                    debug!("Undecodable datagram from {}: {}", src, e);
                                    continue;
                                }
                            };
                            self.open_channel(service, src);
                            if let Some(tx) = self.channels.get(&src) {
                                if tx.send(segment).is_err() {
                                    // Channel task ended; forget it so a new
                                    // one can form on the next datagram.
                                    self.channels.remove(&src);
                                }
                            }
                        }
                        Err(e) => {
                            warn!("Datagram receive error: {}", e);
                        }
                    }
                }
            }
        }
    }
}

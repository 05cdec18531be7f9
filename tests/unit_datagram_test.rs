use shardd::config::DatagramConfig;
use shardd::connection::datagram::{ReliableEndpoint, Segment};
use std::time::{Duration, Instant};

fn config(window: usize) -> DatagramConfig {
    DatagramConfig {
        port_offset: 100,
        retransmit_timeout: Duration::from_millis(200),
        send_window: window,
    }
}

fn data_of(segments: &[Segment]) -> Vec<(u64, Vec<u8>)> {
    segments
        .iter()
        .filter_map(|s| match s {
            Segment::Data { seq, frame } => Some((*seq, frame.clone())),
            Segment::Ack { .. } => None,
        })
        .collect()
}

#[test]
fn test_segments_are_sequenced_from_zero() {
    let mut endpoint = ReliableEndpoint::new(&config(8));
    let now = Instant::now();
    let first = endpoint.send(b"one".to_vec(), now);
    let second = endpoint.send(b"two".to_vec(), now);
    assert_eq!(data_of(&first), vec![(0, b"one".to_vec())]);
    assert_eq!(data_of(&second), vec![(1, b"two".to_vec())]);
}

#[test]
fn test_in_order_delivery() {
    let mut endpoint = ReliableEndpoint::new(&config(8));
    let now = Instant::now();
    let (delivered, responses) = endpoint.on_segment(
        Segment::Data {
            seq: 0,
            frame: b"a".to_vec(),
        },
        now,
    );
    assert_eq!(delivered, vec![b"a".to_vec()]);
    assert_eq!(responses, vec![Segment::Ack { next_expected: 1 }]);
}

#[test]
fn test_out_of_order_arrival_is_held_back() {
    let mut endpoint = ReliableEndpoint::new(&config(8));
    let now = Instant::now();

    let (delivered, responses) = endpoint.on_segment(
        Segment::Data {
            seq: 1,
            frame: b"b".to_vec(),
        },
        now,
    );
    assert!(delivered.is_empty());
    // Cumulative ack still names the gap.
    assert_eq!(responses, vec![Segment::Ack { next_expected: 0 }]);

    let (delivered, responses) = endpoint.on_segment(
        Segment::Data {
            seq: 0,
            frame: b"a".to_vec(),
        },
        now,
    );
    assert_eq!(delivered, vec![b"a".to_vec(), b"b".to_vec()]);
    assert_eq!(responses, vec![Segment::Ack { next_expected: 2 }]);
}

#[test]
fn test_duplicate_data_is_reacked_not_redelivered() {
    let mut endpoint = ReliableEndpoint::new(&config(8));
    let now = Instant::now();
    let _ = endpoint.on_segment(
        Segment::Data {
            seq: 0,
            frame: b"a".to_vec(),
        },
        now,
    );
    let (delivered, responses) = endpoint.on_segment(
        Segment::Data {
            seq: 0,
            frame: b"a".to_vec(),
        },
        now,
    );
    assert!(delivered.is_empty());
    assert_eq!(responses, vec![Segment::Ack { next_expected: 1 }]);
}

#[test]
fn test_ack_clears_in_flight() {
    let mut endpoint = ReliableEndpoint::new(&config(8));
    let now = Instant::now();
    endpoint.send(b"a".to_vec(), now);
    endpoint.send(b"b".to_vec(), now);
    assert_eq!(endpoint.in_flight_len(), 2);

    let _ = endpoint.on_segment(Segment::Ack { next_expected: 1 }, now);
    assert_eq!(endpoint.in_flight_len(), 1);
    let _ = endpoint.on_segment(Segment::Ack { next_expected: 2 }, now);
    assert_eq!(endpoint.in_flight_len(), 0);
}

#[test]
fn test_window_blocks_and_ack_admits_pending() {
    let mut endpoint = ReliableEndpoint::new(&config(1));
    let now = Instant::now();
    let first = endpoint.send(b"a".to_vec(), now);
    assert_eq!(data_of(&first).len(), 1);

    // Window is full: the second frame waits.
    let second = endpoint.send(b"b".to_vec(), now);
    assert!(second.is_empty());
    assert_eq!(endpoint.in_flight_len(), 1);

    // The ack frees the window and admits the pending frame.
    let (_, admitted) = endpoint.on_segment(Segment::Ack { next_expected: 1 }, now);
    assert_eq!(data_of(&admitted), vec![(1, b"b".to_vec())]);
}

#[test]
fn test_retransmit_after_timeout() {
    let mut endpoint = ReliableEndpoint::new(&config(8));
    let base = Instant::now();
    endpoint.send(b"a".to_vec(), base);

    assert!(endpoint.poll_retransmit(base + Duration::from_millis(100)).is_empty());
    let resent = endpoint.poll_retransmit(base + Duration::from_millis(250));
    assert_eq!(data_of(&resent), vec![(0, b"a".to_vec())]);

    // The timer was refreshed; an immediate re-poll stays quiet.
    assert!(endpoint
        .poll_retransmit(base + Duration::from_millis(260))
        .is_empty());
}

#[test]
fn test_segment_encoding_roundtrip() {
    let segment = Segment::Data {
        seq: 7,
        frame: vec![1, 2, 3],
    };
    let bytes = segment.encode().unwrap();
    assert_eq!(Segment::decode(&bytes).unwrap(), segment);
}

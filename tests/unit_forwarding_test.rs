use bytes::Bytes;
use shardd::central::forwarding::{FlushSet, ForwardingStack, StackOutcome};
use shardd::core::protocol::WireFrame;

const LIMIT: usize = 64 * 1024;

fn payload(tag: u8) -> WireFrame {
    WireFrame::new(0x1000_0000 + tag as u32, Bytes::from(vec![tag; 8]))
}

fn flush_of(outcome: StackOutcome) -> Vec<FlushSet> {
    match outcome {
        StackOutcome::Flush(sets) => sets,
        other => panic!("expected flush, got {other:?}"),
    }
}

#[test]
fn test_simple_scope_flushes_in_order() {
    let mut stack = ForwardingStack::new(LIMIT);
    assert_eq!(stack.on_begin(vec![7, 9]), StackOutcome::Buffered);
    assert_eq!(stack.on_payload(payload(1)), StackOutcome::Buffered);
    assert_eq!(stack.on_payload(payload(2)), StackOutcome::Buffered);

    let sets = flush_of(stack.on_end());
    assert_eq!(sets.len(), 1);
    assert_eq!(sets[0].destinations, vec![7, 9]);
    assert_eq!(sets[0].frames, vec![payload(1), payload(2)]);
    assert!(!stack.is_active());
}

// Identical destination lists nest rather than push: the sequence
// Begin([7,9]) A Begin([7,9]) B End C End delivers A,B,C in order, once.
#[test]
fn test_nested_identical_destinations_merge() {
    let mut stack = ForwardingStack::new(LIMIT);
    stack.on_begin(vec![7, 9]);
    stack.on_payload(payload(1));
    stack.on_begin(vec![7, 9]);
    stack.on_payload(payload(2));
    assert_eq!(stack.on_end(), StackOutcome::Buffered);
    stack.on_payload(payload(3));

    let sets = flush_of(stack.on_end());
    assert_eq!(sets.len(), 1);
    assert_eq!(sets[0].frames, vec![payload(1), payload(2), payload(3)]);
}

#[test]
fn test_different_destinations_push_a_new_context() {
    let mut stack = ForwardingStack::new(LIMIT);
    stack.on_begin(vec![1]);
    stack.on_payload(payload(1));
    stack.on_begin(vec![2]);
    stack.on_payload(payload(2));
    assert_eq!(stack.on_end(), StackOutcome::Buffered); // inner closes, outer open

    stack.on_payload(payload(3));
    let sets = flush_of(stack.on_end());
    assert_eq!(sets.len(), 2);
    // Inner context completed first.
    assert_eq!(sets[0].destinations, vec![2]);
    assert_eq!(sets[0].frames, vec![payload(2)]);
    assert_eq!(sets[1].destinations, vec![1]);
    assert_eq!(sets[1].frames, vec![payload(1), payload(3)]);
}

#[test]
fn test_same_destinations_different_order_push_a_new_context() {
    let mut stack = ForwardingStack::new(LIMIT);
    stack.on_begin(vec![1, 2]);
    stack.on_begin(vec![2, 1]); // deep equality includes order
    assert_eq!(stack.on_end(), StackOutcome::Buffered);
    let sets = flush_of(stack.on_end());
    assert_eq!(sets.len(), 2);
}

#[test]
fn test_end_on_empty_stack_is_a_fault() {
    let mut stack = ForwardingStack::new(LIMIT);
    assert!(matches!(stack.on_end(), StackOutcome::Fault(_)));
}

#[test]
fn test_payload_without_scope_is_a_fault() {
    let mut stack = ForwardingStack::new(LIMIT);
    assert!(matches!(stack.on_payload(payload(1)), StackOutcome::Fault(_)));
}

#[test]
fn test_empty_destination_list_is_permitted() {
    let mut stack = ForwardingStack::new(LIMIT);
    stack.on_begin(Vec::new());
    stack.on_payload(payload(1));
    let sets = flush_of(stack.on_end());
    assert_eq!(sets.len(), 1);
    assert!(sets[0].destinations.is_empty());
}

#[test]
fn test_buffer_overflow_is_a_fault() {
    let mut stack = ForwardingStack::new(16);
    stack.on_begin(vec![1]);
    assert_eq!(stack.on_payload(payload(1)), StackOutcome::Buffered);
    assert!(matches!(stack.on_payload(payload(2)), StackOutcome::Fault(_)));
}

#[test]
fn test_buffered_bytes_reset_after_flush() {
    let mut stack = ForwardingStack::new(LIMIT);
    stack.on_begin(vec![1]);
    stack.on_payload(payload(1));
    assert!(stack.buffered_bytes() > 0);
    let _ = stack.on_end();
    assert_eq!(stack.buffered_bytes(), 0);
}

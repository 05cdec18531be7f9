// tests/property/forwarding_test.rs

//! Properties of the forwarding gateway: flushed frames preserve receive
//! order, and nesting a scope inside an identical scope changes nothing.

use bytes::Bytes;
use proptest::prelude::*;
use shardd::central::forwarding::{FlushSet, ForwardingStack, StackOutcome};
use shardd::core::protocol::WireFrame;

fn frame(tag: u16) -> WireFrame {
    WireFrame::new(0x2000_0000 + tag as u32, Bytes::from(tag.to_be_bytes().to_vec()))
}

fn run_flush(outcome: StackOutcome) -> Option<Vec<FlushSet>> {
    match outcome {
        StackOutcome::Flush(sets) => Some(sets),
        StackOutcome::Buffered => None,
        StackOutcome::Fault(reason) => panic!("unexpected fault: {reason}"),
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        ..ProptestConfig::default()
    })]

    // Property: a single scope delivers P1..Pn to every destination in
    // receive order, exactly once.
    #[test]
    fn test_flush_preserves_order(
        destinations in prop::collection::vec(1u32..100, 0..6),
        tags in prop::collection::vec(0u16..1000, 0..32),
    ) {
        let mut stack = ForwardingStack::new(usize::MAX);
        prop_assert_eq!(stack.on_begin(destinations.clone()), StackOutcome::Buffered);
        for tag in &tags {
            prop_assert_eq!(stack.on_payload(frame(*tag)), StackOutcome::Buffered);
        }
        let sets = run_flush(stack.on_end()).expect("outermost end flushes");
        prop_assert_eq!(sets.len(), 1);
        prop_assert_eq!(&sets[0].destinations, &destinations);
        let expected: Vec<WireFrame> = tags.iter().map(|t| frame(*t)).collect();
        prop_assert_eq!(&sets[0].frames, &expected);
    }

    // Property: Begin(D) A Begin(D) B End C End flushes the same set, in
    // the same order, as Begin(D) A B C End.
    #[test]
    fn test_nested_identical_scopes_are_idempotent(
        destinations in prop::collection::vec(1u32..100, 0..6),
        a in prop::collection::vec(0u16..1000, 0..8),
        b in prop::collection::vec(0u16..1000, 0..8),
        c in prop::collection::vec(0u16..1000, 0..8),
    ) {
        let mut nested = ForwardingStack::new(usize::MAX);
        nested.on_begin(destinations.clone());
        for tag in &a { nested.on_payload(frame(*tag)); }
        nested.on_begin(destinations.clone());
        for tag in &b { nested.on_payload(frame(*tag)); }
        prop_assert_eq!(nested.on_end(), StackOutcome::Buffered);
        for tag in &c { nested.on_payload(frame(*tag)); }
        let nested_sets = run_flush(nested.on_end()).unwrap();

        let mut flat = ForwardingStack::new(usize::MAX);
        flat.on_begin(destinations);
        for tag in a.iter().chain(&b).chain(&c) { flat.on_payload(frame(*tag)); }
        let flat_sets = run_flush(flat.on_end()).unwrap();

        prop_assert_eq!(nested_sets, flat_sets);
    }

    // Property: any balanced sequence of identical-destination scopes and
    // payloads flushes every payload exactly once, and only when the last
    // scope closes.
    #[test]
    fn test_balanced_nesting_flushes_exactly_once(
        opens in prop::collection::vec(1u32..4, 1..5),
        tags in prop::collection::vec(0u16..1000, 0..16),
    ) {
        let destinations = vec![7u32, 9];
        let mut stack = ForwardingStack::new(usize::MAX);
        let mut depth = 0u32;
        for _ in &opens {
            stack.on_begin(destinations.clone());
            depth += 1;
        }
        for tag in &tags {
            prop_assert_eq!(stack.on_payload(frame(*tag)), StackOutcome::Buffered);
        }
        while depth > 1 {
            prop_assert_eq!(stack.on_end(), StackOutcome::Buffered);
            depth -= 1;
        }
        let sets = run_flush(stack.on_end()).unwrap();
        let total: usize = sets.iter().map(|s| s.frames.len()).sum();
        prop_assert_eq!(total, tags.len());
    }
}

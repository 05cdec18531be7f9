// tests/property/placement_test.rs

//! Properties of the load-aware scheduler and the load accounting:
//! placement always minimizes the load ratio over feasible nodes, and any
//! spawn/exit pair leaves a node's load where it started.

use proptest::prelude::*;
use shardd::supervisor::locator::{Locator, PeerLoadView};
use shardd::supervisor::scheduler::{Placement, ResolvedTarget, decide};

fn arb_peers() -> impl Strategy<Value = Vec<PeerLoadView>> {
    prop::collection::vec((0u32..40, 1u32..20), 0..8).prop_map(|raw| {
        raw.into_iter()
            .enumerate()
            .map(|(index, (load_quarters, max_units))| PeerLoadView {
                label: format!("node{}", index + 1),
                current_load: load_quarters as f32 * 0.25,
                maximum_load: max_units as f32,
            })
            .collect()
    })
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 200,
        ..ProptestConfig::default()
    })]

    // Property: for `any` placement on the master, the chosen node minimizes
    // current/maximum over the feasible set, breaking ties by label.
    #[test]
    fn test_placement_minimizes_load_ratio(
        peers in arb_peers(),
        cost_quarters in 1u32..8,
    ) {
        let cost = cost_quarters as f32 * 0.25;
        let placement = decide(&ResolvedTarget::Any, true, cost, 0.0, 10.0, &peers);

        let feasible: Vec<&PeerLoadView> = peers
            .iter()
            .filter(|p| p.current_load + cost <= p.maximum_load)
            .collect();

        match placement {
            Placement::Forward { label } => {
                let chosen = peers.iter().find(|p| p.label == label).unwrap();
                prop_assert!(chosen.current_load + cost <= chosen.maximum_load);
                let chosen_ratio = chosen.current_load / chosen.maximum_load;
                for peer in &feasible {
                    let ratio = peer.current_load / peer.maximum_load;
                    prop_assert!(
                        chosen_ratio < ratio
                            || (chosen_ratio == ratio && chosen.label <= peer.label),
                        "{} (ratio {}) should not beat {} (ratio {})",
                        peer.label, ratio, label, chosen_ratio
                    );
                }
            }
            Placement::Queue => {
                prop_assert!(feasible.is_empty());
                prop_assert!(!peers.is_empty());
            }
            Placement::Local => prop_assert!(peers.is_empty()),
            other => prop_assert!(false, "unexpected placement {:?}", other),
        }
    }

    // Property: spawning then exiting restores the node's load exactly.
    #[test]
    fn test_load_conservation(
        cost_quarters in prop::collection::vec(1u32..16, 1..32),
    ) {
        let costs: Vec<f32> = cost_quarters.iter().map(|q| *q as f32 * 0.25).collect();
        let mut locator = Locator::new(1000.0);

        for cost in &costs {
            locator.increment_my_load(*cost);
        }
        let peak = locator.my_load();
        prop_assert!(peak > 0.0);

        // Exits observed in reverse order; the pairing does not matter for
        // conservation, only the multiset of costs.
        for cost in costs.iter().rev() {
            locator.decrement_my_load(*cost);
        }
        prop_assert_eq!(locator.my_load(), 0.0);
    }

    // Property: interleaved spawn/exit sequences never drive the counter
    // negative as long as exits match prior spawns.
    #[test]
    fn test_load_counter_is_monotone_between_events(
        cost_quarters in prop::collection::vec(1u32..16, 1..16),
    ) {
        let costs: Vec<f32> = cost_quarters.iter().map(|q| *q as f32 * 0.25).collect();
        let mut locator = Locator::new(1000.0);
        let mut live: Vec<f32> = Vec::new();

        for (index, cost) in costs.iter().enumerate() {
            locator.increment_my_load(*cost);
            live.push(*cost);
            // Every other event, retire the oldest live process.
            if index % 2 == 1 {
                let done = live.remove(0);
                let before = locator.my_load();
                locator.decrement_my_load(done);
                prop_assert!(locator.my_load() <= before);
                prop_assert!(locator.my_load() >= 0.0);
            }
        }
    }
}

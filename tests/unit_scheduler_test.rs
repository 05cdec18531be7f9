use shardd::core::catalog::TargetHost;
use shardd::supervisor::locator::PeerLoadView;
use shardd::supervisor::scheduler::{Placement, ResolvedTarget, decide, resolve_target};

fn peer(label: &str, current: f32, maximum: f32) -> PeerLoadView {
    PeerLoadView {
        label: label.to_string(),
        current_load: current,
        maximum_load: maximum,
    }
}

// --- resolve_target ---

#[test]
fn test_requested_label_overrides_template() {
    let target = resolve_target(&TargetHost::Any, "node2", "node0", &[]);
    assert_eq!(target, ResolvedTarget::Label("node2".to_string()));
}

#[test]
fn test_own_label_collapses_to_local() {
    assert_eq!(
        resolve_target(&TargetHost::Any, "node0", "node0", &[]),
        ResolvedTarget::Local
    );
    assert_eq!(
        resolve_target(&TargetHost::Node("node1".to_string()), "", "node1", &[]),
        ResolvedTarget::Local
    );
}

#[test]
fn test_template_target_applies_when_request_is_open() {
    assert_eq!(
        resolve_target(&TargetHost::Local, "any", "node0", &[]),
        ResolvedTarget::Local
    );
    assert_eq!(
        resolve_target(&TargetHost::Any, "", "node0", &[]),
        ResolvedTarget::Any
    );
}

#[test]
fn test_address_target_maps_to_label() {
    let nodes = vec![
        ("10.0.0.1".to_string(), "node0".to_string()),
        ("10.0.0.2".to_string(), "node1".to_string()),
    ];
    assert_eq!(
        resolve_target(
            &TargetHost::Address("10.0.0.2".to_string()),
            "",
            "node0",
            &nodes
        ),
        ResolvedTarget::Label("node1".to_string())
    );
}

// --- decide ---

#[test]
fn test_local_placement_when_capacity_allows() {
    let placement = decide(&ResolvedTarget::Local, true, 1.0, 2.0, 5.0, &[peer("node1", 0.0, 5.0)]);
    assert_eq!(placement, Placement::Local);
}

#[test]
fn test_local_placement_when_no_peers_even_if_overloaded() {
    let placement = decide(&ResolvedTarget::Local, false, 1.0, 5.0, 5.0, &[]);
    assert_eq!(placement, Placement::Local);
}

#[test]
fn test_overloaded_slave_forwards_local_spawn_to_master() {
    let placement = decide(
        &ResolvedTarget::Local,
        false,
        1.0,
        5.0,
        5.0,
        &[peer("node0", 0.0, 5.0)],
    );
    assert_eq!(placement, Placement::ForwardToMaster);
}

#[test]
fn test_overloaded_master_schedules_fleet_wide() {
    let placement = decide(
        &ResolvedTarget::Local,
        true,
        1.0,
        5.0,
        5.0,
        &[peer("node1", 1.0, 5.0)],
    );
    assert_eq!(
        placement,
        Placement::Forward {
            label: "node1".to_string()
        }
    );
}

#[test]
fn test_any_on_slave_forwards_to_master() {
    let placement = decide(
        &ResolvedTarget::Any,
        false,
        1.0,
        0.0,
        5.0,
        &[peer("node0", 0.0, 5.0)],
    );
    assert_eq!(placement, Placement::ForwardToMaster);
}

#[test]
fn test_master_picks_minimum_load_ratio() {
    let peers = vec![
        peer("node1", 4.0, 8.0), // ratio 0.5
        peer("node2", 1.0, 8.0), // ratio 0.125
        peer("node3", 2.0, 8.0), // ratio 0.25
    ];
    let placement = decide(&ResolvedTarget::Any, true, 1.0, 0.0, 8.0, &peers);
    assert_eq!(
        placement,
        Placement::Forward {
            label: "node2".to_string()
        }
    );
}

#[test]
fn test_full_peers_are_not_candidates() {
    let peers = vec![
        peer("node1", 7.5, 8.0), // would exceed capacity with cost 1.0
        peer("node2", 6.0, 8.0),
    ];
    let placement = decide(&ResolvedTarget::Any, true, 1.0, 0.0, 8.0, &peers);
    assert_eq!(
        placement,
        Placement::Forward {
            label: "node2".to_string()
        }
    );
}

#[test]
fn test_tie_breaks_lexicographically() {
    let peers = vec![
        peer("node3", 2.0, 8.0),
        peer("node1", 2.0, 8.0),
        peer("node2", 2.0, 8.0),
    ];
    let placement = decide(&ResolvedTarget::Any, true, 1.0, 0.0, 8.0, &peers);
    assert_eq!(
        placement,
        Placement::Forward {
            label: "node1".to_string()
        }
    );
}

#[test]
fn test_no_capacity_anywhere_queues() {
    let peers = vec![peer("node1", 8.0, 8.0)];
    let placement = decide(&ResolvedTarget::Any, true, 1.0, 0.0, 8.0, &peers);
    assert_eq!(placement, Placement::Queue);
}

#[test]
fn test_master_alone_places_locally() {
    let placement = decide(&ResolvedTarget::Any, true, 1.0, 0.0, 8.0, &[]);
    assert_eq!(placement, Placement::Local);
}

#[test]
fn test_specific_absent_label_defers() {
    let placement = decide(
        &ResolvedTarget::Label("node4".to_string()),
        true,
        1.0,
        0.0,
        8.0,
        &[peer("node1", 0.0, 8.0)],
    );
    assert_eq!(
        placement,
        Placement::Defer {
            label: "node4".to_string()
        }
    );
}

// Scenario: the master at 0/5 with node1 at 0/5 sends a fleet-wide spawn to
// node1; the master is not its own scheduling candidate.
#[test]
fn test_equal_ratios_place_on_the_peer() {
    let placement = decide(&ResolvedTarget::Any, true, 1.0, 0.0, 5.0, &[peer("node1", 0.0, 5.0)]);
    assert_eq!(
        placement,
        Placement::Forward {
            label: "node1".to_string()
        }
    );
}

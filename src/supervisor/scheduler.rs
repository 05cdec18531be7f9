// src/supervisor/scheduler.rs

//! The master's load-aware placement policy.
//!
//! Kept free of IO and connection state so every branch is testable: the
//! caller resolves the effective target, snapshots the load views, and
//! executes whatever placement comes back.

use crate::core::catalog::TargetHost;
use crate::supervisor::locator::PeerLoadView;

/// A spawn target after merging the template's `targetHost` with the
/// caller-requested node label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedTarget {
    /// Run on the node handling the request.
    Local,
    /// Let the master's scheduler choose.
    Any,
    /// Run on one specific node.
    Label(String),
}

/// Merges the template target with the requested label.
///
/// A `local` template always runs on the handling node. Otherwise an
/// explicit requested label wins over the template; `local` and the
/// handling node's own label collapse to `Local`.
pub fn resolve_target(
    template_target: &TargetHost,
    requested_label: &str,
    my_label: &str,
    node_addresses: &[(String, String)],
) -> ResolvedTarget {
    if *template_target == TargetHost::Local {
        return ResolvedTarget::Local;
    }

    let from_request = match requested_label {
        "" | "any" => None,
        "local" => Some(ResolvedTarget::Local),
        label if label == my_label => Some(ResolvedTarget::Local),
        label => Some(ResolvedTarget::Label(label.to_string())),
    };
    if let Some(target) = from_request {
        return target;
    }

    match template_target {
        TargetHost::Local => ResolvedTarget::Local,
        TargetHost::Any => ResolvedTarget::Any,
        TargetHost::Node(label) if label == my_label => ResolvedTarget::Local,
        TargetHost::Node(label) => ResolvedTarget::Label(label.clone()),
        TargetHost::Address(addr) => {
            // Addresses were resolved at catalog load; map back to a label.
            let label = node_addresses
                .iter()
                .find(|(address, _)| address == addr)
                .map(|(_, label)| label.clone());
            match label {
                Some(label) if label == my_label => ResolvedTarget::Local,
                Some(label) => ResolvedTarget::Label(label),
                // Unknown host: keep the raw address as a pseudo-label so the
                // request parks in the deferred queue instead of vanishing.
                None => ResolvedTarget::Label(addr.clone()),
            }
        }
    }
}

/// What to do with one spawn request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Launch on this node.
    Local,
    /// Send to a connected peer.
    Forward { label: String },
    /// Send to `node0` for scheduling.
    ForwardToMaster,
    /// No node can take it right now; retry next tick.
    Queue,
    /// The target node has no connection; retry when it appears.
    Defer { label: String },
}

/// Decides placement for a spawn request.
///
/// `peers` must contain only currently connected peers. Ties on the load
/// ratio break by lexicographic label so placement is deterministic.
pub fn decide(
    target: &ResolvedTarget,
    is_master: bool,
    cost: f32,
    my_current_load: f32,
    my_maximum_load: f32,
    peers: &[PeerLoadView],
) -> Placement {
    match target {
        ResolvedTarget::Local => {
            if my_current_load + cost <= my_maximum_load || peers.is_empty() {
                Placement::Local
            } else if is_master {
                // The master is its own overflow path: schedule fleet-wide.
                decide(
                    &ResolvedTarget::Any,
                    is_master,
                    cost,
                    my_current_load,
                    my_maximum_load,
                    peers,
                )
            } else {
                Placement::ForwardToMaster
            }
        }

        ResolvedTarget::Any => {
            if !is_master {
                return Placement::ForwardToMaster;
            }
            let best = peers
                .iter()
                .filter(|peer| peer.current_load + cost <= peer.maximum_load)
                .min_by(|a, b| {
                    let ratio_a = a.current_load / a.maximum_load;
                    let ratio_b = b.current_load / b.maximum_load;
                    ratio_a
                        .partial_cmp(&ratio_b)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.label.cmp(&b.label))
                });
            match best {
                Some(peer) => Placement::Forward {
                    label: peer.label.clone(),
                },
                None if peers.is_empty() => Placement::Local,
                None => Placement::Queue,
            }
        }

        ResolvedTarget::Label(label) => {
            if peers.iter().any(|peer| peer.label == *label) {
                Placement::Forward {
                    label: label.clone(),
                }
            } else {
                Placement::Defer {
                    label: label.clone(),
                }
            }
        }
    }
}

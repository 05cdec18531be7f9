// src/supervisor/liveness.rs

//! Keep-alive tracking and escalated termination of hung workers.
//!
//! A worker that stops sending keep-alives first gets a force-core (abort
//! with dump, so the hang is diagnosable), spaced by the escalation
//! interval; past double the timeout it gets a plain kill, exactly once.

use std::time::{Duration, Instant};
use tracing::warn;

/// Per-worker liveness state, keyed by the worker's task connection.
#[derive(Debug, Clone)]
pub struct WorkerWatch {
    pub pid: u32,
    pub command_line: String,
    pub last_keepalive: Option<Instant>,
    /// When the last escalation (of either kind) was issued.
    pub last_escalation: Option<Instant>,
    pub logged_kill: bool,
    pub logged_force_core: bool,
}

impl WorkerWatch {
    pub fn new() -> Self {
        Self {
            pid: 0,
            command_line: String::new(),
            last_keepalive: None,
            last_escalation: None,
            logged_kill: false,
            logged_force_core: false,
        }
    }

    /// Records a keep-alive arrival. Keep-alives must be monotone in time;
    /// a regressive stamp indicates clock trouble and is logged but not
    /// trusted.
    pub fn record_keepalive(&mut self, now: Instant) {
        if let Some(last) = self.last_keepalive {
            if now < last {
                warn!(
                    "Keep-alive from pid {} moved backwards in time; ignoring",
                    self.pid
                );
                return;
            }
        }
        self.last_keepalive = Some(now);
    }
}

impl Default for WorkerWatch {
    fn default() -> Self {
        Self::new()
    }
}

/// The action the supervisor must take against a hung worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// SIGABRT-equivalent, repeated at most once per escalation interval.
    ForceCore,
    /// SIGKILL-equivalent, issued exactly once.
    Kill,
}

/// Evaluates one worker against the timeout policy.
///
/// Returns the escalation to issue this tick, if any, and updates the
/// watch's bookkeeping. A zero timeout disables the check.
pub fn check_escalation(
    watch: &mut WorkerWatch,
    now: Instant,
    timeout: Duration,
    escalation_interval: Duration,
) -> Option<Escalation> {
    if timeout.is_zero() || watch.pid == 0 {
        return None;
    }
    let last = watch.last_keepalive?;
    let silent_for = now.duration_since(last);
    if silent_for <= timeout {
        return None;
    }

    if silent_for > timeout * 2 {
        // Terminal: one kill, ever.
        if watch.logged_kill {
            return None;
        }
        watch.logged_kill = true;
        watch.last_escalation = Some(now);
        return Some(Escalation::Kill);
    }

    // Between one and two timeouts: force a core, but not more often than
    // the escalation interval.
    let due = match watch.last_escalation {
        None => true,
        Some(at) => now.duration_since(at) >= escalation_interval,
    };
    if due {
        watch.last_escalation = Some(now);
        return Some(Escalation::ForceCore);
    }
    None
}

// src/supervisor/restart.rs

//! Automatic restart of always-restart process classes after a crash.
//!
//! Promotions are throttled to one per tick so a mass crash does not turn
//! into a reprovisioning stampede.

use std::path::Path;
use std::time::{Duration, Instant};

/// The sentinel file that disables all automatic restarts when present.
pub const NO_RESTART_SENTINEL: &str = ".norestart";

/// Process classes restarted unconditionally when their command line matches.
const ALWAYS_RESTART_CLASSES: [&str; 5] = [
    "LogServer",
    "MetricsServer",
    "CommoditiesServer",
    "CommodityServer",
    "TransferServer",
];

/// Whether a crashed command line belongs to a restart class.
/// The cluster head is gated by its own config flag.
pub fn is_restart_class(command_line: &str, restart_central: bool) -> bool {
    if restart_central && command_line.contains("CentralServer") {
        return true;
    }
    ALWAYS_RESTART_CLASSES
        .iter()
        .any(|class| command_line.contains(class))
}

/// Whether the no-restart sentinel is present in the working directory.
pub fn restarts_disabled() -> bool {
    Path::new(NO_RESTART_SENTINEL).exists()
}

/// One crashed process waiting for its restart delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartRequest {
    pub command_line: String,
    pub time_queued: Instant,
    pub delay: Duration,
}

/// FIFO of pending restarts with one-per-tick promotion.
#[derive(Debug, Default)]
pub struct RestartQueue {
    requests: Vec<RestartRequest>,
}

impl RestartQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, request: RestartRequest) {
        self.requests.push(request);
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Removes and returns the first eligible request, or `None`.
    /// Called once per tick to spread reprovisioning load.
    pub fn promote_one(&mut self, now: Instant) -> Option<RestartRequest> {
        let position = self
            .requests
            .iter()
            .position(|r| r.delay.is_zero() || r.time_queued + r.delay <= now)?;
        Some(self.requests.remove(position))
    }
}

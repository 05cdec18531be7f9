// src/core/events.rs

//! Defines the local event bus for process-lifecycle notifications.
//!
//! Supervisor components publish spawn/exit/kill events here; metrics and
//! any future observers subscribe without coupling to the main loop.

use tokio::sync::broadcast::{self, Sender as BroadcastSender};
use tracing::debug;

/// The capacity of the broadcast channel. Lifecycle events are rare relative
/// to the tick rate, so a small buffer suffices.
const EVENT_BUS_CAPACITY: usize = 1024;

/// A process-lifecycle event observed by the local supervisor.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    /// A child process was launched on this host.
    Started {
        pid: u32,
        host: String,
        command_line: String,
    },
    /// A child process was observed to have exited.
    Aborted { host: String, command_line: String },
    /// A child process was killed on request.
    Killed { host: String, command_line: String },
}

/// The distribution hub for `ProcessEvent`s within one supervisor process.
#[derive(Debug)]
pub struct EventBus {
    sender: BroadcastSender<ProcessEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { sender }
    }

    /// Publishes an event. It's okay if there are no active subscribers.
    pub fn publish(&self, event: ProcessEvent) {
        if self.sender.send(event).is_err() {
            debug!("Published a ProcessEvent with no active subscribers.");
        }
    }

    /// Provides a new receiver for an observer task.
    pub fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.sender.subscribe()
    }
}

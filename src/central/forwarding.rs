// src/central/forwarding.rs

//! The forwarding gateway's batching stack.
//!
//! A scene authority wraps bursts of messages for a subset of game workers
//! in `BeginForward(destinations)` / `EndForward` envelopes. Payload frames
//! seen inside a scope buffer against the innermost context; everything
//! flushes atomically once the outermost `EndForward` empties the stack.
//! The stack is strictly LIFO and the buffered bytes are capped per
//! connection; overflow and unbalanced `EndForward`s are protocol faults
//! that cost the authority its connection.

use crate::core::ShardError;
use crate::core::protocol::WireFrame;

/// One active forwarding scope.
#[derive(Debug, Clone, PartialEq)]
struct ForwardContext {
    destinations: Vec<u32>,
    /// Nesting counter for repeated `BeginForward` with identical destinations.
    depth: u32,
    frames: Vec<WireFrame>,
}

/// A completed context ready for dispatch: every frame, in receive order,
/// goes to every destination, in the given order.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushSet {
    pub destinations: Vec<u32>,
    pub frames: Vec<WireFrame>,
}

/// What the connection handler must do after feeding the stack one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum StackOutcome {
    /// Nothing to dispatch yet.
    Buffered,
    /// The stack emptied; dispatch these sets in order.
    Flush(Vec<FlushSet>),
    /// Protocol fault; log and close the connection.
    Fault(ShardError),
}

/// The per-connection forwarding state.
#[derive(Debug)]
pub struct ForwardingStack {
    stack: Vec<ForwardContext>,
    /// Contexts fully closed while outer scopes remained open; they flush
    /// with the final pop, in completion order.
    finished: Vec<ForwardContext>,
    buffered_bytes: usize,
    byte_limit: usize,
}

impl ForwardingStack {
    pub fn new(byte_limit: usize) -> Self {
        Self {
            stack: Vec::new(),
            finished: Vec::new(),
            buffered_bytes: 0,
            byte_limit,
        }
    }

    /// Whether any forwarding scope is open. While true, every frame that is
    /// not `BeginForward`/`EndForward` belongs to the stack.
    pub fn is_active(&self) -> bool {
        !self.stack.is_empty()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    /// Opens a scope. Identical destinations (same order) nest into the
    /// current context instead of pushing a new one.
    pub fn on_begin(&mut self, destinations: Vec<u32>) -> StackOutcome {
        if let Some(top) = self.stack.last_mut() {
            if top.destinations == destinations {
                top.depth += 1;
                return StackOutcome::Buffered;
            }
        }
        self.stack.push(ForwardContext {
            destinations,
            depth: 1,
            frames: Vec::new(),
        });
        StackOutcome::Buffered
    }

    /// Buffers a payload frame against the innermost scope.
    pub fn on_payload(&mut self, frame: WireFrame) -> StackOutcome {
        let Some(top) = self.stack.last_mut() else {
            return StackOutcome::Fault(ShardError::ForwardingFault(
                "payload routed to forwarding stack with no active scope".to_string(),
            ));
        };
        self.buffered_bytes += frame.payload.len() + 4;
        if self.buffered_bytes > self.byte_limit {
            return StackOutcome::Fault(ShardError::ForwardingFault(format!(
                "forward buffer overflow: {} bytes exceeds the {} byte cap",
                self.buffered_bytes, self.byte_limit
            )));
        }
        top.frames.push(frame);
        StackOutcome::Buffered
    }

    /// Closes the innermost scope. An `EndForward` with no open scope is a
    /// protocol fault.
    pub fn on_end(&mut self) -> StackOutcome {
        let Some(top) = self.stack.last_mut() else {
            return StackOutcome::Fault(ShardError::ForwardingFault(
                "EndForward with an empty forwarding stack".to_string(),
            ));
        };
        top.depth -= 1;
        if top.depth > 0 {
            return StackOutcome::Buffered;
        }

        let context = self.stack.pop().expect("stack top exists");
        self.finished.push(context);
        if !self.stack.is_empty() {
            return StackOutcome::Buffered;
        }

        // Outermost scope closed: everything flushes at once.
        self.buffered_bytes = 0;
        let sets = std::mem::take(&mut self.finished)
            .into_iter()
            .map(|context| FlushSet {
                destinations: context.destinations,
                frames: context.frames,
            })
            .collect();
        StackOutcome::Flush(sets)
    }
}

//! Pending local edits made while the connection is not open.
//!
//! Edits queue in submission order and are flushed right after the identity
//! announcement on the next open. The queue survives reconnects but not a
//! level switch or a process restart.

use std::collections::VecDeque;

use warren_net::ClientMessage;

/// Bounded FIFO of outbound edit batches.
#[derive(Debug, Clone)]
pub struct Outbox {
    queue: VecDeque<ClientMessage>,
    capacity: usize,
    dropped: u64,
}

impl Outbox {
    /// Create an outbox holding at most `capacity` batches (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    /// Queue a batch, dropping the oldest when full.
    pub fn push(&mut self, msg: ClientMessage) {
        if self.queue.len() == self.capacity {
            if let Some(oldest) = self.queue.pop_front() {
                self.dropped += 1;
                tracing::warn!(
                    kind = oldest.kind(),
                    capacity = self.capacity,
                    "Outbox full, dropped oldest pending edit"
                );
            }
        }
        self.queue.push_back(msg);
    }

    /// Take every queued batch, oldest first.
    pub fn drain(&mut self) -> Vec<ClientMessage> {
        self.queue.drain(..).collect()
    }

    /// Discard everything queued.
    pub fn clear(&mut self) {
        if !self.queue.is_empty() {
            tracing::debug!(count = self.queue.len(), "Discarding pending edits");
        }
        self.queue.clear();
    }

    /// Number of queued batches.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Batches dropped to overflow since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

//! # Publisher
//!
//! Retry queue for publishes the relay did not acknowledge. The relayer
//! drains the queue on every heartbeat pulse; each entry gets a bounded
//! number of attempts before it is dropped with a log line. This gives
//! fire-and-forget publishes (background resubscribe flows) at-least-once
//! semantics without ever blocking a caller.

use std::collections::VecDeque;

use parking_lot::Mutex;

use super::jsonrpc::PublishParams;

/// A publish awaiting redelivery
#[derive(Debug, Clone)]
pub struct QueuedPublish {
    /// The original publish params
    pub params: PublishParams,
    /// Attempts made so far (including the initial send)
    pub attempts: u32,
}

/// Bounded publish retry queue
pub struct Publisher {
    queue: Mutex<VecDeque<QueuedPublish>>,
    max_attempts: u32,
}

impl Publisher {
    /// Create a queue with an attempt budget per entry
    pub fn new(max_attempts: u32) -> Self {
        Self { queue: Mutex::new(VecDeque::new()), max_attempts }
    }

    /// The configured attempt budget
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Queue a failed publish for retry, unless its budget is exhausted
    pub fn enqueue(&self, entry: QueuedPublish) {
        if entry.attempts >= self.max_attempts {
            tracing::warn!(
                topic = %entry.params.topic,
                attempts = entry.attempts,
                "Dropping publish after exhausting retry budget"
            );
            return;
        }
        self.queue.lock().push_back(entry);
    }

    /// Take the current batch for a retry pass
    pub fn drain(&self) -> Vec<QueuedPublish> {
        self.queue.lock().drain(..).collect()
    }

    /// Number of queued entries
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use talkback_core::types::{Message, Role};

#[derive(Debug, Default)]
struct RelayInner {
    queue: VecDeque<Message>,
    next_sequence: u64,
}

/// Unbounded FIFO carrying transcript events from the worker to the observer.
///
/// Guarded by its own lock, independent of the session state, so a producer can never
/// hold up shutdown.
#[derive(Debug, Clone, Default)]
pub struct MessageRelay {
    inner: Arc<Mutex<RelayInner>>,
}

impl MessageRelay {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RelayInner> {
        // A panicking producer can't leave the queue half-written; keep serving.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Accepts a message and returns it with its assigned sequence number.
    ///
    /// The sequence is taken under the same lock as the enqueue, so queue order and
    /// sequence order can't diverge.
    pub fn push(&self, role: Role, text: impl Into<String>) -> Message {
        let mut inner = self.lock();
        inner.next_sequence = inner.next_sequence.wrapping_add(1);
        let msg = Message::new(role, text, inner.next_sequence);
        inner.queue.push_back(msg.clone());
        msg
    }

    /// Removes and returns everything queued, oldest first. Never blocks on new input.
    pub fn drain_all(&self) -> Vec<Message> {
        let mut inner = self.lock();
        inner.queue.drain(..).collect()
    }

    /// Drops everything queued without handing it out. Returns how many were dropped.
    pub fn discard_all(&self) -> usize {
        let mut inner = self.lock();
        let n = inner.queue.len();
        inner.queue.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

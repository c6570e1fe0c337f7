//! FIFO mailbox for Weave actors.
//!
//! Each actor has a mailbox that delivers envelopes in strict FIFO order.
//! The queue is thread-safe (protected by a Mutex) since envelopes can be
//! posted from any thread. The lock is only held for the push/pop itself,
//! never across a handler run.

use std::collections::VecDeque;

use parking_lot::Mutex;

/// A thread-safe, unbounded FIFO mailbox.
///
/// Envelopes are appended to the back (`push`) and removed from the front
/// (`pop`), ensuring strict FIFO delivery order.
pub struct Mailbox<M> {
    queue: Mutex<VecDeque<M>>,
}

impl<M> Mailbox<M> {
    /// Create a new empty mailbox.
    pub fn new() -> Self {
        Mailbox {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Append an envelope to the back of the mailbox (FIFO enqueue).
    pub fn push(&self, msg: M) {
        self.queue.lock().push_back(msg);
    }

    /// Remove and return the front envelope (FIFO dequeue).
    ///
    /// Returns `None` if the mailbox is empty.
    pub fn pop(&self) -> Option<M> {
        self.queue.lock().pop_front()
    }

    /// Check if the mailbox is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Return the number of pending envelopes.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Drop every pending envelope, returning how many were discarded.
    pub fn clear(&self) -> usize {
        let mut queue = self.queue.lock();
        let dropped = queue.len();
        queue.clear();
        dropped
    }
}

impl<M> Default for Mailbox<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> std::fmt::Debug for Mailbox<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.len();
        f.debug_struct("Mailbox").field("len", &len).finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Request Queue
//!
//! Per-backend FIFO of requests waiting for a connection. There is no
//! priority and no reordering: the head of the queue is always the oldest
//! waiting request.

use std::collections::VecDeque;

use parking_lot::Mutex;

struct QueueState<T> {
    items: VecDeque<T>,
    peak: usize,
}

/// Strict FIFO, safe to share between threads
///
/// Push and pop are atomic with respect to each other.
pub struct RequestQueue<T> {
    state: Mutex<QueueState<T>>,
}

impl<T> Default for RequestQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RequestQueue<T> {
    /// Empty queue
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                peak: 0,
            }),
        }
    }

    /// Append at the tail, returning the new depth
    pub fn push(&self, item: T) -> usize {
        let mut state = self.state.lock();
        state.items.push_back(item);
        let depth = state.items.len();
        state.peak = state.peak.max(depth);
        depth
    }

    /// Remove the head
    pub fn pop(&self) -> Option<T> {
        self.state.lock().items.pop_front()
    }

    /// Current depth
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Whether nothing is waiting
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Highest depth ever reached
    #[must_use]
    pub fn peak_depth(&self) -> usize {
        self.state.lock().peak
    }

    /// Remove everything, oldest first
    pub fn drain(&self) -> Vec<T> {
        self.state.lock().items.drain(..).collect()
    }
}

impl<T> std::fmt::Debug for RequestQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RequestQueue")
            .field("depth", &state.items.len())
            .field("peak", &state.peak)
            .finish()
    }
}

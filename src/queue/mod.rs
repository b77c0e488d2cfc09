use crate::model::Request;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// FIFO of decoded commands between the receive loop and the dispatch loop.
///
/// Clones share the same queue. The lock is held only for the push/pop itself.
#[derive(Debug, Clone, Default)]
pub struct RequestQueue {
    inner: Arc<Mutex<VecDeque<Request>>>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, request: Request) {
        self.lock().push_back(request);
    }

    pub fn pop(&self) -> Option<Request> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop everything still queued. Returns how many requests were discarded.
    pub fn clear(&self) -> usize {
        let mut queue = self.lock();
        let dropped = queue.len();
        queue.clear();
        dropped
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Request>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

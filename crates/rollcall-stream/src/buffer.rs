//! Bounded frame buffer between the acquisition thread and consumers.
//!
//! The buffer holds the most recent frames only. When full, pushing evicts
//! the oldest frame so a slow consumer sees fresh imagery instead of a
//! growing backlog.

use crate::frame::Frame;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

pub const DEFAULT_CAPACITY: usize = 2;

pub struct FrameBuffer {
    inner: Mutex<VecDeque<Frame>>,
    available: Condvar,
    capacity: usize,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            available: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a frame, evicting the oldest if the buffer is full. Returns
    /// whether an eviction happened.
    pub fn push(&self, frame: Frame) -> bool {
        let Ok(mut queue) = self.inner.lock() else {
            return false;
        };
        let mut evicted = false;
        while queue.len() >= self.capacity {
            queue.pop_front();
            evicted = true;
        }
        queue.push_back(frame);
        drop(queue);
        self.available.notify_all();
        evicted
    }

    /// Wait up to `timeout` for a frame, then return the freshest one,
    /// discarding anything older. `None` on timeout.
    pub fn recv_latest(&self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.inner.lock().ok()?;

        loop {
            if !queue.is_empty() {
                let dropped = queue.len() - 1;
                if dropped > 0 {
                    tracing::trace!(dropped, "skipping stale frames");
                    queue.drain(..dropped);
                }
                return queue.pop_front();
            }

            let remaining = deadline.checked_duration_since(Instant::now())?;
            let (guard, result) = self.available.wait_timeout(queue, remaining).ok()?;
            queue = guard;
            if result.timed_out() && queue.is_empty() {
                return None;
            }
        }
    }

    /// Discard all buffered frames. Called on reconnect so consumers never
    /// see imagery from before an outage.
    pub fn clear(&self) {
        if let Ok(mut queue) = self.inner.lock() {
            queue.clear();
        }
    }
}

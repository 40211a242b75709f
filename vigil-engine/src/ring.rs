//! Rolling pre-event context buffer.

use std::collections::VecDeque;

use vigil_types::RecordedFrame;

/// Holds the most recent frames while no event is being captured, so a
/// new event can be seeded with what led up to it.
pub struct PreEventBuffer {
    capacity: usize,
    inner: VecDeque<RecordedFrame>,
}

impl PreEventBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: VecDeque::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn push(&mut self, frame: RecordedFrame) {
        if self.capacity == 0 {
            return;
        }
        self.inner.push_back(frame);
        while self.inner.len() > self.capacity {
            self.inner.pop_front();
        }
    }

    /// Drain the buffered context into an event seed.
    pub fn take_all(&mut self) -> Vec<RecordedFrame> {
        std::mem::take(&mut self.inner).into()
    }
}

//! Circular buffer for output replay on session reattach.
//!
//! Stores the last N output chunks of a session so that a reconnecting
//! client can receive a scrollback snapshot without the server keeping
//! unbounded history.

use std::collections::VecDeque;

/// A fixed-capacity circular buffer with overwrite-oldest semantics.
#[derive(Debug)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// Create a new ring buffer holding at most `capacity` items.
    ///
    /// Panics if `capacity` is zero; a zero-capacity buffer is a
    /// construction-time programming error, not a runtime condition.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "ring buffer capacity must be at least 1");
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push an item, evicting the oldest one if the buffer is full. O(1).
    pub fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Reset to empty without reallocating.
    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T: Clone> RingBuffer<T> {
    /// All held items in oldest-to-newest order.
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_push_read() {
        let mut rb = RingBuffer::new(10);
        rb.push(1);
        rb.push(2);
        assert_eq!(rb.to_vec(), vec![1, 2]);
    }

    #[test]
    fn overwrites_oldest_when_full() {
        let mut rb = RingBuffer::new(3);
        for i in 0..5 {
            rb.push(i);
        }
        assert_eq!(rb.to_vec(), vec![2, 3, 4]);
    }

    #[test]
    fn keeps_most_recent_min_n_c() {
        // For any N pushes into capacity C, exactly min(N, C) of the most
        // recent items survive, in push order.
        for capacity in [1usize, 2, 7, 100] {
            for n in [0usize, 1, 5, 150] {
                let mut rb = RingBuffer::new(capacity);
                for i in 0..n {
                    rb.push(i);
                }
                let expected: Vec<usize> = (n.saturating_sub(capacity)..n).collect();
                assert_eq!(rb.to_vec(), expected, "capacity={capacity} n={n}");
            }
        }
    }

    #[test]
    fn clear_resets_regardless_of_state() {
        let mut rb = RingBuffer::new(2);
        rb.push("a");
        rb.push("b");
        rb.push("c");
        rb.clear();
        assert!(rb.is_empty());
        assert_eq!(rb.to_vec(), Vec::<&str>::new());
        rb.push("d");
        assert_eq!(rb.to_vec(), vec!["d"]);
    }

    #[test]
    #[should_panic]
    fn zero_capacity_is_rejected() {
        let _ = RingBuffer::<u8>::new(0);
    }
}

//! Min-heap of flow records ordered by end time.
//!
//! Used when output must be published in end-time order: records are held
//! here until the generator's clock passes their end time, then popped and
//! written. Ties between equal end times pop in arbitrary order.

use crate::flowrec::FlowRecord;

/// Default capacity multiplier applied when the heap fills.
pub const DEFAULT_GROWTH_FACTOR: f64 = 2.0;

/// Array-backed min-heap keyed on [`FlowRecord::end_time_ms`].
pub struct RecordHeap {
    records: Vec<FlowRecord>,
    capacity: usize,
    growth: f64,
}

impl RecordHeap {
    /// Heap with an initial capacity and a growth factor applied on overflow.
    /// The factor is clamped to at least 1.25.
    pub fn new(initial_capacity: usize, growth: f64) -> Self {
        let capacity = initial_capacity.max(1);
        Self {
            records: Vec::with_capacity(capacity),
            capacity,
            growth: growth.max(1.25),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Current capacity; grows on demand, never shrinks.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Record with the smallest end time, if any.
    pub fn peek(&self) -> Option<&FlowRecord> {
        self.records.first()
    }

    /// Insert a record, growing the backing array when full.
    pub fn insert(&mut self, record: FlowRecord) {
        if self.records.len() == self.capacity {
            let grown = (self.capacity as f64 * self.growth) as usize;
            self.capacity = grown.max(self.capacity + 1);
            self.records.reserve(self.capacity - self.records.len());
        }
        self.records.push(record);
        self.sift_up(self.records.len() - 1);
    }

    /// Remove and return the record with the smallest end time.
    pub fn pop(&mut self) -> Option<FlowRecord> {
        if self.records.is_empty() {
            return None;
        }
        let last = self.records.len() - 1;
        self.records.swap(0, last);
        let out = self.records.pop();
        if !self.records.is_empty() {
            self.sift_down(0);
        }
        out
    }

    fn key(&self, idx: usize) -> i64 {
        self.records[idx].end_time_ms()
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.key(idx) >= self.key(parent) {
                break;
            }
            self.records.swap(idx, parent);
            idx = parent;
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        let len = self.records.len();
        loop {
            let left = 2 * idx + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let mut smallest = left;
            if right < len && self.key(right) < self.key(left) {
                smallest = right;
            }
            if self.key(idx) <= self.key(smallest) {
                break;
            }
            self.records.swap(idx, smallest);
            idx = smallest;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn rec(start: i64, dur: u32) -> FlowRecord {
        FlowRecord {
            start_time_ms: start,
            duration_ms: dur,
            ..FlowRecord::default()
        }
    }

    #[test]
    fn test_pop_orders_by_end_time() {
        let mut heap = RecordHeap::new(4, 2.0);
        heap.insert(rec(100, 50)); // ends 150
        heap.insert(rec(0, 10)); // ends 10
        heap.insert(rec(50, 25)); // ends 75
        heap.insert(rec(0, 200)); // ends 200

        let ends: Vec<i64> = std::iter::from_fn(|| heap.pop())
            .map(|r| r.end_time_ms())
            .collect();
        assert_eq!(ends, vec![10, 75, 150, 200]);
    }

    #[test]
    fn test_peek_is_minimum_of_all_pops() {
        let mut rng = StdRng::seed_from_u64(99);
        let mut heap = RecordHeap::new(8, 2.0);
        for _ in 0..500 {
            heap.insert(rec(rng.random_range(0..1_000_000), rng.random_range(0..60_000)));
        }
        let mut prev = i64::MIN;
        while let Some(peeked) = heap.peek().map(FlowRecord::end_time_ms) {
            let popped = heap.pop().unwrap().end_time_ms();
            assert_eq!(peeked, popped);
            assert!(popped >= prev);
            prev = popped;
        }
        assert!(heap.is_empty());
    }

    #[test]
    fn test_grows_past_initial_capacity() {
        let mut heap = RecordHeap::new(2, 2.0);
        assert_eq!(heap.capacity(), 2);
        for i in 0..100 {
            heap.insert(rec(i, 0));
        }
        assert_eq!(heap.len(), 100);
        assert!(heap.capacity() >= 100);
    }

    #[test]
    fn test_empty_heap() {
        let mut heap = RecordHeap::new(4, 2.0);
        assert!(heap.peek().is_none());
        assert!(heap.pop().is_none());
        assert_eq!(heap.len(), 0);
    }
}

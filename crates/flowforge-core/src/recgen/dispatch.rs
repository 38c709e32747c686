//! Deterministic event dispatch.
//!
//! Every producer and the consumer run the same 31-bit pseudo-random stream
//! seeded from the run's seed. Each draw selects the event class whose
//! dispatch range contains the value, so all parties agree on which class
//! owns every event without sharing any state. The stream must be stable
//! across runs and platforms, so it is a fixed Lehmer generator rather than
//! a library RNG.

/// Exclusive upper bound of the dispatch value space.
pub const DISPATCH_SPAN: u64 = 1 << 31;

const MINSTD_MULTIPLIER: u64 = 48_271;
const MINSTD_MODULUS: u64 = 0x7FFF_FFFF;

/// 31-bit Lehmer (minstd) generator.
#[derive(Debug, Clone)]
pub struct DispatchRng {
    state: u64,
}

impl DispatchRng {
    /// Seed the stream. A seed of zero (which minstd cannot leave) is mapped
    /// to one.
    pub fn new(seed: u32) -> Self {
        let state = u64::from(seed) % MINSTD_MODULUS;
        Self {
            state: if state == 0 { 1 } else { state },
        }
    }

    /// Next value in `[1, 2^31 - 1)`.
    pub fn next_value(&mut self) -> u32 {
        self.state = self.state * MINSTD_MULTIPLIER % MINSTD_MODULUS;
        self.state as u32
    }
}

/// Contiguous dispatch sub-interval `[min, max)` owned by one event class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchRange {
    pub min: u32,
    pub max: u32,
}

impl DispatchRange {
    pub fn contains(&self, value: u32) -> bool {
        self.min <= value && value < self.max
    }
}

/// Partition `[0, 2^31)` proportionally to `weights`. The weights are the
/// classes' target record percentages divided by their records per event, so
/// event frequency, not record volume, follows the percentages.
pub fn assign_ranges(weights: &[f64]) -> Vec<DispatchRange> {
    let total: f64 = weights.iter().sum();
    let mut ranges = Vec::with_capacity(weights.len());
    let mut cumulative = 0.0;
    let mut min = 0u32;
    for (i, w) in weights.iter().enumerate() {
        cumulative += w;
        let max = if i == weights.len() - 1 {
            DISPATCH_SPAN as u32
        } else {
            (DISPATCH_SPAN as f64 * cumulative / total) as u32
        };
        ranges.push(DispatchRange { min, max });
        min = max;
    }
    ranges
}

/// Index of the range containing `value`. Ranges are contiguous and cover
/// the full span, so a value always lands somewhere.
pub fn locate(ranges: &[DispatchRange], value: u32) -> usize {
    let idx = ranges.partition_point(|r| r.max <= value);
    idx.min(ranges.len() - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_is_deterministic() {
        let mut a = DispatchRng::new(12_345);
        let mut b = DispatchRng::new(12_345);
        for _ in 0..1000 {
            assert_eq!(a.next_value(), b.next_value());
        }
    }

    #[test]
    fn test_different_seeds_diverge() {
        let mut a = DispatchRng::new(1);
        let mut b = DispatchRng::new(2);
        let same = (0..100).filter(|_| a.next_value() == b.next_value()).count();
        assert!(same < 100);
    }

    #[test]
    fn test_zero_seed_usable() {
        let mut rng = DispatchRng::new(0);
        let v = rng.next_value();
        assert!(v > 0);
    }

    #[test]
    fn test_minstd_known_value() {
        // After 10000 steps from seed 1, minstd(48271) reaches 399268537.
        let mut rng = DispatchRng::new(1);
        let mut last = 0;
        for _ in 0..10_000 {
            last = rng.next_value();
        }
        assert_eq!(last, 399_268_537);
    }

    #[test]
    fn test_ranges_cover_span_contiguously() {
        let ranges = assign_ranges(&[45.0 / 4.5, 25.0 / 2.0, 10.0 / 4.0, 15.0 / 2.5, 5.0 / 2.0]);
        assert_eq!(ranges[0].min, 0);
        assert_eq!(ranges.last().unwrap().max, DISPATCH_SPAN as u32);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].max, pair[1].min);
        }
    }

    #[test]
    fn test_ranges_proportional() {
        let ranges = assign_ranges(&[1.0, 1.0]);
        let half = (DISPATCH_SPAN / 2) as u32;
        assert_eq!(ranges[0], DispatchRange { min: 0, max: half });
        assert_eq!(
            ranges[1],
            DispatchRange {
                min: half,
                max: DISPATCH_SPAN as u32
            }
        );
    }

    #[test]
    fn test_locate_matches_contains() {
        let ranges = assign_ranges(&[3.0, 1.0, 2.0]);
        let mut rng = DispatchRng::new(7);
        for _ in 0..10_000 {
            let v = rng.next_value();
            let idx = locate(&ranges, v);
            assert!(ranges[idx].contains(v));
        }
    }
}

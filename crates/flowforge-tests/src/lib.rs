//! Invariant-check battery for the flowforge storage core.
//!
//! Each check builds its own fixture, exercises one contract of the core
//! (red-black structure, saturating arithmetic, LRU bounds, dispatch
//! determinism, ...), and reports a [`CheckResult`]. The CLI's `selfcheck`
//! command runs [`run_all`]; the checks are also usable individually when
//! bisecting a regression.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use flowforge_core::bag::{AggregateBag, FieldValues};
use flowforge_core::cache::{DEFAULT_INACTIVE_TIMEOUT_MS, StreamCache, StreamKey};
use flowforge_core::heap::RecordHeap;
use flowforge_core::layout::{FieldType, intern_fields};
use flowforge_core::ordmap::{Nearest, OrderedMap, WalkPhase};
use flowforge_core::recgen::classes::{EventClass, standard_classes};
use flowforge_core::recgen::dispatch::{DispatchRng, assign_ranges, locate};
use flowforge_core::stream::{CompressionMethod, RecordWriter, StreamHeader};
use flowforge_core::{FlowRecord, SensorId};

// ═══════════════════════════════════════════════════════════════════════════
// Result type
// ═══════════════════════════════════════════════════════════════════════════

/// Outcome of a single check.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: &'static str,
    pub passed: bool,
    pub details: String,
}

impl CheckResult {
    fn pass(name: &'static str, details: impl Into<String>) -> Self {
        Self {
            name,
            passed: true,
            details: details.into(),
        }
    }

    fn fail(name: &'static str, details: impl Into<String>) -> Self {
        Self {
            name,
            passed: false,
            details: details.into(),
        }
    }

    fn from_violations(name: &'static str, violations: Vec<String>, ok: impl Into<String>) -> Self {
        if violations.is_empty() {
            Self::pass(name, ok)
        } else {
            Self::fail(name, violations.join("; "))
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Red-black structure audit
// ═══════════════════════════════════════════════════════════════════════════

/// Audit the red-black invariants of a map: sorted iteration, black root,
/// no red-red edge, equal black-height on every root-to-leaf path. Returns
/// the violations found (empty = sound).
pub fn rbtree_violations<K>(map: &OrderedMap<K>) -> Vec<String> {
    let mut violations = Vec::new();

    let keys: Vec<&K> = map.iter().collect();
    if keys.len() != map.len() {
        violations.push(format!(
            "iterator yielded {} keys for len {}",
            keys.len(),
            map.len()
        ));
    }
    for pair in keys.windows(2) {
        if map.compare(pair[0], pair[1]) != std::cmp::Ordering::Less {
            violations.push("iteration order is not strictly ascending".to_string());
            break;
        }
    }

    // Reconstruct colors and black-heights from the walk stream.
    let mut stack: Vec<(bool, Vec<u32>, usize)> = Vec::new();
    map.walk(|step| match step.phase {
        WalkPhase::Pre => {
            if step.depth == 0 && step.red {
                violations.push("root is red".to_string());
            }
            if let Some((parent_red, _, _)) = stack.last() {
                if *parent_red && step.red {
                    violations.push("red node has a red child".to_string());
                }
            }
            let children = step.has_left as usize + step.has_right as usize;
            stack.push((step.red, Vec::new(), children));
        }
        WalkPhase::In => {}
        WalkPhase::Post => {
            let Some((red, mut heights, children)) = stack.pop() else {
                violations.push("walk produced unbalanced phases".to_string());
                return;
            };
            if heights.len() != children {
                violations.push("child subtree produced no black-height".to_string());
            }
            for _ in heights.len()..2 {
                heights.push(1);
            }
            if heights.windows(2).any(|w| w[0] != w[1]) {
                violations.push(format!("black-height mismatch {heights:?}"));
            }
            let h = heights[0] + u32::from(!red);
            if let Some((_, parent_heights, _)) = stack.last_mut() {
                parent_heights.push(h);
            }
        }
    });
    violations
}

/// Random insert/delete workload with a structure audit after every step.
pub fn check_tree_structure() -> CheckResult {
    const NAME: &str = "tree structure under random workload";
    let mut rng = StdRng::seed_from_u64(0xF10F);
    let mut map: OrderedMap<u32> = OrderedMap::new(|a: &u32, b| a.cmp(b));
    let mut shadow = BTreeSet::new();

    for step in 0..1500 {
        let key = rng.random_range(0u32..400);
        if rng.random_bool(0.6) {
            map.insert_or_get(key);
            shadow.insert(key);
        } else {
            let removed = map.remove(&key).is_some();
            if removed != shadow.remove(&key) {
                return CheckResult::fail(NAME, format!("remove({key}) disagreed at step {step}"));
            }
        }
        let violations = rbtree_violations(&map);
        if !violations.is_empty() {
            return CheckResult::fail(
                NAME,
                format!("step {step}: {}", violations.join("; ")),
            );
        }
    }
    let got: Vec<u32> = map.iter().copied().collect();
    let want: Vec<u32> = shadow.into_iter().collect();
    if got != want {
        return CheckResult::fail(NAME, "final content diverged from shadow set");
    }
    CheckResult::pass(NAME, format!("1500 operations, final size {}", got.len()))
}

/// `find` reflects exactly the insert/delete history.
pub fn check_tree_find_remove() -> CheckResult {
    const NAME: &str = "find/remove consistency";
    let mut map: OrderedMap<u32> = OrderedMap::new(|a: &u32, b| a.cmp(b));
    let mut violations = Vec::new();

    for key in (0..200).step_by(2) {
        map.insert_or_get(key);
    }
    for key in 0u32..200 {
        let found = map.find(&key).is_some();
        if found != (key % 2 == 0) {
            violations.push(format!("find({key}) = {found} before delete"));
        }
    }
    for key in (0..200).step_by(4) {
        map.remove(&key);
    }
    for key in (0u32..200).step_by(2) {
        let found = map.find(&key).is_some();
        if found != (key % 4 != 0) {
            violations.push(format!("find({key}) = {found} after delete"));
        }
    }
    CheckResult::from_violations(NAME, violations, "200 keys, interleaved deletes")
}

/// Nearest-neighbor modes against a known key set.
pub fn check_tree_nearest() -> CheckResult {
    const NAME: &str = "nearest-neighbor lookups";
    let mut map: OrderedMap<u32> = OrderedMap::new(|a: &u32, b| a.cmp(b));
    for key in [10u32, 20, 30, 40] {
        map.insert_or_get(key);
    }
    let at = |mode, key: u32| map.nearest(mode, Some(&key)).map(|id| *map.key(id));
    let mut violations = Vec::new();
    let cases: [(&str, Option<u32>, Option<u32>); 8] = [
        ("le exact", at(Nearest::Le, 20), Some(20)),
        ("le between", at(Nearest::Le, 25), Some(20)),
        ("ge between", at(Nearest::Ge, 25), Some(30)),
        ("lt exact", at(Nearest::Lt, 20), Some(10)),
        ("gt exact", at(Nearest::Gt, 20), Some(30)),
        ("prev", at(Nearest::Prev, 30), Some(20)),
        ("next missing", at(Nearest::Next, 25), None),
        ("lt underflow", at(Nearest::Lt, 10), None),
    ];
    for (label, got, want) in cases {
        if got != want {
            violations.push(format!("{label}: got {got:?}, want {want:?}"));
        }
    }
    let first = map.nearest(Nearest::First, None).map(|id| *map.key(id));
    if first != Some(10) {
        violations.push(format!("first: got {first:?}"));
    }
    CheckResult::from_violations(NAME, violations, "9 modes against {10,20,30,40}")
}

// ═══════════════════════════════════════════════════════════════════════════
// Layout interning
// ═══════════════════════════════════════════════════════════════════════════

/// Interning the same field set in any order yields the same handle.
pub fn check_layout_interning() -> CheckResult {
    const NAME: &str = "layout interning identity";
    let a = intern_fields(&[FieldType::SIpv4, FieldType::DPort, FieldType::Protocol]);
    let b = intern_fields(&[FieldType::Protocol, FieldType::SIpv4, FieldType::DPort]);
    let c = intern_fields(&[FieldType::SIpv4, FieldType::DPort]);
    match (a, b, c) {
        (Ok(a), Ok(b), Ok(c)) => {
            if !Arc::ptr_eq(&a, &b) {
                CheckResult::fail(NAME, "same field set interned to different handles")
            } else if Arc::ptr_eq(&a, &c) {
                CheckResult::fail(NAME, "different field sets interned to the same handle")
            } else {
                CheckResult::pass(NAME, "handles identical across orderings")
            }
        }
        _ => CheckResult::fail(NAME, "intern refused a valid field set"),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Aggregate bag arithmetic and persistence
// ═══════════════════════════════════════════════════════════════════════════

fn byte_bag() -> (AggregateBag, FieldValues, FieldValues) {
    let mut bag = AggregateBag::new();
    bag.set_key_fields(&[FieldType::DIpv4]).expect("key schema");
    bag.set_counter_fields(&[FieldType::SumBytes])
        .expect("counter schema");
    let key = FieldValues::zeroed(bag.key_layout().expect("key layout"));
    let counter = FieldValues::zeroed(bag.counter_layout().expect("counter layout"));
    (bag, key, counter)
}

/// Adds saturate at `u64::MAX` per field.
pub fn check_bag_saturation() -> CheckResult {
    const NAME: &str = "bag saturating addition";
    let (mut bag, mut key, mut counter) = byte_bag();
    key.set_ipv4(FieldType::DIpv4, Ipv4Addr::new(1, 2, 3, 4))
        .expect("set key");
    counter
        .set_unsigned(FieldType::SumBytes, 0xFFFF_FFFF_FFFF_FFF0)
        .expect("set counter");
    bag.add(&key, &counter).expect("first add");
    counter
        .set_unsigned(FieldType::SumBytes, 0x20)
        .expect("set counter");
    bag.add(&key, &counter).expect("second add");

    match bag.get(&key).and_then(|c| c.get_unsigned(FieldType::SumBytes)) {
        Ok(u64::MAX) => CheckResult::pass(NAME, "clamped at u64::MAX"),
        Ok(v) => CheckResult::fail(NAME, format!("expected u64::MAX, got {v:#x}")),
        Err(e) => CheckResult::fail(NAME, e.to_string()),
    }
}

/// Subtraction floors at zero and never removes the entry.
pub fn check_bag_subtract() -> CheckResult {
    const NAME: &str = "bag floor-zero subtraction";
    let (mut bag, mut key, mut counter) = byte_bag();
    key.set_ipv4(FieldType::DIpv4, Ipv4Addr::new(5, 6, 7, 8))
        .expect("set key");
    counter
        .set_unsigned(FieldType::SumBytes, 100)
        .expect("set counter");
    bag.add(&key, &counter).expect("add");
    counter
        .set_unsigned(FieldType::SumBytes, 5000)
        .expect("set counter");
    bag.subtract(&key, &counter).expect("subtract");

    let stored = match bag.get(&key).and_then(|c| c.get_unsigned(FieldType::SumBytes)) {
        Ok(v) => v,
        Err(e) => return CheckResult::fail(NAME, e.to_string()),
    };
    if stored != 0 {
        return CheckResult::fail(NAME, format!("expected floor 0, got {stored}"));
    }
    if bag.len() != 1 {
        return CheckResult::fail(NAME, "entry vanished after reaching zero");
    }
    CheckResult::pass(NAME, "floored at zero, entry retained")
}

/// Serialize, reread, and compare entry-for-entry.
pub fn check_bag_round_trip() -> CheckResult {
    const NAME: &str = "bag serialization round trip";
    let mut bag = AggregateBag::new();
    bag.set_key_fields(&[FieldType::SIpv4, FieldType::DPort])
        .expect("key schema");
    bag.set_counter_fields(&[FieldType::Records, FieldType::SumBytes])
        .expect("counter schema");
    let mut rng = StdRng::seed_from_u64(0xBA6);
    for _ in 0..64 {
        let mut key = FieldValues::zeroed(bag.key_layout().expect("layout"));
        key.set_ipv4(
            FieldType::SIpv4,
            Ipv4Addr::new(10, rng.random(), rng.random(), rng.random()),
        )
        .expect("set ip");
        key.set_unsigned(FieldType::DPort, u64::from(rng.random::<u16>()))
            .expect("set port");
        let mut counter = FieldValues::zeroed(bag.counter_layout().expect("layout"));
        counter
            .set_unsigned(FieldType::Records, rng.random_range(1..100))
            .expect("set records");
        counter
            .set_unsigned(FieldType::SumBytes, rng.random_range(1..1_000_000))
            .expect("set bytes");
        bag.add(&key, &counter).expect("add");
    }

    let bytes = match bag.write_to(Vec::new(), CompressionMethod::Zlib) {
        Ok(b) => b,
        Err(e) => return CheckResult::fail(NAME, format!("write: {e}")),
    };
    let reread = match AggregateBag::read_from(&bytes[..]) {
        Ok(b) => b,
        Err(e) => return CheckResult::fail(NAME, format!("read: {e}")),
    };

    let a: Vec<(Vec<u8>, Vec<u8>)> = bag
        .iter()
        .map(|(k, c)| (k.as_bytes().to_vec(), c.as_bytes().to_vec()))
        .collect();
    let b: Vec<(Vec<u8>, Vec<u8>)> = reread
        .iter()
        .map(|(k, c)| (k.as_bytes().to_vec(), c.as_bytes().to_vec()))
        .collect();
    if a != b {
        return CheckResult::fail(NAME, "entries differ after reread");
    }
    CheckResult::pass(NAME, format!("{} entries, zlib, byte-identical", a.len()))
}

// ═══════════════════════════════════════════════════════════════════════════
// Stream cache
// ═══════════════════════════════════════════════════════════════════════════

fn scratch_cache(
    dir: &std::path::Path,
    max_size: usize,
) -> (StreamCache, Arc<AtomicUsize>) {
    let opened = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&opened);
    let dir = dir.to_path_buf();
    let cache = StreamCache::new(
        max_size,
        DEFAULT_INACTIVE_TIMEOUT_MS,
        Box::new(move |key: &StreamKey| {
            counter.fetch_add(1, Ordering::SeqCst);
            let path = dir.join(format!("s{}-t{}-h{}", key.sensor, key.flowtype, key.hour_ts));
            let file = std::fs::File::create(path)?;
            Ok(Some(RecordWriter::create(
                file,
                StreamHeader::flow(8, CompressionMethod::None),
            )?))
        }),
    )
    .expect("cache size is valid");
    (cache, opened)
}

fn sensor_key(sensor: SensorId) -> StreamKey {
    StreamKey {
        hour_ts: 0,
        sensor,
        flowtype: 0,
    }
}

/// The cache never exceeds its bound and always evicts the oldest entry.
pub fn check_cache_lru() -> CheckResult {
    const NAME: &str = "stream cache LRU bound";
    let dir = tempfile::tempdir().expect("tempdir");
    let (mut cache, opened) = scratch_cache(dir.path(), 3);
    let mut violations = Vec::new();

    for (sensor, now) in [(0u16, 0i64), (1, 1), (2, 2), (3, 3)] {
        cache
            .lookup_or_open(&sensor_key(sensor), now)
            .expect("open stream");
        if cache.len() > 3 {
            violations.push(format!("size {} exceeds bound after sensor {sensor}", cache.len()));
        }
    }
    let sensors: Vec<SensorId> = cache.keys().iter().map(|k| k.sensor).collect();
    if sensors != vec![1, 2, 3] {
        violations.push(format!("expected {{1,2,3}} after eviction, got {sensors:?}"));
    }
    if opened.load(Ordering::SeqCst) != 4 {
        violations.push("opener call count off".to_string());
    }
    cache.close_all();
    CheckResult::from_violations(NAME, violations, "A evicted at the fourth open")
}

/// `flush` closes exactly the streams idle past the timeout.
pub fn check_cache_flush_timeout() -> CheckResult {
    const NAME: &str = "stream cache flush timeout";
    let dir = tempfile::tempdir().expect("tempdir");
    let (mut cache, _) = scratch_cache(dir.path(), 8);
    let minute = 60_000i64;

    cache.lookup_or_open(&sensor_key(0), 0).expect("open");
    cache.lookup_or_open(&sensor_key(1), 2 * minute).expect("open");
    cache.lookup_or_open(&sensor_key(2), 4 * minute).expect("open");
    if let Err(e) = cache.flush(6 * minute) {
        return CheckResult::fail(NAME, format!("flush: {e}"));
    }

    let mut sensors: Vec<SensorId> = cache.keys().iter().map(|k| k.sensor).collect();
    sensors.sort_unstable();
    cache.close_all();
    if sensors != vec![1, 2] {
        return CheckResult::fail(
            NAME,
            format!("expected only sensor 0 closed at t=6m, open set is {sensors:?}"),
        );
    }
    CheckResult::pass(NAME, "5-minute window closed exactly the idle stream")
}

// ═══════════════════════════════════════════════════════════════════════════
// Record heap
// ═══════════════════════════════════════════════════════════════════════════

/// `peek` is the minimum of all subsequent pops.
pub fn check_heap_order() -> CheckResult {
    const NAME: &str = "record heap ordering";
    let mut rng = StdRng::seed_from_u64(0x4EA9);
    let mut heap = RecordHeap::new(16, 2.0);
    for _ in 0..1000 {
        heap.insert(FlowRecord {
            start_time_ms: rng.random_range(0..10_000_000),
            duration_ms: rng.random_range(0..600_000),
            ..FlowRecord::default()
        });
    }
    let mut prev = i64::MIN;
    while let Some(peeked) = heap.peek().map(FlowRecord::end_time_ms) {
        let popped = match heap.pop() {
            Some(r) => r.end_time_ms(),
            None => return CheckResult::fail(NAME, "peek without pop"),
        };
        if peeked != popped {
            return CheckResult::fail(NAME, "pop returned a different record than peek");
        }
        if popped < prev {
            return CheckResult::fail(NAME, format!("end time went backwards: {prev} -> {popped}"));
        }
        prev = popped;
    }
    CheckResult::pass(NAME, "1000 records popped in nondecreasing end-time order")
}

// ═══════════════════════════════════════════════════════════════════════════
// Dispatch determinism
// ═══════════════════════════════════════════════════════════════════════════

/// Producer-side and consumer-side class selection agree draw for draw.
pub fn check_dispatch_determinism() -> CheckResult {
    const NAME: &str = "dispatch stream determinism";
    let classes = standard_classes();
    let weights: Vec<f64> = classes.iter().map(EventClass::weight).collect();
    let ranges = assign_ranges(&weights);

    for seed in [1u32, 12_345, 0xFFFF_FFFF] {
        let mut consumer = DispatchRng::new(seed);
        let mut producer = DispatchRng::new(seed);
        for draw in 0..500 {
            let c = locate(&ranges, consumer.next_value());
            let value = producer.next_value();
            let p = ranges.iter().position(|r| r.contains(value));
            if p != Some(c) {
                return CheckResult::fail(
                    NAME,
                    format!("seed {seed} draw {draw}: consumer chose {c}, producer {p:?}"),
                );
            }
        }
    }
    CheckResult::pass(NAME, "3 seeds x 500 draws in lockstep")
}

// ═══════════════════════════════════════════════════════════════════════════
// Battery driver
// ═══════════════════════════════════════════════════════════════════════════

/// Run every check in the battery.
pub fn run_all() -> Vec<CheckResult> {
    vec![
        check_tree_structure(),
        check_tree_find_remove(),
        check_tree_nearest(),
        check_layout_interning(),
        check_bag_saturation(),
        check_bag_subtract(),
        check_bag_round_trip(),
        check_cache_lru(),
        check_cache_flush_timeout(),
        check_heap_order(),
        check_dispatch_determinism(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_battery_all_pass() {
        for result in run_all() {
            assert!(result.passed, "{}: {}", result.name, result.details);
        }
    }

    #[test]
    fn test_rbtree_violations_empty_map() {
        let map: OrderedMap<u32> = OrderedMap::new(|a: &u32, b| a.cmp(b));
        assert!(rbtree_violations(&map).is_empty());
    }

    #[test]
    fn test_battery_names_unique() {
        let results = run_all();
        let names: BTreeSet<&str> = results.iter().map(|r| r.name).collect();
        assert_eq!(names.len(), results.len());
    }
}

//! Integration tests for flowforge-core.
//!
//! These tests drive the public API end to end:
//! schema setup → aggregation → persistence, and
//! generator pipeline → hourly files → publish.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use flowforge_core::bag::{AggregateBag, FieldValues};
use flowforge_core::layout::FieldType;
use flowforge_core::recgen::classes::{GenContext, standard_classes};
use flowforge_core::recgen::{GeneratorConfig, OutputMode, run_generator};
use flowforge_core::site::{Site, SiteConfig};
use flowforge_core::stream::{CompressionMethod, RecordReader};
use flowforge_core::{FLOW_RECORD_LEN, FlowRecord};

fn test_ctx() -> Arc<GenContext> {
    let site = SiteConfig::default_site();
    Arc::new(GenContext {
        sensors: site.sensors_for_class(0),
        site: Arc::new(site),
        ft_in: 0,
        ft_inweb: 1,
        ft_out: 2,
        ft_outweb: 3,
        sensor_for_ip: None,
    })
}

#[test]
fn generated_records_aggregate_and_round_trip() {
    // Generate an hour of records into a single stream.
    let dir = tempfile::tempdir().unwrap();
    let out_path = dir.path().join("flows.ff");
    let cfg = GeneratorConfig {
        start_time_ms: 0,
        end_time_ms: 3_600_000,
        time_step_ms: 60_000,
        events_per_step: 2,
        seed: 12_345,
        max_available: 8,
        flush_timeout_ms: 300_000,
        file_cache_size: 8,
        use_heap: false,
        compression: CompressionMethod::None,
        output: OutputMode::SingleFile(out_path.clone()),
    };
    let shutdown = Arc::new(AtomicBool::new(false));
    let stats = run_generator(&cfg, &standard_classes(), test_ctx(), shutdown).unwrap();
    assert!(stats.records > 0);

    // Aggregate them into a bag keyed by destination address.
    let mut bag = AggregateBag::new();
    bag.set_key_fields(&[FieldType::DIpv4]).unwrap();
    bag.set_counter_fields(&[FieldType::Records, FieldType::SumBytes])
        .unwrap();
    let key_layout = Arc::clone(bag.key_layout().unwrap());
    let counter_layout = Arc::clone(bag.counter_layout().unwrap());

    let file = std::fs::File::open(&out_path).unwrap();
    let mut reader = RecordReader::open(file).unwrap();
    let mut buf = [0u8; FLOW_RECORD_LEN];
    let mut total_bytes = 0u64;
    let mut total_records = 0u64;
    while reader.read_record(&mut buf).unwrap() {
        let rec = FlowRecord::decode(&buf);
        let mut key = FieldValues::zeroed(&key_layout);
        key.set_ipv4(FieldType::DIpv4, rec.dip).unwrap();
        let mut counter = FieldValues::zeroed(&counter_layout);
        counter.set_unsigned(FieldType::Records, 1).unwrap();
        counter
            .set_unsigned(FieldType::SumBytes, u64::from(rec.bytes))
            .unwrap();
        bag.add(&key, &counter).unwrap();
        total_bytes += u64::from(rec.bytes);
        total_records += 1;
    }
    assert_eq!(total_records, stats.records);

    // The bag's totals must match what went in.
    let (mut sum_records, mut sum_bytes) = (0u64, 0u64);
    for (_, counter) in bag.iter() {
        sum_records += counter.get_unsigned(FieldType::Records).unwrap();
        sum_bytes += counter.get_unsigned(FieldType::SumBytes).unwrap();
    }
    assert_eq!(sum_records, total_records);
    assert_eq!(sum_bytes, total_bytes);

    // And survive a trip through a stream.
    let bytes = bag.write_to(Vec::new(), CompressionMethod::Zlib).unwrap();
    let reread = AggregateBag::read_from(&bytes[..]).unwrap();
    assert_eq!(reread.len(), bag.len());

    // Merging the reread copy doubles every counter.
    let mut doubled = AggregateBag::read_from(&bytes[..]).unwrap();
    doubled.merge(&reread).unwrap();
    let doubled_records: u64 = doubled
        .iter()
        .map(|(_, c)| c.get_unsigned(FieldType::Records).unwrap())
        .sum();
    assert_eq!(doubled_records, 2 * sum_records);
}

#[test]
fn directory_pipeline_publishes_hourly_files() {
    let processing = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let cfg = GeneratorConfig {
        start_time_ms: 0,
        end_time_ms: 3_600_000,
        time_step_ms: 60_000,
        events_per_step: 1,
        seed: 777,
        max_available: 4,
        flush_timeout_ms: 600_000,
        file_cache_size: 6,
        use_heap: true,
        compression: CompressionMethod::None,
        output: OutputMode::Directory {
            processing_dir: processing.path().to_path_buf(),
            output_dir: output.path().to_path_buf(),
        },
    };
    let shutdown = Arc::new(AtomicBool::new(false));
    let stats = run_generator(&cfg, &standard_classes(), test_ctx(), shutdown).unwrap();
    assert!(stats.files_published > 0);

    // Published names follow <type>-<sensor>_<YYYYMMDD.HH>.<unique>.
    for dirent in std::fs::read_dir(output.path()).unwrap() {
        let name = dirent.unwrap().file_name().to_string_lossy().into_owned();
        let (base, _unique) = name.rsplit_once('.').unwrap();
        let (type_sensor, stamp) = base.rsplit_once('_').unwrap();
        assert!(type_sensor.contains('-'), "odd name {name}");
        assert!(stamp.starts_with("1970"), "odd stamp in {name}");
    }
}

#[test]
fn same_seed_reproduces_identical_stream() {
    // Two fully independent pipeline runs with one seed must agree.
    let dir = tempfile::tempdir().unwrap();
    let run = |name: &str| {
        let cfg = GeneratorConfig {
            start_time_ms: 0,
            end_time_ms: 300_000,
            time_step_ms: 60_000,
            events_per_step: 3,
            seed: 424_242,
            max_available: 8,
            flush_timeout_ms: 300_000,
            file_cache_size: 8,
            use_heap: true,
            compression: CompressionMethod::None,
            output: OutputMode::SingleFile(dir.path().join(name)),
        };
        let shutdown = Arc::new(AtomicBool::new(false));
        run_generator(&cfg, &standard_classes(), test_ctx(), shutdown).unwrap();
        std::fs::read(dir.path().join(name)).unwrap()
    };
    assert_eq!(run("first.ff"), run("second.ff"));
}

//! The record-generator pipeline.
//!
//! N producer threads, one per event class, feed a single consumer through
//! bounded per-class queues. Producers and consumer all run the same
//! deterministic dispatch stream (see [`dispatch`]), so everyone agrees on
//! which class owns each event without a shared dispatcher. The consumer
//! routes finished records to an hourly [`StreamCache`], a single output
//! stream, and optionally through a [`RecordHeap`] so publication is ordered
//! by end time.
//!
//! The pipeline clock is record time, not wall time: flush deadlines and the
//! cache's inactive timeout advance with the generated timestamps, which
//! makes runs reproducible from the seed alone.

pub mod classes;
pub mod dispatch;
mod worker;

use std::collections::HashSet;
use std::fs::{self, File};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

use crate::cache::{
    CacheError, DEFAULT_INACTIVE_TIMEOUT_MS, StreamCache, StreamKey, StreamOpener,
    publish_incremental,
};
use crate::flowrec::{FLOW_RECORD_LEN, FlowRecord};
use crate::heap::{DEFAULT_GROWTH_FACTOR, RecordHeap};
use crate::site::Site;
use crate::stream::{CompressionMethod, RecordWriter, StreamError, StreamHeader};
use classes::{EventClass, GenContext};
use dispatch::{DispatchRng, assign_ranges, locate};
use worker::{PopError, Producer, ProducerParams, spawn_producer};

/// Seed stride between subprocess windows.
pub const SUBPROCESS_SEED_STRIDE: u32 = 0x0035_3535;

/// Valid range of the stream-cache size.
pub const FILE_CACHE_SIZE_RANGE: std::ops::RangeInclusive<usize> = 4..=65_535;

/// Initial capacity of the end-time ordering heap.
const HEAP_INITIAL_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("producer {0} stopped generating with an empty queue")]
    StarvedProducer(&'static str),
    #[error("shutdown requested")]
    ShutDown,
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Where finished records go.
pub enum OutputMode {
    /// Hourly incremental files in `processing_dir`, published into
    /// `output_dir` at each flush. Incremental files are uncompressed so
    /// evicted streams can be reopened for append.
    Directory {
        processing_dir: PathBuf,
        output_dir: PathBuf,
    },
    /// Everything into one stream at the given path.
    SingleFile(PathBuf),
}

/// Pipeline configuration.
pub struct GeneratorConfig {
    pub start_time_ms: i64,
    pub end_time_ms: i64,
    pub time_step_ms: i64,
    pub events_per_step: u32,
    pub seed: u32,
    /// Bound on each producer's queue, in events.
    pub max_available: usize,
    pub flush_timeout_ms: i64,
    pub file_cache_size: usize,
    /// Order records by end time before writing.
    pub use_heap: bool,
    /// Compression for single-file output.
    pub compression: CompressionMethod,
    pub output: OutputMode,
}

impl GeneratorConfig {
    fn validate(&self, classes: &[EventClass], ctx: &GenContext) -> Result<(), PipelineError> {
        if self.end_time_ms < self.start_time_ms {
            return Err(PipelineError::InvalidConfig("end time precedes start time"));
        }
        if self.time_step_ms <= 0 {
            return Err(PipelineError::InvalidConfig("time step must be positive"));
        }
        if self.events_per_step == 0 {
            return Err(PipelineError::InvalidConfig("events per step must be positive"));
        }
        if self.max_available == 0 {
            return Err(PipelineError::InvalidConfig("queue bound must be positive"));
        }
        if self.flush_timeout_ms <= 0 {
            return Err(PipelineError::InvalidConfig("flush timeout must be positive"));
        }
        if !FILE_CACHE_SIZE_RANGE.contains(&self.file_cache_size) {
            return Err(PipelineError::InvalidConfig("file cache size out of range"));
        }
        if classes.is_empty() {
            return Err(PipelineError::InvalidConfig("no event classes"));
        }
        if ctx.sensors.is_empty() {
            return Err(PipelineError::InvalidConfig("no sensors for class"));
        }
        Ok(())
    }
}

/// Counters reported by a finished run.
#[derive(Debug, Default, Clone, Copy)]
pub struct GenStats {
    pub events: u64,
    pub records: u64,
    pub files_published: usize,
}

enum SinkState {
    Directory {
        cache: StreamCache,
        processing_dir: PathBuf,
        output_dir: PathBuf,
        site: Arc<dyn Site + Send + Sync>,
        published: usize,
    },
    Single {
        writer: Option<RecordWriter<File>>,
    },
}

impl SinkState {
    fn open(cfg: &GeneratorConfig, ctx: &Arc<GenContext>) -> Result<SinkState, PipelineError> {
        match &cfg.output {
            OutputMode::Directory {
                processing_dir,
                output_dir,
            } => {
                fs::create_dir_all(processing_dir)?;
                fs::create_dir_all(output_dir)?;
                let opener = incremental_opener(Arc::clone(&ctx.site), processing_dir.clone());
                let cache = StreamCache::new(
                    cfg.file_cache_size,
                    DEFAULT_INACTIVE_TIMEOUT_MS,
                    opener,
                )?;
                Ok(SinkState::Directory {
                    cache,
                    processing_dir: processing_dir.clone(),
                    output_dir: output_dir.clone(),
                    site: Arc::clone(&ctx.site),
                    published: 0,
                })
            }
            OutputMode::SingleFile(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let file = File::create(path)?;
                let header = StreamHeader::flow(FLOW_RECORD_LEN as u16, cfg.compression);
                Ok(SinkState::Single {
                    writer: Some(RecordWriter::create(file, header)?),
                })
            }
        }
    }

    fn write(&mut self, rec: &FlowRecord, now_ms: i64) -> Result<(), PipelineError> {
        let mut buf = [0u8; FLOW_RECORD_LEN];
        rec.encode(&mut buf);
        match self {
            SinkState::Directory { cache, .. } => {
                let key = StreamKey {
                    hour_ts: rec.hour_ts(),
                    sensor: rec.sensor,
                    flowtype: rec.flowtype,
                };
                let entry = cache.lookup_or_open(&key, now_ms)?;
                entry.write_record(&buf).map_err(CacheError::Stream)?;
            }
            SinkState::Single { writer } => {
                if let Some(w) = writer.as_mut() {
                    w.write_record(&buf)?;
                }
            }
        }
        Ok(())
    }

    /// Periodic flush: push buffers out and, in directory mode, publish every
    /// completed (closed) incremental file.
    fn flush(&mut self, now_ms: i64) -> Result<(), PipelineError> {
        match self {
            SinkState::Directory {
                cache,
                processing_dir,
                output_dir,
                site,
                published,
            } => {
                cache.flush(now_ms)?;
                let in_use = open_names(cache, site.as_ref());
                *published += publish_incremental(processing_dir, output_dir, &in_use)?;
            }
            SinkState::Single { writer } => {
                if let Some(w) = writer.as_mut() {
                    w.flush()?;
                }
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<usize, PipelineError> {
        match self {
            SinkState::Directory {
                cache,
                processing_dir,
                output_dir,
                published,
                ..
            } => {
                cache.close_all();
                *published += publish_incremental(processing_dir, output_dir, &HashSet::new())?;
                Ok(*published)
            }
            SinkState::Single { writer } => {
                if let Some(w) = writer.take() {
                    w.finish()?;
                }
                Ok(0)
            }
        }
    }
}

fn open_names(cache: &StreamCache, site: &(dyn Site + Send + Sync)) -> HashSet<String> {
    cache
        .keys()
        .iter()
        .filter_map(|k| site.incremental_name(k.flowtype, k.sensor, k.hour_ts))
        .collect()
}

/// Opener for hourly incremental files. Reopens an evicted file in append
/// mode so its header is written exactly once.
fn incremental_opener(
    site: Arc<dyn Site + Send + Sync>,
    processing_dir: PathBuf,
) -> StreamOpener {
    Box::new(move |key: &StreamKey| {
        let name = site
            .incremental_name(key.flowtype, key.sensor, key.hour_ts)
            .ok_or(CacheError::InvalidArgument("unknown flowtype or sensor"))?;
        let path = processing_dir.join(name);
        let header = StreamHeader::flow(FLOW_RECORD_LEN as u16, CompressionMethod::None);
        let resume = path.exists();
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let writer = if resume {
            RecordWriter::append(file, header)?
        } else {
            RecordWriter::create(file, header)?
        };
        Ok(Some(writer))
    })
}

/// Run the single-process pipeline to completion.
///
/// Spawns one producer per class, consumes in dispatch order, and tears the
/// producers down on any error by flipping `shutdown` and waking every
/// queue. `shutdown` may also be flipped externally (a signal handler); the
/// run then drains and returns [`PipelineError::ShutDown`].
pub fn run_generator(
    cfg: &GeneratorConfig,
    classes: &[EventClass],
    ctx: Arc<GenContext>,
    shutdown: Arc<AtomicBool>,
) -> Result<GenStats, PipelineError> {
    cfg.validate(classes, &ctx)?;

    let weights: Vec<f64> = classes.iter().map(EventClass::weight).collect();
    let ranges = assign_ranges(&weights);
    let params = ProducerParams {
        seed: cfg.seed,
        start_time_ms: cfg.start_time_ms,
        end_time_ms: cfg.end_time_ms,
        time_step_ms: cfg.time_step_ms,
        events_per_step: cfg.events_per_step,
        max_available: cfg.max_available,
    };

    let mut producers: Vec<Producer> = classes
        .iter()
        .enumerate()
        .map(|(idx, class)| {
            spawn_producer(
                idx,
                class.clone(),
                ranges[idx],
                params,
                Arc::clone(&ctx),
                Arc::clone(&shutdown),
            )
        })
        .collect();
    log::info!(
        "generating [{}, {}] ms in {} ms steps, {} classes, seed {}",
        cfg.start_time_ms,
        cfg.end_time_ms,
        cfg.time_step_ms,
        classes.len(),
        cfg.seed
    );

    let mut sink = SinkState::open(cfg, &ctx)?;
    let result = consume(cfg, &ranges, &producers, &mut sink, &shutdown);

    // Teardown: release every blocked producer, then reap the threads.
    shutdown.store(true, Ordering::Relaxed);
    for p in &producers {
        p.queue.wake();
    }
    for p in &mut producers {
        p.join();
    }

    match result {
        Ok(mut stats) => {
            stats.files_published = sink.close()?;
            log::info!(
                "generated {} records in {} events, {} files published",
                stats.records,
                stats.events,
                stats.files_published
            );
            Ok(stats)
        }
        Err(err) => {
            // Best-effort close; the original failure is what matters.
            if let Err(close_err) = sink.close() {
                log::warn!("sink close after failure also failed: {close_err}");
            }
            Err(err)
        }
    }
}

fn consume(
    cfg: &GeneratorConfig,
    ranges: &[dispatch::DispatchRange],
    producers: &[Producer],
    sink: &mut SinkState,
    shutdown: &AtomicBool,
) -> Result<GenStats, PipelineError> {
    let mut stats = GenStats::default();
    let mut dispatch = DispatchRng::new(cfg.seed);
    let mut heap = cfg
        .use_heap
        .then(|| RecordHeap::new(HEAP_INITIAL_CAPACITY, DEFAULT_GROWTH_FACTOR));
    let mut now = cfg.start_time_ms;
    let mut next_flush = cfg.start_time_ms + cfg.flush_timeout_ms;

    while now <= cfg.end_time_ms {
        if shutdown.load(Ordering::Relaxed) {
            return Err(PipelineError::ShutDown);
        }
        for _ in 0..cfg.events_per_step {
            let value = dispatch.next_value();
            let class_idx = locate(ranges, value);
            let producer = &producers[class_idx];
            let batch = producer.queue.pop(shutdown).map_err(|e| match e {
                PopError::Starved => PipelineError::StarvedProducer(producer.name),
                PopError::ShutDown => PipelineError::ShutDown,
            })?;
            stats.events += 1;
            for rec in batch {
                match heap.as_mut() {
                    Some(h) => h.insert(rec),
                    None => {
                        sink.write(&rec, now)?;
                        stats.records += 1;
                    }
                }
            }
        }
        now += cfg.time_step_ms;

        // Publish everything that has already ended.
        if let Some(h) = heap.as_mut() {
            while let Some(rec) = h.peek().copied() {
                if rec.end_time_ms() > now {
                    break;
                }
                h.pop();
                sink.write(&rec, now)?;
                stats.records += 1;
            }
        }
        if now >= next_flush {
            sink.flush(now)?;
            next_flush += cfg.flush_timeout_ms;
        }
    }

    // Drain the heap: everything left ends after end_time.
    if let Some(h) = heap.as_mut() {
        while let Some(rec) = h.pop() {
            sink.write(&rec, now)?;
            stats.records += 1;
        }
    }
    Ok(stats)
}

/// Split `[start, end]` into `n` contiguous windows with equal step counts;
/// the remainder steps go to the leftmost windows. `n <= 1` yields the whole
/// interval.
pub fn split_windows(start_ms: i64, end_ms: i64, time_step_ms: i64, n: u32) -> Vec<(i64, i64)> {
    if n <= 1 {
        return vec![(start_ms, end_ms)];
    }
    let total_steps = ((end_ms - start_ms) / time_step_ms + 1).max(1);
    let n = i64::from(n).min(total_steps);
    let base = total_steps / n;
    let rem = total_steps % n;
    let mut windows = Vec::with_capacity(n as usize);
    let mut cursor = start_ms;
    for i in 0..n {
        let steps = base + i64::from(i < rem);
        let window_end = cursor + (steps - 1) * time_step_ms;
        windows.push((cursor, window_end));
        cursor = window_end + time_step_ms;
    }
    windows
}

/// Seed for subprocess window `i`.
pub fn subprocess_seed(seed: u32, window: u32) -> u32 {
    seed.wrapping_add(window.wrapping_mul(SUBPROCESS_SEED_STRIDE))
}

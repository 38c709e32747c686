//! Bounded cache of open hourly output streams.
//!
//! The record generator appends to one file per `(hour, sensor, flowtype)`.
//! Keeping every file open would exhaust descriptors on long runs, so the
//! cache bounds the number of concurrently open streams: a miss invokes the
//! caller-supplied opener, and when the cache is full the entry with the
//! oldest access time is closed first and its slot reused.
//!
//! Entries live in a packed array; a parallel [`OrderedMap`] index keyed
//! `(sensor, flowtype, hour)` resolves lookups. Time never comes from the
//! wall clock — callers pass `now_ms` explicitly, which keeps flush behavior
//! deterministic under test and lets the generator run on record time.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::flowrec::{FlowtypeId, SensorId};
use crate::ordmap::OrderedMap;
use crate::stream::{RecordWriter, StreamError};

/// Streams idle longer than this are closed by [`StreamCache::flush`].
pub const DEFAULT_INACTIVE_TIMEOUT_MS: i64 = 5 * 60 * 1000;

/// Smallest permitted cache size.
pub const MIN_CACHE_SIZE: usize = 2;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("stream factory declined to open a stream")]
    OpenerDeclined,
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Cache key: one output stream per hour, sensor, and flowtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamKey {
    pub hour_ts: i64,
    pub sensor: SensorId,
    pub flowtype: FlowtypeId,
}

impl StreamKey {
    /// Index order: sensor, then flowtype, then timestamp.
    fn index_cmp(&self, other: &StreamKey) -> Ordering {
        self.sensor
            .cmp(&other.sensor)
            .then(self.flowtype.cmp(&other.flowtype))
            .then(self.hour_ts.cmp(&other.hour_ts))
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "sensor {} flowtype {} hour {}",
            self.sensor, self.flowtype, self.hour_ts
        )
    }
}

/// The writer type cached for flow output.
pub type FlowWriter = RecordWriter<fs::File>;

/// Factory invoked on a cache miss. Returning `Ok(None)` declines to open.
pub type StreamOpener =
    Box<dyn FnMut(&StreamKey) -> Result<Option<FlowWriter>, CacheError> + Send>;

/// One open stream with its access bookkeeping.
pub struct CachedStream {
    key: StreamKey,
    writer: FlowWriter,
    records_at_last_flush: u64,
    last_accessed_ms: i64,
}

impl CachedStream {
    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    /// Append one encoded record.
    pub fn write_record(&mut self, record: &[u8]) -> Result<(), StreamError> {
        self.writer.write_record(record)
    }

    /// Total records written to this stream.
    pub fn records_written(&self) -> u64 {
        self.writer.records_written()
    }

    fn records_since_flush(&self) -> u64 {
        self.writer.records_written() - self.records_at_last_flush
    }
}

struct IndexEntry {
    key: StreamKey,
    slot: usize,
}

/// Bounded LRU of open output streams.
pub struct StreamCache {
    max_size: usize,
    inactive_timeout_ms: i64,
    entries: Vec<CachedStream>,
    index: OrderedMap<IndexEntry>,
    opener: StreamOpener,
}

impl StreamCache {
    /// Create a cache bounded to `max_size` open streams (at least
    /// [`MIN_CACHE_SIZE`]).
    pub fn new(
        max_size: usize,
        inactive_timeout_ms: i64,
        opener: StreamOpener,
    ) -> Result<Self, CacheError> {
        if max_size < MIN_CACHE_SIZE {
            return Err(CacheError::InvalidArgument("cache size below minimum"));
        }
        Ok(Self {
            max_size,
            inactive_timeout_ms,
            entries: Vec::with_capacity(max_size),
            index: OrderedMap::new(|a: &IndexEntry, b: &IndexEntry| a.key.index_cmp(&b.key)),
            opener,
        })
    }

    /// Number of currently open streams.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Keys of every open stream, in index order.
    pub fn keys(&self) -> Vec<StreamKey> {
        self.index.iter().map(|e| e.key).collect()
    }

    /// Look up an open stream without opening one. A hit refreshes the
    /// entry's access time.
    pub fn lookup(&mut self, key: &StreamKey, now_ms: i64) -> Option<&mut CachedStream> {
        let slot = self.find_slot(key)?;
        let entry = &mut self.entries[slot];
        entry.last_accessed_ms = now_ms;
        Some(entry)
    }

    /// Look up a stream, invoking the opener on a miss. When the cache is
    /// full the least-recently-used entry is closed to make room.
    pub fn lookup_or_open(
        &mut self,
        key: &StreamKey,
        now_ms: i64,
    ) -> Result<&mut CachedStream, CacheError> {
        if let Some(slot) = self.find_slot(key) {
            self.entries[slot].last_accessed_ms = now_ms;
            return Ok(&mut self.entries[slot]);
        }
        let writer = (self.opener)(key)?.ok_or(CacheError::OpenerDeclined)?;
        self.install(*key, writer, now_ms)
    }

    /// Explicitly add an already-open stream under `key`. Subject to the same
    /// eviction rule as [`lookup_or_open`](Self::lookup_or_open).
    pub fn insert(
        &mut self,
        key: StreamKey,
        writer: FlowWriter,
        now_ms: i64,
    ) -> Result<&mut CachedStream, CacheError> {
        if self.find_slot(&key).is_some() {
            return Err(CacheError::InvalidArgument("key is already cached"));
        }
        self.install(key, writer, now_ms)
    }

    /// Flush every active stream; close and drop streams idle past the
    /// inactive timeout.
    pub fn flush(&mut self, now_ms: i64) -> Result<(), CacheError> {
        let mut slot = 0;
        while slot < self.entries.len() {
            let idle = now_ms - self.entries[slot].last_accessed_ms;
            if idle > self.inactive_timeout_ms {
                log::debug!(
                    "closing idle stream ({}), inactive {} ms",
                    self.entries[slot].key,
                    idle
                );
                self.close_slot(slot);
                // close_slot moved the tail entry into `slot`; revisit it.
            } else {
                let entry = &mut self.entries[slot];
                entry.writer.flush()?;
                entry.records_at_last_flush = entry.writer.records_written();
                slot += 1;
            }
        }
        Ok(())
    }

    /// Close and drop every stream.
    pub fn close_all(&mut self) {
        while !self.entries.is_empty() {
            self.close_slot(self.entries.len() - 1);
        }
    }

    // -- internal -----------------------------------------------------------

    fn find_slot(&self, key: &StreamKey) -> Option<usize> {
        let probe = IndexEntry { key: *key, slot: 0 };
        self.index.find(&probe).map(|id| self.index.key(id).slot)
    }

    fn install(
        &mut self,
        key: StreamKey,
        writer: FlowWriter,
        now_ms: i64,
    ) -> Result<&mut CachedStream, CacheError> {
        if self.entries.len() == self.max_size {
            let victim = self.oldest_slot();
            self.close_slot(victim);
        }
        self.entries.push(CachedStream {
            key,
            writer,
            records_at_last_flush: 0,
            last_accessed_ms: now_ms,
        });
        let slot = self.entries.len() - 1;
        self.index.insert_or_get(IndexEntry { key, slot });
        Ok(&mut self.entries[slot])
    }

    fn oldest_slot(&self) -> usize {
        let mut victim = 0;
        for (slot, entry) in self.entries.iter().enumerate() {
            if entry.last_accessed_ms < self.entries[victim].last_accessed_ms {
                victim = slot;
            }
        }
        victim
    }

    /// Close the stream at `slot` and drop it from the cache. A failed close
    /// is a warning, not an error.
    fn close_slot(&mut self, slot: usize) {
        let entry = &self.entries[slot];
        let key = entry.key;
        let since_flush = entry.records_since_flush();
        self.index.remove(&IndexEntry { key, slot: 0 });
        log::info!("closing stream ({key}): {since_flush} records since last flush");
        let old = self.entries.swap_remove(slot);
        if slot < self.entries.len() {
            self.reindex(slot);
        }
        if let Err(err) = old.writer.finish() {
            log::warn!("close of stream ({key}) failed: {err}");
        }
    }

    /// After `swap_remove`, the entry now at `slot` came from the tail; its
    /// index record must learn the new slot.
    fn reindex(&mut self, slot: usize) {
        let moved_key = self.entries[slot].key;
        if let Some(id) = self.index.find(&IndexEntry {
            key: moved_key,
            slot: 0,
        }) {
            self.index.key_mut(id).slot = slot;
        }
    }
}

/// Move every completed incremental file from `processing_dir` into
/// `output_dir` under a unique `basename.XXXXXX` name, atomically per file.
///
/// Dotfiles, subdirectories, and names listed in `in_use` (files with a
/// still-open stream) are skipped. A failed rename aborts the pass with the
/// error; earlier files stay published. Returns the number of files moved.
pub fn publish_incremental(
    processing_dir: &Path,
    output_dir: &Path,
    in_use: &HashSet<String>,
) -> Result<usize, CacheError> {
    let mut published = 0;
    for dirent in fs::read_dir(processing_dir)? {
        let dirent = dirent?;
        let name = dirent.file_name();
        let name = match name.to_str() {
            Some(n) => n,
            None => continue,
        };
        if name.starts_with('.') || in_use.contains(name) || !dirent.file_type()?.is_file() {
            continue;
        }
        let dest = reserve_unique(output_dir, name)?;
        if let Err(err) = fs::rename(dirent.path(), &dest) {
            let _ = fs::remove_file(&dest);
            return Err(CacheError::Io(err));
        }
        log::info!("published {} -> {}", dirent.path().display(), dest.display());
        published += 1;
    }
    Ok(published)
}

/// Reserve `basename.XXXXXX` in `dir` and return the reserved path.
fn reserve_unique(dir: &Path, basename: &str) -> Result<PathBuf, CacheError> {
    let tmp = tempfile::Builder::new()
        .prefix(&format!("{basename}."))
        .rand_bytes(6)
        .tempfile_in(dir)?;
    let (_file, path) = tmp.keep().map_err(|e| CacheError::Io(e.error))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{CompressionMethod, StreamHeader};
    use std::fs::File;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Arc;

    fn test_opener(dir: PathBuf, opened: Arc<AtomicUsize>) -> StreamOpener {
        Box::new(move |key: &StreamKey| {
            opened.fetch_add(1, AtomicOrdering::SeqCst);
            let path = dir.join(format!("s{}-t{}-h{}", key.sensor, key.flowtype, key.hour_ts));
            let file = File::create(path)?;
            let writer =
                RecordWriter::create(file, StreamHeader::flow(8, CompressionMethod::None))?;
            Ok(Some(writer))
        })
    }

    fn key(sensor: SensorId) -> StreamKey {
        StreamKey {
            hour_ts: 0,
            sensor,
            flowtype: 0,
        }
    }

    // -----------------------------------------------------------------------
    // Bound and eviction
    // -----------------------------------------------------------------------

    #[test]
    fn test_size_minimum_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let opener = test_opener(dir.path().to_path_buf(), Arc::new(AtomicUsize::new(0)));
        assert!(matches!(
            StreamCache::new(1, DEFAULT_INACTIVE_TIMEOUT_MS, opener),
            Err(CacheError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_lru_eviction_closes_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let opened = Arc::new(AtomicUsize::new(0));
        let opener = test_opener(dir.path().to_path_buf(), Arc::clone(&opened));
        let mut cache = StreamCache::new(3, DEFAULT_INACTIVE_TIMEOUT_MS, opener).unwrap();

        // Touch A, B, C, D at strictly increasing times.
        for (sensor, now) in [(0u16, 0i64), (1, 1), (2, 2), (3, 3)] {
            cache.lookup_or_open(&key(sensor), now).unwrap();
        }
        assert_eq!(cache.len(), 3);
        assert_eq!(opened.load(AtomicOrdering::SeqCst), 4);

        let sensors: Vec<SensorId> = cache.keys().iter().map(|k| k.sensor).collect();
        assert_eq!(sensors, vec![1, 2, 3], "A must be the evicted stream");
        assert!(cache.lookup(&key(0), 10).is_none());
        assert!(cache.lookup(&key(1), 10).is_some());
    }

    #[test]
    fn test_eviction_victim_is_least_recently_used() {
        let dir = tempfile::tempdir().unwrap();
        let opened = Arc::new(AtomicUsize::new(0));
        let opener = test_opener(dir.path().to_path_buf(), Arc::clone(&opened));
        let mut cache = StreamCache::new(3, DEFAULT_INACTIVE_TIMEOUT_MS, opener).unwrap();

        cache.lookup_or_open(&key(0), 0).unwrap();
        cache.lookup_or_open(&key(1), 1).unwrap();
        cache.lookup_or_open(&key(2), 2).unwrap();
        // Refresh sensor 0; sensor 1 becomes the oldest.
        cache.lookup(&key(0), 5).unwrap();
        cache.lookup_or_open(&key(3), 6).unwrap();

        let mut sensors: Vec<SensorId> = cache.keys().iter().map(|k| k.sensor).collect();
        sensors.sort_unstable();
        assert_eq!(sensors, vec![0, 2, 3]);
    }

    #[test]
    fn test_hit_does_not_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let opened = Arc::new(AtomicUsize::new(0));
        let opener = test_opener(dir.path().to_path_buf(), Arc::clone(&opened));
        let mut cache = StreamCache::new(4, DEFAULT_INACTIVE_TIMEOUT_MS, opener).unwrap();

        cache.lookup_or_open(&key(7), 0).unwrap();
        cache.lookup_or_open(&key(7), 1).unwrap();
        assert_eq!(opened.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_insert_rejects_duplicate_key() {
        let dir = tempfile::tempdir().unwrap();
        let opened = Arc::new(AtomicUsize::new(0));
        let opener = test_opener(dir.path().to_path_buf(), Arc::clone(&opened));
        let mut cache = StreamCache::new(4, DEFAULT_INACTIVE_TIMEOUT_MS, opener).unwrap();
        cache.lookup_or_open(&key(1), 0).unwrap();

        let file = File::create(dir.path().join("extra")).unwrap();
        let writer =
            RecordWriter::create(file, StreamHeader::flow(8, CompressionMethod::None)).unwrap();
        assert!(matches!(
            cache.insert(key(1), writer, 1),
            Err(CacheError::InvalidArgument(_))
        ));
    }

    // -----------------------------------------------------------------------
    // Flush-by-timeout
    // -----------------------------------------------------------------------

    #[test]
    fn test_flush_closes_only_idle_streams() {
        let dir = tempfile::tempdir().unwrap();
        let opened = Arc::new(AtomicUsize::new(0));
        let opener = test_opener(dir.path().to_path_buf(), Arc::clone(&opened));
        let mut cache = StreamCache::new(8, DEFAULT_INACTIVE_TIMEOUT_MS, opener).unwrap();

        let minute = 60_000i64;
        cache.lookup_or_open(&key(0), 0).unwrap();
        cache.lookup_or_open(&key(1), 2 * minute).unwrap();
        cache.lookup_or_open(&key(2), 4 * minute).unwrap();

        cache.flush(6 * minute).unwrap();
        // A (idle 6m) and B (idle 4m)... only A exceeds the 5-minute window.
        let mut sensors: Vec<SensorId> = cache.keys().iter().map(|k| k.sensor).collect();
        sensors.sort_unstable();
        assert_eq!(sensors, vec![1, 2]);

        // At 8m, B (idle 6m) goes too; C (idle 4m) survives.
        cache.flush(8 * minute).unwrap();
        let sensors: Vec<SensorId> = cache.keys().iter().map(|k| k.sensor).collect();
        assert_eq!(sensors, vec![2]);
    }

    #[test]
    fn test_close_all_empties_cache() {
        let dir = tempfile::tempdir().unwrap();
        let opened = Arc::new(AtomicUsize::new(0));
        let opener = test_opener(dir.path().to_path_buf(), Arc::clone(&opened));
        let mut cache = StreamCache::new(4, DEFAULT_INACTIVE_TIMEOUT_MS, opener).unwrap();
        for s in 0..4u16 {
            cache.lookup_or_open(&key(s), i64::from(s)).unwrap();
        }
        cache.close_all();
        assert!(cache.is_empty());
        assert!(cache.keys().is_empty());
    }

    // -----------------------------------------------------------------------
    // Publish by rename
    // -----------------------------------------------------------------------

    #[test]
    fn test_publish_moves_files_uniquely() {
        let processing = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        std::fs::write(processing.path().join("in-S0_20240101.00"), b"abc").unwrap();
        std::fs::write(processing.path().join("in-S1_20240101.00"), b"def").unwrap();
        std::fs::write(processing.path().join(".hidden"), b"skip").unwrap();
        std::fs::create_dir(processing.path().join("subdir")).unwrap();

        let n = publish_incremental(processing.path(), output.path(), &HashSet::new()).unwrap();
        assert_eq!(n, 2);

        let mut remaining: Vec<String> = std::fs::read_dir(processing.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        remaining.sort();
        assert_eq!(remaining, vec![".hidden", "subdir"]);

        let published: Vec<String> = std::fs::read_dir(output.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(published.len(), 2);
        for name in published {
            assert!(name.starts_with("in-S0_20240101.00.") || name.starts_with("in-S1_20240101.00."));
        }
    }

    #[test]
    fn test_publish_skips_in_use_files() {
        let processing = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        std::fs::write(processing.path().join("in-S0_20240101.00"), b"open").unwrap();
        std::fs::write(processing.path().join("in-S0_20240101.01"), b"done").unwrap();

        let mut in_use = HashSet::new();
        in_use.insert("in-S0_20240101.00".to_string());
        let n = publish_incremental(processing.path(), output.path(), &in_use).unwrap();
        assert_eq!(n, 1);
        assert!(processing.path().join("in-S0_20240101.00").exists());
    }
}

//! Layered record-stream format.
//!
//! Every on-disk artifact in this crate (aggregate bag files, hourly flow
//! files) is a record stream: a fixed header followed by a dense run of
//! fixed-length records. The header is always stored uncompressed; the record
//! section may be zlib-compressed. All multi-byte header fields and all
//! record fields are big-endian — there is no native-order variant and no
//! read-side byte swapping.
//!
//! ```text
//! magic[4] version[1] format[1] compression[1] reserved[1]
//! record_len[2] entry_count[2]
//! ( entry_id[4] entry_len[4] payload[entry_len] )*
//! record[record_len]*            <- possibly zlib-wrapped
//! ```

use std::io::{self, BufReader, BufWriter, Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use thiserror::Error;

/// Leading magic of every flowforge stream.
pub const STREAM_MAGIC: [u8; 4] = *b"FFRS";

/// Current stream container version.
pub const STREAM_VERSION: u8 = 1;

/// Header entry ID carrying an aggregate-bag schema (see [`crate::bag`]).
pub const HENTRY_AGGBAG_ID: u32 = 0xAB;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("bad magic number")]
    BadMagic,
    #[error("unsupported stream version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown file format 0x{0:02x}")]
    UnknownFormat(u8),
    #[error("unknown compression method {0}")]
    UnknownCompression(u8),
    #[error("record is {got} octets but the stream carries {want}-octet records")]
    RecordLength { got: usize, want: usize },
    #[error("truncated record at end of stream")]
    TruncatedRecord,
    #[error("cannot append to a compressed stream")]
    AppendCompressed,
    #[error("malformed header entry")]
    MalformedHeaderEntry,
}

/// What the records in a stream are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileFormat {
    /// Packed [`FlowRecord`](crate::flowrec::FlowRecord)s.
    FlowRecords = 0x16,
    /// Aggregate-bag entries.
    AggregateBag = 0x21,
}

impl FileFormat {
    fn from_u8(v: u8) -> Option<FileFormat> {
        match v {
            0x16 => Some(FileFormat::FlowRecords),
            0x21 => Some(FileFormat::AggregateBag),
            _ => None,
        }
    }
}

/// Record-section compression. The method byte is carried opaquely; policy
/// for choosing one lives with the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CompressionMethod {
    #[default]
    None = 0,
    Zlib = 1,
}

impl CompressionMethod {
    fn from_u8(v: u8) -> Option<CompressionMethod> {
        match v {
            0 => Some(CompressionMethod::None),
            1 => Some(CompressionMethod::Zlib),
            _ => None,
        }
    }
}

impl std::fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Zlib => write!(f, "zlib"),
        }
    }
}

/// A typed, length-prefixed blob in the stream header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderEntry {
    pub id: u32,
    pub data: Vec<u8>,
}

/// Parsed stream header.
#[derive(Debug, Clone)]
pub struct StreamHeader {
    pub format: FileFormat,
    pub record_len: u16,
    pub compression: CompressionMethod,
    pub entries: Vec<HeaderEntry>,
}

impl StreamHeader {
    /// Header for an hourly flow file.
    pub fn flow(record_len: u16, compression: CompressionMethod) -> Self {
        Self {
            format: FileFormat::FlowRecords,
            record_len,
            compression,
            entries: Vec::new(),
        }
    }

    /// Header for an aggregate-bag file with its schema entry.
    pub fn aggregate_bag(record_len: u16, compression: CompressionMethod, schema: Vec<u8>) -> Self {
        Self {
            format: FileFormat::AggregateBag,
            record_len,
            compression,
            entries: vec![HeaderEntry {
                id: HENTRY_AGGBAG_ID,
                data: schema,
            }],
        }
    }

    /// First entry with the given ID.
    pub fn entry(&self, id: u32) -> Option<&HeaderEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    fn write_to<W: Write>(&self, w: &mut W) -> Result<(), StreamError> {
        w.write_all(&STREAM_MAGIC)?;
        w.write_all(&[
            STREAM_VERSION,
            self.format as u8,
            self.compression as u8,
            0,
        ])?;
        w.write_all(&self.record_len.to_be_bytes())?;
        let count = u16::try_from(self.entries.len())
            .map_err(|_| StreamError::MalformedHeaderEntry)?;
        w.write_all(&count.to_be_bytes())?;
        for entry in &self.entries {
            w.write_all(&entry.id.to_be_bytes())?;
            let len = u32::try_from(entry.data.len())
                .map_err(|_| StreamError::MalformedHeaderEntry)?;
            w.write_all(&len.to_be_bytes())?;
            w.write_all(&entry.data)?;
        }
        Ok(())
    }

    fn read_from<R: Read>(r: &mut R) -> Result<Self, StreamError> {
        let mut fixed = [0u8; 10];
        r.read_exact(&mut fixed)?;
        if fixed[..4] != STREAM_MAGIC {
            return Err(StreamError::BadMagic);
        }
        if fixed[4] != STREAM_VERSION {
            return Err(StreamError::UnsupportedVersion(fixed[4]));
        }
        let format = FileFormat::from_u8(fixed[5]).ok_or(StreamError::UnknownFormat(fixed[5]))?;
        let compression =
            CompressionMethod::from_u8(fixed[6]).ok_or(StreamError::UnknownCompression(fixed[6]))?;
        let record_len = u16::from_be_bytes([fixed[8], fixed[9]]);
        let entry_count = {
            let mut buf = [0u8; 2];
            r.read_exact(&mut buf)?;
            u16::from_be_bytes(buf)
        };
        let mut entries = Vec::with_capacity(entry_count as usize);
        for _ in 0..entry_count {
            let mut id_len = [0u8; 8];
            r.read_exact(&mut id_len)?;
            let id = u32::from_be_bytes([id_len[0], id_len[1], id_len[2], id_len[3]]);
            let len = u32::from_be_bytes([id_len[4], id_len[5], id_len[6], id_len[7]]);
            if len > 1 << 20 {
                return Err(StreamError::MalformedHeaderEntry);
            }
            let mut data = vec![0u8; len as usize];
            r.read_exact(&mut data)?;
            entries.push(HeaderEntry { id, data });
        }
        Ok(Self {
            format,
            record_len,
            compression,
            entries,
        })
    }
}

enum Sink<W: Write> {
    Plain(BufWriter<W>),
    Zlib(ZlibEncoder<BufWriter<W>>),
}

/// Writer half of a record stream.
pub struct RecordWriter<W: Write> {
    sink: Sink<W>,
    header: StreamHeader,
    records_written: u64,
}

impl<W: Write> RecordWriter<W> {
    /// Write `header` to `inner` and set up the record section.
    pub fn create(inner: W, header: StreamHeader) -> Result<Self, StreamError> {
        let mut buf = BufWriter::new(inner);
        header.write_to(&mut buf)?;
        let sink = match header.compression {
            CompressionMethod::None => Sink::Plain(buf),
            CompressionMethod::Zlib => Sink::Zlib(ZlibEncoder::new(buf, Compression::default())),
        };
        Ok(Self {
            sink,
            header,
            records_written: 0,
        })
    }

    /// Resume a stream whose header is already on disk; no header is
    /// written. Only uncompressed streams can be appended to — a second
    /// zlib stream would be unreadable past the first.
    pub fn append(inner: W, header: StreamHeader) -> Result<Self, StreamError> {
        if header.compression != CompressionMethod::None {
            return Err(StreamError::AppendCompressed);
        }
        Ok(Self {
            sink: Sink::Plain(BufWriter::new(inner)),
            header,
            records_written: 0,
        })
    }

    pub fn header(&self) -> &StreamHeader {
        &self.header
    }

    /// Records written since creation.
    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    /// Append one record; its length must match the header's record length.
    pub fn write_record(&mut self, record: &[u8]) -> Result<(), StreamError> {
        if record.len() != self.header.record_len as usize {
            return Err(StreamError::RecordLength {
                got: record.len(),
                want: self.header.record_len as usize,
            });
        }
        match &mut self.sink {
            Sink::Plain(w) => w.write_all(record)?,
            Sink::Zlib(w) => w.write_all(record)?,
        }
        self.records_written += 1;
        Ok(())
    }

    /// Push buffered (and, for zlib, pending compressed) data to the sink.
    pub fn flush(&mut self) -> Result<(), StreamError> {
        match &mut self.sink {
            Sink::Plain(w) => w.flush()?,
            Sink::Zlib(w) => w.flush()?,
        }
        Ok(())
    }

    /// Finish the stream and hand back the inner sink.
    pub fn finish(self) -> Result<W, StreamError> {
        let mut buf = match self.sink {
            Sink::Plain(w) => w,
            Sink::Zlib(z) => z.finish()?,
        };
        buf.flush()?;
        buf.into_inner().map_err(|e| StreamError::Io(e.into_error()))
    }
}

enum Source<R: Read> {
    Plain(BufReader<R>),
    Zlib(ZlibDecoder<BufReader<R>>),
}

/// Reader half of a record stream.
pub struct RecordReader<R: Read> {
    source: Source<R>,
    header: StreamHeader,
}

impl<R: Read> RecordReader<R> {
    /// Read and validate the header of `inner`.
    pub fn open(inner: R) -> Result<Self, StreamError> {
        let mut buf = BufReader::new(inner);
        let header = StreamHeader::read_from(&mut buf)?;
        let source = match header.compression {
            CompressionMethod::None => Source::Plain(buf),
            CompressionMethod::Zlib => Source::Zlib(ZlibDecoder::new(buf)),
        };
        Ok(Self { source, header })
    }

    pub fn header(&self) -> &StreamHeader {
        &self.header
    }

    /// Read the next record into `record`. Returns `false` at a clean EOF.
    /// A partial record at EOF is an error, never silently dropped.
    pub fn read_record(&mut self, record: &mut [u8]) -> Result<bool, StreamError> {
        debug_assert_eq!(record.len(), self.header.record_len as usize);
        let mut filled = 0;
        while filled < record.len() {
            let n = match &mut self.source {
                Source::Plain(r) => r.read(&mut record[filled..])?,
                Source::Zlib(r) => r.read(&mut record[filled..])?,
            };
            if n == 0 {
                return if filled == 0 {
                    Ok(false)
                } else {
                    Err(StreamError::TruncatedRecord)
                };
            }
            filled += n;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(compression: CompressionMethod) {
        let header = StreamHeader::flow(8, compression);
        let mut writer = RecordWriter::create(Vec::new(), header).unwrap();
        for i in 0u64..100 {
            writer.write_record(&i.to_be_bytes()).unwrap();
        }
        assert_eq!(writer.records_written(), 100);
        let bytes = writer.finish().unwrap();

        let mut reader = RecordReader::open(&bytes[..]).unwrap();
        assert_eq!(reader.header().format, FileFormat::FlowRecords);
        assert_eq!(reader.header().record_len, 8);
        assert_eq!(reader.header().compression, compression);
        let mut buf = [0u8; 8];
        for i in 0u64..100 {
            assert!(reader.read_record(&mut buf).unwrap());
            assert_eq!(u64::from_be_bytes(buf), i);
        }
        assert!(!reader.read_record(&mut buf).unwrap());
    }

    #[test]
    fn test_round_trip_uncompressed() {
        round_trip(CompressionMethod::None);
    }

    #[test]
    fn test_round_trip_zlib() {
        round_trip(CompressionMethod::Zlib);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let bytes = b"NOPE\x01\x16\x00\x00\x00\x08\x00\x00".to_vec();
        assert!(matches!(
            RecordReader::open(&bytes[..]),
            Err(StreamError::BadMagic)
        ));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let header = StreamHeader::flow(4, CompressionMethod::None);
        let writer = RecordWriter::create(Vec::new(), header).unwrap();
        let mut bytes = writer.finish().unwrap();
        bytes[4] = 9;
        assert!(matches!(
            RecordReader::open(&bytes[..]),
            Err(StreamError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn test_partial_record_is_error() {
        let header = StreamHeader::flow(8, CompressionMethod::None);
        let mut writer = RecordWriter::create(Vec::new(), header).unwrap();
        writer.write_record(&[1u8; 8]).unwrap();
        let mut bytes = writer.finish().unwrap();
        bytes.truncate(bytes.len() - 3);

        let mut reader = RecordReader::open(&bytes[..]).unwrap();
        let mut buf = [0u8; 8];
        assert!(matches!(
            reader.read_record(&mut buf),
            Err(StreamError::TruncatedRecord)
        ));
    }

    #[test]
    fn test_wrong_record_length_rejected() {
        let header = StreamHeader::flow(8, CompressionMethod::None);
        let mut writer = RecordWriter::create(Vec::new(), header).unwrap();
        assert!(matches!(
            writer.write_record(&[0u8; 5]),
            Err(StreamError::RecordLength { got: 5, want: 8 })
        ));
    }

    #[test]
    fn test_header_entries_round_trip() {
        let header = StreamHeader::aggregate_bag(12, CompressionMethod::None, vec![1, 2, 3, 4]);
        let writer = RecordWriter::create(Vec::new(), header).unwrap();
        let bytes = writer.finish().unwrap();
        let reader = RecordReader::open(&bytes[..]).unwrap();
        let entry = reader.header().entry(HENTRY_AGGBAG_ID).unwrap();
        assert_eq!(entry.data, vec![1, 2, 3, 4]);
    }
}

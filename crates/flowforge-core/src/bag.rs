//! Aggregate bags: typed maps from composite keys to composite counters.
//!
//! A bag pairs a key layout with a counter layout and stores each entry as
//! one contiguous byte block of `key_octets + counter_octets`, ordered in an
//! [`OrderedMap`] by the key prefix. Every field is big-endian inside the
//! block, so plain byte comparison of the prefix is also numeric order on the
//! first key field.
//!
//! Counter arithmetic is 64-bit unsigned with saturation: additions clamp at
//! `u64::MAX`, subtractions floor at zero. Counter fields are always 8 octets.
//!
//! The schema is mutable only until the first entry operation or the first
//! read from a stream; after that the bag is frozen and schema setters fail.

use std::io::{Read, Write};
use std::net::Ipv4Addr;
#[cfg(feature = "ipv6")]
use std::net::Ipv6Addr;
use std::sync::Arc;

use thiserror::Error;

use crate::layout::{FieldLayout, FieldType, LayoutField, ValueKind, intern_fields};
use crate::ordmap::OrderedMap;
use crate::stream::{
    CompressionMethod, FileFormat, HENTRY_AGGBAG_ID, RecordReader, RecordWriter, StreamError,
    StreamHeader,
};

/// On-disk version of the aggregate-bag schema header entry.
pub const AGGBAG_HEADER_VERSION: u32 = 1;

/// Octet width of every counter field.
const COUNTER_OCTETS: usize = 8;

#[derive(Debug, Error)]
pub enum BagError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("schema is frozen after the first entry operation or read")]
    SchemaFrozen,
    #[error("{field} is not usable as a {wanted} field")]
    FieldClassMismatch {
        field: FieldType,
        wanted: &'static str,
    },
    #[error("bag has no key fields defined")]
    UndefinedKey,
    #[error("bag has no counter fields defined")]
    UndefinedCounter,
    #[error("key layouts differ between operands")]
    FieldsDifferKey,
    #[error("counter layouts differ between operands")]
    FieldsDifferCounter,
    #[error("typed accessor does not match the kind of {0}")]
    GetSetMismatch(FieldType),
    #[error("field {0} is not part of this layout")]
    BadIndex(FieldType),
    #[error("IPv6 fields are not supported in this build")]
    UnsupportedIpv6,
    #[error("malformed aggregate-bag header: {0}")]
    HeaderMalformed(String),
    #[error(transparent)]
    Stream(#[from] StreamError),
}

fn get_u64(buf: &[u8], off: usize) -> u64 {
    let mut v = 0u64;
    for &b in &buf[off..off + COUNTER_OCTETS] {
        v = v << 8 | u64::from(b);
    }
    v
}

fn put_u64(buf: &mut [u8], off: usize, value: u64) {
    buf[off..off + COUNTER_OCTETS].copy_from_slice(&value.to_be_bytes());
}

fn read_field_unsigned(data: &[u8], field: &LayoutField) -> u64 {
    let off = field.offset as usize;
    let mut v = 0u64;
    for &b in &data[off..off + field.octets as usize] {
        v = v << 8 | u64::from(b);
    }
    v
}

/// Values wider than the field are truncated to its low octets.
fn write_field_unsigned(data: &mut [u8], field: &LayoutField, value: u64) {
    let off = field.offset as usize;
    let w = field.octets as usize;
    let bytes = value.to_be_bytes();
    data[off..off + w].copy_from_slice(&bytes[8 - w..]);
}

fn locate<'a>(
    layout: &'a FieldLayout,
    ftype: FieldType,
    kind: ValueKind,
) -> Result<&'a LayoutField, BagError> {
    let field = layout.field(ftype).ok_or(BagError::BadIndex(ftype))?;
    if ftype.kind() != kind {
        return Err(BagError::GetSetMismatch(ftype));
    }
    Ok(field)
}

/// Owned, typed value buffer bound to an interned layout.
///
/// Build one per key or counter, fill it with the typed setters, and hand it
/// to the bag operations. The bag checks that the buffer's layout handle is
/// pointer-identical to its own.
#[derive(Debug, Clone)]
pub struct FieldValues {
    layout: Arc<FieldLayout>,
    data: Vec<u8>,
}

impl FieldValues {
    /// All-zero buffer for `layout`.
    pub fn zeroed(layout: &Arc<FieldLayout>) -> Self {
        Self {
            layout: Arc::clone(layout),
            data: vec![0u8; layout.octets() as usize],
        }
    }

    pub fn layout(&self) -> &Arc<FieldLayout> {
        &self.layout
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn set_unsigned(&mut self, ftype: FieldType, value: u64) -> Result<(), BagError> {
        let field = *locate(&self.layout, ftype, ValueKind::Unsigned)?;
        write_field_unsigned(&mut self.data, &field, value);
        Ok(())
    }

    pub fn get_unsigned(&self, ftype: FieldType) -> Result<u64, BagError> {
        let field = locate(&self.layout, ftype, ValueKind::Unsigned)?;
        Ok(read_field_unsigned(&self.data, field))
    }

    pub fn set_time(&mut self, ftype: FieldType, ms: i64) -> Result<(), BagError> {
        let field = *locate(&self.layout, ftype, ValueKind::Time)?;
        let off = field.offset as usize;
        self.data[off..off + 8].copy_from_slice(&ms.to_be_bytes());
        Ok(())
    }

    pub fn get_time(&self, ftype: FieldType) -> Result<i64, BagError> {
        let field = locate(&self.layout, ftype, ValueKind::Time)?;
        let off = field.offset as usize;
        let bytes: [u8; 8] = self.data[off..off + 8]
            .try_into()
            .expect("time field is 8 octets");
        Ok(i64::from_be_bytes(bytes))
    }

    pub fn set_ipv4(&mut self, ftype: FieldType, addr: Ipv4Addr) -> Result<(), BagError> {
        let field = *locate(&self.layout, ftype, ValueKind::Ipv4)?;
        let off = field.offset as usize;
        self.data[off..off + 4].copy_from_slice(&addr.octets());
        Ok(())
    }

    pub fn get_ipv4(&self, ftype: FieldType) -> Result<Ipv4Addr, BagError> {
        let field = locate(&self.layout, ftype, ValueKind::Ipv4)?;
        let off = field.offset as usize;
        Ok(Ipv4Addr::new(
            self.data[off],
            self.data[off + 1],
            self.data[off + 2],
            self.data[off + 3],
        ))
    }

    #[cfg(feature = "ipv6")]
    pub fn set_ipv6(&mut self, ftype: FieldType, addr: Ipv6Addr) -> Result<(), BagError> {
        let field = *locate(&self.layout, ftype, ValueKind::Ipv6)?;
        let off = field.offset as usize;
        self.data[off..off + 16].copy_from_slice(&addr.octets());
        Ok(())
    }

    #[cfg(feature = "ipv6")]
    pub fn get_ipv6(&self, ftype: FieldType) -> Result<Ipv6Addr, BagError> {
        let field = locate(&self.layout, ftype, ValueKind::Ipv6)?;
        let off = field.offset as usize;
        let octets: [u8; 16] = self.data[off..off + 16]
            .try_into()
            .expect("ipv6 field is 16 octets");
        Ok(Ipv6Addr::from(octets))
    }
}

/// Borrowed, typed view over one side of a stored entry.
#[derive(Debug, Clone, Copy)]
pub struct FieldRef<'a> {
    layout: &'a Arc<FieldLayout>,
    data: &'a [u8],
}

impl<'a> FieldRef<'a> {
    pub fn layout(&self) -> &'a Arc<FieldLayout> {
        self.layout
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }

    pub fn get_unsigned(&self, ftype: FieldType) -> Result<u64, BagError> {
        let field = locate(self.layout, ftype, ValueKind::Unsigned)?;
        Ok(read_field_unsigned(self.data, field))
    }

    pub fn get_time(&self, ftype: FieldType) -> Result<i64, BagError> {
        let field = locate(self.layout, ftype, ValueKind::Time)?;
        let off = field.offset as usize;
        let bytes: [u8; 8] = self.data[off..off + 8]
            .try_into()
            .expect("time field is 8 octets");
        Ok(i64::from_be_bytes(bytes))
    }

    pub fn get_ipv4(&self, ftype: FieldType) -> Result<Ipv4Addr, BagError> {
        let field = locate(self.layout, ftype, ValueKind::Ipv4)?;
        let off = field.offset as usize;
        Ok(Ipv4Addr::new(
            self.data[off],
            self.data[off + 1],
            self.data[off + 2],
            self.data[off + 3],
        ))
    }

    #[cfg(feature = "ipv6")]
    pub fn get_ipv6(&self, ftype: FieldType) -> Result<Ipv6Addr, BagError> {
        let field = locate(self.layout, ftype, ValueKind::Ipv6)?;
        let off = field.offset as usize;
        let octets: [u8; 16] = self.data[off..off + 16]
            .try_into()
            .expect("ipv6 field is 16 octets");
        Ok(Ipv6Addr::from(octets))
    }
}

/// Typed map from composite keys to composite counters.
#[derive(Default)]
pub struct AggregateBag {
    key_layout: Option<Arc<FieldLayout>>,
    counter_layout: Option<Arc<FieldLayout>>,
    map: Option<OrderedMap<Vec<u8>>>,
    frozen: bool,
}

impl AggregateBag {
    /// Bag with no schema; set key and counter fields before use.
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the key schema. Fails once the bag is frozen.
    pub fn set_key_fields(&mut self, types: &[FieldType]) -> Result<(), BagError> {
        if self.frozen {
            return Err(BagError::SchemaFrozen);
        }
        if types.is_empty() {
            return Err(BagError::InvalidArgument("key field list is empty"));
        }
        for &t in types {
            if t.is_counter() {
                return Err(BagError::FieldClassMismatch {
                    field: t,
                    wanted: "key",
                });
            }
            if matches!(t.kind(), ValueKind::Ipv6) && cfg!(not(feature = "ipv6")) {
                return Err(BagError::UnsupportedIpv6);
            }
        }
        let layout = intern_fields(types)
            .map_err(|_| BagError::InvalidArgument("key field list is empty"))?;
        self.key_layout = Some(layout);
        self.rebuild_map();
        Ok(())
    }

    /// Define the counter schema. Fails once the bag is frozen.
    pub fn set_counter_fields(&mut self, types: &[FieldType]) -> Result<(), BagError> {
        if self.frozen {
            return Err(BagError::SchemaFrozen);
        }
        if types.is_empty() {
            return Err(BagError::InvalidArgument("counter field list is empty"));
        }
        for &t in types {
            if !t.is_counter() {
                return Err(BagError::FieldClassMismatch {
                    field: t,
                    wanted: "counter",
                });
            }
        }
        let layout = intern_fields(types)
            .map_err(|_| BagError::InvalidArgument("counter field list is empty"))?;
        self.counter_layout = Some(layout);
        self.rebuild_map();
        Ok(())
    }

    pub fn key_layout(&self) -> Option<&Arc<FieldLayout>> {
        self.key_layout.as_ref()
    }

    pub fn counter_layout(&self) -> Option<&Arc<FieldLayout>> {
        self.counter_layout.as_ref()
    }

    /// Whether the schema can still change.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.map.as_ref().map_or(0, OrderedMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counter stored under `key`; all-zero when the key is absent.
    pub fn get(&self, key: &FieldValues) -> Result<FieldValues, BagError> {
        let (_, counter_layout) = self.require()?;
        let counter_layout = Arc::clone(counter_layout);
        self.check_key(key)?;
        let mut out = FieldValues::zeroed(&counter_layout);
        if let Some(map) = self.map.as_ref() {
            let probe = key.data.clone();
            if let Some(id) = map.find(&probe) {
                let klen = key.data.len();
                out.data.copy_from_slice(&map.key(id)[klen..]);
            }
        }
        Ok(out)
    }

    /// Insert or overwrite the counter under `key`.
    pub fn set(&mut self, key: &FieldValues, counter: &FieldValues) -> Result<(), BagError> {
        self.check_operands(key, counter)?;
        self.frozen = true;
        let klen = key.data.len();
        let mut entry = Vec::with_capacity(klen + counter.data.len());
        entry.extend_from_slice(&key.data);
        entry.extend_from_slice(&counter.data);
        let map = self.map.as_mut().expect("schema checked");
        let (id, inserted) = map.insert_or_get(entry);
        if !inserted {
            map.key_mut(id)[klen..].copy_from_slice(&counter.data);
        }
        Ok(())
    }

    /// Saturating per-field addition; inserts when the key is absent.
    pub fn add(&mut self, key: &FieldValues, counter: &FieldValues) -> Result<(), BagError> {
        self.check_operands(key, counter)?;
        self.frozen = true;
        let clayout = Arc::clone(self.counter_layout.as_ref().expect("schema checked"));
        self.add_entry(&clayout, key.as_bytes(), counter.as_bytes());
        Ok(())
    }

    /// Floor-zero per-field subtraction; a no-op when the key is absent.
    /// The entry remains even when every field reaches zero.
    pub fn subtract(&mut self, key: &FieldValues, counter: &FieldValues) -> Result<(), BagError> {
        self.check_operands(key, counter)?;
        self.frozen = true;
        let clayout = Arc::clone(self.counter_layout.as_ref().expect("schema checked"));
        self.subtract_entry(&clayout, key.as_bytes(), counter.as_bytes());
        Ok(())
    }

    /// Remove the entry under `key`; a no-op when absent.
    pub fn remove(&mut self, key: &FieldValues) -> Result<(), BagError> {
        self.require()?;
        self.check_key(key)?;
        self.frozen = true;
        if let Some(map) = self.map.as_mut() {
            let probe = key.data.clone();
            map.remove(&probe);
        }
        Ok(())
    }

    /// Saturating add of every entry of `other`. Both bags must hold the
    /// identical (pointer-equal) key and counter layout handles.
    pub fn merge(&mut self, other: &AggregateBag) -> Result<(), BagError> {
        let clayout = self.check_bag_operand(other)?;
        self.frozen = true;
        let klen = self.key_octets();
        if let Some(omap) = other.map.as_ref() {
            for entry in omap.iter() {
                self.add_entry(&clayout, &entry[..klen], &entry[klen..]);
            }
        }
        Ok(())
    }

    /// Floor-zero subtract of every entry of `other`.
    pub fn minus(&mut self, other: &AggregateBag) -> Result<(), BagError> {
        let clayout = self.check_bag_operand(other)?;
        self.frozen = true;
        let klen = self.key_octets();
        if let Some(omap) = other.map.as_ref() {
            for entry in omap.iter() {
                self.subtract_entry(&clayout, &entry[..klen], &entry[klen..]);
            }
        }
        Ok(())
    }

    /// Entries in ascending lexicographic order of key bytes.
    pub fn iter(&self) -> BagIter<'_> {
        BagIter {
            inner: self.map.as_ref().map(OrderedMap::iter),
            key_layout: self.key_layout.as_ref(),
            counter_layout: self.counter_layout.as_ref(),
            klen: self.key_octets(),
        }
    }

    // -- persistence --------------------------------------------------------

    /// Serialize to `sink`. Entries whose counter is all-zero are skipped.
    pub fn write_to<W: Write>(
        &self,
        sink: W,
        compression: CompressionMethod,
    ) -> Result<W, BagError> {
        let (key_layout, counter_layout) = self.require()?;
        let record_len = key_layout.octets() + counter_layout.octets();
        let schema = schema_entry(key_layout, counter_layout);
        let header = StreamHeader::aggregate_bag(record_len, compression, schema);
        let mut writer = RecordWriter::create(sink, header)?;
        let klen = self.key_octets();
        if let Some(map) = self.map.as_ref() {
            for entry in map.iter() {
                if entry[klen..].iter().all(|&b| b == 0) {
                    continue;
                }
                writer.write_record(entry)?;
            }
        }
        Ok(writer.finish()?)
    }

    /// Deserialize a bag from `src`. The resulting bag is frozen.
    ///
    /// Unlike the in-memory insert path, duplicate keys in a file are
    /// tolerated: the later entry overwrites the earlier one.
    pub fn read_from<R: Read>(src: R) -> Result<AggregateBag, BagError> {
        let mut reader = RecordReader::open(src)?;
        if reader.header().format != FileFormat::AggregateBag {
            return Err(BagError::HeaderMalformed(
                "not an aggregate-bag stream".into(),
            ));
        }
        let entry = reader
            .header()
            .entry(HENTRY_AGGBAG_ID)
            .ok_or_else(|| BagError::HeaderMalformed("missing schema header entry".into()))?;
        let (key_types, counter_types) = parse_schema_entry(&entry.data)?;

        let mut bag = AggregateBag::new();
        bag.set_key_fields(&key_types)?;
        bag.set_counter_fields(&counter_types)?;
        let record_len = {
            let (k, c) = bag.require()?;
            k.octets() + c.octets()
        };
        if reader.header().record_len != record_len {
            return Err(BagError::HeaderMalformed(format!(
                "record length {} does not match schema length {}",
                reader.header().record_len,
                record_len
            )));
        }
        bag.frozen = true;

        let klen = bag.key_octets();
        let mut buf = vec![0u8; record_len as usize];
        while reader.read_record(&mut buf)? {
            let map = bag.map.as_mut().expect("schema set above");
            let (id, inserted) = map.insert_or_get(buf.clone());
            if !inserted {
                map.key_mut(id)[klen..].copy_from_slice(&buf[klen..]);
            }
        }
        Ok(bag)
    }

    // -- internal -----------------------------------------------------------

    fn key_octets(&self) -> usize {
        self.key_layout.as_ref().map_or(0, |l| l.octets() as usize)
    }

    fn rebuild_map(&mut self) {
        if let (Some(k), Some(_)) = (&self.key_layout, &self.counter_layout) {
            let klen = k.octets() as usize;
            self.map = Some(OrderedMap::new(move |a: &Vec<u8>, b: &Vec<u8>| {
                a[..klen].cmp(&b[..klen])
            }));
        }
    }

    fn require(&self) -> Result<(&Arc<FieldLayout>, &Arc<FieldLayout>), BagError> {
        let k = self.key_layout.as_ref().ok_or(BagError::UndefinedKey)?;
        let c = self.counter_layout.as_ref().ok_or(BagError::UndefinedCounter)?;
        Ok((k, c))
    }

    fn check_key(&self, key: &FieldValues) -> Result<(), BagError> {
        let own = self.key_layout.as_ref().ok_or(BagError::UndefinedKey)?;
        if !Arc::ptr_eq(own, &key.layout) {
            return Err(BagError::FieldsDifferKey);
        }
        Ok(())
    }

    fn check_operands(&self, key: &FieldValues, counter: &FieldValues) -> Result<(), BagError> {
        let (own_key, own_counter) = self.require()?;
        if !Arc::ptr_eq(own_key, &key.layout) {
            return Err(BagError::FieldsDifferKey);
        }
        if !Arc::ptr_eq(own_counter, &counter.layout) {
            return Err(BagError::FieldsDifferCounter);
        }
        Ok(())
    }

    fn check_bag_operand(&self, other: &AggregateBag) -> Result<Arc<FieldLayout>, BagError> {
        let (own_key, own_counter) = self.require()?;
        let (other_key, other_counter) = other.require()?;
        if !Arc::ptr_eq(own_key, other_key) {
            return Err(BagError::FieldsDifferKey);
        }
        if !Arc::ptr_eq(own_counter, other_counter) {
            return Err(BagError::FieldsDifferCounter);
        }
        Ok(Arc::clone(own_counter))
    }

    fn add_entry(&mut self, clayout: &FieldLayout, key_bytes: &[u8], counter_bytes: &[u8]) {
        let klen = key_bytes.len();
        let mut entry = Vec::with_capacity(klen + counter_bytes.len());
        entry.extend_from_slice(key_bytes);
        entry.extend_from_slice(counter_bytes);
        let map = self.map.as_mut().expect("schema checked");
        let (id, inserted) = map.insert_or_get(entry);
        if inserted {
            return;
        }
        let stored = map.key_mut(id);
        for field in clayout.fields() {
            let off = klen + field.offset as usize;
            let dst = get_u64(stored, off);
            let src = get_u64(counter_bytes, field.offset as usize);
            put_u64(stored, off, dst.saturating_add(src));
        }
    }

    fn subtract_entry(&mut self, clayout: &FieldLayout, key_bytes: &[u8], counter_bytes: &[u8]) {
        let map = self.map.as_mut().expect("schema checked");
        let probe = key_bytes.to_vec();
        let Some(id) = map.find(&probe) else {
            return;
        };
        let klen = key_bytes.len();
        let stored = map.key_mut(id);
        for field in clayout.fields() {
            let off = klen + field.offset as usize;
            let dst = get_u64(stored, off);
            let src = get_u64(counter_bytes, field.offset as usize);
            put_u64(stored, off, dst.saturating_sub(src));
        }
    }
}

/// Iterator over `(key, counter)` views of a bag.
pub struct BagIter<'a> {
    inner: Option<crate::ordmap::Iter<'a, Vec<u8>>>,
    key_layout: Option<&'a Arc<FieldLayout>>,
    counter_layout: Option<&'a Arc<FieldLayout>>,
    klen: usize,
}

impl<'a> Iterator for BagIter<'a> {
    type Item = (FieldRef<'a>, FieldRef<'a>);

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.inner.as_mut()?.next()?;
        Some((
            FieldRef {
                layout: self.key_layout?,
                data: &entry[..self.klen],
            },
            FieldRef {
                layout: self.counter_layout?,
                data: &entry[self.klen..],
            },
        ))
    }
}

fn schema_entry(key_layout: &FieldLayout, counter_layout: &FieldLayout) -> Vec<u8> {
    let field_count = key_layout.field_count() + counter_layout.field_count();
    let mut data = Vec::with_capacity(8 + 2 * field_count);
    data.extend_from_slice(&AGGBAG_HEADER_VERSION.to_be_bytes());
    data.extend_from_slice(&(field_count as u16).to_be_bytes());
    data.extend_from_slice(&(key_layout.field_count() as u16).to_be_bytes());
    for f in key_layout.fields() {
        data.extend_from_slice(&f.ftype.id().to_be_bytes());
    }
    for f in counter_layout.fields() {
        data.extend_from_slice(&f.ftype.id().to_be_bytes());
    }
    data
}

fn parse_schema_entry(data: &[u8]) -> Result<(Vec<FieldType>, Vec<FieldType>), BagError> {
    if data.len() < 8 {
        return Err(BagError::HeaderMalformed("schema entry too short".into()));
    }
    let version = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    if version != AGGBAG_HEADER_VERSION {
        return Err(BagError::HeaderMalformed(format!(
            "unknown header version {version}"
        )));
    }
    let field_count = u16::from_be_bytes([data[4], data[5]]) as usize;
    let key_count = u16::from_be_bytes([data[6], data[7]]) as usize;
    if field_count < 2 {
        return Err(BagError::HeaderMalformed(
            "fewer than two fields in schema".into(),
        ));
    }
    if key_count == 0 || key_count >= field_count {
        return Err(BagError::HeaderMalformed("key count out of range".into()));
    }
    if data.len() != 8 + 2 * field_count {
        return Err(BagError::HeaderMalformed(
            "field array length mismatch".into(),
        ));
    }

    let mut types = Vec::with_capacity(field_count);
    for i in 0..field_count {
        let off = 8 + 2 * i;
        let id = u16::from_be_bytes([data[off], data[off + 1]]);
        let ftype = FieldType::from_id(id)
            .ok_or_else(|| BagError::HeaderMalformed(format!("unknown field type {id}")))?;
        types.push(ftype);
    }
    let (keys, counters) = types.split_at(key_count);
    if keys.iter().any(|t| t.is_counter()) {
        return Err(BagError::HeaderMalformed(
            "counter type in key field list".into(),
        ));
    }
    if counters.iter().any(|t| !t.is_counter()) {
        return Err(BagError::HeaderMalformed(
            "key type in counter field list".into(),
        ));
    }
    Ok((keys.to_vec(), counters.to_vec()))
}

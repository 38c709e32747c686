//! Field types and interned field layouts.
//!
//! A [`FieldLayout`] is the schema of one side of an aggregate bag entry: an
//! ordered, deduplicated set of [`FieldType`]s with a computed octet offset
//! and length per field. Layouts are hash-consed through the global
//! [`LayoutRegistry`], so two layouts naming the same field set are the same
//! `Arc` — `Arc::ptr_eq` is the schema-compatibility test everything else in
//! the crate relies on.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use thiserror::Error;

/// First type ID of the counter range. Everything below is a key field.
pub const COUNTER_BASE: u16 = 8192;

/// How a field's octets decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// Big-endian unsigned integer of the field's width.
    Unsigned,
    /// Signed 64-bit milliseconds since the Unix epoch.
    Time,
    /// 4-octet IPv4 address.
    Ipv4,
    /// 16-octet IPv6 address.
    Ipv6,
}

macro_rules! field_types {
    ($( $name:ident = $id:expr, $octets:expr, $kind:ident, $label:expr; )*) => {
        /// One semantic column of a flow record, identified by a 16-bit ID.
        ///
        /// IDs below [`COUNTER_BASE`] are key fields; IDs at or above it are
        /// counter fields (all 8 octets wide).
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u16)]
        pub enum FieldType {
            $( $name = $id, )*
        }

        impl FieldType {
            /// Every defined field type, ascending by ID.
            pub const ALL: &'static [FieldType] = &[ $( FieldType::$name, )* ];

            /// The 16-bit on-disk identifier.
            pub fn id(self) -> u16 {
                self as u16
            }

            /// Resolve an on-disk identifier.
            pub fn from_id(id: u16) -> Option<FieldType> {
                FieldType::ALL.iter().copied().find(|t| t.id() == id)
            }

            /// Fixed octet width of the field.
            pub fn octets(self) -> u16 {
                match self {
                    $( FieldType::$name => $octets, )*
                }
            }

            /// Decode rule for the field's octets.
            pub fn kind(self) -> ValueKind {
                match self {
                    $( FieldType::$name => ValueKind::$kind, )*
                }
            }

            fn label(self) -> &'static str {
                match self {
                    $( FieldType::$name => $label, )*
                }
            }
        }
    };
}

field_types! {
    SIpv4 = 0, 4, Ipv4, "sIPv4";
    DIpv4 = 1, 4, Ipv4, "dIPv4";
    SPort = 2, 2, Unsigned, "sPort";
    DPort = 3, 2, Unsigned, "dPort";
    Protocol = 4, 1, Unsigned, "protocol";
    Packets = 5, 4, Unsigned, "packets";
    Bytes = 6, 4, Unsigned, "bytes";
    Flags = 7, 1, Unsigned, "flags";
    StartTime = 8, 8, Time, "sTime";
    EndTime = 9, 8, Time, "eTime";
    AnyTime = 10, 8, Time, "anyTime";
    Sensor = 11, 2, Unsigned, "sensor";
    Input = 12, 2, Unsigned, "input";
    Output = 13, 2, Unsigned, "output";
    NhIpv4 = 14, 4, Ipv4, "nhIPv4";
    InitialFlags = 15, 1, Unsigned, "initialFlags";
    SessionFlags = 16, 1, Unsigned, "sessionFlags";
    Attributes = 17, 1, Unsigned, "attributes";
    Application = 18, 2, Unsigned, "application";
    Class = 19, 1, Unsigned, "class";
    Type = 20, 1, Unsigned, "type";
    IcmpType = 21, 1, Unsigned, "icmpType";
    IcmpCode = 22, 1, Unsigned, "icmpCode";
    SCountry = 23, 2, Unsigned, "sCountry";
    DCountry = 24, 2, Unsigned, "dCountry";
    SPrefixMap = 25, 4, Unsigned, "sPrefixMap";
    DPrefixMap = 26, 4, Unsigned, "dPrefixMap";
    SIpv6 = 27, 16, Ipv6, "sIPv6";
    DIpv6 = 28, 16, Ipv6, "dIPv6";
    NhIpv6 = 29, 16, Ipv6, "nhIPv6";
    Records = 8192, 8, Unsigned, "records";
    SumPackets = 8193, 8, Unsigned, "sum-packets";
    SumBytes = 8194, 8, Unsigned, "sum-bytes";
    SumDuration = 8195, 8, Unsigned, "sum-duration";
}

impl FieldType {
    /// Whether the field belongs to the counter range.
    pub fn is_counter(self) -> bool {
        self.id() >= COUNTER_BASE
    }

    /// Bit position in a layout's membership bitmap. Key IDs occupy the low
    /// 64 bits, counter IDs the high 64.
    fn bit(self) -> u32 {
        let id = self.id();
        if id < COUNTER_BASE {
            u32::from(id)
        } else {
            64 + u32::from(id - COUNTER_BASE)
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("field list is empty")]
    EmptyFieldList,
}

/// One field slot within a layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutField {
    pub ftype: FieldType,
    /// Octet offset of this field within the packed buffer.
    pub offset: u16,
    /// Octet width, equal to `ftype.octets()`.
    pub octets: u16,
}

/// Immutable, interned field schema.
///
/// Obtained from [`LayoutRegistry::intern`]; never constructed directly.
/// Identical field sets yield pointer-identical handles.
#[derive(Debug)]
pub struct FieldLayout {
    fields: Vec<LayoutField>,
    octets: u16,
    bitmap: u128,
}

impl FieldLayout {
    /// Fields in ascending type-ID order.
    pub fn fields(&self) -> &[LayoutField] {
        &self.fields
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Total packed octet length.
    pub fn octets(&self) -> u16 {
        self.octets
    }

    /// Locate a field within the layout.
    pub fn field(&self, ftype: FieldType) -> Option<&LayoutField> {
        if !self.contains(ftype) {
            return None;
        }
        self.fields.iter().find(|f| f.ftype == ftype)
    }

    pub fn contains(&self, ftype: FieldType) -> bool {
        self.bitmap & (1u128 << ftype.bit()) != 0
    }

    fn build(types: &BTreeSet<FieldType>) -> (u128, FieldLayout) {
        let mut bitmap = 0u128;
        let mut fields = Vec::with_capacity(types.len());
        let mut offset = 0u16;
        for &ftype in types {
            bitmap |= 1u128 << ftype.bit();
            fields.push(LayoutField {
                ftype,
                offset,
                octets: ftype.octets(),
            });
            offset += ftype.octets();
        }
        (
            bitmap,
            FieldLayout {
                fields,
                octets: offset,
                bitmap,
            },
        )
    }
}

/// Hash-consing registry of [`FieldLayout`]s.
///
/// Holds weak references only: a layout lives exactly as long as some bag or
/// caller holds its `Arc`, and a later `intern` of the same set after the
/// last drop simply builds a fresh one.
pub struct LayoutRegistry {
    map: Mutex<std::collections::BTreeMap<u128, Weak<FieldLayout>>>,
}

impl LayoutRegistry {
    fn new() -> Self {
        Self {
            map: Mutex::new(std::collections::BTreeMap::new()),
        }
    }

    /// The process-wide registry.
    pub fn global() -> &'static LayoutRegistry {
        static REGISTRY: OnceLock<LayoutRegistry> = OnceLock::new();
        REGISTRY.get_or_init(LayoutRegistry::new)
    }

    /// Intern a field set: deduplicate, sort ascending by type ID, and return
    /// the canonical handle for that set.
    pub fn intern(&self, types: &[FieldType]) -> Result<Arc<FieldLayout>, LayoutError> {
        if types.is_empty() {
            return Err(LayoutError::EmptyFieldList);
        }
        let set: BTreeSet<FieldType> = types.iter().copied().collect();
        let (bitmap, candidate) = FieldLayout::build(&set);

        let mut map = self.map.lock().expect("layout registry poisoned");
        if let Some(existing) = map.get(&bitmap).and_then(Weak::upgrade) {
            return Ok(existing);
        }
        map.retain(|_, weak| weak.strong_count() > 0);
        let layout = Arc::new(candidate);
        map.insert(bitmap, Arc::downgrade(&layout));
        Ok(layout)
    }
}

/// Intern `types` in the global registry.
pub fn intern_fields(types: &[FieldType]) -> Result<Arc<FieldLayout>, LayoutError> {
    LayoutRegistry::global().intern(types)
}

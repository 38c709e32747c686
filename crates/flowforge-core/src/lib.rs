//! # flowforge-core
//!
//! Storage and aggregation core for network flow records: an ordered
//! key-value index, typed aggregate bags with on-disk persistence, a bounded
//! cache of open hourly output streams, an end-time ordering heap, and the
//! multi-producer record generator that drives them.
//!
//! ## Quick start
//!
//! ```
//! use flowforge_core::bag::{AggregateBag, FieldValues};
//! use flowforge_core::layout::FieldType;
//! use std::net::Ipv4Addr;
//!
//! let mut bag = AggregateBag::new();
//! bag.set_key_fields(&[FieldType::DIpv4]).unwrap();
//! bag.set_counter_fields(&[FieldType::SumBytes]).unwrap();
//!
//! let mut key = FieldValues::zeroed(bag.key_layout().unwrap());
//! key.set_ipv4(FieldType::DIpv4, Ipv4Addr::new(10, 0, 0, 1)).unwrap();
//! let mut counter = FieldValues::zeroed(bag.counter_layout().unwrap());
//! counter.set_unsigned(FieldType::SumBytes, 1500).unwrap();
//!
//! bag.add(&key, &counter).unwrap();
//! let stored = bag.get(&key).unwrap();
//! assert_eq!(stored.get_unsigned(FieldType::SumBytes).unwrap(), 1500);
//! ```
//!
//! ## Architecture
//!
//! ```text
//! producers (one thread per event class)
//!     │  bounded queues, shared dispatch stream
//!     ▼
//! consumer ──► RecordHeap (optional end-time ordering)
//!     │
//!     ▼
//! StreamCache ──► hourly incremental files ──► publish by rename
//! ```
//!
//! [`ordmap::OrderedMap`] is the substrate: [`bag::AggregateBag`] keys its
//! packed entries there and [`cache::StreamCache`] uses it as its index.
//! [`layout`] interns field schemas so layout compatibility is pointer
//! equality. [`stream`] is the self-describing container every file uses.

pub mod bag;
pub mod cache;
pub mod flowrec;
pub mod heap;
pub mod layout;
pub mod ordmap;
pub mod recgen;
pub mod site;
pub mod stream;
pub mod timeutil;

pub use bag::{AggregateBag, BagError, FieldValues};
pub use cache::{CacheError, StreamCache, StreamKey, publish_incremental};
pub use flowrec::{ClassId, FLOW_RECORD_LEN, FlowRecord, FlowtypeId, SensorId};
pub use heap::RecordHeap;
pub use layout::{FieldLayout, FieldType, LayoutRegistry, intern_fields};
pub use ordmap::{Nearest, OrderedMap};
pub use recgen::{GenStats, GeneratorConfig, OutputMode, PipelineError, run_generator};
pub use site::{Site, SiteConfig};
pub use stream::{CompressionMethod, RecordReader, RecordWriter, StreamError, StreamHeader};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Metric index structures
//!
//! Turns names into ids and tag sets into series, and answers which series
//! match a tag predicate.
//!
//! # Architecture
//!
//! ```text
//! MetricIndexSegment           month → MetricIndexDatabase
//!   └── MetricIndexDatabase    series store, metric/tag inverted, forward
//!         └── MetricMetaDatabase (shared)
//!               ├── IndexKvStore ×3   namespace, metric, tag value
//!               ├── MetricSchemaStore fields, tag keys
//!               └── Sequence          persisted id counters
//! ```
//!
//! Every mutation is serialized through a [`crate::notify::NotifyWorker`];
//! reads go straight to the in-memory tables and family snapshots.

mod codec;
mod error;
mod expr;
mod forward;
mod grouping;
mod index_db;
mod inverted;
mod kv_store;
mod meta_db;
mod schema;
mod segment;
mod sequence;
mod trie;

pub use error::{IndexError, IndexResult};
pub use expr::{Matcher, TagFilter};
pub use forward::ForwardIndex;
pub use grouping::{
    GroupingContext, GroupingScanner, MemoryGroupingScanner, PersistedGroupingScanner,
    ShardExecuteContext,
};
pub use index_db::{IndexNotifier, MetricIndexDatabase, SeriesNotifier};
pub use inverted::InvertedIndex;
pub use kv_store::IndexKvStore;
pub use meta_db::{
    normalize_namespace, Callback, MetaNotifier, MetricMetaDatabase, DEFAULT_NAMESPACE,
    MAX_NAMESPACE_LEN,
};
pub use schema::{FieldMeta, FieldType, MetricSchema, MetricSchemaStore, TagKeyMeta, MAX_FIELDS, MAX_TAG_KEYS};
pub use segment::MetricIndexSegment;
pub use sequence::{Sequence, SEQUENCE_FILE_SIZE};
pub use trie::{TrieBucket, MAX_KEY_LEN};

use crate::kv::CompressionType;
use std::time::Duration;

/// Runtime settings shared by the meta and index databases
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Notify worker wake-up interval
    pub worker_tick: Duration,
    /// Decoded persisted buckets cached per key-value store
    pub bucket_cache_capacity: u64,
    /// Persisted schemas cached by the schema store
    pub schema_cache_capacity: u64,
    /// Per-metric series sequences cached per index database
    pub sequence_cache_capacity: u64,
    /// Payload compression of family tables
    pub compression: CompressionType,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            worker_tick: Duration::from_millis(100),
            bucket_cache_capacity: 1024,
            schema_cache_capacity: 1024,
            sequence_cache_capacity: 100_000,
            compression: CompressionType::default(),
        }
    }
}

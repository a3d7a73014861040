//! # tsindex
//!
//! Metric indexing core for a time-series database: assigns stable ids to
//! namespaces, metrics, fields, tag keys, tag values and series, and answers
//! which series match a tag predicate.
//!
//! ## Features
//!
//! - **Persistent ids**: Sequence counters and name tables survive restarts
//! - **Serialized writes**: One notify worker per database, reads never block
//! - **Inverted and forward indexes**: Roaring bitmaps of series per metric and tag value
//! - **Monthly partitioning**: Series indexes are split by calendar month
//!
//! ## Modules
//!
//! - [`kv`]: Versioned key-value families with merge policies
//! - [`index`]: Meta database, index database and month segments
//! - [`notify`]: Background worker that serializes mutations
//! - [`config`]: TOML configuration with environment overrides
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tsindex::index::{MetricIndexSegment, MetricMetaDatabase, IndexConfig};
//! use tsindex::types::TimeRange;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let meta = Arc::new(MetricMetaDatabase::open("./data/meta")?);
//!     let segment = MetricIndexSegment::open("./data/series", Arc::clone(&meta), IndexConfig::default())?;
//!
//!     let tags = vec![("host".to_string(), "web-1".to_string())];
//!     let now = chrono::Utc::now().timestamp_millis();
//!     let (metric_id, series_id) = segment.gen_series_id(now, "", "cpu", tags, 42).await?;
//!
//!     let series = segment.get_series_ids_for_metric(metric_id, &TimeRange::last_days(1))?;
//!     assert!(series.contains(series_id));
//!
//!     segment.close().await?;
//!     meta.close().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod index;
pub mod kv;
pub mod notify;
pub mod types;

// Re-export top-level types for convenience
pub use config::{Config, ConfigError, IndexSection, LoggingConfig};

pub use index::{
    FieldType, GroupingContext, IndexConfig, IndexError, IndexResult, MetricIndexDatabase,
    MetricIndexSegment, MetricMetaDatabase, ShardExecuteContext, TagFilter,
};

pub use kv::{KvError, KvResult, KvStore};

pub use notify::{NotifySender, NotifyWorker};

pub use types::TimeRange;

//! Metric Index Database
//!
//! Per time segment: allocates series ids and keeps the indexes used to find
//! and group series.
//!
//! # Series resolution
//!
//! ```text
//! notify(Series) ──► meta worker: (namespace, metric) → metric id
//!                        │ callback
//!                        ▼
//!                    index worker: tag hash → series id
//!                        │ new series: metric inverted += series
//!                        ▼
//!                    meta worker: tags → (tag key id, tag value id)*
//!                        │ per pair, under one lock:
//!                        │   tag inverted[value] += series
//!                        │   forward[key][series] = value
//!                        ▼
//!                    series callback (metric id, series id)
//! ```
//!
//! A new series id is the cached per-metric sequence + 1, or
//! `max(series of metric) + 1`, or 0 for the first series of a metric.

use crate::index::error::{IndexError, IndexResult};
use crate::index::expr::TagFilter;
use crate::index::forward::ForwardIndex;
use crate::index::grouping::{GroupingContext, ShardExecuteContext};
use crate::index::inverted::InvertedIndex;
use crate::index::kv_store::IndexKvStore;
use crate::index::meta_db::{Callback, MetaNotifier, MetricMetaDatabase};
use crate::index::IndexConfig;
use crate::kv::{KvStore, MergePolicy};
use crate::notify::NotifyWorker;
use moka::sync::Cache;
use parking_lot::Mutex;
use roaring::RoaringBitmap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Request to resolve the series of one data point
pub struct SeriesNotifier {
    pub namespace: String,
    pub metric_name: String,
    pub tags: Vec<(String, String)>,
    /// Precomputed hash of the full tag set
    pub tag_hash: u64,
    /// Receives `(metric_id, series_id)`
    pub callback: Callback<(u32, u32)>,
}

/// Mutation request accepted by [`MetricIndexDatabase::notify`]
pub enum IndexNotifier {
    Series(SeriesNotifier),
    Flush { callback: Callback<()> },
}

enum IndexEvent {
    Series {
        metric_id: u32,
        tags: Vec<(String, String)>,
        tag_hash: u64,
        callback: Callback<(u32, u32)>,
    },
    Flush(Callback<()>),
}

impl IndexEvent {
    fn reject(self, err: IndexError) {
        match self {
            IndexEvent::Series { callback, .. } => callback(Err(err)),
            IndexEvent::Flush(callback) => callback(Err(err)),
        }
    }
}

struct IndexCore {
    name: String,
    meta: Arc<MetricMetaDatabase>,
    metric_inverted: InvertedIndex,
    tag_inverted: InvertedIndex,
    forward: ForwardIndex,
    series: IndexKvStore,
    sequence_cache: Cache<u32, u32>,
    /// Shared by the tag inverted and forward writes of one pair
    tag_lock: Mutex<()>,
    flushing: AtomicBool,
    inflight: Mutex<Option<JoinHandle<()>>>,
}

impl IndexCore {
    fn handle(self: &Arc<Self>, event: IndexEvent) {
        match event {
            IndexEvent::Series {
                metric_id,
                tags,
                tag_hash,
                callback,
            } => self.resolve_series(metric_id, tags, tag_hash, callback),
            IndexEvent::Flush(callback) => self.start_flush(callback),
        }
    }

    fn resolve_series(
        self: &Arc<Self>,
        metric_id: u32,
        tags: Vec<(String, String)>,
        tag_hash: u64,
        callback: Callback<(u32, u32)>,
    ) {
        let key = tag_hash.to_le_bytes();
        let (series_id, is_new) =
            match self
                .series
                .get_or_create_value(metric_id, &key, || self.next_series_id(metric_id))
            {
                Ok(resolved) => resolved,
                Err(e) => return callback(Err(e)),
            };

        if !is_new {
            return callback(Ok((metric_id, series_id)));
        }

        self.metric_inverted.put(metric_id, series_id);
        if tags.is_empty() {
            return callback(Ok((metric_id, series_id)));
        }

        let core = Arc::clone(self);
        self.meta.notify(MetaNotifier::Tag {
            metric_id,
            tags,
            on_tag: Box::new(move |tag_key_id, tag_value_id| {
                core.put_tag(tag_key_id, tag_value_id, series_id)
            }),
            on_complete: Some(Box::new(move |result| {
                callback(result.map(|_| (metric_id, series_id)))
            })),
        });
    }

    fn next_series_id(&self, metric_id: u32) -> IndexResult<u32> {
        let next = match self.sequence_cache.get(&metric_id) {
            Some(seq) => seq + 1,
            None => match self.metric_inverted.get(metric_id)?.max() {
                Some(max) => max + 1,
                None => 0,
            },
        };
        self.sequence_cache.insert(metric_id, next);
        Ok(next)
    }

    fn put_tag(&self, tag_key_id: u32, tag_value_id: u32, series_id: u32) {
        let _guard = self.tag_lock.lock();
        self.tag_inverted.put(tag_value_id, series_id);
        self.forward.put(tag_key_id, series_id, tag_value_id);
    }

    fn start_flush(self: &Arc<Self>, callback: Callback<()>) {
        if self.flushing.swap(true, Ordering::AcqRel) {
            callback(Ok(()));
            return;
        }

        self.prepare_flush();
        let core = Arc::clone(self);
        let handle = tokio::task::spawn_blocking(move || {
            let result = core.flush();
            core.flushing.store(false, Ordering::Release);
            if let Err(e) = &result {
                tracing::error!("Flush of index database {} failed: {}", core.name, e);
            }
            callback(result);
        });
        *self.inflight.lock() = Some(handle);
    }

    fn prepare_flush(&self) {
        self.metric_inverted.prepare_flush();
        self.forward.prepare_flush();
        self.tag_inverted.prepare_flush();
        self.series.prepare_flush();
    }

    fn flush(&self) -> IndexResult<()> {
        tracing::debug!("Flushing index database {}", self.name);
        self.metric_inverted.flush()?;
        self.forward.flush()?;
        self.tag_inverted.flush()?;
        self.series.flush()?;
        tracing::debug!("Flushed index database {}", self.name);
        Ok(())
    }
}

/// Series allocation plus inverted and forward indexes for one time segment
pub struct MetricIndexDatabase {
    core: Arc<IndexCore>,
    worker: NotifyWorker<IndexEvent>,
}

impl MetricIndexDatabase {
    /// Open with default configuration. Must be called within a Tokio runtime.
    pub fn open(dir: impl AsRef<Path>, meta: Arc<MetricMetaDatabase>) -> IndexResult<Self> {
        Self::open_with_config(dir, meta, &IndexConfig::default())
    }

    pub fn open_with_config(
        dir: impl AsRef<Path>,
        meta: Arc<MetricMetaDatabase>,
        config: &IndexConfig,
    ) -> IndexResult<Self> {
        let dir = dir.as_ref();
        let kv = KvStore::open(dir, config.compression)?;
        let name = dir.display().to_string();

        let core = Arc::new(IndexCore {
            metric_inverted: InvertedIndex::new(
                "metric",
                kv.family("metric_inverted", MergePolicy::Bitmap)?,
            ),
            tag_inverted: InvertedIndex::new("tag", kv.family("tag_inverted", MergePolicy::Bitmap)?),
            forward: ForwardIndex::new(kv.family("forward", MergePolicy::Forward)?),
            series: IndexKvStore::new(
                "series",
                kv.family("series", MergePolicy::Trie)?,
                config.bucket_cache_capacity,
            ),
            sequence_cache: Cache::new(config.sequence_cache_capacity),
            tag_lock: Mutex::new(()),
            flushing: AtomicBool::new(false),
            inflight: Mutex::new(None),
            name: name.clone(),
            meta,
        });

        let handler_core = Arc::clone(&core);
        let worker = NotifyWorker::spawn(
            format!("index:{}", name),
            config.worker_tick,
            move |event: IndexEvent| handler_core.handle(event),
        );

        tracing::debug!("Opened index database at {}", name);
        Ok(Self { core, worker })
    }

    /// Queue a mutation. Callbacks run on worker tasks.
    pub fn notify(&self, notifier: IndexNotifier) {
        match notifier {
            IndexNotifier::Series(series) => self.notify_series(series),
            IndexNotifier::Flush { callback } => {
                if let Err(event) = self.worker.notify(IndexEvent::Flush(callback)) {
                    event.reject(self.closed_error());
                }
            }
        }
    }

    fn notify_series(&self, notifier: SeriesNotifier) {
        let SeriesNotifier {
            namespace,
            metric_name,
            tags,
            tag_hash,
            callback,
        } = notifier;
        let sender = self.worker.sender();
        let name = self.core.name.clone();

        self.core.meta.notify(MetaNotifier::Metric {
            namespace,
            metric_name,
            callback: Box::new(move |result| match result {
                Ok(metric_id) => {
                    let event = IndexEvent::Series {
                        metric_id,
                        tags,
                        tag_hash,
                        callback,
                    };
                    if let Err(event) = sender.notify(event) {
                        event.reject(IndexError::WorkerClosed(name));
                    }
                }
                Err(e) => callback(Err(e)),
            }),
        });
    }

    /// Resolve a series and wait; returns `(metric_id, series_id)`
    pub async fn gen_series_id(
        &self,
        namespace: &str,
        metric_name: &str,
        tags: Vec<(String, String)>,
        tag_hash: u64,
    ) -> IndexResult<(u32, u32)> {
        let (tx, rx) = oneshot::channel();
        self.notify(IndexNotifier::Series(SeriesNotifier {
            namespace: namespace.to_string(),
            metric_name: metric_name.to_string(),
            tags,
            tag_hash,
            callback: Box::new(move |result| {
                let _ = tx.send(result);
            }),
        }));
        self.rendezvous(rx).await
    }

    /// Request a flush and wait for it
    pub async fn flush(&self) -> IndexResult<()> {
        let (tx, rx) = oneshot::channel();
        self.notify(IndexNotifier::Flush {
            callback: Box::new(move |result| {
                let _ = tx.send(result);
            }),
        });
        self.rendezvous(rx).await
    }

    /// Drain the worker and persist everything
    pub async fn close(&self) -> IndexResult<()> {
        self.worker.close().await;

        let inflight = self.core.inflight.lock().take();
        if let Some(handle) = inflight {
            if let Err(e) = handle.await {
                tracing::error!("Flush task of {} failed: {}", self.core.name, e);
            }
        }

        // tag writes queued on the meta worker land before the final flush
        match self.core.meta.flush().await {
            Ok(()) | Err(IndexError::WorkerClosed(_)) => {}
            Err(e) => return Err(e),
        }

        let core = Arc::clone(&self.core);
        tokio::task::spawn_blocking(move || {
            core.flush()?;
            core.prepare_flush();
            core.flush()
        })
        .await
        .map_err(|e| IndexError::Flush(e.to_string()))??;

        tracing::debug!("Closed index database {}", self.core.name);
        Ok(())
    }

    async fn rendezvous<T>(&self, rx: oneshot::Receiver<IndexResult<T>>) -> IndexResult<T> {
        rx.await.map_err(|_| {
            IndexError::WorkerClosed(format!("{} dropped the request", self.core.name))
        })?
    }

    fn closed_error(&self) -> IndexError {
        IndexError::WorkerClosed(self.core.name.clone())
    }

    pub fn get_series_ids_for_metric(&self, metric_id: u32) -> IndexResult<RoaringBitmap> {
        self.core.metric_inverted.get(metric_id)
    }

    /// Every series carrying the tag key, whatever its value
    pub fn get_series_ids_for_tag(&self, tag_key_id: u32) -> IndexResult<RoaringBitmap> {
        self.core.forward.get_series_ids(tag_key_id)
    }

    /// Series carrying any of the given values of a tag key
    pub fn get_series_ids_by_tag_value_ids(
        &self,
        tag_key_id: u32,
        tag_value_ids: &RoaringBitmap,
    ) -> IndexResult<RoaringBitmap> {
        let series = self.core.tag_inverted.get_many(tag_value_ids)?;
        tracing::trace!(
            "Tag key {} matched {} series in {}",
            tag_key_id,
            series.len(),
            self.core.name
        );
        Ok(series)
    }

    /// Series whose value of `tag_key_id` matches `filter`
    pub fn get_series_ids_by_expr(&self, tag_key_id: u32, filter: &TagFilter) -> IndexResult<RoaringBitmap> {
        let tag_value_ids = self.core.meta.find_tag_value_ids_by_expr(tag_key_id, filter)?;
        if tag_value_ids.is_empty() {
            return Ok(RoaringBitmap::new());
        }
        self.get_series_ids_by_tag_value_ids(tag_key_id, &tag_value_ids)
    }

    /// Scanners for every group-by tag key of `ctx`.
    ///
    /// `ctx.series_ids` is narrowed to the series carrying all group-by keys,
    /// also when that leaves nothing and [`IndexError::NotFound`] is returned.
    pub fn get_grouping_context(&self, ctx: &mut ShardExecuteContext) -> IndexResult<GroupingContext> {
        let mut grouping = GroupingContext::new(ctx.group_by_tag_key_ids.clone());
        let mut filter = ctx.series_ids.clone();

        for &tag_key_id in &ctx.group_by_tag_key_ids {
            let scanners = self.core.forward.scanners(tag_key_id)?;
            let mut covered = RoaringBitmap::new();
            for scanner in &scanners {
                covered |= scanner.series_ids();
            }
            filter &= covered;
            grouping.add_scanners(tag_key_id, scanners);

            if filter.is_empty() {
                ctx.series_ids = filter;
                return Err(IndexError::NotFound(format!(
                    "series ids for group-by tag key {}",
                    tag_key_id
                )));
            }
        }

        ctx.series_ids = filter;
        Ok(grouping)
    }

    /// Forget cached per-metric series sequences; the next allocation
    /// recomputes them from the metric inverted index
    pub fn purge_sequence_cache(&self) {
        self.core.sequence_cache.invalidate_all();
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::KvFamily;
    use crate::types::TimeRange;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    fn published_versions(dir: &Path, family: &str) -> usize {
        KvFamily::open(dir.join(family), family, MergePolicy::Trie, IndexConfig::default().compression)
            .unwrap()
            .version_count()
    }

    fn test_config() -> IndexConfig {
        IndexConfig {
            worker_tick: Duration::from_millis(5),
            ..IndexConfig::default()
        }
    }

    fn tags(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    async fn create_test_db() -> (TempDir, Arc<MetricMetaDatabase>, MetricIndexDatabase) {
        let dir = tempdir().unwrap();
        let config = test_config();
        let meta = Arc::new(MetricMetaDatabase::open_with_config(dir.path().join("meta"), &config).unwrap());
        let db = MetricIndexDatabase::open_with_config(dir.path().join("index"), Arc::clone(&meta), &config)
            .unwrap();
        (dir, meta, db)
    }

    #[tokio::test]
    async fn test_series_ids_survive_flush() {
        let (_dir, meta, db) = create_test_db().await;

        let (metric_id, first) = db
            .gen_series_id("system", "cpu", tags(&[("key1", "value1"), ("key2", "value2")]), 120)
            .await
            .unwrap();
        assert_eq!(first, 0);
        let (same_metric, second) = db
            .gen_series_id("system", "cpu", tags(&[("key3", "value1"), ("key4", "value2")]), 100)
            .await
            .unwrap();
        assert_eq!(same_metric, metric_id);
        assert_eq!(second, 1);

        let series = db.get_series_ids_for_metric(metric_id).unwrap();
        assert_eq!(series.iter().collect::<Vec<_>>(), vec![0, 1]);

        db.flush().await.unwrap();
        db.purge_sequence_cache();

        let series = db.get_series_ids_for_metric(metric_id).unwrap();
        assert_eq!(series.iter().collect::<Vec<_>>(), vec![0, 1]);

        // allocation continues from the persisted maximum
        let (_, third) = db.gen_series_id("system", "cpu", Vec::new(), 7).await.unwrap();
        assert_eq!(third, 2);

        db.close().await.unwrap();
        meta.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_same_tag_hash_same_series() {
        let (_dir, meta, db) = create_test_db().await;

        let a = db.gen_series_id("system", "cpu", tags(&[("host", "a")]), 1).await.unwrap();
        let b = db.gen_series_id("system", "cpu", tags(&[("host", "a")]), 1).await.unwrap();
        assert_eq!(a, b);

        // series ids are per metric
        let (mem_id, mem_series) = db.gen_series_id("system", "mem", tags(&[("host", "a")]), 1).await.unwrap();
        assert_ne!(mem_id, a.0);
        assert_eq!(mem_series, 0);

        db.close().await.unwrap();
        meta.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_tag_lookups() {
        let (_dir, meta, db) = create_test_db().await;

        let (metric_id, s0) = db
            .gen_series_id("system", "cpu", tags(&[("host", "web-1"), ("zone", "eu")]), 10)
            .await
            .unwrap();
        let (_, s1) = db
            .gen_series_id("system", "cpu", tags(&[("host", "web-2"), ("zone", "us")]), 11)
            .await
            .unwrap();
        let (_, s2) = db
            .gen_series_id("system", "cpu", tags(&[("host", "db-1")]), 12)
            .await
            .unwrap();

        let host = meta.get_tag_key_id(metric_id, "host").unwrap().unwrap();
        let zone = meta.get_tag_key_id(metric_id, "zone").unwrap().unwrap();

        let with_zone = db.get_series_ids_for_tag(zone).unwrap();
        assert_eq!(with_zone.iter().collect::<Vec<_>>(), vec![s0, s1]);
        assert_eq!(db.get_series_ids_for_tag(host).unwrap().len(), 3);

        let web = db
            .get_series_ids_by_expr(host, &TagFilter::Like("web-*".into()))
            .unwrap();
        assert_eq!(web.iter().collect::<Vec<_>>(), vec![s0, s1]);

        let eu = db.get_series_ids_by_expr(zone, &TagFilter::Equal("eu".into())).unwrap();
        assert_eq!(eu.iter().collect::<Vec<_>>(), vec![s0]);

        let db_ids = meta
            .find_tag_value_ids_by_expr(host, &TagFilter::Equal("db-1".into()))
            .unwrap();
        let by_values = db.get_series_ids_by_tag_value_ids(host, &db_ids).unwrap();
        assert_eq!(by_values.iter().collect::<Vec<_>>(), vec![s2]);

        assert!(db
            .get_series_ids_by_expr(host, &TagFilter::Equal("nope".into()))
            .unwrap()
            .is_empty());

        // same answers from persisted data
        db.flush().await.unwrap();
        assert_eq!(db.get_series_ids_for_tag(zone).unwrap(), with_zone);
        assert_eq!(
            db.get_series_ids_by_expr(host, &TagFilter::Like("web-*".into())).unwrap(),
            web
        );

        db.close().await.unwrap();
        meta.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_grouping_context() {
        let (_dir, meta, db) = create_test_db().await;

        let (metric_id, s0) = db
            .gen_series_id("system", "cpu", tags(&[("host", "a"), ("zone", "eu")]), 1)
            .await
            .unwrap();
        let (_, s1) = db
            .gen_series_id("system", "cpu", tags(&[("host", "b"), ("zone", "eu")]), 2)
            .await
            .unwrap();
        db.flush().await.unwrap();
        let (_, s2) = db
            .gen_series_id("system", "cpu", tags(&[("host", "c")]), 3)
            .await
            .unwrap();

        let host = meta.get_tag_key_id(metric_id, "host").unwrap().unwrap();
        let zone = meta.get_tag_key_id(metric_id, "zone").unwrap().unwrap();
        let all: RoaringBitmap = [s0, s1, s2].into_iter().collect();
        let range = TimeRange::new(0, 1);

        let mut ctx = ShardExecuteContext::new(vec![host], range, all.clone());
        let grouping = db.get_grouping_context(&mut ctx).unwrap();
        assert_eq!(ctx.series_ids, all);
        // persisted version plus memory
        assert_eq!(grouping.scanners(host).len(), 2);
        assert_eq!(grouping.group_series(&ctx.series_ids).len(), 3);

        let mut ctx = ShardExecuteContext::new(vec![host, zone], range, all.clone());
        let grouping = db.get_grouping_context(&mut ctx).unwrap();
        assert_eq!(ctx.series_ids.iter().collect::<Vec<_>>(), vec![s0, s1]);
        let groups = grouping.group_series(&ctx.series_ids);
        assert_eq!(groups.len(), 2);

        // only s2 requested, but s2 has no zone
        let only_s2: RoaringBitmap = [s2].into_iter().collect();
        let mut ctx = ShardExecuteContext::new(vec![host, zone], range, only_s2);
        let result = db.get_grouping_context(&mut ctx);
        assert!(matches!(result, Err(IndexError::NotFound(_))));
        assert!(ctx.series_ids.is_empty());

        db.close().await.unwrap();
        meta.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_flush_requests_all_succeed() {
        let (dir, meta, db) = create_test_db().await;
        let (metric_id, _) = db.gen_series_id("system", "cpu", Vec::new(), 1).await.unwrap();
        let index_dir = dir.path().join("index");

        let (first, second) = tokio::join!(db.flush(), db.flush());
        first.unwrap();
        second.unwrap();
        // one generation, written once
        assert_eq!(published_versions(&index_dir, "series"), 1);
        assert_eq!(published_versions(&index_dir, "metric_inverted"), 1);

        db.flush().await.unwrap();
        assert_eq!(published_versions(&index_dir, "series"), 1);

        assert_eq!(db.get_series_ids_for_metric(metric_id).unwrap().len(), 1);
        db.close().await.unwrap();
        meta.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_persists_for_reopen() {
        let dir = tempdir().unwrap();
        let config = test_config();
        let metric_id = {
            let meta = Arc::new(MetricMetaDatabase::open_with_config(dir.path().join("meta"), &config).unwrap());
            let db = MetricIndexDatabase::open_with_config(dir.path().join("index"), Arc::clone(&meta), &config)
                .unwrap();
            let (metric_id, _) = db
                .gen_series_id("system", "cpu", tags(&[("host", "a")]), 42)
                .await
                .unwrap();
            db.close().await.unwrap();
            meta.close().await.unwrap();
            metric_id
        };

        let meta = Arc::new(MetricMetaDatabase::open_with_config(dir.path().join("meta"), &config).unwrap());
        let db = MetricIndexDatabase::open_with_config(dir.path().join("index"), Arc::clone(&meta), &config)
            .unwrap();
        assert_eq!(
            db.gen_series_id("system", "cpu", tags(&[("host", "a")]), 42).await.unwrap(),
            (metric_id, 0)
        );
        let host = meta.get_tag_key_id(metric_id, "host").unwrap().unwrap();
        assert_eq!(db.get_series_ids_for_tag(host).unwrap().len(), 1);
        assert_eq!(
            db.gen_series_id("system", "cpu", Vec::new(), 43).await.unwrap(),
            (metric_id, 1)
        );

        db.close().await.unwrap();
        meta.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_notify_after_close() {
        let (_dir, meta, db) = create_test_db().await;
        db.close().await.unwrap();

        let err = db.gen_series_id("system", "cpu", Vec::new(), 1).await.unwrap_err();
        assert!(matches!(err, IndexError::WorkerClosed(_)));
        meta.close().await.unwrap();
    }
}

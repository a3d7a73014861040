//! Metric Meta Database
//!
//! Resolves namespaces, metric names, fields, tag keys and tag values to ids.
//!
//! # Architecture
//!
//! ```text
//! producers ──MetaNotifier──► [NotifyWorker] ──► MetaCore (single mutation path)
//!                                                  ├── namespace store  bucket = first byte of namespace
//!                                                  ├── metric store     bucket = namespace id
//!                                                  ├── tag-value store  bucket = tag key id
//!                                                  ├── schema store     metric id → fields, tag keys
//!                                                  └── sequence         id allocation
//! readers ───────────────────────────────────────► MetaCore (direct, lock-free of the worker)
//! ```
//!
//! Every mutation goes through the worker, so ids are allocated by exactly one
//! task. Reads go straight to the stores.

use crate::index::error::{IndexError, IndexResult};
use crate::index::expr::TagFilter;
use crate::index::kv_store::IndexKvStore;
use crate::index::schema::{FieldType, MetricSchema, MetricSchemaStore};
use crate::index::sequence::Sequence;
use crate::index::IndexConfig;
use crate::kv::{KvStore, MergePolicy};
use crate::notify::NotifyWorker;
use parking_lot::Mutex;
use roaring::RoaringBitmap;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Namespace used when a request carries none
pub const DEFAULT_NAMESPACE: &str = "default-ns";
/// Longest accepted namespace, in bytes
pub const MAX_NAMESPACE_LEN: usize = 128;

const SEQUENCE_FILE: &str = "sequence";

/// Completion callback of a notifier
pub type Callback<T> = Box<dyn FnOnce(IndexResult<T>) + Send>;

/// Mutation request handled by the meta worker
pub enum MetaNotifier {
    /// Resolve `(namespace, metric)` to a metric id
    Metric {
        namespace: String,
        metric_name: String,
        callback: Callback<u32>,
    },
    /// Resolve a field of a metric to a field id
    Field {
        namespace: String,
        metric_name: String,
        field_name: String,
        field_type: FieldType,
        callback: Callback<u8>,
    },
    /// Resolve every `(key, value)` of a metric. `on_tag` receives
    /// `(tag_key_id, tag_value_id)` per resolved pair; failed pairs are skipped.
    Tag {
        metric_id: u32,
        tags: Vec<(String, String)>,
        on_tag: Box<dyn FnMut(u32, u32) + Send>,
        on_complete: Option<Callback<()>>,
    },
    /// Persist everything resolved so far
    Flush { callback: Callback<()> },
}

impl MetaNotifier {
    /// Complete the notifier's callbacks with `err` without handling it
    pub fn reject(self, err: IndexError) {
        match self {
            MetaNotifier::Metric { callback, .. } => callback(Err(err)),
            MetaNotifier::Field { callback, .. } => callback(Err(err)),
            MetaNotifier::Tag { on_complete, .. } => {
                if let Some(done) = on_complete {
                    done(Err(err));
                }
            }
            MetaNotifier::Flush { callback } => callback(Err(err)),
        }
    }
}

/// Normalize a namespace, mapping empty to [`DEFAULT_NAMESPACE`]
pub fn normalize_namespace(namespace: &str) -> IndexResult<&str> {
    if namespace.is_empty() {
        return Ok(DEFAULT_NAMESPACE);
    }
    if namespace.len() > MAX_NAMESPACE_LEN {
        return Err(IndexError::NamespaceTooLong {
            len: namespace.len(),
            limit: MAX_NAMESPACE_LEN,
        });
    }
    Ok(namespace)
}

fn namespace_bucket(namespace: &str) -> u32 {
    namespace.as_bytes().first().copied().unwrap_or(0) as u32
}

struct MetaCore {
    name: String,
    sequence: Sequence,
    namespaces: IndexKvStore,
    metrics: IndexKvStore,
    tag_values: IndexKvStore,
    schemas: MetricSchemaStore,
    flushing: AtomicBool,
    inflight: Mutex<Option<JoinHandle<()>>>,
}

impl MetaCore {
    fn handle(self: &Arc<Self>, event: MetaNotifier) {
        match event {
            MetaNotifier::Metric {
                namespace,
                metric_name,
                callback,
            } => callback(self.gen_metric_id(&namespace, &metric_name)),
            MetaNotifier::Field {
                namespace,
                metric_name,
                field_name,
                field_type,
                callback,
            } => {
                let result = self
                    .gen_metric_id(&namespace, &metric_name)
                    .and_then(|metric_id| self.schemas.gen_field_id(metric_id, &field_name, field_type));
                callback(result)
            }
            MetaNotifier::Tag {
                metric_id,
                tags,
                mut on_tag,
                on_complete,
            } => {
                self.gen_tag_ids(metric_id, &tags, &mut *on_tag);
                if let Some(done) = on_complete {
                    done(Ok(()));
                }
            }
            MetaNotifier::Flush { callback } => self.start_flush(callback),
        }
    }

    fn gen_metric_id(&self, namespace: &str, metric_name: &str) -> IndexResult<u32> {
        let namespace = normalize_namespace(namespace)?;
        let (namespace_id, _) = self.namespaces.get_or_create_value(
            namespace_bucket(namespace),
            namespace.as_bytes(),
            || Ok(self.sequence.next_namespace_seq()),
        )?;
        let (metric_id, is_new) = self
            .metrics
            .get_or_create_value(namespace_id, metric_name.as_bytes(), || {
                Ok(self.sequence.next_metric_seq())
            })?;
        if is_new {
            tracing::trace!("New metric {}/{} with id {}", namespace, metric_name, metric_id);
        }
        Ok(metric_id)
    }

    fn gen_tag_ids(&self, metric_id: u32, tags: &[(String, String)], on_tag: &mut dyn FnMut(u32, u32)) {
        for (key, value) in tags {
            let resolved = self
                .schemas
                .gen_tag_key_id(metric_id, key, || Ok(self.sequence.next_tag_key_seq()))
                .and_then(|tag_key_id| {
                    self.tag_values
                        .get_or_create_value(tag_key_id, value.as_bytes(), || {
                            Ok(self.sequence.next_tag_value_seq())
                        })
                        .map(|(tag_value_id, _)| (tag_key_id, tag_value_id))
                });

            match resolved {
                Ok((tag_key_id, tag_value_id)) => on_tag(tag_key_id, tag_value_id),
                Err(e) => tracing::warn!(
                    "Skipping tag {} of metric {} in {}: {}",
                    key,
                    metric_id,
                    self.name,
                    e
                ),
            }
        }
    }

    /// Swap inside the worker, write on a blocking task. A request arriving
    /// while a flush is running succeeds immediately.
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
                tracing::error!("Flush of {} failed: {}", core.name, e);
            }
            callback(result);
        });
        *self.inflight.lock() = Some(handle);
    }

    fn prepare_flush(&self) {
        self.namespaces.prepare_flush();
        self.metrics.prepare_flush();
        self.tag_values.prepare_flush();
        self.schemas.prepare_flush();
    }

    fn flush(&self) -> IndexResult<()> {
        tracing::debug!("Flushing meta database {}", self.name);
        self.sequence.sync()?;
        self.namespaces.flush()?;
        self.metrics.flush()?;
        self.tag_values.flush()?;
        self.schemas.flush()?;
        tracing::debug!("Flushed meta database {}", self.name);
        Ok(())
    }
}

/// Namespace, metric, tag and field id resolution
pub struct MetricMetaDatabase {
    core: Arc<MetaCore>,
    worker: NotifyWorker<MetaNotifier>,
}

impl MetricMetaDatabase {
    /// Open with default configuration. Must be called within a Tokio runtime.
    pub fn open(dir: impl AsRef<Path>) -> IndexResult<Self> {
        Self::open_with_config(dir, &IndexConfig::default())
    }

    /// Open or create the meta database stored in `dir`
    pub fn open_with_config(dir: impl AsRef<Path>, config: &IndexConfig) -> IndexResult<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;

        let sequence = Sequence::open(dir.join(SEQUENCE_FILE))?;
        let kv = KvStore::open(dir, config.compression)?;
        let name = dir.display().to_string();

        let core = Arc::new(MetaCore {
            namespaces: IndexKvStore::new(
                "namespace",
                kv.family("namespace", MergePolicy::Trie)?,
                config.bucket_cache_capacity,
            ),
            metrics: IndexKvStore::new(
                "metric",
                kv.family("metric", MergePolicy::Trie)?,
                config.bucket_cache_capacity,
            ),
            tag_values: IndexKvStore::new(
                "tag_value",
                kv.family("tag_value", MergePolicy::Trie)?,
                config.bucket_cache_capacity,
            ),
            schemas: MetricSchemaStore::new(
                kv.family("schema", MergePolicy::Schema)?,
                config.schema_cache_capacity,
            ),
            sequence,
            name: name.clone(),
            flushing: AtomicBool::new(false),
            inflight: Mutex::new(None),
        });

        let handler_core = Arc::clone(&core);
        let worker = NotifyWorker::spawn(
            format!("meta:{}", name),
            config.worker_tick,
            move |event: MetaNotifier| handler_core.handle(event),
        );

        tracing::info!("Opened meta database at {}", name);
        Ok(Self { core, worker })
    }

    /// Queue a mutation. If the worker is closed the notifier's callbacks
    /// receive [`IndexError::WorkerClosed`].
    pub fn notify(&self, notifier: MetaNotifier) {
        if let Err(notifier) = self.worker.notify(notifier) {
            notifier.reject(IndexError::WorkerClosed(self.core.name.clone()));
        }
    }

    /// Resolve or create a metric id and wait for the result
    pub async fn gen_metric_id(&self, namespace: &str, metric_name: &str) -> IndexResult<u32> {
        let (tx, rx) = oneshot::channel();
        self.notify(MetaNotifier::Metric {
            namespace: namespace.to_string(),
            metric_name: metric_name.to_string(),
            callback: Box::new(move |result| {
                let _ = tx.send(result);
            }),
        });
        self.rendezvous(rx).await
    }

    /// Resolve or create a field id and wait for the result
    pub async fn gen_field_id(
        &self,
        namespace: &str,
        metric_name: &str,
        field_name: &str,
        field_type: FieldType,
    ) -> IndexResult<u8> {
        let (tx, rx) = oneshot::channel();
        self.notify(MetaNotifier::Field {
            namespace: namespace.to_string(),
            metric_name: metric_name.to_string(),
            field_name: field_name.to_string(),
            field_type,
            callback: Box::new(move |result| {
                let _ = tx.send(result);
            }),
        });
        self.rendezvous(rx).await
    }

    /// Resolve tags and wait; returns the resolved `(tag_key_id, tag_value_id)` pairs
    pub async fn gen_tag_ids(&self, metric_id: u32, tags: Vec<(String, String)>) -> IndexResult<Vec<(u32, u32)>> {
        let resolved = Arc::new(Mutex::new(Vec::with_capacity(tags.len())));
        let sink = Arc::clone(&resolved);
        let (tx, rx) = oneshot::channel();
        self.notify(MetaNotifier::Tag {
            metric_id,
            tags,
            on_tag: Box::new(move |key_id, value_id| sink.lock().push((key_id, value_id))),
            on_complete: Some(Box::new(move |result| {
                let _ = tx.send(result);
            })),
        });
        self.rendezvous(rx).await?;
        let pairs = std::mem::take(&mut *resolved.lock());
        Ok(pairs)
    }

    /// Request a flush and wait for it
    pub async fn flush(&self) -> IndexResult<()> {
        let (tx, rx) = oneshot::channel();
        self.notify(MetaNotifier::Flush {
            callback: Box::new(move |result| {
                let _ = tx.send(result);
            }),
        });
        self.rendezvous(rx).await
    }

    /// Drain the worker, wait for a running flush, persist the rest and
    /// release the sequence file
    pub async fn close(&self) -> IndexResult<()> {
        self.worker.close().await;

        let inflight = self.core.inflight.lock().take();
        if let Some(handle) = inflight {
            if let Err(e) = handle.await {
                tracing::error!("Flush task of {} failed: {}", self.core.name, e);
            }
        }

        let core = Arc::clone(&self.core);
        tokio::task::spawn_blocking(move || {
            // a failed earlier flush may still hold pending data
            core.flush()?;
            core.prepare_flush();
            core.flush()?;
            core.sequence.close()
        })
        .await
        .map_err(|e| IndexError::Flush(e.to_string()))??;

        tracing::info!("Closed meta database {}", self.core.name);
        Ok(())
    }

    async fn rendezvous<T>(&self, rx: oneshot::Receiver<IndexResult<T>>) -> IndexResult<T> {
        rx.await.map_err(|_| {
            IndexError::WorkerClosed(format!("{} dropped the request", self.core.name))
        })?
    }

    pub fn get_metric_id(&self, namespace: &str, metric_name: &str) -> IndexResult<Option<u32>> {
        let namespace = normalize_namespace(namespace)?;
        let namespace_id = match self
            .core
            .namespaces
            .get_value(namespace_bucket(namespace), namespace.as_bytes())?
        {
            Some(id) => id,
            None => return Ok(None),
        };
        self.core.metrics.get_value(namespace_id, metric_name.as_bytes())
    }

    pub fn get_tag_key_id(&self, metric_id: u32, tag_key: &str) -> IndexResult<Option<u32>> {
        self.core.schemas.get_tag_key_id(metric_id, tag_key)
    }

    pub fn get_schema(&self, metric_id: u32) -> IndexResult<Option<MetricSchema>> {
        self.core.schemas.get_schema(metric_id)
    }

    /// Every tag value id of a tag key
    pub fn find_tag_value_ids_for_tag(&self, tag_key_id: u32) -> IndexResult<RoaringBitmap> {
        self.core.tag_values.get_values(tag_key_id)
    }

    /// Tag value ids of a tag key accepted by `filter`
    pub fn find_tag_value_ids_by_expr(&self, tag_key_id: u32, filter: &TagFilter) -> IndexResult<RoaringBitmap> {
        self.core.tag_values.find_values_by_expr(tag_key_id, filter)
    }

    /// Resolve tag value ids back to their values
    pub fn collect_tag_values(
        &self,
        tag_key_id: u32,
        tag_value_ids: &RoaringBitmap,
        out: &mut HashMap<u32, String>,
    ) -> IndexResult<()> {
        self.core.tag_values.collect_kvs(tag_key_id, tag_value_ids, out)
    }

    pub fn suggest_namespace(&self, prefix: &str, limit: usize) -> IndexResult<Vec<String>> {
        if !prefix.is_empty() {
            return self.core.namespaces.suggest(namespace_bucket(prefix), prefix, limit);
        }
        // no prefix: every first byte is a candidate bucket
        let mut all = BTreeSet::new();
        for bucket in 0..=u8::MAX as u32 {
            all.extend(self.core.namespaces.suggest(bucket, "", limit)?);
        }
        Ok(all.into_iter().take(limit).collect())
    }

    pub fn suggest_metrics(&self, namespace: &str, prefix: &str, limit: usize) -> IndexResult<Vec<String>> {
        let namespace = normalize_namespace(namespace)?;
        match self
            .core
            .namespaces
            .get_value(namespace_bucket(namespace), namespace.as_bytes())?
        {
            Some(namespace_id) => self.core.metrics.suggest(namespace_id, prefix, limit),
            None => Ok(Vec::new()),
        }
    }

    pub fn suggest_tag_keys(&self, metric_id: u32, prefix: &str, limit: usize) -> IndexResult<Vec<String>> {
        self.core.schemas.suggest_tag_keys(metric_id, prefix, limit)
    }

    pub fn suggest_tag_values(&self, tag_key_id: u32, prefix: &str, limit: usize) -> IndexResult<Vec<String>> {
        self.core.tag_values.suggest(tag_key_id, prefix, limit)
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::KvFamily;
    use std::time::Duration;
    use tempfile::tempdir;

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

    #[tokio::test]
    async fn test_metric_ids_stable() {
        let dir = tempdir().unwrap();
        let db = MetricMetaDatabase::open_with_config(dir.path(), &test_config()).unwrap();

        let cpu = db.gen_metric_id("system", "cpu").await.unwrap();
        let mem = db.gen_metric_id("system", "mem").await.unwrap();
        assert_ne!(cpu, mem);
        assert_eq!(db.gen_metric_id("system", "cpu").await.unwrap(), cpu);

        // same name, other namespace
        let other = db.gen_metric_id("app", "cpu").await.unwrap();
        assert_ne!(other, cpu);

        assert_eq!(db.get_metric_id("system", "cpu").unwrap(), Some(cpu));
        assert_eq!(db.get_metric_id("system", "disk").unwrap(), None);
        assert_eq!(db.get_metric_id("nowhere", "cpu").unwrap(), None);

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_namespace_rules() {
        let dir = tempdir().unwrap();
        let db = MetricMetaDatabase::open_with_config(dir.path(), &test_config()).unwrap();

        let id = db.gen_metric_id("", "cpu").await.unwrap();
        assert_eq!(db.get_metric_id(DEFAULT_NAMESPACE, "cpu").unwrap(), Some(id));

        let long = "n".repeat(MAX_NAMESPACE_LEN + 1);
        let err = db.gen_metric_id(&long, "cpu").await.unwrap_err();
        assert!(matches!(err, IndexError::NamespaceTooLong { .. }));

        let exact = "n".repeat(MAX_NAMESPACE_LEN);
        assert!(db.gen_metric_id(&exact, "cpu").await.is_ok());

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_field_ids() {
        let dir = tempdir().unwrap();
        let db = MetricMetaDatabase::open_with_config(dir.path(), &test_config()).unwrap();

        assert_eq!(db.gen_field_id("system", "cpu", "usage", FieldType::Sum).await.unwrap(), 1);
        assert_eq!(db.gen_field_id("system", "cpu", "idle", FieldType::Last).await.unwrap(), 2);
        assert_eq!(db.gen_field_id("system", "cpu", "usage", FieldType::Sum).await.unwrap(), 1);

        let err = db
            .gen_field_id("system", "cpu", "usage", FieldType::Max)
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::FieldTypeMismatch { .. }));

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_tag_resolution_skips_bad_pairs() {
        let dir = tempdir().unwrap();
        let db = MetricMetaDatabase::open_with_config(dir.path(), &test_config()).unwrap();
        let metric_id = db.gen_metric_id("system", "cpu").await.unwrap();

        let huge = "v".repeat(70_000);
        let pairs = db
            .gen_tag_ids(
                metric_id,
                vec![
                    ("host".to_string(), "a".to_string()),
                    ("zone".to_string(), huge),
                    ("region".to_string(), "eu".to_string()),
                ],
            )
            .await
            .unwrap();
        assert_eq!(pairs.len(), 2);

        let host = db.get_tag_key_id(metric_id, "host").unwrap().unwrap();
        let region = db.get_tag_key_id(metric_id, "region").unwrap().unwrap();
        assert_eq!(pairs[0].0, host);
        assert_eq!(pairs[1].0, region);

        // same pairs resolve to the same ids
        let again = db
            .gen_tag_ids(metric_id, tags(&[("host", "a"), ("region", "eu")]))
            .await
            .unwrap();
        assert_eq!(again, pairs);

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_tag_value_lookups() {
        let dir = tempdir().unwrap();
        let db = MetricMetaDatabase::open_with_config(dir.path(), &test_config()).unwrap();
        let metric_id = db.gen_metric_id("system", "cpu").await.unwrap();

        let mut value_ids = HashMap::new();
        for host in ["web-1", "web-2", "db-1"] {
            let pairs = db.gen_tag_ids(metric_id, tags(&[("host", host)])).await.unwrap();
            value_ids.insert(host, pairs[0].1);
        }
        let host = db.get_tag_key_id(metric_id, "host").unwrap().unwrap();

        assert_eq!(db.find_tag_value_ids_for_tag(host).unwrap().len(), 3);

        let web = db
            .find_tag_value_ids_by_expr(host, &TagFilter::Like("web*".into()))
            .unwrap();
        assert_eq!(web.len(), 2);
        assert!(web.contains(value_ids["web-1"]));

        let mut out = HashMap::new();
        db.collect_tag_values(host, &web, &mut out).unwrap();
        let mut names: Vec<_> = out.values().cloned().collect();
        names.sort();
        assert_eq!(names, vec!["web-1", "web-2"]);

        assert_eq!(db.suggest_tag_values(host, "d", 10).unwrap(), vec!["db-1"]);
        assert_eq!(db.suggest_tag_keys(metric_id, "h", 10).unwrap(), vec!["host"]);

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_suggestions() {
        let dir = tempdir().unwrap();
        let db = MetricMetaDatabase::open_with_config(dir.path(), &test_config()).unwrap();

        for (ns, metric) in [("system", "cpu"), ("system", "cpu.load"), ("app", "latency"), ("sales", "orders")] {
            db.gen_metric_id(ns, metric).await.unwrap();
        }

        assert_eq!(db.suggest_namespace("s", 10).unwrap(), vec!["sales", "system"]);
        assert_eq!(db.suggest_namespace("", 10).unwrap(), vec!["app", "sales", "system"]);
        assert_eq!(db.suggest_namespace("", 1).unwrap(), vec!["app"]);
        assert_eq!(db.suggest_metrics("system", "cpu", 10).unwrap(), vec!["cpu", "cpu.load"]);
        assert!(db.suggest_metrics("missing", "", 10).unwrap().is_empty());

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_reopen_keeps_ids_and_sequence() {
        let dir = tempdir().unwrap();
        let (cpu, host, web) = {
            let db = MetricMetaDatabase::open_with_config(dir.path(), &test_config()).unwrap();
            let cpu = db.gen_metric_id("system", "cpu").await.unwrap();
            let pairs = db.gen_tag_ids(cpu, tags(&[("host", "web")])).await.unwrap();
            db.gen_field_id("system", "cpu", "usage", FieldType::Sum).await.unwrap();
            db.close().await.unwrap();
            (cpu, pairs[0].0, pairs[0].1)
        };

        let db = MetricMetaDatabase::open_with_config(dir.path(), &test_config()).unwrap();
        assert_eq!(db.get_metric_id("system", "cpu").unwrap(), Some(cpu));
        assert_eq!(db.get_tag_key_id(cpu, "host").unwrap(), Some(host));
        assert_eq!(db.gen_tag_ids(cpu, tags(&[("host", "web")])).await.unwrap(), vec![(host, web)]);
        assert_eq!(db.get_schema(cpu).unwrap().unwrap().fields.len(), 1);

        // allocation continues after the persisted counters
        let mem = db.gen_metric_id("system", "mem").await.unwrap();
        assert!(mem > cpu);
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_flush_requests_all_succeed() {
        let dir = tempdir().unwrap();
        let db = MetricMetaDatabase::open_with_config(dir.path(), &test_config()).unwrap();
        db.gen_metric_id("system", "cpu").await.unwrap();

        let (first, second) = tokio::join!(db.flush(), db.flush());
        first.unwrap();
        second.unwrap();
        // one generation, written once
        assert_eq!(published_versions(dir.path(), "namespace"), 1);
        assert_eq!(published_versions(dir.path(), "metric"), 1);

        db.flush().await.unwrap();
        assert_eq!(published_versions(dir.path(), "metric"), 1);
        assert!(db.get_metric_id("system", "cpu").unwrap().is_some());
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_requests_after_close_fail() {
        let dir = tempdir().unwrap();
        let db = MetricMetaDatabase::open_with_config(dir.path(), &test_config()).unwrap();
        db.close().await.unwrap();

        let err = db.gen_metric_id("system", "cpu").await.unwrap_err();
        assert!(matches!(err, IndexError::WorkerClosed(_)));
    }
}

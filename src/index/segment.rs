//! Metric Index Segment - month router over index databases
//!
//! ```text
//! family time ──month_key──► 202405 ──► MetricIndexDatabase  (dir/202405)
//!                            202406 ──► MetricIndexDatabase  (dir/202406)
//! ```
//!
//! Databases are created on first use. The month map is replaced wholesale on
//! every insert, so readers work on a stable copy without holding a lock.

use crate::index::error::{IndexError, IndexResult};
use crate::index::expr::TagFilter;
use crate::index::grouping::{GroupingContext, ShardExecuteContext};
use crate::index::index_db::MetricIndexDatabase;
use crate::index::meta_db::MetricMetaDatabase;
use crate::index::IndexConfig;
use crate::types::{month_key, TimeRange};
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use roaring::RoaringBitmap;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

type MonthMap = BTreeMap<u32, Arc<MetricIndexDatabase>>;

pub struct MetricIndexSegment {
    dir: PathBuf,
    meta: Arc<MetricMetaDatabase>,
    config: IndexConfig,
    indexes: RwLock<Arc<MonthMap>>,
    create_lock: Mutex<()>,
}

impl MetricIndexSegment {
    /// Open the segment rooted at `dir`, reopening every month found there.
    /// Must be called within a Tokio runtime.
    pub fn open(dir: impl AsRef<Path>, meta: Arc<MetricMetaDatabase>, config: IndexConfig) -> IndexResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut indexes = MonthMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let month = match entry.file_name().to_str().and_then(parse_month) {
                Some(month) => month,
                None => continue,
            };
            let db = MetricIndexDatabase::open_with_config(entry.path(), Arc::clone(&meta), &config)?;
            indexes.insert(month, Arc::new(db));
        }
        if !indexes.is_empty() {
            tracing::info!("Reopened {} monthly indexes in {}", indexes.len(), dir.display());
        }

        Ok(Self {
            dir,
            meta,
            config,
            indexes: RwLock::new(Arc::new(indexes)),
            create_lock: Mutex::new(()),
        })
    }

    /// Index database for the month containing `family_time` (milliseconds)
    pub fn get_or_create_index(&self, family_time: i64) -> IndexResult<Arc<MetricIndexDatabase>> {
        let month = month_key(family_time).ok_or(IndexError::InvalidTime(family_time))?;
        if let Some(db) = self.indexes.read().get(&month) {
            return Ok(Arc::clone(db));
        }

        let _guard = self.create_lock.lock();
        if let Some(db) = self.indexes.read().get(&month) {
            return Ok(Arc::clone(db));
        }

        let db = Arc::new(MetricIndexDatabase::open_with_config(
            self.dir.join(month.to_string()),
            Arc::clone(&self.meta),
            &self.config,
        )?);
        let mut next = MonthMap::clone(&self.indexes.read());
        next.insert(month, Arc::clone(&db));
        *self.indexes.write() = Arc::new(next);

        tracing::info!("Created index for month {} in {}", month, self.dir.display());
        Ok(db)
    }

    /// Resolve a series in the month of `family_time`
    pub async fn gen_series_id(
        &self,
        family_time: i64,
        namespace: &str,
        metric_name: &str,
        tags: Vec<(String, String)>,
        tag_hash: u64,
    ) -> IndexResult<(u32, u32)> {
        let db = self.get_or_create_index(family_time)?;
        db.gen_series_id(namespace, metric_name, tags, tag_hash).await
    }

    /// Month keys with an index, ascending
    pub fn months(&self) -> Vec<u32> {
        self.indexes.read().keys().copied().collect()
    }

    fn indexes_in(&self, range: &TimeRange) -> Vec<(u32, Arc<MetricIndexDatabase>)> {
        let indexes = Arc::clone(&self.indexes.read());
        indexes
            .iter()
            .filter(|(month, _)| range.covers_month(**month))
            .map(|(month, db)| (*month, Arc::clone(db)))
            .collect()
    }

    fn union_over<F>(&self, range: &TimeRange, mut f: F) -> IndexResult<RoaringBitmap>
    where
        F: FnMut(&MetricIndexDatabase) -> IndexResult<RoaringBitmap>,
    {
        let mut series = RoaringBitmap::new();
        for (_, db) in self.indexes_in(range) {
            series |= f(&db)?;
        }
        Ok(series)
    }

    pub fn get_series_ids_for_metric(&self, metric_id: u32, range: &TimeRange) -> IndexResult<RoaringBitmap> {
        self.union_over(range, |db| db.get_series_ids_for_metric(metric_id))
    }

    pub fn get_series_ids_for_tag(&self, tag_key_id: u32, range: &TimeRange) -> IndexResult<RoaringBitmap> {
        self.union_over(range, |db| db.get_series_ids_for_tag(tag_key_id))
    }

    pub fn get_series_ids_by_tag_value_ids(
        &self,
        tag_key_id: u32,
        tag_value_ids: &RoaringBitmap,
        range: &TimeRange,
    ) -> IndexResult<RoaringBitmap> {
        self.union_over(range, |db| db.get_series_ids_by_tag_value_ids(tag_key_id, tag_value_ids))
    }

    pub fn get_series_ids_by_expr(
        &self,
        tag_key_id: u32,
        filter: &TagFilter,
        range: &TimeRange,
    ) -> IndexResult<RoaringBitmap> {
        self.union_over(range, |db| db.get_series_ids_by_expr(tag_key_id, filter))
    }

    /// Grouping scanners from every month in `ctx.time_range`.
    ///
    /// Each month narrows its own copy of the incoming filter; months that
    /// fail are skipped. `ctx.series_ids` becomes the union of the narrowed
    /// filters.
    pub fn get_grouping_context(&self, ctx: &mut ShardExecuteContext) -> IndexResult<GroupingContext> {
        let mut merged: Option<GroupingContext> = None;
        let mut narrowed = RoaringBitmap::new();

        for (month, db) in self.indexes_in(&ctx.time_range) {
            let mut month_ctx = ctx.clone();
            match db.get_grouping_context(&mut month_ctx) {
                Ok(grouping) => {
                    narrowed |= month_ctx.series_ids;
                    match merged.as_mut() {
                        Some(all) => all.merge(grouping),
                        None => merged = Some(grouping),
                    }
                }
                Err(e) => tracing::debug!("Skipping month {} for grouping: {}", month, e),
            }
        }

        ctx.series_ids = narrowed;
        merged.ok_or_else(|| {
            IndexError::NotFound(format!(
                "grouping context for tag keys {:?}",
                ctx.group_by_tag_key_ids
            ))
        })
    }

    /// Flush every month concurrently; returns the last error
    pub async fn flush(&self) -> IndexResult<()> {
        let indexes = Arc::clone(&self.indexes.read());
        let results = join_all(indexes.values().map(|db| db.flush())).await;
        last_error(results)
    }

    /// Close every month concurrently; returns the last error
    pub async fn close(&self) -> IndexResult<()> {
        let indexes = Arc::clone(&self.indexes.read());
        let results = join_all(indexes.values().map(|db| db.close())).await;
        last_error(results)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn parse_month(name: &str) -> Option<u32> {
    if name.len() != 6 {
        return None;
    }
    let month: u32 = name.parse().ok()?;
    (1..=12).contains(&(month % 100)).then_some(month)
}

fn last_error(results: Vec<IndexResult<()>>) -> IndexResult<()> {
    let mut outcome = Ok(());
    for result in results {
        if let Err(e) = result {
            tracing::error!("Segment operation failed: {}", e);
            outcome = Err(e);
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    fn test_config() -> IndexConfig {
        IndexConfig {
            worker_tick: Duration::from_millis(5),
            ..IndexConfig::default()
        }
    }

    fn millis(year: i32, month: u32, day: u32) -> i64 {
        Utc.with_ymd_and_hms(year, month, day, 12, 0, 0)
            .unwrap()
            .timestamp_millis()
    }

    fn tags(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn create_test_segment() -> (TempDir, Arc<MetricMetaDatabase>, MetricIndexSegment) {
        let dir = tempdir().unwrap();
        let meta = Arc::new(MetricMetaDatabase::open_with_config(dir.path().join("meta"), &test_config()).unwrap());
        let segment = MetricIndexSegment::open(dir.path().join("series"), Arc::clone(&meta), test_config()).unwrap();
        (dir, meta, segment)
    }

    #[tokio::test]
    async fn test_one_database_per_month() {
        let (_dir, meta, segment) = create_test_segment();

        let a = segment.get_or_create_index(millis(2024, 5, 1)).unwrap();
        let b = segment.get_or_create_index(millis(2024, 5, 30)).unwrap();
        let c = segment.get_or_create_index(millis(2024, 6, 1)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(segment.months(), vec![202405, 202406]);

        let result = segment.get_or_create_index(i64::MAX);
        assert!(matches!(result, Err(IndexError::InvalidTime(_))));

        segment.close().await.unwrap();
        meta.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_range_reads_span_months() {
        let (_dir, meta, segment) = create_test_segment();
        let may = millis(2024, 5, 10);
        let june = millis(2024, 6, 10);
        let july = millis(2024, 7, 10);

        let (metric_id, s_may) = segment
            .gen_series_id(may, "system", "cpu", tags(&[("host", "a")]), 1)
            .await
            .unwrap();
        // months allocate independently
        let (_, s_june) = segment
            .gen_series_id(june, "system", "cpu", tags(&[("host", "b")]), 2)
            .await
            .unwrap();
        assert_eq!((s_may, s_june), (0, 0));
        let (_, s_july) = segment
            .gen_series_id(july, "system", "cpu", tags(&[("host", "c")]), 3)
            .await
            .unwrap();
        assert_eq!(s_july, 0);
        let (_, s_june2) = segment
            .gen_series_id(june, "system", "cpu", tags(&[("host", "d")]), 4)
            .await
            .unwrap();
        assert_eq!(s_june2, 1);

        let june_only = TimeRange::new(millis(2024, 6, 1), millis(2024, 6, 30));
        let series = segment.get_series_ids_for_metric(metric_id, &june_only).unwrap();
        assert_eq!(series.iter().collect::<Vec<_>>(), vec![0, 1]);

        let host = meta.get_tag_key_id(metric_id, "host").unwrap().unwrap();
        let filter = TagFilter::In(vec!["a".into(), "d".into()]);
        let may_june = TimeRange::new(may, june + 1);
        let matched = segment.get_series_ids_by_expr(host, &filter, &may_june).unwrap();
        assert_eq!(matched.iter().collect::<Vec<_>>(), vec![0, 1]);

        let value_ids = meta.find_tag_value_ids_by_expr(host, &TagFilter::Equal("c".into())).unwrap();
        let everything = TimeRange::new(may, july + 1);
        assert_eq!(
            segment
                .get_series_ids_by_tag_value_ids(host, &value_ids, &everything)
                .unwrap()
                .len(),
            1
        );
        assert_eq!(segment.get_series_ids_for_tag(host, &everything).unwrap().len(), 2);

        let later = TimeRange::new(millis(2025, 1, 1), millis(2025, 2, 1));
        assert!(segment.get_series_ids_for_metric(metric_id, &later).unwrap().is_empty());

        segment.close().await.unwrap();
        meta.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_grouping_unions_months() {
        let (_dir, meta, segment) = create_test_segment();
        let may = millis(2024, 5, 10);
        let june = millis(2024, 6, 10);

        // may: series 0 has zone, june: series 0 has no zone, series 1 has
        let (metric_id, _) = segment
            .gen_series_id(may, "system", "cpu", tags(&[("host", "a"), ("zone", "eu")]), 1)
            .await
            .unwrap();
        segment
            .gen_series_id(june, "system", "cpu", tags(&[("host", "b")]), 2)
            .await
            .unwrap();
        segment
            .gen_series_id(june, "system", "cpu", tags(&[("host", "c"), ("zone", "us")]), 3)
            .await
            .unwrap();

        let zone = meta.get_tag_key_id(metric_id, "zone").unwrap().unwrap();
        let range = TimeRange::new(may, june + 1);
        let all: RoaringBitmap = [0, 1].into_iter().collect();

        let mut ctx = ShardExecuteContext::new(vec![zone], range, all);
        let grouping = segment.get_grouping_context(&mut ctx).unwrap();
        assert_eq!(ctx.series_ids.iter().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(grouping.scanners(zone).len(), 2);

        // june alone cannot group series 0 by zone
        let june_range = TimeRange::new(june, june + 1);
        let only_zero: RoaringBitmap = [0].into_iter().collect();
        let mut ctx = ShardExecuteContext::new(vec![zone], june_range, only_zero);
        assert!(matches!(
            segment.get_grouping_context(&mut ctx),
            Err(IndexError::NotFound(_))
        ));
        assert!(ctx.series_ids.is_empty());

        segment.close().await.unwrap();
        meta.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_reopen_discovers_months() {
        let dir = tempdir().unwrap();
        let config = test_config();
        let may = millis(2024, 5, 10);

        let metric_id = {
            let meta = Arc::new(MetricMetaDatabase::open_with_config(dir.path().join("meta"), &config).unwrap());
            let segment = MetricIndexSegment::open(dir.path().join("series"), Arc::clone(&meta), config.clone())
                .unwrap();
            let (metric_id, _) = segment
                .gen_series_id(may, "system", "cpu", Vec::new(), 9)
                .await
                .unwrap();
            segment.flush().await.unwrap();
            segment.close().await.unwrap();
            meta.close().await.unwrap();
            metric_id
        };

        // stray entries are ignored
        std::fs::create_dir_all(dir.path().join("series").join("notes")).unwrap();

        let meta = Arc::new(MetricMetaDatabase::open_with_config(dir.path().join("meta"), &config).unwrap());
        let segment = MetricIndexSegment::open(dir.path().join("series"), Arc::clone(&meta), config).unwrap();
        assert_eq!(segment.months(), vec![202405]);
        let range = TimeRange::new(may, may + 1);
        assert_eq!(segment.get_series_ids_for_metric(metric_id, &range).unwrap().len(), 1);

        segment.close().await.unwrap();
        meta.close().await.unwrap();
    }

    #[test]
    fn test_parse_month() {
        assert_eq!(parse_month("202405"), Some(202405));
        assert_eq!(parse_month("202413"), None);
        assert_eq!(parse_month("notes"), None);
        assert_eq!(parse_month("2024050"), None);
    }
}

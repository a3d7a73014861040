//! Group-by support
//!
//! For each group-by tag key the forward index yields a set of scanners: one
//! over in-memory data and one per persisted version. A scanner answers
//! "which tag value does each of these series have".

use crate::types::TimeRange;
use roaring::RoaringBitmap;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Query-side state for one shard execution.
///
/// `series_ids` is the current series filter; grouping narrows it in place.
#[derive(Debug, Clone)]
pub struct ShardExecuteContext {
    pub group_by_tag_key_ids: Vec<u32>,
    pub time_range: TimeRange,
    pub series_ids: RoaringBitmap,
}

impl ShardExecuteContext {
    pub fn new(group_by_tag_key_ids: Vec<u32>, time_range: TimeRange, series_ids: RoaringBitmap) -> Self {
        Self {
            group_by_tag_key_ids,
            time_range,
            series_ids,
        }
    }
}

/// Read access to `series id → tag value id` for one tag key
pub trait GroupingScanner: Send + Sync {
    /// Every series this scanner covers
    fn series_ids(&self) -> &RoaringBitmap;

    /// Series of `filter` covered here, with their tag value ids, ascending by series
    fn get_series_and_tag_values(&self, filter: &RoaringBitmap) -> (Vec<u32>, Vec<u32>);
}

/// Scanner over forward entries still in memory
pub struct MemoryGroupingScanner {
    series: RoaringBitmap,
    values: BTreeMap<u32, u32>,
}

impl MemoryGroupingScanner {
    pub fn new(values: BTreeMap<u32, u32>) -> Self {
        let series = values.keys().copied().collect();
        Self { series, values }
    }
}

impl GroupingScanner for MemoryGroupingScanner {
    fn series_ids(&self) -> &RoaringBitmap {
        &self.series
    }

    fn get_series_and_tag_values(&self, filter: &RoaringBitmap) -> (Vec<u32>, Vec<u32>) {
        let hits = &self.series & filter;
        let mut series = Vec::with_capacity(hits.len() as usize);
        let mut values = Vec::with_capacity(hits.len() as usize);
        for id in hits.iter() {
            if let Some(value) = self.values.get(&id) {
                series.push(id);
                values.push(*value);
            }
        }
        (series, values)
    }
}

/// Scanner over one persisted forward entry: a sorted series bitmap plus a
/// parallel array of tag value ids
pub struct PersistedGroupingScanner {
    series: RoaringBitmap,
    values: Arc<[u32]>,
}

impl PersistedGroupingScanner {
    /// `values[i]` belongs to the i-th smallest series in `series`
    pub fn new(series: RoaringBitmap, values: Arc<[u32]>) -> Self {
        Self { series, values }
    }

    fn value_of(&self, series_id: u32) -> Option<u32> {
        if !self.series.contains(series_id) {
            return None;
        }
        // rank counts ids <= series_id
        let idx = self.series.rank(series_id) as usize - 1;
        self.values.get(idx).copied()
    }
}

impl GroupingScanner for PersistedGroupingScanner {
    fn series_ids(&self) -> &RoaringBitmap {
        &self.series
    }

    fn get_series_and_tag_values(&self, filter: &RoaringBitmap) -> (Vec<u32>, Vec<u32>) {
        let hits = &self.series & filter;
        let mut series = Vec::with_capacity(hits.len() as usize);
        let mut values = Vec::with_capacity(hits.len() as usize);
        for id in hits.iter() {
            if let Some(value) = self.value_of(id) {
                series.push(id);
                values.push(value);
            }
        }
        (series, values)
    }
}

/// Scanners per group-by tag key
#[derive(Default)]
pub struct GroupingContext {
    tag_key_ids: Vec<u32>,
    scanners: HashMap<u32, Vec<Box<dyn GroupingScanner>>>,
}

impl GroupingContext {
    pub fn new(tag_key_ids: Vec<u32>) -> Self {
        Self {
            tag_key_ids,
            scanners: HashMap::new(),
        }
    }

    pub fn add_scanners(&mut self, tag_key_id: u32, scanners: Vec<Box<dyn GroupingScanner>>) {
        if !self.tag_key_ids.contains(&tag_key_id) {
            self.tag_key_ids.push(tag_key_id);
        }
        self.scanners.entry(tag_key_id).or_default().extend(scanners);
    }

    /// Group-by tag keys, in request order
    pub fn tag_key_ids(&self) -> &[u32] {
        &self.tag_key_ids
    }

    pub fn scanners(&self, tag_key_id: u32) -> &[Box<dyn GroupingScanner>] {
        self.scanners
            .get(&tag_key_id)
            .map(|s| s.as_slice())
            .unwrap_or(&[])
    }

    /// Take over every scanner of `other`
    pub fn merge(&mut self, other: GroupingContext) {
        let GroupingContext {
            tag_key_ids,
            mut scanners,
        } = other;
        for tag_key_id in tag_key_ids {
            let list = scanners.remove(&tag_key_id).unwrap_or_default();
            self.add_scanners(tag_key_id, list);
        }
    }

    /// Split `series_ids` into groups keyed by their tag value ids, one per
    /// group-by tag key in order. Series missing any key are left out.
    pub fn group_series(&self, series_ids: &RoaringBitmap) -> BTreeMap<Vec<u32>, RoaringBitmap> {
        let mut per_key: Vec<HashMap<u32, u32>> = Vec::with_capacity(self.tag_key_ids.len());
        for tag_key_id in &self.tag_key_ids {
            let mut values = HashMap::new();
            for scanner in self.scanners(*tag_key_id) {
                let (series, tag_values) = scanner.get_series_and_tag_values(series_ids);
                for (series_id, value) in series.into_iter().zip(tag_values) {
                    values.entry(series_id).or_insert(value);
                }
            }
            per_key.push(values);
        }

        let mut groups: BTreeMap<Vec<u32>, RoaringBitmap> = BTreeMap::new();
        'series: for series_id in series_ids {
            let mut key = Vec::with_capacity(per_key.len());
            for values in &per_key {
                match values.get(&series_id) {
                    Some(value) => key.push(*value),
                    None => continue 'series,
                }
            }
            groups.entry(key).or_default().insert(series_id);
        }
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory(pairs: &[(u32, u32)]) -> Box<dyn GroupingScanner> {
        Box::new(MemoryGroupingScanner::new(pairs.iter().copied().collect()))
    }

    fn persisted(pairs: &[(u32, u32)]) -> Box<dyn GroupingScanner> {
        let series: RoaringBitmap = pairs.iter().map(|(s, _)| *s).collect();
        let values: Vec<u32> = pairs.iter().map(|(_, v)| *v).collect();
        Box::new(PersistedGroupingScanner::new(series, values.into()))
    }

    #[test]
    fn test_persisted_scanner_rank_lookup() {
        let scanner = persisted(&[(2, 20), (5, 50), (9, 90)]);
        let filter: RoaringBitmap = [1, 5, 9].into_iter().collect();
        let (series, values) = scanner.get_series_and_tag_values(&filter);
        assert_eq!(series, vec![5, 9]);
        assert_eq!(values, vec![50, 90]);
    }

    #[test]
    fn test_memory_scanner() {
        let scanner = memory(&[(1, 10), (3, 30)]);
        assert_eq!(scanner.series_ids().len(), 2);
        let filter: RoaringBitmap = [3].into_iter().collect();
        assert_eq!(scanner.get_series_and_tag_values(&filter), (vec![3], vec![30]));
    }

    #[test]
    fn test_group_series() {
        // tag key 1: host, tag key 2: zone
        let mut ctx = GroupingContext::new(vec![1, 2]);
        ctx.add_scanners(1, vec![persisted(&[(0, 100), (1, 100)]), memory(&[(2, 101)])]);
        ctx.add_scanners(2, vec![memory(&[(0, 200), (1, 201), (2, 200)])]);

        let filter: RoaringBitmap = [0, 1, 2, 3].into_iter().collect();
        let groups = ctx.group_series(&filter);

        assert_eq!(groups.len(), 3);
        assert_eq!(groups[&vec![100, 200]].iter().collect::<Vec<_>>(), vec![0]);
        assert_eq!(groups[&vec![100, 201]].iter().collect::<Vec<_>>(), vec![1]);
        assert_eq!(groups[&vec![101, 200]].iter().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_merge_keeps_order() {
        let mut a = GroupingContext::new(vec![1]);
        a.add_scanners(1, vec![memory(&[(0, 1)])]);
        let mut b = GroupingContext::new(vec![1, 2]);
        b.add_scanners(1, vec![memory(&[(5, 1)])]);
        b.add_scanners(2, vec![memory(&[(5, 2)])]);

        a.merge(b);
        assert_eq!(a.tag_key_ids(), &[1, 2]);
        assert_eq!(a.scanners(1).len(), 2);
        assert_eq!(a.scanners(2).len(), 1);
        assert!(a.scanners(3).is_empty());
    }
}

//! Forward index: `tag key id → (series id → tag value id)`
//!
//! A series has exactly one value per tag key, so entries are insert-if-absent.
//!
//! Persisted layout per tag key and version:
//!
//! ```text
//! bitmap_len: u32
//! bitmap: [u8; bitmap_len]       roaring, series ids
//! values: u32 * cardinality      tag value id per series, ascending series order
//! ```

use crate::index::codec::Reader;
use crate::index::error::{IndexError, IndexResult};
use crate::index::grouping::{GroupingScanner, MemoryGroupingScanner, PersistedGroupingScanner};
use crate::kv::{Family, Snapshot};
use parking_lot::{Mutex, RwLock};
use roaring::RoaringBitmap;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

type Entries = HashMap<u32, BTreeMap<u32, u32>>;

struct Generations {
    mutable: Entries,
    immutable: Option<Arc<Entries>>,
    snapshot: Arc<dyn Snapshot>,
}

pub struct ForwardIndex {
    family: Arc<dyn Family>,
    tables: RwLock<Generations>,
    flush_lock: Mutex<()>,
}

impl ForwardIndex {
    pub fn new(family: Arc<dyn Family>) -> Self {
        let snapshot = family.get_snapshot();
        Self {
            family,
            tables: RwLock::new(Generations {
                mutable: HashMap::new(),
                immutable: None,
                snapshot,
            }),
            flush_lock: Mutex::new(()),
        }
    }

    /// Record the tag value of a series unless one is already in memory
    pub fn put(&self, tag_key_id: u32, series_id: u32, tag_value_id: u32) {
        let mut tables = self.tables.write();
        let known = tables
            .immutable
            .as_ref()
            .and_then(|t| t.get(&tag_key_id))
            .map_or(false, |values| values.contains_key(&series_id));
        if !known {
            tables
                .mutable
                .entry(tag_key_id)
                .or_default()
                .entry(series_id)
                .or_insert(tag_value_id);
        }
    }

    /// Every series carrying the tag key
    pub fn get_series_ids(&self, tag_key_id: u32) -> IndexResult<RoaringBitmap> {
        let mut series = RoaringBitmap::new();
        for scanner in self.scanners(tag_key_id)? {
            series |= scanner.series_ids();
        }
        Ok(series)
    }

    /// One scanner over memory (if it holds the key) plus one per persisted version
    pub fn scanners(&self, tag_key_id: u32) -> IndexResult<Vec<Box<dyn GroupingScanner>>> {
        let (memory, snapshot) = {
            let tables = self.tables.read();
            let mut memory: BTreeMap<u32, u32> = BTreeMap::new();
            if let Some(values) = tables.immutable.as_ref().and_then(|t| t.get(&tag_key_id)) {
                memory.extend(values.iter().map(|(s, v)| (*s, *v)));
            }
            if let Some(values) = tables.mutable.get(&tag_key_id) {
                for (series_id, value) in values {
                    memory.entry(*series_id).or_insert(*value);
                }
            }
            (memory, Arc::clone(&tables.snapshot))
        };

        let mut scanners: Vec<Box<dyn GroupingScanner>> = Vec::new();
        if !memory.is_empty() {
            scanners.push(Box::new(MemoryGroupingScanner::new(memory)));
        }
        for version in snapshot.find_readers(tag_key_id)? {
            let (series, values) = decode(&version)?;
            scanners.push(Box::new(PersistedGroupingScanner::new(series, values.into())));
        }
        Ok(scanners)
    }

    pub fn prepare_flush(&self) -> bool {
        let mut tables = self.tables.write();
        if tables.immutable.is_some() {
            return false;
        }
        let mutable = std::mem::take(&mut tables.mutable);
        tables.immutable = Some(Arc::new(mutable));
        true
    }

    pub fn flush(&self) -> IndexResult<()> {
        let _guard = self.flush_lock.lock();

        let immutable = match self.tables.read().immutable.clone() {
            Some(immutable) => immutable,
            None => return Ok(()),
        };
        if immutable.is_empty() {
            self.tables.write().immutable = None;
            return Ok(());
        }

        let mut keys: Vec<u32> = immutable.keys().copied().collect();
        keys.sort_unstable();

        let mut flusher = self.family.new_flusher();
        for key in &keys {
            flusher.prepare(*key)?;
            flusher.write(&encode(&immutable[key])?)?;
            flusher.commit()?;
        }
        flusher.close()?;

        let snapshot = self.family.get_snapshot();
        {
            let mut tables = self.tables.write();
            tables.snapshot = snapshot;
            tables.immutable = None;
        }
        tracing::debug!("Flushed forward index for {} tag keys", keys.len());
        Ok(())
    }
}

fn encode(values: &BTreeMap<u32, u32>) -> IndexResult<Vec<u8>> {
    let series: RoaringBitmap = values.keys().copied().collect();
    let bitmap_len = series.serialized_size();

    let mut buf = Vec::with_capacity(4 + bitmap_len + values.len() * 4);
    buf.extend_from_slice(&(bitmap_len as u32).to_le_bytes());
    series.serialize_into(&mut buf)?;
    // BTreeMap iterates in ascending series order, matching the bitmap
    for value in values.values() {
        buf.extend_from_slice(&value.to_le_bytes());
    }
    Ok(buf)
}

fn decode(data: &[u8]) -> IndexResult<(RoaringBitmap, Vec<u32>)> {
    let mut reader = Reader::new(data, "forward entry");
    let bitmap_len = reader.u32()? as usize;
    let series = RoaringBitmap::deserialize_from(reader.bytes(bitmap_len)?)
        .map_err(|e| IndexError::Corruption(format!("forward entry bitmap: {}", e)))?;

    let mut values = Vec::with_capacity(series.len() as usize);
    for _ in 0..series.len() {
        values.push(reader.u32()?);
    }
    Ok((series, values))
}

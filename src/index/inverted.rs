//! Inverted index: `u32 key → series id bitmap`
//!
//! Used twice per index database: metric id → series and tag value id →
//! series. Entries only ever grow; persisted versions of a key are unioned on
//! read.

use crate::index::error::{IndexError, IndexResult};
use crate::kv::{Family, Snapshot};
use parking_lot::{Mutex, RwLock};
use roaring::RoaringBitmap;
use std::collections::HashMap;
use std::sync::Arc;

type Postings = HashMap<u32, RoaringBitmap>;

struct Generations {
    mutable: Postings,
    immutable: Option<Arc<Postings>>,
    snapshot: Arc<dyn Snapshot>,
}

pub struct InvertedIndex {
    name: String,
    family: Arc<dyn Family>,
    tables: RwLock<Generations>,
    flush_lock: Mutex<()>,
}

impl InvertedIndex {
    pub fn new(name: impl Into<String>, family: Arc<dyn Family>) -> Self {
        let snapshot = family.get_snapshot();
        Self {
            name: name.into(),
            family,
            tables: RwLock::new(Generations {
                mutable: HashMap::new(),
                immutable: None,
                snapshot,
            }),
            flush_lock: Mutex::new(()),
        }
    }

    pub fn put(&self, key: u32, series_id: u32) {
        self.tables
            .write()
            .mutable
            .entry(key)
            .or_default()
            .insert(series_id);
    }

    /// Series of one key; empty if the key is unknown
    pub fn get(&self, key: u32) -> IndexResult<RoaringBitmap> {
        let mut series = RoaringBitmap::new();
        let snapshot = {
            let tables = self.tables.read();
            if let Some(ids) = tables.mutable.get(&key) {
                series |= ids;
            }
            if let Some(ids) = tables.immutable.as_ref().and_then(|t| t.get(&key)) {
                series |= ids;
            }
            Arc::clone(&tables.snapshot)
        };

        for version in snapshot.find_readers(key)? {
            series |= decode(&version)?;
        }
        Ok(series)
    }

    /// Union of the series of every key in `keys`
    pub fn get_many(&self, keys: &RoaringBitmap) -> IndexResult<RoaringBitmap> {
        let mut series = RoaringBitmap::new();
        for key in keys {
            series |= self.get(key)?;
        }
        Ok(series)
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
        let mut buf = Vec::new();
        for key in &keys {
            buf.clear();
            immutable[key].serialize_into(&mut buf)?;
            flusher.prepare(*key)?;
            flusher.write(&buf)?;
            flusher.commit()?;
        }
        flusher.close()?;

        let snapshot = self.family.get_snapshot();
        {
            let mut tables = self.tables.write();
            tables.snapshot = snapshot;
            tables.immutable = None;
        }
        tracing::debug!("Flushed {} keys of inverted index {}", keys.len(), self.name);
        Ok(())
    }
}

fn decode(data: &[u8]) -> IndexResult<RoaringBitmap> {
    RoaringBitmap::deserialize_from(data)
        .map_err(|e| IndexError::Corruption(format!("inverted entry: {}", e)))
}

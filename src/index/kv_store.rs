//! Bucketed key → id store
//!
//! Maps `(bucket, key)` to a `u32` id, creating ids on demand through a
//! caller-supplied allocator. Used for namespaces, metric names, tag values and
//! series (tag hash → series id).
//!
//! # Layers
//!
//! ```text
//! read:  mutable ──► immutable ──► bucket cache ──► family snapshot
//! write: mutable only
//!
//! prepare_flush: mutable ──swap──► immutable, fresh mutable
//! flush:         immutable ──trie per bucket──► family, new snapshot, purge cache
//! ```
//!
//! A key lives in exactly one layer, so reads always merge all of them.

use crate::index::error::{IndexError, IndexResult};
use crate::index::expr::{Matcher, TagFilter};
use crate::index::trie::{TrieBucket, MAX_KEY_LEN};
use crate::kv::{Family, Snapshot};
use moka::sync::Cache;
use parking_lot::{Mutex, RwLock};
use roaring::RoaringBitmap;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

type Bucket = BTreeMap<Vec<u8>, u32>;
type MemTable = HashMap<u32, Bucket>;

/// Decoded persisted versions of one bucket, oldest first
type PersistedBucket = Arc<Vec<TrieBucket>>;

struct Generations {
    mutable: MemTable,
    immutable: Option<Arc<MemTable>>,
    snapshot: Arc<dyn Snapshot>,
    /// Bumped on every successful flush; part of the cache key
    generation: u64,
}

impl Generations {
    fn memory_layers(&self) -> impl Iterator<Item = &MemTable> {
        std::iter::once(&self.mutable).chain(self.immutable.as_deref())
    }

    fn lookup(&self, bucket: u32, key: &[u8]) -> Option<u32> {
        self.memory_layers()
            .find_map(|table| table.get(&bucket).and_then(|b| b.get(key)).copied())
    }
}

/// Bucketed key → id index store
pub struct IndexKvStore {
    name: String,
    family: Arc<dyn Family>,
    tables: RwLock<Generations>,
    cache: Cache<(u64, u32), PersistedBucket>,
    flush_lock: Mutex<()>,
}

impl IndexKvStore {
    pub fn new(name: impl Into<String>, family: Arc<dyn Family>, cache_capacity: u64) -> Self {
        let snapshot = family.get_snapshot();
        Self {
            name: name.into(),
            family,
            tables: RwLock::new(Generations {
                mutable: HashMap::new(),
                immutable: None,
                snapshot,
                generation: 0,
            }),
            cache: Cache::new(cache_capacity),
            flush_lock: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up `key`, creating an id with `create_fn` on a miss.
    ///
    /// `create_fn` runs at most once, under the store's write lock, and must
    /// not call back into this store.
    pub fn get_or_create_value<F>(
        &self,
        bucket: u32,
        key: &[u8],
        create_fn: F,
    ) -> IndexResult<(u32, bool)>
    where
        F: FnOnce() -> IndexResult<u32>,
    {
        if let Some(id) = self.get_value(bucket, key)? {
            return Ok((id, false));
        }
        if key.len() > MAX_KEY_LEN {
            return Err(IndexError::KeyTooLong {
                len: key.len(),
                limit: MAX_KEY_LEN,
            });
        }

        let mut tables = self.tables.write();
        if let Some(id) = tables.lookup(bucket, key) {
            return Ok((id, false));
        }
        let id = create_fn()?;
        tables
            .mutable
            .entry(bucket)
            .or_default()
            .insert(key.to_vec(), id);
        Ok((id, true))
    }

    /// Look up `key` without creating it
    pub fn get_value(&self, bucket: u32, key: &[u8]) -> IndexResult<Option<u32>> {
        let (snapshot, generation) = {
            let tables = self.tables.read();
            if let Some(id) = tables.lookup(bucket, key) {
                return Ok(Some(id));
            }
            (Arc::clone(&tables.snapshot), tables.generation)
        };

        let persisted = self.persisted(&snapshot, generation, bucket)?;
        Ok(persisted.iter().rev().find_map(|trie| trie.get(key)))
    }

    /// Every id in the bucket
    pub fn get_values(&self, bucket: u32) -> IndexResult<RoaringBitmap> {
        let mut ids = RoaringBitmap::new();
        let (snapshot, generation) = {
            let tables = self.tables.read();
            for table in tables.memory_layers() {
                if let Some(b) = table.get(&bucket) {
                    ids.extend(b.values().copied());
                }
            }
            (Arc::clone(&tables.snapshot), tables.generation)
        };

        for trie in self.persisted(&snapshot, generation, bucket)?.iter() {
            ids.extend(trie.iter().map(|(_, id)| id));
        }
        Ok(ids)
    }

    /// Ids of every key in the bucket accepted by `filter`
    pub fn find_values_by_expr(&self, bucket: u32, filter: &TagFilter) -> IndexResult<RoaringBitmap> {
        let matcher = filter.compile()?;
        let mut ids = RoaringBitmap::new();
        if matcher.is_nothing() {
            return Ok(ids);
        }

        let (snapshot, generation) = {
            let tables = self.tables.read();
            for table in tables.memory_layers() {
                if let Some(b) = table.get(&bucket) {
                    find_in_bucket(b, &matcher, &mut ids);
                }
            }
            (Arc::clone(&tables.snapshot), tables.generation)
        };

        for trie in self.persisted(&snapshot, generation, bucket)?.iter() {
            ids.extend(trie.find(&matcher));
        }
        Ok(ids)
    }

    /// Resolve ids back to their keys, stopping once every id is found
    pub fn collect_kvs(
        &self,
        bucket: u32,
        ids: &RoaringBitmap,
        out: &mut HashMap<u32, String>,
    ) -> IndexResult<()> {
        let mut remaining = ids.clone();
        if remaining.is_empty() {
            return Ok(());
        }

        let (snapshot, generation) = {
            let tables = self.tables.read();
            for table in tables.memory_layers() {
                if let Some(b) = table.get(&bucket) {
                    for (key, id) in b {
                        if remaining.remove(*id) {
                            out.insert(*id, String::from_utf8_lossy(key).into_owned());
                            if remaining.is_empty() {
                                return Ok(());
                            }
                        }
                    }
                }
            }
            (Arc::clone(&tables.snapshot), tables.generation)
        };

        for trie in self.persisted(&snapshot, generation, bucket)?.iter() {
            for (key, id) in trie.iter() {
                if remaining.remove(id) {
                    out.insert(id, String::from_utf8_lossy(key).into_owned());
                    if remaining.is_empty() {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    /// Keys starting with `prefix`, sorted, at most `limit`
    pub fn suggest(&self, bucket: u32, prefix: &str, limit: usize) -> IndexResult<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let prefix = prefix.as_bytes();
        let mut keys: BTreeSet<Vec<u8>> = BTreeSet::new();

        let (snapshot, generation) = {
            let tables = self.tables.read();
            for table in tables.memory_layers() {
                if let Some(b) = table.get(&bucket) {
                    keys.extend(
                        b.range(prefix.to_vec()..)
                            .take_while(|(k, _)| k.starts_with(prefix))
                            .take(limit)
                            .map(|(k, _)| k.clone()),
                    );
                }
            }
            (Arc::clone(&tables.snapshot), tables.generation)
        };

        for trie in self.persisted(&snapshot, generation, bucket)?.iter() {
            keys.extend(trie.prefix_iter(prefix).take(limit).map(|(k, _)| k.to_vec()));
        }

        Ok(keys
            .into_iter()
            .take(limit)
            .map(|k| String::from_utf8_lossy(&k).into_owned())
            .collect())
    }

    /// Swap mutable into immutable. Returns false if a flush is already pending.
    pub fn prepare_flush(&self) -> bool {
        let mut tables = self.tables.write();
        if tables.immutable.is_some() {
            return false;
        }
        let mutable = std::mem::take(&mut tables.mutable);
        tables.immutable = Some(Arc::new(mutable));
        true
    }

    /// Write the immutable table to the family.
    ///
    /// No-op without a pending immutable table. On error the immutable table is
    /// kept so the flush can be retried.
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

        let mut buckets: Vec<(&u32, &Bucket)> = immutable.iter().collect();
        buckets.sort_by_key(|(bucket, _)| **bucket);

        let mut flusher = self.family.new_flusher();
        for (bucket, entries) in &buckets {
            flusher.prepare(**bucket)?;
            flusher.write(&TrieBucket::encode(entries))?;
            flusher.commit()?;
        }
        flusher.close()?;

        let snapshot = self.family.get_snapshot();
        {
            let mut tables = self.tables.write();
            tables.snapshot = snapshot;
            tables.generation += 1;
            tables.immutable = None;
        }
        self.cache.invalidate_all();

        tracing::debug!("Flushed {} buckets of index store {}", buckets.len(), self.name);
        Ok(())
    }

    /// Whether an immutable table is waiting to be flushed
    pub fn has_pending_flush(&self) -> bool {
        self.tables.read().immutable.is_some()
    }

    fn persisted(
        &self,
        snapshot: &Arc<dyn Snapshot>,
        generation: u64,
        bucket: u32,
    ) -> IndexResult<PersistedBucket> {
        if let Some(cached) = self.cache.get(&(generation, bucket)) {
            return Ok(cached);
        }

        let mut versions = Vec::new();
        for value in snapshot.find_readers(bucket)? {
            versions.push(TrieBucket::decode(&value)?);
        }
        let versions = Arc::new(versions);
        self.cache.insert((generation, bucket), Arc::clone(&versions));
        Ok(versions)
    }
}

fn find_in_bucket(bucket: &Bucket, matcher: &Matcher, out: &mut RoaringBitmap) {
    match matcher.literal_prefix() {
        Some(prefix) => {
            for (key, id) in bucket
                .range(prefix.to_vec()..)
                .take_while(|(k, _)| k.starts_with(prefix))
            {
                if matcher.matches(key) {
                    out.insert(*id);
                }
            }
        }
        None => {
            for (key, id) in bucket {
                if matcher.matches(key) {
                    out.insert(*id);
                }
            }
        }
    }
}

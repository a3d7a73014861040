//! Metric schema store
//!
//! Keeps, per metric id, the ordered list of fields and tag keys ever written
//! for that metric. Lists are append-only and capped at [`MAX_FIELDS`] /
//! [`MAX_TAG_KEYS`].
//!
//! Schemas that were touched since the last flush live in memory. A flush
//! persists only the entries not yet written, so each persisted version of a
//! metric holds a delta; loading concatenates the versions oldest first.
//!
//! Persisted layout per version (little-endian):
//!
//! ```text
//! field_count: u16
//!   id: u8, type: u8, name_len: u16, name
//! tag_key_count: u16
//!   id: u32, key_len: u16, key
//! ```

use crate::index::codec::Reader;
use crate::index::error::{IndexError, IndexResult};
use crate::kv::{Family, Snapshot};
use moka::sync::Cache;
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Fields per metric
pub const MAX_FIELDS: usize = 255;
/// Tag keys per metric
pub const MAX_TAG_KEYS: usize = 255;

const MAX_NAME_LEN: usize = u16::MAX as usize;

/// Aggregation type of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FieldType {
    Sum = 1,
    Min = 2,
    Max = 3,
    Last = 4,
    First = 5,
    Histogram = 6,
}

impl TryFrom<u8> for FieldType {
    type Error = IndexError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FieldType::Sum),
            2 => Ok(FieldType::Min),
            3 => Ok(FieldType::Max),
            4 => Ok(FieldType::Last),
            5 => Ok(FieldType::First),
            6 => Ok(FieldType::Histogram),
            other => Err(IndexError::Corruption(format!("unknown field type {}", other))),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Sum => "sum",
            FieldType::Min => "min",
            FieldType::Max => "max",
            FieldType::Last => "last",
            FieldType::First => "first",
            FieldType::Histogram => "histogram",
        };
        f.write_str(name)
    }
}

impl FromStr for FieldType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sum" => Ok(FieldType::Sum),
            "min" => Ok(FieldType::Min),
            "max" => Ok(FieldType::Max),
            "last" => Ok(FieldType::Last),
            "first" => Ok(FieldType::First),
            "histogram" => Ok(FieldType::Histogram),
            other => Err(format!("unknown field type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMeta {
    pub name: String,
    pub field_type: FieldType,
    pub id: u8,
    persisted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagKeyMeta {
    pub key: String,
    pub id: u32,
    persisted: bool,
}

/// Fields and tag keys of one metric, in insertion order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricSchema {
    pub fields: Vec<FieldMeta>,
    pub tag_keys: Vec<TagKeyMeta>,
}

impl MetricSchema {
    pub fn find_field(&self, name: &str) -> Option<&FieldMeta> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn find_tag_key(&self, key: &str) -> Option<&TagKeyMeta> {
        self.tag_keys.iter().find(|t| t.key == key)
    }

    /// True if any entry has not been persisted yet
    pub fn need_write(&self) -> bool {
        self.fields.iter().any(|f| !f.persisted) || self.tag_keys.iter().any(|t| !t.persisted)
    }

    fn unpersisted(&self) -> MetricSchema {
        MetricSchema {
            fields: self.fields.iter().filter(|f| !f.persisted).cloned().collect(),
            tag_keys: self.tag_keys.iter().filter(|t| !t.persisted).cloned().collect(),
        }
    }

    fn mark_persisted(&mut self, written: &MetricSchema) {
        for field in self.fields.iter_mut() {
            if written.find_field(&field.name).is_some() {
                field.persisted = true;
            }
        }
        for tag_key in self.tag_keys.iter_mut() {
            if written.find_tag_key(&tag_key.key).is_some() {
                tag_key.persisted = true;
            }
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.fields.len() as u16).to_le_bytes());
        for field in &self.fields {
            buf.push(field.id);
            buf.push(field.field_type as u8);
            buf.extend_from_slice(&(field.name.len() as u16).to_le_bytes());
            buf.extend_from_slice(field.name.as_bytes());
        }
        buf.extend_from_slice(&(self.tag_keys.len() as u16).to_le_bytes());
        for tag_key in &self.tag_keys {
            buf.extend_from_slice(&tag_key.id.to_le_bytes());
            buf.extend_from_slice(&(tag_key.key.len() as u16).to_le_bytes());
            buf.extend_from_slice(tag_key.key.as_bytes());
        }
        buf
    }

    /// Append one persisted version
    fn decode_into(&mut self, data: &[u8]) -> IndexResult<()> {
        let mut reader = Reader::new(data, "schema");

        let field_count = reader.u16()?;
        for _ in 0..field_count {
            let id = reader.u8()?;
            let field_type = FieldType::try_from(reader.u8()?)?;
            let name = reader.string()?;
            self.fields.push(FieldMeta {
                name,
                field_type,
                id,
                persisted: true,
            });
        }

        let tag_key_count = reader.u16()?;
        for _ in 0..tag_key_count {
            let id = reader.u32()?;
            let key = reader.string()?;
            self.tag_keys.push(TagKeyMeta {
                key,
                id,
                persisted: true,
            });
        }
        Ok(())
    }
}

struct SchemaState {
    /// Schemas touched since they were last fully persisted
    live: HashMap<u32, MetricSchema>,
    /// Unpersisted deltas captured by `prepare_flush`
    pending: Option<Arc<Vec<(u32, MetricSchema)>>>,
    snapshot: Arc<dyn Snapshot>,
    generation: u64,
}

/// `metric id → schema` store
pub struct MetricSchemaStore {
    family: Arc<dyn Family>,
    state: RwLock<SchemaState>,
    cache: Cache<(u64, u32), Arc<MetricSchema>>,
    flush_lock: Mutex<()>,
}

impl MetricSchemaStore {
    pub fn new(family: Arc<dyn Family>, cache_capacity: u64) -> Self {
        let snapshot = family.get_snapshot();
        Self {
            family,
            state: RwLock::new(SchemaState {
                live: HashMap::new(),
                pending: None,
                snapshot,
                generation: 0,
            }),
            cache: Cache::new(cache_capacity),
            flush_lock: Mutex::new(()),
        }
    }

    /// Schema of a metric, if anything was ever registered for it
    pub fn get_schema(&self, metric_id: u32) -> IndexResult<Option<MetricSchema>> {
        let (snapshot, generation) = {
            let state = self.state.read();
            if let Some(schema) = state.live.get(&metric_id) {
                return Ok(Some(schema.clone()));
            }
            (Arc::clone(&state.snapshot), state.generation)
        };

        Ok(self
            .persisted(&snapshot, generation, metric_id)?
            .map(|schema| schema.as_ref().clone()))
    }

    /// Field id for `name`, appending the field if it is new.
    ///
    /// Field ids are assigned sequentially from 1.
    pub fn gen_field_id(&self, metric_id: u32, name: &str, field_type: FieldType) -> IndexResult<u8> {
        check_name(name)?;
        let mut state = self.lock_live(metric_id)?;
        let schema = state.live.entry(metric_id).or_default();

        if let Some(field) = schema.find_field(name) {
            if field.field_type != field_type {
                return Err(IndexError::FieldTypeMismatch {
                    name: name.to_string(),
                    existing: field.field_type.to_string(),
                    requested: field_type.to_string(),
                });
            }
            return Ok(field.id);
        }
        if schema.fields.len() >= MAX_FIELDS {
            return Err(IndexError::TooManyFields {
                metric_id,
                limit: MAX_FIELDS,
            });
        }

        let id = schema.fields.len() as u8 + 1;
        schema.fields.push(FieldMeta {
            name: name.to_string(),
            field_type,
            id,
            persisted: false,
        });
        Ok(id)
    }

    /// Tag key id for `tag_key`, allocating one with `create_fn` if it is new
    pub fn gen_tag_key_id<F>(&self, metric_id: u32, tag_key: &str, create_fn: F) -> IndexResult<u32>
    where
        F: FnOnce() -> IndexResult<u32>,
    {
        check_name(tag_key)?;
        let mut state = self.lock_live(metric_id)?;
        let schema = state.live.entry(metric_id).or_default();

        if let Some(meta) = schema.find_tag_key(tag_key) {
            return Ok(meta.id);
        }
        if schema.tag_keys.len() >= MAX_TAG_KEYS {
            return Err(IndexError::TooManyTagKeys {
                metric_id,
                limit: MAX_TAG_KEYS,
            });
        }

        let id = match create_fn() {
            Ok(id) => id,
            Err(e) => {
                if schema.fields.is_empty() && schema.tag_keys.is_empty() {
                    state.live.remove(&metric_id);
                }
                return Err(e);
            }
        };
        schema.tag_keys.push(TagKeyMeta {
            key: tag_key.to_string(),
            id,
            persisted: false,
        });
        Ok(id)
    }

    pub fn get_tag_key_id(&self, metric_id: u32, tag_key: &str) -> IndexResult<Option<u32>> {
        Ok(self
            .get_schema(metric_id)?
            .and_then(|schema| schema.find_tag_key(tag_key).map(|t| t.id)))
    }

    /// Tag keys of a metric starting with `prefix`, sorted, at most `limit`
    pub fn suggest_tag_keys(&self, metric_id: u32, prefix: &str, limit: usize) -> IndexResult<Vec<String>> {
        let schema = match self.get_schema(metric_id)? {
            Some(schema) => schema,
            None => return Ok(Vec::new()),
        };
        let keys: BTreeSet<String> = schema
            .tag_keys
            .into_iter()
            .filter(|t| t.key.starts_with(prefix))
            .map(|t| t.key)
            .collect();
        Ok(keys.into_iter().take(limit).collect())
    }

    /// Capture unpersisted entries. Returns false if a flush is already pending.
    pub fn prepare_flush(&self) -> bool {
        let mut state = self.state.write();
        if state.pending.is_some() {
            return false;
        }
        let mut deltas: Vec<(u32, MetricSchema)> = state
            .live
            .iter()
            .filter(|(_, schema)| schema.need_write())
            .map(|(id, schema)| (*id, schema.unpersisted()))
            .collect();
        deltas.sort_by_key(|(id, _)| *id);
        state.pending = Some(Arc::new(deltas));
        true
    }

    /// Write captured entries; on error they stay pending for a retry
    pub fn flush(&self) -> IndexResult<()> {
        let _guard = self.flush_lock.lock();

        let pending = match self.state.read().pending.clone() {
            Some(pending) => pending,
            None => return Ok(()),
        };
        if pending.is_empty() {
            self.state.write().pending = None;
            return Ok(());
        }

        let mut flusher = self.family.new_flusher();
        for (metric_id, delta) in pending.iter() {
            flusher.prepare(*metric_id)?;
            flusher.write(&delta.encode())?;
            flusher.commit()?;
        }
        flusher.close()?;

        let snapshot = self.family.get_snapshot();
        {
            let mut state = self.state.write();
            for (metric_id, delta) in pending.iter() {
                let fully_persisted = match state.live.get_mut(metric_id) {
                    Some(schema) => {
                        schema.mark_persisted(delta);
                        !schema.need_write()
                    }
                    None => false,
                };
                // served from the new snapshot from now on
                if fully_persisted {
                    state.live.remove(metric_id);
                }
            }
            state.snapshot = snapshot;
            state.generation += 1;
            state.pending = None;
        }
        self.cache.invalidate_all();

        tracing::debug!("Flushed {} metric schemas", pending.len());
        Ok(())
    }

    /// Write lock with the metric's schema either in `live` or absent from
    /// the current snapshot.
    ///
    /// A flush may evict a fully persisted schema between loading and
    /// locking; the generation check catches that and loads again.
    fn lock_live(&self, metric_id: u32) -> IndexResult<RwLockWriteGuard<'_, SchemaState>> {
        loop {
            let generation = self.load_for_write(metric_id)?;
            let state = self.state.write();
            if state.live.contains_key(&metric_id) || state.generation == generation {
                return Ok(state);
            }
            tracing::trace!("Schema of metric {} evicted by a flush, reloading", metric_id);
        }
    }

    /// Copy the persisted schema into `live`. Returns the generation it was
    /// checked against.
    fn load_for_write(&self, metric_id: u32) -> IndexResult<u64> {
        let (snapshot, generation) = {
            let state = self.state.read();
            if state.live.contains_key(&metric_id) {
                return Ok(state.generation);
            }
            (Arc::clone(&state.snapshot), state.generation)
        };

        if let Some(schema) = self.persisted(&snapshot, generation, metric_id)? {
            let mut state = self.state.write();
            if state.generation == generation {
                state
                    .live
                    .entry(metric_id)
                    .or_insert_with(|| schema.as_ref().clone());
            }
        }
        Ok(generation)
    }

    fn persisted(
        &self,
        snapshot: &Arc<dyn Snapshot>,
        generation: u64,
        metric_id: u32,
    ) -> IndexResult<Option<Arc<MetricSchema>>> {
        if let Some(schema) = self.cache.get(&(generation, metric_id)) {
            return Ok(Some(schema));
        }

        let versions = snapshot.find_readers(metric_id)?;
        if versions.is_empty() {
            return Ok(None);
        }
        let mut schema = MetricSchema::default();
        for version in versions {
            schema.decode_into(&version)?;
        }
        let schema = Arc::new(schema);
        self.cache.insert((generation, metric_id), Arc::clone(&schema));
        Ok(Some(schema))
    }
}

fn check_name(name: &str) -> IndexResult<()> {
    if name.len() > MAX_NAME_LEN {
        return Err(IndexError::KeyTooLong {
            len: name.len(),
            limit: MAX_NAME_LEN,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{KvFamily, MergePolicy};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn create_test_store() -> (MetricSchemaStore, KvFamily) {
        let family = KvFamily::memory("schema", MergePolicy::Schema);
        let store = MetricSchemaStore::new(Arc::new(family.clone()), 16);
        (store, family)
    }

    fn flush(store: &MetricSchemaStore) {
        assert!(store.prepare_flush());
        store.flush().unwrap();
    }

    #[test]
    fn test_field_ids_sequential_and_stable() {
        let (store, _family) = create_test_store();

        assert_eq!(store.gen_field_id(1, "usage", FieldType::Sum).unwrap(), 1);
        assert_eq!(store.gen_field_id(1, "load", FieldType::Last).unwrap(), 2);
        assert_eq!(store.gen_field_id(1, "usage", FieldType::Sum).unwrap(), 1);

        // per metric
        assert_eq!(store.gen_field_id(2, "load", FieldType::Last).unwrap(), 1);
    }

    #[test]
    fn test_field_type_mismatch() {
        let (store, _family) = create_test_store();
        store.gen_field_id(1, "usage", FieldType::Sum).unwrap();

        let err = store.gen_field_id(1, "usage", FieldType::Max).unwrap_err();
        assert!(matches!(err, IndexError::FieldTypeMismatch { .. }));
    }

    #[test]
    fn test_field_capacity() {
        let (store, _family) = create_test_store();
        for i in 0..MAX_FIELDS {
            store
                .gen_field_id(7, &format!("f{}", i), FieldType::Sum)
                .unwrap();
        }

        let err = store.gen_field_id(7, "one-too-many", FieldType::Sum).unwrap_err();
        assert!(matches!(err, IndexError::TooManyFields { metric_id: 7, .. }));
        assert_eq!(store.get_schema(7).unwrap().unwrap().fields.len(), MAX_FIELDS);

        // existing names still resolve at capacity
        assert_eq!(store.gen_field_id(7, "f254", FieldType::Sum).unwrap(), 255);
    }

    #[test]
    fn test_tag_key_capacity() {
        let (store, _family) = create_test_store();
        let next = AtomicU32::new(0);
        let create = || Ok(next.fetch_add(1, Ordering::SeqCst));

        for i in 0..MAX_TAG_KEYS {
            store.gen_tag_key_id(3, &format!("k{}", i), create).unwrap();
        }
        let err = store.gen_tag_key_id(3, "overflow", create).unwrap_err();
        assert!(matches!(err, IndexError::TooManyTagKeys { metric_id: 3, .. }));
        assert_eq!(store.get_schema(3).unwrap().unwrap().tag_keys.len(), MAX_TAG_KEYS);
        // allocator untouched by the failed call
        assert_eq!(next.load(Ordering::SeqCst), MAX_TAG_KEYS as u32);
    }

    #[test]
    fn test_tag_key_create_fn_once() {
        let (store, _family) = create_test_store();
        let calls = AtomicU32::new(0);
        let create = || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(42)
        };

        assert_eq!(store.gen_tag_key_id(1, "host", create).unwrap(), 42);
        assert_eq!(store.gen_tag_key_id(1, "host", create).unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.get_tag_key_id(1, "host").unwrap(), Some(42));
        assert_eq!(store.get_tag_key_id(1, "zone").unwrap(), None);
    }

    #[test]
    fn test_flush_writes_deltas_and_reloads() {
        let (store, family) = create_test_store();

        store.gen_field_id(1, "usage", FieldType::Sum).unwrap();
        store.gen_tag_key_id(1, "host", || Ok(10)).unwrap();
        flush(&store);
        assert_eq!(family.version_count(), 1);

        // append after the first flush: only the delta is written
        store.gen_field_id(1, "load", FieldType::Last).unwrap();
        store.gen_tag_key_id(1, "zone", || Ok(11)).unwrap();
        flush(&store);
        assert_eq!(family.version_count(), 2);

        // nothing new: no version
        flush(&store);
        assert_eq!(family.version_count(), 2);

        let reopened = MetricSchemaStore::new(Arc::new(family.clone()), 16);
        let schema = reopened.get_schema(1).unwrap().unwrap();
        let fields: Vec<_> = schema.fields.iter().map(|f| (f.name.as_str(), f.id)).collect();
        assert_eq!(fields, vec![("usage", 1), ("load", 2)]);
        let keys: Vec<_> = schema.tag_keys.iter().map(|t| (t.key.as_str(), t.id)).collect();
        assert_eq!(keys, vec![("host", 10), ("zone", 11)]);
        assert!(!schema.need_write());

        // appending to a reloaded schema continues the id sequence
        assert_eq!(reopened.gen_field_id(1, "peak", FieldType::Max).unwrap(), 3);
    }

    #[test]
    fn test_append_during_flush_stays_unpersisted() {
        let (store, family) = create_test_store();

        store.gen_field_id(1, "a", FieldType::Sum).unwrap();
        assert!(store.prepare_flush());
        store.gen_field_id(1, "b", FieldType::Sum).unwrap();
        store.flush().unwrap();

        let schema = store.get_schema(1).unwrap().unwrap();
        assert!(schema.need_write());

        flush(&store);
        assert_eq!(family.version_count(), 2);
        let reopened = MetricSchemaStore::new(Arc::new(family), 16);
        assert_eq!(reopened.get_schema(1).unwrap().unwrap().fields.len(), 2);
    }

    #[test]
    fn test_ids_stable_while_flushing_concurrently() {
        let (store, family) = create_test_store();
        let next = AtomicU32::new(0);
        let create = || Ok(next.fetch_add(1, Ordering::SeqCst));

        let host = store.gen_tag_key_id(1, "host", create).unwrap();
        let usage = store.gen_field_id(1, "usage", FieldType::Sum).unwrap();
        flush(&store);

        let done = std::sync::atomic::AtomicBool::new(false);
        std::thread::scope(|s| {
            s.spawn(|| {
                while !done.load(Ordering::SeqCst) {
                    store.prepare_flush();
                    store.flush().unwrap();
                }
            });

            for i in 0..2000 {
                store.gen_tag_key_id(1, &format!("k{}", i % 200), create).unwrap();
                assert_eq!(store.gen_tag_key_id(1, "host", create).unwrap(), host);
                assert_eq!(store.gen_field_id(1, "usage", FieldType::Sum).unwrap(), usage);
            }
            done.store(true, Ordering::SeqCst);
        });
        flush(&store);

        // one allocation per distinct key
        assert_eq!(next.load(Ordering::SeqCst), 201);
        let reopened = MetricSchemaStore::new(Arc::new(family), 16);
        let schema = reopened.get_schema(1).unwrap().unwrap();
        assert_eq!(schema.tag_keys.len(), 201);
        assert_eq!(schema.tag_keys.iter().filter(|t| t.key == "host").count(), 1);
        assert_eq!(schema.fields.len(), 1);
    }

    #[test]
    fn test_suggest_tag_keys() {
        let (store, _family) = create_test_store();
        for (i, key) in ["zone", "host", "hostname", "region"].iter().enumerate() {
            store.gen_tag_key_id(1, key, || Ok(i as u32)).unwrap();
        }

        assert_eq!(store.suggest_tag_keys(1, "ho", 10).unwrap(), vec!["host", "hostname"]);
        assert_eq!(store.suggest_tag_keys(1, "", 2).unwrap(), vec!["host", "hostname"]);
        assert!(store.suggest_tag_keys(99, "", 10).unwrap().is_empty());
    }

    #[test]
    fn test_missing_schema() {
        let (store, _family) = create_test_store();
        assert!(store.get_schema(5).unwrap().is_none());
    }

    #[test]
    fn test_field_type_parse() {
        assert_eq!("SUM".parse::<FieldType>().unwrap(), FieldType::Sum);
        assert_eq!(FieldType::try_from(6).unwrap(), FieldType::Histogram);
        assert!(FieldType::try_from(0).is_err());
        assert!("avg".parse::<FieldType>().is_err());
    }
}

//! Bundled family implementation
//!
//! A [`KvFamily`] keeps every published version as an immutable in-memory
//! table. When opened on a directory, each version is also written as a table
//! file and reloaded on the next open.
//!
//! Table file layout:
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ HEADER (11 bytes)                       │
//! │   magic: [u8; 4] = "TSKV"               │
//! │   version: u16                          │
//! │   compression: u8                       │
//! │   entry_count: u32                      │
//! ├─────────────────────────────────────────┤
//! │ ENTRIES (ascending key)                 │
//! │   key: u32                              │
//! │   len: u32                              │
//! │   payload: [u8; len]                    │
//! │   crc: u32 (CRC32 of key + len + data)  │
//! └─────────────────────────────────────────┘
//! ```

use crate::kv::compression::{compress, decompress, CompressionType};
use crate::kv::error::{KvError, KvResult};
use crate::kv::{Family, Flusher, MergePolicy, Snapshot};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Magic bytes for table file identification
const TABLE_MAGIC: [u8; 4] = *b"TSKV";

/// Current table format version
const TABLE_VERSION: u16 = 1;

/// Header size in bytes
const HEADER_SIZE: usize = 11;

/// Table file extension
const TABLE_EXT: &str = "sst";

/// One published version of a family
#[derive(Debug)]
struct Table {
    file_id: u64,
    entries: BTreeMap<u32, Arc<[u8]>>,
}

struct FamilyState {
    versions: Vec<Arc<Table>>,
    next_file_id: u64,
}

struct FamilyInner {
    name: String,
    policy: MergePolicy,
    dir: Option<PathBuf>,
    compression: CompressionType,
    state: RwLock<FamilyState>,
}

/// Key-value family with immutable published versions
#[derive(Clone)]
pub struct KvFamily {
    inner: Arc<FamilyInner>,
}

impl KvFamily {
    /// Create a family that only lives in memory
    pub fn memory(name: impl Into<String>, policy: MergePolicy) -> Self {
        Self {
            inner: Arc::new(FamilyInner {
                name: name.into(),
                policy,
                dir: None,
                compression: CompressionType::None,
                state: RwLock::new(FamilyState {
                    versions: Vec::new(),
                    next_file_id: 1,
                }),
            }),
        }
    }

    /// Open (or create) a family stored under `dir`, loading existing table files
    pub fn open(
        dir: impl AsRef<Path>,
        name: impl Into<String>,
        policy: MergePolicy,
        compression: CompressionType,
    ) -> KvResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut files = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == TABLE_EXT).unwrap_or(false) {
                match Self::parse_file_id(&path) {
                    Some(id) => files.push((id, path)),
                    None => tracing::warn!("Ignoring unrecognised table file {:?}", path),
                }
            }
        }
        files.sort_by_key(|(id, _)| *id);

        let mut versions = Vec::with_capacity(files.len());
        let mut max_id = 0u64;
        for (file_id, path) in files {
            let entries = Self::read_table(&path)?;
            max_id = max_id.max(file_id);
            versions.push(Arc::new(Table { file_id, entries }));
        }

        let name = name.into();
        tracing::debug!(
            "Opened family {} with {} versions from {:?}",
            name,
            versions.len(),
            dir
        );

        Ok(Self {
            inner: Arc::new(FamilyInner {
                name,
                policy,
                dir: Some(dir),
                compression,
                state: RwLock::new(FamilyState {
                    versions,
                    next_file_id: max_id + 1,
                }),
            }),
        })
    }

    /// Number of published versions
    pub fn version_count(&self) -> usize {
        self.inner.state.read().versions.len()
    }

    /// Directory backing this family, if any
    pub fn dir(&self) -> Option<&Path> {
        self.inner.dir.as_deref()
    }

    fn parse_file_id(path: &Path) -> Option<u64> {
        path.file_stem()?.to_str()?.parse().ok()
    }

    fn table_path(dir: &Path, file_id: u64) -> PathBuf {
        dir.join(format!("{:06}.{}", file_id, TABLE_EXT))
    }

    fn read_table(path: &Path) -> KvResult<BTreeMap<u32, Arc<[u8]>>> {
        let data = std::fs::read(path)?;
        if data.len() < HEADER_SIZE {
            return Err(KvError::Corruption(format!(
                "Table {:?} shorter than header",
                path
            )));
        }
        if data[0..4] != TABLE_MAGIC {
            return Err(KvError::Corruption(format!("Invalid magic in {:?}", path)));
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version != TABLE_VERSION {
            return Err(KvError::Corruption(format!(
                "Unsupported table version {} in {:?}",
                version, path
            )));
        }
        let compression = CompressionType::try_from(data[6])?;
        let count = read_u32(&data, 7)? as usize;

        let mut entries = BTreeMap::new();
        let mut pos = HEADER_SIZE;
        for _ in 0..count {
            let key = read_u32(&data, pos)?;
            let len = read_u32(&data, pos + 4)? as usize;
            let payload_end = pos + 8 + len;
            if payload_end + 4 > data.len() {
                return Err(KvError::Corruption(format!(
                    "Truncated entry for key {} in {:?}",
                    key, path
                )));
            }
            let crc = read_u32(&data, payload_end)?;
            if crc32fast::hash(&data[pos..payload_end]) != crc {
                return Err(KvError::Corruption(format!(
                    "Checksum mismatch for key {} in {:?}",
                    key, path
                )));
            }
            let payload = decompress(compression, &data[pos + 8..payload_end])?;
            entries.insert(key, Arc::from(payload));
            pos = payload_end + 4;
        }

        Ok(entries)
    }

    fn write_table(
        path: &Path,
        compression: CompressionType,
        entries: &BTreeMap<u32, Arc<[u8]>>,
    ) -> KvResult<()> {
        let tmp_path = path.with_extension("tmp");
        {
            let file = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(file);

            writer.write_all(&TABLE_MAGIC)?;
            writer.write_all(&TABLE_VERSION.to_le_bytes())?;
            writer.write_all(&[compression as u8])?;
            writer.write_all(&(entries.len() as u32).to_le_bytes())?;

            for (key, value) in entries {
                let payload = compress(compression, value);
                let mut hasher = crc32fast::Hasher::new();
                hasher.update(&key.to_le_bytes());
                hasher.update(&(payload.len() as u32).to_le_bytes());
                hasher.update(&payload);

                writer.write_all(&key.to_le_bytes())?;
                writer.write_all(&(payload.len() as u32).to_le_bytes())?;
                writer.write_all(&payload)?;
                writer.write_all(&hasher.finalize().to_le_bytes())?;
            }

            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

impl FamilyInner {
    fn publish(&self, entries: BTreeMap<u32, Arc<[u8]>>) -> KvResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut state = self.state.write();
        let file_id = state.next_file_id;

        if let Some(dir) = &self.dir {
            KvFamily::write_table(&KvFamily::table_path(dir, file_id), self.compression, &entries)?;
        }

        tracing::debug!(
            "Family {} published version {} with {} entries",
            self.name,
            file_id,
            entries.len()
        );

        state.next_file_id += 1;
        state.versions.push(Arc::new(Table { file_id, entries }));
        Ok(())
    }
}

fn read_u32(data: &[u8], pos: usize) -> KvResult<u32> {
    data.get(pos..pos + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| KvError::Corruption(format!("Unexpected end of table at {}", pos)))
}

impl Family for KvFamily {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn merge_policy(&self) -> MergePolicy {
        self.inner.policy
    }

    fn new_flusher(&self) -> Box<dyn Flusher> {
        Box::new(KvFlusher {
            family: Arc::clone(&self.inner),
            entries: BTreeMap::new(),
            current: None,
        })
    }

    fn get_snapshot(&self) -> Arc<dyn Snapshot> {
        let state = self.inner.state.read();
        Arc::new(KvSnapshot {
            versions: state.versions.clone(),
        })
    }
}

/// Immutable view over the versions published at snapshot time
struct KvSnapshot {
    versions: Vec<Arc<Table>>,
}

impl Snapshot for KvSnapshot {
    fn find_readers(&self, key: u32) -> KvResult<Vec<Arc<[u8]>>> {
        Ok(self
            .versions
            .iter()
            .filter_map(|table| table.entries.get(&key).cloned())
            .collect())
    }
}

impl std::fmt::Debug for KvSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<u64> = self.versions.iter().map(|t| t.file_id).collect();
        f.debug_struct("KvSnapshot").field("versions", &ids).finish()
    }
}

struct KvFlusher {
    family: Arc<FamilyInner>,
    entries: BTreeMap<u32, Arc<[u8]>>,
    current: Option<(u32, Vec<u8>)>,
}

impl Flusher for KvFlusher {
    fn prepare(&mut self, key: u32) -> KvResult<()> {
        if let Some((pending, _)) = &self.current {
            return Err(KvError::Flusher(format!(
                "prepare({}) while key {} is uncommitted",
                key, pending
            )));
        }
        if self.entries.contains_key(&key) {
            return Err(KvError::Flusher(format!("key {} already committed", key)));
        }
        self.current = Some((key, Vec::new()));
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> KvResult<()> {
        match &mut self.current {
            Some((_, buf)) => {
                buf.extend_from_slice(data);
                Ok(())
            }
            None => Err(KvError::Flusher("write before prepare".to_string())),
        }
    }

    fn commit(&mut self) -> KvResult<()> {
        let (key, buf) = self
            .current
            .take()
            .ok_or_else(|| KvError::Flusher("commit before prepare".to_string()))?;
        self.entries.insert(key, Arc::from(buf));
        Ok(())
    }

    fn close(self: Box<Self>) -> KvResult<()> {
        if let Some((key, _)) = &self.current {
            return Err(KvError::Flusher(format!(
                "close with uncommitted key {}",
                key
            )));
        }
        let KvFlusher {
            family, entries, ..
        } = *self;
        family.publish(entries)
    }
}

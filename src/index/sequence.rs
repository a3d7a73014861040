//! Sequence allocator for namespace, metric, tag-key and tag-value ids
//!
//! Four independent monotonic `u32` counters persisted in a fixed 16-byte
//! memory-mapped file:
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────┬──────────────┐
//! │ namespace    │ metric name  │ tag key      │ tag value    │
//! │ u32 LE       │ u32 LE       │ u32 LE       │ u32 LE       │
//! └──────────────┴──────────────┴──────────────┴──────────────┘
//! ```
//!
//! Counters live in atomics; the mapped region is only written on [`Sequence::sync`].
//! After a crash the counters restart from the last synced values.

use crate::index::error::{IndexError, IndexResult};
use memmap2::MmapMut;
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

/// Size of the sequence file in bytes
pub const SEQUENCE_FILE_SIZE: usize = 16;

const NAMESPACE_OFFSET: usize = 0;
const METRIC_OFFSET: usize = 4;
const TAG_KEY_OFFSET: usize = 8;
const TAG_VALUE_OFFSET: usize = 12;

/// Persisted id allocator
pub struct Sequence {
    path: PathBuf,
    mmap: Mutex<Option<MmapMut>>,
    namespace: AtomicU32,
    metric: AtomicU32,
    tag_key: AtomicU32,
    tag_value: AtomicU32,
}

impl Sequence {
    /// Open or create the sequence file at `path`
    pub fn open(path: impl AsRef<Path>) -> IndexResult<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let len = file.metadata()?.len();
        if len < SEQUENCE_FILE_SIZE as u64 {
            file.set_len(SEQUENCE_FILE_SIZE as u64)?;
        }

        // SAFETY: the file is owned by this sequence for its whole lifetime and
        // is never truncated while mapped.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        if mmap.len() < SEQUENCE_FILE_SIZE {
            return Err(IndexError::Corruption(format!(
                "Sequence file {:?} is {} bytes, expected {}",
                path,
                mmap.len(),
                SEQUENCE_FILE_SIZE
            )));
        }

        let read = |offset: usize| {
            u32::from_le_bytes([
                mmap[offset],
                mmap[offset + 1],
                mmap[offset + 2],
                mmap[offset + 3],
            ])
        };

        let sequence = Self {
            namespace: AtomicU32::new(read(NAMESPACE_OFFSET)),
            metric: AtomicU32::new(read(METRIC_OFFSET)),
            tag_key: AtomicU32::new(read(TAG_KEY_OFFSET)),
            tag_value: AtomicU32::new(read(TAG_VALUE_OFFSET)),
            path,
            mmap: Mutex::new(Some(mmap)),
        };

        tracing::debug!(
            "Opened sequence {:?} (ns={}, metric={}, tag_key={}, tag_value={})",
            sequence.path,
            sequence.namespace_seq(),
            sequence.metric_seq(),
            sequence.tag_key_seq(),
            sequence.tag_value_seq()
        );

        Ok(sequence)
    }

    /// Allocate the next namespace id
    pub fn next_namespace_seq(&self) -> u32 {
        self.namespace.fetch_add(1, Ordering::SeqCst)
    }

    /// Allocate the next metric name id
    pub fn next_metric_seq(&self) -> u32 {
        self.metric.fetch_add(1, Ordering::SeqCst)
    }

    /// Allocate the next tag key id
    pub fn next_tag_key_seq(&self) -> u32 {
        self.tag_key.fetch_add(1, Ordering::SeqCst)
    }

    /// Allocate the next tag value id
    pub fn next_tag_value_seq(&self) -> u32 {
        self.tag_value.fetch_add(1, Ordering::SeqCst)
    }

    pub fn namespace_seq(&self) -> u32 {
        self.namespace.load(Ordering::SeqCst)
    }

    pub fn metric_seq(&self) -> u32 {
        self.metric.load(Ordering::SeqCst)
    }

    pub fn tag_key_seq(&self) -> u32 {
        self.tag_key.load(Ordering::SeqCst)
    }

    pub fn tag_value_seq(&self) -> u32 {
        self.tag_value.load(Ordering::SeqCst)
    }

    /// Write the current counters to the mapped file and flush it to disk
    pub fn sync(&self) -> IndexResult<()> {
        let mut guard = self.mmap.lock();
        let mmap = guard.as_mut().ok_or_else(|| {
            IndexError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("sequence {:?} is closed", self.path),
            ))
        })?;

        for (offset, counter) in [
            (NAMESPACE_OFFSET, &self.namespace),
            (METRIC_OFFSET, &self.metric),
            (TAG_KEY_OFFSET, &self.tag_key),
            (TAG_VALUE_OFFSET, &self.tag_value),
        ] {
            let value = counter.load(Ordering::SeqCst).to_le_bytes();
            mmap[offset..offset + 4].copy_from_slice(&value);
        }

        mmap.flush()?;
        Ok(())
    }

    /// Sync and unmap the file. Further syncs fail.
    pub fn close(&self) -> IndexResult<()> {
        if self.mmap.lock().is_none() {
            return Ok(());
        }
        self.sync()?;
        self.mmap.lock().take();
        Ok(())
    }

    /// Path of the sequence file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Sequence {
    fn drop(&mut self) {
        // Best effort sync on drop
        if let Err(e) = self.close() {
            tracing::warn!("Failed to close sequence {:?}: {}", self.path, e);
        }
    }
}

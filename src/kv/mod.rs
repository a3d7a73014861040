//! Storage family boundary
//!
//! The index never writes files itself. Everything it persists goes through a
//! [`Family`]: a named collection of `u32 key → bytes` entries that supports
//! batched writes through a [`Flusher`] and point-in-time reads through a
//! [`Snapshot`].
//!
//! # Architecture
//!
//! ```text
//! Flush:
//!   new_flusher() → prepare(key) → write(bytes)* → commit() → ... → close()
//!                                                               ↓
//!                                               new immutable version published
//! Read:
//!   get_snapshot() → load(key, |version| ...)   (oldest version first)
//! ```
//!
//! Each closed flusher publishes one new version. A key written by several
//! flushes has several persisted versions; the index layer merges them on read
//! according to the family's [`MergePolicy`].
//!
//! [`KvFamily`] is the bundled implementation, either purely in memory or
//! backed by a directory of checksummed table files.

mod compression;
mod error;
mod family;
mod store;

pub use compression::CompressionType;
pub use error::{KvError, KvResult};
pub use family::KvFamily;
pub use store::KvStore;

use std::sync::Arc;

/// How persisted versions of the same key combine when the family compacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MergePolicy {
    /// Prefix-compressed key → id buckets
    Trie,
    /// Compressed series-ID bitmaps, combined by union
    Bitmap,
    /// Series bitmap plus parallel tag-value ids
    Forward,
    /// Count-prefixed schema meta lists, concatenated
    Schema,
}

impl std::fmt::Display for MergePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergePolicy::Trie => write!(f, "trie"),
            MergePolicy::Bitmap => write!(f, "bitmap"),
            MergePolicy::Forward => write!(f, "forward"),
            MergePolicy::Schema => write!(f, "schema"),
        }
    }
}

/// A named unit of persisted key-value data with its own snapshots.
pub trait Family: Send + Sync {
    /// Family name, unique within a store
    fn name(&self) -> &str;

    /// Merge policy tag for persisted versions
    fn merge_policy(&self) -> MergePolicy;

    /// Start a new batch of writes. Dropping the flusher without calling
    /// [`Flusher::close`] releases it and discards everything written.
    fn new_flusher(&self) -> Box<dyn Flusher>;

    /// Take a consistent, immutable view of all published versions
    fn get_snapshot(&self) -> Arc<dyn Snapshot>;
}

/// Batched writer for one new family version.
pub trait Flusher: Send {
    /// Begin an entry for `key`
    fn prepare(&mut self, key: u32) -> KvResult<()>;

    /// Append bytes to the current entry
    fn write(&mut self, data: &[u8]) -> KvResult<()>;

    /// Finish the current entry
    fn commit(&mut self) -> KvResult<()>;

    /// Publish every committed entry as one new version
    fn close(self: Box<Self>) -> KvResult<()>;
}

/// Point-in-time read view of a family. Released when dropped.
pub trait Snapshot: Send + Sync {
    /// Every persisted version of `key`, oldest first
    fn find_readers(&self, key: u32) -> KvResult<Vec<Arc<[u8]>>>;

    /// Visit every persisted version of `key`, oldest first
    fn load(&self, key: u32, f: &mut dyn FnMut(&[u8]) -> KvResult<()>) -> KvResult<()> {
        for value in self.find_readers(key)? {
            f(&value)?;
        }
        Ok(())
    }
}

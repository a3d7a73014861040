//! Family registry
//!
//! A [`KvStore`] hands out named families, creating each one on first use.
//! Directory-backed stores keep every family in its own subdirectory.

use crate::kv::compression::CompressionType;
use crate::kv::error::KvResult;
use crate::kv::family::KvFamily;
use crate::kv::MergePolicy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Registry of named families sharing one root directory
pub struct KvStore {
    dir: Option<PathBuf>,
    compression: CompressionType,
    families: Mutex<HashMap<String, Arc<KvFamily>>>,
}

impl KvStore {
    /// Create a store whose families live only in memory
    pub fn memory() -> Self {
        Self {
            dir: None,
            compression: CompressionType::None,
            families: Mutex::new(HashMap::new()),
        }
    }

    /// Open a store rooted at `dir`
    pub fn open(dir: impl Into<PathBuf>, compression: CompressionType) -> KvResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir: Some(dir),
            compression,
            families: Mutex::new(HashMap::new()),
        })
    }

    /// Get a family by name, opening or creating it on first use
    pub fn family(&self, name: &str, policy: MergePolicy) -> KvResult<Arc<KvFamily>> {
        let mut families = self.families.lock();
        if let Some(family) = families.get(name) {
            return Ok(Arc::clone(family));
        }

        let family = match &self.dir {
            Some(dir) => KvFamily::open(dir.join(name), name, policy, self.compression)?,
            None => KvFamily::memory(name, policy),
        };
        let family = Arc::new(family);
        families.insert(name.to_string(), Arc::clone(&family));
        Ok(family)
    }

    /// Names of the families opened so far
    pub fn family_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.families.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Root directory, if directory-backed
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }
}

//! Prefix-compressed bucket encoding
//!
//! A persisted bucket is a sorted run of keys where each key only stores the
//! bytes that differ from its predecessor:
//!
//! ```text
//! count: u32
//! repeated count times, ascending key order:
//!   shared: u16      bytes shared with the previous key
//!   suffix_len: u16
//!   suffix: [u8; suffix_len]
//!   id: u32
//! ```
//!
//! Decoding rebuilds the full keys once; lookups are binary searches and
//! prefix scans over the sorted result.

use crate::index::codec::Reader;
use crate::index::error::{IndexError, IndexResult};
use crate::index::expr::Matcher;
use std::collections::BTreeMap;

/// Longest key a bucket can persist
pub const MAX_KEY_LEN: usize = u16::MAX as usize;

/// Decoded, sorted bucket
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrieBucket {
    entries: Vec<(Vec<u8>, u32)>,
}

impl TrieBucket {
    /// Encode a bucket. Keys must not exceed [`MAX_KEY_LEN`].
    pub fn encode(entries: &BTreeMap<Vec<u8>, u32>) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + entries.len() * 12);
        buf.extend_from_slice(&(entries.len() as u32).to_le_bytes());

        let mut prev: &[u8] = &[];
        for (key, id) in entries {
            let shared = prev
                .iter()
                .zip(key.iter())
                .take_while(|(a, b)| a == b)
                .count()
                .min(MAX_KEY_LEN);
            let suffix = &key[shared..];

            buf.extend_from_slice(&(shared as u16).to_le_bytes());
            buf.extend_from_slice(&(suffix.len() as u16).to_le_bytes());
            buf.extend_from_slice(suffix);
            buf.extend_from_slice(&id.to_le_bytes());
            prev = key.as_slice();
        }

        buf
    }

    /// Decode a bucket written by [`TrieBucket::encode`]
    pub fn decode(data: &[u8]) -> IndexResult<Self> {
        let mut reader = Reader::new(data, "trie");
        let count = reader.u32()? as usize;

        let mut entries: Vec<(Vec<u8>, u32)> = Vec::with_capacity(count.min(1 << 16));
        for _ in 0..count {
            let shared = reader.u16()? as usize;
            let suffix_len = reader.u16()? as usize;
            let suffix = reader.bytes(suffix_len)?;
            let id = reader.u32()?;

            let prev = entries.last().map(|(k, _)| k.as_slice()).unwrap_or(&[]);
            if shared > prev.len() {
                return Err(IndexError::Corruption(format!(
                    "trie entry shares {} bytes with a {} byte key",
                    shared,
                    prev.len()
                )));
            }
            let mut key = Vec::with_capacity(shared + suffix_len);
            key.extend_from_slice(&prev[..shared]);
            key.extend_from_slice(suffix);
            entries.push((key, id));
        }

        Ok(Self { entries })
    }

    /// Exact lookup
    pub fn get(&self, key: &[u8]) -> Option<u32> {
        self.entries
            .binary_search_by(|(k, _)| k.as_slice().cmp(key))
            .ok()
            .map(|idx| self.entries[idx].1)
    }

    /// Entries whose key starts with `prefix`, in key order
    pub fn prefix_iter<'a>(&'a self, prefix: &'a [u8]) -> impl Iterator<Item = (&'a [u8], u32)> + 'a {
        let start = self
            .entries
            .partition_point(|(k, _)| k.as_slice() < prefix);
        self.entries[start..]
            .iter()
            .take_while(move |(k, _)| k.starts_with(prefix))
            .map(|(k, id)| (k.as_slice(), *id))
    }

    /// Ids of every key the matcher accepts
    pub fn find(&self, matcher: &Matcher) -> Vec<u32> {
        if matcher.is_nothing() {
            return Vec::new();
        }
        match matcher.literal_prefix() {
            Some(prefix) => self
                .prefix_iter(prefix)
                .filter(|(k, _)| matcher.matches(k))
                .map(|(_, id)| id)
                .collect(),
            None => self
                .iter()
                .filter(|(k, _)| matcher.matches(k))
                .map(|(_, id)| id)
                .collect(),
        }
    }

    /// All entries in key order
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], u32)> + '_ {
        self.entries.iter().map(|(k, id)| (k.as_slice(), *id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::expr::TagFilter;

    fn bucket(keys: &[&str]) -> TrieBucket {
        let map: BTreeMap<Vec<u8>, u32> = keys
            .iter()
            .enumerate()
            .map(|(i, k)| (k.as_bytes().to_vec(), i as u32 + 1))
            .collect();
        TrieBucket::decode(&TrieBucket::encode(&map)).unwrap()
    }

    #[test]
    fn test_get() {
        let b = bucket(&["cpu", "cpu.idle", "cpu.load", "mem"]);
        assert_eq!(b.len(), 4);
        assert_eq!(b.get(b"cpu.idle"), Some(2));
        assert_eq!(b.get(b"mem"), Some(4));
        assert_eq!(b.get(b"cp"), None);
        assert_eq!(b.get(b"disk"), None);
    }

    #[test]
    fn test_prefix_compression_shrinks_output() {
        let keys: BTreeMap<Vec<u8>, u32> = (0..100u32)
            .map(|i| (format!("host-prefix-that-repeats-{:04}", i).into_bytes(), i))
            .collect();
        let raw: usize = keys.keys().map(|k| k.len()).sum();
        assert!(TrieBucket::encode(&keys).len() < raw);
    }

    #[test]
    fn test_prefix_iter() {
        let b = bucket(&["a", "ab", "abc", "abd", "b"]);
        let keys: Vec<&[u8]> = b.prefix_iter(b"ab").map(|(k, _)| k).collect();
        assert_eq!(keys, vec![&b"ab"[..], &b"abc"[..], &b"abd"[..]]);
        assert_eq!(b.prefix_iter(b"z").count(), 0);
        assert_eq!(b.prefix_iter(b"").count(), 5);
    }

    #[test]
    fn test_find_like_patterns() {
        let b = bucket(&[
            "a",
            "ab",
            "abc",
            "abcdefgh",
            "abcdefghijkl",
            "abcdefghijklmnopqrstuvwxyz",
            "zzzzzz",
        ]);
        let find = |p: &str| b.find(&TagFilter::Like(p.to_string()).compile().unwrap()).len();

        assert_eq!(find("abc*"), 4);
        assert_eq!(find("*abc"), 1);
        assert_eq!(find("*abc*"), 4);
        assert_eq!(find(""), 0);
        assert_eq!(find("zzzzzz"), 1);
    }

    #[test]
    fn test_find_regex() {
        let b = bucket(&["host-1", "host-22", "hostname", "db-1"]);
        let m = TagFilter::Regex("^host-[0-9]+$".into()).compile().unwrap();
        let mut ids = b.find(&m);
        ids.sort();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_empty_bucket() {
        let b = bucket(&[]);
        assert!(b.is_empty());
        assert_eq!(b.get(b"x"), None);
    }

    #[test]
    fn test_truncated_data_is_corruption() {
        let map: BTreeMap<Vec<u8>, u32> = [(b"key".to_vec(), 1)].into_iter().collect();
        let data = TrieBucket::encode(&map);
        let err = TrieBucket::decode(&data[..data.len() - 2]).unwrap_err();
        assert!(matches!(err, IndexError::Corruption(_)));
    }
}

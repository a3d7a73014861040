//! Tag value filter expressions
//!
//! A [`TagFilter`] is what a query asks for; [`Matcher`] is its compiled form
//! evaluated against bucket keys.
//!
//! `Like` patterns use `*` only at the ends:
//!
//! | pattern  | meaning              |
//! |----------|----------------------|
//! | `abc*`   | starts with `abc`    |
//! | `*abc`   | ends with `abc`      |
//! | `*abc*`  | contains `abc`       |
//! | `abc`    | equals `abc`         |
//! | `""`/`*` | matches nothing      |

use crate::index::error::IndexResult;
use regex::bytes::Regex;
use std::collections::HashSet;

/// Predicate over the values of one tag key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagFilter {
    /// Exact value
    Equal(String),
    /// Any of the listed values
    In(Vec<String>),
    /// Regular expression (unanchored, as `regex` evaluates it)
    Regex(String),
    /// Glob-style pattern with leading and/or trailing `*`
    Like(String),
}

impl TagFilter {
    /// Compile into a matcher; a malformed regular expression is an error
    pub fn compile(&self) -> IndexResult<Matcher> {
        Ok(match self {
            TagFilter::Equal(value) => Matcher::Equal(value.as_bytes().to_vec()),
            TagFilter::In(values) => {
                Matcher::In(values.iter().map(|v| v.as_bytes().to_vec()).collect())
            }
            TagFilter::Regex(pattern) => Matcher::Regex(Regex::new(pattern)?),
            TagFilter::Like(pattern) => Self::compile_like(pattern),
        })
    }

    fn compile_like(pattern: &str) -> Matcher {
        let leading = pattern.starts_with('*');
        let trailing = pattern.len() > 1 && pattern.ends_with('*');
        let middle = pattern.trim_matches('*');

        if middle.is_empty() {
            return Matcher::Nothing;
        }

        let middle = middle.as_bytes().to_vec();
        match (leading, trailing) {
            (true, true) => Matcher::Contains(middle),
            (true, false) => Matcher::Suffix(middle),
            (false, true) => Matcher::Prefix(middle),
            (false, false) => Matcher::Equal(middle),
        }
    }
}

/// Compiled tag filter
#[derive(Debug, Clone)]
pub enum Matcher {
    Equal(Vec<u8>),
    In(HashSet<Vec<u8>>),
    Prefix(Vec<u8>),
    Suffix(Vec<u8>),
    Contains(Vec<u8>),
    Regex(Regex),
    Nothing,
}

impl Matcher {
    /// Whether `key` satisfies the filter
    pub fn matches(&self, key: &[u8]) -> bool {
        match self {
            Matcher::Equal(value) => key == value.as_slice(),
            Matcher::In(values) => values.contains(key),
            Matcher::Prefix(prefix) => key.starts_with(prefix),
            Matcher::Suffix(suffix) => key.ends_with(suffix),
            Matcher::Contains(needle) => contains(key, needle),
            Matcher::Regex(re) => re.is_match(key),
            Matcher::Nothing => false,
        }
    }

    /// Literal prefix every match must start with, used to narrow sorted scans
    pub fn literal_prefix(&self) -> Option<&[u8]> {
        match self {
            Matcher::Equal(value) | Matcher::Prefix(value) => Some(value.as_slice()),
            _ => None,
        }
    }

    /// True when no key can ever match
    pub fn is_nothing(&self) -> bool {
        matches!(self, Matcher::Nothing)
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.len() > haystack.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

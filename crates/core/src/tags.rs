//! Invalidation tag accumulation.
//!
//! While a page renders, every GET sub-resource response carrying a tag
//! header (e.g. `x-magento-tags`, `xkey`) contributes its tokens to the bucket
//! of the rendered URL. After a successful render the tokens are read back,
//! deduplicated, and handed to the caller so it can invalidate the snapshot
//! when any of the underlying entities change.
//!
//! A registry is created per render request and passed into the render call,
//! so concurrent renders of the same URL never see each other's tags.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Prefix marking a tag key as belonging to the mobile viewport.
pub const MOBILE_MARKER: char = '_';

/// Bucket key: the rendered URL without its trailing slash, mobile-prefixed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TagKey(String);

impl TagKey {
    pub fn new(url: &str, is_mobile: bool) -> Self {
        let url = url.strip_suffix('/').unwrap_or(url);
        if is_mobile { Self(format!("{MOBILE_MARKER}{url}")) } else { Self(url.to_string()) }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TagKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Accumulates space separated tag tokens per [`TagKey`].
///
/// Cloning yields another handle to the same buckets.
#[derive(Debug, Clone, Default)]
pub struct TagRegistry {
    buckets: Arc<Mutex<HashMap<TagKey, String>>>,
}

impl TagRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty bucket for `key` if none exists.
    pub fn open(&self, key: &TagKey) {
        self.lock().entry(key.clone()).or_default();
    }

    /// Append ` {token}` to the bucket for `key`, creating it if absent.
    pub fn accumulate(&self, key: &TagKey, token: &str) {
        let mut buckets = self.lock();
        let bucket = buckets.entry(key.clone()).or_default();
        bucket.push(' ');
        bucket.push_str(token);
    }

    /// Tokens of the bucket with duplicates removed, in first-seen order.
    ///
    /// Returns an empty string when no bucket exists.
    pub fn read_deduped(&self, key: &TagKey) -> String {
        let buckets = self.lock();
        let Some(bucket) = buckets.get(key) else {
            return String::new();
        };

        let mut seen = HashSet::new();
        bucket
            .split_whitespace()
            .filter(|token| seen.insert(*token))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Drop the bucket for `key`; no-op when absent.
    pub fn clear(&self, key: &TagKey) {
        self.lock().remove(key);
    }

    /// Number of live buckets.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TagKey, String>> {
        // buckets hold plain strings, a panicked writer cannot leave them inconsistent
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

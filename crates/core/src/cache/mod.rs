//! Filesystem-backed cache for rendered page snapshots.
//!
//! This module provides a persistent, content-addressed cache storing one
//! JSON file per snapshot. It supports:
//!
//! - Request path normalization into stable cache keys
//! - SHA-256 digests as entry file names
//! - Time-based expiry using the file modification time
//! - Oldest-first eviction once a maximum entry count is reached

pub mod hash;
pub mod key;
pub mod snapshots;
pub mod store;

pub use crate::Error;

pub use hash::{Digest, digest};
pub use key::{CacheKey, invalidation_key, sanitize};
pub use snapshots::{CachedSnapshot, Payload, RequestMeta, SnapshotRecord, StoredResponse};
pub use store::SnapshotStore;

//! Content-addressed digests for cache keys.

use std::fmt;

use sha2::{Digest as _, Sha256};

use super::key::CacheKey;
use crate::Error;

/// Hex encoded SHA-256 of a [`CacheKey`], used as the entry file stem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(String);

impl Digest {
    /// Accept an externally supplied digest, rejecting anything that is not
    /// 64 lowercase hex characters so it can never escape the snapshot directory.
    pub fn parse(value: &str) -> Result<Self, Error> {
        if value.len() == 64 && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            Ok(Self(value.to_string()))
        } else {
            Err(Error::InvalidDigest(value.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the file holding this entry.
    pub fn file_name(&self) -> String {
        format!("{}.json", self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compute the digest of a cache key.
pub fn digest(key: &CacheKey) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(key.as_str().as_bytes());
    Digest(hex::encode(hasher.finalize()))
}

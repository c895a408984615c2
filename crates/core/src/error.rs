//! Unified error types for prerender.

/// Unified error types for the snapshot cache.
///
/// Lookups never surface these: a failed read is reported as a cache miss.
/// Writes, evictions and invalidations return them so callers can log.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Filesystem operation on the snapshot directory failed.
    #[error("CACHE_IO: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot could not be encoded or decoded.
    #[error("CACHE_FORMAT: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Digest is not a 64 character lowercase hex string.
    #[error("CACHE_ERROR: invalid digest format: {0}")]
    InvalidDigest(String),
}

//! Core types and shared functionality for prerender.
//!
//! This crate provides:
//! - Snapshot cache persisted as one JSON file per digest
//! - Cache key normalization and hashing
//! - Per-render invalidation tag accumulation
//! - Unified error types
//! - Configuration structures

pub mod cache;
pub mod config;
pub mod error;
pub mod tags;

pub use cache::{CacheKey, CachedSnapshot, Digest, SnapshotRecord, SnapshotStore};
pub use config::AppConfig;
pub use error::Error;
pub use tags::{TagKey, TagRegistry};

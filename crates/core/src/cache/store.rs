//! Snapshot persistence with TTL expiry and oldest-first eviction.
//!
//! Entries live in a single directory as `<digest>.json`. The modification
//! time of each file is its save time; there is no timestamp inside the
//! record. Only this module writes to the snapshot directory.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::fs;
use tokio::sync::Mutex;

use super::hash::Digest;
use super::snapshots::{CachedSnapshot, SnapshotRecord};
use crate::Error;
use crate::config::UNLIMITED;

/// An entry file found in the snapshot directory.
#[derive(Debug, Clone, PartialEq, Eq)]
struct EntryFile {
    name: String,
    modified: SystemTime,
}

/// Filesystem snapshot store.
#[derive(Debug)]
pub struct SnapshotStore {
    root: PathBuf,
    ttl_minutes: i64,
    max_entries: i64,
    /// Serializes eviction + write so two stores cannot both see room for one more entry.
    write_lock: Mutex<()>,
}

impl SnapshotStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    ///
    /// `ttl_minutes` and `max_entries` accept `-1` for "unlimited".
    pub async fn open(root: impl Into<PathBuf>, ttl_minutes: i64, max_entries: i64) -> Result<Self, Error> {
        let root = root.into();
        fs::create_dir_all(&root).await?;

        tracing::debug!(root = %root.display(), ttl_minutes, max_entries, "snapshot store opened");

        Ok(Self { root, ttl_minutes, max_entries, write_lock: Mutex::new(()) })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the file backing `digest`.
    pub fn entry_path(&self, digest: &Digest) -> PathBuf {
        self.root.join(digest.file_name())
    }

    /// Look up a fresh snapshot.
    ///
    /// A forced refresh skips storage entirely. Unreadable, unparsable, empty
    /// or expired entries are reported as a miss; this never fails.
    pub async fn lookup(&self, digest: &Digest, force_refresh: bool) -> Option<CachedSnapshot> {
        if force_refresh {
            return None;
        }
        self.lookup_at(digest, Utc::now()).await
    }

    /// Look up a snapshot judging freshness against `now`.
    pub async fn lookup_at(&self, digest: &Digest, now: DateTime<Utc>) -> Option<CachedSnapshot> {
        let path = self.entry_path(digest);

        let (record, saved_at) = match read_entry(&path).await {
            Ok(entry) => entry,
            Err(Error::Io(e)) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(%digest, "snapshot cache miss");
                return None;
            }
            Err(e) => {
                tracing::debug!(%digest, error = %e, "unreadable snapshot treated as miss");
                return None;
            }
        };

        if record.response_body.is_empty() {
            tracing::debug!(%digest, "empty snapshot body treated as miss");
            return None;
        }

        let expires_at = self.expires_at(saved_at);
        if let Some(expires_at) = expires_at
            && now >= expires_at
        {
            tracing::debug!(%digest, %saved_at, %expires_at, "snapshot expired");
            return None;
        }

        tracing::debug!(%digest, %saved_at, "snapshot cache hit");
        Some(CachedSnapshot { saved_at, expires_at, record })
    }

    /// Persist a snapshot, evicting the oldest entries first when the store is full.
    ///
    /// Eviction failures are logged and do not prevent the write. Any existing
    /// entry for `digest` is overwritten in full.
    pub async fn store(&self, digest: &Digest, record: &SnapshotRecord) -> Result<(), Error> {
        let _guard = self.write_lock.lock().await;

        if self.max_entries != UNLIMITED
            && let Err(e) = self.evict_for(digest).await
        {
            tracing::warn!(%digest, error = %e, "snapshot eviction failed");
        }

        let bytes = serde_json::to_vec(record)?;
        fs::write(self.entry_path(digest), bytes).await?;

        tracing::debug!(%digest, status = record.response_headers.status, "snapshot stored");
        Ok(())
    }

    /// Delete the entry for `digest`. A missing entry is not an error.
    pub async fn invalidate(&self, digest: &Digest) -> Result<(), Error> {
        if self.remove_entry(&digest.file_name()).await? {
            tracing::info!(%digest, "snapshot invalidated");
        }
        Ok(())
    }

    /// Delete every entry, continuing past individual failures.
    ///
    /// Returns the number of entries removed.
    pub async fn invalidate_all(&self) -> Result<usize, Error> {
        let entries = self.entries().await?;
        let mut removed = 0;

        for entry in entries {
            match self.remove_entry(&entry.name).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(file = %entry.name, error = %e, "failed to delete snapshot"),
            }
        }

        tracing::info!(removed, "snapshot cache cleared");
        Ok(removed)
    }

    /// Number of entries currently stored.
    pub async fn len(&self) -> Result<usize, Error> {
        Ok(self.entries().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.len().await? == 0)
    }

    fn expires_at(&self, saved_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.ttl_minutes == UNLIMITED {
            return None;
        }
        TimeDelta::try_minutes(self.ttl_minutes).and_then(|ttl| saved_at.checked_add_signed(ttl))
    }

    async fn evict_for(&self, incoming: &Digest) -> Result<usize, Error> {
        let entries = self.entries().await?;
        let max = usize::try_from(self.max_entries).unwrap_or(usize::MAX);
        if entries.len() < max {
            return Ok(0);
        }

        let to_remove = entries.len() - max + 1;
        let victims = select_evictions(entries, &incoming.file_name(), to_remove);

        let mut evicted = 0;
        for victim in victims {
            tracing::info!(file = %victim, max_entries = self.max_entries, "max cache entries reached, evicting");
            match self.remove_entry(&victim).await {
                Ok(true) => evicted += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(file = %victim, error = %e, "failed to evict snapshot"),
            }
        }
        Ok(evicted)
    }

    /// Remove an entry file by name. Returns whether a file was deleted.
    async fn remove_entry(&self, name: &str) -> Result<bool, Error> {
        match fs::remove_file(self.root.join(name)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn entries(&self) -> Result<Vec<EntryFile>, Error> {
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(".json") {
                continue;
            }
            // entries removed concurrently are skipped
            let Ok(metadata) = entry.metadata().await else { continue };
            if !metadata.is_file() {
                continue;
            }
            let Ok(modified) = metadata.modified() else { continue };
            entries.push(EntryFile { name, modified });
        }
        Ok(entries)
    }
}

async fn read_entry(path: &Path) -> Result<(SnapshotRecord, DateTime<Utc>), Error> {
    let bytes = fs::read(path).await?;
    let record: SnapshotRecord = serde_json::from_slice(&bytes)?;
    let modified = fs::metadata(path).await?.modified()?;
    Ok((record, DateTime::<Utc>::from(modified)))
}

/// Pick the `count` oldest entries, then spare `exclude` if it is among them.
///
/// An overwritten entry frees its own slot, so no other entry is removed in
/// its place. Sorted by modification time, ties broken by file name so
/// repeated calls over the same directory choose the same victims.
fn select_evictions(mut entries: Vec<EntryFile>, exclude: &str, count: usize) -> Vec<String> {
    entries.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.name.cmp(&b.name)));
    entries
        .into_iter()
        .take(count)
        .map(|entry| entry.name)
        .filter(|name| name != exclude)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::key::sanitize;
    use crate::cache::snapshots::{Payload, RequestMeta};
    use crate::cache::hash::digest;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn make_record(body: &str) -> SnapshotRecord {
        let mut header = BTreeMap::new();
        header.insert("content-type".to_string(), "text/html; charset=utf-8".to_string());
        SnapshotRecord::new(
            200,
            header,
            Payload::Text(body.to_string()),
            RequestMeta { method: "GET".into(), url: "/render/https://example.com".into(), header: BTreeMap::new() },
        )
    }

    fn key_for(url: &str) -> Digest {
        digest(&sanitize(&format!("/render/{url}")))
    }

    fn set_mtime(path: &Path, when: SystemTime) {
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(when).unwrap();
    }

    fn minutes_ago(minutes: u64) -> SystemTime {
        SystemTime::now() - Duration::from_secs(minutes * 60)
    }

    async fn open_store(dir: &Path, ttl_minutes: i64, max_entries: i64) -> SnapshotStore {
        SnapshotStore::open(dir.join("snapshots"), ttl_minutes, max_entries).await.unwrap()
    }

    #[tokio::test]
    async fn test_open_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), 30, 10).await;
        assert!(store.root().is_dir());
        assert!(store.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_store_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), 30, 10).await;
        let digest = key_for("https://example.com/page");

        store.store(&digest, &make_record("<html>page</html>")).await.unwrap();

        let hit = store.lookup(&digest, false).await.unwrap();
        assert_eq!(hit.status(), 200);
        assert_eq!(hit.body(), &Payload::Text("<html>page</html>".into()));
        assert_eq!(hit.headers().get("content-type").map(String::as_str), Some("text/html; charset=utf-8"));
        assert!(hit.expires_at.is_some());
    }

    #[tokio::test]
    async fn test_lookup_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), 30, 10).await;
        assert!(store.lookup(&key_for("https://example.com/none"), false).await.is_none());
    }

    #[tokio::test]
    async fn test_force_refresh_skips_fresh_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), -1, 10).await;
        let digest = key_for("https://example.com/page");
        store.store(&digest, &make_record("<html></html>")).await.unwrap();

        assert!(store.lookup(&digest, true).await.is_none());
        assert!(store.lookup(&digest, false).await.is_some());
    }

    #[tokio::test]
    async fn test_unlimited_ttl_never_expires() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), -1, 10).await;
        let digest = key_for("https://example.com/old");
        store.store(&digest, &make_record("<html></html>")).await.unwrap();
        set_mtime(&store.entry_path(&digest), minutes_ago(60 * 24 * 365 * 5));

        let hit = store.lookup(&digest, false).await.unwrap();
        assert!(hit.expires_at.is_none());
    }

    #[tokio::test]
    async fn test_ttl_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), 30, 10).await;
        let digest = key_for("https://example.com/ttl");
        store.store(&digest, &make_record("<html></html>")).await.unwrap();

        set_mtime(&store.entry_path(&digest), minutes_ago(29));
        assert!(store.lookup(&digest, false).await.is_some());

        set_mtime(&store.entry_path(&digest), minutes_ago(31));
        assert!(store.lookup(&digest, false).await.is_none());
    }

    #[tokio::test]
    async fn test_expiry_is_inclusive() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), 30, 10).await;
        let digest = key_for("https://example.com/edge");
        store.store(&digest, &make_record("<html></html>")).await.unwrap();

        let saved = store.lookup(&digest, false).await.unwrap().saved_at;
        assert!(store.lookup_at(&digest, saved + TimeDelta::minutes(30)).await.is_none());
        assert!(store.lookup_at(&digest, saved + TimeDelta::minutes(30) - TimeDelta::seconds(1)).await.is_some());
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), 30, 10).await;
        let digest = key_for("https://example.com/corrupt");
        std::fs::write(store.entry_path(&digest), b"{not json").unwrap();

        assert!(store.lookup(&digest, false).await.is_none());
    }

    #[tokio::test]
    async fn test_empty_body_is_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), 30, 10).await;
        let digest = key_for("https://example.com/empty");
        store.store(&digest, &make_record("")).await.unwrap();

        assert!(store.lookup(&digest, false).await.is_none());
    }

    #[tokio::test]
    async fn test_store_overwrites_existing_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), 30, 10).await;
        let digest = key_for("https://example.com/page");

        store.store(&digest, &make_record("first")).await.unwrap();
        store.store(&digest, &make_record("second")).await.unwrap();

        let hit = store.lookup(&digest, false).await.unwrap();
        assert_eq!(hit.body(), &Payload::Text("second".into()));
        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_evicts_oldest_when_full() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), -1, 2).await;
        let a = key_for("https://example.com/a");
        let b = key_for("https://example.com/b");
        let c = key_for("https://example.com/c");

        store.store(&a, &make_record("a")).await.unwrap();
        set_mtime(&store.entry_path(&a), minutes_ago(2));
        store.store(&b, &make_record("b")).await.unwrap();
        set_mtime(&store.entry_path(&b), minutes_ago(1));
        store.store(&c, &make_record("c")).await.unwrap();

        assert!(store.lookup(&a, false).await.is_none());
        assert!(store.lookup(&b, false).await.is_some());
        assert!(store.lookup(&c, false).await.is_some());
        assert_eq!(store.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_eviction_never_removes_entry_being_written() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), -1, 2).await;
        let a = key_for("https://example.com/a");
        let b = key_for("https://example.com/b");

        store.store(&a, &make_record("a")).await.unwrap();
        set_mtime(&store.entry_path(&a), minutes_ago(10));
        store.store(&b, &make_record("b")).await.unwrap();

        store.store(&a, &make_record("a2")).await.unwrap();

        let hit = store.lookup(&a, false).await.unwrap();
        assert_eq!(hit.body(), &Payload::Text("a2".into()));
        assert!(store.lookup(&b, false).await.is_some());
        assert_eq!(store.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_unlimited_entries_never_evicts() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), -1, -1).await;
        for i in 0..5 {
            store
                .store(&key_for(&format!("https://example.com/{i}")), &make_record("x"))
                .await
                .unwrap();
        }
        assert_eq!(store.len().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_invalidate_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), 30, 10).await;
        let other = key_for("https://example.com/kept");
        store.store(&other, &make_record("x")).await.unwrap();

        store.invalidate(&key_for("https://example.com/never-stored")).await.unwrap();

        assert_eq!(store.len().await.unwrap(), 1);
        assert!(store.lookup(&other, false).await.is_some());
    }

    #[tokio::test]
    async fn test_invalidate_removes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), 30, 10).await;
        let digest = key_for("https://example.com/page");
        store.store(&digest, &make_record("x")).await.unwrap();

        store.invalidate(&digest).await.unwrap();

        assert!(store.lookup(&digest, false).await.is_none());
        assert!(!store.entry_path(&digest).exists());
    }

    #[tokio::test]
    async fn test_invalidate_all() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), 30, 10).await;
        for i in 0..3 {
            store
                .store(&key_for(&format!("https://example.com/{i}")), &make_record("x"))
                .await
                .unwrap();
        }
        std::fs::write(store.root().join("README"), b"not an entry").unwrap();

        let removed = store.invalidate_all().await.unwrap();

        assert_eq!(removed, 3);
        assert!(store.is_empty().await.unwrap());
        assert!(store.root().join("README").exists());
    }

    #[tokio::test]
    async fn test_invalidate_all_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), 30, 10).await;
        std::fs::remove_dir(store.root()).unwrap();

        assert_eq!(store.invalidate_all().await.unwrap(), 0);
    }

    #[test]
    fn test_select_evictions_orders_by_age_then_name() {
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let entries = vec![
            EntryFile { name: "c.json".into(), modified: base },
            EntryFile { name: "a.json".into(), modified: base + Duration::from_secs(5) },
            EntryFile { name: "b.json".into(), modified: base },
        ];

        let first = select_evictions(entries.clone(), "none.json", 2);
        let second = select_evictions(entries, "none.json", 2);

        assert_eq!(first, vec!["b.json".to_string(), "c.json".to_string()]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_select_evictions_spares_oldest_incoming() {
        let base = SystemTime::UNIX_EPOCH;
        let entries = vec![
            EntryFile { name: "target.json".into(), modified: base },
            EntryFile { name: "other.json".into(), modified: base + Duration::from_secs(1) },
        ];

        assert!(select_evictions(entries, "target.json", 1).is_empty());
    }

    #[test]
    fn test_select_evictions_incoming_not_oldest() {
        let base = SystemTime::UNIX_EPOCH;
        let entries = vec![
            EntryFile { name: "old.json".into(), modified: base },
            EntryFile { name: "target.json".into(), modified: base + Duration::from_secs(1) },
            EntryFile { name: "new.json".into(), modified: base + Duration::from_secs(2) },
        ];

        assert_eq!(select_evictions(entries, "target.json", 2), vec!["old.json".to_string()]);
    }
}

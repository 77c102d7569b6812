//! Snapshot persistence for entity state.
//!
//! A snapshot is a point-in-time copy of an entity usable as a replay
//! base: commits with a higher version are replayed on top of it.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::EntityKey;

/// A point-in-time copy of an entity's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub kind: String,
    pub id: Uuid,
    /// Version of the last commit folded into `state`.
    pub version: u64,
    pub state: serde_json::Value,
}

/// Durable snapshot storage.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// The newest snapshot of `key` whose version is at most `max_version`.
    async fn get_snapshot(
        &self,
        key: EntityKey,
        max_version: u64,
    ) -> io::Result<Option<Snapshot>>;

    async fn save(&self, snapshot: &Snapshot) -> io::Result<()>;

    /// Delete every snapshot.
    async fn purge(&self) -> io::Result<()>;
}

type SnapshotMap = HashMap<(String, Uuid), BTreeMap<u64, Snapshot>>;

/// Process-local snapshot store.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: Mutex<SnapshotMap>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Versions at which snapshots of `key` were saved, ascending.
    pub fn versions(&self, key: EntityKey) -> Vec<u64> {
        let snapshots = self.snapshots.lock().unwrap_or_else(PoisonError::into_inner);
        snapshots
            .get(&(key.kind.to_owned(), key.id))
            .map(|by_version| by_version.keys().copied().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn get_snapshot(
        &self,
        key: EntityKey,
        max_version: u64,
    ) -> io::Result<Option<Snapshot>> {
        let snapshots = self.snapshots.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(snapshots
            .get(&(key.kind.to_owned(), key.id))
            .and_then(|by_version| by_version.range(..=max_version).next_back())
            .map(|(_, snapshot)| snapshot.clone()))
    }

    async fn save(&self, snapshot: &Snapshot) -> io::Result<()> {
        let mut snapshots = self.snapshots.lock().unwrap_or_else(PoisonError::into_inner);
        snapshots
            .entry((snapshot.kind.clone(), snapshot.id))
            .or_default()
            .insert(snapshot.version, snapshot.clone());
        Ok(())
    }

    async fn purge(&self) -> io::Result<()> {
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }
}

/// File-backed snapshot store.
///
/// Snapshots are stored as JSON files at
/// `<base_dir>/snapshots/<kind>/<id>/<version>.json`. Writes are atomic via
/// a temp-rename pattern to prevent corruption from crashes mid-write.
/// A snapshot file that cannot be parsed is skipped in favour of the next
/// older one.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    base_dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// `<base_dir>/snapshots/<kind>/<id>`
    pub fn snapshot_dir(&self, kind: &str, id: Uuid) -> PathBuf {
        self.base_dir
            .join("snapshots")
            .join(kind)
            .join(id.to_string())
    }

    /// Snapshot versions present on disk for `key`, ascending.
    async fn versions_on_disk(&self, key: EntityKey) -> io::Result<Vec<u64>> {
        let dir = self.snapshot_dir(key.kind, key.id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut versions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            // Leftover `.json.tmp` files fail the parse and are ignored.
            if let Some(stem) = name.strip_suffix(".json")
                && let Ok(version) = stem.parse::<u64>()
            {
                versions.push(version);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn get_snapshot(
        &self,
        key: EntityKey,
        max_version: u64,
    ) -> io::Result<Option<Snapshot>> {
        let versions = self.versions_on_disk(key).await?;
        let dir = self.snapshot_dir(key.kind, key.id);
        for version in versions.into_iter().rev().filter(|v| *v <= max_version) {
            let path = dir.join(format!("{version}.json"));
            let bytes = match tokio::fs::read(&path).await {
                Ok(b) => b,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };

            match serde_json::from_slice::<Snapshot>(&bytes) {
                Ok(snap) => return Ok(Some(snap)),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "failed to deserialize snapshot; trying an older one"
                    );
                }
            }
        }
        Ok(None)
    }

    async fn save(&self, snapshot: &Snapshot) -> io::Result<()> {
        let dir = self.snapshot_dir(&snapshot.kind, snapshot.id);
        tokio::fs::create_dir_all(&dir).await?;

        let path = dir.join(format!("{}.json", snapshot.version));
        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tokio::fs::write(&tmp_path, &json).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    async fn purge(&self) -> io::Result<()> {
        match tokio::fs::remove_dir_all(self.base_dir.join("snapshots")).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

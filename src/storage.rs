//! On-disk room snapshots.
//!
//! One file per room: `{roomId}.gz`, a gzip-wrapped JSON document holding
//! the event log and the creation timestamp. Writes go to a temp file and
//! rename into place, so a crash mid-flush leaves the previous snapshot
//! intact. Best-effort durability: no per-operation fsync.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crdt::CrdtEvent;

const SNAPSHOT_EXT: &str = "gz";

/// The persisted form of a room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedRoom {
    pub events: Vec<CrdtEvent>,
    /// Room creation time, unix seconds.
    pub created: u64,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("snapshot io error: {0}")]
    Io(#[from] io::Error),
    #[error("snapshot decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Flat directory of room snapshots.
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    /// Open (and create if missing) the snapshot directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn path(&self, room_id: &str) -> PathBuf {
        self.root.join(format!("{room_id}.{SNAPSHOT_EXT}"))
    }

    pub fn exists(&self, room_id: &str) -> bool {
        self.path(room_id).exists()
    }

    /// Write a snapshot atomically: temp file, then rename over the target.
    pub fn save(&self, room_id: &str, snapshot: &PersistedRoom) -> Result<(), StorageError> {
        let target = self.path(room_id);
        let tmp = self.root.join(format!("{room_id}.{SNAPSHOT_EXT}.tmp"));

        let file = File::create(&tmp)?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        serde_json::to_writer(&mut encoder, snapshot)?;
        encoder.finish()?.flush()?;
        fs::rename(&tmp, &target)?;

        log::debug!(
            "persisted room {room_id}: {} events to {}",
            snapshot.events.len(),
            target.display()
        );
        Ok(())
    }

    /// Load a snapshot, or `None` when the room was never persisted.
    pub fn load(&self, room_id: &str) -> Result<Option<PersistedRoom>, StorageError> {
        let path = self.path(room_id);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut decoder = GzDecoder::new(file);
        let mut raw = Vec::new();
        decoder.read_to_end(&mut raw)?;
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    /// Delete a snapshot; `false` when it did not exist.
    pub fn remove(&self, room_id: &str) -> Result<bool, StorageError> {
        match fs::remove_file(self.path(room_id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Room ids of every snapshot on disk.
    pub fn list(&self) -> Result<Vec<String>, StorageError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            if let Some(id) = room_id_of(&entry?.path()) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// Delete snapshots whose last write is older than `age`; returns the
    /// purged room ids. Mtime tracks the last flush, which tracks activity.
    pub fn purge_older_than(&self, age: Duration) -> Result<Vec<String>, StorageError> {
        let now = SystemTime::now();
        let mut purged = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            let Some(id) = room_id_of(&path) else {
                continue;
            };
            let mtime = entry.metadata()?.modified()?;
            let stale = now
                .duration_since(mtime)
                .map(|idle| idle > age)
                .unwrap_or(false);
            if stale {
                fs::remove_file(&path)?;
                log::info!("purged stale room snapshot {id}");
                purged.push(id);
            }
        }
        Ok(purged)
    }
}

fn room_id_of(path: &Path) -> Option<String> {
    if path.extension()? != SNAPSHOT_EXT {
        return None;
    }
    Some(path.file_stem()?.to_str()?.to_string())
}

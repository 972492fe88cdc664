//! Directory of live rooms.
//!
//! The registry owns the `name -> room` map and the snapshot store; rooms
//! are arena-owned values handed out as `Arc<Mutex<Room>>`, so sessions
//! never hold a back pointer that could outlive the room. The map lock is
//! never held across a room lock.
//!
//! A single sweeper task drives everything periodic: heartbeats, dead
//! session GC, snapshot flushes, offload of idle rooms from memory, and
//! eviction of expired rooms.

use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use rand::Rng;
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::time::MissedTickBehavior;

use crate::config::Settings;
use crate::crdt::CrdtError;
use crate::room::{Room, RoomLimits};
use crate::storage::{PersistedRoom, SnapshotStore, StorageError};

pub type SharedRoom = Arc<Mutex<Room>>;

/// Empty rooms stay resident this long after their last activity before
/// being offloaded to disk, which keeps the bootstrap-then-connect window
/// cheap.
const OFFLOAD_GRACE: Duration = Duration::from_secs(60);

const CONSONANTS: &[u8] = b"bcdfghjklmnpqrstvwxyz";
const VOWELS: &[u8] = b"aeiou";

/// Pronounceable random room name, alternating consonants and vowels.
pub fn phonetic_name(length: usize) -> String {
    let mut rng = rand::rng();
    let start = rng.random_bool(0.5);
    (0..length)
        .map(|i| {
            let set = if (i % 2 == 0) == start {
                CONSONANTS
            } else {
                VOWELS
            };
            set[rng.random_range(0..set.len())] as char
        })
        .collect()
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("room {0} not found")]
    RoomNotFound(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Corrupted(#[from] CrdtError),
}

/// Counters for the landing page.
#[derive(Debug, Clone, Copy)]
pub struct RegistryStats {
    pub active_rooms: usize,
    pub active_sites: usize,
    pub total_rooms: usize,
}

pub struct RoomRegistry {
    settings: Arc<Settings>,
    store: SnapshotStore,
    rooms: RwLock<FxHashMap<String, SharedRoom>>,
}

impl RoomRegistry {
    /// Open the registry over its persistence directory. Failure here is a
    /// startup error.
    pub fn open(settings: Arc<Settings>) -> Result<Self, StorageError> {
        let store = SnapshotStore::open(&settings.persist_dir)?;
        Ok(Self {
            settings,
            store,
            rooms: RwLock::new(FxHashMap::default()),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Create an empty room under a fresh name, seeding the configured
    /// greeting text.
    pub async fn create(&self) -> Result<(String, SharedRoom), RegistryError> {
        let mut map = self.rooms.write().await;
        let room_id = loop {
            let candidate = phonetic_name(self.settings.room_name_length);
            if !map.contains_key(&candidate) && !self.store.exists(&candidate) {
                break candidate;
            }
        };

        let mut room = Room::new(room_id.clone(), RoomLimits::from(self.settings.as_ref()));
        if let Some(greeting) = &self.settings.greeting {
            room.seed(greeting)?;
        }
        let shared = Arc::new(Mutex::new(room));
        map.insert(room_id.clone(), shared.clone());
        log::info!("created room {room_id}");
        Ok((room_id, shared))
    }

    /// Resolve a room, restoring it from disk when offloaded.
    pub async fn get(&self, room_id: &str) -> Result<SharedRoom, RegistryError> {
        if let Some(room) = self.rooms.read().await.get(room_id) {
            return Ok(room.clone());
        }

        let Some(snapshot) = self.store.load(room_id)? else {
            return Err(RegistryError::RoomNotFound(room_id.to_string()));
        };
        let created = UNIX_EPOCH + Duration::from_secs(snapshot.created);
        let room = Room::from_events(
            room_id,
            snapshot.events,
            created,
            RoomLimits::from(self.settings.as_ref()),
        )?;
        log::info!("restored room {room_id} with {} events from disk", room.log_len());

        let mut map = self.rooms.write().await;
        let entry = map
            .entry(room_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(room)));
        Ok(entry.clone())
    }

    pub async fn exists(&self, room_id: &str) -> bool {
        self.rooms.read().await.contains_key(room_id) || self.store.exists(room_id)
    }

    /// Load every snapshot on disk into memory; unreadable files are
    /// skipped, not fatal.
    pub async fn restore_all(&self) -> usize {
        let ids = match self.store.list() {
            Ok(ids) => ids,
            Err(e) => {
                log::error!("cannot list snapshots: {e}");
                return 0;
            }
        };
        let mut restored = 0;
        for id in ids {
            match self.get(&id).await {
                Ok(_) => restored += 1,
                Err(e) => log::warn!("skipping unreadable snapshot {id}: {e}"),
            }
        }
        restored
    }

    /// Persist every dirty room. Called on shutdown and from the sweeper.
    pub async fn flush_all(&self) {
        let rooms = self.room_list().await;
        for (id, room) in rooms {
            let mut guard = room.lock().await;
            if !guard.needs_flush() {
                continue;
            }
            if let Err(e) = self.flush_locked(&mut guard) {
                log::error!("failed to flush room {id}: {e}");
            }
        }
    }

    /// Compact when the log has crossed a threshold, then persist the
    /// compacted log before any session can reconnect (the room lock is
    /// held across both).
    pub async fn compact_room(&self, room: &SharedRoom) {
        let mut guard = room.lock().await;
        if !guard.needs_compaction(
            self.settings.log_bytes_threshold,
            self.settings.log_ops_threshold,
        ) {
            return;
        }
        if let Err(e) = guard.compact() {
            log::error!("compaction failed for room {}: {e}", guard.name);
            return;
        }
        if let Err(e) = self.flush_locked(&mut guard) {
            log::error!("failed to persist compacted room {}: {e}", guard.name);
        }
    }

    /// One sweeper pass: heartbeats and dead-session GC, flushes, offload,
    /// eviction, stale snapshot purge.
    pub async fn sweep(&self) {
        let deadline = self.settings.heartbit_interval * 2;
        let rooms = self.room_list().await;

        let mut offload = Vec::new();
        let mut evict = Vec::new();
        for (id, room) in &rooms {
            let mut guard = room.lock().await;
            guard.gc_sessions(deadline);
            if guard.needs_flush() {
                if let Err(e) = self.flush_locked(&mut guard) {
                    log::error!("failed to flush room {id}: {e}");
                    continue;
                }
            }
            if guard.has_active_sites() {
                continue;
            }
            if guard.idle_for() > self.settings.room_idle_ttl
                && guard.age() > self.settings.room_max_age
            {
                evict.push(id.clone());
            } else if guard.idle_for() > OFFLOAD_GRACE {
                offload.push(id.clone());
            }
        }

        if !offload.is_empty() || !evict.is_empty() {
            let mut map = self.rooms.write().await;
            for id in offload {
                let Some(room) = map.get(&id) else { continue };
                // A session may have appeared since the scan; skip if so.
                let quiet = room
                    .try_lock()
                    .map(|g| !g.has_active_sites() && !g.needs_flush())
                    .unwrap_or(false);
                if quiet {
                    map.remove(&id);
                    log::info!("offloaded idle room {id} from memory");
                }
            }
            for id in evict {
                let Some(room) = map.get(&id) else { continue };
                let expired = match room.try_lock() {
                    Ok(mut g) if !g.has_active_sites() => {
                        g.disconnect_all();
                        true
                    }
                    _ => false,
                };
                if expired {
                    map.remove(&id);
                    if let Err(e) = self.store.remove(&id) {
                        log::error!("failed to delete snapshot for {id}: {e}");
                    }
                    log::info!("evicted expired room {id}");
                }
            }
        }

        let purge_after = self.settings.room_idle_ttl.max(self.settings.room_max_age);
        if let Err(e) = self.store.purge_older_than(purge_after) {
            log::error!("snapshot purge failed: {e}");
        }
    }

    /// Sweeper loop; spawn once at startup.
    pub async fn run_sweeper(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.settings.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.sweep().await;
        }
    }

    pub async fn stats(&self) -> RegistryStats {
        let rooms = self.room_list().await;
        let mut active_sites = 0;
        for (_, room) in &rooms {
            active_sites += room.lock().await.site_count();
        }
        let mut ids: FxHashSet<String> = self.store.list().unwrap_or_default().into_iter().collect();
        ids.extend(rooms.iter().map(|(id, _)| id.clone()));
        RegistryStats {
            active_rooms: rooms.len(),
            active_sites,
            total_rooms: ids.len(),
        }
    }

    async fn room_list(&self) -> Vec<(String, SharedRoom)> {
        self.rooms
            .read()
            .await
            .iter()
            .map(|(id, room)| (id.clone(), room.clone()))
            .collect()
    }

    fn flush_locked(&self, room: &mut Room) -> Result<(), StorageError> {
        let snapshot = PersistedRoom {
            events: room.events(0),
            created: room.created_unix(),
        };
        self.store.save(&room.name, &snapshot)?;
        room.mark_flushed();
        Ok(())
    }
}

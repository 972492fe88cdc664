//! Per-room state: the append-only event log, connected sessions, presence,
//! fan-out, and compaction.
//!
//! ```text
//! session A ──┐                        ┌──► queue A (bounded)
//!             ├──► Mutex<Room>  ───────┤
//! session B ──┘    │  RoomLog         └──► queue B (bounded)
//!                  │  Replica (materialized)
//!                  │  presence table
//! ```
//!
//! The room mutex is the serialization point: append order on the log is the
//! total order every session observes. Fan-out pushes onto bounded queues
//! and never suspends while the lock is held; a session whose queue is full
//! is closed as slow.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::Settings;
use crate::crdt::{CrdtError, CrdtEvent, Replica};
use crate::protocol::{ServerMessage, SitePresence};

/// Site id used for seeded text (greetings, restored snapshots). Real
/// sessions start at 1.
pub const UTIL_SITE_ID: u32 = 0;

/// Outbound queue depth per session. Sized so that a join burst (site id,
/// presences, backlog) always fits.
pub const OUTBOUND_QUEUE: usize = 256;

/// Append-only operation log, addressed by dense 0-based offsets.
#[derive(Default)]
pub struct RoomLog {
    events: Vec<CrdtEvent>,
    bytes: usize,
}

impl RoomLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends in arrival order; returns the event's offset.
    pub fn append(&mut self, event: CrdtEvent) -> usize {
        self.bytes += event_size(&event);
        self.events.push(event);
        self.events.len() - 1
    }

    /// Events with offsets >= `offset`.
    pub fn since(&self, offset: usize) -> &[CrdtEvent] {
        &self.events[offset.min(self.events.len())..]
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Serialized size of the log, maintained incrementally on append.
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

fn event_size(event: &CrdtEvent) -> usize {
    serde_json::to_string(event).map_or(0, |s| s.len() + 1)
}

/// Protocol position of a session, as the server sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected but not yet identified; flips on the first inbound
    /// presence or operation batch.
    AwaitingHello,
    Active,
}

/// Server-side record of one connected participant.
pub struct Site {
    pub site_id: u32,
    pub state: SessionState,
    /// Log offset at which the session joined; the initial replay starts
    /// here so bootstrap events are not redelivered.
    pub joined_at_offset: usize,
    pub last_seen: Instant,
    outbound: mpsc::Sender<ServerMessage>,
}

impl Site {
    fn push(&self, message: ServerMessage) -> bool {
        self.outbound.try_send(message).is_ok()
    }

    fn is_gone(&self) -> bool {
        self.outbound.is_closed()
    }
}

/// Per-room ceilings, copied out of [`Settings`] at construction.
#[derive(Debug, Clone, Copy)]
pub struct RoomLimits {
    pub log_hard_limit: usize,
    pub sites_limit: usize,
}

impl From<&Settings> for RoomLimits {
    fn from(settings: &Settings) -> Self {
        Self {
            log_hard_limit: settings.log_hard_limit,
            sites_limit: settings.sites_limit,
        }
    }
}

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("room is full ({limit} sites)")]
    RoomFull { limit: usize },
    #[error("event log limit reached ({len} events + {incoming} incoming > {limit})")]
    LogFull {
        len: usize,
        incoming: usize,
        limit: usize,
    },
    #[error("insert does not originate from site {site_id}")]
    BadOrigin { site_id: u32 },
    #[error("site {site_id} is not connected")]
    UnknownSite { site_id: u32 },
    #[error("session queue overflowed during join")]
    Backpressure,
    #[error(transparent)]
    Corrupted(#[from] CrdtError),
}

/// One named collaborative document and everything attached to it.
///
/// All mutation happens behind a `tokio::sync::Mutex<Room>` held by the
/// registry; nothing here suspends.
pub struct Room {
    pub name: String,
    limits: RoomLimits,
    log: RoomLog,
    replica: Replica,
    sites: FxHashMap<u32, Site>,
    presence: FxHashMap<u32, SitePresence>,
    next_site_id: u32,
    created: SystemTime,
    last_activity: Instant,
    /// Log length at the last successful flush; `None` forces a write.
    last_flushed_len: Option<usize>,
}

impl Room {
    pub fn new(name: impl Into<String>, limits: RoomLimits) -> Self {
        Self {
            name: name.into(),
            limits,
            log: RoomLog::new(),
            replica: Replica::new(),
            sites: FxHashMap::default(),
            presence: FxHashMap::default(),
            next_site_id: UTIL_SITE_ID + 1,
            created: SystemTime::now(),
            last_activity: Instant::now(),
            last_flushed_len: None,
        }
    }

    /// Rebuild a room from a persisted event log.
    pub fn from_events(
        name: impl Into<String>,
        events: Vec<CrdtEvent>,
        created: SystemTime,
        limits: RoomLimits,
    ) -> Result<Self, CrdtError> {
        let mut room = Self::new(name, limits);
        room.replica = Replica::from_events(&events)?;
        for event in &events {
            room.next_site_id = room.next_site_id.max(event.gid().site_id + 1);
            room.log.append(*event);
        }
        room.created = created;
        room.last_flushed_len = Some(room.log.len());
        Ok(room)
    }

    /// Seed initial text under the utility site id.
    pub fn seed(&mut self, text: &str) -> Result<(), CrdtError> {
        let events = self
            .replica
            .apply_local(0, self.replica.visible_len(), text, UTIL_SITE_ID)?;
        for event in events {
            self.log.append(event);
        }
        Ok(())
    }

    /// Register a session: assign a site id and enqueue the join burst
    /// (site id, known presences, log backlog from `join_offset` on).
    pub fn connect(
        &mut self,
        outbound: mpsc::Sender<ServerMessage>,
        join_offset: usize,
    ) -> Result<u32, RoomError> {
        if self.sites.len() >= self.limits.sites_limit {
            return Err(RoomError::RoomFull {
                limit: self.limits.sites_limit,
            });
        }

        let site_id = self.next_site_id;
        self.next_site_id += 1;

        let site = Site {
            site_id,
            state: SessionState::AwaitingHello,
            joined_at_offset: join_offset,
            last_seen: Instant::now(),
            outbound,
        };

        let mut ok = site.push(ServerMessage::SetSiteId { site_id });
        for presence in self.presence.values() {
            ok &= site.push(ServerMessage::SitePresence(presence.clone()));
        }
        let backlog = self.log.since(join_offset);
        if !backlog.is_empty() {
            ok &= site.push(ServerMessage::CrdtEvents {
                events: backlog.to_vec(),
            });
        }
        if !ok {
            return Err(RoomError::Backpressure);
        }

        self.sites.insert(site_id, site);
        self.touch();
        log::info!("site {site_id} connected to room {}", self.name);
        Ok(site_id)
    }

    /// Append a batch from `sender` and fan it out to every other session.
    ///
    /// Events are committed one at a time, replica first, so the log never
    /// runs ahead of the materialized state; the first bad event stops the
    /// batch and the applied prefix stands.
    pub fn apply_events(&mut self, events: &[CrdtEvent], sender: u32) -> Result<(), RoomError> {
        self.activate(sender)?;

        for event in events {
            if let CrdtEvent::Insert { gid, .. } = event {
                if gid.site_id != sender {
                    return Err(RoomError::BadOrigin { site_id: sender });
                }
            }
        }
        if self.log.len() + events.len() > self.limits.log_hard_limit {
            return Err(RoomError::LogFull {
                len: self.log.len(),
                incoming: events.len(),
                limit: self.limits.log_hard_limit,
            });
        }

        let mut appended = Vec::with_capacity(events.len());
        let mut failure = None;
        for event in events {
            match self.replica.apply_remote(std::slice::from_ref(event)) {
                Ok(_) => {
                    self.log.append(*event);
                    appended.push(*event);
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if !appended.is_empty() {
            self.broadcast(
                &ServerMessage::CrdtEvents { events: appended },
                Some(sender),
            );
            self.touch();
        }

        match failure {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Record and broadcast a presence update. Every session receives it,
    /// the originator included.
    pub fn apply_presence(&mut self, presence: SitePresence, sender: u32) -> Result<(), RoomError> {
        if presence.site_id != sender {
            return Err(RoomError::BadOrigin { site_id: sender });
        }
        self.activate(sender)?;
        self.presence.insert(sender, presence.clone());
        self.broadcast(&ServerMessage::SitePresence(presence), None);
        self.touch();
        Ok(())
    }

    fn activate(&mut self, site_id: u32) -> Result<(), RoomError> {
        let site = self
            .sites
            .get_mut(&site_id)
            .ok_or(RoomError::UnknownSite { site_id })?;
        site.state = SessionState::Active;
        site.last_seen = Instant::now();
        Ok(())
    }

    /// Push to every session except `skip`, in append order. Sessions whose
    /// queue is full or gone are closed as slow.
    fn broadcast(&mut self, message: &ServerMessage, skip: Option<u32>) {
        let mut dead = Vec::new();
        for site in self.sites.values() {
            if Some(site.site_id) == skip {
                continue;
            }
            if !site.push(message.clone()) {
                dead.push(site.site_id);
            }
        }
        for site_id in dead {
            log::warn!(
                "site {site_id} queue overflow in room {}, closing as slow",
                self.name
            );
            self.disconnect(site_id);
        }
    }

    /// Remove a session and announce it. Dropping the site's sender wakes
    /// the session task, which tears the socket down.
    pub fn disconnect(&mut self, site_id: u32) -> bool {
        if self.sites.remove(&site_id).is_none() {
            return false;
        }
        self.presence.remove(&site_id);
        log::info!("site {site_id} disconnected from room {}", self.name);
        self.broadcast(&ServerMessage::SiteDisconnected { site_id }, None);
        self.touch();
        true
    }

    pub fn disconnect_all(&mut self) {
        for site_id in self.sites.keys().copied().collect::<Vec<_>>() {
            self.disconnect(site_id);
        }
    }

    /// Close sessions that have been silent past `deadline` or whose task
    /// is gone. Heartbeat emission itself lives with the session tasks;
    /// this is the backstop that reclaims their room-side state.
    pub fn gc_sessions(&mut self, deadline: Duration) -> usize {
        let mut dead = Vec::new();
        for site in self.sites.values() {
            if site.is_gone() || site.last_seen.elapsed() > deadline {
                dead.push(site.site_id);
            }
        }
        let count = dead.len();
        for site_id in dead {
            log::info!(
                "site {site_id} in room {} missed heartbeat deadline",
                self.name
            );
            self.disconnect(site_id);
        }
        count
    }

    pub fn needs_compaction(&self, bytes_threshold: usize, ops_threshold: usize) -> bool {
        self.log.bytes() > bytes_threshold || self.log.len() > ops_threshold
    }

    /// Force all sessions off and rebuild the log as the minimal insert
    /// chain reproducing the visible text. In-flight edits are lost by
    /// design; clients refresh and bootstrap against the compacted log.
    pub fn compact(&mut self) -> Result<(), CrdtError> {
        log::warn!(
            "compacting room {}: {} events, {} bytes",
            self.name,
            self.log.len(),
            self.log.bytes()
        );
        self.broadcast(&ServerMessage::CompactionRequired {}, None);
        self.disconnect_all();

        let events = self.replica.compacted();
        self.replica = Replica::from_events(&events)?;
        let mut log = RoomLog::new();
        for event in &events {
            log.append(*event);
        }
        self.log = log;
        self.last_flushed_len = None;
        self.touch();
        Ok(())
    }

    pub fn events(&self, offset: usize) -> Vec<CrdtEvent> {
        self.log.since(offset).to_vec()
    }

    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    pub fn log_bytes(&self) -> usize {
        self.log.bytes()
    }

    pub fn materialize(&self) -> String {
        self.replica.text()
    }

    pub fn has_active_sites(&self) -> bool {
        !self.sites.is_empty()
    }

    pub fn session_state(&self, site_id: u32) -> Option<SessionState> {
        self.sites.get(&site_id).map(|site| site.state)
    }

    pub fn site_count(&self) -> usize {
        self.sites.len()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn age(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.created)
            .unwrap_or_default()
    }

    pub fn created_unix(&self) -> u64 {
        self.created
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    pub fn needs_flush(&self) -> bool {
        self.last_flushed_len != Some(self.log.len())
    }

    pub fn mark_flushed(&mut self) {
        self.last_flushed_len = Some(self.log.len());
    }

    /// Record activity; the bootstrap read counts too, so freshly fetched
    /// rooms are not offloaded before their session arrives.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

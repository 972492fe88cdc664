//! Character-level sequence CRDT (Replicated Growable Array).
//!
//! Every character carries a globally unique [`GlobalId`]; the replica keeps
//! the full entry sequence including tombstones so that concurrent inserts
//! anchored on deleted characters still resolve. Integration is deterministic:
//! two replicas that have applied the same set of events hold the same text,
//! regardless of arrival order or duplication.
//!
//! ```text
//! editor edit (from, to, value)          remote events
//!        │                                    │
//!        ▼                                    ▼
//!  ┌──────────────┐   CrdtEvent batch   ┌──────────────┐
//!  │ apply_local  │ ──────────────────► │ apply_remote │
//!  └──────┬───────┘                     └──────┬───────┘
//!         │        [ CharEntry | CharEntry ]   │
//!         └──────────► backing sequence ◄──────┘
//!                           │
//!                           ▼
//!                  text() / TextUpdate
//! ```
//!
//! Reference: Kleppmann, DDIA Chapter 5 (leaderless replication);
//! Sypytkowski, "Operation-based CRDTs: arrays".

use std::fmt;

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Globally unique character identifier.
///
/// Ordering is lexicographic on `(counter, site_id)`. A site stamps new
/// characters with `(max counter observed anywhere + 1, own site id)`, which
/// guarantees uniqueness without coordination.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct GlobalId {
    pub counter: u64,
    #[serde(rename = "siteId")]
    pub site_id: u32,
}

impl GlobalId {
    pub fn new(counter: u64, site_id: u32) -> Self {
        Self { counter, site_id }
    }
}

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.counter, self.site_id)
    }
}

/// One replicated operation.
///
/// Wire shape: `{"type": "insert"|"delete", "gid": {...}, "char": ...,
/// "afterGid": ...}` with absent fields omitted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CrdtEvent {
    Insert {
        gid: GlobalId,
        #[serde(rename = "char")]
        ch: char,
        /// Anchor entry; `None` inserts at the head of the sequence.
        #[serde(
            rename = "afterGid",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        after_gid: Option<GlobalId>,
    },
    Delete { gid: GlobalId },
}

impl CrdtEvent {
    pub fn gid(&self) -> GlobalId {
        match self {
            CrdtEvent::Insert { gid, .. } | CrdtEvent::Delete { gid } => *gid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum OpKind {
    Insert,
    Delete,
}

/// One element of the backing sequence. Tombstones keep their slot so later
/// inserts can still anchor on them; they are dropped only at compaction.
#[derive(Debug, Clone)]
pub struct CharEntry {
    pub gid: GlobalId,
    pub ch: char,
    pub visible: bool,
}

/// A positional text change for the editor view, in Unicode scalar values.
///
/// Replace the visible range `[from, to)` with `text`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextUpdate {
    pub from: usize,
    pub to: usize,
    pub text: String,
}

#[derive(Debug, Error)]
pub enum CrdtError {
    /// A remote event referenced an id this replica has never seen. The
    /// session that delivered it can no longer be trusted.
    #[error("event references unknown id {0}")]
    StateCorrupted(GlobalId),
    /// Local edit bounds do not fit the visible text.
    #[error("invalid edit range {from}..{to} over visible length {len}")]
    InvalidRange { from: usize, to: usize, len: usize },
}

/// The per-site CRDT state.
pub struct Replica {
    entries: Vec<CharEntry>,
    /// Applied operations keyed by (kind, id), for idempotent delivery.
    applied: FxHashSet<(OpKind, GlobalId)>,
    max_counter: u64,
    visible_count: usize,
    /// Boundary cursor (entry index, visible entries before it). Serves both
    /// index-to-prefix and prefix-to-index queries; invalidated by mutations
    /// before the boundary. Keeps sequential edits O(1).
    cursor: Option<(usize, usize)>,
    /// Last edited entry index, seeds id lookups.
    find_hint: usize,
}

impl Default for Replica {
    fn default() -> Self {
        Self::new()
    }
}

impl Replica {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            applied: FxHashSet::default(),
            max_counter: 0,
            visible_count: 0,
            cursor: None,
            find_hint: 0,
        }
    }

    /// Rebuild a replica by replaying an event log.
    pub fn from_events(events: &[CrdtEvent]) -> Result<Self, CrdtError> {
        let mut replica = Self::new();
        replica.apply_remote(events)?;
        Ok(replica)
    }

    /// The materialized text: visible entries in sequence order.
    pub fn text(&self) -> String {
        self.entries
            .iter()
            .filter(|e| e.visible)
            .map(|e| e.ch)
            .collect()
    }

    /// Number of visible characters (Unicode scalar values).
    pub fn visible_len(&self) -> usize {
        self.visible_count
    }

    /// Total entries including tombstones.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn max_counter(&self) -> u64 {
        self.max_counter
    }

    /// Integrate a batch of foreign events, in order. Returns the positional
    /// changes the local view must reflect, with textually adjacent updates
    /// merged. Duplicates are ignored; an unknown reference fails the whole
    /// replica with [`CrdtError::StateCorrupted`].
    pub fn apply_remote(&mut self, events: &[CrdtEvent]) -> Result<Vec<TextUpdate>, CrdtError> {
        let mut updates: Vec<TextUpdate> = Vec::new();
        for event in events {
            if let Some(update) = self.integrate(event)? {
                push_merged(&mut updates, update);
            }
        }
        Ok(updates)
    }

    /// Translate a positional edit (replace visible `[from, to)` with
    /// `value`) into emittable events, applying them locally as a side
    /// effect. Deletes come first, then one insert per scalar value, each
    /// anchored on the entry to its left.
    pub fn apply_local(
        &mut self,
        from: usize,
        to: usize,
        value: &str,
        site_id: u32,
    ) -> Result<Vec<CrdtEvent>, CrdtError> {
        let len = self.visible_count;
        if from > to || to > len {
            return Err(CrdtError::InvalidRange { from, to, len });
        }

        let mut events = Vec::with_capacity((to - from) + value.len());

        let mut idx = self.index_of_visible(from);
        for _ in from..to {
            while !self.entries[idx].visible {
                idx += 1;
            }
            let event = CrdtEvent::Delete {
                gid: self.entries[idx].gid,
            };
            self.integrate(&event)?;
            events.push(event);
            idx += 1;
        }

        // The entry immediately left of the insertion point, tombstoned or
        // not; remote integration can always resolve it.
        let mut after_gid = match self.index_of_visible(from) {
            0 => None,
            i => Some(self.entries[i - 1].gid),
        };
        for ch in value.chars() {
            let gid = GlobalId::new(self.max_counter + 1, site_id);
            let event = CrdtEvent::Insert { gid, ch, after_gid };
            self.integrate(&event)?;
            events.push(event);
            after_gid = Some(gid);
        }

        Ok(events)
    }

    /// The minimal insert chain reproducing the current visible text: every
    /// visible entry keeps its id, re-anchored on its visible predecessor.
    /// Tombstones and their generating events are gone after replay.
    pub fn compacted(&self) -> Vec<CrdtEvent> {
        let mut events = Vec::with_capacity(self.visible_count);
        let mut prev: Option<GlobalId> = None;
        for entry in self.entries.iter().filter(|e| e.visible) {
            events.push(CrdtEvent::Insert {
                gid: entry.gid,
                ch: entry.ch,
                after_gid: prev,
            });
            prev = Some(entry.gid);
        }
        events
    }

    fn integrate(&mut self, event: &CrdtEvent) -> Result<Option<TextUpdate>, CrdtError> {
        match *event {
            CrdtEvent::Insert { gid, ch, after_gid } => self.integrate_insert(gid, ch, after_gid),
            CrdtEvent::Delete { gid } => self.integrate_delete(gid),
        }
    }

    fn integrate_insert(
        &mut self,
        gid: GlobalId,
        ch: char,
        after_gid: Option<GlobalId>,
    ) -> Result<Option<TextUpdate>, CrdtError> {
        if self.applied.contains(&(OpKind::Insert, gid)) {
            return Ok(None);
        }
        let mut idx = match after_gid {
            Some(after) => {
                self.find_gid(after)
                    .ok_or(CrdtError::StateCorrupted(after))?
                    + 1
            }
            None => 0,
        };
        // Siblings anchored on the same entry: greater ids sort earlier.
        while idx < self.entries.len() && self.entries[idx].gid > gid {
            idx += 1;
        }

        self.invalidate_from(idx);
        self.entries.insert(idx, CharEntry {
            gid,
            ch,
            visible: true,
        });
        self.applied.insert((OpKind::Insert, gid));
        self.max_counter = self.max_counter.max(gid.counter);
        self.visible_count += 1;
        self.find_hint = idx;

        let prefix = self.visible_prefix(idx);
        Ok(Some(TextUpdate {
            from: prefix,
            to: prefix,
            text: ch.to_string(),
        }))
    }

    fn integrate_delete(&mut self, gid: GlobalId) -> Result<Option<TextUpdate>, CrdtError> {
        if self.applied.contains(&(OpKind::Delete, gid)) {
            return Ok(None);
        }
        let idx = self
            .find_gid(gid)
            .ok_or(CrdtError::StateCorrupted(gid))?;
        self.applied.insert((OpKind::Delete, gid));
        if !self.entries[idx].visible {
            return Ok(None);
        }

        let prefix = self.visible_prefix(idx);
        self.entries[idx].visible = false;
        self.visible_count -= 1;
        self.invalidate_from(idx);
        self.find_hint = idx;

        Ok(Some(TextUpdate {
            from: prefix,
            to: prefix + 1,
            text: String::new(),
        }))
    }

    /// Entry index of `gid`, scanning outward from the last edited position.
    fn find_gid(&self, gid: GlobalId) -> Option<usize> {
        let n = self.entries.len();
        if n == 0 {
            return None;
        }
        let start = self.find_hint.min(n - 1);
        if self.entries[start].gid == gid {
            return Some(start);
        }
        let (mut left, mut right) = (start, start + 1);
        loop {
            let mut progressed = false;
            if right < n {
                if self.entries[right].gid == gid {
                    return Some(right);
                }
                right += 1;
                progressed = true;
            }
            if left > 0 {
                left -= 1;
                if self.entries[left].gid == gid {
                    return Some(left);
                }
                progressed = true;
            }
            if !progressed {
                return None;
            }
        }
    }

    /// Visible entries strictly before entry index `idx`.
    fn visible_prefix(&mut self, idx: usize) -> usize {
        let (mut at, mut vis) = match self.cursor {
            Some((c_idx, c_vis)) if c_idx <= idx => (c_idx, c_vis),
            _ => (0, 0),
        };
        while at < idx {
            if self.entries[at].visible {
                vis += 1;
            }
            at += 1;
        }
        self.cursor = Some((idx, vis));
        vis
    }

    /// Entry index of the visible entry at position `pos`, or the sequence
    /// length when `pos` equals the visible length.
    fn index_of_visible(&mut self, pos: usize) -> usize {
        let (mut at, mut vis) = match self.cursor {
            Some((c_idx, c_vis)) if c_vis <= pos => (c_idx, c_vis),
            _ => (0, 0),
        };
        while at < self.entries.len() && (vis < pos || !self.entries[at].visible) {
            if self.entries[at].visible {
                vis += 1;
            }
            at += 1;
        }
        self.cursor = Some((at, vis));
        at
    }

    /// Drop the boundary cursor if a mutation at `idx` shifted or recolored
    /// entries it counts past.
    fn invalidate_from(&mut self, idx: usize) {
        if let Some((c_idx, _)) = self.cursor {
            if c_idx > idx {
                self.cursor = None;
            }
        }
    }
}

/// Append `next`, merging it into the previous update when it starts exactly
/// where that one ended.
fn push_merged(updates: &mut Vec<TextUpdate>, next: TextUpdate) {
    if let Some(last) = updates.last_mut() {
        if next.from == last.from + last.text.chars().count() {
            last.to += next.to - next.from;
            last.text.push_str(&next.text);
            return;
        }
    }
    updates.push(next);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(counter: u64, site: u32, ch: char, after: Option<(u64, u32)>) -> CrdtEvent {
        CrdtEvent::Insert {
            gid: GlobalId::new(counter, site),
            ch,
            after_gid: after.map(|(c, s)| GlobalId::new(c, s)),
        }
    }

    fn delete(counter: u64, site: u32) -> CrdtEvent {
        CrdtEvent::Delete {
            gid: GlobalId::new(counter, site),
        }
    }

    #[test]
    fn gid_order_is_counter_then_site() {
        assert!(GlobalId::new(1, 1) < GlobalId::new(1, 2));
        assert!(GlobalId::new(2, 1) > GlobalId::new(1, 2));
    }

    #[test]
    fn sequential_inserts() {
        let mut replica = Replica::new();
        replica
            .apply_remote(&[
                insert(1, 1, 'a', None),
                insert(2, 1, 'c', Some((1, 1))),
                insert(3, 1, 'b', Some((1, 1))),
            ])
            .unwrap();
        assert_eq!(replica.text(), "abc");
    }

    #[test]
    fn concurrent_siblings_higher_id_sorts_earlier() {
        let mut replica = Replica::new();
        replica
            .apply_remote(&[
                insert(1, 1, 'a', None),
                insert(2, 3, 'c', Some((1, 1))),
                insert(2, 2, 'b', Some((1, 1))),
            ])
            .unwrap();
        assert_eq!(replica.text(), "acb");
    }

    #[test]
    fn delete_is_idempotent() {
        let mut replica = Replica::new();
        replica
            .apply_remote(&[
                insert(1, 1, 'a', None),
                insert(2, 1, 'c', Some((1, 1))),
                insert(3, 1, 'b', Some((1, 1))),
            ])
            .unwrap();
        replica.apply_remote(&[delete(1, 1)]).unwrap();
        let updates = replica.apply_remote(&[delete(1, 1)]).unwrap();
        assert!(updates.is_empty());
        assert_eq!(replica.text(), "bc");
    }

    #[test]
    fn duplicate_insert_is_ignored() {
        let mut replica = Replica::new();
        let event = insert(1, 1, 'a', None);
        replica.apply_remote(&[event, event]).unwrap();
        assert_eq!(replica.text(), "a");
        assert_eq!(replica.entry_count(), 1);
    }

    #[test]
    fn bulk_local_edit() {
        let mut replica = Replica::new();
        replica.apply_local(0, 0, "abracadabra", 0).unwrap();
        assert_eq!(replica.text(), "abracadabra");
        replica.apply_local(1, 11, "", 0).unwrap();
        assert_eq!(replica.text(), "a");
        assert_eq!(replica.visible_len(), 1);
    }

    #[test]
    fn local_edits_round_trip_to_fresh_replica() {
        let mut a = Replica::new();
        let mut events = a.apply_local(0, 0, "abracadabra", 0).unwrap();
        events.extend(a.apply_local(1, 11, "", 0).unwrap());

        let b = Replica::from_events(&events).unwrap();
        assert_eq!(b.text(), a.text());
        assert_eq!(b.text(), "a");
    }

    #[test]
    fn replace_in_the_middle() {
        let mut a = Replica::new();
        a.apply_local(0, 0, "hello world", 1).unwrap();
        let events = a.apply_local(6, 11, "crdt", 1).unwrap();
        assert_eq!(a.text(), "hello crdt");

        let mut b = Replica::new();
        b.apply_local(0, 0, "hello world", 1).unwrap();
        b.apply_remote(&events).unwrap();
        assert_eq!(b.text(), "hello crdt");
    }

    #[test]
    fn insert_anchored_on_tombstone_resolves() {
        let mut a = Replica::new();
        a.apply_local(0, 0, "ab", 1).unwrap();
        // Replace 'b'; the insert anchors on b's tombstone.
        let events = a.apply_local(1, 2, "x", 1).unwrap();
        assert_eq!(a.text(), "ax");

        let mut b = Replica::new();
        b.apply_local(0, 0, "ab", 1).unwrap();
        b.apply_remote(&events).unwrap();
        assert_eq!(b.text(), "ax");
    }

    #[test]
    fn unknown_anchor_fails() {
        let mut replica = Replica::new();
        let err = replica
            .apply_remote(&[insert(2, 1, 'x', Some((1, 9)))])
            .unwrap_err();
        assert!(matches!(err, CrdtError::StateCorrupted(_)));
    }

    #[test]
    fn unknown_delete_fails() {
        let mut replica = Replica::new();
        let err = replica.apply_remote(&[delete(7, 7)]).unwrap_err();
        assert!(matches!(err, CrdtError::StateCorrupted(_)));
    }

    #[test]
    fn invalid_ranges_are_rejected() {
        let mut replica = Replica::new();
        replica.apply_local(0, 0, "abc", 1).unwrap();
        assert!(matches!(
            replica.apply_local(2, 1, "", 1),
            Err(CrdtError::InvalidRange { .. })
        ));
        assert!(matches!(
            replica.apply_local(0, 4, "", 1),
            Err(CrdtError::InvalidRange { .. })
        ));
    }

    #[test]
    fn local_inserts_allocate_fresh_counters() {
        let mut replica = Replica::new();
        replica
            .apply_remote(&[insert(41, 7, 'z', None)])
            .unwrap();
        let events = replica.apply_local(1, 1, "ab", 3).unwrap();
        let counters: Vec<u64> = events.iter().map(|e| e.gid().counter).collect();
        assert_eq!(counters, vec![42, 43]);
        assert!(events.iter().all(|e| e.gid().site_id == 3));
    }

    #[test]
    fn remote_inserts_merge_into_one_update() {
        let mut source = Replica::new();
        let events = source.apply_local(0, 0, "abc", 1).unwrap();

        let mut sink = Replica::new();
        let updates = sink.apply_remote(&events).unwrap();
        assert_eq!(
            updates,
            vec![TextUpdate {
                from: 0,
                to: 0,
                text: "abc".to_string()
            }]
        );
    }

    #[test]
    fn remote_deletes_merge_into_one_update() {
        let mut source = Replica::new();
        let mut events = source.apply_local(0, 0, "abcd", 1).unwrap();
        events.extend(source.apply_local(1, 3, "", 1).unwrap());

        let mut sink = Replica::new();
        let updates = sink.apply_remote(&events).unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(
            updates[1],
            TextUpdate {
                from: 1,
                to: 3,
                text: String::new()
            }
        );
    }

    #[test]
    fn non_adjacent_updates_stay_separate() {
        let mut source = Replica::new();
        let seed = source.apply_local(0, 0, "abcd", 1).unwrap();
        let mut sink = Replica::from_events(&seed).unwrap();

        let mut events = source.apply_local(0, 1, "", 1).unwrap();
        events.extend(source.apply_local(2, 3, "", 1).unwrap());

        let updates = sink.apply_remote(&events).unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(sink.text(), source.text());
        assert_eq!(sink.text(), "bc");
    }

    #[test]
    fn multibyte_positions_count_scalars() {
        let mut replica = Replica::new();
        replica.apply_local(0, 0, "héllo", 1).unwrap();
        assert_eq!(replica.visible_len(), 5);
        replica.apply_local(1, 2, "e", 1).unwrap();
        assert_eq!(replica.text(), "hello");
    }

    #[test]
    fn compaction_preserves_text_and_counters() {
        let mut replica = Replica::new();
        replica.apply_local(0, 0, "to be or not", 4).unwrap();
        replica.apply_local(0, 3, "", 4).unwrap();
        let compacted = replica.compacted();

        let rebuilt = Replica::from_events(&compacted).unwrap();
        assert_eq!(rebuilt.text(), replica.text());
        assert_eq!(rebuilt.entry_count(), replica.visible_len());
        assert_eq!(rebuilt.max_counter(), replica.max_counter());
    }

    #[test]
    fn compaction_of_fully_deleted_text_is_empty() {
        let mut replica = Replica::new();
        replica.apply_local(0, 0, "scratch", 2).unwrap();
        replica.apply_local(0, 7, "", 2).unwrap();
        assert!(replica.compacted().is_empty());
    }

    #[test]
    fn event_wire_shape() {
        let event = insert(1, 2, 'a', None);
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(
            json,
            r#"{"type":"insert","gid":{"counter":1,"siteId":2},"char":"a"}"#
        );

        let event = delete(3, 4);
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"type":"delete","gid":{"counter":3,"siteId":4}}"#);
    }
}

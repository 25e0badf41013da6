use crossbeam::atomic::AtomicCell;
use dashmap::DashMap;

use crate::{GameRoom, PlayerId, PresenceRecord, RoomId, RoomStatus};

pub(crate) mod reconciler;

/// Where a replica write came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// Confirmed by the store's change feed
    Feed,
    /// Applied optimistically by a local lifecycle call, ahead of the feed
    Local,
}

struct Tagged<T> {
    value: T,
    /// Delivery sequence, drawn from one shared counter at apply time
    seq: u64,
    /// Optimistic entries are superseded by the first confirming feed write
    provisional: bool,
}

/// Process-local, eventually consistent view of the two store collections.
/// The store stays the single source of truth; this cache is derived from a
/// seed read and kept current by the change feed, with optimistic local
/// writes layered in by sequence number so conflicting writes to the same id
/// resolve deterministically.
#[derive(Default)]
pub struct ReplicaCache {
    rooms: DashMap<RoomId, Tagged<GameRoom>>,
    presence: DashMap<PlayerId, Tagged<PresenceRecord>>,
    seq: AtomicCell<u64>,
}

impl ReplicaCache {
    pub fn new() -> Self {
        Default::default()
    }

    fn tag<T>(&self, value: T, provenance: Provenance) -> Tagged<T> {
        Tagged {
            value,
            seq: self.seq.fetch_add(1),
            provisional: provenance == Provenance::Local,
        }
    }

    /// Merges a room row. Returns false if the write lost to a newer entry.
    pub fn apply_room(&self, room: GameRoom, provenance: Provenance) -> bool {
        let id = room.id.clone();
        let tag = self.tag(room, provenance);

        Self::merge(&self.rooms, id, tag)
    }

    /// Merges a presence row. Returns false if the write lost to a newer entry.
    pub fn apply_presence(&self, record: PresenceRecord, provenance: Provenance) -> bool {
        let id = record.id.clone();
        let tag = self.tag(record, provenance);

        Self::merge(&self.presence, id, tag)
    }

    fn merge<K, T>(map: &DashMap<K, Tagged<T>>, key: K, tag: Tagged<T>) -> bool
    where
        K: std::hash::Hash + Eq,
    {
        match map.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut existing) => {
                let current = existing.get();
                // Later delivery wins; a feed write always displaces an
                // optimistic one it confirms
                if tag.seq > current.seq || (current.provisional && !tag.provisional) {
                    existing.insert(tag);
                    true
                } else {
                    false
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(tag);
                true
            }
        }
    }

    /// The latest known state of a room, waiting or not
    pub fn room(&self, id: &RoomId) -> Option<GameRoom> {
        self.rooms.get(id).map(|tagged| tagged.value.clone())
    }

    /// The rooms still waiting for a second player, oldest first. Rooms that
    /// moved on from waiting drop out of this view but stay addressable by id.
    pub fn available_rooms(&self) -> Vec<GameRoom> {
        let mut rooms: Vec<_> = self
            .rooms
            .iter()
            .filter(|tagged| tagged.value.status == RoomStatus::Waiting)
            .map(|tagged| tagged.value.clone())
            .collect();

        rooms.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        rooms
    }

    /// Every presence row the replica knows about, unclassified
    pub fn presence(&self) -> Vec<PresenceRecord> {
        self.presence
            .iter()
            .map(|tagged| tagged.value.clone())
            .collect()
    }
}

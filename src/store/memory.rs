use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::{mapref::entry::Entry, DashMap};
use futures_util::stream;
use log::warn;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::util::random_string;

use super::{
    ChangeEvent, ChangeFeed, Collection, GameRoom, NewRoom, PlayerId, PresenceRecord,
    PresenceStatus, Result, RoomGuard, RoomId, RoomPatch, RoomStatus, Store,
};

const FEED_CAPACITY: usize = 256;
const ROOM_ID_LENGTH: usize = 16;

/// An in-process store, used as the backing store in tests and for offline
/// play. Clones share the same tables and feeds, so several lobbies can run
/// against one instance the way separate processes share a real store.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    presence: DashMap<PlayerId, PresenceRecord>,
    rooms: DashMap<RoomId, GameRoom>,
    presence_feed: broadcast::Sender<ChangeEvent>,
    room_feed: broadcast::Sender<ChangeEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (presence_feed, _) = broadcast::channel(FEED_CAPACITY);
        let (room_feed, _) = broadcast::channel(FEED_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                presence: Default::default(),
                rooms: Default::default(),
                presence_feed,
                room_feed,
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_presence(&self, filter: Option<PresenceStatus>) -> Result<Vec<PresenceRecord>> {
        let records = self
            .inner
            .presence
            .iter()
            .filter(|r| filter.map_or(true, |status| r.status == status))
            .map(|r| r.clone())
            .collect();

        Ok(records)
    }

    async fn list_rooms(&self, filter: Option<RoomStatus>) -> Result<Vec<GameRoom>> {
        let rooms = self
            .inner
            .rooms
            .iter()
            .filter(|r| filter.map_or(true, |status| r.status == status))
            .map(|r| r.clone())
            .collect();

        Ok(rooms)
    }

    async fn upsert_presence(&self, mut record: PresenceRecord) -> Result<()> {
        match self.inner.presence.entry(record.id.clone()) {
            Entry::Occupied(mut existing) => {
                // last_seen_at never moves backward for a given player
                record.last_seen_at = record.last_seen_at.max(existing.get().last_seen_at);
                existing.insert(record.clone());
            }
            Entry::Vacant(vacant) => {
                vacant.insert(record.clone());
            }
        }

        let _ = self.inner.presence_feed.send(ChangeEvent::Presence(record));
        Ok(())
    }

    async fn insert_room(&self, new_room: NewRoom) -> Result<GameRoom> {
        let room = GameRoom {
            id: random_string(ROOM_ID_LENGTH),
            game_kind: new_room.game_kind,
            status: RoomStatus::Waiting,
            created_at: Utc::now(),
            created_by: new_room.created_by.clone(),
            player1_id: new_room.created_by,
            player2_id: None,
            current_state: Value::Null,
            winner_id: None,
        };

        self.inner.rooms.insert(room.id.clone(), room.clone());

        let _ = self.inner.room_feed.send(ChangeEvent::Room(room.clone()));
        Ok(room)
    }

    async fn update_room_where(
        &self,
        room_id: &RoomId,
        guard: RoomGuard,
        patch: RoomPatch,
    ) -> Result<u64> {
        // The guard is evaluated and the patch applied under the row's map
        // guard, so racing updates observe each other's writes
        let updated = match self.inner.rooms.get_mut(room_id) {
            Some(mut room) if guard.matches(&room) => {
                patch.apply_to(&mut room);
                Some(room.clone())
            }
            _ => None,
        };

        match updated {
            Some(room) => {
                let _ = self.inner.room_feed.send(ChangeEvent::Room(room));
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn subscribe(&self, collection: Collection) -> Result<ChangeFeed> {
        let receiver = match collection {
            Collection::Presence => self.inner.presence_feed.subscribe(),
            Collection::Rooms => self.inner.room_feed.subscribe(),
        };

        let feed = stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => return Some((event, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("change feed lagged, {skipped} events skipped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(Box::pin(feed))
    }
}

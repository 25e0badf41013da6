use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::Value;
use thiserror::Error;

mod data;
pub use data::*;

mod memory;
pub use memory::*;

mod pg;
pub use pg::*;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached, or the call failed in transit.
    /// Safe to retry.
    #[error("store unavailable: {0}")]
    Unavailable(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// A row could not be decoded into the entity schema
    #[error("malformed {resource} row: {detail}")]
    Malformed {
        resource: &'static str,
        detail: String,
    },
}

/// The two row collections the lobby works with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    Presence,
    Rooms,
}

/// A change-feed item carrying the latest state of an inserted or updated row
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    Presence(PresenceRecord),
    Room(GameRoom),
}

/// An ordered stream of change events for one collection.
/// The stream ends when the underlying subscription is lost; resubscribing
/// is the caller's responsibility.
pub type ChangeFeed = BoxStream<'static, ChangeEvent>;

/// Fields for a room insert. Everything else is filled in by the store.
#[derive(Debug)]
pub struct NewRoom {
    pub game_kind: String,
    /// The host of the new room
    pub created_by: PlayerId,
}

/// Predicate a conditional room update is gated on, evaluated against the
/// row's current state at write time
#[derive(Debug, Clone)]
pub enum RoomGuard {
    /// The room currently has the given status
    StatusIs(RoomStatus),
    /// The player currently holds either seat of the room
    OccupiedBy(PlayerId),
}

/// Partial update applied to a room row when its guard holds
#[derive(Debug, Clone, Default)]
pub struct RoomPatch {
    pub status: Option<RoomStatus>,
    pub player2_id: Option<PlayerId>,
    pub winner_id: Option<PlayerId>,
    pub current_state: Option<Value>,
}

impl RoomGuard {
    /// Evaluates the predicate against an in-memory row
    pub fn matches(&self, room: &GameRoom) -> bool {
        match self {
            Self::StatusIs(status) => room.status == *status,
            Self::OccupiedBy(player) => room.occupied_by(player),
        }
    }
}

impl RoomPatch {
    /// The waiting → playing transition taken when a second player wins the seat
    pub fn join(player: PlayerId) -> Self {
        Self {
            status: Some(RoomStatus::Playing),
            player2_id: Some(player),
            ..Default::default()
        }
    }

    /// The terminal transition, with the decided winner if there is one
    pub fn finish(winner: Option<PlayerId>) -> Self {
        Self {
            status: Some(RoomStatus::Finished),
            winner_id: winner,
            ..Default::default()
        }
    }

    /// Replaces the opaque per-game payload
    pub fn state(state: Value) -> Self {
        Self {
            current_state: Some(state),
            ..Default::default()
        }
    }

    pub fn apply_to(&self, room: &mut GameRoom) {
        if let Some(status) = self.status {
            room.status = status;
        }

        if let Some(player2_id) = &self.player2_id {
            room.player2_id = Some(player2_id.clone());
        }

        if let Some(winner_id) = &self.winner_id {
            room.winner_id = Some(winner_id.clone());
        }

        if let Some(current_state) = &self.current_state {
            room.current_state = current_state.clone();
        }
    }
}

/// Represents a backing store the lobby can run against: point reads and
/// writes on the two collections, a conditional update as the sole
/// cross-process concurrency primitive, and a change feed per collection.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Bulk read used to seed the replica at startup and after a feed outage
    async fn list_presence(&self, filter: Option<PresenceStatus>) -> Result<Vec<PresenceRecord>>;
    async fn list_rooms(&self, filter: Option<RoomStatus>) -> Result<Vec<GameRoom>>;

    /// Inserts or replaces the player's presence row, keyed by id.
    /// `last_seen_at` must never move backward for a given player.
    async fn upsert_presence(&self, record: PresenceRecord) -> Result<()>;

    async fn insert_room(&self, new_room: NewRoom) -> Result<GameRoom>;

    /// Applies the patch only if the guard holds for the row at write time,
    /// reporting how many rows were affected (0 or 1)
    async fn update_room_where(
        &self,
        room_id: &RoomId,
        guard: RoomGuard,
        patch: RoomPatch,
    ) -> Result<u64>;

    /// Subscribes to a collection's insert/update feed
    async fn subscribe(&self, collection: Collection) -> Result<ChangeFeed>;
}

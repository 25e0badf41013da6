use log::info;
use serde_json::Value;
use thiserror::Error;

use crate::{
    GameRoom, LobbyContext, NewRoom, PlayerId, Provenance, RoomGuard, RoomId, RoomPatch,
    RoomStatus, Store, StoreError,
};

/// Implements the create/join/leave state machine over the store's
/// conditional updates. Cross-process join races are resolved entirely by
/// the store's guard; this side only decides what to ask for and mirrors
/// successful writes into the replica ahead of feed confirmation.
pub struct RoomManager<S> {
    context: LobbyContext<S>,
}

#[derive(Debug, Error)]
pub enum RoomError {
    /// No authenticated player id is attached to this session
    #[error("No authenticated player")]
    Unauthenticated,
    /// The room is already taken, finished, or gone. Expected under
    /// contention; retrying will not help.
    #[error("Room is not available")]
    RoomUnavailable,
    /// The backing store could not be reached. Safe to retry.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl<S> RoomManager<S>
where
    S: Store,
{
    pub(crate) fn new(context: &LobbyContext<S>) -> Self {
        Self {
            context: context.clone(),
        }
    }

    fn caller(&self) -> Result<PlayerId, RoomError> {
        self.context.session.player().ok_or(RoomError::Unauthenticated)
    }

    /// Creates a new waiting room hosted by the caller
    pub async fn create_room(&self, game_kind: &str) -> Result<GameRoom, RoomError> {
        let caller = self.caller()?;

        let room = self
            .context
            .store
            .insert_room(NewRoom {
                game_kind: game_kind.to_string(),
                created_by: caller,
            })
            .await?;

        // Visible locally right away, so the host never sees a gap between
        // creating the room and the feed confirming it
        self.context.apply_room(room.clone(), Provenance::Local);
        self.context.session.enter_room(room.id.clone());

        info!("created {} room {}", room.game_kind, room.id);
        Ok(room)
    }

    /// Takes the second seat of a waiting room. When two players race for
    /// it, the store's guard lets exactly one write through; the loser gets
    /// [RoomError::RoomUnavailable] and should pick another room.
    pub async fn join_room(&self, room_id: &RoomId) -> Result<(), RoomError> {
        let caller = self.caller()?;

        // A host cannot take the second seat of their own room
        let hosted_by_caller = self
            .context
            .replica
            .room(room_id)
            .map_or(false, |room| room.player1_id == caller);

        if hosted_by_caller {
            return Err(RoomError::RoomUnavailable);
        }

        let guard = RoomGuard::StatusIs(RoomStatus::Waiting);
        let patch = RoomPatch::join(caller);

        let affected = self
            .context
            .store
            .update_room_where(room_id, guard.clone(), patch.clone())
            .await?;

        // Zero rows means the guard no longer held: the seat is taken or the
        // room is finished or gone. That verdict is authoritative.
        if affected == 0 {
            return Err(RoomError::RoomUnavailable);
        }

        self.patch_replica(room_id, &guard, patch);
        self.context.session.enter_room(room_id.clone());

        info!("joined room {room_id}");
        Ok(())
    }

    /// Finishes the room if the caller occupies it. Finished is terminal,
    /// so leaving twice, or a room someone else already closed, is a no-op
    /// success rather than an error.
    pub async fn leave_room(&self, room_id: &RoomId) -> Result<(), RoomError> {
        let caller = self.caller()?;

        let guard = RoomGuard::OccupiedBy(caller);
        let patch = RoomPatch::finish(None);

        self.context
            .store
            .update_room_where(room_id, guard.clone(), patch.clone())
            .await?;

        self.patch_replica(room_id, &guard, patch);
        self.context.session.exit_room(room_id);

        info!("left room {room_id}");
        Ok(())
    }

    /// Records the decided outcome and finishes the room. How the mini-game
    /// hosting the room reports that the match concluded.
    pub async fn report_outcome(
        &self,
        room_id: &RoomId,
        winner: Option<PlayerId>,
    ) -> Result<(), RoomError> {
        let caller = self.caller()?;

        let guard = RoomGuard::OccupiedBy(caller);
        let patch = RoomPatch::finish(winner);

        self.context
            .store
            .update_room_where(room_id, guard.clone(), patch.clone())
            .await?;

        self.patch_replica(room_id, &guard, patch);
        self.context.session.exit_room(room_id);

        Ok(())
    }

    /// Replaces the room's opaque per-game payload. The payload belongs to
    /// the mini-game; nothing here looks inside it.
    pub async fn sync_state(&self, room_id: &RoomId, state: Value) -> Result<(), RoomError> {
        let caller = self.caller()?;

        let guard = RoomGuard::OccupiedBy(caller);
        let patch = RoomPatch::state(state);

        self.context
            .store
            .update_room_where(room_id, guard.clone(), patch.clone())
            .await?;

        self.patch_replica(room_id, &guard, patch);
        Ok(())
    }

    /// Mirrors a successful conditional write into the replica, gated by the
    /// same guard so a feed event that already landed is not reverted
    fn patch_replica(&self, room_id: &RoomId, guard: &RoomGuard, patch: RoomPatch) {
        let Some(mut room) = self.context.replica.room(room_id) else {
            return;
        };

        if guard.matches(&room) {
            patch.apply_to(&mut room);
            self.context.apply_room(room, Provenance::Local);
        }
    }
}

use std::sync::Arc;

use parking_lot::RwLock;

use crate::{PlayerId, RoomId};

/// Shared handle to the locally signed-in player. Identity issuance is
/// external; the session only holds the opaque id it was handed, plus the
/// room the player currently occupies.
#[derive(Clone, Default)]
pub struct Session {
    inner: Arc<SessionInner>,
}

#[derive(Default)]
struct SessionInner {
    player: RwLock<Option<PlayerId>>,
    room: RwLock<Option<RoomId>>,
}

impl Session {
    pub fn new() -> Self {
        Default::default()
    }

    /// Attaches an externally authenticated player id to this process
    pub fn authenticate(&self, player: PlayerId) {
        *self.inner.player.write() = Some(player);
    }

    /// Detaches the player id, e.g. on sign-out
    pub fn clear(&self) {
        *self.inner.player.write() = None;
        *self.inner.room.write() = None;
    }

    pub fn player(&self) -> Option<PlayerId> {
        self.inner.player.read().clone()
    }

    /// The room the local player occupies, if any
    pub fn current_room(&self) -> Option<RoomId> {
        self.inner.room.read().clone()
    }

    pub(crate) fn enter_room(&self, room: RoomId) {
        *self.inner.room.write() = Some(room);
    }

    pub(crate) fn exit_room(&self, room: &RoomId) {
        let mut current = self.inner.room.write();

        if current.as_ref() == Some(room) {
            *current = None;
        }
    }
}

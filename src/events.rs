use crossbeam::channel::{Receiver, Sender};

use crate::{GameRoom, PresenceRecord};

pub type EventSender = Sender<LobbyEvent>;
pub type EventReceiver = Receiver<LobbyEvent>;

/// Events emitted as local and remote changes land in the replica
#[derive(Debug, Clone)]
pub enum LobbyEvent {
    /// A player's presence row changed
    PresenceChanged { record: PresenceRecord },
    /// A room changed, including rooms no longer in the waiting view
    RoomChanged { room: GameRoom },
    /// The set of rooms still waiting for a second player changed
    AvailableRoomsChanged { rooms: Vec<GameRoom> },
}

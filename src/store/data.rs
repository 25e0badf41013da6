use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The type used for player identifiers. Issued by the external auth layer.
pub type PlayerId = String;

/// The type used for room identifiers. Generated by the store at insert time.
pub type RoomId = String;

/// A player's liveness row, refreshed by periodic heartbeat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub id: PlayerId,
    /// Never moves backward for a given player
    pub last_seen_at: DateTime<Utc>,
    pub status: PresenceStatus,
    /// The room the player occupies while in a game
    pub current_room: Option<RoomId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    InGame,
    Offline,
}

/// A two-player matchmaking room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameRoom {
    pub id: RoomId,
    /// Which mini-game the room hosts. Never interpreted here.
    pub game_kind: String,
    pub status: RoomStatus,
    pub created_at: DateTime<Utc>,
    pub created_by: PlayerId,
    /// The host, set at creation
    pub player1_id: PlayerId,
    /// The second seat, taken exactly once at the waiting → playing transition
    pub player2_id: Option<PlayerId>,
    /// Opaque payload owned by the specific mini-game
    pub current_state: Value,
    /// Set when the room finished with a decided outcome
    pub winner_id: Option<PlayerId>,
}

/// Moves strictly forward: waiting → playing → finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    Waiting,
    Playing,
    Finished,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::InGame => "in_game",
            Self::Offline => "offline",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "online" => Some(Self::Online),
            "in_game" => Some(Self::InGame),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }
}

impl RoomStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Playing => "playing",
            Self::Finished => "finished",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "waiting" => Some(Self::Waiting),
            "playing" => Some(Self::Playing),
            "finished" => Some(Self::Finished),
            _ => None,
        }
    }
}

impl PresenceRecord {
    /// Whether the record saw a heartbeat within the freshness window
    pub fn is_fresh(&self, now: DateTime<Utc>, window: Duration) -> bool {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        now.signed_duration_since(self.last_seen_at) <= window
    }

    /// The status a consumer should trust at read time. A record whose
    /// heartbeats stopped reads as offline no matter what it stores.
    pub fn classify(&self, now: DateTime<Utc>, window: Duration) -> PresenceStatus {
        if self.is_fresh(now, window) {
            self.status
        } else {
            PresenceStatus::Offline
        }
    }
}

impl GameRoom {
    /// Whether the player holds either seat of the room
    pub fn occupied_by(&self, player: &PlayerId) -> bool {
        self.player1_id == *player || self.player2_id.as_ref() == Some(player)
    }
}

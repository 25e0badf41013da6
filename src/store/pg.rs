use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream;
use log::warn;
use serde_json::Value;
use sqlx::{
    postgres::{PgListener, PgPoolOptions, PgRow},
    PgPool, Postgres, QueryBuilder, Row,
};

use crate::util::random_string;

use super::{
    ChangeEvent, ChangeFeed, Collection, GameRoom, NewRoom, PresenceRecord, PresenceStatus, Result,
    RoomGuard, RoomId, RoomPatch, RoomStatus, Store, StoreError,
};

const PRESENCE_CHANNEL: &str = "parlor_presence";
const ROOMS_CHANNEL: &str = "parlor_rooms";
const ROOM_ID_LENGTH: usize = 16;

/// A postgres store. Change feeds are LISTEN/NOTIFY channels fed by
/// row-to-json triggers, which [PgStore::migrate] installs.
///
/// Note: pg_notify payloads are capped at 8000 bytes, so a mini-game keeping
/// an unusually large `current_state` should store a reference rather than
/// the state itself.
pub struct PgStore {
    pool: PgPool,
}

/// Helper trait to reduce boilerplate
trait IntoStoreError {
    fn unavailable(self) -> StoreError;
}

impl IntoStoreError for sqlx::Error {
    fn unavailable(self) -> StoreError {
        StoreError::Unavailable(Box::new(self))
    }
}

const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS presence (
        id TEXT PRIMARY KEY,
        last_seen_at TIMESTAMPTZ NOT NULL,
        status TEXT NOT NULL,
        current_room TEXT
    )",
    "CREATE TABLE IF NOT EXISTS game_rooms (
        id TEXT PRIMARY KEY,
        game_kind TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        created_by TEXT NOT NULL,
        player1_id TEXT NOT NULL,
        player2_id TEXT,
        current_state JSONB NOT NULL DEFAULT 'null'::jsonb,
        winner_id TEXT
    )",
    "CREATE OR REPLACE FUNCTION parlor_notify_presence() RETURNS trigger AS $$
    BEGIN
        PERFORM pg_notify('parlor_presence', row_to_json(NEW)::text);
        RETURN NEW;
    END;
    $$ LANGUAGE plpgsql",
    "CREATE OR REPLACE FUNCTION parlor_notify_rooms() RETURNS trigger AS $$
    BEGIN
        PERFORM pg_notify('parlor_rooms', row_to_json(NEW)::text);
        RETURN NEW;
    END;
    $$ LANGUAGE plpgsql",
    "DROP TRIGGER IF EXISTS presence_changes ON presence",
    "CREATE TRIGGER presence_changes
        AFTER INSERT OR UPDATE ON presence
        FOR EACH ROW EXECUTE FUNCTION parlor_notify_presence()",
    "DROP TRIGGER IF EXISTS game_room_changes ON game_rooms",
    "CREATE TRIGGER game_room_changes
        AFTER INSERT OR UPDATE ON game_rooms
        FOR EACH ROW EXECUTE FUNCTION parlor_notify_rooms()",
];

impl PgStore {
    pub async fn new(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| e.unavailable())?;

        Ok(Self { pool })
    }

    /// Creates the tables and change-feed triggers if they don't exist yet
    pub async fn migrate(&self) -> Result<()> {
        for statement in MIGRATIONS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| e.unavailable())?;
        }

        Ok(())
    }
}

fn presence_from_row(row: &PgRow) -> Result<PresenceRecord> {
    let malformed = |detail: String| StoreError::Malformed {
        resource: "presence",
        detail,
    };

    let status: String = row.try_get("status").map_err(|e| malformed(e.to_string()))?;

    Ok(PresenceRecord {
        id: row.try_get("id").map_err(|e| malformed(e.to_string()))?,
        last_seen_at: row
            .try_get("last_seen_at")
            .map_err(|e| malformed(e.to_string()))?,
        status: PresenceStatus::parse(&status)
            .ok_or_else(|| malformed(format!("unknown status {status}")))?,
        current_room: row
            .try_get("current_room")
            .map_err(|e| malformed(e.to_string()))?,
    })
}

fn room_from_row(row: &PgRow) -> Result<GameRoom> {
    let malformed = |detail: String| StoreError::Malformed {
        resource: "room",
        detail,
    };

    let status: String = row.try_get("status").map_err(|e| malformed(e.to_string()))?;

    Ok(GameRoom {
        id: row.try_get("id").map_err(|e| malformed(e.to_string()))?,
        game_kind: row
            .try_get("game_kind")
            .map_err(|e| malformed(e.to_string()))?,
        status: RoomStatus::parse(&status)
            .ok_or_else(|| malformed(format!("unknown status {status}")))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| malformed(e.to_string()))?,
        created_by: row
            .try_get("created_by")
            .map_err(|e| malformed(e.to_string()))?,
        player1_id: row
            .try_get("player1_id")
            .map_err(|e| malformed(e.to_string()))?,
        player2_id: row
            .try_get("player2_id")
            .map_err(|e| malformed(e.to_string()))?,
        current_state: row
            .try_get("current_state")
            .map_err(|e| malformed(e.to_string()))?,
        winner_id: row
            .try_get("winner_id")
            .map_err(|e| malformed(e.to_string()))?,
    })
}

fn parse_notification(channel: &str, payload: &str) -> Result<ChangeEvent> {
    if channel == PRESENCE_CHANNEL {
        serde_json::from_str(payload)
            .map(ChangeEvent::Presence)
            .map_err(|e| StoreError::Malformed {
                resource: "presence",
                detail: e.to_string(),
            })
    } else {
        serde_json::from_str(payload)
            .map(ChangeEvent::Room)
            .map_err(|e| StoreError::Malformed {
                resource: "room",
                detail: e.to_string(),
            })
    }
}

#[async_trait]
impl Store for PgStore {
    async fn list_presence(&self, filter: Option<PresenceStatus>) -> Result<Vec<PresenceRecord>> {
        let rows = match filter {
            Some(status) => {
                sqlx::query("SELECT * FROM presence WHERE status = $1")
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query("SELECT * FROM presence")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| e.unavailable())?;

        rows.iter().map(presence_from_row).collect()
    }

    async fn list_rooms(&self, filter: Option<RoomStatus>) -> Result<Vec<GameRoom>> {
        let rows = match filter {
            Some(status) => {
                sqlx::query("SELECT * FROM game_rooms WHERE status = $1")
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query("SELECT * FROM game_rooms")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| e.unavailable())?;

        rows.iter().map(room_from_row).collect()
    }

    async fn upsert_presence(&self, record: PresenceRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO presence (id, last_seen_at, status, current_room)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (id) DO UPDATE SET
                last_seen_at = GREATEST(presence.last_seen_at, EXCLUDED.last_seen_at),
                status = EXCLUDED.status,
                current_room = EXCLUDED.current_room",
        )
        .bind(&record.id)
        .bind(record.last_seen_at)
        .bind(record.status.as_str())
        .bind(&record.current_room)
        .execute(&self.pool)
        .await
        .map_err(|e| e.unavailable())?;

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

        sqlx::query(
            "INSERT INTO game_rooms
                (id, game_kind, status, created_at, created_by,
                 player1_id, player2_id, current_state, winner_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(&room.id)
        .bind(&room.game_kind)
        .bind(room.status.as_str())
        .bind(room.created_at)
        .bind(&room.created_by)
        .bind(&room.player1_id)
        .bind(&room.player2_id)
        .bind(&room.current_state)
        .bind(&room.winner_id)
        .execute(&self.pool)
        .await
        .map_err(|e| e.unavailable())?;

        Ok(room)
    }

    async fn update_room_where(
        &self,
        room_id: &RoomId,
        guard: RoomGuard,
        patch: RoomPatch,
    ) -> Result<u64> {
        let mut query: QueryBuilder<Postgres> = QueryBuilder::new("UPDATE game_rooms SET ");

        {
            let mut set = query.separated(", ");
            let mut empty = true;

            if let Some(status) = patch.status {
                set.push("status = ");
                set.push_bind_unseparated(status.as_str());
                empty = false;
            }

            if let Some(player2_id) = patch.player2_id {
                set.push("player2_id = ");
                set.push_bind_unseparated(player2_id);
                empty = false;
            }

            if let Some(winner_id) = patch.winner_id {
                set.push("winner_id = ");
                set.push_bind_unseparated(winner_id);
                empty = false;
            }

            if let Some(current_state) = patch.current_state {
                set.push("current_state = ");
                set.push_bind_unseparated(current_state);
                empty = false;
            }

            if empty {
                return Ok(0);
            }
        }

        query.push(" WHERE id = ");
        query.push_bind(room_id.clone());

        // The guard re-reads the row at write time inside the store, which is
        // what makes racing updates resolve to a single winner
        match guard {
            RoomGuard::StatusIs(status) => {
                query.push(" AND status = ");
                query.push_bind(status.as_str());
            }
            RoomGuard::OccupiedBy(player) => {
                query.push(" AND (player1_id = ");
                query.push_bind(player.clone());
                query.push(" OR player2_id = ");
                query.push_bind(player);
                query.push(")");
            }
        }

        let result = query
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| e.unavailable())?;

        Ok(result.rows_affected())
    }

    async fn subscribe(&self, collection: Collection) -> Result<ChangeFeed> {
        let channel = match collection {
            Collection::Presence => PRESENCE_CHANNEL,
            Collection::Rooms => ROOMS_CHANNEL,
        };

        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| e.unavailable())?;

        listener.listen(channel).await.map_err(|e| e.unavailable())?;

        let feed = stream::unfold(listener, |mut listener| async move {
            loop {
                // Ending the stream hands reconnection to the subscriber
                let notification = match listener.recv().await {
                    Ok(notification) => notification,
                    Err(_) => return None,
                };

                match parse_notification(notification.channel(), notification.payload()) {
                    Ok(event) => return Some((event, listener)),
                    Err(e) => {
                        warn!("dropping undecodable change event: {e}");
                        continue;
                    }
                }
            }
        });

        Ok(Box::pin(feed))
    }
}

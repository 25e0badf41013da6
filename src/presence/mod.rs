use chrono::Utc;
use log::warn;

use crate::{LobbyContext, PresenceRecord, PresenceStatus, Store};

/// Periodically asserts the local player's liveness. Going offline needs no
/// write of its own: once the loop stops, the record goes stale and other
/// processes classify it offline at read time.
pub(crate) async fn run<S>(context: LobbyContext<S>)
where
    S: Store,
{
    let mut ticker = tokio::time::interval(context.config.heartbeat_interval);

    loop {
        // The first tick completes immediately, so presence lands as soon as
        // the lobby starts rather than one interval later
        ticker.tick().await;

        let Some(player) = context.session.player() else {
            continue;
        };

        // Fire and forget: a failed beat only makes us look stale a little
        // sooner, and the next tick retries
        if let Err(e) = context.store.upsert_presence(beat(&context, player)).await {
            warn!("presence heartbeat failed: {e}");
        }
    }
}

/// The row the heartbeat asserts, reflecting whether the local player
/// currently occupies a room
fn beat<S>(context: &LobbyContext<S>, player: String) -> PresenceRecord
where
    S: Store,
{
    let current_room = context.session.current_room();

    let status = if current_room.is_some() {
        PresenceStatus::InGame
    } else {
        PresenceStatus::Online
    };

    PresenceRecord {
        id: player,
        last_seen_at: Utc::now(),
        status,
        current_room,
    }
}

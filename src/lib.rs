mod config;
mod events;
mod presence;
mod replica;
mod rooms;
mod session;
mod store;
mod util;

use std::sync::Arc;

use chrono::Utc;
use crossbeam::channel::unbounded;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

pub use config::*;
pub use events::*;
pub use replica::{Provenance, ReplicaCache};
pub use rooms::*;
pub use session::*;
pub use store::*;

/// The parlor lobby, tracking who is online and matching players into
/// two-player game rooms over a shared backing store.
pub struct Lobby<S> {
    context: LobbyContext<S>,
    event_receiver: EventReceiver,
    /// The background loops, alive between [Lobby::start] and [Lobby::shutdown]
    tasks: Mutex<Vec<JoinHandle<()>>>,

    pub session: Session,
    pub rooms: RoomManager<S>,
}

/// A type passed to the lobby's components, to access shared state and emit
/// events
pub struct LobbyContext<S> {
    pub config: Config,
    pub store: Arc<S>,
    pub session: Session,
    pub replica: Arc<ReplicaCache>,

    event_sender: EventSender,
}

impl<S> Lobby<S>
where
    S: Store,
{
    pub fn new(store: S, config: Config) -> Self {
        let (event_sender, event_receiver) = unbounded();

        let context = LobbyContext {
            config,
            store: Arc::new(store),
            session: Session::new(),
            replica: Arc::new(ReplicaCache::new()),
            event_sender,
        };

        let rooms = RoomManager::new(&context);

        Self {
            session: context.session.clone(),
            rooms,
            event_receiver,
            tasks: Mutex::new(Vec::new()),
            context,
        }
    }

    /// Spawns the change feed reconcilers and the presence heartbeat.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();

        if !tasks.is_empty() {
            return;
        }

        tasks.push(tokio::spawn(replica::reconciler::run(
            self.context.clone(),
            Collection::Rooms,
        )));

        tasks.push(tokio::spawn(replica::reconciler::run(
            self.context.clone(),
            Collection::Presence,
        )));

        tasks.push(tokio::spawn(presence::run(self.context.clone())));
    }

    /// Stops the background loops. In-flight store calls are dropped with
    /// them, so nothing lands in the replica afterwards.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// The rooms still waiting for a second player
    pub fn available_rooms(&self) -> Vec<GameRoom> {
        self.context.replica.available_rooms()
    }

    /// The latest known state of a room, waiting or not
    pub fn room(&self, id: &RoomId) -> Option<GameRoom> {
        self.context.replica.room(id)
    }

    /// The players currently credible as present: records whose heartbeats
    /// stopped are classified offline at read time and dropped, no matter
    /// what status they still store.
    pub fn online_players(&self) -> Vec<PresenceRecord> {
        let now = Utc::now();
        let window = self.context.config.presence_freshness;

        self.context
            .replica
            .presence()
            .into_iter()
            .filter(|record| record.classify(now, window) != PresenceStatus::Offline)
            .collect()
    }

    /// Receive events from the lobby
    pub fn events(&self) -> EventReceiver {
        self.event_receiver.clone()
    }
}

impl<S> LobbyContext<S>
where
    S: Store,
{
    pub(crate) fn emit(&self, event: LobbyEvent) {
        // The receiver may already be gone during teardown
        let _ = self.event_sender.send(event);
    }

    /// Merges a room into the replica and, if the write landed, notifies
    /// consumers of the room and of the recomputed waiting view
    pub(crate) fn apply_room(&self, room: GameRoom, provenance: Provenance) {
        if self.replica.apply_room(room.clone(), provenance) {
            self.emit(LobbyEvent::RoomChanged { room });
            self.emit(LobbyEvent::AvailableRoomsChanged {
                rooms: self.replica.available_rooms(),
            });
        }
    }

    /// Merges a presence row into the replica and notifies consumers
    pub(crate) fn apply_presence(&self, record: PresenceRecord, provenance: Provenance) {
        if self.replica.apply_presence(record.clone(), provenance) {
            self.emit(LobbyEvent::PresenceChanged { record });
        }
    }
}

impl<S> Clone for LobbyContext<S>
where
    S: Store,
{
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            store: self.store.clone(),
            session: self.session.clone(),
            replica: self.replica.clone(),
            event_sender: self.event_sender.clone(),
        }
    }
}

impl<S> Drop for Lobby<S> {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;

    use super::*;

    /// A lobby running against the shared store, standing in for one client
    /// process
    fn lobby(store: &MemoryStore, player: &str) -> Lobby<MemoryStore> {
        let lobby = Lobby::new(store.clone(), Config::default());
        lobby.session.authenticate(player.to_string());
        lobby.start();
        lobby
    }

    async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }

            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        panic!("timed out waiting for {what}");
    }

    async fn stored_room(store: &MemoryStore, id: &RoomId) -> GameRoom {
        store
            .list_rooms(None)
            .await
            .expect("rooms list")
            .into_iter()
            .find(|r| r.id == *id)
            .expect("room exists in store")
    }

    #[tokio::test(start_paused = true)]
    async fn second_joiner_is_turned_away() {
        let store = MemoryStore::new();
        let alice = lobby(&store, "alice");
        let bob = lobby(&store, "bob");
        let carol = lobby(&store, "carol");

        let room = alice
            .rooms
            .create_room("rock-paper-scissors")
            .await
            .expect("room creates");

        assert_eq!(room.status, RoomStatus::Waiting);
        assert_eq!(room.player1_id, "alice");
        assert_eq!(room.player2_id, None);

        bob.rooms.join_room(&room.id).await.expect("bob joins");

        let result = carol.rooms.join_room(&room.id).await;
        assert!(matches!(result, Err(RoomError::RoomUnavailable)));

        let stored = stored_room(&store, &room.id).await;
        assert_eq!(stored.status, RoomStatus::Playing);
        assert_eq!(stored.player2_id, Some("bob".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn simultaneous_joins_resolve_to_one_winner() {
        let store = MemoryStore::new();
        let alice = lobby(&store, "alice");
        let bob = lobby(&store, "bob");
        let carol = lobby(&store, "carol");

        let room = alice
            .rooms
            .create_room("memory-match")
            .await
            .expect("room creates");

        let (bob_result, carol_result) = tokio::join!(
            bob.rooms.join_room(&room.id),
            carol.rooms.join_room(&room.id),
        );

        let winner = match (&bob_result, &carol_result) {
            (Ok(()), Err(RoomError::RoomUnavailable)) => "bob",
            (Err(RoomError::RoomUnavailable), Ok(())) => "carol",
            other => panic!("expected exactly one winner, got {other:?}"),
        };

        let stored = stored_room(&store, &room.id).await;
        assert_eq!(stored.status, RoomStatus::Playing);
        assert_eq!(stored.player2_id, Some(winner.to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn lifecycle_calls_require_identity() {
        let store = MemoryStore::new();
        let lobby = Lobby::new(store, Config::default());

        let result = lobby.rooms.create_room("word-guessing").await;
        assert!(matches!(result, Err(RoomError::Unauthenticated)));

        let result = lobby.rooms.join_room(&"anything".to_string()).await;
        assert!(matches!(result, Err(RoomError::Unauthenticated)));
    }

    #[tokio::test(start_paused = true)]
    async fn host_cannot_join_their_own_room() {
        let store = MemoryStore::new();
        let alice = lobby(&store, "alice");

        let room = alice
            .rooms
            .create_room("ninja-reflex")
            .await
            .expect("room creates");

        let result = alice.rooms.join_room(&room.id).await;
        assert!(matches!(result, Err(RoomError::RoomUnavailable)));

        // The room is untouched and still open to others
        let stored = stored_room(&store, &room.id).await;
        assert_eq!(stored.status, RoomStatus::Waiting);
    }

    #[tokio::test(start_paused = true)]
    async fn leaving_is_idempotent_and_strangers_are_noops() {
        let store = MemoryStore::new();
        let alice = lobby(&store, "alice");
        let bob = lobby(&store, "bob");
        let mallory = lobby(&store, "mallory");

        let room = alice
            .rooms
            .create_room("rock-paper-scissors")
            .await
            .expect("room creates");

        bob.rooms.join_room(&room.id).await.expect("bob joins");

        // A player in neither seat affects nothing, and that's fine
        mallory
            .rooms
            .leave_room(&room.id)
            .await
            .expect("stranger leave is ok");
        assert_eq!(stored_room(&store, &room.id).await.status, RoomStatus::Playing);

        bob.rooms.leave_room(&room.id).await.expect("bob leaves");
        assert_eq!(stored_room(&store, &room.id).await.status, RoomStatus::Finished);

        // Leaving a finished room again is a no-op success
        bob.rooms.leave_room(&room.id).await.expect("second leave is ok");
        alice.rooms.leave_room(&room.id).await.expect("host leave after finish is ok");
        assert_eq!(stored_room(&store, &room.id).await.status, RoomStatus::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn host_can_abandon_before_anyone_joins() {
        let store = MemoryStore::new();
        let alice = lobby(&store, "alice");
        let bob = lobby(&store, "bob");

        let room = alice
            .rooms
            .create_room("memory-match")
            .await
            .expect("room creates");

        alice.rooms.leave_room(&room.id).await.expect("host abandons");

        let stored = stored_room(&store, &room.id).await;
        assert_eq!(stored.status, RoomStatus::Finished);
        assert_eq!(stored.player2_id, None);

        // Finished is terminal: the seat can no longer be taken
        let result = bob.rooms.join_room(&room.id).await;
        assert!(matches!(result, Err(RoomError::RoomUnavailable)));
        assert_eq!(stored_room(&store, &room.id).await.status, RoomStatus::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_rooms_propagate_between_processes() {
        let store = MemoryStore::new();
        let alice = lobby(&store, "alice");
        let bob = lobby(&store, "bob");

        let room = alice
            .rooms
            .create_room("word-guessing")
            .await
            .expect("room creates");

        // The host sees the room immediately, ahead of feed confirmation
        assert_eq!(alice.available_rooms().len(), 1);

        eventually("bob to see the new room", || {
            bob.available_rooms().iter().any(|r| r.id == room.id)
        })
        .await;

        bob.rooms.join_room(&room.id).await.expect("bob joins");

        // The room leaves the waiting view everywhere, but stays addressable
        eventually("the room to leave both waiting views", || {
            alice.available_rooms().is_empty() && bob.available_rooms().is_empty()
        })
        .await;

        assert_eq!(
            alice.room(&room.id).expect("room still cached").status,
            RoomStatus::Playing
        );
    }

    #[tokio::test(start_paused = true)]
    async fn late_processes_seed_existing_rooms() {
        let store = MemoryStore::new();
        let alice = lobby(&store, "alice");

        let room = alice
            .rooms
            .create_room("rock-paper-scissors")
            .await
            .expect("room creates");

        // Bob's process starts after the room already exists
        let bob = lobby(&store, "bob");

        eventually("bob to seed the existing room", || {
            bob.available_rooms().iter().any(|r| r.id == room.id)
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn outcome_reporting_finishes_with_a_winner() {
        let store = MemoryStore::new();
        let alice = lobby(&store, "alice");
        let bob = lobby(&store, "bob");

        let room = alice
            .rooms
            .create_room("rock-paper-scissors")
            .await
            .expect("room creates");

        bob.rooms.join_room(&room.id).await.expect("bob joins");

        bob.rooms
            .report_outcome(&room.id, Some("bob".to_string()))
            .await
            .expect("outcome reports");

        let stored = stored_room(&store, &room.id).await;
        assert_eq!(stored.status, RoomStatus::Finished);
        assert_eq!(stored.winner_id, Some("bob".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn game_state_passes_through_opaquely() {
        let store = MemoryStore::new();
        let alice = lobby(&store, "alice");
        let bob = lobby(&store, "bob");

        let room = alice
            .rooms
            .create_room("rock-paper-scissors")
            .await
            .expect("room creates");

        bob.rooms.join_room(&room.id).await.expect("bob joins");

        let state = json!({ "round": 2, "moves": { "alice": "rock" } });

        alice
            .rooms
            .sync_state(&room.id, state.clone())
            .await
            .expect("state syncs");

        assert_eq!(stored_room(&store, &room.id).await.current_state, state);

        eventually("bob to observe the synced state", || {
            bob.room(&room.id)
                .map_or(false, |r| r.current_state == state)
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_assert_presence_and_current_room() {
        let store = MemoryStore::new();
        let alice = lobby(&store, "alice");

        eventually("the first heartbeat", || {
            !alice.online_players().is_empty()
        })
        .await;

        let players = alice.online_players();
        assert_eq!(players[0].id, "alice");
        assert_eq!(players[0].status, PresenceStatus::Online);

        let room = alice
            .rooms
            .create_room("ninja-reflex")
            .await
            .expect("room creates");

        // The next beat carries the occupied room
        tokio::time::sleep(Duration::from_secs(35)).await;

        eventually("the in-game heartbeat", || {
            alice
                .online_players()
                .first()
                .map_or(false, |p| p.status == PresenceStatus::InGame)
        })
        .await;

        let players = alice.online_players();
        assert_eq!(players[0].current_room, Some(room.id.clone()));

        // Back to plain online after the match ends
        alice.rooms.leave_room(&room.id).await.expect("alice leaves");
        tokio::time::sleep(Duration::from_secs(35)).await;

        eventually("the post-game heartbeat", || {
            alice
                .online_players()
                .first()
                .map_or(false, |p| p.status == PresenceStatus::Online)
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn silent_players_drop_out_of_the_online_view() {
        let store = MemoryStore::new();

        // A record that stopped heartbeating long ago, but still stores online
        store
            .upsert_presence(PresenceRecord {
                id: "ghost".to_string(),
                last_seen_at: Utc::now() - chrono::Duration::seconds(600),
                status: PresenceStatus::Online,
                current_room: None,
            })
            .await
            .expect("upsert runs");

        let alice = lobby(&store, "alice");

        eventually("alice's own heartbeat", || {
            alice.online_players().iter().any(|p| p.id == "alice")
        })
        .await;

        // The ghost made it into the replica, but not past classification
        assert!(alice
            .context
            .replica
            .presence()
            .iter()
            .any(|p| p.id == "ghost"));
        assert!(!alice.online_players().iter().any(|p| p.id == "ghost"));
    }

    #[tokio::test(start_paused = true)]
    async fn consumers_hear_about_room_changes() {
        let store = MemoryStore::new();
        let alice = lobby(&store, "alice");
        let events = alice.events();

        let room = alice
            .rooms
            .create_room("memory-match")
            .await
            .expect("room creates");

        eventually("an available-rooms notification", || {
            loop {
                match events.try_recv() {
                    Ok(LobbyEvent::AvailableRoomsChanged { rooms }) => {
                        if rooms.iter().any(|r| r.id == room.id) {
                            return true;
                        }
                    }
                    Ok(_) => continue,
                    Err(_) => return false,
                }
            }
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_feeding_the_replica() {
        let store = MemoryStore::new();
        let alice = lobby(&store, "alice");
        let bob = lobby(&store, "bob");

        let first = alice
            .rooms
            .create_room("rock-paper-scissors")
            .await
            .expect("room creates");

        eventually("bob to see the first room", || {
            bob.available_rooms().iter().any(|r| r.id == first.id)
        })
        .await;

        bob.shutdown();

        let second = alice
            .rooms
            .create_room("memory-match")
            .await
            .expect("room creates");

        // Give any stray delivery plenty of chances to land
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(!bob.available_rooms().iter().any(|r| r.id == second.id));
    }
}

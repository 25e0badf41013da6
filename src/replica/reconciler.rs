use futures_util::StreamExt;
use log::{info, warn};

use crate::{ChangeEvent, Collection, LobbyContext, Provenance, Store};

/// Drains a collection's change feed into the replica, forever. A lost feed
/// or failed seed is logged and repaired by resubscribing with capped
/// exponential backoff; nothing propagates to the rest of the lobby.
pub(crate) async fn run<S>(context: LobbyContext<S>, collection: Collection)
where
    S: Store,
{
    let mut retry = context.config.feed_retry_min;

    loop {
        let mut feed = match context.store.subscribe(collection).await {
            Ok(feed) => feed,
            Err(e) => {
                warn!("subscribing to {collection:?} failed: {e}, retrying in {retry:?}");
                tokio::time::sleep(retry).await;
                retry = context.config.next_feed_retry(retry);
                continue;
            }
        };

        // Seeding after subscribing means no row can slip between the bulk
        // read and the first feed event
        if let Err(e) = seed(&context, collection).await {
            warn!("seeding {collection:?} replica failed: {e}, retrying in {retry:?}");
            tokio::time::sleep(retry).await;
            retry = context.config.next_feed_retry(retry);
            continue;
        }

        retry = context.config.feed_retry_min;
        info!("{collection:?} feed live");

        while let Some(event) = feed.next().await {
            apply(&context, event);
        }

        warn!("{collection:?} feed ended, resubscribing");
    }
}

/// Bulk-reads the collection and merges it through the same path feed events
/// take. Also the reconnect gap repair: rooms are never deleted, so the full
/// list covers anything missed while the feed was down.
async fn seed<S>(context: &LobbyContext<S>, collection: Collection) -> crate::store::Result<()>
where
    S: Store,
{
    match collection {
        Collection::Presence => {
            for record in context.store.list_presence(None).await? {
                apply(context, ChangeEvent::Presence(record));
            }
        }
        Collection::Rooms => {
            for room in context.store.list_rooms(None).await? {
                apply(context, ChangeEvent::Room(room));
            }
        }
    }

    Ok(())
}

fn apply<S>(context: &LobbyContext<S>, event: ChangeEvent)
where
    S: Store,
{
    match event {
        ChangeEvent::Presence(record) => context.apply_presence(record, Provenance::Feed),
        ChangeEvent::Room(room) => context.apply_room(room, Provenance::Feed),
    }
}

//! One joined room, fully assembled: the store client, the connection
//! registry, the signaling exchange, and the reconcile loop, owned together
//! so they can be released together on leave.

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::info;

use crate::connection::ConnectionRegistry;
use crate::link::{LinkError, PeerLinkFactory};
use crate::model::{Participant, Room, RoomId};
use crate::reconciler::{ReconcileConfig, ReconcilerHandle, RoomReconciler};
use crate::signaling::SignalingExchange;
use crate::store::{RoomStore, StoreError};

pub use crate::signaling::RoomEvent;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error("room {0} does not exist")]
    UnknownRoom(RoomId),
}

/// A live presence in one room. Constructing a session starts the reconcile
/// loop immediately; dropping it (or calling [`leave`](Self::leave)) stops
/// the loop and tears down every connection record at once.
pub struct RoomSession {
    local: Participant,
    room: RoomId,
    registry: Arc<ConnectionRegistry>,
    exchange: Arc<SignalingExchange>,
    reconciler: Mutex<Option<ReconcilerHandle>>,
    events: Mutex<Option<UnboundedReceiver<RoomEvent>>>,
}

impl RoomSession {
    /// Create a new room on the store and start reconciling it. The local
    /// participant becomes the room's first visible member.
    pub async fn create(
        store: Arc<dyn RoomStore>,
        links: Arc<dyn PeerLinkFactory>,
        local: Participant,
        room_name: &str,
        config: ReconcileConfig,
    ) -> Result<Self, SessionError> {
        let room = store.create_room(room_name, &local).await?;
        info!(target: "session", room = %room, name = room_name, "room created");
        Ok(Self::start(store, links, local, room, config))
    }

    /// Start reconciling an existing room. Presence is published implicitly
    /// the first time this participant answers an inbound offer; until then
    /// other members only see it if someone names it in an offer.
    pub async fn join(
        store: Arc<dyn RoomStore>,
        links: Arc<dyn PeerLinkFactory>,
        local: Participant,
        room: RoomId,
        config: ReconcileConfig,
    ) -> Result<Self, SessionError> {
        let rooms = store.list_rooms().await?;
        if !rooms.iter().any(|r| r.id == room) {
            return Err(SessionError::UnknownRoom(room));
        }
        info!(target: "session", room = %room, "joining room");
        Ok(Self::start(store, links, local, room, config))
    }

    fn start(
        store: Arc<dyn RoomStore>,
        links: Arc<dyn PeerLinkFactory>,
        local: Participant,
        room: RoomId,
        config: ReconcileConfig,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let exchange = Arc::new(SignalingExchange::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            links,
            local.clone(),
            room.clone(),
            config.settle_delay,
            config.answer_poll_interval,
            events_tx,
        ));
        let reconciler = Arc::new(RoomReconciler::new(
            store,
            Arc::clone(&registry),
            Arc::clone(&exchange),
            local.id.clone(),
            room.clone(),
            config.tick_interval,
        ));
        let handle = reconciler.spawn();

        Self {
            local,
            room,
            registry,
            exchange,
            reconciler: Mutex::new(Some(handle)),
            events: Mutex::new(Some(events_rx)),
        }
    }

    pub fn local(&self) -> &Participant {
        &self.local
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Originate a handshake toward a known identifier without waiting for
    /// the participant list to show the peer. An already-tracked peer is a
    /// no-op.
    pub async fn invite(&self, peer: Participant) -> Result<(), SessionError> {
        info!(target: "session", peer = %peer.id, alias = %peer.alias, "inviting peer");
        self.exchange.initiate(&peer).await?;
        Ok(())
    }

    /// Take the event stream. Single take: the first caller owns it.
    pub fn events(&self) -> Option<UnboundedReceiver<RoomEvent>> {
        self.events.lock().unwrap().take()
    }

    /// Stop the reconcile loop and tear down every connection record
    /// together. Idempotent; also runs on drop.
    pub fn leave(&self) {
        if let Some(handle) = self.reconciler.lock().unwrap().take() {
            handle.shutdown();
            info!(target: "session", room = %self.room, "left room");
        }
        self.registry.clear();
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        self.leave();
    }
}

/// List the rooms visible on a store. Thin passthrough kept here so the CLI
/// never touches the store trait directly.
pub async fn list_rooms(store: &dyn RoomStore) -> Result<Vec<Room>, SessionError> {
    Ok(store.list_rooms().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::HandshakeState;
    use crate::link::ScriptedLinkFactory;
    use crate::store::MemoryRoomStore;
    use std::time::Duration;
    use tokio::time::timeout;

    fn fast_config() -> ReconcileConfig {
        ReconcileConfig {
            tick_interval: Duration::from_millis(30),
            settle_delay: Duration::ZERO,
            answer_poll_interval: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn create_registers_the_room_and_its_creator() {
        let store = MemoryRoomStore::new();
        let session = RoomSession::create(
            Arc::new(store.clone()),
            Arc::new(ScriptedLinkFactory::new("a")),
            Participant::new("alice", "Alice"),
            "standup",
            fast_config(),
        )
        .await
        .unwrap();

        let rooms = store.list_rooms().await.unwrap();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].name, "standup");
        assert_eq!(&rooms[0].id, session.room());

        let members = store.list_participants(session.room()).await.unwrap();
        assert_eq!(members, vec![Participant::new("alice", "Alice")]);
    }

    #[tokio::test]
    async fn join_rejects_unknown_rooms() {
        let store = MemoryRoomStore::new();
        let result = RoomSession::join(
            Arc::new(store),
            Arc::new(ScriptedLinkFactory::new("a")),
            Participant::new("bob", "Bob"),
            RoomId::new("nope"),
            fast_config(),
        )
        .await;
        assert!(matches!(result, Err(SessionError::UnknownRoom(_))));
    }

    #[tokio::test]
    async fn invite_publishes_exactly_one_offer() {
        let store = MemoryRoomStore::new();
        let session = RoomSession::create(
            Arc::new(store.clone()),
            Arc::new(ScriptedLinkFactory::new("a")),
            Participant::new("alice", "Alice"),
            "standup",
            fast_config(),
        )
        .await
        .unwrap();

        session
            .invite(Participant::new("bob", "Bob"))
            .await
            .unwrap();

        let record = session.registry().get(&"bob".into()).unwrap();
        timeout(Duration::from_secs(2), async {
            while record.state() != HandshakeState::Published {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("offer never published");

        let offers = store.list_offers(session.room()).await.unwrap();
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].initiator, "alice".into());
        assert_eq!(offers[0].recipient, "bob".into());
    }

    #[tokio::test]
    async fn leave_releases_everything_and_is_idempotent() {
        let store = MemoryRoomStore::new();
        let session = RoomSession::create(
            Arc::new(store.clone()),
            Arc::new(ScriptedLinkFactory::new("a")),
            Participant::new("alice", "Alice"),
            "standup",
            fast_config(),
        )
        .await
        .unwrap();
        session
            .invite(Participant::new("bob", "Bob"))
            .await
            .unwrap();
        assert_eq!(session.registry().len(), 1);

        session.leave();
        assert!(session.registry().is_empty());
        session.leave();
    }

    #[tokio::test]
    async fn events_receiver_is_single_take() {
        let store = MemoryRoomStore::new();
        let session = RoomSession::create(
            Arc::new(store),
            Arc::new(ScriptedLinkFactory::new("a")),
            Participant::new("alice", "Alice"),
            "standup",
            fast_config(),
        )
        .await
        .unwrap();

        assert!(session.events().is_some());
        assert!(session.events().is_none());
    }
}

//! The reconcile loop: periodically re-read the room and converge local
//! connection state toward it.
//!
//! Remote state is multi-writer and append-only, so a tick never trusts the
//! store to be deduplicated; the connection registry is the only idempotence
//! guard. Inbound offers are answered before new handshakes are originated,
//! which keeps two peers that discover each other in the same tick from
//! racing a second, redundant offer.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::connection::ConnectionRegistry;
use crate::model::{ParticipantId, RoomId};
use crate::signaling::SignalingExchange;
use crate::store::{RoomStore, StoreError};

/// Timing knobs for the reconcile loop and the handshakes it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileConfig {
    /// How often the room is re-read and diffed against tracked peers.
    pub tick_interval: Duration,
    /// How long a fresh link gathers candidates before its payload is built.
    pub settle_delay: Duration,
    /// How often an initiator re-reads the answer list.
    pub answer_poll_interval: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            settle_delay: Duration::from_secs(2),
            answer_poll_interval: Duration::from_secs(1),
        }
    }
}

/// Drives one room toward full pairwise connectivity, one tick at a time.
pub struct RoomReconciler {
    store: Arc<dyn RoomStore>,
    registry: Arc<ConnectionRegistry>,
    exchange: Arc<SignalingExchange>,
    local: ParticipantId,
    room: RoomId,
    tick_interval: Duration,
}

impl RoomReconciler {
    pub fn new(
        store: Arc<dyn RoomStore>,
        registry: Arc<ConnectionRegistry>,
        exchange: Arc<SignalingExchange>,
        local: ParticipantId,
        room: RoomId,
        tick_interval: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            exchange,
            local,
            room,
            tick_interval,
        }
    }

    /// One reconcile pass: answer every offer addressed to us, then
    /// originate toward participants we do not track yet. A store read
    /// failure abandons the pass (the next tick repeats it); a per-peer
    /// handshake failure only skips that peer.
    pub async fn tick(&self) -> Result<(), StoreError> {
        self.respond_to_inbound_offers().await?;
        self.originate_to_new_participants().await?;
        Ok(())
    }

    async fn respond_to_inbound_offers(&self) -> Result<(), StoreError> {
        let offers = self.store.list_offers(&self.room).await?;
        for offer in offers {
            if offer.initiator == self.local || offer.recipient != self.local {
                continue;
            }
            // Offers are never retracted, so old ones keep showing up here;
            // the registry decides whether this one still needs an answer.
            if self.registry.contains(&offer.initiator) {
                continue;
            }
            debug!(target: "reconcile", peer = %offer.initiator, "inbound offer needs an answer");
            if let Err(err) = self.exchange.respond(&offer).await {
                warn!(
                    target: "reconcile",
                    peer = %offer.initiator,
                    error = %err,
                    "answering inbound offer failed"
                );
            }
        }
        Ok(())
    }

    async fn originate_to_new_participants(&self) -> Result<(), StoreError> {
        let participants = self.store.list_participants(&self.room).await?;
        for participant in participants {
            if participant.id == self.local || self.registry.contains(&participant.id) {
                continue;
            }
            debug!(target: "reconcile", peer = %participant.id, "untracked participant; originating");
            if let Err(err) = self.exchange.initiate(&participant).await {
                warn!(
                    target: "reconcile",
                    peer = %participant.id,
                    error = %err,
                    "origination failed"
                );
            }
        }
        Ok(())
    }

    /// Run ticks on `tick_interval` until the handle is dropped. The first
    /// pass runs immediately.
    pub fn spawn(self: &Arc<Self>) -> ReconcilerHandle {
        let reconciler = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(reconciler.tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = reconciler.tick().await {
                    warn!(target: "reconcile", error = %err, "reconcile pass abandoned");
                }
            }
        });
        ReconcilerHandle { task }
    }
}

/// Aborts the reconcile loop when dropped.
pub struct ReconcilerHandle {
    task: JoinHandle<()>,
}

impl ReconcilerHandle {
    pub fn shutdown(self) {
        self.task.abort();
    }
}

impl Drop for ReconcilerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::HandshakeRole;
    use crate::link::{PeerLinkFactory, ScriptedLinkFactory};
    use crate::model::{
        Offer, Participant, SessionDescription, SignalPayload,
    };
    use crate::store::MemoryRoomStore;

    fn offer_from(initiator: &str, recipient: &str) -> Offer {
        Offer {
            initiator: initiator.into(),
            recipient: recipient.into(),
            recipient_alias: recipient.to_ascii_uppercase(),
            payload: SignalPayload {
                description: SessionDescription::new("offer", format!("v=0 {initiator}")),
                candidates: Vec::new(),
            },
        }
    }

    struct Rig {
        store: MemoryRoomStore,
        registry: Arc<ConnectionRegistry>,
        links: Arc<ScriptedLinkFactory>,
        reconciler: RoomReconciler,
        room: RoomId,
    }

    async fn rig() -> Rig {
        let store = MemoryRoomStore::new();
        let local = Participant::new("alice", "Alice");
        let room = store.create_room("demo", &local).await.unwrap();
        let registry = Arc::new(ConnectionRegistry::new());
        let links = Arc::new(ScriptedLinkFactory::new("a"));
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let exchange = Arc::new(SignalingExchange::new(
            Arc::new(store.clone()),
            Arc::clone(&registry),
            Arc::clone(&links) as Arc<dyn PeerLinkFactory>,
            local.clone(),
            room.clone(),
            Duration::ZERO,
            Duration::from_millis(20),
            tx,
        ));
        let reconciler = RoomReconciler::new(
            Arc::new(store.clone()),
            Arc::clone(&registry),
            exchange,
            local.id,
            room.clone(),
            Duration::from_millis(50),
        );
        Rig {
            store,
            registry,
            links,
            reconciler,
            room,
        }
    }

    #[test]
    fn default_config_uses_protocol_cadence() {
        let config = ReconcileConfig::default();
        assert_eq!(config.tick_interval, Duration::from_secs(5));
        assert_eq!(config.settle_delay, Duration::from_secs(2));
        assert_eq!(config.answer_poll_interval, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn inbound_offers_win_over_origination() {
        let rig = rig().await;
        // Bob is both visible as a participant and the author of an offer
        // addressed to us. Answering must come first, so the record we end
        // up with is a responder record.
        rig.store
            .publish_offer(&rig.room, &offer_from("bob", "alice"))
            .await
            .unwrap();

        rig.reconciler.tick().await.unwrap();

        let record = rig.registry.get(&"bob".into()).unwrap();
        assert_eq!(record.role(), HandshakeRole::Responder);
        assert_eq!(rig.links.created_count(), 1);
    }

    #[tokio::test]
    async fn own_and_foreign_offers_are_skipped() {
        let rig = rig().await;
        rig.store
            .publish_offer(&rig.room, &offer_from("alice", "bob"))
            .await
            .unwrap();
        rig.store
            .publish_offer(&rig.room, &offer_from("carol", "bob"))
            .await
            .unwrap();

        rig.reconciler.tick().await.unwrap();

        // Neither offer was addressed to us. Presence derived from them
        // (bob, carol) gets an origination instead.
        assert!(rig.registry.get(&"bob".into()).is_some());
        assert!(rig.registry.get(&"carol".into()).is_some());
        assert!(rig
            .registry
            .all()
            .iter()
            .all(|record| record.role() == HandshakeRole::Initiator));
    }

    #[tokio::test]
    async fn repeated_ticks_are_idempotent() {
        let rig = rig().await;
        rig.store
            .publish_offer(&rig.room, &offer_from("bob", "alice"))
            .await
            .unwrap();

        rig.reconciler.tick().await.unwrap();
        rig.reconciler.tick().await.unwrap();
        rig.reconciler.tick().await.unwrap();

        assert_eq!(rig.registry.len(), 1);
        assert_eq!(rig.links.created_count(), 1, "no duplicate handshakes");
    }

    #[tokio::test]
    async fn store_failure_abandons_the_pass() {
        let rig = rig().await;
        let gone = RoomId::new("deleted");
        let reconciler = RoomReconciler::new(
            Arc::new(rig.store.clone()),
            Arc::clone(&rig.registry),
            Arc::new(SignalingExchange::new(
                Arc::new(rig.store.clone()),
                Arc::clone(&rig.registry),
                Arc::clone(&rig.links) as Arc<dyn PeerLinkFactory>,
                Participant::new("alice", "Alice"),
                gone.clone(),
                Duration::ZERO,
                Duration::from_millis(20),
                tokio::sync::mpsc::unbounded_channel().0,
            )),
            "alice".into(),
            gone,
            Duration::from_millis(50),
        );

        assert!(matches!(
            reconciler.tick().await,
            Err(StoreError::RoomNotFound(_))
        ));
        assert!(rig.registry.is_empty());
    }

    #[tokio::test]
    async fn link_failure_skips_only_that_peer() {
        let store = MemoryRoomStore::new();
        let local = Participant::new("alice", "Alice");
        let room = store.create_room("demo", &local).await.unwrap();
        let registry = Arc::new(ConnectionRegistry::new());
        // First acquisition fails, the rest succeed.
        let links = Arc::new(ScriptedLinkFactory::new("a").fail_times(1));
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let exchange = Arc::new(SignalingExchange::new(
            Arc::new(store.clone()),
            Arc::clone(&registry),
            Arc::clone(&links) as Arc<dyn PeerLinkFactory>,
            local.clone(),
            room.clone(),
            Duration::ZERO,
            Duration::from_millis(20),
            tx,
        ));
        let reconciler = RoomReconciler::new(
            Arc::new(store.clone()),
            Arc::clone(&registry),
            exchange,
            local.id,
            room.clone(),
            Duration::from_millis(50),
        );

        // Two untracked participants become visible through foreign offers.
        store
            .publish_offer(&room, &offer_from("bob", "carol"))
            .await
            .unwrap();

        reconciler.tick().await.unwrap();

        // One of the two handshakes lost its link; the other proceeded. The
        // failed peer is untracked again and is retried by the next tick.
        assert_eq!(registry.len(), 1);
        reconciler.tick().await.unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.get(&"bob".into()).is_some());
        assert!(registry.get(&"carol".into()).is_some());
    }
}

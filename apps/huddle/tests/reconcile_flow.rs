//! End-to-end reconciliation scenarios over the in-memory store and the
//! scripted peer link: deterministic ticks first, then full sessions
//! converging against a shared store.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout};

use huddle::connection::{ConnectionRecord, ConnectionRegistry, HandshakeRole, HandshakeState};
use huddle::link::{PeerLinkFactory, ScriptedLinkFactory};
use huddle::model::{
    Answer, IceCandidate, Offer, Participant, RoomId, SessionDescription, SignalPayload,
};
use huddle::reconciler::{ReconcileConfig, RoomReconciler};
use huddle::session::{RoomEvent, RoomSession};
use huddle::signaling::SignalingExchange;
use huddle::store::{MemoryRoomStore, RoomStore};

const WAIT: Duration = Duration::from_secs(5);

fn fast_config() -> ReconcileConfig {
    ReconcileConfig {
        tick_interval: Duration::from_millis(30),
        settle_delay: Duration::ZERO,
        answer_poll_interval: Duration::from_millis(10),
    }
}

struct Node {
    store: MemoryRoomStore,
    registry: Arc<ConnectionRegistry>,
    links: Arc<ScriptedLinkFactory>,
    exchange: Arc<SignalingExchange>,
    reconciler: RoomReconciler,
    room: RoomId,
}

fn node(store: MemoryRoomStore, room: RoomId, local: Participant, label: &str) -> Node {
    let registry = Arc::new(ConnectionRegistry::new());
    let links = Arc::new(ScriptedLinkFactory::new(label));
    let config = fast_config();
    let (events_tx, _events_rx) = tokio::sync::mpsc::unbounded_channel();
    let exchange = Arc::new(SignalingExchange::new(
        Arc::new(store.clone()),
        Arc::clone(&registry),
        Arc::clone(&links) as Arc<dyn PeerLinkFactory>,
        local.clone(),
        room.clone(),
        config.settle_delay,
        config.answer_poll_interval,
        events_tx,
    ));
    let reconciler = RoomReconciler::new(
        Arc::new(store.clone()),
        Arc::clone(&registry),
        Arc::clone(&exchange),
        local.id,
        room.clone(),
        config.tick_interval,
    );
    Node {
        store,
        registry,
        links,
        exchange,
        reconciler,
        room,
    }
}

async fn alice_node() -> Node {
    let store = MemoryRoomStore::new();
    let alice = Participant::new("alice", "Alice");
    let room = store.create_room("demo", &alice).await.unwrap();
    node(store, room, alice, "alice")
}

fn offer_from(initiator: &str, recipient: &str) -> Offer {
    Offer {
        initiator: initiator.into(),
        recipient: recipient.into(),
        recipient_alias: recipient.to_ascii_uppercase(),
        payload: SignalPayload {
            description: SessionDescription::new("offer", format!("v=0 {initiator}")),
            candidates: vec![IceCandidate {
                line_index: 0,
                candidate: format!("candidate:{initiator}"),
            }],
        },
    }
}

async fn wait_for_state(record: &Arc<ConnectionRecord>, state: HandshakeState) {
    timeout(WAIT, async {
        while record.state() != state {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "record for {} stuck at {:?}, wanted {state:?}",
            record.peer(),
            record.state()
        )
    });
}

async fn wait_for_event(
    events: &mut UnboundedReceiver<RoomEvent>,
    mut predicate: impl FnMut(&RoomEvent) -> bool,
) {
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event stream ended");
            if predicate(&event) {
                return;
            }
        }
    })
    .await
    .expect("expected event never arrived");
}

#[tokio::test]
async fn inbound_offer_is_answered_not_reoffered() {
    // Room has {A(self), B}; B already published an offer toward A. A's tick
    // must answer it and must not also originate toward B.
    let node = alice_node().await;
    node.store
        .publish_offer(&node.room, &offer_from("bob", "alice"))
        .await
        .unwrap();

    node.reconciler.tick().await.unwrap();

    let record = node.registry.get(&"bob".into()).unwrap();
    assert_eq!(record.role(), HandshakeRole::Responder);
    assert_eq!(node.registry.len(), 1);

    wait_for_state(&record, HandshakeState::Published).await;
    let offers = node.store.list_offers(&node.room).await.unwrap();
    assert_eq!(offers.len(), 1, "no counter-offer toward bob");
    let answers = node.store.list_answers(&node.room).await.unwrap();
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].offer.initiator, "bob".into());
}

#[tokio::test]
async fn untracked_participant_gets_exactly_one_offer() {
    // Room has {A(self), B}; no offers yet. A's tick originates one offer
    // with initiator=A, recipient=B.
    let node = alice_node().await;
    node.store
        .publish_offer(&node.room, &offer_from("carol", "bob"))
        .await
        .unwrap();
    // Bob and Carol are now visible members; neither offer was for us.

    node.reconciler.tick().await.unwrap();

    let bob = node.registry.get(&"bob".into()).unwrap();
    assert_eq!(bob.role(), HandshakeRole::Initiator);
    wait_for_state(&bob, HandshakeState::Published).await;

    let ours: Vec<_> = node
        .store
        .list_offers(&node.room)
        .await
        .unwrap()
        .into_iter()
        .filter(|offer| offer.initiator == "alice".into())
        .collect();
    assert_eq!(ours.len(), 2, "one offer per untracked peer");
    assert!(ours.iter().any(|o| o.recipient == "bob".into()));
    assert!(ours.iter().any(|o| o.recipient == "carol".into()));
}

#[tokio::test]
async fn reconciliation_is_idempotent_against_an_unchanged_snapshot() {
    let node = alice_node().await;
    node.store
        .publish_offer(&node.room, &offer_from("bob", "alice"))
        .await
        .unwrap();

    node.reconciler.tick().await.unwrap();
    let record = node.registry.get(&"bob".into()).unwrap();
    wait_for_state(&record, HandshakeState::Published).await;

    let offers_before = node.store.list_offers(&node.room).await.unwrap().len();
    let answers_before = node.store.list_answers(&node.room).await.unwrap().len();

    node.reconciler.tick().await.unwrap();
    node.reconciler.tick().await.unwrap();
    sleep(Duration::from_millis(50)).await;

    assert_eq!(node.registry.len(), 1);
    assert_eq!(node.links.created_count(), 1);
    assert_eq!(
        node.store.list_offers(&node.room).await.unwrap().len(),
        offers_before
    );
    assert_eq!(
        node.store.list_answers(&node.room).await.unwrap().len(),
        answers_before
    );
}

#[tokio::test]
async fn at_most_one_record_per_peer_across_many_ticks() {
    let node = alice_node().await;
    node.store
        .publish_offer(&node.room, &offer_from("bob", "alice"))
        .await
        .unwrap();
    node.store
        .publish_offer(&node.room, &offer_from("carol", "dave"))
        .await
        .unwrap();

    for _ in 0..5 {
        node.reconciler.tick().await.unwrap();
    }

    let records = node.registry.all();
    let mut peers: Vec<_> = records.iter().map(|r| r.peer().to_string()).collect();
    peers.sort();
    peers.dedup();
    assert_eq!(peers.len(), records.len(), "duplicate record for a peer");
    assert_eq!(peers, vec!["bob", "carol", "dave"]);
}

#[tokio::test]
async fn matching_answer_completes_only_its_initiator() {
    // A has initiator records toward both B and C; an answer for the B offer
    // must complete the B record and leave the C record polling.
    let node = alice_node().await;
    node.exchange
        .initiate(&Participant::new("bob", "Bob"))
        .await
        .unwrap();
    node.exchange
        .initiate(&Participant::new("carol", "Carol"))
        .await
        .unwrap();

    let bob = node.registry.get(&"bob".into()).unwrap();
    let carol = node.registry.get(&"carol".into()).unwrap();
    wait_for_state(&bob, HandshakeState::Published).await;
    wait_for_state(&carol, HandshakeState::Published).await;

    let bob_offer = node
        .store
        .list_offers(&node.room)
        .await
        .unwrap()
        .into_iter()
        .find(|offer| offer.recipient == "bob".into())
        .unwrap();
    let answer = Answer {
        offer: bob_offer,
        payload: SignalPayload {
            description: SessionDescription::new("answer", "v=0 bob"),
            candidates: Vec::new(),
        },
    };
    node.store.publish_answer(&node.room, &answer).await.unwrap();

    wait_for_state(&bob, HandshakeState::Completed).await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(carol.state(), HandshakeState::Published);

    // A second copy of the same answer must not be reapplied.
    node.store.publish_answer(&node.room, &answer).await.unwrap();
    sleep(Duration::from_millis(50)).await;
    let bob_link = node
        .links
        .created()
        .into_iter()
        .find(|link| link.remote_description().is_some())
        .unwrap();
    assert_eq!(bob_link.remote_set_count(), 1);
}

#[tokio::test]
async fn two_sessions_converge_over_a_shared_store() {
    let store = MemoryRoomStore::new();

    let alice = RoomSession::create(
        Arc::new(store.clone()),
        Arc::new(ScriptedLinkFactory::new("alice")),
        Participant::new("alice", "Alice"),
        "demo",
        fast_config(),
    )
    .await
    .unwrap();
    let mut alice_events = alice.events().unwrap();

    // Bob has published nothing yet, so Alice cannot see him until invited.
    // The invite goes out before Bob joins, so his first tick already finds
    // an inbound offer and answers instead of originating.
    alice.invite(Participant::new("bob", "Bob")).await.unwrap();
    wait_for_event(&mut alice_events, |event| {
        matches!(event, RoomEvent::OfferPublished { peer } if *peer == "bob".into())
    })
    .await;

    let bob = RoomSession::join(
        Arc::new(store.clone()),
        Arc::new(ScriptedLinkFactory::new("bob")),
        Participant::new("bob", "Bob"),
        alice.room().clone(),
        fast_config(),
    )
    .await
    .unwrap();
    let mut bob_events = bob.events().unwrap();

    wait_for_event(&mut bob_events, |event| {
        matches!(event, RoomEvent::AnswerPublished { peer } if *peer == "alice".into())
    })
    .await;
    wait_for_event(&mut alice_events, |event| {
        matches!(event, RoomEvent::HandshakeCompleted { peer } if *peer == "bob".into())
    })
    .await;

    let alice_record = alice.registry().get(&"bob".into()).unwrap();
    assert_eq!(alice_record.role(), HandshakeRole::Initiator);
    assert_eq!(alice_record.state(), HandshakeState::Completed);

    let bob_record = bob.registry().get(&"alice".into()).unwrap();
    assert_eq!(bob_record.role(), HandshakeRole::Responder);
    assert_eq!(bob_record.state(), HandshakeState::Published);

    // Answering made Bob a visible member of the room.
    let members = store.list_participants(alice.room()).await.unwrap();
    assert!(members.iter().any(|p| p.id == "bob".into()));

    alice.leave();
    bob.leave();
    assert!(alice.registry().is_empty());
    assert!(bob.registry().is_empty());
}

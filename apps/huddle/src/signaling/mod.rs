//! Offer-side and answer-side handshake driving.
//!
//! `initiate` and `respond` register a connection record, prepare a fresh
//! peer link, and hand the rest of the work to a driver task owned by that
//! record: wait out the settle delay so early candidates accumulate, publish
//! the describing message, and (initiator only) poll the store until the
//! matching answer appears. Teardown of the record aborts its driver.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

use crate::connection::{
    ConnectionRecord, ConnectionRegistry, HandshakeRole, HandshakeState, RegistryError,
};
use crate::link::{LinkError, LinkEvent, LinkState, PeerLink, PeerLinkFactory, RemoteTrack};
use crate::model::{
    Answer, Offer, Participant, ParticipantId, RoomId, SessionDescription, SignalPayload,
};
use crate::store::RoomStore;

/// Progress notifications surfaced to whoever owns the room session.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    OfferPublished { peer: ParticipantId },
    AnswerPublished { peer: ParticipantId },
    HandshakeCompleted { peer: ParticipantId },
    TrackReceived { peer: ParticipantId, track: RemoteTrack },
    LinkStateChanged { peer: ParticipantId, state: LinkState },
}

/// Performs both halves of the handshake for one room on behalf of one
/// local participant.
pub struct SignalingExchange {
    store: Arc<dyn RoomStore>,
    registry: Arc<ConnectionRegistry>,
    links: Arc<dyn PeerLinkFactory>,
    local: Participant,
    room: RoomId,
    settle_delay: Duration,
    answer_poll_interval: Duration,
    events: UnboundedSender<RoomEvent>,
}

impl SignalingExchange {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn RoomStore>,
        registry: Arc<ConnectionRegistry>,
        links: Arc<dyn PeerLinkFactory>,
        local: Participant,
        room: RoomId,
        settle_delay: Duration,
        answer_poll_interval: Duration,
        events: UnboundedSender<RoomEvent>,
    ) -> Self {
        Self {
            store,
            registry,
            links,
            local,
            room,
            settle_delay,
            answer_poll_interval,
            events,
        }
    }

    pub fn local(&self) -> &Participant {
        &self.local
    }

    /// Originate a handshake toward `peer`. A peer that is already tracked
    /// is a no-op, not an error; anything the registry admitted but the
    /// setup could not finish is removed again so a later tick may retry.
    pub async fn initiate(&self, peer: &Participant) -> Result<(), LinkError> {
        let record = match self
            .registry
            .create_if_absent(peer.id.clone(), HandshakeRole::Initiator)
        {
            Ok(record) => record,
            Err(RegistryError::AlreadyConnected(_)) => {
                trace!(target: "signaling", peer = %peer.id, "peer already tracked; not originating");
                return Ok(());
            }
        };

        let (link, events) = match self.links.create().await {
            Ok(pair) => pair,
            Err(err) => return Err(self.abandon(&peer.id, err)),
        };
        record.attach_link(Arc::clone(&link));

        let description = match link.create_offer().await {
            Ok(description) => description,
            Err(err) => return Err(self.abandon(&peer.id, err)),
        };
        if let Err(err) = link.set_local_description(description.clone()).await {
            return Err(self.abandon(&peer.id, err));
        }
        record.set_state(HandshakeState::Negotiating);
        info!(
            target: "signaling",
            peer = %peer.id,
            alias = %peer.alias,
            "originating offer"
        );

        let ctx = self.driver_context(Arc::clone(&record), link, events);
        let task = tokio::spawn(drive_initiator(ctx, peer.clone(), description));
        record.adopt_task(task);
        Ok(())
    }

    /// Answer an inbound offer. Same no-op and cleanup policy as `initiate`.
    pub async fn respond(&self, offer: &Offer) -> Result<(), LinkError> {
        let record = match self
            .registry
            .create_if_absent(offer.initiator.clone(), HandshakeRole::Responder)
        {
            Ok(record) => record,
            Err(RegistryError::AlreadyConnected(_)) => {
                trace!(target: "signaling", peer = %offer.initiator, "peer already tracked; not answering");
                return Ok(());
            }
        };

        let (link, events) = match self.links.create().await {
            Ok(pair) => pair,
            Err(err) => return Err(self.abandon(&offer.initiator, err)),
        };
        record.attach_link(Arc::clone(&link));

        if let Err(err) = link
            .set_remote_description(offer.payload.description.clone())
            .await
        {
            return Err(self.abandon(&offer.initiator, err));
        }
        for candidate in &offer.payload.candidates {
            if let Err(err) = link.add_candidate(candidate.clone()).await {
                warn!(
                    target: "signaling",
                    peer = %offer.initiator,
                    error = %err,
                    "remote candidate rejected"
                );
            }
        }

        let description = match link.create_answer().await {
            Ok(description) => description,
            Err(err) => return Err(self.abandon(&offer.initiator, err)),
        };
        if let Err(err) = link.set_local_description(description.clone()).await {
            return Err(self.abandon(&offer.initiator, err));
        }
        record.set_state(HandshakeState::Negotiating);
        info!(target: "signaling", peer = %offer.initiator, "answering offer");

        let ctx = self.driver_context(Arc::clone(&record), link, events);
        let task = tokio::spawn(drive_responder(ctx, offer.clone(), description));
        record.adopt_task(task);
        Ok(())
    }

    fn abandon(&self, peer: &ParticipantId, err: LinkError) -> LinkError {
        self.registry.remove(peer);
        debug!(target: "signaling", peer = %peer, error = %err, "handshake setup abandoned");
        err
    }

    fn driver_context(
        &self,
        record: Arc<ConnectionRecord>,
        link: Arc<dyn PeerLink>,
        events: UnboundedReceiver<LinkEvent>,
    ) -> DriverContext {
        DriverContext {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            record,
            link,
            events,
            room: self.room.clone(),
            local: self.local.id.clone(),
            room_events: self.events.clone(),
            settle_delay: self.settle_delay,
            answer_poll_interval: self.answer_poll_interval,
        }
    }
}

/// Everything a driver task needs, cloned up front. Driver tasks never
/// reach back into the exchange.
struct DriverContext {
    store: Arc<dyn RoomStore>,
    registry: Arc<ConnectionRegistry>,
    record: Arc<ConnectionRecord>,
    link: Arc<dyn PeerLink>,
    events: UnboundedReceiver<LinkEvent>,
    room: RoomId,
    local: ParticipantId,
    room_events: UnboundedSender<RoomEvent>,
    settle_delay: Duration,
    answer_poll_interval: Duration,
}

impl DriverContext {
    fn notify(&self, event: RoomEvent) {
        let _ = self.room_events.send(event);
    }

    fn handle_event(&self, peer: &ParticipantId, event: LinkEvent) {
        match event {
            LinkEvent::CandidateDiscovered(candidate) => {
                trace!(target: "signaling", peer = %peer, "local candidate gathered");
                self.record.candidates().append(candidate);
            }
            LinkEvent::TrackReceived(track) => {
                self.notify(RoomEvent::TrackReceived {
                    peer: peer.clone(),
                    track,
                });
            }
            LinkEvent::StateChanged(state) => {
                debug!(target: "signaling", peer = %peer, ?state, "link state changed");
                self.notify(RoomEvent::LinkStateChanged {
                    peer: peer.clone(),
                    state,
                });
            }
        }
    }

    /// Forward whatever the link has already queued; never blocks. Called
    /// right before a payload is built so the drained buffer holds every
    /// candidate that arrived during the settle delay.
    fn absorb_pending_events(&mut self, peer: &ParticipantId) {
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(peer, event);
        }
    }

    /// Sleep one poll interval, forwarding link events as they arrive.
    async fn idle_one_interval(&mut self, peer: &ParticipantId) {
        let sleep = sleep(self.answer_poll_interval);
        tokio::pin!(sleep);
        let mut events_open = true;
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                event = self.events.recv(), if events_open => match event {
                    Some(event) => self.handle_event(peer, event),
                    None => events_open = false,
                },
            }
        }
    }

    /// Forward link events until the stream ends or the record is torn down.
    async fn pump_events(&mut self, peer: &ParticipantId) {
        while let Some(event) = self.events.recv().await {
            self.handle_event(peer, event);
        }
    }
}

async fn drive_initiator(
    mut ctx: DriverContext,
    peer: Participant,
    description: SessionDescription,
) {
    sleep(ctx.settle_delay).await;
    ctx.absorb_pending_events(&peer.id);

    let payload = SignalPayload {
        description,
        candidates: ctx.record.candidates().drain(),
    };
    let candidate_count = payload.candidates.len();
    let offer = Offer {
        initiator: ctx.local.clone(),
        recipient: peer.id.clone(),
        recipient_alias: peer.alias.clone(),
        payload,
    };
    if let Err(err) = ctx.store.publish_offer(&ctx.room, &offer).await {
        warn!(
            target: "signaling",
            peer = %peer.id,
            error = %err,
            "offer publication failed; abandoning record for the next tick"
        );
        ctx.registry.remove(&peer.id);
        return;
    }
    ctx.record.set_state(HandshakeState::Published);
    ctx.notify(RoomEvent::OfferPublished {
        peer: peer.id.clone(),
    });
    debug!(
        target: "signaling",
        peer = %peer.id,
        candidates = candidate_count,
        "offer published; polling for answer"
    );

    // One timer drives the poll; it ends exactly once, on the first answer
    // that names this initiator/recipient pair. Everything else in the
    // answer list is someone else's traffic.
    loop {
        ctx.idle_one_interval(&peer.id).await;

        let answers = match ctx.store.list_answers(&ctx.room).await {
            Ok(answers) => answers,
            Err(err) => {
                debug!(
                    target: "signaling",
                    peer = %peer.id,
                    error = %err,
                    "answer poll failed; retrying on the next interval"
                );
                continue;
            }
        };
        let matched = answers.into_iter().find(|answer| {
            answer.offer.recipient == peer.id && answer.offer.initiator == ctx.local
        });
        let Some(answer) = matched else {
            continue;
        };

        if let Err(err) = ctx
            .link
            .set_remote_description(answer.payload.description)
            .await
        {
            warn!(
                target: "signaling",
                peer = %peer.id,
                error = %err,
                "applying answer failed; abandoning record"
            );
            ctx.registry.remove(&peer.id);
            return;
        }
        for candidate in answer.payload.candidates {
            if let Err(err) = ctx.link.add_candidate(candidate).await {
                warn!(
                    target: "signaling",
                    peer = %peer.id,
                    error = %err,
                    "remote candidate rejected"
                );
            }
        }
        ctx.record.set_state(HandshakeState::Completed);
        ctx.notify(RoomEvent::HandshakeCompleted {
            peer: peer.id.clone(),
        });
        info!(target: "signaling", peer = %peer.id, "answer applied; handshake complete");
        break;
    }

    // Negotiation is out of our hands now; keep surfacing tracks and
    // connectivity changes for as long as the record lives.
    ctx.pump_events(&peer.id).await;
}

async fn drive_responder(mut ctx: DriverContext, offer: Offer, description: SessionDescription) {
    let peer = offer.initiator.clone();

    sleep(ctx.settle_delay).await;
    ctx.absorb_pending_events(&peer);

    let payload = SignalPayload {
        description,
        candidates: ctx.record.candidates().drain(),
    };
    let candidate_count = payload.candidates.len();
    let answer = Answer { offer, payload };
    if let Err(err) = ctx.store.publish_answer(&ctx.room, &answer).await {
        warn!(
            target: "signaling",
            peer = %peer,
            error = %err,
            "answer publication failed; abandoning record for the next tick"
        );
        ctx.registry.remove(&peer);
        return;
    }
    // Published is terminal for responders; connectivity is the link's story.
    ctx.record.set_state(HandshakeState::Published);
    ctx.notify(RoomEvent::AnswerPublished { peer: peer.clone() });
    info!(
        target: "signaling",
        peer = %peer,
        candidates = candidate_count,
        "answer published"
    );

    ctx.pump_events(&peer).await;
}

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{RoomStore, StoreError};
use crate::model::{Answer, Offer, Participant, Room, RoomId};

#[derive(Debug, Default)]
struct RoomState {
    name: String,
    participants: Vec<Participant>,
    offers: Vec<Offer>,
    answers: Vec<Answer>,
}

impl RoomState {
    fn ensure_participant(&mut self, participant: Participant) {
        if !self.participants.iter().any(|p| p.id == participant.id) {
            self.participants.push(participant);
        }
    }
}

/// In-process store with the same observable semantics as a remote one:
/// append-only offers and answers, membership derived from published
/// presence. Backs the integration stub server and the scenario tests.
#[derive(Clone, Default)]
pub struct MemoryRoomStore {
    rooms: Arc<Mutex<HashMap<RoomId, RoomState>>>,
}

impl MemoryRoomStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_room<T>(
        &self,
        room: &RoomId,
        f: impl FnOnce(&mut RoomState) -> T,
    ) -> Result<T, StoreError> {
        let mut rooms = self.rooms.lock().unwrap();
        match rooms.get_mut(room) {
            Some(state) => Ok(f(state)),
            None => Err(StoreError::RoomNotFound(room.clone())),
        }
    }
}

#[async_trait]
impl RoomStore for MemoryRoomStore {
    async fn create_room(&self, name: &str, creator: &Participant) -> Result<RoomId, StoreError> {
        let id = RoomId::generate();
        let mut state = RoomState {
            name: name.to_string(),
            ..RoomState::default()
        };
        state.ensure_participant(creator.clone());
        self.rooms.lock().unwrap().insert(id.clone(), state);
        Ok(id)
    }

    async fn list_rooms(&self) -> Result<Vec<Room>, StoreError> {
        let rooms = self.rooms.lock().unwrap();
        Ok(rooms
            .iter()
            .map(|(id, state)| Room {
                id: id.clone(),
                name: state.name.clone(),
            })
            .collect())
    }

    async fn list_participants(&self, room: &RoomId) -> Result<Vec<Participant>, StoreError> {
        self.with_room(room, |state| state.participants.clone())
    }

    async fn publish_offer(&self, room: &RoomId, offer: &Offer) -> Result<(), StoreError> {
        self.with_room(room, |state| {
            // Publishing presence: the recipient becomes visible under the
            // alias the initiator supplied; an unknown initiator falls back
            // to its identifier for display.
            state.ensure_participant(Participant::new(
                offer.initiator.clone(),
                offer.initiator.as_str(),
            ));
            state.ensure_participant(Participant::new(
                offer.recipient.clone(),
                offer.recipient_alias.clone(),
            ));
            state.offers.push(offer.clone());
        })
    }

    async fn list_offers(&self, room: &RoomId) -> Result<Vec<Offer>, StoreError> {
        self.with_room(room, |state| state.offers.clone())
    }

    async fn publish_answer(&self, room: &RoomId, answer: &Answer) -> Result<(), StoreError> {
        self.with_room(room, |state| {
            state.ensure_participant(Participant::new(
                answer.offer.recipient.clone(),
                answer.offer.recipient_alias.clone(),
            ));
            state.answers.push(answer.clone());
        })
    }

    async fn list_answers(&self, room: &RoomId) -> Result<Vec<Answer>, StoreError> {
        self.with_room(room, |state| state.answers.clone())
    }
}

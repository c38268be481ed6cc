//! Client side of the remote room store: the rendezvous bulletin board.
//!
//! The store is passive and multi-writer. It offers no ordering between
//! calls, no atomic read-then-write, and no deduplication; every consumer is
//! expected to tolerate re-reading the same offers and answers on every
//! poll. Convergence lives entirely in the callers.

mod http;
mod memory;

pub use http::HttpRoomStore;
pub use memory::MemoryRoomStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{Answer, Offer, Participant, Room, RoomId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid store url: {0}")]
    InvalidUrl(String),
    #[error("store request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("store returned HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("store response malformed: {0}")]
    Decode(String),
    #[error("room {0} not found")]
    RoomNotFound(RoomId),
}

/// The seven remote operations the reconciliation protocol consumes. All
/// asynchronous, all best-effort; any failure is retried naturally by the
/// next polling tick.
#[async_trait]
pub trait RoomStore: Send + Sync {
    /// Create a room; the creator becomes its first visible participant.
    async fn create_room(&self, name: &str, creator: &Participant) -> Result<RoomId, StoreError>;

    async fn list_rooms(&self) -> Result<Vec<Room>, StoreError>;

    /// Everyone who has published presence in the room: its creator plus any
    /// participant named as an offer recipient or observed answering.
    async fn list_participants(&self, room: &RoomId) -> Result<Vec<Participant>, StoreError>;

    async fn publish_offer(&self, room: &RoomId, offer: &Offer) -> Result<(), StoreError>;

    async fn list_offers(&self, room: &RoomId) -> Result<Vec<Offer>, StoreError>;

    async fn publish_answer(&self, room: &RoomId, answer: &Answer) -> Result<(), StoreError>;

    async fn list_answers(&self, room: &RoomId) -> Result<Vec<Answer>, StoreError>;
}

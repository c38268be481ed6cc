//! huddle: room-based peer-to-peer media rendezvous over a passive store.
//!
//! Participants in a shared room discover one another and negotiate direct
//! media connections with nothing but a polled, eventually-consistent
//! bulletin board between them: offers and answers are published as
//! append-only records, and every client independently reconciles the room's
//! remote state against its own connection registry until the mesh
//! converges. There is no signaling server and no push path; idempotent
//! polling is the whole protocol.

pub mod connection;
pub mod link;
pub mod model;
pub mod reconciler;
pub mod session;
pub mod signaling;
pub mod store;
pub mod telemetry;

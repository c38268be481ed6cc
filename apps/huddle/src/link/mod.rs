//! The local peer-link capability: everything the signaling core needs from
//! a media/transport engine, and nothing it does not. Negotiation internals
//! (codecs, connectivity checks) stay behind this seam.

mod scripted;
mod webrtc;

pub use scripted::{ScriptedLinkFactory, ScriptedPeerLink};
pub use webrtc::{WebRtcLinkConfig, WebRtcLinkFactory, WebRtcPeerLink};

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::model::{IceCandidate, SessionDescription};

#[derive(Debug, Error)]
pub enum LinkError {
    /// The capability itself could not be acquired (device or permission
    /// problems). Fatal to the connection attempt it was meant to serve.
    #[error("local media unavailable: {0}")]
    MediaUnavailable(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("peer link closed")]
    Closed,
}

/// Coarse connectivity as reported by the underlying engine. Forwarded to
/// session events; the signaling state machine never branches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Metadata for an incoming media track. The media itself stays inside the
/// engine; the core only announces arrival.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: String,
}

#[derive(Debug, Clone)]
pub enum LinkEvent {
    CandidateDiscovered(IceCandidate),
    TrackReceived(RemoteTrack),
    StateChanged(LinkState),
}

/// One peer connection's worth of capability. Implementations must be safe
/// to share across the driver tasks serving a single connection record.
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, LinkError>;

    async fn create_answer(&self) -> Result<SessionDescription, LinkError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), LinkError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), LinkError>;

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError>;

    /// Fire-and-forget teardown; the event stream ends once the engine winds
    /// down.
    fn close(&self);
}

/// Creates a fresh link per connection, handing back the link and its event
/// stream together so event ownership is unambiguous.
#[async_trait]
pub trait PeerLinkFactory: Send + Sync {
    async fn create(&self)
    -> Result<(Arc<dyn PeerLink>, UnboundedReceiver<LinkEvent>), LinkError>;
}

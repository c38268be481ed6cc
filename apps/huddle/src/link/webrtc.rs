//! Production peer link over the `webrtc` crate. One `RTCPeerConnection`
//! per link; trickle candidates, incoming tracks, and connectivity changes
//! are forwarded as [`LinkEvent`]s.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

use super::{LinkError, LinkEvent, LinkState, PeerLink, PeerLinkFactory, RemoteTrack};
use crate::model::{IceCandidate, SessionDescription};

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone)]
pub struct WebRtcLinkConfig {
    pub ice_servers: Vec<String>,
}

impl Default for WebRtcLinkConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
        }
    }
}

impl WebRtcLinkConfig {
    pub fn with_ice_servers(ice_servers: Vec<String>) -> Self {
        if ice_servers.is_empty() {
            return Self::default();
        }
        Self { ice_servers }
    }
}

pub struct WebRtcPeerLink {
    pc: Arc<RTCPeerConnection>,
}

impl WebRtcPeerLink {
    pub async fn new(
        config: &WebRtcLinkConfig,
    ) -> Result<(Self, UnboundedReceiver<LinkEvent>), LinkError> {
        let api = build_api()?;
        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(to_acquire_error)?,
        );

        // Media capture is outside this crate; the transceivers give the
        // description its audio and video sections and receive remote tracks.
        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            pc.add_transceiver_from_kind(kind, None)
                .await
                .map_err(to_acquire_error)?;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        wire_callbacks(&pc, tx);

        Ok((Self { pc }, rx))
    }
}

fn build_api() -> Result<API, LinkError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_acquire_error)?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(to_acquire_error)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn wire_callbacks(pc: &Arc<RTCPeerConnection>, tx: UnboundedSender<LinkEvent>) {
    let candidate_tx = tx.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        let tx = candidate_tx.clone();
        Box::pin(async move {
            if let Some(candidate) = candidate {
                if let Ok(json) = candidate.to_json() {
                    let _ = tx.send(LinkEvent::CandidateDiscovered(IceCandidate {
                        line_index: json.sdp_mline_index.unwrap_or(0),
                        candidate: json.candidate,
                    }));
                }
            }
        })
    }));

    let track_tx = tx.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let tx = track_tx.clone();
        Box::pin(async move {
            let remote = RemoteTrack {
                id: track.id(),
                kind: track.kind().to_string(),
            };
            debug!(target: "link", id = %remote.id, kind = %remote.kind, "remote track arrived");
            let _ = tx.send(LinkEvent::TrackReceived(remote));
        })
    }));

    pc.on_peer_connection_state_change(Box::new(move |state| {
        let tx = tx.clone();
        Box::pin(async move {
            debug!(target: "link", ?state, "peer connection state changed");
            let _ = tx.send(LinkEvent::StateChanged(map_state(state)));
        })
    }));
}

fn map_state(state: RTCPeerConnectionState) -> LinkState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => LinkState::New,
        RTCPeerConnectionState::Connecting => LinkState::Connecting,
        RTCPeerConnectionState::Connected => LinkState::Connected,
        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
        RTCPeerConnectionState::Failed => LinkState::Failed,
        RTCPeerConnectionState::Closed => LinkState::Closed,
    }
}

fn to_rtc_description(desc: &SessionDescription) -> Result<RTCSessionDescription, LinkError> {
    match RTCSdpType::from(desc.kind.as_str()) {
        RTCSdpType::Offer => {
            RTCSessionDescription::offer(desc.sdp.clone()).map_err(to_negotiation_error)
        }
        RTCSdpType::Answer => {
            RTCSessionDescription::answer(desc.sdp.clone()).map_err(to_negotiation_error)
        }
        RTCSdpType::Pranswer => {
            RTCSessionDescription::pranswer(desc.sdp.clone()).map_err(to_negotiation_error)
        }
        other => Err(LinkError::Negotiation(format!(
            "unsupported description type {other}"
        ))),
    }
}

fn from_rtc_description(desc: RTCSessionDescription) -> SessionDescription {
    SessionDescription::new(desc.sdp_type.to_string(), desc.sdp)
}

fn to_acquire_error<E: std::fmt::Display>(err: E) -> LinkError {
    LinkError::MediaUnavailable(err.to_string())
}

fn to_negotiation_error<E: std::fmt::Display>(err: E) -> LinkError {
    LinkError::Negotiation(err.to_string())
}

#[async_trait]
impl PeerLink for WebRtcPeerLink {
    async fn create_offer(&self) -> Result<SessionDescription, LinkError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(to_negotiation_error)?;
        Ok(from_rtc_description(offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, LinkError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(to_negotiation_error)?;
        Ok(from_rtc_description(answer))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), LinkError> {
        let rtc = to_rtc_description(&desc)?;
        self.pc
            .set_local_description(rtc)
            .await
            .map_err(to_negotiation_error)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), LinkError> {
        let rtc = to_rtc_description(&desc)?;
        self.pc
            .set_remote_description(rtc)
            .await
            .map_err(to_negotiation_error)
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: None,
            sdp_mline_index: Some(candidate.line_index),
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(to_negotiation_error)
    }

    fn close(&self) {
        let pc = Arc::clone(&self.pc);
        tokio::spawn(async move {
            if let Err(err) = pc.close().await {
                debug!(target: "link", error = %err, "peer connection close failed");
            }
        });
    }
}

/// Factory handed to the signaling exchange; every connection record gets
/// its own fresh peer connection.
#[derive(Debug, Clone, Default)]
pub struct WebRtcLinkFactory {
    config: WebRtcLinkConfig,
}

impl WebRtcLinkFactory {
    pub fn new(config: WebRtcLinkConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PeerLinkFactory for WebRtcLinkFactory {
    async fn create(
        &self,
    ) -> Result<(Arc<dyn PeerLink>, UnboundedReceiver<LinkEvent>), LinkError> {
        let (link, events) = WebRtcPeerLink::new(&self.config).await?;
        Ok((Arc::new(link) as Arc<dyn PeerLink>, events))
    }
}

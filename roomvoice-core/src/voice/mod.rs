//! Peer-to-peer voice mesh coordination
//!
//! One [`VoiceSession`] per client. It announces presence over a room-scoped
//! signaling transport, lazily opens one peer connection per remote
//! participant, negotiates each with the perfect negotiation pattern and
//! feeds remote audio into the shared audio pipeline.

pub mod ice_queue;
pub mod lifecycle;
pub mod manager;
pub mod negotiation;
pub mod peer;
pub mod projection;
pub mod session;
pub mod signaling;

pub use ice_queue::IceCandidateQueue;
pub use lifecycle::{GraceTimer, LifecycleAction};
pub use manager::PeerConnectionManager;
pub use negotiation::{is_polite, Negotiator};
pub use peer::{
    IceConnectionState, NegotiationState, PeerConnection, PeerConnectionFactory, PeerEvent,
    PeerEventSink, PeerLink, PeerLinkPhase, PeerSignal, SignalingState,
};
pub use session::{ConnectionPhase, PeerStats, SessionDeps, SessionStats, VoiceSession};
pub use signaling::{DescriptionData, SignalMessage, SignalPayload, SignalingTransport};

use serde::{Deserialize, Serialize};

/// ICE candidate for WebRTC connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Full candidate string
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// Session description (SDP)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Session description type (offer, answer, pranswer, rollback)
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// SDP content
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// SDP type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl SdpType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Pranswer => "pranswer",
            Self::Rollback => "rollback",
        }
    }
}

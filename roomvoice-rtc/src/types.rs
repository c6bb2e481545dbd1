//! Conversions between the session's types and the WebRTC backend's

use roomvoice_core::voice::{
    IceCandidate, IceConnectionState, SdpType, SessionDescription, SignalingState,
};
use roomvoice_core::{Error, Result};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

pub(crate) fn negotiation_error(context: &str, e: webrtc::Error) -> Error {
    Error::Negotiation(format!("{context}: {e}"))
}

/// The backend parses the SDP when the description is applied, so this only
/// carries the type and text across.
pub fn to_rtc_description(description: &SessionDescription) -> Result<RTCSessionDescription> {
    let value = serde_json::to_value(description)?;
    Ok(serde_json::from_value(value)?)
}

pub fn from_rtc_description(description: &RTCSessionDescription) -> Result<SessionDescription> {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(Error::Negotiation("unspecified SDP type".to_string()))
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: description.sdp.clone(),
    })
}

/// Rolling back needs the SDP of the offer being discarded
pub fn rollback_description(pending_offer: &str) -> Result<RTCSessionDescription> {
    to_rtc_description(&SessionDescription {
        sdp_type: SdpType::Rollback,
        sdp: pending_offer.to_string(),
    })
}

#[must_use]
pub fn to_candidate_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: None,
    }
}

#[must_use]
pub fn from_candidate_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
    }
}

#[must_use]
pub const fn ice_state(state: RTCIceConnectionState) -> IceConnectionState {
    match state {
        RTCIceConnectionState::Unspecified | RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
    }
}

#[must_use]
pub const fn signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::Unspecified | RTCSignalingState::Stable => SignalingState::Stable,
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
    }
}

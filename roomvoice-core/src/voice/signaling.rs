//! Signaling message contract and transport seam
//!
//! Every message on the wire is `{from, to?, type, data}`:
//!
//! | type            | to        | data                                   |
//! |-----------------|-----------|----------------------------------------|
//! | `join`          | -         | `{name, avatar?}`                      |
//! | `description`   | peer      | `{description: {type, sdp}, name?, avatar?}` |
//! | `ice-candidate` | peer      | `{candidate, sdpMid?, sdpMLineIndex?}` |
//! | `leave`         | -         | -                                      |

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::{IceCandidate, SessionDescription};
use crate::models::{ParticipantId, Profile, RoomName};
use crate::Result;

/// A message exchanged between participants of one room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireMessage", into = "WireMessage")]
pub struct SignalMessage {
    pub from: ParticipantId,
    pub to: Option<ParticipantId>,
    pub payload: SignalPayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalPayload {
    Join(Profile),
    Description(DescriptionData),
    IceCandidate(IceCandidate),
    Leave,
}

impl SignalPayload {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Join(_) => "join",
            Self::Description(_) => "description",
            Self::IceCandidate(_) => "ice-candidate",
            Self::Leave => "leave",
        }
    }
}

/// Data of a `description` message; offers also carry the sender's profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptionData {
    pub description: SessionDescription,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl DescriptionData {
    /// Profile carried alongside the description, if any
    #[must_use]
    pub fn profile(&self) -> Option<Profile> {
        self.name.as_ref().map(|name| Profile {
            name: name.clone(),
            avatar: self.avatar.clone(),
        })
    }
}

impl SignalMessage {
    #[must_use]
    pub const fn join(from: ParticipantId, profile: Profile) -> Self {
        Self {
            from,
            to: None,
            payload: SignalPayload::Join(profile),
        }
    }

    #[must_use]
    pub const fn leave(from: ParticipantId) -> Self {
        Self {
            from,
            to: None,
            payload: SignalPayload::Leave,
        }
    }

    #[must_use]
    pub fn description(
        from: ParticipantId,
        to: ParticipantId,
        description: SessionDescription,
        profile: Option<&Profile>,
    ) -> Self {
        Self {
            from,
            to: Some(to),
            payload: SignalPayload::Description(DescriptionData {
                description,
                name: profile.map(|p| p.name.clone()),
                avatar: profile.and_then(|p| p.avatar.clone()),
            }),
        }
    }

    #[must_use]
    pub const fn ice_candidate(
        from: ParticipantId,
        to: ParticipantId,
        candidate: IceCandidate,
    ) -> Self {
        Self {
            from,
            to: Some(to),
            payload: SignalPayload::IceCandidate(candidate),
        }
    }

    /// Whether `local` should process this message at all
    #[must_use]
    pub fn is_for(&self, local: &ParticipantId) -> bool {
        self.from != *local && self.to.as_ref().map_or(true, |to| to == local)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMessage {
    from: ParticipantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    to: Option<ParticipantId>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    data: serde_json::Value,
}

impl TryFrom<WireMessage> for SignalMessage {
    type Error = String;

    fn try_from(wire: WireMessage) -> std::result::Result<Self, Self::Error> {
        let payload = match wire.kind.as_str() {
            "join" => SignalPayload::Join(
                serde_json::from_value(wire.data).map_err(|e| format!("join: {e}"))?,
            ),
            "description" => SignalPayload::Description(
                serde_json::from_value(wire.data).map_err(|e| format!("description: {e}"))?,
            ),
            "ice-candidate" => SignalPayload::IceCandidate(
                serde_json::from_value(wire.data).map_err(|e| format!("ice-candidate: {e}"))?,
            ),
            "leave" => SignalPayload::Leave,
            other => return Err(format!("unknown signal type: {other}")),
        };
        Ok(Self {
            from: wire.from,
            to: wire.to,
            payload,
        })
    }
}

impl From<SignalMessage> for WireMessage {
    fn from(message: SignalMessage) -> Self {
        let kind = message.payload.kind().to_string();
        // these payloads are plain structs of strings; encoding cannot fail
        let data = match message.payload {
            SignalPayload::Join(profile) => serde_json::to_value(profile),
            SignalPayload::Description(data) => serde_json::to_value(data),
            SignalPayload::IceCandidate(candidate) => serde_json::to_value(candidate),
            SignalPayload::Leave => Ok(serde_json::Value::Null),
        }
        .unwrap_or(serde_json::Value::Null);
        Self {
            from: message.from,
            to: message.to,
            kind,
            data,
        }
    }
}

/// Room-scoped publish/subscribe channel
///
/// Delivery is at-least-once to every current subscriber, ordered per
/// sender. Subscribers also receive their own messages; the session filters
/// them out.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Join the room's channel and return the inbound message stream.
    ///
    /// The stream ends when the channel closes or fails.
    async fn subscribe(&self, room: &RoomName) -> Result<mpsc::UnboundedReceiver<SignalMessage>>;

    /// Publish to the subscribed room
    async fn send(&self, message: SignalMessage) -> Result<()>;

    /// Leave the room's channel; safe to call when not subscribed
    async fn close(&self);
}

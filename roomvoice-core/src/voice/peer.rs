//! Peer connection seam and per-peer link state
//!
//! A [`PeerLink`] is plain data plus a connection handle. Links live in a
//! keyed map owned by the session coordinator; nothing else touches them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{GraceTimer, IceCandidate, IceCandidateQueue, SessionDescription};
use crate::media::{AudioTrack, MediaStream};
use crate::models::{ParticipantId, Profile};
use crate::Result;

/// Offer/answer state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

/// ICE connectivity state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        matches!(self, Self::Connected | Self::Completed)
    }

    /// Needs an ICE restart to recover
    #[must_use]
    pub const fn needs_restart(&self) -> bool {
        matches!(self, Self::Failed | Self::Disconnected)
    }
}

/// Coarse link lifecycle used for logging and the participant list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerLinkPhase {
    Connecting,
    Connected,
    /// Awaiting recovery inside the grace period
    Disconnected,
    Closed,
}

/// Something the connection reports asynchronously
#[derive(Debug, Clone)]
pub enum PeerEvent {
    NegotiationNeeded,
    LocalCandidate(IceCandidate),
    RemoteTrack(MediaStream),
    IceStateChanged(IceConnectionState),
}

/// A [`PeerEvent`] tagged with the link it came from
#[derive(Debug, Clone)]
pub struct PeerSignal {
    pub peer: ParticipantId,
    pub generation: u64,
    pub event: PeerEvent,
}

/// Where a connection delivers its events
///
/// The generation distinguishes a replaced link from its predecessor so
/// late events from a closed connection are dropped.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    peer: ParticipantId,
    generation: u64,
    tx: mpsc::UnboundedSender<PeerSignal>,
}

impl PeerEventSink {
    #[must_use]
    pub const fn new(
        peer: ParticipantId,
        generation: u64,
        tx: mpsc::UnboundedSender<PeerSignal>,
    ) -> Self {
        Self {
            peer,
            generation,
            tx,
        }
    }

    #[must_use]
    pub const fn peer(&self) -> &ParticipantId {
        &self.peer
    }

    /// Deliver an event; returns false once the session is gone
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.tx
            .send(PeerSignal {
                peer: self.peer.clone(),
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// One underlying peer connection
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Send a local track; fires `NegotiationNeeded`
    async fn add_track(&self, track: Arc<AudioTrack>, stream: &MediaStream) -> Result<()>;

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Discard a pending local offer and return to `Stable`
    async fn rollback(&self) -> Result<()>;

    /// Fails when no remote description has been applied yet
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    fn signaling_state(&self) -> SignalingState;

    fn ice_connection_state(&self) -> IceConnectionState;

    async fn has_remote_description(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnection>>;
}

/// Perfect negotiation flags for one link
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NegotiationState {
    pub making_offer: bool,
    pub ignoring_offer: bool,
}

/// Everything the session knows about one remote participant
pub struct PeerLink {
    pub remote_id: ParticipantId,
    pub generation: u64,
    pub connection: Arc<dyn PeerConnection>,
    pub profile: Option<Profile>,
    pub negotiation: NegotiationState,
    pub ice_queue: IceCandidateQueue,
    pub remote_stream: Option<MediaStream>,
    pub cleanup_timer: Option<GraceTimer>,
    pub ice_state: IceConnectionState,
    /// Next offer should request fresh ICE credentials
    pub ice_restart_pending: bool,
    pub ignored_offers: u64,
    pub created_at: DateTime<Utc>,
}

impl PeerLink {
    #[must_use]
    pub fn new(
        remote_id: ParticipantId,
        generation: u64,
        connection: Arc<dyn PeerConnection>,
    ) -> Self {
        Self {
            remote_id,
            generation,
            connection,
            profile: None,
            negotiation: NegotiationState::default(),
            ice_queue: IceCandidateQueue::new(),
            remote_stream: None,
            cleanup_timer: None,
            ice_state: IceConnectionState::New,
            ice_restart_pending: false,
            ignored_offers: 0,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn phase(&self) -> PeerLinkPhase {
        match self.ice_state {
            IceConnectionState::Connected | IceConnectionState::Completed => {
                PeerLinkPhase::Connected
            }
            IceConnectionState::Disconnected | IceConnectionState::Failed => {
                PeerLinkPhase::Disconnected
            }
            IceConnectionState::Closed if self.cleanup_timer.is_some() => {
                PeerLinkPhase::Disconnected
            }
            IceConnectionState::Closed => PeerLinkPhase::Closed,
            IceConnectionState::New | IceConnectionState::Checking => PeerLinkPhase::Connecting,
        }
    }

    #[must_use]
    pub const fn has_stream(&self) -> bool {
        self.remote_stream.is_some()
    }

    pub fn cancel_cleanup(&mut self) -> bool {
        match self.cleanup_timer.take() {
            Some(timer) => {
                timer.cancel();
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("remote_id", &self.remote_id)
            .field("generation", &self.generation)
            .field("negotiation", &self.negotiation)
            .field("queued_candidates", &self.ice_queue.len())
            .field("has_stream", &self.has_stream())
            .field("ice_state", &self.ice_state)
            .field("cleanup_pending", &self.cleanup_timer.is_some())
            .finish()
    }
}

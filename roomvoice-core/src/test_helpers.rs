//! Test doubles for the platform seams
//!
//! `FakePeer` models the offer/answer state machine closely enough for
//! negotiation to be exercised: it refuses candidates before a remote
//! description, supports rollback, trickles one local candidate per local
//! description and "connects" (ICE connected plus a remote track) the first
//! time both descriptions are in place.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::media::{AudioTrack, MediaStream, PLAYBACK_SAMPLE_RATE};
use crate::models::{ParticipantId, RoomName};
use crate::voice::{
    IceCandidate, IceConnectionState, PeerConnection, PeerConnectionFactory, PeerEvent,
    PeerEventSink, SdpType, SessionDescription, SignalMessage, SignalingState,
    SignalingTransport,
};
use crate::{Error, Result};

#[derive(Debug)]
struct FakeState {
    signaling: SignalingState,
    ice: IceConnectionState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied: Vec<String>,
    rollbacks: usize,
    offers: usize,
    restart_offers: usize,
    tracks: usize,
    candidates: usize,
    fail_next_offer: bool,
    connected_once: bool,
    closed: bool,
}

pub struct FakePeer {
    state: Mutex<FakeState>,
    sink: Option<PeerEventSink>,
}

impl FakePeer {
    /// A peer whose events go nowhere
    pub fn new() -> Arc<Self> {
        Self::build(None)
    }

    pub fn with_sink(sink: PeerEventSink) -> Arc<Self> {
        Self::build(Some(sink))
    }

    fn build(sink: Option<PeerEventSink>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState {
                signaling: SignalingState::Stable,
                ice: IceConnectionState::New,
                local: None,
                remote: None,
                applied: Vec::new(),
                rollbacks: 0,
                offers: 0,
                restart_offers: 0,
                tracks: 0,
                candidates: 0,
                fail_next_offer: false,
                connected_once: false,
                closed: false,
            }),
            sink,
        })
    }

    fn emit(&self, event: PeerEvent) {
        if let Some(sink) = &self.sink {
            sink.emit(event);
        }
    }

    pub fn fail_next_offer(&self) {
        self.state.lock().fail_next_offer = true;
    }

    pub fn rollbacks(&self) -> usize {
        self.state.lock().rollbacks
    }

    pub fn offers(&self) -> usize {
        self.state.lock().offers
    }

    pub fn restart_offers(&self) -> usize {
        self.state.lock().restart_offers
    }

    pub fn tracks(&self) -> usize {
        self.state.lock().tracks
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.state.lock().applied.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Drive the ICE state as the network would
    pub fn set_ice_state(&self, state: IceConnectionState) {
        self.state.lock().ice = state;
        self.emit(PeerEvent::IceStateChanged(state));
    }

    pub fn trigger_negotiation_needed(&self) {
        self.emit(PeerEvent::NegotiationNeeded);
    }

    /// Events to emit after a description reached `Stable`
    fn settle(state: &mut FakeState) -> Vec<PeerEvent> {
        if state.signaling != SignalingState::Stable
            || state.local.is_none()
            || state.remote.is_none()
            || state.connected_once
        {
            return Vec::new();
        }
        state.connected_once = true;
        state.ice = IceConnectionState::Connected;
        vec![
            PeerEvent::IceStateChanged(IceConnectionState::Connected),
            PeerEvent::RemoteTrack(MediaStream::new(vec![AudioTrack::new(
                PLAYBACK_SAMPLE_RATE,
            )])),
        ]
    }

    fn invalid(state: SignalingState, action: &str) -> Error {
        Error::Negotiation(format!("cannot {action} in state {state:?}"))
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_track(&self, _track: Arc<AudioTrack>, _stream: &MediaStream) -> Result<()> {
        self.state.lock().tracks += 1;
        self.emit(PeerEvent::NegotiationNeeded);
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Negotiation("connection closed".to_string()));
        }
        if std::mem::take(&mut state.fail_next_offer) {
            return Err(Error::Negotiation("offer failed".to_string()));
        }
        state.offers += 1;
        if ice_restart {
            state.restart_offers += 1;
        }
        Ok(SessionDescription::offer(format!("offer-{}", state.offers)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let state = self.state.lock();
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(Self::invalid(state.signaling, "create answer"));
        }
        Ok(SessionDescription::answer("answer"))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let events = {
            let mut state = self.state.lock();
            state.signaling = match (state.signaling, description.sdp_type) {
                (SignalingState::Stable, SdpType::Offer) => SignalingState::HaveLocalOffer,
                (SignalingState::HaveRemoteOffer, SdpType::Answer) => SignalingState::Stable,
                (current, _) => return Err(Self::invalid(current, "set local description")),
            };
            state.local = Some(description);
            state.candidates += 1;
            let mut events = vec![PeerEvent::LocalCandidate(IceCandidate {
                candidate: format!("candidate:{} 1 udp 1 127.0.0.1 9 typ host", state.candidates),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            })];
            events.extend(Self::settle(&mut state));
            events
        };
        for event in events {
            self.emit(event);
        }
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let events = {
            let mut state = self.state.lock();
            state.signaling = match (state.signaling, description.sdp_type) {
                (SignalingState::Stable, SdpType::Offer) => SignalingState::HaveRemoteOffer,
                (SignalingState::HaveLocalOffer, SdpType::Answer) => SignalingState::Stable,
                (current, _) => return Err(Self::invalid(current, "set remote description")),
            };
            state.remote = Some(description);
            Self::settle(&mut state)
        };
        for event in events {
            self.emit(event);
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.signaling != SignalingState::HaveLocalOffer {
            return Err(Self::invalid(state.signaling, "roll back"));
        }
        state.signaling = SignalingState::Stable;
        state.rollbacks += 1;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut state = self.state.lock();
        if state.remote.is_none() {
            return Err(Error::Ice("no remote description".to_string()));
        }
        state.applied.push(candidate.candidate);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        self.state.lock().ice
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.closed = true;
        state.signaling = SignalingState::Closed;
        state.ice = IceConnectionState::Closed;
        Ok(())
    }
}

/// Creates [`FakePeer`]s and remembers them for inspection
#[derive(Default)]
pub struct FakePeerFactory {
    peers: Mutex<Vec<(ParticipantId, Arc<FakePeer>)>>,
}

impl FakePeerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn created(&self) -> usize {
        self.peers.lock().len()
    }

    /// Most recently created connection towards `remote`
    pub fn peer_for(&self, remote: &str) -> Option<Arc<FakePeer>> {
        self.peers
            .lock()
            .iter()
            .rev()
            .find(|(id, _)| id.as_str() == remote)
            .map(|(_, peer)| peer.clone())
    }

    pub fn open_count(&self) -> usize {
        self.peers
            .lock()
            .iter()
            .filter(|(_, peer)| !peer.is_closed())
            .count()
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeerFactory {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnection>> {
        let remote = events.peer().clone();
        let peer = FakePeer::with_sink(events);
        self.peers.lock().push((remote, peer.clone()));
        Ok(peer)
    }
}

/// Single-session transport that records outbound messages and lets the
/// test inject inbound ones
#[derive(Default)]
pub struct LoopbackSignaling {
    sent: Mutex<Vec<SignalMessage>>,
    inbound: Mutex<Option<mpsc::UnboundedSender<SignalMessage>>>,
    subscriptions: AtomicUsize,
    fail_subscribe: AtomicBool,
    fail_send: AtomicBool,
}

impl LoopbackSignaling {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_subscribe(&self) {
        self.fail_subscribe.store(true, Ordering::SeqCst);
    }

    pub fn fail_send(&self) {
        self.fail_send.store(true, Ordering::SeqCst);
    }

    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    pub fn inject(&self, message: SignalMessage) -> bool {
        self.inbound
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(message).is_ok())
    }

    /// Simulate the channel failing underneath the session
    pub fn sever(&self) {
        self.inbound.lock().take();
    }

    pub fn is_subscribed(&self) -> bool {
        self.inbound.lock().is_some()
    }

    pub fn sent(&self) -> Vec<SignalMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_of_kind(&self, kind: &str) -> Vec<SignalMessage> {
        self.sent
            .lock()
            .iter()
            .filter(|m| m.payload.kind() == kind)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SignalingTransport for LoopbackSignaling {
    async fn subscribe(&self, _room: &RoomName) -> Result<mpsc::UnboundedReceiver<SignalMessage>> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(Error::Signaling("subscribe refused".to_string()));
        }
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inbound.lock() = Some(tx);
        Ok(rx)
    }

    async fn send(&self, message: SignalMessage) -> Result<()> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(Error::Signaling("send refused".to_string()));
        }
        self.sent.lock().push(message);
        Ok(())
    }

    async fn close(&self) {
        self.inbound.lock().take();
    }
}

/// In-memory room shared by several sessions; every message reaches every
/// subscriber, the sender included
#[derive(Default)]
pub struct FakeBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SignalMessage>>>,
}

impl FakeBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn endpoint(self: &Arc<Self>) -> Arc<BusSignaling> {
        Arc::new(BusSignaling {
            bus: self.clone(),
            subscribed: AtomicBool::new(false),
        })
    }
}

pub struct BusSignaling {
    bus: Arc<FakeBus>,
    subscribed: AtomicBool,
}

#[async_trait]
impl SignalingTransport for BusSignaling {
    async fn subscribe(&self, _room: &RoomName) -> Result<mpsc::UnboundedReceiver<SignalMessage>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.bus.subscribers.lock().push(tx);
        self.subscribed.store(true, Ordering::SeqCst);
        Ok(rx)
    }

    async fn send(&self, message: SignalMessage) -> Result<()> {
        if !self.subscribed.load(Ordering::SeqCst) {
            return Err(Error::Signaling("not subscribed".to_string()));
        }
        self.bus
            .subscribers
            .lock()
            .retain(|tx| tx.send(message.clone()).is_ok());
        Ok(())
    }

    async fn close(&self) {
        self.subscribed.store(false, Ordering::SeqCst);
    }
}

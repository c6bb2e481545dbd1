//! Peer connection backed by webrtc-rs

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use roomvoice_core::media::{AudioTrack, MediaStream};
use roomvoice_core::voice::{
    IceCandidate, IceConnectionState, PeerConnection, PeerEvent, PeerEventSink, SdpType,
    SessionDescription, SignalingState,
};
use roomvoice_core::{Error, Result};
use tracing::{debug, trace, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::track::{spawn_remote_reader, SenderRegistry};
use crate::types::{
    from_candidate_init, from_rtc_description, ice_state, negotiation_error, rollback_description,
    signaling_state, to_candidate_init, to_rtc_description,
};

pub struct WebRtcPeer {
    remote: String,
    pc: Arc<RTCPeerConnection>,
    senders: Arc<SenderRegistry>,
    /// SDP of our outstanding offer; the backend needs it to roll back
    pending_offer: Mutex<Option<String>>,
}

impl WebRtcPeer {
    /// Wrap `pc` and route its callbacks into `events`
    pub fn new(pc: Arc<RTCPeerConnection>, events: PeerEventSink, senders: Arc<SenderRegistry>) -> Self {
        let remote = events.peer().to_string();
        register_handlers(&pc, &events);
        Self {
            remote,
            pc,
            senders,
            pending_offer: Mutex::new(None),
        }
    }
}

fn register_handlers(pc: &RTCPeerConnection, events: &PeerEventSink) {
    let sink = events.clone();
    pc.on_negotiation_needed(Box::new(move || {
        sink.emit(PeerEvent::NegotiationNeeded);
        Box::pin(async {})
    }));

    let sink = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        // None marks the end of gathering; trickle has nothing to send
        if let Some(candidate) = candidate {
            match candidate.to_json() {
                Ok(init) => {
                    sink.emit(PeerEvent::LocalCandidate(from_candidate_init(init)));
                }
                Err(e) => warn!(peer_id = %sink.peer(), error = %e, "Failed to serialize ICE candidate"),
            }
        }
        Box::pin(async {})
    }));

    let sink = events.clone();
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
            let stream = spawn_remote_reader(track, sink.peer().to_string());
            sink.emit(PeerEvent::RemoteTrack(stream));
            Box::pin(async {})
        },
    ));

    let sink = events.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        trace!(peer_id = %sink.peer(), ?state, "ICE state reported");
        sink.emit(PeerEvent::IceStateChanged(ice_state(state)));
        Box::pin(async {})
    }));
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn add_track(&self, track: Arc<AudioTrack>, stream: &MediaStream) -> Result<()> {
        let sender = self.senders.sender_for(&track, stream);
        let rtc_track: Arc<dyn TrackLocal + Send + Sync> = sender.rtc_track();
        let rtp_sender = self
            .pc
            .add_track(rtc_track)
            .await
            .map_err(|e| negotiation_error("add track", e))?;

        // RTCP has to be read for interceptors (NACK, reports) to run
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while rtp_sender.read(&mut rtcp_buf).await.is_ok() {}
        });
        debug!(peer_id = %self.remote, track_id = %track.id(), "Local audio attached");
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self
            .pc
            .create_offer(Some(options))
            .await
            .map_err(|e| negotiation_error("create offer", e))?;
        from_rtc_description(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| negotiation_error("create answer", e))?;
        from_rtc_description(&answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let rtc = to_rtc_description(&description)?;
        self.pc
            .set_local_description(rtc)
            .await
            .map_err(|e| negotiation_error("set local description", e))?;

        let mut pending = self.pending_offer.lock();
        *pending = match description.sdp_type {
            SdpType::Offer => Some(description.sdp),
            _ => None,
        };
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let rtc = to_rtc_description(&description)?;
        self.pc
            .set_remote_description(rtc)
            .await
            .map_err(|e| negotiation_error("set remote description", e))
    }

    async fn rollback(&self) -> Result<()> {
        let pending = self.pending_offer.lock().take();
        let Some(offer) = pending else {
            return Err(Error::Negotiation("no local offer to roll back".to_string()));
        };
        let result = self
            .pc
            .set_local_description(rollback_description(&offer)?)
            .await
            .map_err(|e| negotiation_error("rollback", e));
        if result.is_err() {
            *self.pending_offer.lock() = Some(offer);
        }
        result
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(to_candidate_init(candidate))
            .await
            .map_err(|e| Error::Ice(e.to_string()))
    }

    fn signaling_state(&self) -> SignalingState {
        signaling_state(self.pc.signaling_state())
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        ice_state(self.pc.ice_connection_state())
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn close(&self) -> Result<()> {
        self.pending_offer.lock().take();
        self.pc
            .close()
            .await
            .map_err(|e| negotiation_error("close", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::WebRtcPeerFactory;
    use roomvoice_core::config::RtcConfig;
    use roomvoice_core::voice::{PeerConnectionFactory, PeerSignal};
    use roomvoice_core::ParticipantId;
    use tokio::sync::mpsc;

    fn offline() -> RtcConfig {
        RtcConfig {
            stun_servers: Vec::new(),
            ..RtcConfig::default()
        }
    }

    async fn open(
        factory: &WebRtcPeerFactory,
        remote: &str,
    ) -> (Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<PeerSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = PeerEventSink::new(ParticipantId::from(remote), 1, tx);
        (factory.create(sink).await.unwrap(), rx)
    }

    #[tokio::test]
    async fn test_offer_answer_reaches_stable() {
        let factory = WebRtcPeerFactory::new(&offline()).unwrap();
        let (a, _a_events) = open(&factory, "b").await;
        let (b, _b_events) = open(&factory, "a").await;

        let mic = AudioTrack::new(48_000);
        a.add_track(mic.clone(), &MediaStream::new(vec![mic])).await.unwrap();

        let offer = a.create_offer(false).await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.to_ascii_uppercase().contains("PCMU"));
        a.set_local_description(offer.clone()).await.unwrap();
        assert_eq!(a.signaling_state(), SignalingState::HaveLocalOffer);

        assert!(!b.has_remote_description().await);
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        assert_eq!(a.signaling_state(), SignalingState::Stable);
        assert_eq!(b.signaling_state(), SignalingState::Stable);
        assert!(a.has_remote_description().await);

        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_rollback_discards_pending_offer() {
        let factory = WebRtcPeerFactory::new(&offline()).unwrap();
        let (a, _events) = open(&factory, "b").await;
        let mic = AudioTrack::new(48_000);
        a.add_track(mic.clone(), &MediaStream::new(vec![mic])).await.unwrap();

        assert!(a.rollback().await.is_err());

        let offer = a.create_offer(false).await.unwrap();
        a.set_local_description(offer).await.unwrap();
        a.rollback().await.unwrap();
        assert_eq!(a.signaling_state(), SignalingState::Stable);

        // a remote offer can be applied after yielding
        let (b, _b_events) = open(&factory, "a").await;
        let mic_b = AudioTrack::new(48_000);
        b.add_track(mic_b.clone(), &MediaStream::new(vec![mic_b])).await.unwrap();
        let remote_offer = b.create_offer(false).await.unwrap();
        a.set_remote_description(remote_offer).await.unwrap();
        assert_eq!(a.signaling_state(), SignalingState::HaveRemoteOffer);

        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_candidate_before_remote_description_is_rejected() {
        let factory = WebRtcPeerFactory::new(&offline()).unwrap();
        let (a, _events) = open(&factory, "b").await;
        let err = a
            .add_ice_candidate(IceCandidate::new(
                "candidate:1 1 udp 2130706431 127.0.0.1 50000 typ host",
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Ice(_)));
        a.close().await.unwrap();
    }
}

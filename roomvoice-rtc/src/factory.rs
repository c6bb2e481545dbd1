//! Builds webrtc-rs peer connections for the voice session

use std::sync::Arc;

use async_trait::async_trait;
use roomvoice_core::config::RtcConfig;
use roomvoice_core::voice::{PeerConnection, PeerConnectionFactory, PeerEventSink};
use roomvoice_core::{Error, Result};
use tracing::{debug, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;

use crate::config::rtc_configuration;
use crate::peer::WebRtcPeer;
use crate::track::SenderRegistry;

pub struct WebRtcPeerFactory {
    api: API,
    config: RTCConfiguration,
    senders: Arc<SenderRegistry>,
}

impl WebRtcPeerFactory {
    pub fn new(config: &RtcConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::Internal(format!("register codecs: {e}")))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| Error::Internal(format!("register interceptors: {e}")))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = rtc_configuration(config);
        info!(
            ice_servers = config.ice_servers.len(),
            "WebRTC peer factory initialized"
        );

        Ok(Self {
            api,
            config,
            senders: Arc::new(SenderRegistry::new()),
        })
    }

    /// Number of captured tracks currently being encoded
    pub fn active_senders(&self) -> usize {
        self.senders.len()
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerFactory {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnection>> {
        let pc = self
            .api
            .new_peer_connection(self.config.clone())
            .await
            .map_err(|e| Error::Internal(format!("create peer connection: {e}")))?;
        debug!(peer_id = %events.peer(), "Peer connection created");
        Ok(Arc::new(WebRtcPeer::new(Arc::new(pc), events, self.senders.clone())))
    }
}

//! Peer connection configuration

use std::time::Duration;

use roomvoice_core::config::RtcConfig;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;

/// Audio is carried as G.711 µ-law: 8 kHz mono, one sample per byte
pub const CODEC_SAMPLE_RATE: u32 = 8_000;

/// Packetisation interval of the outbound audio track
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Samples per outbound frame at `sample_rate`
#[must_use]
pub fn frame_len(sample_rate: u32) -> usize {
    (u128::from(sample_rate) * FRAME_DURATION.as_millis() / 1000) as usize
}

/// Map the configured STUN/TURN list onto the backend's configuration
#[must_use]
pub fn rtc_configuration(config: &RtcConfig) -> RTCConfiguration {
    let ice_servers = config
        .ice_servers()
        .into_iter()
        .map(|server| RTCIceServer {
            urls: server.urls,
            username: server.username.unwrap_or_default(),
            credential: server.credential.unwrap_or_default(),
            ..Default::default()
        })
        .collect();

    RTCConfiguration {
        ice_servers,
        ..Default::default()
    }
}

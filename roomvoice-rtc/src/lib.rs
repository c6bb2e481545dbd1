//! WebRTC backend for the `RoomVoice` session
//!
//! Implements the session's peer connection seam on top of webrtc-rs.
//!
//! ## Architecture
//!
//! - **`WebRtcPeerFactory`**: Owns the configured API and ICE servers; one
//!   connection per remote participant
//! - **`WebRtcPeer`**: Adapts `RTCPeerConnection` to the session's
//!   negotiation calls and forwards its callbacks as peer events
//! - **`LocalAudioSender`**: Encodes the microphone once and shares the RTP
//!   track between all connections
//!
//! ## Usage
//!
//! ```rust,ignore
//! use roomvoice_rtc::WebRtcPeerFactory;
//!
//! let peers = Arc::new(WebRtcPeerFactory::new(&config.rtc)?);
//! let session = VoiceSession::new(config.voice, SessionDeps { peers, .. });
//! ```

pub mod codec;
mod config;
mod factory;
mod peer;
mod track;
mod types;

pub use config::{frame_len, rtc_configuration, CODEC_SAMPLE_RATE, FRAME_DURATION};
pub use factory::WebRtcPeerFactory;
pub use peer::WebRtcPeer;
pub use track::{pcmu_capability, LocalAudioSender, SenderRegistry};

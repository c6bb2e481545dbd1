//! Audio track plumbing between the session's tracks and RTP
//!
//! Outbound: one [`LocalAudioSender`] per captured track drains 20 ms frames,
//! downsamples them to 8 kHz and writes PCMU samples. The same
//! `TrackLocalStaticSample` is bound to every peer connection, so the
//! microphone is encoded once regardless of mesh size.
//!
//! Inbound: each remote RTP track is decoded into a fresh [`AudioTrack`] at
//! the playback rate; the track ends when the RTP stream does.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use roomvoice_core::media::{resample_linear, AudioTrack, MediaStream, PLAYBACK_SAMPLE_RATE};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::MIME_TYPE_PCMU;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::codec;
use crate::config::{frame_len, CODEC_SAMPLE_RATE, FRAME_DURATION};

#[must_use]
pub fn pcmu_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_PCMU.to_string(),
        clock_rate: CODEC_SAMPLE_RATE,
        channels: 1,
        ..Default::default()
    }
}

/// Encodes one captured track onto an RTP track shared by all peers
pub struct LocalAudioSender {
    rtc_track: Arc<TrackLocalStaticSample>,
    source: Arc<AudioTrack>,
    token: CancellationToken,
    frames_sent: Arc<AtomicU64>,
}

impl LocalAudioSender {
    pub fn start(source: Arc<AudioTrack>, stream_id: &str) -> Arc<Self> {
        let rtc_track = Arc::new(TrackLocalStaticSample::new(
            pcmu_capability(),
            source.id().to_string(),
            stream_id.to_string(),
        ));
        let sender = Arc::new(Self {
            rtc_track,
            source,
            token: CancellationToken::new(),
            frames_sent: Arc::new(AtomicU64::new(0)),
        });

        tokio::spawn(pump(
            sender.source.clone(),
            sender.rtc_track.clone(),
            sender.token.clone(),
            sender.frames_sent.clone(),
        ));
        sender
    }

    #[must_use]
    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        self.rtc_track.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled() && !self.source.is_ended()
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.token.cancel();
    }
}

impl Drop for LocalAudioSender {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn pump(
    source: Arc<AudioTrack>,
    rtc_track: Arc<TrackLocalStaticSample>,
    token: CancellationToken,
    frames_sent: Arc<AtomicU64>,
) {
    let source_frame = frame_len(source.sample_rate());
    let mut ticker = tokio::time::interval(FRAME_DURATION);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if source.is_ended() {
            break;
        }
        // a disabled track keeps producing silence, so gaps only mean the
        // capture side is behind
        if source.queued() < source_frame {
            continue;
        }

        let pcm = source.drain(source_frame);
        let narrow = resample_linear(&pcm, source.sample_rate(), CODEC_SAMPLE_RATE);
        let sample = Sample {
            data: codec::encode_frame(&narrow),
            duration: FRAME_DURATION,
            ..Default::default()
        };
        if let Err(e) = rtc_track.write_sample(&sample).await {
            warn!(track_id = %source.id(), error = %e, "Failed to write audio sample");
            continue;
        }
        frames_sent.fetch_add(1, Ordering::Relaxed);
    }
    debug!(track_id = %source.id(), "Local audio sender stopped");
}

/// Live senders keyed by captured track id
#[derive(Default)]
pub struct SenderRegistry {
    senders: Mutex<HashMap<String, Arc<LocalAudioSender>>>,
}

impl SenderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The sender for `track`, started on first use. Senders whose source
    /// has ended are replaced.
    pub fn sender_for(&self, track: &Arc<AudioTrack>, stream: &MediaStream) -> Arc<LocalAudioSender> {
        let mut senders = self.senders.lock();
        senders.retain(|_, sender| sender.is_running());
        senders
            .entry(track.id().to_string())
            .or_insert_with(|| LocalAudioSender::start(track.clone(), stream.id()))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.senders.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.lock().is_empty()
    }
}

/// Decode a remote RTP track into a new [`MediaStream`]
///
/// Returns the stream immediately; a background task feeds it until the RTP
/// stream ends, then stops it.
pub fn spawn_remote_reader(remote: Arc<TrackRemote>, peer: String) -> MediaStream {
    let track = AudioTrack::with_id(remote.id(), PLAYBACK_SAMPLE_RATE);
    let stream = MediaStream::with_id(remote.stream_id(), vec![track.clone()]);
    let mime_type = remote.codec().capability.mime_type;

    info!(
        peer_id = %peer,
        track_id = %track.id(),
        codec = %mime_type,
        "Receiving remote audio"
    );

    tokio::spawn(async move {
        let decodable = mime_type.eq_ignore_ascii_case(MIME_TYPE_PCMU);
        if !decodable {
            warn!(peer_id = %peer, codec = %mime_type, "Unsupported remote codec, audio will be silent");
        }

        loop {
            match remote.read_rtp().await {
                Ok((packet, _)) => {
                    if !decodable || track.is_ended() {
                        continue;
                    }
                    let narrow = codec::decode_frame(&packet.payload);
                    track.write(&resample_linear(&narrow, CODEC_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE));
                }
                Err(e) => {
                    debug!(peer_id = %peer, error = %e, "Remote audio ended");
                    break;
                }
            }
        }
        track.stop();
    });

    stream
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcmu_capability() {
        let capability = pcmu_capability();
        assert_eq!(capability.mime_type, MIME_TYPE_PCMU);
        assert_eq!(capability.clock_rate, 8_000);
        assert_eq!(capability.channels, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sender_drains_whole_frames() {
        let source = AudioTrack::new(48_000);
        let sender = LocalAudioSender::start(source.clone(), "local");

        source.write(&vec![0.25; 960 * 3 + 100]);
        tokio::time::sleep(FRAME_DURATION * 5).await;

        // unbound tracks accept samples, so all three frames went out
        assert_eq!(sender.frames_sent(), 3);
        assert_eq!(source.queued(), 100);

        source.stop();
        tokio::time::sleep(FRAME_DURATION * 2).await;
        assert!(!sender.is_running());
    }

    #[tokio::test]
    async fn test_registry_shares_one_sender_per_track() {
        let registry = SenderRegistry::new();
        let track = AudioTrack::new(48_000);
        let stream = MediaStream::new(vec![track.clone()]);

        let a = registry.sender_for(&track, &stream);
        let b = registry.sender_for(&track, &stream);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);

        track.stop();
        let replacement = AudioTrack::new(48_000);
        registry.sender_for(&replacement, &stream);
        assert_eq!(registry.len(), 1);
    }
}

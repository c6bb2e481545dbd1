//! Media primitives shared by capture, transport and playback
//!
//! A [`MediaStream`] is a bundle of [`AudioTrack`]s. Tracks are written by a
//! producer (microphone callback or RTP reader) and read by two kinds of
//! consumers: analysers look at the most recent window of samples without
//! consuming it, while exactly one sink (the RTP sender for the local track,
//! the [`AudioGraph`] mixer for remote tracks) drains the playout queue.

pub mod analyser;
pub mod graph;
pub mod pipeline;
pub mod vad;

pub use analyser::SpectrumAnalyser;
pub use graph::{AudioContextState, AudioGraph, MasterGain, PlaybackRoute};
pub use pipeline::{AnalysisHandle, AudioPipeline, SpeakingUpdate, PLAYBACK_SAMPLE_RATE};
pub use vad::VoiceActivityDetector;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::CaptureError;
use crate::models::generate_id;

/// Samples kept for analysis (enough for the largest supported FFT window)
const ANALYSIS_WINDOW: usize = 4096;

/// Audio capture constraints passed to [`MediaDevices::get_user_media`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// A single mono PCM audio track
pub struct AudioTrack {
    id: String,
    sample_rate: u32,
    enabled: AtomicBool,
    ended: AtomicBool,
    window: Mutex<VecDeque<f32>>,
    playout: Mutex<VecDeque<f32>>,
    playout_capacity: usize,
    written: AtomicU64,
}

impl AudioTrack {
    pub fn new(sample_rate: u32) -> Arc<Self> {
        Self::with_id(generate_id(), sample_rate)
    }

    pub fn with_id(id: impl Into<String>, sample_rate: u32) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            sample_rate,
            enabled: AtomicBool::new(true),
            ended: AtomicBool::new(false),
            window: Mutex::new(VecDeque::with_capacity(ANALYSIS_WINDOW)),
            playout: Mutex::new(VecDeque::new()),
            // one second of buffered audio; older samples are dropped
            playout_capacity: sample_rate as usize,
            written: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Disabling a track keeps it running but makes it produce silence
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Permanently stop the track; further writes are discarded
    pub fn stop(&self) {
        if !self.ended.swap(true, Ordering::SeqCst) {
            self.playout.lock().clear();
            self.window.lock().clear();
        }
    }

    /// Append captured or decoded samples
    pub fn write(&self, samples: &[f32]) {
        if self.is_ended() || samples.is_empty() {
            return;
        }
        let silent;
        let samples = if self.is_enabled() {
            samples
        } else {
            silent = vec![0.0; samples.len()];
            &silent
        };

        {
            let mut window = self.window.lock();
            window.extend(samples.iter().copied());
            let excess = window.len().saturating_sub(ANALYSIS_WINDOW);
            window.drain(..excess);
        }

        let mut playout = self.playout.lock();
        playout.extend(samples.iter().copied());
        let excess = playout.len().saturating_sub(self.playout_capacity);
        playout.drain(..excess);
        drop(playout);

        self.written
            .fetch_add(samples.len() as u64, Ordering::SeqCst);
    }

    /// Total samples ever written; unchanged while the producer is idle
    pub fn samples_written(&self) -> u64 {
        self.written.load(Ordering::SeqCst)
    }

    /// The most recent `len` samples, zero-padded at the front when short
    pub fn latest(&self, len: usize) -> Vec<f32> {
        let window = self.window.lock();
        let available = window.len().min(len);
        let mut out = vec![0.0; len - available];
        out.extend(window.iter().skip(window.len() - available).copied());
        out
    }

    /// Consume up to `max` queued samples for playout or transmission
    pub fn drain(&self, max: usize) -> Vec<f32> {
        let mut playout = self.playout.lock();
        let take = playout.len().min(max);
        playout.drain(..take).collect()
    }

    pub fn queued(&self) -> usize {
        self.playout.lock().len()
    }
}

impl std::fmt::Debug for AudioTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioTrack")
            .field("id", &self.id)
            .field("sample_rate", &self.sample_rate)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// A bundle of audio tracks owned by whoever created it
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<Arc<AudioTrack>>,
}

impl MediaStream {
    #[must_use]
    pub fn new(tracks: Vec<Arc<AudioTrack>>) -> Self {
        Self::with_id(generate_id(), tracks)
    }

    pub fn with_id(id: impl Into<String>, tracks: Vec<Arc<AudioTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn tracks(&self) -> &[Arc<AudioTrack>] {
        &self.tracks
    }

    /// First track, which is the one analysed and mixed
    #[must_use]
    pub fn primary_track(&self) -> Option<&Arc<AudioTrack>> {
        self.tracks.first()
    }

    /// A stream is live while any of its tracks has not ended
    pub fn is_active(&self) -> bool {
        self.tracks.iter().any(|t| !t.is_ended())
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Microphone access (the `getUserMedia` seam)
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(
        &self,
        constraints: &AudioConstraints,
    ) -> std::result::Result<MediaStream, CaptureError>;
}

/// Audio output device that renders an [`AudioGraph`]
///
/// `start` is called once, when the graph is lazily created.
#[cfg_attr(test, mockall::automock)]
pub trait AudioOutput: Send + Sync {
    fn start(&self, graph: Arc<AudioGraph>) -> crate::Result<()>;
    fn stop(&self);
}

/// Linear-interpolation resampler for mono PCM
#[must_use]
pub fn resample_linear(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || input.is_empty() {
        return input.to_vec();
    }
    let ratio = f64::from(from_rate) / f64::from(to_rate);
    let out_len = ((input.len() as f64) / ratio).round() as usize;
    let last = input.len() - 1;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = (pos.floor() as usize).min(last);
            let next = (idx + 1).min(last);
            let frac = (pos - idx as f64) as f32;
            input[idx] * (1.0 - frac) + input[next] * frac
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_track_writes_silence() {
        let track = AudioTrack::new(8000);
        track.set_enabled(false);
        track.write(&[0.5; 10]);
        assert!(track.latest(10).iter().all(|s| *s == 0.0));
        assert_eq!(track.queued(), 10);
        assert!(!track.is_ended());
    }

    #[test]
    fn test_latest_pads_and_keeps_order() {
        let track = AudioTrack::new(8000);
        track.write(&[0.1, 0.2, 0.3]);
        assert_eq!(track.latest(5), vec![0.0, 0.0, 0.1, 0.2, 0.3]);
        assert_eq!(track.latest(2), vec![0.2, 0.3]);
    }

    #[test]
    fn test_written_counter_tracks_fresh_audio() {
        let track = AudioTrack::new(8000);
        assert_eq!(track.samples_written(), 0);
        track.write(&[0.5; 100]);
        track.set_enabled(false);
        track.write(&[0.5; 60]);
        assert_eq!(track.samples_written(), 160);
        track.write(&[]);
        assert_eq!(track.samples_written(), 160);
        // reading does not count as fresh audio
        let _ = track.latest(256);
        let _ = track.drain(256);
        assert_eq!(track.samples_written(), 160);
    }

    #[test]
    fn test_playout_is_bounded() {
        let track = AudioTrack::new(100);
        track.write(&[0.1; 250]);
        assert_eq!(track.queued(), 100);
        assert_eq!(track.drain(30).len(), 30);
        assert_eq!(track.queued(), 70);
    }

    #[test]
    fn test_stopped_track_discards_writes() {
        let track = AudioTrack::new(8000);
        let stream = MediaStream::new(vec![track.clone()]);
        assert!(stream.is_active());
        stream.stop();
        track.write(&[0.5; 10]);
        assert_eq!(track.queued(), 0);
        assert!(!stream.is_active());
    }

    #[test]
    fn test_resample_linear_lengths() {
        let input = vec![0.0, 1.0, 0.0, -1.0];
        assert_eq!(resample_linear(&input, 8000, 48000).len(), 24);
        assert_eq!(resample_linear(&[0.5; 480], 48000, 8000).len(), 80);
        assert_eq!(resample_linear(&input, 8000, 8000), input);
    }
}

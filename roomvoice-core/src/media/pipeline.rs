//! Capture, voice activity analysis and playback wiring for one session

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    AudioConstraints, AudioGraph, AudioOutput, MediaDevices, MediaStream, SpectrumAnalyser,
    VoiceActivityDetector,
};
use crate::config::VoiceConfig;
use crate::error::CaptureError;
use crate::models::ParticipantId;

/// Sample rate of the shared audio context and of decoded remote tracks
pub const PLAYBACK_SAMPLE_RATE: u32 = 48_000;

/// Speaking flag flip produced by an analysis loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeakingUpdate {
    pub participant: ParticipantId,
    pub speaking: bool,
}

/// Handle for a running analysis loop; the loop stops when cancelled
#[derive(Debug)]
pub struct AnalysisHandle {
    stream_id: String,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl AnalysisHandle {
    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Owns the local stream, the lazily created audio graph and every
/// per-participant analysis loop.
pub struct AudioPipeline {
    config: VoiceConfig,
    output: Option<Arc<dyn AudioOutput>>,
    graph: Option<Arc<AudioGraph>>,
    volume: u8,
    local: Option<MediaStream>,
    analysers: HashMap<ParticipantId, AnalysisHandle>,
    speaking_tx: mpsc::UnboundedSender<SpeakingUpdate>,
}

impl AudioPipeline {
    pub fn new(
        config: VoiceConfig,
        output: Option<Arc<dyn AudioOutput>>,
        speaking_tx: mpsc::UnboundedSender<SpeakingUpdate>,
    ) -> Self {
        let volume = config.default_volume.min(100);
        Self {
            config,
            output,
            graph: None,
            volume,
            local: None,
            analysers: HashMap::new(),
            speaking_tx,
        }
    }

    /// Request the microphone once with echo cancellation, noise suppression
    /// and automatic gain enabled
    pub async fn capture(
        &mut self,
        devices: &dyn MediaDevices,
    ) -> Result<MediaStream, CaptureError> {
        if let Some(local) = &self.local {
            return Ok(local.clone());
        }
        let stream = devices
            .get_user_media(&AudioConstraints::default())
            .await?;
        if stream.primary_track().is_none() {
            return Err(CaptureError::NoDevice);
        }
        debug!(stream_id = %stream.id(), "Microphone captured");
        self.local = Some(stream.clone());
        Ok(stream)
    }

    #[must_use]
    pub const fn local_stream(&self) -> Option<&MediaStream> {
        self.local.as_ref()
    }

    /// The shared audio graph, created on first use
    pub fn graph(&mut self) -> Arc<AudioGraph> {
        if let Some(graph) = &self.graph {
            return graph.clone();
        }
        let graph = AudioGraph::new(PLAYBACK_SAMPLE_RATE, gain_for(self.volume));
        if let Some(output) = &self.output {
            if let Err(e) = output.start(graph.clone()) {
                warn!(error = %e, "Failed to start audio output");
            }
        }
        self.graph = Some(graph.clone());
        graph
    }

    #[must_use]
    pub fn existing_graph(&self) -> Option<&Arc<AudioGraph>> {
        self.graph.as_ref()
    }

    /// Resume the shared context if it is suspended
    pub fn resume(&mut self) -> bool {
        self.graph().resume()
    }

    /// Set remote volume in percent (clamped to 0-100) on the master gain
    pub fn set_volume(&mut self, percent: u8) {
        self.volume = percent.min(100);
        let ramp = self.config.volume_ramp();
        self.graph().set_gain(gain_for(self.volume), ramp);
    }

    #[must_use]
    pub const fn volume(&self) -> u8 {
        self.volume
    }

    /// Bind a remote stream into playback: master gain plus a hidden route
    pub fn attach_remote(&mut self, peer: &ParticipantId, stream: &MediaStream) {
        let graph = self.graph();
        graph.connect_source(peer, stream);
        graph.route_playback(peer, stream);
        self.start_analysis(peer.clone(), stream.clone());
    }

    /// Undo [`attach_remote`](Self::attach_remote) and stop the analysis loop
    pub fn detach_remote(&mut self, peer: &ParticipantId) {
        if let Some(graph) = &self.graph {
            graph.disconnect_source(peer);
            graph.unroute_playback(peer);
        }
        self.stop_analysis(peer);
    }

    /// Start (or replace) the analysis loop for one participant's stream
    pub fn start_analysis(&mut self, participant: ParticipantId, stream: MediaStream) {
        if let Some(existing) = self.analysers.get(&participant) {
            if existing.stream_id() == stream.id() && !existing.is_finished() {
                return;
            }
        }
        self.stop_analysis(&participant);

        let token = CancellationToken::new();
        let stream_id = stream.id().to_string();
        let task = tokio::spawn(analysis_loop(
            self.config.clone(),
            participant.clone(),
            self.local.clone(),
            stream,
            self.speaking_tx.clone(),
            token.clone(),
        ));
        self.analysers.insert(
            participant,
            AnalysisHandle {
                stream_id,
                token,
                task,
            },
        );
    }

    pub fn stop_analysis(&mut self, participant: &ParticipantId) {
        if let Some(handle) = self.analysers.remove(participant) {
            handle.cancel();
        }
    }

    pub fn analysis_count(&self) -> usize {
        self.analysers.len()
    }

    /// Stop every loop, release the microphone and close the graph
    pub fn shutdown(&mut self) {
        for (_, handle) in self.analysers.drain() {
            handle.cancel();
        }
        if let Some(local) = self.local.take() {
            local.stop();
        }
        if let Some(graph) = self.graph.take() {
            graph.close();
            if let Some(output) = &self.output {
                output.stop();
            }
        }
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        for handle in self.analysers.values() {
            handle.cancel();
        }
    }
}

fn gain_for(percent: u8) -> f32 {
    f32::from(percent.min(100)) / 100.0
}

/// Sample the stream every analysis tick and report speaking flips.
///
/// Ends on cancellation, when the receiver is gone, or once neither the local
/// stream nor the analysed stream is still live.
async fn analysis_loop(
    config: VoiceConfig,
    participant: ParticipantId,
    local: Option<MediaStream>,
    stream: MediaStream,
    speaking_tx: mpsc::UnboundedSender<SpeakingUpdate>,
    token: CancellationToken,
) {
    let Some(track) = stream.primary_track().cloned() else {
        return;
    };
    let mut analyser = SpectrumAnalyser::new(config.fft_size, config.smoothing_time_constant);
    let mut vad = VoiceActivityDetector::new(
        config.speaking_threshold,
        config.speaking_frames,
        config.silence_frames,
    );
    let silence = vec![0.0; analyser.fft_size()];
    let mut last_written = track.samples_written();
    let mut ticker = tokio::time::interval(config.analysis_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let local_live = local.as_ref().is_some_and(MediaStream::is_active);
        if !local_live && !stream.is_active() {
            break;
        }

        // a producer that stopped writing (lost RTP, stalled device) is silent
        let written = track.samples_written();
        let energy = if written == last_written {
            analyser.average_energy(&silence)
        } else {
            analyser.average_energy(&track.latest(analyser.fft_size()))
        };
        last_written = written;
        if let Some(speaking) = vad.observe(energy) {
            let update = SpeakingUpdate {
                participant: participant.clone(),
                speaking,
            };
            if speaking_tx.send(update).is_err() {
                break;
            }
        }
    }

    // a loop that ends while speaking must not leave the flag stuck on
    if vad.is_speaking() {
        let _ = speaking_tx.send(SpeakingUpdate {
            participant,
            speaking: false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{AudioTrack, MockAudioOutput, MockMediaDevices};
    use std::time::Duration;

    /// Keep writing fresh noise scaled by `gain` every 8 ms, like a live producer
    fn feed(track: Arc<AudioTrack>, gain: f32) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut state: u32 = 11;
            loop {
                let chunk: Vec<f32> = (0..64)
                    .map(|_| {
                        state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                        ((state >> 8) as f32 / (1u32 << 24) as f32 - 0.5) * 0.8 * gain
                    })
                    .collect();
                track.write(&chunk);
                tokio::time::sleep(Duration::from_millis(8)).await;
            }
        })
    }

    fn pipeline() -> (AudioPipeline, mpsc::UnboundedReceiver<SpeakingUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (AudioPipeline::new(VoiceConfig::default(), None, tx), rx)
    }

    #[tokio::test]
    async fn test_capture_requests_processing_constraints() {
        let mut devices = MockMediaDevices::new();
        devices
            .expect_get_user_media()
            .withf(|c| c.echo_cancellation && c.noise_suppression && c.auto_gain_control)
            .times(1)
            .returning(|_| Ok(MediaStream::new(vec![AudioTrack::new(48_000)])));

        let (mut pipeline, _rx) = pipeline();
        let first = pipeline.capture(&devices).await.unwrap();
        let second = pipeline.capture(&devices).await.unwrap();
        assert_eq!(first.id(), second.id());
    }

    #[tokio::test]
    async fn test_capture_failure_is_typed() {
        let mut devices = MockMediaDevices::new();
        devices
            .expect_get_user_media()
            .returning(|_| Err(CaptureError::PermissionDenied));

        let (mut pipeline, _rx) = pipeline();
        let err = pipeline.capture(&devices).await.unwrap_err();
        assert_eq!(err, CaptureError::PermissionDenied);
        assert!(pipeline.local_stream().is_none());
    }

    #[tokio::test]
    async fn test_graph_is_created_once_and_started() {
        let mut output = MockAudioOutput::new();
        output.expect_start().times(1).returning(|_| Ok(()));
        output.expect_stop().times(1).return_const(());

        let (tx, _rx) = mpsc::unbounded_channel();
        let mut pipeline = AudioPipeline::new(VoiceConfig::default(), Some(Arc::new(output)), tx);
        let a = pipeline.graph();
        let b = pipeline.graph();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(pipeline.resume());
        assert!(!pipeline.resume());
        pipeline.shutdown();
    }

    #[tokio::test]
    async fn test_set_volume_zero_keeps_tracks() {
        let (mut pipeline, _rx) = pipeline();
        let track = AudioTrack::new(PLAYBACK_SAMPLE_RATE);
        let stream = MediaStream::new(vec![track.clone()]);
        let peer = ParticipantId::from("bob");
        pipeline.attach_remote(&peer, &stream);

        pipeline.set_volume(0);
        assert_eq!(pipeline.volume(), 0);
        assert_eq!(pipeline.graph().target_gain(), 0.0);
        assert!(track.is_enabled());
        assert!(!track.is_ended());

        pipeline.set_volume(250);
        assert_eq!(pipeline.volume(), 100);
    }

    #[tokio::test]
    async fn test_attach_routes_muted_playback() {
        let (mut pipeline, _rx) = pipeline();
        let stream = MediaStream::new(vec![AudioTrack::new(PLAYBACK_SAMPLE_RATE)]);
        let peer = ParticipantId::from("bob");
        pipeline.attach_remote(&peer, &stream);

        let graph = pipeline.graph();
        assert!(graph.playback_route(&peer).unwrap().is_muted());
        assert_eq!(graph.source_count(), 1);
        assert_eq!(pipeline.analysis_count(), 1);

        pipeline.detach_remote(&peer);
        assert!(graph.playback_route(&peer).is_none());
        assert_eq!(graph.source_count(), 0);
        assert_eq!(pipeline.analysis_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_analysis_reports_speaking_flips() {
        let (mut pipeline, mut rx) = pipeline();
        let track = AudioTrack::new(8000);
        let stream = MediaStream::new(vec![track.clone()]);
        let peer = ParticipantId::from("bob");
        pipeline.start_analysis(peer.clone(), stream);

        let writer = feed(track.clone(), 1.0);
        let update = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update, SpeakingUpdate { participant: peer.clone(), speaking: true });
        writer.abort();

        let writer = feed(track.clone(), 0.0);
        let update = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!update.speaking);
        writer.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_speaking_clears_when_samples_stop_arriving() {
        let (mut pipeline, mut rx) = pipeline();
        let track = AudioTrack::new(8000);
        let peer = ParticipantId::from("bob");
        pipeline.start_analysis(peer.clone(), MediaStream::new(vec![track.clone()]));

        let writer = feed(track.clone(), 1.0);
        let update = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(update.speaking);

        // the remote went away mid-word; its last samples stay in the window
        writer.abort();
        let update = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update, SpeakingUpdate { participant: peer, speaking: false });
        assert!(!track.is_ended());
    }

    #[tokio::test(start_paused = true)]
    async fn test_analysis_ends_when_streams_stop() {
        let (mut pipeline, _rx) = pipeline();
        let stream = MediaStream::new(vec![AudioTrack::new(8000)]);
        pipeline.start_analysis(ParticipantId::from("bob"), stream.clone());

        stream.stop();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let handle = pipeline.analysers.get(&ParticipantId::from("bob")).unwrap();
        assert!(handle.is_finished());
    }
}

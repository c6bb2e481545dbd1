//! Microphone capture and speaker playback using cpal
//!
//! cpal streams are not `Send`, so each one lives on its own thread for as
//! long as it is needed.

use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use parking_lot::Mutex;
use roomvoice_core::media::{AudioConstraints, AudioGraph, AudioOutput, AudioTrack, MediaDevices, MediaStream};
use roomvoice_core::{CaptureError, Error};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// How often the capture thread checks whether its track was stopped
const CAPTURE_POLL: Duration = Duration::from_millis(100);

/// Average interleaved frames down to mono
pub fn downmix<T: Copy>(data: &[T], channels: usize, to_f32: impl Fn(T) -> f32) -> Vec<f32> {
    let channels = channels.max(1);
    data.chunks(channels)
        .map(|frame| frame.iter().map(|s| to_f32(*s)).sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Default input device of the default host
#[derive(Debug, Default)]
pub struct CpalMicrophone;

impl CpalMicrophone {
    fn open(track_tx: oneshot::Sender<Result<Arc<AudioTrack>, CaptureError>>) {
        let opened = match open_input() {
            Ok(opened) => opened,
            Err(e) => {
                let _ = track_tx.send(Err(e));
                return;
            }
        };
        let (stream, track) = opened;
        if track_tx.send(Ok(track.clone())).is_err() {
            return;
        }

        while !track.is_ended() {
            thread::sleep(CAPTURE_POLL);
        }
        drop(stream);
        debug!(track_id = %track.id(), "Microphone capture stopped");
    }
}

fn open_input() -> Result<(cpal::Stream, Arc<AudioTrack>), CaptureError> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or(CaptureError::NoDevice)?;
    let supported = device
        .default_input_config()
        .map_err(|e| CaptureError::Device(e.to_string()))?;

    let config: StreamConfig = supported.config();
    let channels = usize::from(config.channels);
    let track = AudioTrack::new(config.sample_rate.0);
    let on_error = |e: cpal::StreamError| error!(error = %e, "Microphone stream error");

    let sink = track.clone();
    let stream = match supported.sample_format() {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                sink.write(&downmix(data, channels, |s| s));
            },
            on_error,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                sink.write(&downmix(data, channels, |s| f32::from(s) / 32768.0));
            },
            on_error,
            None,
        ),
        other => {
            return Err(CaptureError::Device(format!(
                "unsupported sample format {other:?}"
            )))
        }
    }
    .map_err(|e| CaptureError::Device(e.to_string()))?;

    stream
        .play()
        .map_err(|e| CaptureError::Device(e.to_string()))?;

    info!(
        device = %device.name().unwrap_or_default(),
        sample_rate = config.sample_rate.0,
        channels,
        "Microphone capture started"
    );
    Ok((stream, track))
}

#[async_trait]
impl MediaDevices for CpalMicrophone {
    async fn get_user_media(
        &self,
        constraints: &AudioConstraints,
    ) -> Result<MediaStream, CaptureError> {
        // the default host exposes no voice processing
        debug!(?constraints, "Capture constraints are advisory on this platform");

        let (tx, rx) = oneshot::channel();
        thread::Builder::new()
            .name("roomvoice-mic".to_string())
            .spawn(move || Self::open(tx))
            .map_err(|e| CaptureError::Device(e.to_string()))?;

        let track = rx
            .await
            .map_err(|_| CaptureError::Device("capture thread exited".to_string()))??;
        Ok(MediaStream::new(vec![track]))
    }
}

/// Default output device, rendering the session's audio graph
#[derive(Default)]
pub struct CpalSpeaker {
    stop_tx: Mutex<Option<std_mpsc::Sender<()>>>,
}

impl CpalSpeaker {
    pub fn new() -> Self {
        Self::default()
    }
}

fn open_output(graph: Arc<AudioGraph>) -> roomvoice_core::Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Internal("No output device available".to_string()))?;
    let supported = device
        .default_output_config()
        .map_err(|e| Error::Internal(e.to_string()))?;

    let mut config: StreamConfig = supported.config();
    config.sample_rate = cpal::SampleRate(graph.sample_rate());
    let channels = usize::from(config.channels).max(1);

    let mut mono = Vec::new();
    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                mono.resize(data.len() / channels, 0.0);
                graph.render(&mut mono);
                for (frame, sample) in data.chunks_mut(channels).zip(mono.iter()) {
                    frame.fill(*sample);
                }
            },
            |e| error!(error = %e, "Speaker stream error"),
            None,
        )
        .map_err(|e| Error::Internal(format!("open speaker: {e}")))?;
    stream
        .play()
        .map_err(|e| Error::Internal(format!("start speaker: {e}")))?;

    info!(
        device = %device.name().unwrap_or_default(),
        sample_rate = config.sample_rate.0,
        channels,
        "Speaker playback started"
    );
    Ok(stream)
}

impl AudioOutput for CpalSpeaker {
    fn start(&self, graph: Arc<AudioGraph>) -> roomvoice_core::Result<()> {
        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        thread::Builder::new()
            .name("roomvoice-speaker".to_string())
            .spawn(move || {
                let stream = match open_output(graph) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // returns once the sender is dropped
                let _ = stop_rx.recv();
                drop(stream);
                debug!("Speaker playback stopped");
            })
            .map_err(|e| Error::Internal(e.to_string()))?;

        ready_rx
            .recv()
            .map_err(|_| Error::Internal("speaker thread exited".to_string()))??;
        if let Some(previous) = self.stop_tx.lock().replace(stop_tx) {
            warn!("Speaker restarted while running");
            drop(previous);
        }
        Ok(())
    }

    fn stop(&self) {
        self.stop_tx.lock().take();
    }
}

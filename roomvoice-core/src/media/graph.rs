//! Shared software audio context
//!
//! All remote streams feed a single [`MasterGain`]; the mixed result is
//! pulled by the output device through [`AudioGraph::render`]. Every remote
//! stream is also bound to a hidden [`PlaybackRoute`] that is kept muted.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::MediaStream;
use crate::models::ParticipantId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioContextState {
    /// Created but not yet allowed to produce sound
    Suspended,
    Running,
    Closed,
}

/// Session-wide gain stage with a linear ramp to avoid clicks
#[derive(Debug, Clone)]
pub struct MasterGain {
    current: f32,
    target: f32,
    step: f32,
}

impl MasterGain {
    #[must_use]
    pub const fn new(value: f32) -> Self {
        Self {
            current: value,
            target: value,
            step: 0.0,
        }
    }

    /// Ramp linearly to `target` over `ramp_samples` rendered samples
    pub fn ramp_to(&mut self, target: f32, ramp_samples: usize) {
        self.target = target;
        if ramp_samples == 0 {
            self.current = target;
            self.step = 0.0;
        } else {
            self.step = (target - self.current) / ramp_samples as f32;
        }
    }

    #[must_use]
    pub const fn value(&self) -> f32 {
        self.current
    }

    #[must_use]
    pub const fn target(&self) -> f32 {
        self.target
    }

    /// Advance one sample and return the gain to apply to it
    pub fn next_sample(&mut self) -> f32 {
        if self.step != 0.0 {
            self.current += self.step;
            let overshoot = (self.step > 0.0 && self.current >= self.target)
                || (self.step < 0.0 && self.current <= self.target);
            if overshoot {
                self.current = self.target;
                self.step = 0.0;
            }
        }
        self.current
    }
}

/// Hidden, always-muted playback element bound to one remote stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackRoute {
    pub stream_id: String,
    muted: bool,
    playing: bool,
}

impl PlaybackRoute {
    fn bind(stream: &MediaStream) -> Self {
        Self {
            stream_id: stream.id().to_string(),
            muted: true,
            playing: true,
        }
    }

    #[must_use]
    pub const fn is_muted(&self) -> bool {
        self.muted
    }

    #[must_use]
    pub const fn is_playing(&self) -> bool {
        self.playing
    }
}

struct GraphInner {
    state: AudioContextState,
    gain: MasterGain,
    sources: HashMap<ParticipantId, MediaStream>,
    routes: HashMap<ParticipantId, PlaybackRoute>,
    mix: Vec<f32>,
}

pub struct AudioGraph {
    sample_rate: u32,
    inner: Mutex<GraphInner>,
}

impl AudioGraph {
    /// A new graph starts suspended until a user gesture resumes it
    #[must_use]
    pub fn new(sample_rate: u32, initial_gain: f32) -> Arc<Self> {
        Arc::new(Self {
            sample_rate,
            inner: Mutex::new(GraphInner {
                state: AudioContextState::Suspended,
                gain: MasterGain::new(initial_gain),
                sources: HashMap::new(),
                routes: HashMap::new(),
                mix: Vec::new(),
            }),
        })
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn state(&self) -> AudioContextState {
        self.inner.lock().state
    }

    /// Resume a suspended graph; returns whether the state changed
    pub fn resume(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == AudioContextState::Suspended {
            inner.state = AudioContextState::Running;
            debug!("Audio context resumed");
            true
        } else {
            false
        }
    }

    pub fn suspend(&self) {
        let mut inner = self.inner.lock();
        if inner.state == AudioContextState::Running {
            inner.state = AudioContextState::Suspended;
        }
    }

    /// Close the graph and drop every source and route
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.state = AudioContextState::Closed;
        inner.sources.clear();
        inner.routes.clear();
    }

    /// Set the master gain with a short linear ramp
    pub fn set_gain(&self, value: f32, ramp: Duration) {
        let value = value.clamp(0.0, 1.0);
        let ramp_samples = (ramp.as_secs_f64() * f64::from(self.sample_rate)) as usize;
        self.inner.lock().gain.ramp_to(value, ramp_samples);
    }

    pub fn gain(&self) -> f32 {
        self.inner.lock().gain.value()
    }

    pub fn target_gain(&self) -> f32 {
        self.inner.lock().gain.target()
    }

    /// Connect a remote stream to the master gain
    pub fn connect_source(&self, peer: &ParticipantId, stream: &MediaStream) {
        let mut inner = self.inner.lock();
        if inner.state == AudioContextState::Closed {
            return;
        }
        inner.sources.insert(peer.clone(), stream.clone());
    }

    pub fn disconnect_source(&self, peer: &ParticipantId) -> bool {
        self.inner.lock().sources.remove(peer).is_some()
    }

    /// Bind a remote stream to a hidden, muted playback route
    pub fn route_playback(&self, peer: &ParticipantId, stream: &MediaStream) {
        let mut inner = self.inner.lock();
        if inner.state == AudioContextState::Closed {
            return;
        }
        inner
            .routes
            .insert(peer.clone(), PlaybackRoute::bind(stream));
    }

    pub fn unroute_playback(&self, peer: &ParticipantId) -> bool {
        self.inner.lock().routes.remove(peer).is_some()
    }

    pub fn playback_route(&self, peer: &ParticipantId) -> Option<PlaybackRoute> {
        self.inner.lock().routes.get(peer).cloned()
    }

    pub fn source_count(&self) -> usize {
        self.inner.lock().sources.len()
    }

    /// Mix every connected source through the master gain into `out`
    ///
    /// Produces silence while the graph is not running; sources are left
    /// untouched in that case.
    pub fn render(&self, out: &mut [f32]) {
        let mut inner = self.inner.lock();
        if inner.state != AudioContextState::Running {
            out.fill(0.0);
            return;
        }

        let GraphInner {
            gain, sources, mix, ..
        } = &mut *inner;

        mix.clear();
        mix.resize(out.len(), 0.0);
        for stream in sources.values() {
            for track in stream.tracks() {
                if track.is_ended() {
                    continue;
                }
                for (acc, sample) in mix.iter_mut().zip(track.drain(out.len())) {
                    *acc += sample;
                }
            }
        }

        for (slot, sample) in out.iter_mut().zip(mix.iter()) {
            *slot = (sample * gain.next_sample()).clamp(-1.0, 1.0);
        }
    }
}

impl std::fmt::Debug for AudioGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("AudioGraph")
            .field("sample_rate", &self.sample_rate)
            .field("state", &inner.state)
            .field("gain", &inner.gain.value())
            .field("sources", &inner.sources.len())
            .finish()
    }
}

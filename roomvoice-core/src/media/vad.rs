//! Hysteresis voice activity detection

/// Counts consecutive voiced and silent frames for one participant.
///
/// The speaking flag turns on only after `speak_after` voiced frames in a
/// row and off only after `silence_after` silent frames in a row, so short
/// dropouts and plosives do not make the indicator flicker.
#[derive(Debug, Clone)]
pub struct VoiceActivityDetector {
    threshold: f32,
    speak_after: u32,
    silence_after: u32,
    speaking_frames: u32,
    silent_frames: u32,
    is_speaking: bool,
}

impl VoiceActivityDetector {
    #[must_use]
    pub const fn new(threshold: f32, speak_after: u32, silence_after: u32) -> Self {
        Self {
            threshold,
            speak_after,
            silence_after,
            speaking_frames: 0,
            silent_frames: 0,
            is_speaking: false,
        }
    }

    #[must_use]
    pub const fn is_speaking(&self) -> bool {
        self.is_speaking
    }

    /// Feed one frame's energy; returns the new state when it flips
    pub fn observe(&mut self, energy: f32) -> Option<bool> {
        if energy > self.threshold {
            self.speaking_frames = self.speaking_frames.saturating_add(1);
            self.silent_frames = 0;
            if !self.is_speaking && self.speaking_frames >= self.speak_after {
                self.is_speaking = true;
                return Some(true);
            }
        } else {
            self.silent_frames = self.silent_frames.saturating_add(1);
            self.speaking_frames = 0;
            if self.is_speaking && self.silent_frames >= self.silence_after {
                self.is_speaking = false;
                return Some(false);
            }
        }
        None
    }
}

//! Frequency analyser producing byte-scaled spectrum data
//!
//! Mirrors the behaviour of a Web Audio `AnalyserNode`: a Blackman window is
//! applied to the most recent `fft_size` samples, magnitudes are smoothed
//! over time, converted to decibels and mapped linearly from
//! `[MIN_DECIBELS, MAX_DECIBELS]` onto `0..=255`.

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;

const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;

pub struct SpectrumAnalyser {
    fft: Arc<dyn Fft<f32>>,
    fft_size: usize,
    window: Vec<f32>,
    smoothing: f32,
    smoothed: Vec<f32>,
    buffer: Vec<Complex<f32>>,
}

impl SpectrumAnalyser {
    #[must_use]
    pub fn new(fft_size: usize, smoothing: f32) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(fft_size);

        Self {
            fft,
            fft_size,
            window: blackman_window(fft_size),
            smoothing: smoothing.clamp(0.0, 1.0),
            smoothed: vec![0.0; fft_size / 2],
            buffer: vec![Complex::new(0.0, 0.0); fft_size],
        }
    }

    #[must_use]
    pub const fn fft_size(&self) -> usize {
        self.fft_size
    }

    #[must_use]
    pub const fn frequency_bin_count(&self) -> usize {
        self.fft_size / 2
    }

    /// Spectrum of the last `fft_size` samples as bytes, one per frequency bin
    ///
    /// `samples` shorter than the window are zero-padded at the front.
    pub fn byte_frequency_data(&mut self, samples: &[f32]) -> Vec<u8> {
        let offset = self.fft_size.saturating_sub(samples.len());
        let tail = &samples[samples.len().saturating_sub(self.fft_size)..];

        for (i, slot) in self.buffer.iter_mut().enumerate() {
            let sample = if i < offset { 0.0 } else { tail[i - offset] };
            *slot = Complex::new(sample * self.window[i], 0.0);
        }
        self.fft.process(&mut self.buffer);

        let scale = 1.0 / self.fft_size as f32;
        let range = MAX_DECIBELS - MIN_DECIBELS;
        self.smoothed
            .iter_mut()
            .zip(self.buffer.iter())
            .map(|(prev, bin)| {
                let magnitude = bin.norm() * scale;
                *prev = self.smoothing * *prev + (1.0 - self.smoothing) * magnitude;
                let db = 20.0 * prev.log10();
                let scaled = 255.0 / range * (db - MIN_DECIBELS);
                // NaN and -inf from silent bins clamp to zero
                if scaled.is_nan() {
                    0
                } else {
                    scaled.clamp(0.0, 255.0) as u8
                }
            })
            .collect()
    }

    /// Mean of the byte frequency data; the energy measure used for voice detection
    pub fn average_energy(&mut self, samples: &[f32]) -> f32 {
        let data = self.byte_frequency_data(samples);
        if data.is_empty() {
            return 0.0;
        }
        let sum: u32 = data.iter().map(|b| u32::from(*b)).sum();
        sum as f32 / data.len() as f32
    }
}

fn blackman_window(size: usize) -> Vec<f32> {
    const ALPHA: f32 = 0.16;
    let a0 = 0.5 * (1.0 - ALPHA);
    let a1 = 0.5;
    let a2 = 0.5 * ALPHA;
    let n = size as f32;
    (0..size)
        .map(|i| {
            let x = i as f32 / n;
            a0 - a1 * (2.0 * std::f32::consts::PI * x).cos()
                + a2 * (4.0 * std::f32::consts::PI * x).cos()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, rate: f32, len: usize, amplitude: f32) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (2.0 * std::f32::consts::PI * freq * i as f32 / rate).sin())
            .collect()
    }

    fn noise(len: usize, amplitude: f32) -> Vec<f32> {
        let mut state: u32 = 0x1234_5678;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                amplitude * ((state >> 8) as f32 / (1u32 << 24) as f32 - 0.5) * 2.0
            })
            .collect()
    }

    #[test]
    fn test_silence_has_zero_energy() {
        let mut analyser = SpectrumAnalyser::new(256, 0.8);
        assert_eq!(analyser.frequency_bin_count(), 128);
        assert_eq!(analyser.average_energy(&[0.0; 256]), 0.0);
    }

    #[test]
    fn test_tone_is_energetic() {
        let mut analyser = SpectrumAnalyser::new(256, 0.0);
        let tone = sine(440.0, 8000.0, 256, 0.8);
        let data = analyser.byte_frequency_data(&tone);
        let peak = data.iter().copied().max().unwrap_or(0);
        assert!(peak > 200, "peak was {peak}");
    }

    #[test]
    fn test_noise_exceeds_speaking_threshold() {
        let mut analyser = SpectrumAnalyser::new(256, 0.0);
        let energy = analyser.average_energy(&noise(256, 0.5));
        assert!(energy > 20.0, "energy was {energy}");
    }

    #[test]
    fn test_smoothing_decays_gradually() {
        let mut analyser = SpectrumAnalyser::new(256, 0.8);
        let loud = analyser.average_energy(&noise(256, 0.5));
        let after = analyser.average_energy(&[0.0; 256]);
        assert!(after > 0.0);
        assert!(after <= loud);
    }

    #[test]
    fn test_short_input_is_padded() {
        let mut analyser = SpectrumAnalyser::new(256, 0.0);
        let data = analyser.byte_frequency_data(&[0.0; 10]);
        assert_eq!(data.len(), 128);
    }
}

//! Background noise level tracking.
//!
//! Concealment fades towards this level during long expansions, so a lost
//! stretch of a noisy call does not drop to dead silence.

use crate::config::BackgroundNoiseMode;
use crate::sync_buffer::SyncBuffer;

use super::random::RandomVector;
use super::vad::PostDecodeVad;
use super::mean_square;

/// Upward adaptation rate of the estimate per update.
const RISE_FACTOR: f32 = 0.05;
/// Fade mode keeps full noise for this many expand frames (500 ms).
const FADE_HOLD_EXPANDS: usize = 50;
/// Then fades to silence over this many frames.
const FADE_LENGTH_EXPANDS: usize = 50;

#[derive(Debug, Clone)]
pub struct BackgroundNoise {
    /// Mean-square noise estimate per channel.
    energy: Vec<f32>,
    initialized: bool,
    mode: BackgroundNoiseMode,
}

impl BackgroundNoise {
    pub fn new(num_channels: usize, mode: BackgroundNoiseMode) -> Self {
        Self {
            energy: vec![0.0; num_channels.max(1)],
            initialized: false,
            mode,
        }
    }

    pub fn reset(&mut self) {
        self.energy.iter_mut().for_each(|e| *e = 0.0);
        self.initialized = false;
    }

    pub fn mode(&self) -> BackgroundNoiseMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: BackgroundNoiseMode) {
        self.mode = mode;
    }

    pub fn initialized(&self) -> bool {
        self.initialized
    }

    /// Learn from the newest `block_len` samples of the sync buffer.
    ///
    /// The estimate follows drops immediately and rises slowly, and only
    /// rises while the VAD reports no speech.
    pub fn update(&mut self, sync_buffer: &SyncBuffer, vad: &PostDecodeVad, block_len: usize) {
        let speech = vad.running() && vad.active_speech();
        for (ch, estimate) in self.energy.iter_mut().enumerate() {
            let energy = mean_square(&sync_buffer.tail(ch, block_len));
            if !self.initialized || energy < *estimate {
                *estimate = energy;
            } else if !speech {
                *estimate += (energy - *estimate) * RISE_FACTOR;
            }
        }
        self.initialized = true;
    }

    /// Mean-square estimate for `channel`.
    pub fn energy(&self, channel: usize) -> f32 {
        self.energy.get(channel).copied().unwrap_or(0.0)
    }

    /// Level multiplier after `consecutive_expands` expand frames.
    pub fn scale(&self, consecutive_expands: usize) -> f32 {
        match self.mode {
            BackgroundNoiseMode::On => 1.0,
            BackgroundNoiseMode::Off => 0.0,
            BackgroundNoiseMode::Fade => {
                let faded = consecutive_expands.saturating_sub(FADE_HOLD_EXPANDS);
                1.0 - (faded as f32 / FADE_LENGTH_EXPANDS as f32).min(1.0)
            }
        }
    }

    /// Fill `out` with noise at the estimated level for `channel`.
    pub fn generate(&self, channel: usize, consecutive_expands: usize, random: &mut RandomVector, out: &mut [f32]) {
        let rms = self.energy(channel).sqrt() * self.scale(consecutive_expands);
        random.generate(rms, out);
    }
}

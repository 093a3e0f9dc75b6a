//! Time-scale modification of decoded audio.
//!
//! Accelerate removes whole pitch periods to drain the buffer; preemptive
//! expand inserts one to fill it. Both work on interleaved input and only act
//! when the signal is periodic enough for the splice to be inaudible, or so
//! quiet that it does not matter.

use crate::audio_vector::AudioMultiVector;

use super::{best_lag, cross_fade, downmix, normalized_correlation, saturate, MAX_LAG_8KHZ, MIN_LAG_8KHZ};

/// Minimum normalized correlation between adjacent periods.
const CORRELATION_THRESHOLD: f32 = 0.9;
/// Below this rms the input is stretched regardless of periodicity.
const LOW_ENERGY_RMS: f32 = 40.0;

/// Outcome of a time-stretch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StretchResult {
    Success,
    /// Stretched because the input was near silence.
    SuccessLowEnergy,
    /// Nothing changed; the output is a copy of the input.
    NoStretch,
}

/// Time-stretch strategy, picked once when the engine is built.
pub trait TimeStretcher: Send {
    fn set_sample_rate_and_channels(&mut self, fs_hz: u32, num_channels: usize);

    /// Shorten `input` (interleaved). Returns the outcome and the samples per
    /// channel removed. `output` receives the result either way.
    fn accelerate(&mut self, input: &[i16], fast_mode: bool, output: &mut AudioMultiVector) -> (StretchResult, usize);

    /// Lengthen `input` (interleaved). The first `old_data_length` samples
    /// per channel have already been played and must stay untouched.
    /// Returns the outcome and the samples per channel added.
    fn preemptive_expand(
        &mut self,
        input: &[i16],
        old_data_length: usize,
        output: &mut AudioMultiVector,
    ) -> (StretchResult, usize);
}

/// Pitch-period based stretcher.
#[derive(Debug, Clone)]
pub struct PitchStretcher {
    fs_mult: usize,
    num_channels: usize,
}

impl PitchStretcher {
    pub fn new(fs_hz: u32, num_channels: usize) -> Self {
        let mut stretcher = Self {
            fs_mult: 1,
            num_channels: 1,
        };
        stretcher.set_sample_rate_and_channels(fs_hz, num_channels);
        stretcher
    }

    /// Best period in `mono[start..]`, with its correlation and whether the
    /// two compared periods are near silence.
    fn analyze(&self, mono: &[f32], start: usize) -> Option<(usize, f32, bool)> {
        let available = mono.len().saturating_sub(start);
        let min_lag = MIN_LAG_8KHZ * self.fs_mult;
        let max_lag = (MAX_LAG_8KHZ * self.fs_mult).min(available / 2);
        let (lag, correlation) = best_lag(min_lag, max_lag, self.fs_mult, |lag| {
            normalized_correlation(&mono[start..start + lag], &mono[start + lag..start + 2 * lag])
        })?;
        let window = &mono[start..start + 2 * lag];
        let rms = (window.iter().map(|x| x * x).sum::<f32>() / window.len() as f32).sqrt();
        Some((lag, correlation, rms < LOW_ENERGY_RMS))
    }

    fn copy_input(&self, input: &[i16], output: &mut AudioMultiVector) {
        output.push_back_interleaved(input);
    }

    fn channel(&self, input: &[i16], ch: usize) -> Vec<f32> {
        input
            .iter()
            .skip(ch)
            .step_by(self.num_channels)
            .map(|&s| s as f32)
            .collect()
    }
}

impl TimeStretcher for PitchStretcher {
    fn set_sample_rate_and_channels(&mut self, fs_hz: u32, num_channels: usize) {
        self.fs_mult = (fs_hz / 8000).max(1) as usize;
        self.num_channels = num_channels.max(1);
    }

    fn accelerate(&mut self, input: &[i16], fast_mode: bool, output: &mut AudioMultiVector) -> (StretchResult, usize) {
        let mono = downmix(input, self.num_channels);
        let n = mono.len();
        let (lag, correlation, low_energy) = match self.analyze(&mono, 0) {
            Some(found) => found,
            None => {
                self.copy_input(input, output);
                return (StretchResult::NoStretch, 0);
            }
        };
        if !low_energy && correlation < CORRELATION_THRESHOLD {
            self.copy_input(input, output);
            return (StretchResult::NoStretch, 0);
        }

        let periods = if fast_mode && 3 * lag <= n { 2 } else { 1 };
        let removed = periods * lag;
        for ch in 0..self.num_channels {
            let x = self.channel(input, ch);
            let mut stretched = Vec::with_capacity(n - removed);
            cross_fade(&x[..lag], &x[removed..removed + lag], &mut stretched);
            stretched.extend_from_slice(&x[removed + lag..]);
            output.channel_mut(ch).extend(stretched.into_iter().map(saturate));
        }

        let result = if low_energy {
            StretchResult::SuccessLowEnergy
        } else {
            StretchResult::Success
        };
        (result, removed)
    }

    fn preemptive_expand(
        &mut self,
        input: &[i16],
        old_data_length: usize,
        output: &mut AudioMultiVector,
    ) -> (StretchResult, usize) {
        // More than 15 ms already played leaves too little room to splice.
        if old_data_length > MAX_LAG_8KHZ * self.fs_mult {
            self.copy_input(input, output);
            return (StretchResult::NoStretch, 0);
        }
        let mono = downmix(input, self.num_channels);
        let start = old_data_length;
        let (lag, correlation, low_energy) = match self.analyze(&mono, start) {
            Some(found) => found,
            None => {
                self.copy_input(input, output);
                return (StretchResult::NoStretch, 0);
            }
        };
        if !low_energy && correlation < CORRELATION_THRESHOLD {
            self.copy_input(input, output);
            return (StretchResult::NoStretch, 0);
        }

        for ch in 0..self.num_channels {
            let x = self.channel(input, ch);
            let mut stretched = Vec::with_capacity(x.len() + lag);
            stretched.extend_from_slice(&x[..start + lag]);
            cross_fade(&x[start + lag..start + 2 * lag], &x[start..start + lag], &mut stretched);
            stretched.extend_from_slice(&x[start + lag..]);
            output.channel_mut(ch).extend(stretched.into_iter().map(saturate));
        }

        let result = if low_energy {
            StretchResult::SuccessLowEnergy
        } else {
            StretchResult::Success
        };
        (result, lag)
    }
}

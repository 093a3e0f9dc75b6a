//! Signal processing stages used by the playout engine.
//!
//! Everything here works on short blocks (at most a few tens of ms) and
//! returns in bounded time.

pub mod background_noise;
pub mod comfort_noise;
pub mod dtmf_tone;
pub mod expand;
pub mod merge;
pub mod normal;
pub mod random;
pub mod time_stretch;
pub mod vad;

pub use background_noise::BackgroundNoise;
pub use comfort_noise::ComfortNoise;
pub use dtmf_tone::DtmfToneGenerator;
pub use expand::Expand;
pub use merge::Merge;
pub use random::RandomVector;
pub use time_stretch::{PitchStretcher, StretchResult, TimeStretcher};
pub use vad::PostDecodeVad;

/// Shortest pitch period searched, in samples at 8 kHz (2.5 ms).
pub(crate) const MIN_LAG_8KHZ: usize = 20;
/// Longest pitch period searched, in samples at 8 kHz (15 ms).
pub(crate) const MAX_LAG_8KHZ: usize = 120;

/// Convert decibels to linear gain.
#[inline]
pub fn db_to_linear(db: f32) -> f32 {
    10.0f32.powf(db / 20.0)
}

/// Round and clamp to the 16-bit range.
#[inline]
pub fn saturate(x: f32) -> i16 {
    x.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Mean of the squared samples.
pub fn mean_square(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / samples.len() as f64) as f32
}

/// Normalized cross-correlation of two equally long segments.
///
/// Returns 0 when either segment is silent.
pub fn normalized_correlation(a: &[f32], b: &[f32]) -> f32 {
    let mut cross = 0.0f64;
    let mut energy_a = 0.0f64;
    let mut energy_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b) {
        cross += x as f64 * y as f64;
        energy_a += x as f64 * x as f64;
        energy_b += y as f64 * y as f64;
    }
    if energy_a <= 0.0 || energy_b <= 0.0 {
        return 0.0;
    }
    (cross / (energy_a * energy_b).sqrt()) as f32
}

/// Lag in `min_lag..=max_lag` (stepping by `step`) with the highest score.
pub(crate) fn best_lag(min_lag: usize, max_lag: usize, step: usize, score: impl Fn(usize) -> f32) -> Option<(usize, f32)> {
    if min_lag == 0 || max_lag < min_lag {
        return None;
    }
    (min_lag..=max_lag)
        .step_by(step.max(1))
        .map(|lag| (lag, score(lag)))
        .fold(None, |best: Option<(usize, f32)>, (lag, corr)| match best {
            Some((_, best_corr)) if best_corr >= corr => best,
            _ => Some((lag, corr)),
        })
}

/// Linear cross-fade from `from` into `to`, written to `out`.
pub(crate) fn cross_fade(from: &[f32], to: &[f32], out: &mut Vec<f32>) {
    let len = from.len().min(to.len());
    let denom = (len + 1) as f32;
    for i in 0..len {
        let w = (i + 1) as f32 / denom;
        out.push(from[i] * (1.0 - w) + to[i] * w);
    }
}

/// Average of all channels of an interleaved block, as f32.
pub(crate) fn downmix(interleaved: &[i16], channels: usize) -> Vec<f32> {
    let channels = channels.max(1);
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().map(|&s| s as f32).sum::<f32>() / channels as f32)
        .collect()
}

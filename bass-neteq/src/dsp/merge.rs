//! Transition from concealment back to decoded audio.

use crate::audio_vector::AudioMultiVector;
use crate::sync_buffer::SyncBuffer;

use super::background_noise::BackgroundNoise;
use super::expand::Expand;
use super::{cross_fade, saturate};

/// Splices newly decoded audio onto the end of an expansion.
///
/// The concealment is continued for a few milliseconds and cross-faded into
/// the decoded block, whose gain then ramps from the expansion's mute level
/// back to unity.
#[derive(Debug, Clone)]
pub struct Merge {
    fs_hz: u32,
    fs_mult: usize,
    num_channels: usize,
}

impl Merge {
    pub fn new(fs_hz: u32, num_channels: usize) -> Self {
        Self {
            fs_hz,
            fs_mult: (fs_hz / 8000).max(1) as usize,
            num_channels: num_channels.max(1),
        }
    }

    /// Decoded samples per channel a merge wants to have at hand.
    pub fn required_future_samples(&self) -> usize {
        self.fs_hz as usize / 100
    }

    /// Merge `decoded` into `output` and return the samples per channel
    /// written, always `decoded.size()`.
    ///
    /// `mute_factors` receives the gain reached at the end of the block.
    pub fn process(
        &self,
        decoded: &AudioMultiVector,
        expand: &mut Expand,
        sync_buffer: &SyncBuffer,
        background_noise: &BackgroundNoise,
        mute_factors: &mut [f32],
        output: &mut AudioMultiVector,
    ) -> usize {
        let len = decoded.size();
        if len == 0 {
            return 0;
        }
        let fade_len = len.min(40 * self.fs_mult);
        let mut expanded = AudioMultiVector::new(self.num_channels);
        expand.continuation(fade_len, sync_buffer, background_noise, &mut expanded);

        let increment = 1.0 / (256 * self.fs_mult) as f32;
        for ch in 0..self.num_channels {
            let mut mute = expand.mute_factor(ch);
            let scaled: Vec<f32> = decoded
                .channel(ch)
                .iter()
                .map(|&s| {
                    let v = s as f32 * mute;
                    mute = (mute + increment).min(1.0);
                    v
                })
                .collect();
            let from: Vec<f32> = expanded.channel(ch).iter().map(|&s| s as f32).collect();

            let mut faded = Vec::with_capacity(fade_len);
            cross_fade(&from, &scaled[..fade_len], &mut faded);

            let out = output.channel_mut(ch);
            out.extend(faded.into_iter().map(saturate));
            out.extend(scaled[fade_len..].iter().map(|&v| saturate(v)));
            if let Some(m) = mute_factors.get_mut(ch) {
                *m = mute;
            }
        }
        len
    }
}

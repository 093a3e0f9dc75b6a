//! Plain playout of decoded audio.

use crate::audio_vector::AudioMultiVector;
use crate::sync_buffer::SyncBuffer;

use super::background_noise::BackgroundNoise;
use super::expand::Expand;
use super::{cross_fade, saturate};

/// Copies decoded audio to the output.
///
/// Right after an expansion the first millisecond is cross-faded from the
/// concealment, and any gain left below unity by concealment ramps back up.
#[derive(Debug, Clone)]
pub struct Normal {
    fs_mult: usize,
    num_channels: usize,
}

impl Normal {
    pub fn new(fs_hz: u32, num_channels: usize) -> Self {
        Self {
            fs_mult: (fs_hz / 8000).max(1) as usize,
            num_channels: num_channels.max(1),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn process(
        &self,
        decoded: &AudioMultiVector,
        after_expand: bool,
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

        let mut expanded = AudioMultiVector::new(self.num_channels);
        let fade_len = if after_expand {
            for (ch, m) in mute_factors.iter_mut().enumerate() {
                *m = expand.mute_factor(ch);
            }
            let fade_len = len.min(8 * self.fs_mult);
            expand.continuation(fade_len, sync_buffer, background_noise, &mut expanded);
            fade_len
        } else {
            0
        };

        let increment = 1.0 / (256 * self.fs_mult) as f32;
        for ch in 0..self.num_channels {
            let mut mute = mute_factors.get(ch).copied().unwrap_or(1.0);
            let out = output.channel_mut(ch);
            if mute >= 1.0 && fade_len == 0 {
                out.extend_from_slice(decoded.channel(ch));
                continue;
            }

            let scaled: Vec<f32> = decoded
                .channel(ch)
                .iter()
                .map(|&s| {
                    let v = s as f32 * mute;
                    mute = (mute + increment).min(1.0);
                    v
                })
                .collect();
            if fade_len > 0 {
                let from: Vec<f32> = expanded.channel(ch).iter().map(|&s| s as f32).collect();
                let mut faded = Vec::with_capacity(fade_len);
                cross_fade(&from, &scaled[..fade_len], &mut faded);
                out.extend(faded.into_iter().map(saturate));
            }
            out.extend(scaled[fade_len..].iter().map(|&v| saturate(v)));
            if let Some(m) = mute_factors.get_mut(ch) {
                *m = mute;
            }
        }
        len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackgroundNoiseMode;

    fn block(samples: &[i16], channels: usize) -> AudioMultiVector {
        let mut b = AudioMultiVector::new(channels);
        b.push_back_interleaved(samples);
        b
    }

    #[test]
    fn test_passthrough() {
        let normal = Normal::new(8000, 2);
        let sync = SyncBuffer::new(2, 480);
        let bgn = BackgroundNoise::new(2, BackgroundNoiseMode::On);
        let mut expand = Expand::new(8000, 2);
        let mut mute = [1.0f32; 2];
        let mut out = AudioMultiVector::new(2);
        let input = block(&[1, 2, 3, 4, 5, 6], 2);
        assert_eq!(normal.process(&input, false, &mut expand, &sync, &bgn, &mut mute, &mut out), 3);
        assert_eq!(out, input);
    }

    #[test]
    fn test_after_expand_fades_in() {
        let normal = Normal::new(8000, 1);
        let sync = SyncBuffer::new(1, 480);
        let bgn = BackgroundNoise::new(1, BackgroundNoiseMode::On);
        let mut expand = Expand::new(8000, 1);
        let mut scratch = AudioMultiVector::new(1);
        expand.process(&sync, &bgn, &mut scratch);

        let mut mute = [1.0f32];
        let mut out = AudioMultiVector::new(1);
        normal.process(&block(&[2000; 80], 1), true, &mut expand, &sync, &bgn, &mut mute, &mut out);
        assert_eq!(out.size(), 80);
        // Starts near the silent concealment, ends on the decoded level.
        assert!(out.channel(0)[0] < 500);
        assert_eq!(out.channel(0)[79], 2000);
    }

    #[test]
    fn test_ramp_continues_across_calls() {
        let normal = Normal::new(8000, 1);
        let sync = SyncBuffer::new(1, 480);
        let bgn = BackgroundNoise::new(1, BackgroundNoiseMode::On);
        let mut expand = Expand::new(8000, 1);
        let mut mute = [0.5f32];
        let mut out = AudioMultiVector::new(1);
        normal.process(&block(&[1000; 64], 1), false, &mut expand, &sync, &bgn, &mut mute, &mut out);
        assert_eq!(out.channel(0)[0], 500);
        assert!((mute[0] - 0.75).abs() < 1e-4);
    }
}

//! Packet loss concealment by pitch repetition.
//!
//! On the first expand after real audio, the end of the sync buffer is
//! searched for a pitch period. Following frames repeat that period, mixed
//! with noise according to how periodic the signal was, and fade towards the
//! background noise estimate as the loss goes on.

use crate::audio_vector::AudioMultiVector;
use crate::sync_buffer::SyncBuffer;

use super::background_noise::BackgroundNoise;
use super::random::RandomVector;
use super::{best_lag, downmix, normalized_correlation, saturate, MAX_LAG_8KHZ, MIN_LAG_8KHZ};

/// Fade time for unvoiced audio; voiced audio fades over up to 60 ms more.
const MIN_FADE_MS: f32 = 40.0;
const VOICED_EXTRA_FADE_MS: f32 = 60.0;

#[derive(Debug, Clone)]
struct ChannelParameters {
    /// Last pitch period of the channel.
    period: Vec<f32>,
    phase: usize,
    /// 1.0 for fully periodic input, 0.0 for noise-like input.
    voice_mix: f32,
    signal_rms: f32,
    mute_factor: f32,
    mute_slope: f32,
}

impl ChannelParameters {
    fn new() -> Self {
        Self {
            period: vec![0.0],
            phase: 0,
            voice_mix: 0.0,
            signal_rms: 0.0,
            mute_factor: 1.0,
            mute_slope: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Expand {
    fs_hz: u32,
    fs_mult: usize,
    overlap_length: usize,
    frame_length: usize,
    first_expand: bool,
    consecutive_expands: usize,
    lag: usize,
    channel_parameters: Vec<ChannelParameters>,
    random: RandomVector,
}

impl Expand {
    pub fn new(fs_hz: u32, num_channels: usize) -> Self {
        let fs_mult = (fs_hz / 8000).max(1) as usize;
        Self {
            fs_hz,
            fs_mult,
            overlap_length: 5 * fs_mult,
            frame_length: fs_hz as usize / 100,
            first_expand: true,
            consecutive_expands: 0,
            lag: MIN_LAG_8KHZ * fs_mult,
            channel_parameters: vec![ChannelParameters::new(); num_channels.max(1)],
            random: RandomVector::new(),
        }
    }

    /// Forget the analysis; the next expand starts from fresh audio.
    pub fn reset(&mut self) {
        self.first_expand = true;
        self.consecutive_expands = 0;
        for params in &mut self.channel_parameters {
            params.mute_factor = 1.0;
        }
    }

    /// Lookahead kept in the sync buffer for smooth transitions.
    pub fn overlap_length(&self) -> usize {
        self.overlap_length
    }

    pub fn sample_rate(&self) -> u32 {
        self.fs_hz
    }

    /// Current gain of the concealed signal, 0.0 when only background
    /// noise is left.
    pub fn mute_factor(&self, channel: usize) -> f32 {
        self.channel_parameters
            .get(channel)
            .map_or(1.0, |p| p.mute_factor)
    }

    pub fn consecutive_expands(&self) -> usize {
        self.consecutive_expands
    }

    /// Pitch period found by the last analysis, in samples.
    pub fn lag(&self) -> usize {
        self.lag
    }

    /// Append one 10 ms frame of concealment audio to `output`.
    pub fn process(&mut self, sync_buffer: &SyncBuffer, background_noise: &BackgroundNoise, output: &mut AudioMultiVector) {
        let fade = if self.first_expand {
            self.analyze(sync_buffer);
            false
        } else {
            true
        };
        self.consecutive_expands += 1;
        self.synthesize(self.frame_length, background_noise, output, fade);
    }

    /// Append `len` more samples of the current concealment without counting
    /// an expand or advancing the fade. Used to cross-fade into new audio.
    pub fn continuation(
        &mut self,
        len: usize,
        sync_buffer: &SyncBuffer,
        background_noise: &BackgroundNoise,
        output: &mut AudioMultiVector,
    ) {
        if self.first_expand {
            self.analyze(sync_buffer);
        }
        self.synthesize(len, background_noise, output, false);
    }

    fn analyze(&mut self, sync_buffer: &SyncBuffer) {
        let min_lag = MIN_LAG_8KHZ * self.fs_mult;
        let history_len = 2 * MAX_LAG_8KHZ * self.fs_mult;
        let channels = sync_buffer.channels();

        let tails: Vec<Vec<i16>> = (0..channels).map(|ch| sync_buffer.tail(ch, history_len)).collect();
        let n = tails[0].len();
        let mut interleaved = Vec::with_capacity(n * channels);
        for i in 0..n {
            for tail in &tails {
                interleaved.push(tail[i]);
            }
        }
        let mono = downmix(&interleaved, channels);

        let max_lag = (MAX_LAG_8KHZ * self.fs_mult).min(n / 2);
        let (lag, correlation) = best_lag(min_lag, max_lag, self.fs_mult, |lag| {
            normalized_correlation(&mono[n - 2 * lag..n - lag], &mono[n - lag..])
        })
        .unwrap_or((min_lag.min(n).max(1), 0.0));
        self.lag = lag;

        let voice_mix = correlation.clamp(0.0, 1.0);
        let fade_ms = MIN_FADE_MS + VOICED_EXTRA_FADE_MS * voice_mix;
        let mute_slope = 1000.0 / (fade_ms * self.fs_hz as f32);

        for (params, tail) in self.channel_parameters.iter_mut().zip(&tails) {
            let start = tail.len().saturating_sub(lag);
            params.period = tail[start..].iter().map(|&s| s as f32).collect();
            if params.period.is_empty() {
                params.period.push(0.0);
            }
            let energy = params.period.iter().map(|x| x * x).sum::<f32>() / params.period.len() as f32;
            params.signal_rms = energy.sqrt();
            params.voice_mix = voice_mix;
            params.phase = 0;
            params.mute_factor = 1.0;
            params.mute_slope = mute_slope;
        }
        self.first_expand = false;
    }

    fn synthesize(&mut self, len: usize, background_noise: &BackgroundNoise, output: &mut AudioMultiVector, fade: bool) {
        let expands = self.consecutive_expands;
        let random = &mut self.random;
        let mut noise = vec![0.0f32; len];
        let mut background = vec![0.0f32; len];
        for (ch, params) in self.channel_parameters.iter_mut().enumerate() {
            random.generate(params.signal_rms, &mut noise);
            background_noise.generate(ch, expands, random, &mut background);
            let out = output.channel_mut(ch);
            for i in 0..len {
                let periodic = params.period[params.phase];
                params.phase = (params.phase + 1) % params.period.len();
                let voiced = params.voice_mix * periodic + (1.0 - params.voice_mix) * noise[i];
                let sample = params.mute_factor * voiced + (1.0 - params.mute_factor) * background[i];
                out.push(saturate(sample));
                if fade {
                    params.mute_factor = (params.mute_factor - params.mute_slope).max(0.0);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackgroundNoiseMode;

    fn sync_with_tone(fs_hz: u32, period: usize, channels: usize) -> SyncBuffer {
        let len = fs_hz as usize * 60 / 1000;
        let mut sync = SyncBuffer::new(channels, len);
        let mut block = AudioMultiVector::new(channels);
        let mut interleaved = Vec::new();
        for i in 0..len {
            let v = (8000.0 * (2.0 * std::f32::consts::PI * i as f32 / period as f32).sin()) as i16;
            for _ in 0..channels {
                interleaved.push(v);
            }
        }
        block.push_back_interleaved(&interleaved);
        sync.push_back(&block);
        sync
    }

    #[test]
    fn test_overlap_length() {
        assert_eq!(Expand::new(8000, 1).overlap_length(), 5);
        assert_eq!(Expand::new(48000, 2).overlap_length(), 30);
    }

    #[test]
    fn test_finds_pitch_and_repeats() {
        let sync = sync_with_tone(8000, 50, 1);
        let bgn = BackgroundNoise::new(1, BackgroundNoiseMode::On);
        let mut expand = Expand::new(8000, 1);
        let mut out = AudioMultiVector::new(1);
        expand.process(&sync, &bgn, &mut out);
        assert_eq!(out.size(), 80);
        assert_eq!(expand.lag() % 50, 0);
        assert_eq!(expand.mute_factor(0), 1.0);

        // The first frame continues the tone.
        let tail = sync.tail(0, 50);
        for i in 0..50 {
            assert!((out.channel(0)[i] as i32 - tail[i] as i32).abs() < 200);
        }
    }

    #[test]
    fn test_fades_to_background() {
        let sync = sync_with_tone(16000, 80, 2);
        let bgn = BackgroundNoise::new(2, BackgroundNoiseMode::On);
        let mut expand = Expand::new(16000, 2);
        let mut frames = 0;
        while expand.mute_factor(0) > 0.0 {
            let mut out = AudioMultiVector::new(2);
            expand.process(&sync, &bgn, &mut out);
            frames += 1;
            assert!(frames < 20, "never faded");
        }
        assert_eq!(expand.mute_factor(1), 0.0);
        // Background estimate is zero, so the output is silent now.
        let mut out = AudioMultiVector::new(2);
        expand.process(&sync, &bgn, &mut out);
        assert!(out.channel(0).iter().all(|&s| s == 0));
        assert_eq!(expand.consecutive_expands(), frames + 1);

        expand.reset();
        assert_eq!(expand.mute_factor(0), 1.0);
        assert_eq!(expand.consecutive_expands(), 0);
    }

    #[test]
    fn test_silence_in_silence_out() {
        let sync = SyncBuffer::new(1, 480);
        let bgn = BackgroundNoise::new(1, BackgroundNoiseMode::On);
        let mut expand = Expand::new(8000, 1);
        let mut out = AudioMultiVector::new(1);
        expand.process(&sync, &bgn, &mut out);
        assert!(out.channel(0).iter().all(|&s| s == 0));
    }
}

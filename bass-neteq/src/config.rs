//! Engine configuration.
//!
//! Hosts usually build a [`NetEqConfig`] with `Default` and override a few
//! fields, or load it from the JSON settings they already keep.

use serde::{Deserialize, Serialize};

use crate::error::{NetEqError, Result};

/// Sample rates the engine can run at.
pub const SUPPORTED_SAMPLE_RATES: [u32; 4] = [8000, 16000, 32000, 48000];

/// Returns true if `fs_hz` is one of [`SUPPORTED_SAMPLE_RATES`].
pub fn is_supported_sample_rate(fs_hz: u32) -> bool {
    SUPPORTED_SAMPLE_RATES.contains(&fs_hz)
}

/// Playout mode.
///
/// `On` is regular voice playout. `Streaming` accepts more latency for
/// smoother output. `Fax` and `Off` never time-stretch, which keeps output
/// timestamps predictable on low-jitter links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlayoutMode {
    #[default]
    On,
    Fax,
    Off,
    Streaming,
}

impl PlayoutMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlayoutMode::On => "on",
            PlayoutMode::Fax => "fax",
            PlayoutMode::Off => "off",
            PlayoutMode::Streaming => "streaming",
        }
    }
}

/// What concealment fades towards during long expansions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackgroundNoiseMode {
    /// Keep the estimated background noise level.
    #[default]
    On,
    /// Fade to silence.
    Off,
    /// Keep background noise for a while, then fade to silence.
    Fade,
}

/// Configuration for a [`NetEq`](crate::NetEq) instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetEqConfig {
    /// Initial output sample rate, before the first decoder is seen.
    pub sample_rate_hz: u32,
    /// Capacity of the packet buffer in packets.
    pub max_packets_in_buffer: usize,
    /// Minimum playout delay in ms (0 = no minimum).
    pub min_delay_ms: i32,
    /// Maximum playout delay in ms (0 = no maximum).
    pub max_delay_ms: i32,
    /// Playout mode.
    pub playout_mode: PlayoutMode,
    /// Run the post-decode voice activity detector.
    pub enable_post_decode_vad: bool,
    /// Background noise behavior during long concealment.
    pub background_noise_mode: BackgroundNoiseMode,
}

impl Default for NetEqConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 16000,
            max_packets_in_buffer: 50,
            min_delay_ms: 0,
            max_delay_ms: 0,
            playout_mode: PlayoutMode::On,
            enable_post_decode_vad: true,
            background_noise_mode: BackgroundNoiseMode::On,
        }
    }
}

impl NetEqConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: NetEqConfig =
            serde_json::from_str(json).map_err(|e| NetEqError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| NetEqError::InvalidConfig(e.to_string()))
    }

    /// Check the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !is_supported_sample_rate(self.sample_rate_hz) {
            return Err(NetEqError::InvalidSampleRate(self.sample_rate_hz as i32));
        }
        if self.max_packets_in_buffer == 0 {
            return Err(NetEqError::InvalidConfig(
                "max_packets_in_buffer must be at least 1".to_string(),
            ));
        }
        if self.min_delay_ms < 0 || self.max_delay_ms < 0 {
            return Err(NetEqError::InvalidDelay(self.min_delay_ms.min(self.max_delay_ms)));
        }
        if self.max_delay_ms > 0 && self.min_delay_ms > self.max_delay_ms {
            return Err(NetEqError::InvalidDelay(self.min_delay_ms));
        }
        Ok(())
    }
}

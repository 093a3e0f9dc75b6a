//! Comfort noise generation from RFC 3389 SID payloads.
//!
//! Only the noise level byte is used; spectral reflection coefficients, if
//! present, are ignored and white noise is produced.

use log::debug;

use crate::audio_vector::AudioMultiVector;
use crate::error::{NetEqError, Result};

use super::random::RandomVector;
use super::{db_to_linear, saturate};

/// Highest level value in a SID payload, in -dBov.
const MAX_LEVEL_DBOV: u8 = 127;

#[derive(Debug, Clone)]
pub struct ComfortNoise {
    /// Noise level from the last SID frame, in -dBov.
    level_dbov: Option<u8>,
    first_call: bool,
    random: RandomVector,
}

impl Default for ComfortNoise {
    fn default() -> Self {
        Self::new()
    }
}

impl ComfortNoise {
    pub fn new() -> Self {
        Self {
            level_dbov: None,
            first_call: true,
            random: RandomVector::new(),
        }
    }

    /// Called when comfort noise is interrupted. Parameters are kept.
    pub fn reset(&mut self) {
        self.first_call = true;
    }

    /// Forget the SID parameters as well.
    pub fn clear(&mut self) {
        self.level_dbov = None;
        self.first_call = true;
    }

    /// Take new parameters from a SID payload.
    pub fn update_parameters(&mut self, payload: &[u8]) -> Result<()> {
        let level = *payload.first().ok_or(NetEqError::InvalidPacket("empty SID payload"))?;
        let level = level & MAX_LEVEL_DBOV;
        debug!("Comfort noise level -{} dBov", level);
        self.level_dbov = Some(level);
        Ok(())
    }

    pub fn level_dbov(&self) -> Option<u8> {
        self.level_dbov
    }

    /// Append `len` samples per channel of noise to `output`.
    pub fn generate(&mut self, len: usize, output: &mut AudioMultiVector) -> Result<()> {
        let level = self
            .level_dbov
            .ok_or(NetEqError::InvalidOperation("comfort noise without SID parameters"))?;
        let rms = 32768.0 * db_to_linear(-(level as f32));
        let mut noise = vec![0.0f32; len];
        for ch in 0..output.channels() {
            self.random.generate(rms, &mut noise);
            output
                .channel_mut(ch)
                .extend(noise.iter().map(|&x| saturate(x)));
        }
        self.first_call = false;
        Ok(())
    }

    pub fn first_call(&self) -> bool {
        self.first_call
    }
}

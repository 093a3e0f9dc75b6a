//! Dual-tone generator for telephone events 0-15.

use std::f32::consts::PI;

use crate::audio_vector::AudioMultiVector;
use crate::error::{NetEqError, Result};

use super::{db_to_linear, saturate};

const ROW_HZ: [f32; 4] = [697.0, 770.0, 852.0, 941.0];
const COL_HZ: [f32; 4] = [1209.0, 1336.0, 1477.0, 1633.0];

/// Keypad position (row, column) of each event number.
const KEYPAD: [(usize, usize); 16] = [
    (3, 1), // 0
    (0, 0), // 1
    (0, 1), // 2
    (0, 2), // 3
    (1, 0), // 4
    (1, 1), // 5
    (1, 2), // 6
    (2, 0), // 7
    (2, 1), // 8
    (2, 2), // 9
    (3, 0), // *
    (3, 2), // #
    (0, 3), // A
    (1, 3), // B
    (2, 3), // C
    (3, 3), // D
];

/// Peak amplitude of the high tone at 0 dBm0.
const FULL_AMPLITUDE: f32 = 16384.0;
/// The low tone is 3 dB below the high tone.
const LOW_TONE_TWIST: f32 = 0.708;

#[derive(Debug, Clone, Default)]
pub struct DtmfToneGenerator {
    initialized: bool,
    low_step: f32,
    high_step: f32,
    low_phase: f32,
    high_phase: f32,
    amplitude: f32,
}

impl DtmfToneGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepare to play `event_no` at `volume` -dBm0.
    pub fn init(&mut self, sample_rate_hz: u32, event_no: u8, volume: u8) -> Result<()> {
        let &(row, col) = KEYPAD
            .get(event_no as usize)
            .ok_or(NetEqError::InvalidDtmfEvent("event number out of range"))?;
        if volume > 36 {
            return Err(NetEqError::InvalidDtmfEvent("volume out of range"));
        }
        if sample_rate_hz == 0 {
            return Err(NetEqError::InvalidSampleRate(0));
        }
        let fs = sample_rate_hz as f32;
        self.low_step = 2.0 * PI * ROW_HZ[row] / fs;
        self.high_step = 2.0 * PI * COL_HZ[col] / fs;
        self.low_phase = 0.0;
        self.high_phase = 0.0;
        self.amplitude = FULL_AMPLITUDE * db_to_linear(-(volume as f32));
        self.initialized = true;
        Ok(())
    }

    pub fn reset(&mut self) {
        self.initialized = false;
    }

    pub fn initialized(&self) -> bool {
        self.initialized
    }

    /// Append `len` samples per channel of tone to `output`.
    pub fn generate(&mut self, len: usize, output: &mut AudioMultiVector) -> Result<()> {
        if !self.initialized {
            return Err(NetEqError::InvalidOperation("DTMF generator not initialized"));
        }
        let mut tone = Vec::with_capacity(len);
        for _ in 0..len {
            let value = self.amplitude * (LOW_TONE_TWIST * self.low_phase.sin() + self.high_phase.sin());
            tone.push(saturate(value));
            self.low_phase = (self.low_phase + self.low_step) % (2.0 * PI);
            self.high_phase = (self.high_phase + self.high_step) % (2.0 * PI);
        }
        for ch in 0..output.channels() {
            output.channel_mut(ch).extend_from_slice(&tone);
        }
        Ok(())
    }
}

//! Linear PCM (L16) decoder.
//!
//! 16-bit signed big-endian samples (network byte order), interleaved when
//! there is more than one channel.

use super::{AudioDecoder, CodecError, SpeechType};

/// PCM 16-bit decoder.
pub struct Pcm16Decoder {
    sample_rate: u32,
    channels: usize,
}

impl Pcm16Decoder {
    /// Create a new L16 decoder.
    ///
    /// # Arguments
    /// * `sample_rate` - Clock rate of the payload in Hz
    /// * `channels` - Number of interleaved channels
    pub fn new(sample_rate: u32, channels: usize) -> Self {
        Self {
            sample_rate,
            channels: channels.max(1),
        }
    }
}

impl AudioDecoder for Pcm16Decoder {
    fn decode(&mut self, payload: &[u8], output: &mut [i16]) -> Result<(usize, SpeechType), CodecError> {
        let frame_bytes = 2 * self.channels;
        if payload.len() < frame_bytes || payload.len() % frame_bytes != 0 {
            return Err(CodecError::InvalidInput);
        }

        let sample_count = payload.len() / 2;
        if output.len() < sample_count {
            return Err(CodecError::BufferTooSmall);
        }

        for (out, bytes) in output.iter_mut().zip(payload.chunks_exact(2)) {
            *out = i16::from_be_bytes([bytes[0], bytes[1]]);
        }

        Ok((sample_count, SpeechType::Speech))
    }

    fn packet_duration(&self, payload: &[u8]) -> Option<usize> {
        Some(payload.len() / (2 * self.channels))
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn reset(&mut self) {}
}

/// Encode interleaved samples as an L16 payload.
pub fn encode_l16(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_be_bytes()).collect()
}

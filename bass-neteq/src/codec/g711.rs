//! G.711 mu-law (PCMU) and A-law (PCMA) decoders.
//!
//! G.711 is a narrowband codec at 8 kHz: each encoded byte is one 16-bit
//! sample, so packet duration is simply the payload length.
//!
//! Payload types: PT 0 (mu-law), PT 8 (A-law)

use super::{AudioDecoder, CodecError, SpeechType};

/// G.711 mu-law decoder.
///
/// Stateless decoder - each byte is independently decoded.
pub struct G711UlawDecoder;

impl G711UlawDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl Default for G711UlawDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioDecoder for G711UlawDecoder {
    fn decode(&mut self, payload: &[u8], output: &mut [i16]) -> Result<(usize, SpeechType), CodecError> {
        decode_with(payload, output, ulaw_decode)
    }

    fn packet_duration(&self, payload: &[u8]) -> Option<usize> {
        Some(payload.len())
    }

    fn sample_rate(&self) -> u32 {
        8000
    }

    fn channels(&self) -> usize {
        1
    }

    fn reset(&mut self) {}
}

/// G.711 A-law decoder.
pub struct G711AlawDecoder;

impl G711AlawDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl Default for G711AlawDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioDecoder for G711AlawDecoder {
    fn decode(&mut self, payload: &[u8], output: &mut [i16]) -> Result<(usize, SpeechType), CodecError> {
        decode_with(payload, output, alaw_decode)
    }

    fn packet_duration(&self, payload: &[u8]) -> Option<usize> {
        Some(payload.len())
    }

    fn sample_rate(&self) -> u32 {
        8000
    }

    fn channels(&self) -> usize {
        1
    }

    fn reset(&mut self) {}
}

fn decode_with(
    payload: &[u8],
    output: &mut [i16],
    law: fn(u8) -> i16,
) -> Result<(usize, SpeechType), CodecError> {
    if payload.is_empty() {
        return Err(CodecError::InvalidInput);
    }
    if output.len() < payload.len() {
        return Err(CodecError::BufferTooSmall);
    }
    for (out, &byte) in output.iter_mut().zip(payload) {
        *out = law(byte);
    }
    Ok((payload.len(), SpeechType::Speech))
}

/// Decode a single mu-law byte to a 16-bit signed sample.
///
/// Standard ITU-T G.711 mu-law decoding algorithm.
#[inline]
fn ulaw_decode(y: u8) -> i16 {
    let y = y as i16;
    let sign: i16 = if y < 0x0080 { -1 } else { 1 };

    let mantissa = !y;
    let exponent = (mantissa >> 4) & 0x7;
    let segment = exponent + 1;
    let mantissa = mantissa & 0xF;

    let step = 4 << segment;

    sign * ((0x0080 << exponent) + step * mantissa + step / 2 - 4 * 33)
}

/// Decode a single A-law byte to a 16-bit signed sample.
#[inline]
fn alaw_decode(a: u8) -> i16 {
    let a = a ^ 0x55;
    let exponent = ((a >> 4) & 0x07) as i16;
    let mantissa = (a & 0x0F) as i16;

    let magnitude = if exponent == 0 {
        (mantissa << 4) + 8
    } else {
        ((mantissa << 4) + 0x108) << (exponent - 1)
    };

    if a & 0x80 != 0 {
        magnitude
    } else {
        -magnitude
    }
}

#[cfg(test)]
pub(crate) fn ulaw_encode(sample: i16) -> u8 {
    const BIAS: i32 = 0x84;
    const CLIP: i32 = 32635;

    let sign = if sample < 0 { 0x80 } else { 0x00 };
    let mut sample = (sample as i32).abs().min(CLIP);
    sample += BIAS;

    let mut exponent = 7;
    while exponent > 0 && sample < (0x80 << exponent) {
        exponent -= 1;
    }
    let mantissa = (sample >> (exponent + 3)) & 0x0F;

    !(sign | (exponent << 4) | mantissa) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ulaw_decode_silence() {
        assert!(ulaw_decode(0xFF).abs() < 10);
        assert!(ulaw_decode(0x7F).abs() < 10);
    }

    #[test]
    fn test_alaw_decode_known_values() {
        // 0xD5 and 0x55 are the A-law codes closest to zero.
        assert_eq!(alaw_decode(0xD5), 8);
        assert_eq!(alaw_decode(0x55), -8);
        // Full scale.
        assert_eq!(alaw_decode(0xAA), 32256);
        assert_eq!(alaw_decode(0x2A), -32256);
    }

    #[test]
    fn test_ulaw_round_trip_is_close() {
        for &original in &[0i16, 100, 1000, 10000, -100, -1000, -10000, 32000] {
            let decoded = ulaw_decode(ulaw_encode(original));
            let tolerance = (original.abs() / 20).max(100);
            assert!(
                (original - decoded).abs() <= tolerance,
                "{} decoded as {}",
                original,
                decoded
            );
        }
    }

    #[test]
    fn test_decoder_basic() {
        let mut decoder = G711UlawDecoder::new();
        let mut output = [0i16; 8];
        let (samples, speech) = decoder.decode(&[0xFF, 0x7F, 0x00, 0x80], &mut output).unwrap();
        assert_eq!(samples, 4);
        assert_eq!(speech, SpeechType::Speech);
        assert!(output[2] < -30000);
        assert!(output[3] > 30000);
    }

    #[test]
    fn test_decoder_errors() {
        let mut decoder = G711AlawDecoder::new();
        let mut output = [0i16; 2];
        assert_eq!(decoder.decode(&[], &mut output), Err(CodecError::InvalidInput));
        assert_eq!(decoder.decode(&[0; 4], &mut output), Err(CodecError::BufferTooSmall));
    }

    #[test]
    fn test_packet_duration() {
        let decoder = G711AlawDecoder::new();
        assert_eq!(decoder.packet_duration(&[0u8; 160]), Some(160));
        assert_eq!(decoder.sample_rate(), 8000);
        assert_eq!(decoder.channels(), 1);
    }
}

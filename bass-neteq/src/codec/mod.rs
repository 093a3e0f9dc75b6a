//! Decoder capability and payload-type registry.
//!
//! Built-in decoders:
//! - G.711 mu-law and A-law: 8 kHz mono
//! - L16: 16-bit signed big-endian PCM at any supported rate
//!
//! Comfort noise (RFC 3389) and telephone events (RFC 4733) are registered as
//! payload kinds without a decoder; the engine handles them itself.

pub mod g711;
pub mod pcm;

use std::collections::HashMap;

use log::debug;

use crate::config::is_supported_sample_rate;
use crate::error::{NetEqError, Result};
use crate::packet::Packet;

pub use g711::{G711AlawDecoder, G711UlawDecoder};
pub use pcm::Pcm16Decoder;

/// Common codec error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Decoder not initialized
    NotInitialized,
    /// Invalid input data
    InvalidInput,
    /// Buffer too small
    BufferTooSmall,
    /// Decoder-specific error code
    DecoderCode(i32),
}

impl CodecError {
    /// Numeric code reported through the last-decoder-error query.
    pub fn code(&self) -> i32 {
        match self {
            CodecError::NotInitialized => -1,
            CodecError::InvalidInput => -2,
            CodecError::BufferTooSmall => -3,
            CodecError::DecoderCode(code) => *code,
        }
    }
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::NotInitialized => write!(f, "Codec not initialized"),
            CodecError::InvalidInput => write!(f, "Invalid input data"),
            CodecError::BufferTooSmall => write!(f, "Output buffer too small"),
            CodecError::DecoderCode(code) => write!(f, "Decoder error code: {}", code),
        }
    }
}

impl std::error::Error for CodecError {}

/// Classification of decoded audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechType {
    Speech,
    /// Codec-internal comfort noise
    ComfortNoise,
}

/// Audio decoder capability.
pub trait AudioDecoder: Send {
    /// Decode one payload to interleaved 16-bit PCM.
    ///
    /// # Arguments
    /// * `payload` - Encoded input data
    /// * `output` - Output buffer; its length is the maximum number of samples
    ///
    /// # Returns
    /// Total samples written (all channels) and the kind of audio produced.
    fn decode(&mut self, payload: &[u8], output: &mut [i16]) -> std::result::Result<(usize, SpeechType), CodecError>;

    /// Decode a redundant (FEC) payload. Defaults to the primary path.
    fn decode_redundant(
        &mut self,
        payload: &[u8],
        output: &mut [i16],
    ) -> std::result::Result<(usize, SpeechType), CodecError> {
        self.decode(payload, output)
    }

    /// Samples per channel carried by `payload`, if the decoder can tell.
    fn packet_duration(&self, payload: &[u8]) -> Option<usize>;

    /// Samples per channel carried by a redundant payload, if known.
    fn packet_duration_redundant(&self, _payload: &[u8]) -> Option<usize> {
        None
    }

    fn sample_rate(&self) -> u32;

    fn channels(&self) -> usize;

    /// Reset internal decoder state.
    fn reset(&mut self);
}

/// What a payload type carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Speech,
    ComfortNoise,
    Dtmf,
}

/// Built-in payload formats that can be registered by description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    Pcmu,
    Pcma,
    L16 { sample_rate_hz: u32, channels: usize },
    ComfortNoise { sample_rate_hz: u32 },
    Dtmf { sample_rate_hz: u32 },
}

/// Registry entry for one payload type.
pub struct DecoderInfo {
    pub kind: PayloadKind,
    pub sample_rate_hz: u32,
    decoder: Option<Box<dyn AudioDecoder>>,
}

impl DecoderInfo {
    pub fn decoder(&self) -> Option<&dyn AudioDecoder> {
        self.decoder.as_deref()
    }

    pub fn channels(&self) -> usize {
        self.decoder.as_ref().map(|d| d.channels()).unwrap_or(1)
    }
}

impl std::fmt::Debug for DecoderInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderInfo")
            .field("kind", &self.kind)
            .field("sample_rate_hz", &self.sample_rate_hz)
            .field("has_decoder", &self.decoder.is_some())
            .finish()
    }
}

/// Payload type to decoder mapping, plus active-decoder tracking.
#[derive(Debug, Default)]
pub struct DecoderDatabase {
    decoders: HashMap<u8, DecoderInfo>,
    active_decoder: Option<u8>,
    active_cng: Option<u8>,
}

impl DecoderDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one of the built-in formats.
    pub fn register(&mut self, payload_type: u8, format: PayloadFormat) -> Result<()> {
        let info = match format {
            PayloadFormat::Pcmu => DecoderInfo {
                kind: PayloadKind::Speech,
                sample_rate_hz: 8000,
                decoder: Some(Box::new(G711UlawDecoder::new())),
            },
            PayloadFormat::Pcma => DecoderInfo {
                kind: PayloadKind::Speech,
                sample_rate_hz: 8000,
                decoder: Some(Box::new(G711AlawDecoder::new())),
            },
            PayloadFormat::L16 { sample_rate_hz, channels } => {
                if !is_supported_sample_rate(sample_rate_hz) {
                    return Err(NetEqError::InvalidSampleRate(sample_rate_hz as i32));
                }
                if channels == 0 {
                    return Err(NetEqError::InvalidConfig("L16 needs at least one channel".to_string()));
                }
                DecoderInfo {
                    kind: PayloadKind::Speech,
                    sample_rate_hz,
                    decoder: Some(Box::new(Pcm16Decoder::new(sample_rate_hz, channels))),
                }
            }
            PayloadFormat::ComfortNoise { sample_rate_hz } => {
                if !is_supported_sample_rate(sample_rate_hz) {
                    return Err(NetEqError::InvalidSampleRate(sample_rate_hz as i32));
                }
                DecoderInfo {
                    kind: PayloadKind::ComfortNoise,
                    sample_rate_hz,
                    decoder: None,
                }
            }
            PayloadFormat::Dtmf { sample_rate_hz } => {
                if !is_supported_sample_rate(sample_rate_hz) {
                    return Err(NetEqError::InvalidSampleRate(sample_rate_hz as i32));
                }
                DecoderInfo {
                    kind: PayloadKind::Dtmf,
                    sample_rate_hz,
                    decoder: None,
                }
            }
        };
        self.insert(payload_type, info)
    }

    /// Register a caller-supplied speech decoder.
    pub fn register_external(&mut self, payload_type: u8, decoder: Box<dyn AudioDecoder>) -> Result<()> {
        let sample_rate_hz = decoder.sample_rate();
        if !is_supported_sample_rate(sample_rate_hz) {
            return Err(NetEqError::InvalidSampleRate(sample_rate_hz as i32));
        }
        if decoder.channels() == 0 {
            return Err(NetEqError::InvalidConfig("decoder reports zero channels".to_string()));
        }
        self.insert(
            payload_type,
            DecoderInfo {
                kind: PayloadKind::Speech,
                sample_rate_hz,
                decoder: Some(decoder),
            },
        )
    }

    fn insert(&mut self, payload_type: u8, info: DecoderInfo) -> Result<()> {
        if payload_type > 127 {
            return Err(NetEqError::InvalidConfig(format!("payload type {} out of range", payload_type)));
        }
        if self.decoders.contains_key(&payload_type) {
            return Err(NetEqError::PayloadTypeInUse(payload_type));
        }
        debug!("Registered payload type {} as {:?}", payload_type, info);
        self.decoders.insert(payload_type, info);
        Ok(())
    }

    pub fn remove(&mut self, payload_type: u8) -> Result<()> {
        if self.decoders.remove(&payload_type).is_none() {
            return Err(NetEqError::UnknownPayloadType(payload_type));
        }
        if self.active_decoder == Some(payload_type) {
            self.active_decoder = None;
        }
        if self.active_cng == Some(payload_type) {
            self.active_cng = None;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    pub fn info(&self, payload_type: u8) -> Option<&DecoderInfo> {
        self.decoders.get(&payload_type)
    }

    pub fn decoder_mut(&mut self, payload_type: u8) -> Option<&mut (dyn AudioDecoder + 'static)> {
        self.decoders
            .get_mut(&payload_type)
            .and_then(|info| info.decoder.as_deref_mut())
    }

    pub fn is_registered(&self, payload_type: u8) -> bool {
        self.decoders.contains_key(&payload_type)
    }

    pub fn is_comfort_noise(&self, payload_type: u8) -> bool {
        self.kind(payload_type) == Some(PayloadKind::ComfortNoise)
    }

    pub fn is_dtmf(&self, payload_type: u8) -> bool {
        self.kind(payload_type) == Some(PayloadKind::Dtmf)
    }

    pub fn is_speech(&self, payload_type: u8) -> bool {
        self.kind(payload_type) == Some(PayloadKind::Speech)
    }

    pub fn kind(&self, payload_type: u8) -> Option<PayloadKind> {
        self.decoders.get(&payload_type).map(|info| info.kind)
    }

    /// Make `payload_type` the active speech decoder.
    ///
    /// Returns true if the active decoder changed. The previous decoder is
    /// reset so that it starts clean if it becomes active again.
    pub fn set_active_decoder(&mut self, payload_type: u8) -> Result<bool> {
        if !self.is_speech(payload_type) {
            return Err(NetEqError::UnknownPayloadType(payload_type));
        }
        if self.active_decoder == Some(payload_type) {
            return Ok(false);
        }
        if let Some(previous) = self.active_decoder {
            if let Some(decoder) = self.decoder_mut(previous) {
                decoder.reset();
            }
        }
        self.active_decoder = Some(payload_type);
        Ok(true)
    }

    pub fn active_decoder(&self) -> Option<u8> {
        self.active_decoder
    }

    /// Make `payload_type` the active comfort-noise payload.
    pub fn set_active_cng(&mut self, payload_type: u8) -> Result<bool> {
        if !self.is_comfort_noise(payload_type) {
            return Err(NetEqError::UnknownPayloadType(payload_type));
        }
        let changed = self.active_cng != Some(payload_type);
        self.active_cng = Some(payload_type);
        Ok(changed)
    }

    pub fn active_cng(&self) -> Option<u8> {
        self.active_cng
    }

    /// Reject the list if any packet has an unregistered payload type.
    pub fn check_payload_types(&self, packets: &[Packet]) -> Result<()> {
        match packets.iter().find(|p| !self.is_registered(p.payload_type())) {
            Some(packet) => Err(NetEqError::UnknownPayloadType(packet.payload_type())),
            None => Ok(()),
        }
    }

    /// Duration of a buffered packet in samples per channel, if the decoder
    /// can tell from the payload.
    pub fn packet_duration(&self, packet: &Packet) -> Option<usize> {
        let decoder = self.info(packet.payload_type())?.decoder()?;
        let duration = if packet.primary {
            decoder.packet_duration(&packet.payload)
        } else {
            decoder.packet_duration_redundant(&packet.payload)
        };
        duration.filter(|&d| d > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::RtpHeader;

    fn packet(pt: u8, payload: Vec<u8>) -> Packet {
        Packet::new(
            RtpHeader {
                payload_type: pt,
                ..Default::default()
            },
            payload,
        )
    }

    #[test]
    fn test_register_and_classify() {
        let mut db = DecoderDatabase::new();
        db.register(0, PayloadFormat::Pcmu).unwrap();
        db.register(13, PayloadFormat::ComfortNoise { sample_rate_hz: 8000 }).unwrap();
        db.register(101, PayloadFormat::Dtmf { sample_rate_hz: 8000 }).unwrap();

        assert_eq!(db.len(), 3);
        assert!(db.is_speech(0));
        assert!(db.is_comfort_noise(13));
        assert!(db.is_dtmf(101));
        assert!(!db.is_registered(8));
        assert_eq!(db.info(0).unwrap().sample_rate_hz, 8000);
        assert!(db.info(13).unwrap().decoder().is_none());
    }

    #[test]
    fn test_register_twice_fails() {
        let mut db = DecoderDatabase::new();
        db.register(0, PayloadFormat::Pcmu).unwrap();
        assert_eq!(db.register(0, PayloadFormat::Pcma), Err(NetEqError::PayloadTypeInUse(0)));
        assert!(db.register(96, PayloadFormat::L16 { sample_rate_hz: 44100, channels: 1 }).is_err());
        assert!(db.register(200, PayloadFormat::Pcma).is_err());
    }

    #[test]
    fn test_remove() {
        let mut db = DecoderDatabase::new();
        db.register(8, PayloadFormat::Pcma).unwrap();
        db.set_active_decoder(8).unwrap();
        db.remove(8).unwrap();
        assert!(db.is_empty());
        assert_eq!(db.active_decoder(), None);
        assert_eq!(db.remove(8), Err(NetEqError::UnknownPayloadType(8)));
    }

    #[test]
    fn test_active_decoder_switch() {
        let mut db = DecoderDatabase::new();
        db.register(0, PayloadFormat::Pcmu).unwrap();
        db.register(96, PayloadFormat::L16 { sample_rate_hz: 16000, channels: 2 }).unwrap();
        db.register(13, PayloadFormat::ComfortNoise { sample_rate_hz: 8000 }).unwrap();

        assert!(db.set_active_decoder(0).unwrap());
        assert!(!db.set_active_decoder(0).unwrap());
        assert!(db.set_active_decoder(96).unwrap());
        assert_eq!(db.active_decoder(), Some(96));
        assert!(db.set_active_decoder(13).is_err());

        assert!(db.set_active_cng(13).unwrap());
        assert!(!db.set_active_cng(13).unwrap());
        assert_eq!(db.active_cng(), Some(13));
    }

    #[test]
    fn test_check_payload_types() {
        let mut db = DecoderDatabase::new();
        db.register(0, PayloadFormat::Pcmu).unwrap();
        assert!(db.check_payload_types(&[packet(0, vec![0xFF])]).is_ok());
        assert_eq!(
            db.check_payload_types(&[packet(0, vec![0xFF]), packet(9, vec![1])]),
            Err(NetEqError::UnknownPayloadType(9))
        );
    }

    #[test]
    fn test_packet_duration() {
        let mut db = DecoderDatabase::new();
        db.register(0, PayloadFormat::Pcmu).unwrap();
        db.register(96, PayloadFormat::L16 { sample_rate_hz: 16000, channels: 2 }).unwrap();
        db.register(13, PayloadFormat::ComfortNoise { sample_rate_hz: 8000 }).unwrap();

        assert_eq!(db.packet_duration(&packet(0, vec![0; 160])), Some(160));
        // 4 bytes per stereo sample frame.
        assert_eq!(db.packet_duration(&packet(96, vec![0; 1280])), Some(320));
        assert_eq!(db.packet_duration(&packet(13, vec![40])), None);

        let mut red = packet(0, vec![0; 160]);
        red.primary = false;
        assert_eq!(db.packet_duration(&red), None);
    }

    #[test]
    fn test_codec_error_code() {
        assert_eq!(CodecError::DecoderCode(42).code(), 42);
        assert!(CodecError::InvalidInput.code() < 0);
        assert_eq!(CodecError::BufferTooSmall.to_string(), "Output buffer too small");
    }
}

//! Error types for the playout engine.

use thiserror::Error;

use crate::codec::CodecError;

/// Errors returned by the public engine API and its components.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetEqError {
    #[error("Unsupported sample rate: {0} Hz")]
    InvalidSampleRate(i32),

    #[error("Invalid packet length: {0} ms")]
    InvalidPacketLength(i32),

    #[error("Invalid packet: {0}")]
    InvalidPacket(&'static str),

    #[error("Unknown payload type: {0}")]
    UnknownPayloadType(u8),

    #[error("Payload type {0} is already registered")]
    PayloadTypeInUse(u8),

    #[error("Packet buffer is empty")]
    BufferEmpty,

    #[error("Output buffer too short: {got} < {needed}")]
    OutputBufferTooShort { needed: usize, got: usize },

    #[error("Decoder error: {0}")]
    Decoder(#[from] CodecError),

    #[error("Packet buffer corruption")]
    PacketBufferCorruption,

    #[error("Invalid operation reached: {0}")]
    InvalidOperation(&'static str),

    #[error("Invalid delay setting: {0} ms")]
    InvalidDelay(i32),

    #[error("Sample underrun in sync buffer")]
    SampleUnderrun,

    #[error("Invalid DTMF event: {0}")]
    InvalidDtmfEvent(&'static str),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, NetEqError>;

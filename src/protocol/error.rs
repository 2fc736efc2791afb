//! Protocol error types

use thiserror::Error;

/// Errors that can occur during packet decoding
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("insufficient data in buffer")]
    InsufficientData,
    #[error("invalid packet type: {0}")]
    InvalidPacketType(u8),
    #[error("invalid remaining length encoding")]
    InvalidRemainingLength,
    #[error("invalid protocol name")]
    InvalidProtocolName,
    #[error("invalid protocol version: {0}")]
    InvalidProtocolVersion(u8),
    #[error("invalid QoS value: {0}")]
    InvalidQoS(u8),
    #[error("invalid UTF-8 string")]
    InvalidUtf8,
    #[error("invalid property identifier: {0}")]
    InvalidPropertyId(u8),
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),
    #[error("packet too large")]
    PacketTooLarge,
}

/// Errors that can occur during packet encoding
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("packet too large")]
    PacketTooLarge,
    #[error("string too long")]
    StringTooLong,
    #[error("missing packet id for QoS > 0")]
    MissingPacketId,
}

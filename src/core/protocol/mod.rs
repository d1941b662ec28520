//! Wire codec
//!
//! Provides the binary message format shared by every auxiliary:
//! - Fixed header with token correlation
//! - TLV extension fields
//! - CRC-16 integrity trailer

pub mod checksum;
pub mod message;
pub mod tlv;

pub use message::{
    AckType, CommandType, LogType, Message, MessageKind, MessageType, ReportType, HEADER_LEN,
    PROTOCOL_VERSION,
};
pub use tlv::{Tlv, TlvError, TlvTag, TlvValue};

use thiserror::Error;

/// A buffer that cannot be decoded into a [`Message`]
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MalformedMessage {
    /// Shorter than header plus trailer
    #[error("Message too short: {len} bytes, need at least {min}")]
    TooShort {
        /// Received length
        len: usize,
        /// Minimum length
        min: usize,
    },

    /// Trailer does not match the recomputed CRC
    #[error("CRC mismatch")]
    CrcMismatch,

    /// Version bits are not ours
    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// Unknown message type
    #[error("Unknown message type {0}")]
    UnknownType(u8),

    /// Sub-type not defined for the message type
    #[error("Unknown sub-type {sub_type} for {msg_type:?}")]
    UnknownSubType {
        /// Decoded message type
        msg_type: MessageType,
        /// Raw sub-type
        sub_type: u8,
    },

    /// TLV tag not known to the codec
    #[error("Unknown TLV tag 0x{0:02X}")]
    UnknownTag(u8),

    /// TLV entry runs past the end of the block
    #[error("Truncated TLV entry for tag 0x{0:02X}")]
    TruncatedTlv(u8),

    /// Same TLV tag present twice in one block
    #[error("Duplicate TLV tag 0x{0:02X}")]
    DuplicateTag(u8),
}

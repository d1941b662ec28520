//! Command / ack / log / report messages
//!
//! Layout (big-endian):
//!
//! ```text
//! +------+-------+----------+------------+-------+------+----------+-----+-------+
//! | prop | token | sub_type | error_code | suite | case | reserved | TLV | CRC16 |
//! |  1   |   1   |    1     |     2      |   1   |  1   |    1     | ... |   2   |
//! +------+-------+----------+------------+-------+------+----------+-----+-------+
//! prop = version << 6 | msg_type << 4
//! ```

use super::checksum::{append_crc, verify_trailer, CRC_LEN};
use super::tlv::Tlv;
use super::MalformedMessage;
use crate::core::context::TokenAllocator;
use std::fmt;

/// Protocol version carried in the two top bits of the first byte
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of the fixed header
pub const HEADER_LEN: usize = 8;

macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $($(#[$vmeta:meta])* $variant:ident = $value:expr),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $value),+
        }

        impl $name {
            /// Wire value
            pub fn code(self) -> u8 {
                self as u8
            }

            /// Decode a wire value
            pub fn from_code(code: u8) -> Option<Self> {
                match code {
                    $(v if v == $value => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

wire_enum! {
    /// Top-level message category
    pub enum MessageType {
        /// Host → device request
        Command = 0,
        /// Acknowledgement of any other message
        Ack = 1,
        /// Device log line
        Log = 2,
        /// Test verdict
        Report = 3,
    }
}

wire_enum! {
    /// Command sub-types
    pub enum CommandType {
        /// Liveness probe, used for the creation handshake
        Ping = 0,
        /// Prepare a test suite
        TestSuiteSetup = 1,
        /// Clean up a test suite
        TestSuiteTeardown = 2,
        /// Prepare a test case
        TestCaseSetup = 3,
        /// Run a test case
        TestCaseRun = 4,
        /// Clean up a test case
        TestCaseTeardown = 5,
        /// Abort whatever is running
        Abort = 6,
    }
}

wire_enum! {
    /// Ack sub-types
    pub enum AckType {
        /// Positive acknowledgement
        Ack = 0,
        /// Negative acknowledgement
        Nack = 1,
    }
}

wire_enum! {
    /// Log sub-types
    pub enum LogType {
        /// Unclassified
        Reserved = 0,
        /// Debug
        Debug = 1,
        /// Info
        Info = 2,
        /// Warning
        Warning = 3,
        /// Error
        Error = 4,
    }
}

wire_enum! {
    /// Report sub-types
    pub enum ReportType {
        /// Test passed
        TestPass = 0,
        /// Test failed
        TestFailed = 1,
        /// Test has no implementation on the device
        TestNotImplemented = 2,
    }
}

/// Message type together with its sub-type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Command
    Command(CommandType),
    /// Ack
    Ack(AckType),
    /// Log
    Log(LogType),
    /// Report
    Report(ReportType),
}

impl MessageKind {
    /// Top-level type
    pub fn msg_type(self) -> MessageType {
        match self {
            MessageKind::Command(_) => MessageType::Command,
            MessageKind::Ack(_) => MessageType::Ack,
            MessageKind::Log(_) => MessageType::Log,
            MessageKind::Report(_) => MessageType::Report,
        }
    }

    /// Raw sub-type byte
    pub fn sub_type(self) -> u8 {
        match self {
            MessageKind::Command(c) => c.code(),
            MessageKind::Ack(a) => a.code(),
            MessageKind::Log(l) => l.code(),
            MessageKind::Report(r) => r.code(),
        }
    }

    /// Rebuild a kind from its two wire values
    pub fn from_codes(msg_type: u8, sub_type: u8) -> Result<Self, MalformedMessage> {
        let ty = MessageType::from_code(msg_type).ok_or(MalformedMessage::UnknownType(msg_type))?;
        let unknown = MalformedMessage::UnknownSubType {
            msg_type: ty,
            sub_type,
        };
        match ty {
            MessageType::Command => CommandType::from_code(sub_type).map(MessageKind::Command),
            MessageType::Ack => AckType::from_code(sub_type).map(MessageKind::Ack),
            MessageType::Log => LogType::from_code(sub_type).map(MessageKind::Log),
            MessageType::Report => ReportType::from_code(sub_type).map(MessageKind::Report),
        }
        .ok_or(unknown)
    }
}

/// One wire message.
///
/// Built by the issuer, serialized once, and never mutated after sending. A
/// parsed buffer always yields a fresh value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Type and sub-type
    pub kind: MessageKind,
    /// Correlation token
    pub token: u8,
    /// Test suite identifier
    pub test_suite: u8,
    /// Test case identifier
    pub test_case: u8,
    /// Device error code
    pub error_code: u16,
    /// Reserved byte, carried through untouched
    pub reserved: u8,
    /// Optional extension fields
    pub tlv: Tlv,
}

impl Message {
    /// Create a message with an explicit token
    pub fn new(kind: MessageKind, token: u8, test_suite: u8, test_case: u8) -> Self {
        Self {
            kind,
            token,
            test_suite,
            test_case,
            error_code: 0,
            reserved: 0,
            tlv: Tlv::new(),
        }
    }

    /// Create a command, allocating a fresh token
    pub fn command(
        tokens: &TokenAllocator,
        command: CommandType,
        test_suite: u8,
        test_case: u8,
    ) -> Self {
        Self::new(
            MessageKind::Command(command),
            tokens.next_token(),
            test_suite,
            test_case,
        )
    }

    /// Attach a TLV block
    #[must_use]
    pub fn with_tlv(mut self, tlv: Tlv) -> Self {
        self.tlv = tlv;
        self
    }

    /// Set the error code
    #[must_use]
    pub fn with_error_code(mut self, error_code: u16) -> Self {
        self.error_code = error_code;
        self
    }

    /// Top-level type
    pub fn msg_type(&self) -> MessageType {
        self.kind.msg_type()
    }

    /// Encode to wire bytes, CRC trailer included
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.tlv.encoded_len() + CRC_LEN);
        out.push((PROTOCOL_VERSION << 6) | (self.msg_type().code() << 4));
        out.push(self.token);
        out.push(self.kind.sub_type());
        out.extend_from_slice(&self.error_code.to_be_bytes());
        out.push(self.test_suite);
        out.push(self.test_case);
        out.push(self.reserved);
        self.tlv.encode_into(&mut out);
        append_crc(&mut out);
        out
    }

    /// Decode wire bytes
    pub fn parse(raw: &[u8]) -> Result<Self, MalformedMessage> {
        if raw.len() < HEADER_LEN + CRC_LEN {
            return Err(MalformedMessage::TooShort {
                len: raw.len(),
                min: HEADER_LEN + CRC_LEN,
            });
        }
        let body = verify_trailer(raw).ok_or(MalformedMessage::CrcMismatch)?;

        let version = body[0] >> 6;
        if version != PROTOCOL_VERSION {
            return Err(MalformedMessage::UnsupportedVersion(version));
        }
        let kind = MessageKind::from_codes((body[0] >> 4) & 0x03, body[2])?;
        let tlv = Tlv::decode(&body[HEADER_LEN..])?;

        Ok(Self {
            kind,
            token: body[1],
            error_code: u16::from_be_bytes([body[3], body[4]]),
            test_suite: body[5],
            test_case: body[6],
            reserved: body[7],
            tlv,
        })
    }

    /// Build an ack for this message from a raw ack sub-type.
    ///
    /// Returns `None` when `ack_kind` is not a known ack sub-type.
    pub fn generate_ack(&self, ack_kind: u8) -> Option<Message> {
        AckType::from_code(ack_kind).map(|kind| self.ack(kind))
    }

    /// Build an ack for this message
    pub fn ack(&self, kind: AckType) -> Message {
        Message::new(MessageKind::Ack(kind), self.token, self.test_suite, self.test_case)
    }

    /// True when `received` answers this message.
    ///
    /// Only the token is compared; interpreting the response type is up to
    /// the caller.
    pub fn matches(&self, received: &Message) -> bool {
        received.token == self.token
    }

    /// True for a positive ack
    pub fn is_positive_ack(&self) -> bool {
        self.kind == MessageKind::Ack(AckType::Ack)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sub = match self.kind {
            MessageKind::Command(c) => format!("{:?}", c),
            MessageKind::Ack(a) => format!("{:?}", a),
            MessageKind::Log(l) => format!("{:?}", l),
            MessageKind::Report(r) => format!("{:?}", r),
        };
        write!(
            f,
            "{:?}/{} token={} suite={} case={}",
            self.msg_type(),
            sub,
            self.token,
            self.test_suite,
            self.test_case
        )?;
        if self.error_code != 0 {
            write!(f, " error=0x{:04X}", self.error_code)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::tlv::TlvTag;

    fn setup_message(token: u8) -> Message {
        Message::new(MessageKind::Command(CommandType::TestCaseSetup), token, 2, 3)
    }

    fn without_crc(raw: &[u8]) -> String {
        hex::encode(&raw[..raw.len() - CRC_LEN])
    }

    #[test]
    fn test_serialize_fixed_header() {
        for token in [0u8, 0x2A, 0xFF] {
            let raw = setup_message(token).serialize();
            assert_eq!(without_crc(&raw), format!("40{:02x}030000020300", token));
        }
    }

    #[test]
    fn test_serialize_with_tlv() {
        let mut tlv = Tlv::new();
        tlv.insert(TlvTag::TestReport, "OK").unwrap();
        tlv.insert(TlvTag::FailureReason, 0x123456u32).unwrap();
        let raw = setup_message(7).with_tlv(tlv).serialize();

        let hex = without_crc(&raw);
        assert_eq!(&hex[..16], "4007030000020300");
        assert_eq!(&hex[16..], "09024f4b7003123456");
    }

    #[test]
    fn test_round_trip() {
        let mut tlv = Tlv::new();
        tlv.insert(TlvTag::TestParameter, vec![1, 2, 3]).unwrap();
        tlv.insert_padded(TlvTag::LogMessage, "boot", 8).unwrap();
        let messages = [
            setup_message(1),
            Message::new(MessageKind::Ack(AckType::Nack), 200, 9, 1),
            Message::new(MessageKind::Log(LogType::Warning), 3, 0, 0).with_tlv(tlv.clone()),
            Message::new(MessageKind::Report(ReportType::TestFailed), 255, 4, 5)
                .with_error_code(0xBEEF)
                .with_tlv(tlv),
        ];
        for msg in messages {
            assert_eq!(Message::parse(&msg.serialize()).unwrap(), msg);
        }
    }

    #[test]
    fn test_single_byte_corruption_detected() {
        let mut tlv = Tlv::new();
        tlv.insert(TlvTag::TestReport, "OK").unwrap();
        tlv.insert(TlvTag::FailureReason, 0x123456u32).unwrap();
        let raw = setup_message(9).with_tlv(tlv).serialize();

        for index in 0..raw.len() - CRC_LEN {
            for flip in [0x01u8, 0x80, 0xFF] {
                let mut corrupted = raw.clone();
                corrupted[index] ^= flip;
                assert!(
                    Message::parse(&corrupted).is_err(),
                    "flip 0x{:02X} at {} went undetected",
                    flip,
                    index
                );
            }
        }
    }

    #[test]
    fn test_parse_too_short() {
        assert_eq!(
            Message::parse(&[0x40, 0x01, 0x00]),
            Err(MalformedMessage::TooShort { len: 3, min: 10 })
        );
    }

    #[test]
    fn test_parse_unknown_tag_with_valid_crc() {
        let mut raw = setup_message(1).serialize();
        raw.truncate(HEADER_LEN);
        raw.extend_from_slice(&[0x42, 0x01, 0x00]);
        append_crc(&mut raw);
        assert_eq!(Message::parse(&raw), Err(MalformedMessage::UnknownTag(0x42)));
    }

    #[test]
    fn test_parse_unknown_sub_type() {
        let mut raw = vec![0x50, 0x01, 0x07, 0, 0, 0, 0, 0];
        append_crc(&mut raw);
        assert_eq!(
            Message::parse(&raw),
            Err(MalformedMessage::UnknownSubType {
                msg_type: MessageType::Ack,
                sub_type: 7
            })
        );
    }

    #[test]
    fn test_generate_ack() {
        let msg = setup_message(42);
        let ack = msg.generate_ack(AckType::Ack.code()).unwrap();
        assert_eq!(ack.kind, MessageKind::Ack(AckType::Ack));
        assert_eq!(ack.token, 42);
        assert_eq!((ack.test_suite, ack.test_case), (2, 3));
        assert!(msg.matches(&ack));
        assert!(ack.is_positive_ack());

        assert!(msg.generate_ack(9).is_none());
    }

    #[test]
    fn test_matches_ignores_kind() {
        let msg = setup_message(5);
        assert!(msg.matches(&msg.ack(AckType::Nack)));
        assert!(!msg.matches(&setup_message(6)));
    }

    #[test]
    fn test_command_allocates_tokens() {
        let tokens = TokenAllocator::starting_at(10);
        let a = Message::command(&tokens, CommandType::Ping, 0, 0);
        let b = Message::command(&tokens, CommandType::Ping, 0, 0);
        assert_eq!((a.token, b.token), (10, 11));
    }

    #[test]
    fn test_display() {
        let text = setup_message(3).to_string();
        assert_eq!(text, "Command/TestCaseSetup token=3 suite=2 case=3");
    }
}

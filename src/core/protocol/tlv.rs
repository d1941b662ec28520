//! Tag-length-value extension fields
//!
//! A TLV block is an ordered list of `tag(1) len(1) value(len)` entries placed
//! between the fixed header and the CRC trailer.

use super::MalformedMessage;
use thiserror::Error;

/// Largest value a single entry can carry (length is one byte)
pub const MAX_VALUE_LEN: usize = u8::MAX as usize;

/// Tags understood by the codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TlvTag {
    /// Free-form test verdict text
    TestReport = 0x09,
    /// Parameter handed to a test case
    TestParameter = 0x6E,
    /// Device-side failure reason
    FailureReason = 0x70,
    /// Log line emitted by the device
    LogMessage = 0x71,
}

impl TlvTag {
    /// Wire value of the tag
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for TlvTag {
    type Error = MalformedMessage;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x09 => Ok(Self::TestReport),
            0x6E => Ok(Self::TestParameter),
            0x70 => Ok(Self::FailureReason),
            0x71 => Ok(Self::LogMessage),
            other => Err(MalformedMessage::UnknownTag(other)),
        }
    }
}

/// Errors raised while building a TLV block
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TlvError {
    /// Value does not fit in a one-byte length
    #[error("TLV value for {tag:?} is {len} bytes, limit is {}", MAX_VALUE_LEN)]
    ValueTooLong {
        /// Offending tag
        tag: TlvTag,
        /// Encoded length
        len: usize,
    },
}

/// A value accepted by [`Tlv::insert`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlvValue {
    /// UTF-8 text, encoded as-is
    Text(String),
    /// Raw bytes
    Bytes(Vec<u8>),
    /// Unsigned integer, minimal big-endian encoding (at least one byte)
    Int(u64),
}

impl TlvValue {
    /// Natural encoding of the value, before any padding
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            TlvValue::Text(s) => s.as_bytes().to_vec(),
            TlvValue::Bytes(b) => b.clone(),
            TlvValue::Int(n) => {
                let be = n.to_be_bytes();
                let skip = be.iter().take_while(|&&b| b == 0).count().min(be.len() - 1);
                be[skip..].to_vec()
            }
        }
    }
}

impl From<&str> for TlvValue {
    fn from(s: &str) -> Self {
        TlvValue::Text(s.to_string())
    }
}

impl From<String> for TlvValue {
    fn from(s: String) -> Self {
        TlvValue::Text(s)
    }
}

impl From<Vec<u8>> for TlvValue {
    fn from(b: Vec<u8>) -> Self {
        TlvValue::Bytes(b)
    }
}

impl From<&[u8]> for TlvValue {
    fn from(b: &[u8]) -> Self {
        TlvValue::Bytes(b.to_vec())
    }
}

impl From<u64> for TlvValue {
    fn from(n: u64) -> Self {
        TlvValue::Int(n)
    }
}

impl From<u32> for TlvValue {
    fn from(n: u32) -> Self {
        TlvValue::Int(n as u64)
    }
}

impl From<u8> for TlvValue {
    fn from(n: u8) -> Self {
        TlvValue::Int(n as u64)
    }
}

/// Ordered tag → payload mapping
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tlv {
    entries: Vec<(TlvTag, Vec<u8>)>,
}

impl Tlv {
    /// Create an empty block
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value with its natural length.
    ///
    /// Inserting an existing tag replaces its payload in place.
    pub fn insert(&mut self, tag: TlvTag, value: impl Into<TlvValue>) -> Result<(), TlvError> {
        self.insert_padded(tag, value, 0)
    }

    /// Insert a value zero-padded (trailing) up to `width` bytes.
    ///
    /// Padding only applies when `width` exceeds the natural length.
    pub fn insert_padded(
        &mut self,
        tag: TlvTag,
        value: impl Into<TlvValue>,
        width: usize,
    ) -> Result<(), TlvError> {
        let mut payload = value.into().to_bytes();
        if width > payload.len() {
            payload.resize(width, 0);
        }
        if payload.len() > MAX_VALUE_LEN {
            return Err(TlvError::ValueTooLong {
                tag,
                len: payload.len(),
            });
        }
        self.put(tag, payload);
        Ok(())
    }

    fn put(&mut self, tag: TlvTag, payload: Vec<u8>) {
        match self.entries.iter_mut().find(|(t, _)| *t == tag) {
            Some(entry) => entry.1 = payload,
            None => self.entries.push((tag, payload)),
        }
    }

    /// Payload stored under `tag`
    pub fn get(&self, tag: TlvTag) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, v)| v.as_slice())
    }

    /// Payload under `tag` decoded as lossy UTF-8
    pub fn get_text(&self, tag: TlvTag) -> Option<String> {
        self.get(tag).map(|v| String::from_utf8_lossy(v).into_owned())
    }

    /// Entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (TlvTag, &[u8])> {
        self.entries.iter().map(|(t, v)| (*t, v.as_slice()))
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no entry is present
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encoded size in bytes
    pub fn encoded_len(&self) -> usize {
        self.entries.iter().map(|(_, v)| 2 + v.len()).sum()
    }

    pub(crate) fn encode_into(&self, out: &mut Vec<u8>) {
        for (tag, value) in &self.entries {
            out.push(tag.code());
            out.push(value.len() as u8);
            out.extend_from_slice(value);
        }
    }

    pub(crate) fn decode(mut raw: &[u8]) -> Result<Self, MalformedMessage> {
        let mut tlv = Tlv::new();
        while !raw.is_empty() {
            let code = raw[0];
            let tag = TlvTag::try_from(code)?;
            let len = *raw.get(1).ok_or(MalformedMessage::TruncatedTlv(code))? as usize;
            let value = raw
                .get(2..2 + len)
                .ok_or(MalformedMessage::TruncatedTlv(code))?;
            if tlv.get(tag).is_some() {
                return Err(MalformedMessage::DuplicateTag(code));
            }
            tlv.entries.push((tag, value.to_vec()));
            raw = &raw[2 + len..];
        }
        Ok(tlv)
    }
}

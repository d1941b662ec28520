//! Serde helper: byte payloads as lowercase hex strings

use serde::{Deserialize, Deserializer, Serializer};

/// Encode as a hex string
pub fn serialize<S, T>(data: T, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: AsRef<[u8]>,
{
    serializer.serialize_str(&hex::encode(data))
}

/// Decode a hex string
pub fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: From<Vec<u8>>,
{
    let text = String::deserialize(deserializer)?;
    hex::decode(text)
        .map(T::from)
        .map_err(serde::de::Error::custom)
}

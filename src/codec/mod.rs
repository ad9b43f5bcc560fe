//! # Wire Codec
//!
//! Every message that crosses the plugin process boundary is a hand-written
//! `prost` message that also derives serde, so it can travel either as compact
//! protobuf or as JSON.
//!
//! The encoder follows a process-wide [`Encoding`] switch. Decoders accept
//! both forms by looking at the first byte only: JSON payloads start with `{`
//! (0x7B), which as a protobuf tag would open a group on field 15. None of
//! these messages use groups, so a binary payload never starts with it.
//! Leading whitespace is not skipped; 0x0A and 0x20 are ordinary protobuf tags.

pub mod envelope;
pub mod messages;

pub use envelope::{
    decode_forwarded_request, encode_forwarded_request, encode_forwarded_request_as,
    ForwardedRequest, HeaderValues, RequestUrl,
};

use crate::errors::{Result, WardenError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};

/// Wire representation for message payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Binary,
    Json,
}

impl Encoding {
    fn as_u8(self) -> u8 {
        match self {
            Encoding::Binary => 0,
            Encoding::Json => 1,
        }
    }

    fn from_u8(value: u8) -> Self {
        if value == 1 {
            Encoding::Json
        } else {
            Encoding::Binary
        }
    }
}

static ENCODING: AtomicU8 = AtomicU8::new(0);

/// Switch the process-wide encoding used by [`encode_message`]
pub fn set_encoding(encoding: Encoding) {
    ENCODING.store(encoding.as_u8(), Ordering::SeqCst);
}

/// Current process-wide encoding
pub fn current_encoding() -> Encoding {
    Encoding::from_u8(ENCODING.load(Ordering::SeqCst))
}

/// Encode with the process-wide encoding
pub fn encode_message<M>(message: &M) -> Result<Vec<u8>>
where
    M: prost::Message + Serialize,
{
    encode_message_as(message, current_encoding())
}

/// Encode with an explicit encoding
pub fn encode_message_as<M>(message: &M, encoding: Encoding) -> Result<Vec<u8>>
where
    M: prost::Message + Serialize,
{
    match encoding {
        Encoding::Binary => Ok(message.encode_to_vec()),
        Encoding::Json => serde_json::to_vec(message)
            .map_err(|e| WardenError::codec(format!("JSON encode failed: {}", e))),
    }
}

/// Decode a payload produced by either encoding
pub fn decode_message<M>(bytes: &[u8]) -> Result<M>
where
    M: prost::Message + Default + DeserializeOwned,
{
    match detect_encoding(bytes) {
        Encoding::Binary => Ok(M::decode(bytes)?),
        Encoding::Json => serde_json::from_slice(bytes)
            .map_err(|e| WardenError::codec(format!("JSON decode failed: {}", e))),
    }
}

fn detect_encoding(bytes: &[u8]) -> Encoding {
    match bytes.first() {
        Some(b'{') => Encoding::Json,
        _ => Encoding::Binary,
    }
}

/// serde adapter writing `Vec<u8>` as standard base64
pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<T: AsRef<[u8]>, S: Serializer>(bytes: T, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// serde adapter writing `Vec<Vec<u8>>` as a list of base64 strings
pub(crate) mod base64_bytes_list {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(items: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(items.len()))?;
        for item in items {
            seq.serialize_element(&STANDARD.encode(item))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Vec<u8>>, D::Error> {
        Vec::<String>::deserialize(deserializer)?
            .into_iter()
            .map(|encoded| STANDARD.decode(encoded).map_err(serde::de::Error::custom))
            .collect()
    }
}

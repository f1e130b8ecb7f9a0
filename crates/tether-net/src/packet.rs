//! Packet codec contract shared by every message type.
//!
//! Wire layout of one encoded packet:
//!
//! ```text
//! [tag: i32 little-endian] [postcard-encoded fields]
//! ```
//!
//! Negative tags are reserved for session control traffic.

use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Width of the type tag at the start of every packet.
pub const TAG_LEN: usize = 4;

/// Numeric type tag identifying a packet type on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PacketTag(pub i32);

impl PacketTag {
    /// Reserved tags belong to the session layer, not to payload types.
    pub fn is_reserved(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for PacketTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A self-describing message.
///
/// `is_valid` runs right after decoding. Returning `false` makes the
/// dispatcher drop the packet without running its handler.
pub trait Packet: Serialize + DeserializeOwned + fmt::Debug + Send + 'static {
    /// Unique wire tag. Registered exactly once.
    const TAG: PacketTag;

    fn is_valid(&self) -> bool {
        true
    }
}

/// Errors that can occur while encoding or decoding a packet.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The buffer is shorter than the type tag.
    #[error("buffer of {0} bytes is too short for a type tag")]
    MissingTag(usize),

    /// The buffer carries a different packet type.
    #[error("expected tag {expected}, found {found}")]
    TagMismatch {
        expected: PacketTag,
        found: PacketTag,
    },

    /// Field encoding or decoding failed.
    #[error("payload error: {0}")]
    Postcard(#[from] postcard::Error),
}

/// Serialize a packet into its tagged wire form.
pub fn encode<P: Packet>(packet: &P) -> Result<Vec<u8>, CodecError> {
    let body = postcard::to_allocvec(packet)?;
    let mut out = Vec::with_capacity(TAG_LEN + body.len());
    out.extend_from_slice(&P::TAG.0.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Read the type tag without decoding the rest.
pub fn peek_tag(bytes: &[u8]) -> Result<PacketTag, CodecError> {
    let prefix: [u8; TAG_LEN] = bytes
        .get(..TAG_LEN)
        .and_then(|s| s.try_into().ok())
        .ok_or(CodecError::MissingTag(bytes.len()))?;
    Ok(PacketTag(i32::from_le_bytes(prefix)))
}

/// Decode a full tagged buffer as `P`.
pub fn decode<P: Packet>(bytes: &[u8]) -> Result<P, CodecError> {
    let found = peek_tag(bytes)?;
    if found != P::TAG {
        return Err(CodecError::TagMismatch {
            expected: P::TAG,
            found,
        });
    }
    decode_body(&bytes[TAG_LEN..])
}

/// Decode the fields that follow an already-consumed tag.
pub(crate) fn decode_body<P: Packet>(body: &[u8]) -> Result<P, CodecError> {
    Ok(postcard::from_bytes(body)?)
}

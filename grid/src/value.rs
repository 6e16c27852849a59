//! Cache keys and values.
//!
//! Keys are opaque byte strings with a precomputed 32-bit hash. Values are a
//! tagged union: either a raw byte array or a marshaled payload carrying a
//! single-byte type tag. Both representations serialize to bytes plus a tag,
//! which is the form stored off-heap and in the swap tier.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_derive::{Deserialize, Serialize as SerializeDerive};

use crate::error::{CResult, Error};

/// Single-byte tag identifying a marshaled value's type.
pub type TypeTag = u8;

/// The tag reserved for raw byte-array values.
pub const TYPE_BYTES: TypeTag = 0;

/// An opaque cache key: bytes plus a precomputed 32-bit hash.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, SerializeDerive, Deserialize)]
pub struct CacheKey {
    #[serde(with = "serde_bytes")]
    bytes: Vec<u8>,
    hash: u32,
}

impl CacheKey {
    /// Creates a key from raw bytes, computing the hash.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        let hash = fnv1a(&bytes);
        Self { bytes, hash }
    }

    /// Creates a key with a caller-supplied hash, e.g. one computed by the
    /// owning map's segment selector.
    pub fn with_hash(bytes: impl Into<Vec<u8>>, hash: u32) -> Self {
        Self { bytes: bytes.into(), hash }
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in self.bytes.iter().take(16) {
            write!(f, "{:02x}", b)?;
        }
        if self.bytes.len() > 16 {
            write!(f, "..")?;
        }
        write!(f, "@{:08x}", self.hash)
    }
}

/// FNV-1a, 32-bit.
pub(crate) fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for b in bytes {
        hash ^= *b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// A cache value: either a raw byte array or a marshaled payload with its
/// type tag.
#[derive(Clone, Debug, PartialEq, Eq, SerializeDerive, Deserialize)]
pub enum CacheValue {
    /// Raw byte-array value.
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),

    /// Marshaled payload: type tag plus serialized bytes.
    Marshaled(TypeTag, #[serde(with = "serde_bytes")] Vec<u8>),
}

impl CacheValue {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        CacheValue::Bytes(bytes.into())
    }

    /// Marshals a typed payload. The tag must not collide with the
    /// byte-array tag.
    pub fn marshal<T: Serialize>(tag: TypeTag, value: &T) -> CResult<Self> {
        if tag == TYPE_BYTES {
            return Err(Error::Value(format!("type tag {} is reserved for byte arrays", tag)));
        }
        Ok(CacheValue::Marshaled(tag, bincode::serialize(value)?))
    }

    /// Unmarshals a typed payload.
    pub fn unmarshal<T: DeserializeOwned>(&self) -> CResult<T> {
        match self {
            CacheValue::Marshaled(_, bytes) => Ok(bincode::deserialize(bytes)?),
            CacheValue::Bytes(_) => {
                Err(Error::Codec("cannot unmarshal a raw byte-array value".into()))
            }
        }
    }

    /// Reassembles a value from its byte representation and type tag, the
    /// form recovered from off-heap memory or the swap tier.
    pub fn from_parts(bytes: Vec<u8>, tag: TypeTag) -> Self {
        if tag == TYPE_BYTES {
            CacheValue::Bytes(bytes)
        } else {
            CacheValue::Marshaled(tag, bytes)
        }
    }

    /// The value's byte representation and type tag.
    pub fn value_bytes(&self) -> (&[u8], TypeTag) {
        match self {
            CacheValue::Bytes(b) => (b, TYPE_BYTES),
            CacheValue::Marshaled(tag, b) => (b, *tag),
        }
    }

    pub fn type_tag(&self) -> TypeTag {
        self.value_bytes().1
    }

    /// Length of the byte representation.
    pub fn len(&self) -> usize {
        self.value_bytes().0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Display for CacheValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (bytes, tag) = self.value_bytes();
        write!(f, "[tag={}, len={}]", tag, bytes.len())
    }
}

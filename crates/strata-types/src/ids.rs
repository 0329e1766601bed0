use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Number of low bits holding the rank-partitioned slot of an identifier.
/// The two bits above them carry the [`IdClass`] tag.
pub const SLOT_BITS: u32 = 62;

/// Mask selecting the slot portion of an identifier.
pub const SLOT_MASK: u64 = (1 << SLOT_BITS) - 1;

/// Class of a remote storage object.
///
/// Each container keeps one independent id counter per class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectClass {
    /// Key-value object (groups, maps, attribute tables).
    Kv,
    /// Multi-dimensional array object (datasets).
    Array,
    /// Unstructured byte object (datatypes, scratch blobs).
    Blob,
}

impl ObjectClass {
    /// All object classes, in counter order.
    pub const ALL: [ObjectClass; 3] = [ObjectClass::Kv, ObjectClass::Array, ObjectClass::Blob];

    /// Index of this class in per-class counter arrays.
    pub fn index(self) -> usize {
        match self {
            Self::Kv => 0,
            Self::Array => 1,
            Self::Blob => 2,
        }
    }
}

impl fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kv => write!(f, "kv"),
            Self::Array => write!(f, "array"),
            Self::Blob => write!(f, "blob"),
        }
    }
}

impl std::str::FromStr for ObjectClass {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "kv" => Ok(Self::Kv),
            "array" => Ok(Self::Array),
            "blob" => Ok(Self::Blob),
            other => Err(TypeError::InvalidObjectId(format!("unknown object class '{other}'"))),
        }
    }
}

/// Tag embedded in the top bits of every identifier minted by
/// [`next_id`](crate::next_id).
///
/// Request sequence ids share one tag so that their numeric order is the
/// order in which a rank issued them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdClass {
    Sequence,
    Object(ObjectClass),
}

impl IdClass {
    /// The 2-bit tag stored above the slot bits.
    pub fn tag(self) -> u64 {
        match self {
            Self::Sequence => 0,
            Self::Object(ObjectClass::Kv) => 1,
            Self::Object(ObjectClass::Array) => 2,
            Self::Object(ObjectClass::Blob) => 3,
        }
    }

    /// Recover a class from its tag.
    pub fn from_tag(tag: u64) -> Result<Self, TypeError> {
        match tag {
            0 => Ok(Self::Sequence),
            1 => Ok(Self::Object(ObjectClass::Kv)),
            2 => Ok(Self::Object(ObjectClass::Array)),
            3 => Ok(Self::Object(ObjectClass::Blob)),
            other => Err(TypeError::UnknownClass(other)),
        }
    }
}

impl From<ObjectClass> for IdClass {
    fn from(class: ObjectClass) -> Self {
        Self::Object(class)
    }
}

/// Identifier of a remote object.
///
/// Minted locally by a rank from its container's per-class counter, so the
/// class can always be recovered from the identifier itself.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(u64);

impl ObjectId {
    /// Wrap a raw identifier. Fails if the tag does not name an object class.
    pub fn from_raw(raw: u64) -> Result<Self, TypeError> {
        match IdClass::from_tag(raw >> SLOT_BITS)? {
            IdClass::Object(_) => Ok(Self(raw)),
            IdClass::Sequence => Err(TypeError::InvalidObjectId(format!(
                "{raw:#018x} carries the sequence tag"
            ))),
        }
    }

    pub(crate) fn new_unchecked(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw 64-bit value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// The class this identifier was minted for.
    pub fn class(&self) -> ObjectClass {
        match self.0 >> SLOT_BITS {
            1 => ObjectClass::Kv,
            2 => ObjectClass::Array,
            _ => ObjectClass::Blob,
        }
    }

    /// The rank-partitioned slot (identifier without its class tag).
    pub fn slot(&self) -> u64 {
        self.0 & SLOT_MASK
    }

    /// Hex-encoded big-endian representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_be_bytes())
    }

    /// Parse from the 16-character hex form produced by [`to_hex`](Self::to_hex).
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        let arr: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| TypeError::InvalidHex(format!("expected 8 bytes, got {}", bytes.len())))?;
        Self::from_raw(u64::from_be_bytes(arr))
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({}:{})", self.class(), self.slot())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class(), self.to_hex())
    }
}

/// Globally ordered identifier of one request.
///
/// Values issued by a single rank strictly increase; values from different
/// ranks under the same rank count never collide.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct SequenceId(u64);

impl SequenceId {
    /// The sequence id below every issued id. Used as the initial
    /// low-water-mark before anything has retired.
    pub const ZERO: SequenceId = SequenceId(0);

    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SequenceId({})", self.0)
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

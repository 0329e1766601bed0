use std::fmt;

use serde::{Deserialize, Serialize};

/// Checksum algorithm used for payloads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// CRC32 (IEEE). Cheap; catches transfer corruption.
    #[default]
    Crc32,
    /// BLAKE3-256. Collision resistant.
    Blake3,
}

/// A computed payload checksum.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Checksum {
    Crc32(u32),
    Blake3([u8; 32]),
}

impl Checksum {
    pub fn algorithm(&self) -> ChecksumAlgorithm {
        match self {
            Self::Crc32(_) => ChecksumAlgorithm::Crc32,
            Self::Blake3(_) => ChecksumAlgorithm::Blake3,
        }
    }

    pub fn to_hex(&self) -> String {
        match self {
            Self::Crc32(v) => hex::encode(v.to_be_bytes()),
            Self::Blake3(h) => hex::encode(h),
        }
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Crc32(v) => write!(f, "Crc32({v:#010x})"),
            Self::Blake3(h) => write!(f, "Blake3({})", hex::encode(&h[..4])),
        }
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Errors from checksum verification.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChecksumError {
    #[error("checksum mismatch: expected {expected}, computed {computed}")]
    Mismatch { expected: Checksum, computed: Checksum },
}

/// Domain-separated payload checksummer.
///
/// The domain tag is folded into every computation so that a request payload
/// and a reply payload with identical bytes never share a checksum.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Checksummer {
    algorithm: ChecksumAlgorithm,
    domain: &'static str,
}

impl Checksummer {
    /// Domain for payloads sent from client to service.
    pub const REQUEST_DOMAIN: &'static str = "strata-request-v1";
    /// Domain for payloads returned by the service.
    pub const REPLY_DOMAIN: &'static str = "strata-reply-v1";

    pub const fn new(algorithm: ChecksumAlgorithm, domain: &'static str) -> Self {
        Self { algorithm, domain }
    }

    pub const fn request(algorithm: ChecksumAlgorithm) -> Self {
        Self::new(algorithm, Self::REQUEST_DOMAIN)
    }

    pub const fn reply(algorithm: ChecksumAlgorithm) -> Self {
        Self::new(algorithm, Self::REPLY_DOMAIN)
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn domain(&self) -> &str {
        self.domain
    }

    /// Compute the checksum of `data`.
    pub fn compute(&self, data: &[u8]) -> Checksum {
        match self.algorithm {
            ChecksumAlgorithm::Crc32 => {
                let mut hasher = crc32fast::Hasher::new();
                hasher.update(self.domain.as_bytes());
                hasher.update(b":");
                hasher.update(data);
                Checksum::Crc32(hasher.finalize())
            }
            ChecksumAlgorithm::Blake3 => {
                let mut hasher = blake3::Hasher::new();
                hasher.update(self.domain.as_bytes());
                hasher.update(b":");
                hasher.update(data);
                Checksum::Blake3(*hasher.finalize().as_bytes())
            }
        }
    }

    /// Returns `true` if `data` produces `expected`.
    ///
    /// The algorithm of `expected` wins over this checksummer's configured
    /// algorithm, so a peer using a different algorithm is still verified.
    pub fn verify(&self, data: &[u8], expected: &Checksum) -> bool {
        self.check(data, expected).is_ok()
    }

    /// Like [`verify`](Self::verify), reporting both values on mismatch.
    pub fn check(&self, data: &[u8], expected: &Checksum) -> Result<(), ChecksumError> {
        let computed = Self::new(expected.algorithm(), self.domain).compute(data);
        if computed == *expected {
            Ok(())
        } else {
            Err(ChecksumError::Mismatch {
                expected: *expected,
                computed,
            })
        }
    }
}

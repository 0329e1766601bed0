use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("framing error: {0}")]
    FramingError(String),

    #[error("frame checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    FrameChecksum { expected: u32, actual: u32 },

    #[error("frame tag {tag} does not match decoded {decoded}")]
    TagMismatch { tag: u8, decoded: u8 },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

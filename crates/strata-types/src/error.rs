use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid rank {rank} for rank count {rank_count}")]
    InvalidRank { rank: u32, rank_count: u32 },

    #[error("id slot space exhausted at counter {counter}")]
    IdSpaceExhausted { counter: u64 },

    #[error("unknown id class tag: {0}")]
    UnknownClass(u64),

    #[error("invalid hex string: {0}")]
    InvalidHex(String),

    #[error("invalid object id: {0}")]
    InvalidObjectId(String),
}

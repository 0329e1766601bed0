use strata_protocol::RemoteFailure;
use strata_types::{SequenceId, TypeError};
use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced by the request engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Allocation failed before anything was sent. Nothing to roll back.
    #[error("local resource exhausted: {0}")]
    LocalResource(String),

    /// Forwarding to the transport failed. The request is still tracked and
    /// must be released through the waiter.
    #[error("transport send failed for request {seq}: {reason}")]
    TransportSend { seq: SequenceId, reason: String },

    /// The transport failed while polling, blocking on, or cancelling a
    /// request that had been sent.
    #[error("transport failure for request {seq}: {reason}")]
    Transport { seq: SequenceId, reason: String },

    /// The service reported a failure for the request.
    #[error("remote operation {seq} failed: {failure}")]
    Remote {
        seq: SequenceId,
        failure: RemoteFailure,
    },

    /// A payload checksum did not verify.
    #[error("integrity check failed for request {seq}: {reason}")]
    Integrity { seq: SequenceId, reason: String },

    #[error("request {seq} was cancelled")]
    Cancelled { seq: SequenceId },

    /// A core invariant was violated by the caller or the engine itself.
    #[error("protocol misuse: {0}")]
    ProtocolMisuse(String),

    #[error("container '{0}' was opened without write intent")]
    ReadOnlyContainer(String),

    #[error("unknown {kind} handle {id}")]
    UnknownHandle { kind: &'static str, id: u64 },

    #[error("identity of object '{0}' could not be resolved")]
    UnresolvedIdentity(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("type error: {0}")]
    Types(#[from] TypeError),
}

impl EngineError {
    pub(crate) fn misuse(message: impl Into<String>) -> Self {
        Self::ProtocolMisuse(message.into())
    }
}

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

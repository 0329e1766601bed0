//! The transport seam between the engine and whatever moves requests to the
//! storage service.

use std::fmt;

use strata_protocol::{Envelope, ProtocolError, RemoteFailure, Reply};
use strata_types::SequenceId;
use thiserror::Error;

/// Terminal result of a request as reported by the service.
pub type Outcome = Result<Reply, RemoteFailure>;

/// Opaque handle to one in-flight request, owned by the request node until
/// it reaches a terminal state.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportHandle(u64);

impl TransportHandle {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransportHandle({})", self.0)
    }
}

/// Acknowledgement of a cancellation attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelAck {
    /// The service dropped the request before running it.
    Cancelled,
    /// The request had already run; its outcome is still collectable.
    AlreadyCompleted,
}

/// Errors raised by a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("send failed: {0}")]
    Send(String),

    /// No further progress is possible for the request.
    #[error("request {0} cannot make progress")]
    Stalled(SequenceId),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("unknown transport handle {0:?}")]
    UnknownHandle(TransportHandle),
}

/// Moves requests to the service and reports their outcomes.
///
/// The envelope carries the sequence ids of every parent; the service must
/// not start a request before those retire.
pub trait Transport {
    fn send(&mut self, envelope: &Envelope) -> Result<TransportHandle, TransportError>;

    /// Non-blocking check for an outcome.
    fn poll(&mut self, handle: TransportHandle) -> Result<Option<Outcome>, TransportError>;

    /// Block until the outcome is available.
    fn block(&mut self, handle: TransportHandle) -> Result<Outcome, TransportError>;

    fn cancel(&mut self, handle: TransportHandle) -> Result<CancelAck, TransportError>;

    /// Called once the engine no longer needs `handle`.
    fn release(&mut self, _handle: TransportHandle) {}
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, envelope: &Envelope) -> Result<TransportHandle, TransportError> {
        (**self).send(envelope)
    }

    fn poll(&mut self, handle: TransportHandle) -> Result<Option<Outcome>, TransportError> {
        (**self).poll(handle)
    }

    fn block(&mut self, handle: TransportHandle) -> Result<Outcome, TransportError> {
        (**self).block(handle)
    }

    fn cancel(&mut self, handle: TransportHandle) -> Result<CancelAck, TransportError> {
        (**self).cancel(handle)
    }

    fn release(&mut self, handle: TransportHandle) {
        (**self).release(handle)
    }
}

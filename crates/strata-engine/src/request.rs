//! Request nodes and the handles callers hold on them.

use std::fmt;

use strata_protocol::{codes, OpKind, RemoteFailure, Reply};
use strata_types::SequenceId;

use crate::container::{ContainerId, ObjectHandle};
use crate::error::EngineError;
use crate::list::{Link, ListRole};
use crate::read_context::ReadContextId;
use crate::runtime::EpochRef;
use crate::transport::TransportHandle;

/// Generation-checked key of a request node in the arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl fmt::Debug for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestKey({}v{})", self.index, self.generation)
    }
}

/// Lifecycle state of a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestState {
    Pending,
    Completed,
    Cancelled,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        self != Self::Pending
    }
}

/// Outcome of a request. Only set on the transition to a terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestStatus {
    Unknown,
    Succeeded,
    Failed,
    Cancelled,
}

/// Why a request did not succeed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Failure {
    /// Forwarding to the transport failed; the service never saw it.
    TransportSend(String),
    /// The transport failed while the request was in flight.
    TransportProgress(String),
    Remote(RemoteFailure),
    Integrity { reason: String },
    Cancelled,
}

impl Failure {
    /// Classify a failure reported by the service.
    pub fn from_remote(failure: RemoteFailure) -> Self {
        if failure.code == codes::INTEGRITY {
            Self::Integrity {
                reason: failure.message,
            }
        } else {
            Self::Remote(failure)
        }
    }

    pub(crate) fn into_error(self, seq: SequenceId) -> EngineError {
        match self {
            Self::TransportSend(reason) => EngineError::TransportSend { seq, reason },
            Self::TransportProgress(reason) => EngineError::Transport { seq, reason },
            Self::Remote(failure) => EngineError::Remote { seq, failure },
            Self::Integrity { reason } => EngineError::Integrity { seq, reason },
            Self::Cancelled => EngineError::Cancelled { seq },
        }
    }
}

/// Side effect applied when a request reaches a terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CompletionHook {
    None,
    /// Seed the container's id counters from the open reply.
    ContainerOpen(ContainerId),
    /// Record the remote identity of an opened object.
    ObjectOpen(ObjectHandle),
    /// Record the version the service granted.
    ReadContextAcquire(ReadContextId),
    /// Make a published read context visible.
    Publish(ReadContextId),
}

/// One outstanding or completed remote operation.
#[derive(Debug)]
pub(crate) struct Request {
    pub kind: OpKind,
    pub seq: SequenceId,
    pub state: RequestState,
    pub status: RequestStatus,
    pub transport: Option<TransportHandle>,
    /// Every structure pointing at this node holds one count.
    pub ref_count: u32,
    /// Counted references captured at submission, released at completion.
    pub parents: Vec<RequestKey>,
    pub container: ContainerId,
    /// Object whose "most recent operation" pointer may name this request.
    pub object: Option<ObjectHandle>,
    pub epoch: Option<EpochRef>,
    pub links: [Link; ListRole::COUNT],
    pub hook: CompletionHook,
    pub reply: Option<Reply>,
    pub failure: Option<Failure>,
}

impl Request {
    pub fn new(kind: OpKind, seq: SequenceId, container: ContainerId) -> Self {
        Self {
            kind,
            seq,
            state: RequestState::Pending,
            status: RequestStatus::Unknown,
            transport: None,
            ref_count: 1,
            parents: Vec::new(),
            container,
            object: None,
            epoch: None,
            links: [Link::default(); ListRole::COUNT],
            hook: CompletionHook::None,
            reply: None,
            failure: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state == RequestState::Pending
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn link(&self, role: ListRole) -> &Link {
        &self.links[role.index()]
    }

    pub fn completion(&self) -> Completion {
        Completion {
            seq: self.seq,
            kind: self.kind,
            state: self.state,
            status: self.status,
            reply: self.reply.clone(),
            failure: self.failure.clone(),
        }
    }
}

/// What a caller observes once its request is terminal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    pub seq: SequenceId,
    pub kind: OpKind,
    pub state: RequestState,
    pub status: RequestStatus,
    pub reply: Option<Reply>,
    pub failure: Option<Failure>,
}

impl Completion {
    pub fn succeeded(&self) -> bool {
        self.status == RequestStatus::Succeeded
    }

    /// The reply on success, or the error matching the failure.
    pub fn into_result(self) -> Result<Reply, EngineError> {
        match (self.status, self.failure) {
            (RequestStatus::Succeeded, _) => Ok(self.reply.unwrap_or(Reply::Ack)),
            (_, Some(failure)) => Err(failure.into_error(self.seq)),
            (status, None) => Err(EngineError::misuse(format!(
                "request {} ended {status:?} without a failure",
                self.seq
            ))),
        }
    }

    /// Payload bytes of a data reply.
    pub fn data(&self) -> Option<&[u8]> {
        match &self.reply {
            Some(Reply::Data { bytes, .. }) => Some(bytes),
            _ => None,
        }
    }
}

/// A counted reference usable as an explicit parent of a later submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Dependency {
    pub(crate) key: RequestKey,
    pub(crate) seq: SequenceId,
}

impl Dependency {
    pub fn seq(&self) -> SequenceId {
        self.seq
    }
}

/// The caller's reference to an asynchronously submitted request.
///
/// Holds one count on the node until the request is observed terminal
/// through the waiter, after which the completion is cached here and the
/// node is no longer touched.
#[derive(Debug)]
pub struct RequestHandle {
    pub(crate) key: RequestKey,
    pub(crate) seq: SequenceId,
    pub(crate) done: Option<Completion>,
}

impl RequestHandle {
    pub(crate) fn new(key: RequestKey, seq: SequenceId) -> Self {
        Self {
            key,
            seq,
            done: None,
        }
    }

    pub fn seq(&self) -> SequenceId {
        self.seq
    }

    /// Whether the caller's reference has already been released.
    pub fn is_released(&self) -> bool {
        self.done.is_some()
    }

    pub fn completion(&self) -> Option<&Completion> {
        self.done.as_ref()
    }

    /// Use this request as an explicit parent of another submission.
    pub fn dependency(&self) -> Dependency {
        Dependency {
            key: self.key,
            seq: self.seq,
        }
    }
}

//! Read contexts: immutable views of one container version.
//!
//! A context is either acquired from the service, built locally from a
//! version the caller already knows, or published by finishing a
//! transaction. Requests issued against a context whose version is not yet
//! visible wait behind the request that makes it visible.

use std::fmt;

use strata_protocol::{Operation, VersionRef};
use strata_types::Version;
use tracing::{debug, info};

use crate::container::{ContainerId, ObjectHandle};
use crate::dispatcher::{Dispatch, Submission, Submitted};
use crate::error::{EngineError, EngineResult};
use crate::list::{ListHead, ListRole};
use crate::request::{CompletionHook, RequestKey};
use crate::runtime::{EpochRef, Issued, Runtime};
use crate::transport::Transport;

/// Local handle of a read context.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReadContextId(u64);

impl ReadContextId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ReadContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReadContextId({})", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReadContextState {
    /// Waiting for the service to grant a version.
    Acquiring,
    /// Version known; the finishing transaction has not completed yet.
    AwaitingPublish,
    Acquired,
    Failed,
}

#[derive(Debug)]
pub(crate) struct ReadContext {
    pub container: ContainerId,
    pub version: Option<Version>,
    pub state: ReadContextState,
    /// Acquire or finish request. Counted.
    pub anchor: Option<RequestKey>,
    pub members: ListHead,
}

impl ReadContext {
    pub fn acquiring(container: ContainerId) -> Self {
        Self {
            container,
            version: None,
            state: ReadContextState::Acquiring,
            anchor: None,
            members: ListHead::new(),
        }
    }

    pub fn published(container: ContainerId, version: Version) -> Self {
        Self {
            version: Some(version),
            state: ReadContextState::AwaitingPublish,
            ..Self::acquiring(container)
        }
    }

    pub fn local(container: ContainerId, version: Version) -> Self {
        Self {
            version: Some(version),
            state: ReadContextState::Acquired,
            ..Self::acquiring(container)
        }
    }
}

impl<T: Transport> Runtime<T> {
    pub(crate) fn read_context(&self, id: ReadContextId) -> EngineResult<&ReadContext> {
        self.read_contexts.get(&id).ok_or(EngineError::UnknownHandle {
            kind: "read context",
            id: id.as_u64(),
        })
    }

    pub(crate) fn read_context_mut(&mut self, id: ReadContextId) -> EngineResult<&mut ReadContext> {
        self.read_contexts.get_mut(&id).ok_or(EngineError::UnknownHandle {
            kind: "read context",
            id: id.as_u64(),
        })
    }

    /// Ask the service for the oldest published version at or above
    /// `requested`.
    pub fn read_context_acquire(
        &mut self,
        container: ContainerId,
        requested: Version,
        mode: Dispatch,
    ) -> EngineResult<Issued<ReadContextId>> {
        self.container(container)?;
        let id = ReadContextId::new(self.next_local());
        self.read_contexts.insert(id, ReadContext::acquiring(container));

        let root = ObjectHandle::root(container);
        let parents = match self.resolve(root, None, false) {
            Ok(parents) => parents,
            Err(e) => {
                self.read_contexts.remove(&id);
                return Err(e);
            }
        };
        let sub = Submission::new(Operation::ReadContextAcquire { requested }, root)
            .parents_from(parents);
        let handle = match self.issue(sub, CompletionHook::ReadContextAcquire(id)) {
            Ok(handle) => handle,
            Err(e) => {
                self.read_contexts.remove(&id);
                return Err(e);
            }
        };
        self.arena.incr_ref(handle.key)?;
        self.read_context_mut(id)?.anchor = Some(handle.key);
        debug!(requested = %requested, "acquiring read context");

        match self.conclude(handle, mode) {
            Ok(request) => Ok(Issued { value: id, request }),
            Err(e) => {
                self.discard_read_context(id)?;
                Err(e)
            }
        }
    }

    /// A context on a version the caller already knows to be readable. No
    /// request is sent.
    pub fn read_context_from_version(
        &mut self,
        container: ContainerId,
        version: Version,
    ) -> EngineResult<ReadContextId> {
        self.container(container)?;
        let id = ReadContextId::new(self.next_local());
        self.read_contexts
            .insert(id, ReadContext::local(container, version));
        Ok(id)
    }

    pub fn read_context_state(&self, id: ReadContextId) -> EngineResult<ReadContextState> {
        Ok(self.read_context(id)?.state)
    }

    /// The context's version once it is readable, polling the request that
    /// makes it so. Never blocks.
    pub fn read_context_version(&mut self, id: ReadContextId) -> EngineResult<Option<Version>> {
        let rc = self.read_context(id)?;
        if let Some(anchor) = rc.anchor {
            if matches!(
                rc.state,
                ReadContextState::Acquiring | ReadContextState::AwaitingPublish
            ) && self.arena.is_pending(anchor)
            {
                self.poll_request(anchor)?;
            }
        }
        let rc = self.read_context(id)?;
        Ok(match rc.state {
            ReadContextState::Acquired => rc.version,
            _ => None,
        })
    }

    /// Release the context. Its members are drained first; the release
    /// waits behind any that are still pending.
    ///
    /// A context known to have failed to acquire is discarded locally and
    /// the acquire failure returned.
    pub fn read_context_release(&mut self, id: ReadContextId, mode: Dispatch) -> EngineResult<Submitted> {
        let version = match self.read_context_basis(id, mode) {
            Ok(version) => version,
            Err(e) => {
                self.discard_read_context(id)?;
                return Err(e);
            }
        };
        let cid = self.read_context(id)?.container;
        let mut parents = self.epoch_members(EpochRef::ReadContext(id), mode)?;
        if let Some(anchor) = self.read_context(id)?.anchor {
            if self.arena.is_pending(anchor) {
                parents.push(anchor);
            }
        }
        let root = ObjectHandle::root(cid);
        parents.extend(self.resolve(root, None, false)?);
        let sub = Submission::new(Operation::ReadContextRelease { version }, root)
            .parents_from(parents);
        let handle = self.issue(sub, CompletionHook::None)?;
        self.drain_epoch(EpochRef::ReadContext(id))?;
        self.discard_read_context(id)?;
        info!(version = %version, "read context released");
        self.conclude(handle, mode)
    }

    /// Ask the service to keep the context's version durable.
    pub fn read_context_persist(&mut self, id: ReadContextId, mode: Dispatch) -> EngineResult<Submitted> {
        let cid = self.read_context(id)?.container;
        let container = self.container(cid)?;
        if !container.writable() {
            return Err(EngineError::ReadOnlyContainer(container.name.clone()));
        }
        let version = self.read_context_basis(id, mode)?;
        let sub = Submission::new(Operation::ReadContextPersist { version }, ObjectHandle::root(cid))
            .in_epoch(EpochRef::ReadContext(id));
        let handle = self.issue(sub, CompletionHook::None)?;
        self.conclude(handle, mode)
    }

    /// Name the context's version so it can be opened later.
    pub fn read_context_snapshot(
        &mut self,
        id: ReadContextId,
        name: &str,
        mode: Dispatch,
    ) -> EngineResult<Submitted> {
        let cid = self.read_context(id)?.container;
        let version = self.read_context_basis(id, mode)?;
        let sub = Submission::new(
            Operation::ReadContextSnapshot {
                version,
                name: name.to_string(),
            },
            ObjectHandle::root(cid),
        )
        .in_epoch(EpochRef::ReadContext(id));
        let handle = self.issue(sub, CompletionHook::None)?;
        self.conclude(handle, mode)
    }

    /// The context's version, waiting for an acquire still in flight.
    fn read_context_resolve(&mut self, id: ReadContextId) -> EngineResult<Version> {
        let rc = self.read_context(id)?;
        if rc.version.is_none() && rc.state == ReadContextState::Acquiring {
            let anchor = rc
                .anchor
                .ok_or_else(|| EngineError::misuse("read context has no acquire request"))?;
            self.drive(anchor)?;
        }
        let rc = self.read_context(id)?;
        match (rc.state, rc.version) {
            (ReadContextState::Failed, _) | (_, None) => Err(self.read_context_failure(id)?),
            (_, Some(version)) => Ok(version),
        }
    }

    /// The context's version as requests name it. Never blocks: a context
    /// still acquiring is named by its acquire request, which every request
    /// against the context already waits behind.
    pub(crate) fn read_context_ref(&self, id: ReadContextId) -> EngineResult<VersionRef> {
        let rc = self.read_context(id)?;
        match (rc.state, rc.version, rc.anchor) {
            (ReadContextState::Failed, _, _) => Err(self.read_context_failure(id)?),
            (_, Some(version), _) => Ok(VersionRef::Known(version)),
            (_, None, Some(anchor)) if self.arena.is_pending(anchor) => {
                Ok(VersionRef::GrantedBy(self.arena.node(anchor)?.seq))
            }
            _ => Err(self.read_context_failure(id)?),
        }
    }

    /// Version for an operation on the context itself. Blocking calls wait
    /// for an acquire in flight so its failure is reported directly.
    pub(crate) fn read_context_basis(&mut self, id: ReadContextId, mode: Dispatch) -> EngineResult<VersionRef> {
        match mode {
            Dispatch::Blocking => self.read_context_resolve(id).map(VersionRef::Known),
            Dispatch::Async => self.read_context_ref(id),
        }
    }

    fn read_context_failure(&self, id: ReadContextId) -> EngineResult<EngineError> {
        let anchor = self
            .read_context(id)?
            .anchor
            .ok_or_else(|| EngineError::misuse("read context failed without a request"))?;
        let node = self.arena.node(anchor)?;
        Ok(match node.failure.clone() {
            Some(failure) => failure.into_error(node.seq),
            None => EngineError::misuse(format!(
                "read context request {} failed without a reason",
                node.seq
            )),
        })
    }

    /// Drop a context record together with its anchor reference and any
    /// members still linked.
    pub(crate) fn discard_read_context(&mut self, id: ReadContextId) -> EngineResult<()> {
        let Some(mut rc) = self.read_contexts.remove(&id) else {
            return Ok(());
        };
        for key in self.arena.keys(&rc.members, ListRole::Epoch) {
            self.arena.unlink(&mut rc.members, ListRole::Epoch, key)?;
        }
        if let Some(anchor) = rc.anchor.take() {
            self.arena.decr_ref(anchor)?;
        }
        Ok(())
    }
}

//! `submit_and_track`: the single path every request takes to the transport.

use strata_protocol::{Envelope, OpKind, Operation};
use strata_types::SequenceId;
use tracing::{debug, warn};

use crate::container::{Identity, ObjectHandle};
use crate::error::{EngineError, EngineResult};
use crate::list::ListRole;
use crate::request::{
    Completion, CompletionHook, Dependency, Failure, Request, RequestHandle, RequestKey,
};
use crate::runtime::{EpochRef, Runtime};
use crate::transport::Transport;

/// Whether a submission returns a handle or waits for the outcome.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Dispatch {
    #[default]
    Async,
    Blocking,
}

/// Result of a submission.
#[derive(Debug)]
pub enum Submitted {
    /// Async submission; release it through the waiter.
    Pending(RequestHandle),
    /// Blocking submission that succeeded. Failures are returned as errors.
    Complete(Completion),
}

impl Submitted {
    pub fn seq(&self) -> SequenceId {
        match self {
            Self::Pending(handle) => handle.seq(),
            Self::Complete(completion) => completion.seq,
        }
    }

    pub fn handle_mut(&mut self) -> Option<&mut RequestHandle> {
        match self {
            Self::Pending(handle) => Some(handle),
            Self::Complete(_) => None,
        }
    }

    pub fn into_handle(self) -> Option<RequestHandle> {
        match self {
            Self::Pending(handle) => Some(handle),
            Self::Complete(_) => None,
        }
    }

    pub fn completion(&self) -> Option<&Completion> {
        match self {
            Self::Pending(handle) => handle.completion(),
            Self::Complete(completion) => Some(completion),
        }
    }
}

/// Everything the dispatcher needs to issue one request.
#[derive(Debug)]
pub struct Submission {
    pub(crate) op: Operation,
    pub(crate) target: ObjectHandle,
    pub(crate) track: bool,
    pub(crate) parents: Vec<RequestKey>,
    pub(crate) resolved: bool,
    pub(crate) epoch: Option<EpochRef>,
    pub(crate) payload: Vec<u8>,
    pub(crate) needs_identity: bool,
}

impl Submission {
    /// A tracked submission against `target` with no epoch or payload.
    pub fn new(op: Operation, target: ObjectHandle) -> Self {
        Self {
            op,
            target,
            track: true,
            parents: Vec::new(),
            resolved: false,
            epoch: None,
            payload: Vec::new(),
            needs_identity: false,
        }
    }

    /// Do not link into the container list or update the object's most
    /// recent operation.
    pub fn untracked(mut self) -> Self {
        self.track = false;
        self
    }

    /// Add an explicit parent.
    pub fn after(mut self, dependency: Dependency) -> Self {
        self.parents.push(dependency.key);
        self
    }

    pub fn after_all(mut self, dependencies: impl IntoIterator<Item = Dependency>) -> Self {
        self.parents.extend(dependencies.into_iter().map(|d| d.key));
        self
    }

    pub fn in_epoch(mut self, epoch: EpochRef) -> Self {
        self.epoch = Some(epoch);
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// The target's remote identity must be known before sending; wait for
    /// it if needed.
    pub fn needs_identity(mut self) -> Self {
        self.needs_identity = true;
        self
    }

    /// Use `parents` as the complete parent set, skipping the resolver.
    pub(crate) fn parents_from(mut self, parents: Vec<RequestKey>) -> Self {
        self.parents.extend(parents);
        self.resolved = true;
        self
    }
}

/// Operations that keep local records in step and so have a dedicated entry.
fn dedicated_entry(kind: OpKind) -> Option<&'static str> {
    if kind == OpKind::ContainerCreate || kind == OpKind::ContainerOpen {
        Some("container_create/container_open")
    } else if kind == OpKind::ContainerClose {
        Some("container_close")
    } else if kind.is_create() || kind.is_open() {
        Some("object_create/object_open")
    } else if kind.is_close() {
        Some("object_close")
    } else if kind.is_epoch_control() {
        Some("the transaction and read context operations")
    } else {
        None
    }
}

impl<T: Transport> Runtime<T> {
    /// Submit a marshaled operation.
    ///
    /// The request's parents are the explicit ones plus whatever the
    /// resolver finds for the target and epoch. In [`Dispatch::Blocking`]
    /// mode this waits for the outcome and releases the request, returning
    /// any failure as an error. In [`Dispatch::Async`] mode the returned
    /// handle must be released through the waiter, even if sending failed.
    pub fn submit_and_track(
        &mut self,
        submission: Submission,
        mode: Dispatch,
    ) -> EngineResult<Submitted> {
        let kind = submission.op.kind();
        if let Some(entry) = dedicated_entry(kind) {
            return Err(EngineError::misuse(format!("{kind} must be issued through {entry}")));
        }
        let handle = self.issue(submission, CompletionHook::None)?;
        self.conclude(handle, mode)
    }

    /// Allocate, link and send one request. Errors returned here happen
    /// before anything is allocated; a send failure instead completes the
    /// request as failed.
    pub(crate) fn issue(
        &mut self,
        submission: Submission,
        hook: CompletionHook,
    ) -> EngineResult<RequestHandle> {
        let Submission {
            op,
            target,
            track,
            parents: explicit,
            resolved,
            epoch,
            payload,
            needs_identity,
        } = submission;
        let cid = target.container;
        let kind = op.kind();

        let container = self.container(cid)?;
        container.record(target.local)?;
        if kind.mutates() && kind != OpKind::ContainerCreate {
            if !container.writable() {
                return Err(EngineError::ReadOnlyContainer(container.name.clone()));
            }
            if !matches!(epoch, Some(EpochRef::Transaction(_))) {
                return Err(EngineError::misuse(format!(
                    "{kind} must be issued inside a transaction"
                )));
            }
        }
        let container_name = container.name.clone();
        self.check_epoch(cid, epoch)?;
        if payload.len() > self.config.max_payload_bytes {
            return Err(EngineError::LocalResource(format!(
                "payload of {} bytes exceeds the {} byte limit",
                payload.len(),
                self.config.max_payload_bytes
            )));
        }

        let mut parents: Vec<RequestKey> = Vec::new();
        for key in explicit {
            if self.arena.get(key).is_some() && !parents.contains(&key) {
                parents.push(key);
            }
        }
        if !resolved {
            for key in self.resolve(target, epoch, needs_identity)? {
                if !parents.contains(&key) {
                    parents.push(key);
                }
            }
        }
        if parents.len() > self.config.max_parents {
            return Err(EngineError::LocalResource(format!(
                "{} parents exceed the limit of {}",
                parents.len(),
                self.config.max_parents
            )));
        }
        let epoch_tag = self.epoch_tag(epoch)?;
        let parent_seqs = parents
            .iter()
            .map(|&key| self.arena.node(key).map(|node| node.seq))
            .collect::<EngineResult<Vec<_>>>()?;

        let seq = self
            .sequences
            .peek()
            .map_err(|e| EngineError::LocalResource(e.to_string()))?;
        let scope = self.config.checksum_scope;
        let checksum = scope
            .signs_requests()
            .then(|| self.request_checksums.compute(&payload));
        let envelope = Envelope {
            seq,
            rank: self.rank.rank(),
            container: container_name,
            epoch: epoch_tag,
            parents: parent_seqs,
            op,
            payload,
            checksum,
            store_checksum: scope.covers_storage(),
        };

        // Control ops on an epoch never become an object's most recent op.
        let object_level = !kind.is_epoch_control();
        let mut node = Request::new(kind, seq, cid);
        node.epoch = epoch;
        node.hook = hook;
        if object_level {
            node.object = Some(target);
        }
        let key = self.arena.insert(node)?;
        self.sequences
            .advance()
            .map_err(|e| EngineError::LocalResource(e.to_string()))?;

        for &parent in &parents {
            self.arena.incr_ref(parent)?;
        }
        self.arena.node_mut(key)?.parents = parents;

        if track {
            let container = self.containers.get_mut(&cid).ok_or(EngineError::UnknownHandle {
                kind: "container",
                id: cid.as_u64(),
            })?;
            self.arena.push_back(&mut container.list, ListRole::Container, key)?;
            if object_level {
                container.set_last_op(&mut self.arena, target.local, key)?;
            }
        }
        self.schedule.append(&mut self.arena, key)?;
        self.schedule.sweep(&mut self.arena)?;
        if let Some(epoch) = epoch {
            self.link_epoch(epoch, key)?;
        }
        match hook {
            CompletionHook::ContainerOpen(id) => {
                self.container_mut(id)?
                    .record_mut(ObjectHandle::ROOT)?
                    .identity = Identity::Pending(key);
            }
            CompletionHook::ObjectOpen(handle) => {
                self.container_mut(handle.container)?
                    .record_mut(handle.local)?
                    .identity = Identity::Pending(key);
            }
            _ => {}
        }

        debug!(
            seq = %seq,
            kind = %kind,
            parents = envelope.parents.len(),
            tracked = track,
            "submitting request"
        );
        match self.transport.send(&envelope) {
            Ok(handle) => self.arena.node_mut(key)?.transport = Some(handle),
            Err(e) => {
                warn!(seq = %seq, kind = %kind, error = %e, "transport send failed");
                self.complete_request(key, Err(Failure::TransportSend(e.to_string())))?;
            }
        }
        Ok(RequestHandle::new(key, seq))
    }

    /// Hand the request back to the caller, or wait for it in blocking mode.
    pub(crate) fn conclude(
        &mut self,
        mut handle: RequestHandle,
        mode: Dispatch,
    ) -> EngineResult<Submitted> {
        match mode {
            Dispatch::Async => Ok(Submitted::Pending(handle)),
            Dispatch::Blocking => {
                let completion = self.wait(&mut handle)?;
                completion.clone().into_result()?;
                Ok(Submitted::Complete(completion))
            }
        }
    }

    fn link_epoch(&mut self, epoch: EpochRef, key: RequestKey) -> EngineResult<()> {
        let members = match epoch {
            EpochRef::Transaction(id) => {
                &mut self
                    .transactions
                    .get_mut(&id)
                    .ok_or(EngineError::UnknownHandle {
                        kind: "transaction",
                        id: id.as_u64(),
                    })?
                    .members
            }
            EpochRef::ReadContext(id) => {
                &mut self
                    .read_contexts
                    .get_mut(&id)
                    .ok_or(EngineError::UnknownHandle {
                        kind: "read context",
                        id: id.as_u64(),
                    })?
                    .members
            }
        };
        self.arena.push_back(members, ListRole::Epoch, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContainerOptions, RuntimeConfig};
    use crate::container::ContainerId;
    use crate::loopback::{LoopbackService, LoopbackTransport};
    use crate::request::RequestStatus;

    fn setup() -> (LoopbackService, Runtime<LoopbackTransport>, ContainerId) {
        let service = LoopbackService::new();
        let mut rt = Runtime::new(RuntimeConfig::default(), service.transport(0)).unwrap();
        let c = rt
            .container_create("c0", ContainerOptions::default(), Dispatch::Blocking)
            .unwrap()
            .value;
        (service, rt, c)
    }

    fn read(rt: &Runtime<LoopbackTransport>, c: ContainerId) -> Submission {
        Submission::new(
            Operation::Access {
                kind: OpKind::LinkExists,
                target: None,
            },
            rt.root(c).unwrap(),
        )
    }

    #[test]
    fn dedicated_operations_are_rejected() {
        let (_service, mut rt, c) = setup();
        let sub = Submission::new(
            Operation::TransactionAbort {
                number: strata_types::Version::new(1),
            },
            rt.root(c).unwrap(),
        );
        assert!(matches!(
            rt.submit_and_track(sub, Dispatch::Async),
            Err(EngineError::ProtocolMisuse(_))
        ));
    }

    #[test]
    fn oversized_payload_fails_without_side_effects() {
        let (_service, mut rt, c) = setup();
        let before = rt.stats();
        let limit = rt.config().max_payload_bytes;
        let sub = read(&rt, c).with_payload(vec![0; limit + 1]);
        assert!(matches!(
            rt.submit_and_track(sub, Dispatch::Async),
            Err(EngineError::LocalResource(_))
        ));
        assert_eq!(rt.stats().allocated, before.allocated);
        assert!(rt.container_list(c).unwrap().is_empty());
    }

    #[test]
    fn mutation_outside_transaction_is_misuse() {
        let (_service, mut rt, c) = setup();
        let sub = Submission::new(
            Operation::Access {
                kind: OpKind::MapPut,
                target: None,
            },
            rt.root(c).unwrap(),
        );
        assert!(matches!(
            rt.submit_and_track(sub, Dispatch::Async),
            Err(EngineError::ProtocolMisuse(_))
        ));
    }

    #[test]
    fn async_submission_is_linked_everywhere() {
        let (_service, mut rt, c) = setup();
        let mut submitted = rt.submit_and_track(read(&rt, c), Dispatch::Async).unwrap();
        let handle = submitted.handle_mut().unwrap();
        let node = rt.arena.get(handle.key).unwrap();
        // caller, container list, root's most recent op, schedule
        assert_eq!(node.ref_count, 4);
        assert_eq!(rt.container_list(c).unwrap().len(), 1);

        let completion = rt.wait(handle).unwrap();
        assert_eq!(completion.status, RequestStatus::Succeeded);
        assert!(rt.container_list(c).unwrap().is_empty());
    }

    #[test]
    fn explicit_parent_is_forwarded() {
        let (service, mut rt, c) = setup();
        let mut first = rt.submit_and_track(read(&rt, c), Dispatch::Async).unwrap();
        let dep = first.handle_mut().unwrap().dependency();
        let second = rt
            .submit_and_track(read(&rt, c).untracked().after(dep), Dispatch::Blocking)
            .unwrap();
        let record = service
            .log()
            .into_iter()
            .find(|r| r.seq == second.seq())
            .unwrap();
        assert!(record.parents.contains(&dep.seq()));
        rt.wait(first.handle_mut().unwrap()).unwrap();
    }

    #[test]
    fn send_failure_still_tracks_request() {
        let (service, mut rt, c) = setup();
        service.fail_next_sends(1);
        let mut submitted = rt.submit_and_track(read(&rt, c), Dispatch::Async).unwrap();
        let handle = submitted.handle_mut().unwrap();
        assert_eq!(rt.request_status(handle).unwrap(), RequestStatus::Failed);
        assert_eq!(rt.arena.get(handle.key).unwrap().ref_count, 2);

        let completion = rt.wait(handle).unwrap();
        assert!(matches!(
            completion.into_result(),
            Err(EngineError::TransportSend { .. })
        ));
        rt.container_close(c).unwrap();
        assert_eq!(rt.stats().live_requests, 0);
    }
}

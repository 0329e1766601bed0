//! The engine context object.
//!
//! [`Runtime`] owns every piece of process-wide state: the request arena,
//! the global schedule, the sequence allocator, and the tables of open
//! containers, transactions and read contexts. Operations are spread over
//! several modules as `impl Runtime` blocks; this one holds construction,
//! accessors, completion side effects, and the container and object
//! lifecycle.

use std::collections::HashMap;

use serde::Serialize;
use strata_crypto::Checksummer;
use strata_protocol::{EpochTag, OpKind, Operation, Reply};
use strata_types::{ObjectClass, RankInfo, SequenceAllocator, SequenceId, Version};
use tracing::{debug, info};

use crate::arena::RequestArena;
use crate::config::{ContainerOptions, RuntimeConfig};
use crate::container::{Container, ContainerId, Identity, ObjectHandle, ObjectRecord};
use crate::dispatcher::{Dispatch, Submission, Submitted};
use crate::error::{EngineError, EngineResult};
use crate::list::ListHead;
use crate::read_context::{ReadContext, ReadContextId, ReadContextState};
use crate::request::{Completion, CompletionHook, Failure, RequestKey};
use crate::schedule::GlobalSchedule;
use crate::transaction::{Transaction, TransactionId, TransactionState};
use crate::transport::Transport;

/// The consistency basis of a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EpochRef {
    Transaction(TransactionId),
    ReadContext(ReadContextId),
}

/// A local handle together with the request that establishes it remotely.
#[derive(Debug)]
pub struct Issued<T> {
    pub value: T,
    pub request: Submitted,
}

impl<T> Issued<T> {
    pub fn into_parts(self) -> (T, Submitted) {
        (self.value, self.request)
    }
}

/// Snapshot of engine bookkeeping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RuntimeStats {
    pub live_requests: usize,
    pub allocated: u64,
    pub freed: u64,
    pub scheduled: usize,
    pub swept: u64,
    pub low_water_mark: SequenceId,
}

/// Client-side request engine for one rank.
pub struct Runtime<T: Transport> {
    pub(crate) config: RuntimeConfig,
    pub(crate) rank: RankInfo,
    pub(crate) transport: T,
    pub(crate) arena: RequestArena,
    pub(crate) schedule: GlobalSchedule,
    pub(crate) sequences: SequenceAllocator,
    pub(crate) containers: HashMap<ContainerId, Container>,
    pub(crate) transactions: HashMap<TransactionId, Transaction>,
    pub(crate) read_contexts: HashMap<ReadContextId, ReadContext>,
    pub(crate) request_checksums: Checksummer,
    pub(crate) reply_checksums: Checksummer,
    next_local: u64,
}

/// Id class minted for objects created by `kind`.
fn object_class(kind: OpKind) -> ObjectClass {
    match kind {
        OpKind::DatasetCreate | OpKind::DatasetOpen => ObjectClass::Array,
        OpKind::DatatypeCommit | OpKind::DatatypeOpen => ObjectClass::Blob,
        _ => ObjectClass::Kv,
    }
}

impl<T: Transport> Runtime<T> {
    pub fn new(config: RuntimeConfig, transport: T) -> EngineResult<Self> {
        let rank = config.validate()?;
        info!(
            rank = rank.rank(),
            rank_count = rank.rank_count(),
            checksum_scope = ?config.checksum_scope,
            "runtime started"
        );
        Ok(Self {
            rank,
            transport,
            arena: RequestArena::new(),
            schedule: GlobalSchedule::new(),
            sequences: SequenceAllocator::new(rank),
            containers: HashMap::new(),
            transactions: HashMap::new(),
            read_contexts: HashMap::new(),
            request_checksums: Checksummer::request(config.checksum_algorithm),
            reply_checksums: Checksummer::reply(config.checksum_algorithm),
            config,
            next_local: 1,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn rank(&self) -> RankInfo {
        self.rank
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            live_requests: self.arena.live(),
            allocated: self.arena.allocated(),
            freed: self.arena.freed(),
            scheduled: self.schedule.len(),
            swept: self.schedule.swept(),
            low_water_mark: self.schedule.low_water_mark(),
        }
    }

    /// Run a schedule sweep outside the usual trigger points.
    pub fn collect(&mut self) -> EngineResult<usize> {
        self.schedule.sweep(&mut self.arena)
    }

    pub(crate) fn next_local(&mut self) -> u64 {
        let id = self.next_local;
        self.next_local += 1;
        id
    }

    pub(crate) fn container(&self, id: ContainerId) -> EngineResult<&Container> {
        self.containers.get(&id).ok_or(EngineError::UnknownHandle {
            kind: "container",
            id: id.as_u64(),
        })
    }

    pub(crate) fn container_mut(&mut self, id: ContainerId) -> EngineResult<&mut Container> {
        self.containers.get_mut(&id).ok_or(EngineError::UnknownHandle {
            kind: "container",
            id: id.as_u64(),
        })
    }

    /// The root group of a container.
    pub fn root(&self, id: ContainerId) -> EngineResult<ObjectHandle> {
        self.container(id)?;
        Ok(ObjectHandle::root(id))
    }

    /// The container's list of outstanding tracked requests.
    pub fn container_list(&self, id: ContainerId) -> EngineResult<ListHead> {
        Ok(self.container(id)?.list)
    }

    /// Latest version the service reported when the container was opened.
    pub fn container_latest(&self, id: ContainerId) -> EngineResult<Version> {
        Ok(self.container(id)?.latest)
    }

    /// The counter the next id of `class` will be minted from.
    pub fn id_counter(&self, id: ContainerId, class: ObjectClass) -> EngineResult<u64> {
        Ok(self.container(id)?.ids.counter(class))
    }

    pub fn object_identity(&self, handle: ObjectHandle) -> EngineResult<Identity> {
        Ok(self.container(handle.container)?.record(handle.local)?.identity)
    }

    // ---------------------------------------------------------------
    // Epoch validation
    // ---------------------------------------------------------------

    pub(crate) fn check_epoch(
        &self,
        container: ContainerId,
        epoch: Option<EpochRef>,
    ) -> EngineResult<()> {
        match epoch {
            None => Ok(()),
            Some(EpochRef::Transaction(id)) => {
                let txn = self.transaction(id)?;
                if txn.container != container {
                    return Err(EngineError::misuse(format!(
                        "transaction {} belongs to another container",
                        txn.number
                    )));
                }
                if txn.state != TransactionState::Started {
                    return Err(EngineError::misuse(format!(
                        "transaction {} is {:?}, not started",
                        txn.number, txn.state
                    )));
                }
                Ok(())
            }
            Some(EpochRef::ReadContext(id)) => {
                let rc = self.read_context(id)?;
                if rc.container != container {
                    return Err(EngineError::misuse(
                        "read context belongs to another container",
                    ));
                }
                if rc.state == ReadContextState::Failed {
                    return Err(EngineError::misuse("read context failed to acquire"));
                }
                Ok(())
            }
        }
    }

    /// The pending-or-not request that makes `epoch` visible.
    pub(crate) fn epoch_anchor(&self, epoch: Option<EpochRef>) -> EngineResult<Option<RequestKey>> {
        Ok(match epoch {
            None => None,
            Some(EpochRef::Transaction(id)) => self.transaction(id)?.anchor,
            Some(EpochRef::ReadContext(id)) => self.read_context(id)?.anchor,
        })
    }

    /// Wire tag for `epoch`. A read context still being acquired is tagged
    /// by its acquire request rather than waited on.
    pub(crate) fn epoch_tag(&self, epoch: Option<EpochRef>) -> EngineResult<Option<EpochTag>> {
        Ok(match epoch {
            None => None,
            Some(EpochRef::Transaction(id)) => Some(EpochTag::Write(self.transaction(id)?.number)),
            Some(EpochRef::ReadContext(id)) => Some(EpochTag::Read(self.read_context_ref(id)?)),
        })
    }

    // ---------------------------------------------------------------
    // Completion side effects
    // ---------------------------------------------------------------

    pub(crate) fn verify_reply(&self, reply: Reply) -> Result<Reply, Failure> {
        if let Reply::Data {
            bytes,
            checksum: Some(expected),
        } = &reply
        {
            if self.config.checksum_scope.verifies_replies() {
                self.reply_checksums
                    .check(bytes, expected)
                    .map_err(|e| Failure::Integrity {
                        reason: e.to_string(),
                    })?;
            }
        }
        Ok(reply)
    }

    pub(crate) fn apply_hook(
        &mut self,
        hook: CompletionHook,
        result: &Result<Reply, Failure>,
    ) -> EngineResult<()> {
        match hook {
            CompletionHook::None => {}
            CompletionHook::ContainerOpen(id) => {
                if let Some(container) = self.containers.get_mut(&id) {
                    let identity = match result {
                        Ok(Reply::ContainerOpened { watermarks, latest }) => {
                            container.ids.seed(watermarks);
                            container.latest = *latest;
                            info!(container = %container.name, latest = %latest, "container opened");
                            Identity::Root
                        }
                        _ => Identity::Failed,
                    };
                    container.record_mut(ObjectHandle::ROOT)?.identity = identity;
                }
            }
            CompletionHook::ObjectOpen(handle) => {
                if let Some(container) = self.containers.get_mut(&handle.container) {
                    if let Some(record) = container.objects.get_mut(&handle.local) {
                        record.identity = match result {
                            Ok(Reply::ObjectOpened { id }) => Identity::Known(*id),
                            _ => Identity::Failed,
                        };
                    }
                }
            }
            CompletionHook::ReadContextAcquire(id) => {
                if let Some(rc) = self.read_contexts.get_mut(&id) {
                    match result {
                        Ok(Reply::Acquired { version }) => {
                            rc.version = Some(*version);
                            rc.state = ReadContextState::Acquired;
                            info!(version = %version, "read context acquired");
                        }
                        _ => rc.state = ReadContextState::Failed,
                    }
                }
            }
            CompletionHook::Publish(id) => {
                if let Some(rc) = self.read_contexts.get_mut(&id) {
                    rc.state = match result {
                        Ok(_) => ReadContextState::Acquired,
                        Err(_) => ReadContextState::Failed,
                    };
                }
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Container lifecycle
    // ---------------------------------------------------------------

    /// Create a new remote container. Ids minted in it start from zero.
    pub fn container_create(
        &mut self,
        name: &str,
        options: ContainerOptions,
        mode: Dispatch,
    ) -> EngineResult<Issued<ContainerId>> {
        if !options.writable() {
            return Err(EngineError::ReadOnlyContainer(name.to_string()));
        }
        let id = ContainerId::new(self.next_local());
        self.containers
            .insert(id, Container::new(name, options, self.rank, Identity::Root));
        info!(container = name, "creating container");
        let sub = Submission::new(
            Operation::ContainerCreate {
                name: name.to_string(),
            },
            ObjectHandle::root(id),
        );
        self.establish_container(id, sub, CompletionHook::None, mode)
    }

    /// Open an existing container. Its id counters are seeded from the
    /// watermarks in the reply, so the root's identity stays pending until
    /// then.
    pub fn container_open(
        &mut self,
        name: &str,
        options: ContainerOptions,
        mode: Dispatch,
    ) -> EngineResult<Issued<ContainerId>> {
        let id = ContainerId::new(self.next_local());
        self.containers
            .insert(id, Container::new(name, options, self.rank, Identity::Failed));
        info!(container = name, writable = options.writable(), "opening container");
        let sub = Submission::new(
            Operation::ContainerOpen {
                name: name.to_string(),
                writable: options.writable(),
            },
            ObjectHandle::root(id),
        );
        self.establish_container(id, sub, CompletionHook::ContainerOpen(id), mode)
    }

    fn establish_container(
        &mut self,
        id: ContainerId,
        sub: Submission,
        hook: CompletionHook,
        mode: Dispatch,
    ) -> EngineResult<Issued<ContainerId>> {
        let handle = match self.issue(sub, hook) {
            Ok(handle) => handle,
            Err(e) => {
                self.containers.remove(&id);
                return Err(e);
            }
        };
        match self.conclude(handle, mode) {
            Ok(request) => Ok(Issued { value: id, request }),
            Err(e) => {
                self.discard_container(id)?;
                Err(e)
            }
        }
    }

    /// Close a container: wait for every tracked request, then forward the
    /// close. Always synchronous.
    pub fn container_close(&mut self, id: ContainerId) -> EngineResult<Completion> {
        let name = self.container(id)?.name.clone();
        if self
            .transactions
            .values()
            .any(|t| t.container == id && t.state == TransactionState::Started)
        {
            return Err(EngineError::misuse(format!(
                "container '{name}' has transactions in progress"
            )));
        }
        if self.read_contexts.values().any(|rc| rc.container == id) {
            return Err(EngineError::misuse(format!(
                "container '{name}' still has read contexts held"
            )));
        }
        let done: Vec<TransactionId> = self
            .transactions
            .iter()
            .filter(|(_, t)| t.container == id)
            .map(|(tid, _)| *tid)
            .collect();
        for tid in done {
            self.transaction_close(tid)?;
        }

        self.wait_all(id)?;

        let container = self.container(id)?;
        let persist = container.writable() && container.options.persist_on_close;
        let watermarks = container.ids.maxima();
        let sub = Submission::new(
            Operation::ContainerClose {
                persist,
                watermarks,
            },
            ObjectHandle::root(id),
        )
        .parents_from(Vec::new());
        let handle = self.issue(sub, CompletionHook::None)?;
        let result = self.conclude(handle, Dispatch::Blocking);
        self.discard_container(id)?;
        info!(container = %name, persist, "container closed");
        match result? {
            Submitted::Complete(completion) => Ok(completion),
            Submitted::Pending(handle) => Err(EngineError::misuse(format!(
                "close request {} still pending after blocking wait",
                handle.seq()
            ))),
        }
    }

    /// Drop a container record and every object it still tracks.
    fn discard_container(&mut self, id: ContainerId) -> EngineResult<()> {
        let Some(mut container) = self.containers.remove(&id) else {
            return Ok(());
        };
        debug_assert!(container.list.is_empty());
        let locals: Vec<u64> = container.objects.keys().copied().collect();
        for local in locals {
            container.remove_object(&mut self.arena, local)?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Objects
    // ---------------------------------------------------------------

    /// Create an object under `parent` inside transaction `txn`.
    ///
    /// The id is minted locally from the container's counter for the
    /// object's class; only the parent's identity must be known, and the
    /// call waits for it if the parent's open is still in flight.
    pub fn object_create(
        &mut self,
        parent: ObjectHandle,
        kind: OpKind,
        name: &str,
        txn: TransactionId,
        mode: Dispatch,
    ) -> EngineResult<Issued<ObjectHandle>> {
        if !kind.is_create() || kind == OpKind::ContainerCreate {
            return Err(EngineError::misuse(format!("{kind} does not create an object")));
        }
        let cid = parent.container;
        let container = self.container(cid)?;
        if !container.writable() {
            return Err(EngineError::ReadOnlyContainer(container.name.clone()));
        }
        let close_kind = kind
            .close_kind()
            .ok_or_else(|| EngineError::misuse(format!("{kind} has no matching close")))?;
        let epoch = EpochRef::Transaction(txn);
        self.check_epoch(cid, Some(epoch))?;

        let parents = self.resolve(parent, Some(epoch), true)?;
        let container = self.container_mut(cid)?;
        let parent_id = container
            .record(parent.local)?
            .identity
            .resolved()
            .ok_or_else(|| EngineError::UnresolvedIdentity(name.to_string()))?;
        let class = object_class(kind);
        let id = container
            .ids
            .allocate(class)
            .map_err(|e| EngineError::LocalResource(e.to_string()))?;
        let local = container.add_object(ObjectRecord {
            name: name.to_string(),
            class,
            close_kind,
            parent: Some(parent.local),
            identity: Identity::Known(id),
            last_op: None,
        });
        let handle = ObjectHandle {
            container: cid,
            local,
        };
        debug!(object = name, id = %id, "minted object id");

        let sub = Submission::new(
            Operation::ObjectCreate {
                kind,
                parent: parent_id,
                id,
                name: name.to_string(),
            },
            handle,
        )
        .in_epoch(epoch)
        .parents_from(parents);
        self.establish_object(handle, sub, CompletionHook::None, mode)
    }

    /// Open an existing object by name. Its identity becomes known when the
    /// reply arrives.
    pub fn object_open(
        &mut self,
        parent: ObjectHandle,
        kind: OpKind,
        name: &str,
        epoch: Option<EpochRef>,
        mode: Dispatch,
    ) -> EngineResult<Issued<ObjectHandle>> {
        if !kind.is_open() || kind == OpKind::ContainerOpen {
            return Err(EngineError::misuse(format!("{kind} does not open an object")));
        }
        let close_kind = kind
            .close_kind()
            .ok_or_else(|| EngineError::misuse(format!("{kind} has no matching close")))?;
        let cid = parent.container;
        self.check_epoch(cid, epoch)?;

        let parents = self.resolve(parent, epoch, true)?;
        let container = self.container_mut(cid)?;
        let parent_id = container
            .record(parent.local)?
            .identity
            .resolved()
            .ok_or_else(|| EngineError::UnresolvedIdentity(name.to_string()))?;
        let local = container.add_object(ObjectRecord {
            name: name.to_string(),
            class: object_class(kind),
            close_kind,
            parent: Some(parent.local),
            identity: Identity::Failed,
            last_op: None,
        });
        let handle = ObjectHandle {
            container: cid,
            local,
        };

        let mut sub = Submission::new(
            Operation::ObjectOpen {
                kind,
                parent: parent_id,
                name: name.to_string(),
            },
            handle,
        )
        .parents_from(parents);
        if let Some(epoch) = epoch {
            sub = sub.in_epoch(epoch);
        }
        self.establish_object(handle, sub, CompletionHook::ObjectOpen(handle), mode)
    }

    fn establish_object(
        &mut self,
        handle: ObjectHandle,
        sub: Submission,
        hook: CompletionHook,
        mode: Dispatch,
    ) -> EngineResult<Issued<ObjectHandle>> {
        let request = match self.issue(sub, hook) {
            Ok(request) => request,
            Err(e) => {
                self.drop_object(handle)?;
                return Err(e);
            }
        };
        match self.conclude(request, mode) {
            Ok(request) => Ok(Issued {
                value: handle,
                request,
            }),
            Err(e) => {
                self.drop_object(handle)?;
                Err(e)
            }
        }
    }

    /// Close an object: wait for its outstanding requests, then forward the
    /// close and forget the handle.
    pub fn object_close(&mut self, handle: ObjectHandle, mode: Dispatch) -> EngineResult<Submitted> {
        if handle.is_root() {
            return Err(EngineError::misuse("the root group closes with its container"));
        }
        self.wait_some(handle.container, handle)?;
        let record = self.container(handle.container)?.record(handle.local)?;
        let kind = record.close_kind;
        let Some(id) = record.identity.resolved() else {
            let name = record.name.clone();
            self.drop_object(handle)?;
            return Err(EngineError::UnresolvedIdentity(name));
        };
        let parents = self.resolve(handle, None, false)?;
        let sub = Submission::new(Operation::ObjectClose { kind, id }, handle).parents_from(parents);
        let request = self.issue(sub, CompletionHook::None)?;
        self.drop_object(handle)?;
        self.conclude(request, mode)
    }

    /// Issue a marshaled operation against an open object.
    ///
    /// Mutating kinds must run inside a started transaction; reads may use a
    /// read context or no epoch at all.
    pub fn object_op(
        &mut self,
        target: ObjectHandle,
        kind: OpKind,
        epoch: Option<EpochRef>,
        payload: Vec<u8>,
        mode: Dispatch,
    ) -> EngineResult<Submitted> {
        if kind.is_create() || kind.is_open() || kind.is_close() || kind.is_epoch_control() {
            return Err(EngineError::misuse(format!(
                "{kind} has a dedicated operation"
            )));
        }
        let cid = target.container;
        self.check_epoch(cid, epoch)?;
        let parents = self.resolve(target, epoch, true)?;
        let record = self.container(cid)?.record(target.local)?;
        let id = record
            .identity
            .resolved()
            .ok_or_else(|| EngineError::UnresolvedIdentity(record.name.clone()))?;
        let mut sub = Submission::new(Operation::Access { kind, target: id }, target)
            .with_payload(payload)
            .parents_from(parents);
        if let Some(epoch) = epoch {
            sub = sub.in_epoch(epoch);
        }
        let request = self.issue(sub, CompletionHook::None)?;
        self.conclude(request, mode)
    }

    pub(crate) fn drop_object(&mut self, handle: ObjectHandle) -> EngineResult<()> {
        if let Some(container) = self.containers.get_mut(&handle.container) {
            container.remove_object(&mut self.arena, handle.local)?;
        }
        Ok(())
    }
}

//! Write epochs.
//!
//! A transaction moves through `Created -> Started -> Finished | Aborted`.
//! Its start request is the anchor every request inside it waits behind.
//! Finishing or aborting drains the member list: a blocking call waits for
//! each member locally, an asynchronous one makes every still-pending
//! member an explicit parent of the finish request instead. The list is
//! only emptied once the finish or abort request has been issued.

use std::fmt;
use std::mem;

use strata_protocol::Operation;
use strata_types::Version;
use tracing::{debug, info};

use crate::container::{ContainerId, ObjectHandle};
use crate::dispatcher::{Dispatch, Submission, Submitted};
use crate::error::{EngineError, EngineResult};
use crate::list::{ListHead, ListRole};
use crate::read_context::{ReadContext, ReadContextId};
use crate::request::{CompletionHook, RequestKey};
use crate::runtime::{EpochRef, Issued, Runtime};
use crate::transport::Transport;

/// Local handle of a transaction.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(u64);

impl TransactionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({})", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransactionState {
    Created,
    Started,
    Finished,
    Aborted,
}

#[derive(Debug)]
pub(crate) struct Transaction {
    pub container: ContainerId,
    pub number: Version,
    pub state: TransactionState,
    /// The start request. Counted.
    pub anchor: Option<RequestKey>,
    pub members: ListHead,
    pub base: Option<ReadContextId>,
    /// Transactions whose finish must be observed before this one's.
    pub dependencies: Vec<Version>,
    /// Later finishes that depend on this one wait behind it while it is
    /// pending. Not counted: once reclaimed the key goes stale and reads as
    /// retired.
    pub finish_request: Option<RequestKey>,
}

impl<T: Transport> Runtime<T> {
    pub(crate) fn transaction(&self, id: TransactionId) -> EngineResult<&Transaction> {
        self.transactions.get(&id).ok_or(EngineError::UnknownHandle {
            kind: "transaction",
            id: id.as_u64(),
        })
    }

    pub(crate) fn transaction_mut(&mut self, id: TransactionId) -> EngineResult<&mut Transaction> {
        self.transactions.get_mut(&id).ok_or(EngineError::UnknownHandle {
            kind: "transaction",
            id: id.as_u64(),
        })
    }

    /// Create a transaction locally. Nothing is sent until it is started.
    pub fn transaction_create(
        &mut self,
        container: ContainerId,
        number: Version,
    ) -> EngineResult<TransactionId> {
        let c = self.container(container)?;
        if !c.writable() {
            return Err(EngineError::ReadOnlyContainer(c.name.clone()));
        }
        let id = TransactionId::new(self.next_local());
        self.transactions.insert(
            id,
            Transaction {
                container,
                number,
                state: TransactionState::Created,
                anchor: None,
                members: ListHead::new(),
                base: None,
                dependencies: Vec::new(),
                finish_request: None,
            },
        );
        Ok(id)
    }

    pub fn transaction_state(&self, id: TransactionId) -> EngineResult<TransactionState> {
        Ok(self.transaction(id)?.state)
    }

    pub fn transaction_number(&self, id: TransactionId) -> EngineResult<Version> {
        Ok(self.transaction(id)?.number)
    }

    /// Requests currently linked in the transaction's member list.
    pub fn transaction_members(&self, id: TransactionId) -> EngineResult<usize> {
        Ok(self.transaction(id)?.members.len())
    }

    /// Start the transaction, optionally based on a read context.
    ///
    /// The number must exceed every number already started or skipped in
    /// this container.
    pub fn transaction_start(
        &mut self,
        id: TransactionId,
        base: Option<ReadContextId>,
        mode: Dispatch,
    ) -> EngineResult<Submitted> {
        let txn = self.transaction(id)?;
        let (cid, number) = (txn.container, txn.number);
        if txn.state != TransactionState::Created {
            return Err(EngineError::misuse(format!(
                "transaction {number} is already {:?}",
                txn.state
            )));
        }
        if let Some(last) = self.container(cid)?.last_txn {
            if number <= last {
                return Err(EngineError::misuse(format!(
                    "transaction number {number} is not above {last}"
                )));
            }
        }

        let mut parents = Vec::new();
        let base_version = match base {
            Some(rc) => {
                if self.read_context(rc)?.container != cid {
                    return Err(EngineError::misuse("base read context belongs to another container"));
                }
                let version = self.read_context_basis(rc, mode)?;
                if let Some(anchor) = self.read_context(rc)?.anchor {
                    if self.arena.is_pending(anchor) {
                        parents.push(anchor);
                    }
                }
                Some(version)
            }
            None => None,
        };
        let root = ObjectHandle::root(cid);
        parents.extend(self.resolve(root, None, false)?);
        let sub = Submission::new(
            Operation::TransactionStart {
                number,
                base: base_version,
            },
            root,
        )
        .parents_from(parents);
        let handle = self.issue(sub, CompletionHook::None)?;

        self.arena.incr_ref(handle.key)?;
        let txn = self.transaction_mut(id)?;
        txn.anchor = Some(handle.key);
        txn.state = TransactionState::Started;
        txn.base = base;
        self.container_mut(cid)?.last_txn = Some(number);
        info!(number = %number, base = ?base_version, "transaction started");

        match self.conclude(handle, mode) {
            Ok(submitted) => Ok(submitted),
            Err(e) => {
                self.release_anchor(id)?;
                self.transaction_mut(id)?.state = TransactionState::Aborted;
                Err(e)
            }
        }
    }

    /// Record that this transaction's finish must not be observed before
    /// transaction `other` has finished.
    pub fn transaction_set_dependency(&mut self, id: TransactionId, other: Version) -> EngineResult<()> {
        let txn = self.transaction_mut(id)?;
        if !matches!(txn.state, TransactionState::Created | TransactionState::Started) {
            return Err(EngineError::misuse(format!(
                "transaction {} is already {:?}",
                txn.number, txn.state
            )));
        }
        if other == txn.number {
            return Err(EngineError::misuse("a transaction cannot depend on itself"));
        }
        if !txn.dependencies.contains(&other) {
            txn.dependencies.push(other);
        }
        Ok(())
    }

    /// Finish the transaction, forwarding this rank's id maxima for the
    /// service-side reduction.
    ///
    /// With `publish`, the returned read context has the transaction's
    /// number as its version. It becomes visible only once the finish
    /// completes; requests issued against it meanwhile wait behind the
    /// finish.
    pub fn transaction_finish(
        &mut self,
        id: TransactionId,
        publish: bool,
        mode: Dispatch,
    ) -> EngineResult<Issued<Option<ReadContextId>>> {
        let txn = self.transaction(id)?;
        let (cid, number) = (txn.container, txn.number);
        if txn.state != TransactionState::Started {
            return Err(EngineError::misuse(format!(
                "transaction {number} is {:?}, not started",
                txn.state
            )));
        }

        let mut parents = self.epoch_members(EpochRef::Transaction(id), mode)?;
        let txn = self.transaction(id)?;
        if let Some(anchor) = txn.anchor {
            if self.arena.is_pending(anchor) {
                parents.push(anchor);
            }
        }
        let depends_on = txn.dependencies.clone();
        for other in &depends_on {
            let finish = self
                .transactions
                .values()
                .find(|t| t.container == cid && t.number == *other)
                .and_then(|t| t.finish_request);
            if let Some(key) = finish {
                if self.arena.is_pending(key) {
                    parents.push(key);
                }
            }
        }
        let root = ObjectHandle::root(cid);
        parents.extend(self.resolve(root, None, false)?);
        let watermarks = self.container(cid)?.ids.maxima();

        let rc = if publish {
            let rc = ReadContextId::new(self.next_local());
            self.read_contexts.insert(rc, ReadContext::published(cid, number));
            Some(rc)
        } else {
            None
        };
        let hook = rc.map_or(CompletionHook::None, CompletionHook::Publish);
        let sub = Submission::new(
            Operation::TransactionFinish {
                number,
                publish,
                watermarks,
                depends_on,
            },
            root,
        )
        .parents_from(parents);
        let handle = match self.issue(sub, hook) {
            Ok(handle) => handle,
            Err(e) => {
                if let Some(rc) = rc {
                    self.read_contexts.remove(&rc);
                }
                return Err(e);
            }
        };
        self.drain_epoch(EpochRef::Transaction(id))?;

        if let Some(rc) = rc {
            self.arena.incr_ref(handle.key)?;
            self.read_context_mut(rc)?.anchor = Some(handle.key);
        }
        self.transaction_mut(id)?.finish_request = Some(handle.key);
        self.release_anchor(id)?;
        self.transaction_mut(id)?.state = TransactionState::Finished;
        info!(number = %number, publish, "transaction finished");

        match self.conclude(handle, mode) {
            Ok(request) => Ok(Issued { value: rc, request }),
            Err(e) => {
                if let Some(rc) = rc {
                    self.discard_read_context(rc)?;
                }
                Err(e)
            }
        }
    }

    /// Reserve `count` consecutive version numbers starting at `start`
    /// without any content.
    pub fn transaction_skip(
        &mut self,
        container: ContainerId,
        start: Version,
        count: u64,
        mode: Dispatch,
    ) -> EngineResult<Submitted> {
        if count == 0 {
            return Err(EngineError::misuse("skip count must be positive"));
        }
        let c = self.container(container)?;
        if !c.writable() {
            return Err(EngineError::ReadOnlyContainer(c.name.clone()));
        }
        if let Some(last) = c.last_txn {
            if start <= last {
                return Err(EngineError::misuse(format!(
                    "skip start {start} is not above {last}"
                )));
            }
        }
        let root = ObjectHandle::root(container);
        let parents = self.resolve(root, None, false)?;
        let sub = Submission::new(Operation::TransactionSkip { start, count }, root)
            .parents_from(parents);
        let handle = self.issue(sub, CompletionHook::None)?;
        self.container_mut(container)?.last_txn = Some(start.advance(count - 1));
        debug!(start = %start, count, "skipped versions");
        self.conclude(handle, mode)
    }

    /// Abort the transaction. Members are drained exactly as by finish; no
    /// read context is ever published.
    pub fn transaction_abort(&mut self, id: TransactionId, mode: Dispatch) -> EngineResult<Submitted> {
        let txn = self.transaction(id)?;
        let (cid, number) = (txn.container, txn.number);
        if txn.state != TransactionState::Started {
            return Err(EngineError::misuse(format!(
                "transaction {number} is {:?}, not started",
                txn.state
            )));
        }
        let mut parents = self.epoch_members(EpochRef::Transaction(id), mode)?;
        if let Some(anchor) = self.transaction(id)?.anchor {
            if self.arena.is_pending(anchor) {
                parents.push(anchor);
            }
        }
        let root = ObjectHandle::root(cid);
        parents.extend(self.resolve(root, None, false)?);
        let sub = Submission::new(Operation::TransactionAbort { number }, root).parents_from(parents);
        let handle = self.issue(sub, CompletionHook::None)?;
        self.drain_epoch(EpochRef::Transaction(id))?;
        self.release_anchor(id)?;
        self.transaction_mut(id)?.state = TransactionState::Aborted;
        info!(number = %number, "transaction aborted");
        self.conclude(handle, mode)
    }

    /// Forget a transaction that is not in progress.
    pub fn transaction_close(&mut self, id: TransactionId) -> EngineResult<()> {
        if self.transaction(id)?.state == TransactionState::Started {
            return Err(EngineError::misuse("finish or abort the transaction before closing it"));
        }
        self.release_anchor(id)?;
        if let Some(txn) = self.transactions.remove(&id) {
            debug_assert!(txn.members.is_empty());
        }
        Ok(())
    }

    fn release_anchor(&mut self, id: TransactionId) -> EngineResult<()> {
        if let Some(anchor) = self.transaction_mut(id)?.anchor.take() {
            self.arena.decr_ref(anchor)?;
        }
        Ok(())
    }

    /// Settle an epoch's members ahead of the request that closes it.
    ///
    /// Blocking mode waits for every member; async mode returns the members
    /// still pending so the caller can make them explicit parents. The list
    /// itself is left alone.
    pub(crate) fn epoch_members(&mut self, epoch: EpochRef, mode: Dispatch) -> EngineResult<Vec<RequestKey>> {
        let list = match epoch {
            EpochRef::Transaction(id) => self.transaction(id)?.members,
            EpochRef::ReadContext(id) => self.read_context(id)?.members,
        };
        let keys = self.arena.keys(&list, ListRole::Epoch);
        match mode {
            Dispatch::Blocking => {
                for &key in &keys {
                    self.drive(key)?;
                }
                Ok(Vec::new())
            }
            Dispatch::Async => Ok(keys.into_iter().filter(|&k| self.arena.is_pending(k)).collect()),
        }
    }

    /// Empty an epoch's member list, releasing the list's references.
    pub(crate) fn drain_epoch(&mut self, epoch: EpochRef) -> EngineResult<()> {
        let mut list = match epoch {
            EpochRef::Transaction(id) => mem::take(&mut self.transaction_mut(id)?.members),
            EpochRef::ReadContext(id) => mem::take(&mut self.read_context_mut(id)?.members),
        };
        let keys = self.arena.keys(&list, ListRole::Epoch);
        for &key in &keys {
            self.arena.unlink(&mut list, ListRole::Epoch, key)?;
        }
        debug_assert!(list.is_empty());
        debug!(?epoch, drained = keys.len(), "drained epoch");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use strata_protocol::OpKind;

    use super::*;
    use crate::config::{ContainerOptions, RuntimeConfig};
    use crate::loopback::{LoopbackService, LoopbackTransport};
    use crate::read_context::ReadContextState;

    fn setup() -> (LoopbackService, Runtime<LoopbackTransport>, ContainerId) {
        let service = LoopbackService::new();
        let mut rt = Runtime::new(RuntimeConfig::default(), service.transport(0)).unwrap();
        let c = rt
            .container_create("c0", ContainerOptions::default(), Dispatch::Blocking)
            .unwrap()
            .value;
        (service, rt, c)
    }

    #[test]
    fn numbers_must_increase() {
        let (_service, mut rt, c) = setup();
        let t2 = rt.transaction_create(c, Version::new(2)).unwrap();
        rt.transaction_start(t2, None, Dispatch::Blocking).unwrap();
        let t1 = rt.transaction_create(c, Version::new(1)).unwrap();
        assert!(matches!(
            rt.transaction_start(t1, None, Dispatch::Blocking),
            Err(EngineError::ProtocolMisuse(_))
        ));
        assert!(matches!(
            rt.transaction_start(t2, None, Dispatch::Blocking),
            Err(EngineError::ProtocolMisuse(_))
        ));
    }

    #[test]
    fn skip_reserves_numbers() {
        let (_service, mut rt, c) = setup();
        rt.transaction_skip(c, Version::new(1), 3, Dispatch::Blocking).unwrap();
        let t = rt.transaction_create(c, Version::new(3)).unwrap();
        assert!(rt.transaction_start(t, None, Dispatch::Blocking).is_err());
        let t = rt.transaction_create(c, Version::new(4)).unwrap();
        rt.transaction_start(t, None, Dispatch::Blocking).unwrap();
        assert!(rt.transaction_skip(c, Version::new(2), 0, Dispatch::Blocking).is_err());
    }

    #[test]
    fn async_finish_makes_members_parents() {
        let (service, mut rt, c) = setup();
        let root = rt.root(c).unwrap();
        let t = rt.transaction_create(c, Version::new(1)).unwrap();
        rt.transaction_start(t, None, Dispatch::Blocking).unwrap();
        let epoch = Some(EpochRef::Transaction(t));
        let mut writes: Vec<_> = (0..2)
            .map(|i| {
                rt.object_op(root, OpKind::AttributeWrite, epoch, vec![i], Dispatch::Async)
                    .unwrap()
                    .into_handle()
                    .unwrap()
            })
            .collect();
        assert_eq!(rt.transaction_members(t).unwrap(), 2);

        let finish = rt.transaction_finish(t, false, Dispatch::Async).unwrap();
        assert_eq!(rt.transaction_members(t).unwrap(), 0);
        assert_eq!(rt.transaction_state(t).unwrap(), TransactionState::Finished);
        let mut fh = finish.request.into_handle().unwrap();
        rt.wait(&mut fh).unwrap();

        let log = service.log();
        let finish_record = log.iter().find(|r| r.seq == fh.seq()).unwrap();
        for w in &writes {
            assert!(finish_record.parents.contains(&w.seq()));
        }
        for w in &mut writes {
            rt.wait(w).unwrap();
        }
    }

    #[test]
    fn abort_drains_and_never_publishes() {
        let (service, mut rt, c) = setup();
        let root = rt.root(c).unwrap();
        let t = rt.transaction_create(c, Version::new(1)).unwrap();
        rt.transaction_start(t, None, Dispatch::Blocking).unwrap();
        rt.object_op(
            root,
            OpKind::MapPut,
            Some(EpochRef::Transaction(t)),
            vec![1],
            Dispatch::Blocking,
        )
        .unwrap();
        rt.transaction_abort(t, Dispatch::Blocking).unwrap();
        assert_eq!(rt.transaction_state(t).unwrap(), TransactionState::Aborted);
        assert_eq!(service.published_versions("c0"), vec![Version::INITIAL]);
        assert!(rt.transaction_abort(t, Dispatch::Blocking).is_err());
        rt.transaction_close(t).unwrap();
        rt.container_close(c).unwrap();
        assert_eq!(rt.stats().live_requests, 0);
    }

    #[test]
    fn dependency_orders_finishes() {
        let (service, mut rt, c) = setup();
        let t1 = rt.transaction_create(c, Version::new(1)).unwrap();
        let t2 = rt.transaction_create(c, Version::new(2)).unwrap();
        rt.transaction_start(t1, None, Dispatch::Blocking).unwrap();
        rt.transaction_start(t2, None, Dispatch::Blocking).unwrap();
        rt.transaction_set_dependency(t2, Version::new(1)).unwrap();
        assert!(rt.transaction_set_dependency(t2, Version::new(2)).is_err());

        let f1 = rt.transaction_finish(t1, false, Dispatch::Async).unwrap();
        let f2 = rt.transaction_finish(t2, true, Dispatch::Blocking).unwrap();
        let rc = f2.value.unwrap();
        assert_eq!(rt.read_context_state(rc).unwrap(), ReadContextState::Acquired);

        let mut h1 = f1.request.into_handle().unwrap();
        rt.wait(&mut h1).unwrap();
        assert!(service.executed_before(h1.seq(), f2.request.seq()));
        rt.read_context_release(rc, Dispatch::Blocking).unwrap();
    }

    #[test]
    fn finished_transaction_does_not_hold_back_collection() {
        let (_service, mut rt, c) = setup();
        let root = rt.root(c).unwrap();
        let t = rt.transaction_create(c, Version::new(1)).unwrap();
        rt.transaction_start(t, None, Dispatch::Blocking).unwrap();
        rt.transaction_finish(t, false, Dispatch::Blocking).unwrap();
        assert_eq!(rt.transaction_state(t).unwrap(), TransactionState::Finished);

        let before = rt.stats().low_water_mark;
        for _ in 0..20 {
            rt.object_op(root, OpKind::LinkExists, None, vec![], Dispatch::Blocking)
                .unwrap();
        }
        let stats = rt.stats();
        assert!(stats.low_water_mark > before);
        assert_eq!(stats.scheduled, 0);
        assert_eq!(stats.live_requests, 0);

        rt.transaction_close(t).unwrap();
        rt.container_close(c).unwrap();
        assert_eq!(rt.stats().allocated, rt.stats().freed);
    }

    #[test]
    fn failed_async_finish_keeps_members() {
        let service = LoopbackService::new();
        let config = RuntimeConfig {
            max_parents: 1,
            ..RuntimeConfig::default()
        };
        let mut rt = Runtime::new(config, service.transport(0)).unwrap();
        let c = rt
            .container_create("c0", ContainerOptions::default(), Dispatch::Blocking)
            .unwrap()
            .value;
        let root = rt.root(c).unwrap();
        let t = rt.transaction_create(c, Version::new(1)).unwrap();
        service.hold_kind(OpKind::TransactionStart, 3);
        let mut start = rt
            .transaction_start(t, None, Dispatch::Async)
            .unwrap()
            .into_handle()
            .unwrap();
        let mut write = rt
            .object_op(root, OpKind::AttributeWrite, Some(EpochRef::Transaction(t)), vec![1], Dispatch::Async)
            .unwrap()
            .into_handle()
            .unwrap();
        assert_eq!(rt.transaction_members(t).unwrap(), 1);

        // The write and the pending start both become parents.
        assert!(matches!(
            rt.transaction_finish(t, false, Dispatch::Async),
            Err(EngineError::LocalResource(_))
        ));
        assert_eq!(rt.transaction_members(t).unwrap(), 1);
        assert_eq!(rt.transaction_state(t).unwrap(), TransactionState::Started);

        rt.wait(&mut start).unwrap();
        rt.wait(&mut write).unwrap();
        let finish = rt.transaction_finish(t, false, Dispatch::Blocking).unwrap();
        assert_eq!(rt.transaction_members(t).unwrap(), 0);
        assert!(service.executed_before(write.seq(), finish.request.seq()));

        rt.transaction_close(t).unwrap();
        rt.container_close(c).unwrap();
        assert_eq!(rt.stats().live_requests, 0);
    }

    #[test]
    fn mutations_need_started_transaction() {
        let (_service, mut rt, c) = setup();
        let root = rt.root(c).unwrap();
        let t = rt.transaction_create(c, Version::new(1)).unwrap();
        assert!(matches!(
            rt.object_create(root, OpKind::GroupCreate, "g", t, Dispatch::Blocking),
            Err(EngineError::ProtocolMisuse(_))
        ));
        assert!(rt.transaction_finish(t, false, Dispatch::Blocking).is_err());
    }
}

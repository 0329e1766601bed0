//! In-memory storage service.
//!
//! [`LoopbackService`] executes requests the way a remote service would:
//! a request never starts before every parent it names has retired, a
//! request whose parent failed fails with `PARENT_FAILED`, and a
//! transaction finish waits for the finishes it depends on. Execution
//! happens in rounds driven by the transports' `poll` and `block` calls.
//! Readiness within a round is judged on the state at the start of the
//! round, so a chain of N dependent requests takes N rounds.
//!
//! Every request, completion and cancellation crosses the boundary as a
//! [`StrataCodec`] frame. Several [`LoopbackTransport`]s, one per rank, may
//! share one service.
//!
//! Fault injection (failed sends, one-shot remote failures, held requests,
//! corrupted replies) and an execution log make it the harness for engine
//! tests and the CLI simulator.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use strata_crypto::{ChecksumAlgorithm, Checksummer};
use strata_protocol::{
    codes, EpochTag, Envelope, Frame, OpKind, Operation, ProtocolError, RemoteFailure, Reply,
    StrataCodec, VersionRef,
};
use strata_types::{IdWatermarks, ObjectId, SequenceId, Version};
use tracing::{debug, trace};

use crate::transport::{CancelAck, Outcome, Transport, TransportError, TransportHandle};

/// One request the service ran, in execution order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionRecord {
    pub seq: SequenceId,
    pub rank: u32,
    pub kind: OpKind,
    pub parents: Vec<SequenceId>,
    /// Position in the global execution order.
    pub tick: u64,
}

struct Queued {
    envelope: Envelope,
    /// Rounds to sit out before becoming eligible.
    hold: u32,
}

enum Readiness {
    Run,
    Wait,
    ParentFailed(SequenceId),
}

struct ContainerState {
    watermarks: IdWatermarks,
    published: BTreeSet<Version>,
    latest: Version,
    persisted: BTreeSet<Version>,
    snapshots: BTreeMap<String, Version>,
    names: HashMap<(Option<ObjectId>, String), ObjectId>,
    data: HashMap<Option<ObjectId>, Vec<u8>>,
    /// Started transactions and the ranks that have not finished them yet.
    open_txns: BTreeMap<Version, BTreeSet<u32>>,
    done_txns: BTreeSet<Version>,
}

impl ContainerState {
    fn new() -> Self {
        Self {
            watermarks: IdWatermarks::default(),
            published: BTreeSet::from([Version::INITIAL]),
            latest: Version::INITIAL,
            persisted: BTreeSet::new(),
            snapshots: BTreeMap::new(),
            names: HashMap::new(),
            data: HashMap::new(),
            open_txns: BTreeMap::new(),
            done_txns: BTreeSet::new(),
        }
    }

    fn publish(&mut self, version: Version) {
        self.published.insert(version);
        self.latest = self.latest.max(version);
    }

    fn close_txn(&mut self, number: Version, rank: u32) -> bool {
        let Some(ranks) = self.open_txns.get_mut(&number) else {
            return false;
        };
        if !ranks.remove(&rank) {
            return false;
        }
        if ranks.is_empty() {
            self.open_txns.remove(&number);
            self.done_txns.insert(number);
        }
        true
    }
}

struct ServiceState {
    queue: Vec<Queued>,
    /// Outcomes not yet collected by the owning transport.
    outcomes: HashMap<SequenceId, Outcome>,
    retired: HashSet<SequenceId>,
    failed: HashSet<SequenceId>,
    /// Versions granted by successful acquires, by acquire sequence id.
    granted: HashMap<SequenceId, Version>,
    containers: HashMap<String, ContainerState>,
    log: Vec<ExecutionRecord>,
    tick: u64,
    fail_sends: u32,
    fail_kinds: HashMap<OpKind, RemoteFailure>,
    holds: HashMap<OpKind, u32>,
    corrupt_replies: bool,
    rng: Option<StdRng>,
    request_checksums: Checksummer,
    reply_checksums: Checksummer,
}

impl ServiceState {
    fn new(rng: Option<StdRng>) -> Self {
        Self {
            queue: Vec::new(),
            outcomes: HashMap::new(),
            retired: HashSet::new(),
            failed: HashSet::new(),
            granted: HashMap::new(),
            containers: HashMap::new(),
            log: Vec::new(),
            tick: 0,
            fail_sends: 0,
            fail_kinds: HashMap::new(),
            holds: HashMap::new(),
            corrupt_replies: false,
            rng,
            request_checksums: Checksummer::request(ChecksumAlgorithm::default()),
            reply_checksums: Checksummer::reply(ChecksumAlgorithm::default()),
        }
    }

    fn is_queued(&self, seq: SequenceId) -> bool {
        self.queue.iter().any(|q| q.envelope.seq == seq)
    }

    fn readiness(&self, envelope: &Envelope) -> Readiness {
        for parent in &envelope.parents {
            if self.failed.contains(parent) {
                return Readiness::ParentFailed(*parent);
            }
            if self.is_queued(*parent) {
                return Readiness::Wait;
            }
        }
        if let Operation::TransactionFinish { depends_on, .. } = &envelope.op {
            if let Some(container) = self.containers.get(&envelope.container) {
                if depends_on.iter().any(|v| container.open_txns.contains_key(v)) {
                    return Readiness::Wait;
                }
            }
        }
        Readiness::Run
    }

    /// Run one round. Returns whether anything changed.
    fn round(&mut self) -> bool {
        let mut order: Vec<usize> = (0..self.queue.len()).collect();
        if let Some(rng) = self.rng.as_mut() {
            order.shuffle(rng);
        }
        let mut progress = false;
        let mut runnable = Vec::new();
        for i in order {
            if self.queue[i].hold > 0 {
                self.queue[i].hold -= 1;
                progress = true;
                continue;
            }
            match self.readiness(&self.queue[i].envelope) {
                Readiness::Wait => {}
                verdict => runnable.push((self.queue[i].envelope.seq, verdict)),
            }
        }
        for (seq, verdict) in runnable {
            let Some(pos) = self.queue.iter().position(|q| q.envelope.seq == seq) else {
                continue;
            };
            let envelope = self.queue.remove(pos).envelope;
            let outcome = match verdict {
                Readiness::ParentFailed(parent) => Err(RemoteFailure::new(
                    codes::PARENT_FAILED,
                    format!("parent {parent} failed"),
                )),
                _ => self.execute(&envelope),
            };
            self.finish(seq, outcome);
            progress = true;
        }
        progress
    }

    fn finish(&mut self, seq: SequenceId, outcome: Outcome) {
        if let Ok(Reply::Acquired { version }) = &outcome {
            self.granted.insert(seq, *version);
        }
        if outcome.is_ok() {
            self.retired.insert(seq);
        } else {
            self.failed.insert(seq);
        }
        self.outcomes.insert(seq, outcome);
    }

    fn execute(&mut self, envelope: &Envelope) -> Outcome {
        let kind = envelope.op.kind();
        self.log.push(ExecutionRecord {
            seq: envelope.seq,
            rank: envelope.rank,
            kind,
            parents: envelope.parents.clone(),
            tick: self.tick,
        });
        self.tick += 1;
        trace!(seq = %envelope.seq, kind = %kind, rank = envelope.rank, "executing");

        if let Some(expected) = &envelope.checksum {
            self.request_checksums
                .check(&envelope.payload, expected)
                .map_err(|e| RemoteFailure::new(codes::INTEGRITY, e.to_string()))?;
        }
        if let Some(failure) = self.fail_kinds.remove(&kind) {
            return Err(failure);
        }

        match &envelope.op {
            Operation::ContainerCreate { name } => {
                if self.containers.contains_key(name) {
                    return Err(RemoteFailure::new(
                        codes::CONFLICT,
                        format!("container '{name}' exists"),
                    ));
                }
                self.containers.insert(name.clone(), ContainerState::new());
                Ok(Reply::Ack)
            }
            Operation::ContainerOpen { name, .. } => {
                let container = self.containers.get(name).ok_or_else(|| {
                    RemoteFailure::new(codes::NOT_FOUND, format!("no container '{name}'"))
                })?;
                Ok(Reply::ContainerOpened {
                    watermarks: container.watermarks,
                    latest: container.latest,
                })
            }
            op => {
                let reply_checksums = self.reply_checksums;
                let corrupt = self.corrupt_replies;
                let container = self.containers.get_mut(&envelope.container).ok_or_else(|| {
                    RemoteFailure::new(
                        codes::NOT_FOUND,
                        format!("no container '{}'", envelope.container),
                    )
                })?;
                apply(container, &self.granted, envelope, op, reply_checksums, corrupt)
            }
        }
    }
}

/// Execute an operation against an existing container.
fn apply(
    container: &mut ContainerState,
    granted: &HashMap<SequenceId, Version>,
    envelope: &Envelope,
    op: &Operation,
    reply_checksums: Checksummer,
    corrupt: bool,
) -> Outcome {
    let unavailable =
        |v: &Version| RemoteFailure::new(codes::VERSION_UNAVAILABLE, format!("version {v} is not published"));
    let lookup = |v: &VersionRef| match v {
        VersionRef::Known(version) => Ok(*version),
        VersionRef::GrantedBy(seq) => granted.get(seq).copied().ok_or_else(|| {
            RemoteFailure::new(codes::NOT_FOUND, format!("acquire {seq} granted no version"))
        }),
    };
    match op {
        Operation::ContainerCreate { .. } | Operation::ContainerOpen { .. } => Ok(Reply::Ack),
        Operation::ContainerClose {
            persist,
            watermarks,
        } => {
            container.watermarks.merge(watermarks);
            if *persist {
                container.persisted.insert(container.latest);
            }
            Ok(Reply::Ack)
        }
        Operation::ObjectCreate {
            parent, id, name, ..
        } => {
            let key = (*parent, name.clone());
            if container.names.contains_key(&key) {
                return Err(RemoteFailure::new(
                    codes::CONFLICT,
                    format!("object '{name}' exists"),
                ));
            }
            container.names.insert(key, *id);
            Ok(Reply::Ack)
        }
        Operation::ObjectOpen { parent, name, .. } => container
            .names
            .get(&(*parent, name.clone()))
            .map(|id| Reply::ObjectOpened { id: *id })
            .ok_or_else(|| RemoteFailure::new(codes::NOT_FOUND, format!("no object '{name}'"))),
        Operation::ObjectClose { .. } => Ok(Reply::Ack),
        Operation::Access { kind, target } => {
            if kind.mutates() && !matches!(envelope.epoch, Some(EpochTag::Write(_))) {
                return Err(RemoteFailure::new(
                    codes::READ_ONLY,
                    format!("{kind} outside a transaction"),
                ));
            }
            match kind {
                OpKind::DatasetWrite | OpKind::AttributeWrite | OpKind::MapPut => {
                    container.data.insert(*target, envelope.payload.clone());
                    Ok(Reply::Ack)
                }
                OpKind::AttributeRemove | OpKind::MapDelete => {
                    container.data.remove(target);
                    Ok(Reply::Ack)
                }
                OpKind::DatasetRead | OpKind::AttributeRead | OpKind::MapGet => {
                    let mut bytes = container.data.get(target).cloned().unwrap_or_default();
                    let checksum = Some(reply_checksums.compute(&bytes));
                    if corrupt {
                        match bytes.first_mut() {
                            Some(b) => *b ^= 0xff,
                            None => bytes.push(0xff),
                        }
                    }
                    Ok(Reply::Data { bytes, checksum })
                }
                _ => Ok(Reply::Ack),
            }
        }
        Operation::TransactionStart { number, base } => {
            if container.done_txns.contains(number) {
                return Err(RemoteFailure::new(
                    codes::CONFLICT,
                    format!("transaction {number} already finished"),
                ));
            }
            if let Some(base) = base {
                let base = lookup(base)?;
                if !container.published.contains(&base) {
                    return Err(unavailable(&base));
                }
            }
            let ranks = container.open_txns.entry(*number).or_default();
            if !ranks.insert(envelope.rank) {
                return Err(RemoteFailure::new(
                    codes::CONFLICT,
                    format!("transaction {number} already started"),
                ));
            }
            Ok(Reply::Ack)
        }
        Operation::TransactionFinish {
            number,
            publish,
            watermarks,
            ..
        } => {
            if !container.close_txn(*number, envelope.rank) {
                return Err(RemoteFailure::new(
                    codes::NOT_FOUND,
                    format!("transaction {number} is not open"),
                ));
            }
            container.watermarks.merge(watermarks);
            if *publish {
                container.publish(*number);
            }
            Ok(Reply::Ack)
        }
        Operation::TransactionSkip { start, count } => {
            for i in 0..*count {
                container.done_txns.insert(start.advance(i));
            }
            Ok(Reply::Ack)
        }
        Operation::TransactionAbort { number } => {
            if !container.close_txn(*number, envelope.rank) {
                return Err(RemoteFailure::new(
                    codes::NOT_FOUND,
                    format!("transaction {number} is not open"),
                ));
            }
            Ok(Reply::Ack)
        }
        Operation::ReadContextAcquire { requested } => container
            .published
            .range(*requested..)
            .next()
            .map(|v| Reply::Acquired { version: *v })
            .ok_or_else(|| unavailable(requested)),
        Operation::ReadContextRelease { .. } => Ok(Reply::Ack),
        Operation::ReadContextPersist { version } => {
            let version = lookup(version)?;
            if !container.published.contains(&version) {
                return Err(unavailable(&version));
            }
            container.persisted.insert(version);
            Ok(Reply::Ack)
        }
        Operation::ReadContextSnapshot { version, name } => {
            let version = lookup(version)?;
            if !container.published.contains(&version) {
                return Err(unavailable(&version));
            }
            if container.snapshots.contains_key(name) {
                return Err(RemoteFailure::new(
                    codes::CONFLICT,
                    format!("snapshot '{name}' exists"),
                ));
            }
            container.snapshots.insert(name.clone(), version);
            Ok(Reply::Ack)
        }
    }
}

/// Shared in-memory service. Cloning yields another reference to the same
/// service.
#[derive(Clone)]
pub struct LoopbackService {
    inner: Arc<Mutex<ServiceState>>,
}

impl Default for LoopbackService {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackService {
    /// Requests become eligible in submission order.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ServiceState::new(None))),
        }
    }

    /// Eligible requests run in an order shuffled by a generator seeded
    /// with `seed`.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ServiceState::new(Some(StdRng::seed_from_u64(seed))))),
        }
    }

    fn state(&self) -> MutexGuard<'_, ServiceState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A transport for the process with `rank`.
    pub fn transport(&self, rank: u32) -> LoopbackTransport {
        LoopbackTransport {
            service: self.clone(),
            rank,
        }
    }

    // ---------------------------------------------------------------
    // Fault injection
    // ---------------------------------------------------------------

    /// Reject the next `count` sends at the transport.
    pub fn fail_next_sends(&self, count: u32) {
        self.state().fail_sends = count;
    }

    /// Fail the next executed request of `kind` with `failure`.
    pub fn fail_kind(&self, kind: OpKind, failure: RemoteFailure) {
        self.state().fail_kinds.insert(kind, failure);
    }

    /// Keep the next submitted request of `kind` out of execution for
    /// `rounds` rounds.
    pub fn hold_kind(&self, kind: OpKind, rounds: u32) {
        self.state().holds.insert(kind, rounds);
    }

    /// Flip reply bytes after their checksum is computed.
    pub fn corrupt_replies(&self, enabled: bool) {
        self.state().corrupt_replies = enabled;
    }

    /// Run rounds until nothing changes. Returns the number of rounds that
    /// made progress.
    pub fn run_until_idle(&self) -> usize {
        let mut state = self.state();
        let mut rounds = 0;
        while state.round() {
            rounds += 1;
        }
        rounds
    }

    // ---------------------------------------------------------------
    // Inspection
    // ---------------------------------------------------------------

    pub fn log(&self) -> Vec<ExecutionRecord> {
        self.state().log.clone()
    }

    /// Whether both requests ran and `first` ran before `second`.
    pub fn executed_before(&self, first: SequenceId, second: SequenceId) -> bool {
        let state = self.state();
        let tick = |seq: SequenceId| state.log.iter().find(|r| r.seq == seq).map(|r| r.tick);
        matches!((tick(first), tick(second)), (Some(a), Some(b)) if a < b)
    }

    pub fn is_retired(&self, seq: SequenceId) -> bool {
        self.state().retired.contains(&seq)
    }

    pub fn queued(&self) -> usize {
        self.state().queue.len()
    }

    pub fn published_versions(&self, container: &str) -> Vec<Version> {
        self.state()
            .containers
            .get(container)
            .map(|c| c.published.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Id watermarks reduced from every finish and close so far.
    pub fn watermarks(&self, container: &str) -> IdWatermarks {
        self.state()
            .containers
            .get(container)
            .map(|c| c.watermarks)
            .unwrap_or_default()
    }

    pub fn persisted(&self, container: &str) -> Vec<Version> {
        self.state()
            .containers
            .get(container)
            .map(|c| c.persisted.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn snapshots(&self, container: &str) -> Vec<(String, Version)> {
        self.state()
            .containers
            .get(container)
            .map(|c| c.snapshots.iter().map(|(n, v)| (n.clone(), *v)).collect())
            .unwrap_or_default()
    }

    // ---------------------------------------------------------------
    // Frame handling
    // ---------------------------------------------------------------

    fn submit(&self, bytes: &[u8]) -> Result<TransportHandle, TransportError> {
        let mut state = self.state();
        if state.fail_sends > 0 {
            state.fail_sends -= 1;
            return Err(TransportError::Send("injected send failure".into()));
        }
        let envelope = match StrataCodec::decode(bytes)?.0 {
            Frame::Submit(envelope) => envelope,
            other => return Err(ProtocolError::InvalidFrameType(other.type_tag()).into()),
        };
        let hold = state.holds.remove(&envelope.op.kind()).unwrap_or(0);
        let handle = TransportHandle::new(envelope.seq.as_u64());
        trace!(seq = %envelope.seq, parents = envelope.parents.len(), hold, "queued");
        state.queue.push(Queued { envelope, hold });
        Ok(handle)
    }

    fn collect(state: &ServiceState, seq: SequenceId) -> Result<Option<Vec<u8>>, TransportError> {
        match state.outcomes.get(&seq) {
            Some(result) => Ok(Some(StrataCodec::encode(&Frame::Complete {
                seq,
                result: result.clone(),
            })?)),
            None => Ok(None),
        }
    }

    fn poll(&self, seq: SequenceId) -> Result<Option<Vec<u8>>, TransportError> {
        let mut state = self.state();
        if let Some(frame) = Self::collect(&state, seq)? {
            return Ok(Some(frame));
        }
        if !state.is_queued(seq) {
            return Err(TransportError::UnknownHandle(TransportHandle::new(seq.as_u64())));
        }
        state.round();
        Self::collect(&state, seq)
    }

    fn block(&self, seq: SequenceId) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state();
        loop {
            if let Some(frame) = Self::collect(&state, seq)? {
                return Ok(frame);
            }
            if !state.is_queued(seq) {
                return Err(TransportError::UnknownHandle(TransportHandle::new(seq.as_u64())));
            }
            if !state.round() {
                debug!(seq = %seq, queued = state.queue.len(), "no request can make progress");
                return Err(TransportError::Stalled(seq));
            }
        }
    }

    fn cancel(&self, bytes: &[u8]) -> Result<Vec<u8>, TransportError> {
        let seq = match StrataCodec::decode(bytes)?.0 {
            Frame::Cancel { seq } => seq,
            other => return Err(ProtocolError::InvalidFrameType(other.type_tag()).into()),
        };
        let mut state = self.state();
        let already_completed = if state.outcomes.contains_key(&seq) {
            true
        } else if let Some(pos) = state.queue.iter().position(|q| q.envelope.seq == seq) {
            state.queue.remove(pos);
            state.finish(
                seq,
                Err(RemoteFailure::new(codes::CANCELLED, "cancelled before execution")),
            );
            false
        } else {
            return Err(TransportError::UnknownHandle(TransportHandle::new(seq.as_u64())));
        };
        Ok(StrataCodec::encode(&Frame::CancelAck {
            seq,
            already_completed,
        })?)
    }

    fn release(&self, seq: SequenceId) {
        self.state().outcomes.remove(&seq);
    }
}

/// One rank's connection to a [`LoopbackService`].
#[derive(Clone)]
pub struct LoopbackTransport {
    service: LoopbackService,
    rank: u32,
}

impl LoopbackTransport {
    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn service(&self) -> &LoopbackService {
        &self.service
    }
}

fn outcome_of(bytes: &[u8]) -> Result<Outcome, TransportError> {
    match StrataCodec::decode(bytes)?.0 {
        Frame::Complete { result, .. } => Ok(result),
        other => Err(ProtocolError::InvalidFrameType(other.type_tag()).into()),
    }
}

impl Transport for LoopbackTransport {
    fn send(&mut self, envelope: &Envelope) -> Result<TransportHandle, TransportError> {
        let bytes = StrataCodec::encode(&Frame::Submit(envelope.clone()))?;
        self.service.submit(&bytes)
    }

    fn poll(&mut self, handle: TransportHandle) -> Result<Option<Outcome>, TransportError> {
        self.service
            .poll(SequenceId::new(handle.as_u64()))?
            .map(|bytes| outcome_of(&bytes))
            .transpose()
    }

    fn block(&mut self, handle: TransportHandle) -> Result<Outcome, TransportError> {
        outcome_of(&self.service.block(SequenceId::new(handle.as_u64()))?)
    }

    fn cancel(&mut self, handle: TransportHandle) -> Result<CancelAck, TransportError> {
        let seq = SequenceId::new(handle.as_u64());
        let bytes = self.service.cancel(&StrataCodec::encode(&Frame::Cancel { seq })?)?;
        match StrataCodec::decode(&bytes)?.0 {
            Frame::CancelAck {
                already_completed: true,
                ..
            } => Ok(CancelAck::AlreadyCompleted),
            Frame::CancelAck { .. } => Ok(CancelAck::Cancelled),
            other => Err(ProtocolError::InvalidFrameType(other.type_tag()).into()),
        }
    }

    fn release(&mut self, handle: TransportHandle) {
        self.service.release(SequenceId::new(handle.as_u64()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(seq: u64, parents: &[u64], op: Operation) -> Envelope {
        Envelope {
            seq: SequenceId::new(seq),
            rank: 0,
            container: "c0".into(),
            epoch: None,
            parents: parents.iter().copied().map(SequenceId::new).collect(),
            op,
            payload: Vec::new(),
            checksum: None,
            store_checksum: false,
        }
    }

    fn create() -> Operation {
        Operation::ContainerCreate { name: "c0".into() }
    }

    fn link_exists() -> Operation {
        Operation::Access {
            kind: OpKind::LinkExists,
            target: None,
        }
    }

    #[test]
    fn parents_retire_first() {
        let service = LoopbackService::new();
        let mut t = service.transport(0);
        t.send(&envelope(1, &[], create())).unwrap();
        let child = t.send(&envelope(3, &[2], link_exists())).unwrap();
        t.send(&envelope(2, &[1], link_exists())).unwrap();
        assert!(t.block(child).unwrap().is_ok());
        let order: Vec<u64> = service.log().iter().map(|r| r.seq.as_u64()).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn failed_parent_propagates() {
        let service = LoopbackService::new();
        let mut t = service.transport(0);
        let open = t
            .send(&envelope(
                1,
                &[],
                Operation::ContainerOpen {
                    name: "nope".into(),
                    writable: true,
                },
            ))
            .unwrap();
        let child = t.send(&envelope(2, &[1], link_exists())).unwrap();
        assert_eq!(t.block(open).unwrap().unwrap_err().code, codes::NOT_FOUND);
        assert_eq!(t.block(child).unwrap().unwrap_err().code, codes::PARENT_FAILED);
        assert_eq!(service.log().len(), 1);
    }

    #[test]
    fn unsatisfiable_wait_stalls() {
        let service = LoopbackService::new();
        let mut t = service.transport(0);
        t.send(&envelope(1, &[], create())).unwrap();
        service.run_until_idle();
        let start = t
            .send(&envelope(
                2,
                &[],
                Operation::TransactionStart {
                    number: Version::new(1),
                    base: None,
                },
            ))
            .unwrap();
        assert!(t.block(start).unwrap().is_ok());
        let finish = t
            .send(&envelope(
                3,
                &[],
                Operation::TransactionFinish {
                    number: Version::new(2),
                    publish: false,
                    watermarks: IdWatermarks::default(),
                    depends_on: vec![Version::new(1)],
                },
            ))
            .unwrap();
        assert!(matches!(t.block(finish), Err(TransportError::Stalled(_))));
    }

    #[test]
    fn cancel_and_release() {
        let service = LoopbackService::new();
        let mut t = service.transport(0);
        service.hold_kind(OpKind::ContainerCreate, 1);
        let h = t.send(&envelope(1, &[], create())).unwrap();
        assert_eq!(t.cancel(h).unwrap(), CancelAck::Cancelled);
        assert_eq!(t.cancel(h).unwrap(), CancelAck::AlreadyCompleted);
        assert_eq!(t.poll(h).unwrap().unwrap().unwrap_err().code, codes::CANCELLED);
        t.release(h);
        assert!(matches!(t.poll(h), Err(TransportError::UnknownHandle(_))));
        assert!(service.log().is_empty());
    }

    #[test]
    fn send_failure_injection() {
        let service = LoopbackService::new();
        let mut t = service.transport(0);
        service.fail_next_sends(1);
        assert!(matches!(t.send(&envelope(1, &[], create())), Err(TransportError::Send(_))));
        assert!(t.send(&envelope(2, &[], create())).is_ok());
        assert_eq!(service.queued(), 1);
    }

    #[test]
    fn acquire_picks_oldest_published_at_or_above() {
        let service = LoopbackService::new();
        let mut t = service.transport(0);
        t.send(&envelope(1, &[], create())).unwrap();
        for (seq, number) in [(2, 3), (3, 5)] {
            let start = Operation::TransactionStart {
                number: Version::new(number),
                base: None,
            };
            let finish = Operation::TransactionFinish {
                number: Version::new(number),
                publish: true,
                watermarks: IdWatermarks::default(),
                depends_on: vec![],
            };
            t.send(&envelope(seq * 10, &[], start)).unwrap();
            t.send(&envelope(seq * 10 + 1, &[seq * 10], finish)).unwrap();
        }
        service.run_until_idle();
        let acquire = t
            .send(&envelope(
                40,
                &[],
                Operation::ReadContextAcquire {
                    requested: Version::new(4),
                },
            ))
            .unwrap();
        assert_eq!(
            t.block(acquire).unwrap().unwrap(),
            Reply::Acquired {
                version: Version::new(5)
            }
        );
        assert_eq!(
            service.published_versions("c0"),
            vec![Version::INITIAL, Version::new(3), Version::new(5)]
        );

        let persist = t
            .send(&envelope(
                41,
                &[40],
                Operation::ReadContextPersist {
                    version: VersionRef::GrantedBy(SequenceId::new(40)),
                },
            ))
            .unwrap();
        assert!(t.block(persist).unwrap().is_ok());
        assert_eq!(service.persisted("c0"), vec![Version::new(5)]);
    }

    #[test]
    fn seeded_service_still_respects_parents() {
        for seed in 0..8 {
            let service = LoopbackService::with_seed(seed);
            let mut t = service.transport(0);
            t.send(&envelope(1, &[], create())).unwrap();
            for seq in 2..10 {
                t.send(&envelope(seq, &[seq - 1], link_exists())).unwrap();
            }
            service.run_until_idle();
            let order: Vec<u64> = service.log().iter().map(|r| r.seq.as_u64()).collect();
            assert_eq!(order, (1..10).collect::<Vec<_>>());
        }
    }
}

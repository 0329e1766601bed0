//! End-to-end scenarios against the loopback service.

use std::collections::HashSet;

use proptest::prelude::*;
use strata_crypto::ChecksumScope;
use strata_engine::{
    ContainerId, ContainerOptions, Dispatch, EngineError, EpochRef, Identity, LoopbackService,
    LoopbackTransport, ReadContextState, RequestHandle, RequestStatus, Runtime, RuntimeConfig,
    Submitted,
};
use strata_protocol::{codes, OpKind};
use strata_types::{ObjectClass, Version};

fn runtime(service: &LoopbackService) -> Runtime<LoopbackTransport> {
    Runtime::new(RuntimeConfig::default(), service.transport(0)).unwrap()
}

fn create(rt: &mut Runtime<LoopbackTransport>, name: &str) -> ContainerId {
    rt.container_create(name, ContainerOptions::default(), Dispatch::Blocking)
        .unwrap()
        .value
}

fn pending(submitted: Submitted) -> RequestHandle {
    submitted.into_handle().unwrap()
}

#[test]
fn test_low_water_mark_waits_for_head() {
    let service = LoopbackService::new();
    let mut rt = runtime(&service);
    let c = create(&mut rt, "c0");
    let root = rt.root(c).unwrap();
    let start = rt.stats().low_water_mark;

    let mut handles: Vec<_> = (0..5)
        .map(|_| pending(rt.object_op(root, OpKind::LinkExists, None, vec![], Dispatch::Async).unwrap()))
        .collect();
    assert_eq!(rt.stats().scheduled, 5);

    // Completing the tail does not let the mark pass the pending head.
    rt.wait(&mut handles[4]).unwrap();
    assert_eq!(rt.stats().low_water_mark, start);
    assert!(rt.stats().scheduled > 0);

    let mut last = start;
    for h in &mut handles[..4] {
        rt.wait(h).unwrap();
        let mark = rt.stats().low_water_mark;
        assert!(mark >= last);
        last = mark;
    }
    let stats = rt.stats();
    assert_eq!(stats.low_water_mark, handles[4].seq());
    assert_eq!(stats.scheduled, 0);
    assert_eq!(stats.live_requests, 0);
    assert_eq!(stats.allocated, stats.freed);
}

#[test]
fn test_child_waits_for_open_identity() {
    let service = LoopbackService::new();
    let mut rt = runtime(&service);
    let c = create(&mut rt, "c0");
    let root = rt.root(c).unwrap();
    let t1 = rt.transaction_create(c, Version::new(1)).unwrap();
    rt.transaction_start(t1, None, Dispatch::Blocking).unwrap();
    rt.object_create(root, OpKind::GroupCreate, "g", t1, Dispatch::Blocking)
        .unwrap();
    rt.transaction_finish(t1, false, Dispatch::Blocking).unwrap();
    rt.container_close(c).unwrap();

    let (c, open) = rt
        .container_open("c0", ContainerOptions::default(), Dispatch::Async)
        .unwrap()
        .into_parts();
    let root = rt.root(c).unwrap();
    assert!(matches!(rt.object_identity(root).unwrap(), Identity::Pending(_)));
    let (g, g_open) = rt
        .object_open(root, OpKind::GroupOpen, "g", None, Dispatch::Async)
        .unwrap()
        .into_parts();
    assert_eq!(rt.object_identity(root).unwrap(), Identity::Root);

    let t2 = rt.transaction_create(c, Version::new(2)).unwrap();
    rt.transaction_start(t2, None, Dispatch::Async).unwrap();
    let (d, d_create) = rt
        .object_create(g, OpKind::DatasetCreate, "d", t2, Dispatch::Async)
        .unwrap()
        .into_parts();
    assert!(matches!(rt.object_identity(g).unwrap(), Identity::Known(_)));
    assert!(matches!(rt.object_identity(d).unwrap(), Identity::Known(_)));

    let mut open = pending(open);
    let mut g_open = pending(g_open);
    let mut d_create = pending(d_create);
    rt.wait(&mut d_create).unwrap();
    rt.wait(&mut g_open).unwrap();
    rt.wait(&mut open).unwrap();

    let log = service.log();
    let parents_of = |seq| log.iter().find(|r| r.seq == seq).unwrap().parents.clone();
    assert!(parents_of(g_open.seq()).contains(&open.seq()));
    assert!(parents_of(d_create.seq()).contains(&g_open.seq()));
    // Ids minted before the close are never minted again.
    assert_eq!(rt.id_counter(c, ObjectClass::Kv).unwrap(), 1);
}

#[test]
fn test_blocking_finish_publishes_version() {
    let service = LoopbackService::new();
    let mut rt = runtime(&service);
    let c = create(&mut rt, "c0");
    let root = rt.root(c).unwrap();
    rt.transaction_skip(c, Version::new(1), 1, Dispatch::Blocking).unwrap();
    let t2 = rt.transaction_create(c, Version::new(2)).unwrap();
    rt.transaction_start(t2, None, Dispatch::Async).unwrap();
    let epoch = Some(EpochRef::Transaction(t2));
    let mut writes: Vec<_> = (0..3u8)
        .map(|i| pending(rt.object_op(root, OpKind::MapPut, epoch, vec![i], Dispatch::Async).unwrap()))
        .collect();

    let finished = rt.transaction_finish(t2, true, Dispatch::Blocking).unwrap();
    let finish_seq = finished.request.seq();
    let rc = finished.value.unwrap();
    assert_eq!(rt.read_context_state(rc).unwrap(), ReadContextState::Acquired);
    assert_eq!(rt.read_context_version(rc).unwrap(), Some(Version::new(2)));
    for w in &mut writes {
        assert_eq!(rt.request_status(w).unwrap(), RequestStatus::Succeeded);
        assert!(service.executed_before(w.seq(), finish_seq));
        rt.wait(w).unwrap();
    }

    let got = rt
        .object_op(root, OpKind::MapGet, Some(EpochRef::ReadContext(rc)), vec![], Dispatch::Blocking)
        .unwrap();
    assert_eq!(got.completion().unwrap().data(), Some(&[2u8][..]));

    let acquired = rt
        .read_context_acquire(c, Version::new(2), Dispatch::Blocking)
        .unwrap()
        .value;
    assert_eq!(rt.read_context_version(acquired).unwrap(), Some(Version::new(2)));
    rt.read_context_release(acquired, Dispatch::Blocking).unwrap();
    rt.read_context_release(rc, Dispatch::Blocking).unwrap();
    rt.transaction_close(t2).unwrap();
    rt.container_close(c).unwrap();
    assert_eq!(rt.stats().live_requests, 0);
}

#[test]
fn test_two_ranks_mint_disjoint_ids() {
    let service = LoopbackService::new();
    let mut ranks: Vec<Runtime<LoopbackTransport>> = (0..2)
        .map(|r| Runtime::new(RuntimeConfig::for_rank(r, 2), service.transport(r)).unwrap())
        .collect();
    let c0 = create(&mut ranks[0], "shared");
    let c1 = ranks[1]
        .container_open("shared", ContainerOptions::default(), Dispatch::Blocking)
        .unwrap()
        .value;

    let containers = [c0, c1];
    let mut txns = Vec::new();
    for (rt, &c) in ranks.iter_mut().zip(&containers) {
        let t = rt.transaction_create(c, Version::new(1)).unwrap();
        rt.transaction_start(t, None, Dispatch::Blocking).unwrap();
        txns.push(t);
    }
    let mut ids = HashSet::new();
    for (rank, rt) in ranks.iter_mut().enumerate() {
        let root = rt.root(containers[rank]).unwrap();
        for i in 0..3 {
            let g = rt
                .object_create(root, OpKind::GroupCreate, &format!("r{rank}-{i}"), txns[rank], Dispatch::Blocking)
                .unwrap()
                .value;
            match rt.object_identity(g).unwrap() {
                Identity::Known(id) => assert!(ids.insert(id)),
                other => panic!("unexpected identity {other:?}"),
            }
        }
    }
    for (rank, rt) in ranks.iter_mut().enumerate() {
        rt.transaction_finish(txns[rank], false, Dispatch::Blocking).unwrap();
        rt.transaction_close(txns[rank]).unwrap();
        rt.container_close(containers[rank]).unwrap();
    }
    assert_eq!(ids.len(), 6);

    // A later open resumes above the highest id any rank minted.
    let mut late = Runtime::new(RuntimeConfig::for_rank(0, 2), service.transport(0)).unwrap();
    let c = late
        .container_open("shared", ContainerOptions::read_only(), Dispatch::Blocking)
        .unwrap()
        .value;
    assert_eq!(late.id_counter(c, ObjectClass::Kv).unwrap(), 3);
    assert!(service.watermarks("shared").kv.is_some());
}

#[test]
fn test_dependent_writes_keep_order_under_shuffle() {
    for seed in 0..16 {
        let service = LoopbackService::with_seed(seed);
        let mut rt = runtime(&service);
        let c = create(&mut rt, "c0");
        let root = rt.root(c).unwrap();
        let t = rt.transaction_create(c, Version::new(1)).unwrap();
        rt.transaction_start(t, None, Dispatch::Blocking).unwrap();
        service.hold_kind(OpKind::DatasetWrite, 3);
        let epoch = Some(EpochRef::Transaction(t));
        let mut writes: Vec<_> = (0..6u8)
            .map(|i| {
                let kind = if i == 0 { OpKind::DatasetWrite } else { OpKind::MapPut };
                pending(rt.object_op(root, kind, epoch, vec![i], Dispatch::Async).unwrap())
            })
            .collect();
        rt.wait_all(c).unwrap();
        for pair in writes.windows(2) {
            assert!(service.executed_before(pair[0].seq(), pair[1].seq()));
        }
        for w in &mut writes {
            rt.wait(w).unwrap();
        }
        rt.transaction_finish(t, false, Dispatch::Blocking).unwrap();
    }
}

#[test]
fn test_cancelled_parent_fails_child() {
    let service = LoopbackService::new();
    let mut rt = runtime(&service);
    let c = create(&mut rt, "c0");
    let root = rt.root(c).unwrap();
    service.hold_kind(OpKind::LinkExists, 4);
    let mut first = pending(rt.object_op(root, OpKind::LinkExists, None, vec![], Dispatch::Async).unwrap());
    let mut second = pending(rt.object_op(root, OpKind::AttributeRead, None, vec![], Dispatch::Async).unwrap());

    assert_eq!(rt.cancel(&mut first).unwrap(), RequestStatus::Cancelled);
    assert_eq!(rt.cancel(&mut first).unwrap(), RequestStatus::Cancelled);
    let done = rt.wait(&mut second).unwrap();
    match done.into_result() {
        Err(EngineError::Remote { failure, .. }) => assert_eq!(failure.code, codes::PARENT_FAILED),
        other => panic!("unexpected {other:?}"),
    }
    rt.container_close(c).unwrap();
    assert_eq!(rt.stats().live_requests, 0);
}

#[test]
fn test_corrupted_reply_is_integrity_failure() {
    let run = |scope: ChecksumScope| {
        let service = LoopbackService::new();
        let config = RuntimeConfig {
            checksum_scope: scope,
            ..RuntimeConfig::default()
        };
        let mut rt = Runtime::new(config, service.transport(0)).unwrap();
        let c = create(&mut rt, "c0");
        let root = rt.root(c).unwrap();
        let t = rt.transaction_create(c, Version::new(1)).unwrap();
        rt.transaction_start(t, None, Dispatch::Blocking).unwrap();
        rt.object_op(root, OpKind::AttributeWrite, Some(EpochRef::Transaction(t)), b"abc".to_vec(), Dispatch::Blocking)
            .unwrap();
        rt.transaction_finish(t, false, Dispatch::Blocking).unwrap();
        service.corrupt_replies(true);
        rt.object_op(root, OpKind::AttributeRead, None, vec![], Dispatch::Blocking)
    };
    assert!(matches!(
        run(ChecksumScope::Transfer),
        Err(EngineError::Integrity { .. })
    ));
    let unchecked = run(ChecksumScope::None).unwrap();
    assert_ne!(unchecked.completion().unwrap().data(), Some(&b"abc"[..]));
}

#[test]
fn test_send_failure_is_scheduled_and_reclaimed() {
    let service = LoopbackService::new();
    let mut rt = runtime(&service);
    let c = create(&mut rt, "c0");
    let root = rt.root(c).unwrap();
    service.fail_next_sends(1);
    let mut h = pending(rt.object_op(root, OpKind::LinkExists, None, vec![], Dispatch::Async).unwrap());
    assert_eq!(rt.request_status(&h).unwrap(), RequestStatus::Failed);
    assert_eq!(rt.stats().scheduled, 1);
    assert!(rt.container_list(c).unwrap().is_empty());
    assert!(matches!(
        rt.wait(&mut h).unwrap().into_result(),
        Err(EngineError::TransportSend { .. })
    ));
    assert_eq!(rt.stats().scheduled, 0);

    service.fail_next_sends(1);
    assert!(matches!(
        rt.object_op(root, OpKind::LinkExists, None, vec![], Dispatch::Blocking),
        Err(EngineError::TransportSend { .. })
    ));
    assert_eq!(rt.stats().live_requests, 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn requests_are_always_reclaimed(
        seed in any::<u64>(),
        actions in prop::collection::vec(0u8..6, 1..48),
    ) {
        let service = LoopbackService::with_seed(seed);
        let mut rt = runtime(&service);
        let c = create(&mut rt, "c0");
        let root = rt.root(c).unwrap();
        let t = rt.transaction_create(c, Version::new(1)).unwrap();
        let epoch = Some(EpochRef::Transaction(t));
        let mut handles = vec![pending(rt.transaction_start(t, None, Dispatch::Async).unwrap())];
        let mut objects = vec![root];

        for (i, action) in actions.iter().enumerate() {
            let target = objects[i % objects.len()];
            match action {
                0 => handles.push(pending(
                    rt.object_op(target, OpKind::LinkExists, None, vec![], Dispatch::Async).unwrap(),
                )),
                1 => handles.push(pending(
                    rt.object_op(target, OpKind::MapPut, epoch, vec![i as u8], Dispatch::Async).unwrap(),
                )),
                2 => {
                    let (g, request) = rt
                        .object_create(root, OpKind::GroupCreate, &format!("g{i}"), t, Dispatch::Async)
                        .unwrap()
                        .into_parts();
                    objects.push(g);
                    handles.push(pending(request));
                }
                3 if !handles.is_empty() => {
                    let mut h = handles.remove(i % handles.len());
                    rt.wait(&mut h).unwrap();
                }
                4 if !handles.is_empty() => {
                    let n = handles.len();
                    rt.cancel(&mut handles[i % n]).unwrap();
                }
                5 if !handles.is_empty() => {
                    let n = handles.len();
                    rt.test(&mut handles[i % n]).unwrap();
                }
                _ => {}
            }
        }

        let mut finish = pending(rt.transaction_finish(t, false, Dispatch::Async).unwrap().request);
        for h in &mut handles {
            rt.wait(h).unwrap();
        }
        rt.wait(&mut finish).unwrap();
        rt.container_close(c).unwrap();

        let stats = rt.stats();
        prop_assert_eq!(stats.live_requests, 0);
        prop_assert_eq!(stats.allocated, stats.freed);
        prop_assert_eq!(stats.scheduled, 0);
    }
}

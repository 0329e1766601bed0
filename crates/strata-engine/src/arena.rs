//! Request storage and reference counting.
//!
//! Nodes live in generation-checked slots. A node is freed exactly when its
//! reference count drops to zero, and only once it is terminal; a stale key
//! (the slot was freed and possibly reused) is reported as misuse rather
//! than silently touching another request.

use tracing::trace;

use crate::error::{EngineError, EngineResult};
use crate::list::{Link, ListHead, ListRole};
use crate::request::{Request, RequestKey, RequestState};

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    node: Option<Request>,
}

/// Owner of every request node.
#[derive(Debug, Default)]
pub struct RequestArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
    allocated: u64,
    freed: u64,
}

impl RequestArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nodes currently allocated.
    pub fn live(&self) -> usize {
        self.live
    }

    /// Nodes ever allocated.
    pub fn allocated(&self) -> u64 {
        self.allocated
    }

    /// Nodes ever freed.
    pub fn freed(&self) -> u64 {
        self.freed
    }

    pub(crate) fn insert(&mut self, node: Request) -> EngineResult<RequestKey> {
        let key = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.node = Some(node);
                RequestKey {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = u32::try_from(self.slots.len()).map_err(|_| {
                    EngineError::LocalResource("request arena exhausted".into())
                })?;
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                RequestKey {
                    index,
                    generation: 0,
                }
            }
        };
        self.live += 1;
        self.allocated += 1;
        Ok(key)
    }

    pub(crate) fn get(&self, key: RequestKey) -> Option<&Request> {
        self.slots
            .get(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.node.as_ref())
    }

    pub(crate) fn get_mut(&mut self, key: RequestKey) -> Option<&mut Request> {
        self.slots
            .get_mut(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.node.as_mut())
    }

    pub(crate) fn node(&self, key: RequestKey) -> EngineResult<&Request> {
        self.get(key)
            .ok_or_else(|| EngineError::misuse(format!("stale request key {key:?}")))
    }

    pub(crate) fn node_mut(&mut self, key: RequestKey) -> EngineResult<&mut Request> {
        self.get_mut(key)
            .ok_or_else(|| EngineError::misuse(format!("stale request key {key:?}")))
    }

    /// Whether `key` names a live node that has not yet reached a terminal state.
    pub(crate) fn is_pending(&self, key: RequestKey) -> bool {
        self.get(key).is_some_and(Request::is_pending)
    }

    pub(crate) fn incr_ref(&mut self, key: RequestKey) -> EngineResult<()> {
        let node = self.node_mut(key)?;
        node.ref_count += 1;
        Ok(())
    }

    /// Release one reference. Returns `true` if the node was freed.
    pub(crate) fn decr_ref(&mut self, key: RequestKey) -> EngineResult<bool> {
        let node = self.node_mut(key)?;
        if node.ref_count == 0 {
            return Err(EngineError::misuse(format!(
                "request {} released with no references",
                node.seq
            )));
        }
        if node.ref_count == 1 && node.state == RequestState::Pending {
            return Err(EngineError::misuse(format!(
                "last reference to pending request {} released",
                node.seq
            )));
        }
        node.ref_count -= 1;
        if node.ref_count > 0 {
            return Ok(false);
        }
        debug_assert!(node.links.iter().all(|l| !l.linked));
        trace!(seq = %node.seq, "freed request");
        let slot = &mut self.slots[key.index as usize];
        slot.node = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.index);
        self.live -= 1;
        self.freed += 1;
        Ok(true)
    }

    /// Append `key` to `list` under `role`, taking one reference for the list.
    pub(crate) fn push_back(
        &mut self,
        list: &mut ListHead,
        role: ListRole,
        key: RequestKey,
    ) -> EngineResult<()> {
        let tail = list.tail;
        let node = self.node_mut(key)?;
        let link = &mut node.links[role.index()];
        if link.linked {
            return Err(EngineError::misuse(format!(
                "request {} already linked in {role:?} list",
                node.seq
            )));
        }
        *link = Link {
            prev: tail,
            next: None,
            linked: true,
        };
        node.ref_count += 1;
        match tail {
            Some(t) => self.node_mut(t)?.links[role.index()].next = Some(key),
            None => list.head = Some(key),
        }
        list.tail = Some(key);
        list.len += 1;
        Ok(())
    }

    /// Remove `key` from `list` and release the list's reference. Returns
    /// `true` if the node was freed.
    pub(crate) fn unlink(
        &mut self,
        list: &mut ListHead,
        role: ListRole,
        key: RequestKey,
    ) -> EngineResult<bool> {
        let i = role.index();
        let node = self.node_mut(key)?;
        let link = node.links[i];
        if !link.linked {
            return Err(EngineError::misuse(format!(
                "request {} not linked in {role:?} list",
                node.seq
            )));
        }
        node.links[i] = Link::default();
        match link.prev {
            Some(p) => self.node_mut(p)?.links[i].next = link.next,
            None => list.head = link.next,
        }
        match link.next {
            Some(n) => self.node_mut(n)?.links[i].prev = link.prev,
            None => list.tail = link.prev,
        }
        list.len -= 1;
        self.decr_ref(key)
    }

    /// Keys of `list` in order from head to tail.
    pub(crate) fn keys(&self, list: &ListHead, role: ListRole) -> Vec<RequestKey> {
        let mut keys = Vec::with_capacity(list.len);
        let mut cursor = list.head;
        while let Some(key) = cursor {
            keys.push(key);
            cursor = self.get(key).and_then(|n| n.link(role).next);
        }
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ContainerId;
    use strata_protocol::OpKind;
    use strata_types::SequenceId;

    fn node(seq: u64) -> Request {
        Request::new(OpKind::DatasetWrite, SequenceId::new(seq), ContainerId::new(0))
    }

    fn complete(arena: &mut RequestArena, key: RequestKey) {
        arena.get_mut(key).unwrap().state = RequestState::Completed;
    }

    #[test]
    fn freed_exactly_at_zero_once_terminal() {
        let mut arena = RequestArena::new();
        let k = arena.insert(node(1)).unwrap();
        arena.incr_ref(k).unwrap();
        complete(&mut arena, k);
        assert!(!arena.decr_ref(k).unwrap());
        assert!(arena.decr_ref(k).unwrap());
        assert!(arena.get(k).is_none());
        assert_eq!(arena.live(), 0);
        assert_eq!(arena.allocated(), 1);
        assert_eq!(arena.freed(), 1);
    }

    #[test]
    fn pending_node_cannot_reach_zero() {
        let mut arena = RequestArena::new();
        let k = arena.insert(node(1)).unwrap();
        let err = arena.decr_ref(k).unwrap_err();
        assert!(matches!(err, EngineError::ProtocolMisuse(_)));
        assert_eq!(arena.get(k).unwrap().ref_count, 1);
    }

    #[test]
    fn stale_key_after_reuse_is_rejected() {
        let mut arena = RequestArena::new();
        let old = arena.insert(node(1)).unwrap();
        complete(&mut arena, old);
        arena.decr_ref(old).unwrap();
        let new = arena.insert(node(2)).unwrap();
        assert_eq!(old.index, new.index);
        assert!(arena.get(old).is_none());
        assert!(matches!(arena.decr_ref(old), Err(EngineError::ProtocolMisuse(_))));
        assert_eq!(arena.get(new).unwrap().seq, SequenceId::new(2));
    }

    #[test]
    fn list_link_and_unlink_keep_order_and_counts() {
        let mut arena = RequestArena::new();
        let mut list = ListHead::new();
        let keys: Vec<_> = (1..=3).map(|s| arena.insert(node(s)).unwrap()).collect();
        for &k in &keys {
            arena.push_back(&mut list, ListRole::Container, k).unwrap();
            assert_eq!(arena.get(k).unwrap().ref_count, 2);
        }
        assert_eq!(arena.keys(&list, ListRole::Container), keys);

        complete(&mut arena, keys[1]);
        arena.unlink(&mut list, ListRole::Container, keys[1]).unwrap();
        assert_eq!(arena.keys(&list, ListRole::Container), vec![keys[0], keys[2]]);
        assert_eq!(list.len(), 2);

        for &k in &[keys[0], keys[2]] {
            complete(&mut arena, k);
            arena.unlink(&mut list, ListRole::Container, k).unwrap();
        }
        assert!(list.is_empty());
        assert!(list.tail().is_none());
    }

    #[test]
    fn roles_are_independent() {
        let mut arena = RequestArena::new();
        let mut container = ListHead::new();
        let mut global = ListHead::new();
        let k = arena.insert(node(1)).unwrap();
        arena.push_back(&mut container, ListRole::Container, k).unwrap();
        arena.push_back(&mut global, ListRole::Global, k).unwrap();
        assert_eq!(arena.get(k).unwrap().ref_count, 3);

        complete(&mut arena, k);
        arena.unlink(&mut container, ListRole::Container, k).unwrap();
        assert!(container.is_empty());
        assert_eq!(arena.keys(&global, ListRole::Global), vec![k]);
        assert!(arena.unlink(&mut container, ListRole::Container, k).is_err());
    }

    #[test]
    fn double_link_is_misuse() {
        let mut arena = RequestArena::new();
        let mut list = ListHead::new();
        let k = arena.insert(node(1)).unwrap();
        arena.push_back(&mut list, ListRole::Epoch, k).unwrap();
        assert!(matches!(
            arena.push_back(&mut list, ListRole::Epoch, k),
            Err(EngineError::ProtocolMisuse(_))
        ));
    }
}

//! Containers and their local object tables.

use std::collections::HashMap;
use std::fmt;

use strata_protocol::OpKind;
use strata_types::{IdAllocator, ObjectClass, ObjectId, RankInfo, Version};

use crate::arena::RequestArena;
use crate::config::ContainerOptions;
use crate::error::{EngineError, EngineResult};
use crate::list::ListHead;
use crate::request::RequestKey;

/// Local handle of an open container.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId(u64);

impl ContainerId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContainerId({})", self.0)
    }
}

/// Local handle of an open object inside a container.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObjectHandle {
    pub(crate) container: ContainerId,
    pub(crate) local: u64,
}

impl ObjectHandle {
    pub(crate) const ROOT: u64 = 0;

    pub(crate) fn root(container: ContainerId) -> Self {
        Self {
            container,
            local: Self::ROOT,
        }
    }

    pub fn container(&self) -> ContainerId {
        self.container
    }

    pub fn is_root(&self) -> bool {
        self.local == Self::ROOT
    }
}

/// What the client knows about an object's remote identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Identity {
    /// The container root group, addressed without an id.
    Root,
    /// Minted locally at create, or learned from an open reply.
    Known(ObjectId),
    /// Only known once this request completes.
    Pending(RequestKey),
    /// The request that would have resolved it failed.
    Failed,
}

impl Identity {
    /// The id to put on the wire, if the identity is resolved.
    pub fn resolved(&self) -> Option<Option<ObjectId>> {
        match self {
            Self::Root => Some(None),
            Self::Known(id) => Some(Some(*id)),
            Self::Pending(_) | Self::Failed => None,
        }
    }
}

#[derive(Debug)]
pub(crate) struct ObjectRecord {
    pub name: String,
    pub class: ObjectClass,
    pub close_kind: OpKind,
    pub parent: Option<u64>,
    pub identity: Identity,
    /// Most recent tracked operation on this handle. Counted.
    pub last_op: Option<RequestKey>,
}

/// One connection to a remote storage container.
#[derive(Debug)]
pub(crate) struct Container {
    pub name: String,
    pub options: ContainerOptions,
    pub list: ListHead,
    pub ids: IdAllocator,
    pub objects: HashMap<u64, ObjectRecord>,
    next_local: u64,
    /// Highest transaction number started or skipped.
    pub last_txn: Option<Version>,
    /// Latest version the service reported at open.
    pub latest: Version,
}

impl Container {
    pub fn new(name: &str, options: ContainerOptions, rank: RankInfo, root: Identity) -> Self {
        let mut objects = HashMap::new();
        objects.insert(
            ObjectHandle::ROOT,
            ObjectRecord {
                name: name.to_string(),
                class: ObjectClass::Kv,
                close_kind: OpKind::ContainerClose,
                parent: None,
                identity: root,
                last_op: None,
            },
        );
        Self {
            name: name.to_string(),
            options,
            list: ListHead::new(),
            ids: IdAllocator::new(rank),
            objects,
            next_local: ObjectHandle::ROOT + 1,
            last_txn: None,
            latest: Version::INITIAL,
        }
    }

    pub fn record(&self, local: u64) -> EngineResult<&ObjectRecord> {
        self.objects.get(&local).ok_or(EngineError::UnknownHandle {
            kind: "object",
            id: local,
        })
    }

    pub fn record_mut(&mut self, local: u64) -> EngineResult<&mut ObjectRecord> {
        self.objects.get_mut(&local).ok_or(EngineError::UnknownHandle {
            kind: "object",
            id: local,
        })
    }

    pub fn add_object(&mut self, record: ObjectRecord) -> u64 {
        let local = self.next_local;
        self.next_local += 1;
        self.objects.insert(local, record);
        local
    }

    /// Drop an object record, releasing its "most recent operation" reference.
    pub fn remove_object(&mut self, arena: &mut RequestArena, local: u64) -> EngineResult<()> {
        let record = self.objects.remove(&local).ok_or(EngineError::UnknownHandle {
            kind: "object",
            id: local,
        })?;
        if let Some(key) = record.last_op {
            arena.decr_ref(key)?;
        }
        Ok(())
    }

    /// Point the object's "most recent operation" at `key`, moving the
    /// reference from the previous one.
    pub fn set_last_op(
        &mut self,
        arena: &mut RequestArena,
        local: u64,
        key: RequestKey,
    ) -> EngineResult<()> {
        let record = self.record_mut(local)?;
        arena.incr_ref(key)?;
        if let Some(old) = record.last_op.replace(key) {
            arena.decr_ref(old)?;
        }
        Ok(())
    }

    /// Clear the pointer if it still names `key`.
    pub fn clear_last_op(
        &mut self,
        arena: &mut RequestArena,
        local: u64,
        key: RequestKey,
    ) -> EngineResult<()> {
        if let Some(record) = self.objects.get_mut(&local) {
            if record.last_op == Some(key) {
                record.last_op = None;
                arena.decr_ref(key)?;
            }
        }
        Ok(())
    }

    pub fn writable(&self) -> bool {
        self.options.writable()
    }
}

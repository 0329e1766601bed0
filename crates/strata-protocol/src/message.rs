use std::fmt;

use serde::{Deserialize, Serialize};
use strata_crypto::Checksum;
use strata_types::{IdWatermarks, ObjectId, SequenceId, Version};

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Category of an operation.
///
/// Only marshaling collaborators and the service care about the exact kind;
/// the request engine treats it as an opaque tag apart from the few
/// predicates below.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    ContainerCreate,
    ContainerOpen,
    ContainerClose,
    GroupCreate,
    GroupOpen,
    GroupClose,
    DatasetCreate,
    DatasetOpen,
    DatasetRead,
    DatasetWrite,
    DatasetSetExtent,
    DatasetClose,
    AttributeCreate,
    AttributeOpen,
    AttributeRead,
    AttributeWrite,
    AttributeRemove,
    AttributeClose,
    DatatypeCommit,
    DatatypeOpen,
    DatatypeClose,
    LinkCreate,
    LinkMove,
    LinkRemove,
    LinkExists,
    MapCreate,
    MapOpen,
    MapPut,
    MapGet,
    MapDelete,
    MapClose,
    TransactionStart,
    TransactionFinish,
    TransactionSkip,
    TransactionAbort,
    ReadContextAcquire,
    ReadContextRelease,
    ReadContextPersist,
    ReadContextSnapshot,
}

impl OpKind {
    /// Operations that bring a new remote object into existence.
    pub fn is_create(self) -> bool {
        matches!(
            self,
            Self::ContainerCreate
                | Self::GroupCreate
                | Self::DatasetCreate
                | Self::AttributeCreate
                | Self::DatatypeCommit
                | Self::MapCreate
        )
    }

    /// Operations that look up an existing remote object by name.
    pub fn is_open(self) -> bool {
        matches!(
            self,
            Self::ContainerOpen
                | Self::GroupOpen
                | Self::DatasetOpen
                | Self::AttributeOpen
                | Self::DatatypeOpen
                | Self::MapOpen
        )
    }

    pub fn is_close(self) -> bool {
        matches!(
            self,
            Self::ContainerClose
                | Self::GroupClose
                | Self::DatasetClose
                | Self::AttributeClose
                | Self::DatatypeClose
                | Self::MapClose
        )
    }

    /// The close operation matching an object created or opened by `self`.
    pub fn close_kind(self) -> Option<OpKind> {
        match self {
            Self::ContainerCreate | Self::ContainerOpen => Some(Self::ContainerClose),
            Self::GroupCreate | Self::GroupOpen => Some(Self::GroupClose),
            Self::DatasetCreate | Self::DatasetOpen => Some(Self::DatasetClose),
            Self::AttributeCreate | Self::AttributeOpen => Some(Self::AttributeClose),
            Self::DatatypeCommit | Self::DatatypeOpen => Some(Self::DatatypeClose),
            Self::MapCreate | Self::MapOpen => Some(Self::MapClose),
            _ => None,
        }
    }

    /// Transaction and read-context control operations.
    pub fn is_epoch_control(self) -> bool {
        matches!(
            self,
            Self::TransactionStart
                | Self::TransactionFinish
                | Self::TransactionSkip
                | Self::TransactionAbort
                | Self::ReadContextAcquire
                | Self::ReadContextRelease
                | Self::ReadContextPersist
                | Self::ReadContextSnapshot
        )
    }

    /// Operations that change container contents and therefore belong to a
    /// write transaction.
    pub fn mutates(self) -> bool {
        self.is_create()
            || matches!(
                self,
                Self::DatasetWrite
                    | Self::DatasetSetExtent
                    | Self::AttributeWrite
                    | Self::AttributeRemove
                    | Self::LinkCreate
                    | Self::LinkMove
                    | Self::LinkRemove
                    | Self::MapPut
                    | Self::MapDelete
            )
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Operation descriptor: the parameters the service needs beyond the opaque
/// marshaled payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    ContainerCreate {
        name: String,
    },
    ContainerOpen {
        name: String,
        writable: bool,
    },
    ContainerClose {
        persist: bool,
        watermarks: IdWatermarks,
    },
    ObjectCreate {
        kind: OpKind,
        parent: Option<ObjectId>,
        id: ObjectId,
        name: String,
    },
    ObjectOpen {
        kind: OpKind,
        parent: Option<ObjectId>,
        name: String,
    },
    ObjectClose {
        kind: OpKind,
        id: Option<ObjectId>,
    },
    /// Any other marshaled operation against an existing object.
    Access {
        kind: OpKind,
        target: Option<ObjectId>,
    },
    TransactionStart {
        number: Version,
        base: Option<VersionRef>,
    },
    TransactionFinish {
        number: Version,
        publish: bool,
        watermarks: IdWatermarks,
        depends_on: Vec<Version>,
    },
    TransactionSkip {
        start: Version,
        count: u64,
    },
    TransactionAbort {
        number: Version,
    },
    ReadContextAcquire {
        requested: Version,
    },
    ReadContextRelease {
        version: VersionRef,
    },
    ReadContextPersist {
        version: VersionRef,
    },
    ReadContextSnapshot {
        version: VersionRef,
        name: String,
    },
}

impl Operation {
    pub fn kind(&self) -> OpKind {
        match self {
            Self::ContainerCreate { .. } => OpKind::ContainerCreate,
            Self::ContainerOpen { .. } => OpKind::ContainerOpen,
            Self::ContainerClose { .. } => OpKind::ContainerClose,
            Self::ObjectCreate { kind, .. }
            | Self::ObjectOpen { kind, .. }
            | Self::ObjectClose { kind, .. }
            | Self::Access { kind, .. } => *kind,
            Self::TransactionStart { .. } => OpKind::TransactionStart,
            Self::TransactionFinish { .. } => OpKind::TransactionFinish,
            Self::TransactionSkip { .. } => OpKind::TransactionSkip,
            Self::TransactionAbort { .. } => OpKind::TransactionAbort,
            Self::ReadContextAcquire { .. } => OpKind::ReadContextAcquire,
            Self::ReadContextRelease { .. } => OpKind::ReadContextRelease,
            Self::ReadContextPersist { .. } => OpKind::ReadContextPersist,
            Self::ReadContextSnapshot { .. } => OpKind::ReadContextSnapshot,
        }
    }
}

/// A container version as named on the wire.
///
/// A read context whose acquire is still in flight has no version the
/// client could name, so requests against it refer to the acquire instead.
/// Such requests always list the acquire among their parents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VersionRef {
    Known(Version),
    /// Whatever version the acquire request with this sequence id granted.
    GrantedBy(SequenceId),
}

impl fmt::Display for VersionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(version) => write!(f, "{version}"),
            Self::GrantedBy(seq) => write!(f, "granted-by({seq})"),
        }
    }
}

/// Consistency basis of an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EpochTag {
    /// Issued inside the write transaction with this number.
    Write(Version),
    /// Issued against a read context.
    Read(VersionRef),
}

/// One request as handed to the transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub seq: SequenceId,
    pub rank: u32,
    pub container: String,
    pub epoch: Option<EpochTag>,
    /// The service must not start this request before all of these retire.
    pub parents: Vec<SequenceId>,
    pub op: Operation,
    pub payload: Vec<u8>,
    pub checksum: Option<Checksum>,
    /// Ask the service to keep `checksum` alongside the stored data.
    pub store_checksum: bool,
}

/// Successful result of a request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    Ack,
    ContainerOpened {
        watermarks: IdWatermarks,
        latest: Version,
    },
    ObjectOpened {
        id: ObjectId,
    },
    Acquired {
        version: Version,
    },
    Data {
        bytes: Vec<u8>,
        checksum: Option<Checksum>,
    },
}

/// Error reported by the service for a request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFailure {
    pub code: u32,
    pub message: String,
}

impl RemoteFailure {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code={} {}", self.code, self.message)
    }
}

/// Service error codes.
pub mod codes {
    pub const NOT_FOUND: u32 = 404;
    pub const CONFLICT: u32 = 409;
    pub const VERSION_UNAVAILABLE: u32 = 410;
    pub const INTEGRITY: u32 = 422;
    pub const PARENT_FAILED: u32 = 424;
    pub const CANCELLED: u32 = 499;
    pub const READ_ONLY: u32 = 403;
    pub const INTERNAL: u32 = 500;
}

/// Framed unit exchanged between a byte-moving transport and the service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Submit(Envelope),
    Complete {
        seq: SequenceId,
        result: Result<Reply, RemoteFailure>,
    },
    Cancel {
        seq: SequenceId,
    },
    CancelAck {
        seq: SequenceId,
        already_completed: bool,
    },
}

impl Frame {
    pub fn type_tag(&self) -> u8 {
        match self {
            Self::Submit(_) => 1,
            Self::Complete { .. } => 2,
            Self::Cancel { .. } => 3,
            Self::CancelAck { .. } => 4,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Submit(_) => "Submit",
            Self::Complete { .. } => "Complete",
            Self::Cancel { .. } => "Cancel",
            Self::CancelAck { .. } => "CancelAck",
        }
    }

    pub fn seq(&self) -> SequenceId {
        match self {
            Self::Submit(env) => env.seq,
            Self::Complete { seq, .. } | Self::Cancel { seq } | Self::CancelAck { seq, .. } => *seq,
        }
    }
}

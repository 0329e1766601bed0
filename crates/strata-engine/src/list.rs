//! Index-based intrusive lists.
//!
//! A request node carries one [`Link`] per [`ListRole`], so the same node can
//! sit in its container's list, the global schedule, and an epoch list at
//! the same time. List heads only store keys; all pointer patching happens
//! in [`RequestArena`](crate::arena::RequestArena).

use crate::request::RequestKey;

/// The three independent lists a request can belong to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ListRole {
    /// Outstanding requests of one container.
    Container,
    /// The process-wide schedule.
    Global,
    /// Members of a transaction or read context.
    Epoch,
}

impl ListRole {
    pub(crate) const COUNT: usize = 3;

    pub(crate) fn index(self) -> usize {
        match self {
            Self::Container => 0,
            Self::Global => 1,
            Self::Epoch => 2,
        }
    }
}

/// Per-role linkage stored inside a request node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Link {
    pub prev: Option<RequestKey>,
    pub next: Option<RequestKey>,
    pub linked: bool,
}

/// Head and tail of one intrusive list.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListHead {
    pub(crate) head: Option<RequestKey>,
    pub(crate) tail: Option<RequestKey>,
    pub(crate) len: usize,
}

impl ListHead {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn head(&self) -> Option<RequestKey> {
        self.head
    }

    pub fn tail(&self) -> Option<RequestKey> {
        self.tail
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }
}

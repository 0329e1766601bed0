//! Asynchronous request engine for Strata.
//!
//! Every operation an application issues against a remote container funnels
//! through [`Runtime::submit_and_track`]. The runtime assigns a
//! rank-partitioned sequence id, computes the minimal set of outstanding
//! requests the new one must wait behind, links the request into up to three
//! intrusive lists (its container, the process-wide [`GlobalSchedule`], and
//! the transaction or read context it belongs to), and hands it to a
//! [`Transport`] together with its parents' sequence ids.
//!
//! # Architecture
//!
//! - **Requests** live in a [`RequestArena`]. Each node is reference counted
//!   by every structure pointing at it and is freed exactly when the count
//!   reaches zero after it is terminal.
//! - **GlobalSchedule** reclaims retired requests strictly from its head,
//!   advancing a low-water-mark of retired sequence ids.
//! - **Transactions** and **read contexts** give write epochs and immutable
//!   read snapshots; finishing or releasing one drains its request list.
//! - **Waiter** operations (`test`, `wait`, `wait_all`, `wait_some`,
//!   `cancel`) are the only places the runtime suspends, apart from the
//!   dependency resolver waiting on an ancestor whose identity is unknown
//!   and synchronous submissions.
//!
//! The engine is single-threaded by construction: all mutation goes through
//! `&mut Runtime`.
//!
//! # Modules
//!
//! - [`arena`] — Request storage, reference counting, intrusive list ops
//! - [`schedule`] — The global schedule and its low-water-mark sweep
//! - [`resolver`] — Parent-set computation
//! - [`dispatcher`] — `submit_and_track`
//! - [`transaction`] / [`read_context`] — Versioning protocol
//! - [`waiter`] — Polling, blocking and cancellation
//! - [`loopback`] — In-memory storage service for tests and simulation

pub mod arena;
pub mod config;
pub mod container;
pub mod dispatcher;
pub mod error;
pub mod list;
pub mod loopback;
pub mod read_context;
pub mod request;
pub mod resolver;
pub mod runtime;
pub mod schedule;
pub mod transaction;
pub mod transport;
pub mod waiter;

pub use arena::RequestArena;
pub use config::{ConfigError, ContainerOptions, OpenIntent, RuntimeConfig};
pub use container::{ContainerId, Identity, ObjectHandle};
pub use dispatcher::{Dispatch, Submission, Submitted};
pub use error::{EngineError, EngineResult};
pub use list::{ListHead, ListRole};
pub use loopback::{ExecutionRecord, LoopbackService, LoopbackTransport};
pub use read_context::{ReadContextId, ReadContextState};
pub use request::{Completion, Dependency, Failure, RequestHandle, RequestState, RequestStatus};
pub use runtime::{EpochRef, Issued, Runtime, RuntimeStats};
pub use schedule::GlobalSchedule;
pub use transaction::{TransactionId, TransactionState};
pub use transport::{CancelAck, Outcome, Transport, TransportError, TransportHandle};

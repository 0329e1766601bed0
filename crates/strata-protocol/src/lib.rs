//! Core wire model for Strata.
//!
//! Defines what the request engine hands to a transport: an [`Envelope`]
//! carrying the request's sequence id, the sequence ids of every parent it
//! must wait behind, the [`Operation`] descriptor, and an opaque payload
//! produced by a marshaling collaborator. [`StrataCodec`] frames these for
//! transports that move bytes.

pub mod codec;
pub mod error;
pub mod message;

pub use codec::StrataCodec;
pub use error::{ProtocolError, ProtocolResult};
pub use message::{
    codes, EpochTag, Envelope, Frame, OpKind, Operation, RemoteFailure, Reply, VersionRef,
    MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};

//! Crate-wide error type.
//!
//! Every fallible operation in the substrate returns [`enum@Error`]. Transport
//! and store failures carry their source; protocol-level failures (type
//! mismatches, unknown call ids, unregistered threads) are first-class
//! variants so callers can match on them.

use thiserror::Error;

/// Errors surfaced by the scheduler, transport, store and MPI layers.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket-level failure or an unknown call id on the wire.
    #[error("transport error: {0}")]
    Transport(String),

    /// A synchronous request did not receive a reply within the client
    /// timeout. The underlying socket is discarded.
    #[error("timed out waiting for a reply")]
    MessageTimeout,

    /// A blocking store dequeue expired, or a non-blocking dequeue found
    /// the list empty.
    #[error("no response available")]
    NoResponse,

    /// A keyed lookup (snapshot, store entry, MPI world) found nothing.
    #[error("not found: {0}")]
    NotFound(String),

    /// The head of an MPI queue does not match the expected message type or
    /// datatype. The message is left on the queue.
    #[error("mpi message mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    /// Reduce operation requested over a datatype it does not support.
    #[error("unsupported reduce operation over {0}")]
    UnsupportedOp(String),

    /// `await_thread_result` was called for a message id never registered
    /// on this host.
    #[error("thread {0} not registered on this host")]
    UnregisteredThread(u64),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Batch admission failed before any side effects took place.
    #[error("placement failed: {0}")]
    PlacementFailed(String),

    /// A THREADS/PROCESSES batch referenced a snapshot key that is not in
    /// the local registry.
    #[error("snapshot missing: {0}")]
    SnapshotMissing(String),

    /// A chained invocation reported a non-zero return value.
    #[error("chained call failed: {0}")]
    ChainedCallFailed(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[from] prost::DecodeError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Error::Io(std::io::Error::from(err))
    }
}

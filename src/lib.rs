//! Distributed function execution and MPI substrate.
//!
//! Each host runs one instance of this library: a scheduler that admits
//! batches of function invocations and splits them between local executors
//! and peer hosts, a snapshot registry peers can push memory images into,
//! and an MPI layer whose worlds span hosts while keeping same-host and
//! cross-host messaging behaviorally identical.
//!
//! Hosts discover each other through a shared membership store
//! ([`store::StateStore`]) and talk over framed TCP endpoints
//! ([`transport`]): every logical message is a one-byte call id frame
//! followed by a prost-encoded body.

pub mod config;
pub mod error;
pub mod messages;
pub mod mocking;
pub mod mpi;
pub mod observability;
pub mod scheduler;
pub mod snapshot;
pub mod store;
pub mod test_support;
pub mod transport;

pub use config::Config;
pub use error::{Error, Result};

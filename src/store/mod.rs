//! Membership and blob store client.
//!
//! A thin interface over an external key-value / pub-sub service holding
//! the live-host set, transient result blobs and MPI world state. The
//! scheduler never relies on atomicity beyond a single operation.

mod memory;
mod postgres;

use std::collections::HashSet;

use async_trait::async_trait;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use crate::error::Result;

/// Set of hosts currently accepting work.
pub const AVAILABLE_HOST_SET: &str = "AVAILABLE_HOSTS";

/// Set of message ids chained from a parent message.
pub fn chained_key(message_id: u64) -> String {
    format!("chained_{message_id}")
}

/// Serialized rank→host table for an MPI world.
pub fn world_state_key(world_id: i32) -> String {
    format!("mpi:worldstate:{world_id}")
}

/// Host for one rank of an MPI world.
pub fn rank_host_key(world_id: i32, rank: i32) -> String {
    format!("mpi:rankhost:{world_id}:{rank}")
}

/// Key-value / list / set operations required of the external store.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    /// Add a member to a set.
    async fn sadd(&self, key: &str, member: &str) -> Result<()>;

    /// Remove a member from a set.
    async fn srem(&self, key: &str, member: &str) -> Result<()>;

    /// Read a whole set. Missing keys read as empty.
    async fn smembers(&self, key: &str) -> Result<HashSet<String>>;

    /// Append to a FIFO list.
    async fn enqueue_bytes(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Pop the head of a FIFO list.
    ///
    /// With `timeout_ms == 0` this is a non-blocking probe failing with
    /// [`crate::error::Error::NoResponse`] when the list is empty; with a
    /// positive timeout it blocks up to that long before failing the same
    /// way.
    async fn dequeue_bytes(&self, key: &str, timeout_ms: u64) -> Result<Vec<u8>>;

    /// Set a plain value.
    async fn set(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Get a plain value; fails with `NotFound` for missing keys.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Expire any kind of key after `ttl_secs`.
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()>;
}

/// Convenience wrappers for the membership set.
pub async fn add_available_host(store: &dyn StateStore, host: &str) -> Result<()> {
    store.sadd(AVAILABLE_HOST_SET, host).await
}

pub async fn remove_available_host(store: &dyn StateStore, host: &str) -> Result<()> {
    store.srem(AVAILABLE_HOST_SET, host).await
}

pub async fn available_hosts(store: &dyn StateStore) -> Result<HashSet<String>> {
    store.smembers(AVAILABLE_HOST_SET).await
}

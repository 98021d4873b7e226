//! Wire message types and encoding/decoding utilities.
//!
//! Every body that crosses the framed transport is one of the prost messages
//! in this module. The same records are used in-process: messages are plain
//! values passed by copy between hosts, so nothing here holds references.

use std::sync::atomic::{AtomicU64, Ordering};

use once_cell::sync::Lazy;
use prost::Message as ProstMessage;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The unit of function invocation.
#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
pub struct Message {
    /// Unique within this host's lifetime.
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(string, tag = "2")]
    pub user: String,
    #[prost(string, tag = "3")]
    pub function: String,
    /// Host authoritative for this call's result plumbing. Non-empty for
    /// any message entering the scheduler.
    #[prost(string, tag = "4")]
    pub master_host: String,
    #[prost(string, tag = "5")]
    pub snapshot_key: String,
    #[prost(uint64, tag = "6")]
    pub snapshot_size: u64,
    #[prost(bool, tag = "7")]
    pub is_mpi: bool,
    #[prost(int32, tag = "8")]
    pub mpi_world_id: i32,
    #[prost(int32, tag = "9")]
    pub mpi_rank: i32,
    #[prost(int32, tag = "10")]
    pub mpi_world_size: i32,
    #[prost(string, tag = "11")]
    pub result_key: String,
    #[prost(string, tag = "12")]
    pub status_key: String,
    #[prost(bytes = "vec", tag = "13")]
    pub input_data: Vec<u8>,
    #[prost(enumeration = "MessageKind", tag = "14")]
    pub kind: i32,
    #[prost(bytes = "vec", tag = "15")]
    pub output_data: Vec<u8>,
    #[prost(int32, tag = "16")]
    pub return_value: i32,
    #[prost(string, tag = "17")]
    pub executed_host: String,
    /// Epoch milliseconds, stamped when the result is published.
    #[prost(int64, tag = "18")]
    pub finish_timestamp: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ::prost::Enumeration)]
#[repr(i32)]
pub enum MessageKind {
    Invoke = 0,
    Bind = 1,
    Flush = 2,
    /// Synthetic kind returned by a non-blocking result read that found
    /// nothing.
    Empty = 3,
}

impl Message {
    /// `user/function` pair identifying the function this message invokes.
    pub fn func_key(&self) -> String {
        format!("{}/{}", self.user, self.function)
    }
}

/// A non-empty ordered group of messages for the same function, dispatched
/// atomically.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BatchExecuteRequest {
    #[prost(message, repeated, tag = "1")]
    pub messages: Vec<Message>,
    #[prost(enumeration = "BatchType", tag = "2")]
    pub batch_type: i32,
    /// Required (non-empty) for THREADS and PROCESSES batches.
    #[prost(string, tag = "3")]
    pub snapshot_key: String,
    #[prost(uint64, tag = "4")]
    pub snapshot_size: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum BatchType {
    Functions = 0,
    Threads = 1,
    Processes = 2,
}

impl BatchExecuteRequest {
    /// THREADS and PROCESSES batches restore from a pushed snapshot.
    pub fn needs_snapshot(&self) -> bool {
        matches!(self.batch_type(), BatchType::Threads | BatchType::Processes)
    }
}

/// Capacity report exchanged between schedulers.
#[derive(Clone, Copy, PartialEq, Serialize, Deserialize, ::prost::Message)]
pub struct HostResources {
    #[prost(int32, tag = "1")]
    pub cores: i32,
    #[prost(int32, tag = "2")]
    pub bound_executors: i32,
    #[prost(int32, tag = "3")]
    pub functions_in_flight: i32,
    #[prost(int32, tag = "4")]
    pub slots: i32,
    #[prost(int32, tag = "5")]
    pub used_slots: i32,
}

impl HostResources {
    /// Cores not currently running a function, floored at zero.
    pub fn available(&self) -> i32 {
        (self.cores - self.functions_in_flight).max(0)
    }
}

/// Request to drop a host from a function's registered-peer set.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UnregisterRequest {
    #[prost(string, tag = "1")]
    pub host: String,
    #[prost(message, optional, tag = "2")]
    pub function: Option<Message>,
}

/// Remote completion of a thread-result promise.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ThreadResultRequest {
    #[prost(uint64, tag = "1")]
    pub message_id: u64,
    #[prost(int32, tag = "2")]
    pub return_value: i32,
}

/// One MPI message between two ranks, point-to-point or collective.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MpiMessage {
    #[prost(int32, tag = "1")]
    pub world_id: i32,
    #[prost(int32, tag = "2")]
    pub sender: i32,
    #[prost(int32, tag = "3")]
    pub destination: i32,
    /// User-level tag, carried but not matched on.
    #[prost(int32, tag = "4")]
    pub tag: i32,
    #[prost(enumeration = "MpiDatatype", tag = "5")]
    pub datatype: i32,
    #[prost(int32, tag = "6")]
    pub count: i32,
    #[prost(bytes = "vec", tag = "7")]
    pub buffer: Vec<u8>,
    #[prost(enumeration = "MpiMessageType", tag = "8")]
    pub message_type: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum MpiDatatype {
    Byte = 0,
    Int = 1,
    Double = 2,
    LongLong = 3,
}

impl MpiDatatype {
    /// Size of one element in bytes. All hosts agree on type layout.
    pub fn size(&self) -> usize {
        match self {
            MpiDatatype::Byte => 1,
            MpiDatatype::Int => 4,
            MpiDatatype::Double => 8,
            MpiDatatype::LongLong => 8,
        }
    }
}

/// Delivery mode distinguishing collective traffic from point-to-point, so
/// a stray NORMAL recv cannot consume collective messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum MpiMessageType {
    Normal = 0,
    Sendrecv = 1,
    Bcast = 2,
    Scatter = 3,
    Gather = 4,
    Allgather = 5,
    Reduce = 6,
    Allreduce = 7,
    Scan = 8,
    Alltoall = 9,
    Barrier = 10,
    RmaRead = 11,
    RmaWrite = 12,
    /// Reply half of an RMA read. A request and its reply must stay
    /// distinguishable even when both carry no payload (count 0 or an
    /// empty window), so the reply gets its own tag.
    RmaReadReply = 13,
}

/// Rank-to-host table for one world, rank `i` at index `i`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MpiHostsToRanksMessage {
    #[prost(int32, tag = "1")]
    pub world_id: i32,
    #[prost(string, repeated, tag = "2")]
    pub hosts: Vec<String>,
}

/// Empty request body for `getResources` and `noop`.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ResourceRequest {}

/// Encode a prost message to bytes.
pub fn encode_message<M: ProstMessage>(msg: &M) -> Vec<u8> {
    msg.encode_to_vec()
}

/// Decode a prost message from bytes.
pub fn decode_message<M>(bytes: &[u8]) -> Result<M>
where
    M: ProstMessage + Default,
{
    M::decode(bytes).map_err(Error::from)
}

// Ids start from a random point so two incarnations of the same host do not
// trivially collide, then count up; uniqueness within a host lifetime is the
// only requirement.
static NEXT_MESSAGE_ID: Lazy<AtomicU64> =
    Lazy::new(|| AtomicU64::new((rand::random::<u32>() as u64) << 32 | 1));

/// Allocate a message id, unique within this host's lifetime.
pub fn next_message_id() -> u64 {
    NEXT_MESSAGE_ID.fetch_add(1, Ordering::SeqCst)
}

/// Result queue key for a message id.
pub fn result_key_from_message_id(id: u64) -> String {
    format!("result:{id}")
}

/// Status key for a message id.
pub fn status_key_from_message_id(id: u64) -> String {
    format!("status:{id}")
}

/// Build an INVOKE message with fresh id and result/status keys.
pub fn message_factory(user: &str, function: &str, master_host: &str) -> Message {
    let id = next_message_id();
    Message {
        id,
        user: user.to_string(),
        function: function.to_string(),
        master_host: master_host.to_string(),
        result_key: result_key_from_message_id(id),
        status_key: status_key_from_message_id(id),
        kind: MessageKind::Invoke as i32,
        ..Default::default()
    }
}

/// Wrap a single message in a FUNCTIONS batch.
pub fn batch_exec_factory(messages: Vec<Message>) -> BatchExecuteRequest {
    BatchExecuteRequest {
        messages,
        batch_type: BatchType::Functions as i32,
        snapshot_key: String::new(),
        snapshot_size: 0,
    }
}

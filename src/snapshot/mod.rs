//! Content-addressed snapshot registry and its push/delete service.
//!
//! Snapshots are immutable byte images held in sealed anonymous in-memory
//! files so peers can restore them by copy-on-write mapping. The client
//! pushes a named snapshot to a peer ahead of dispatching THREADS/PROCESSES
//! batches there.

mod client;
mod registry;
mod server;

pub use client::{
    clear_mock_snapshot_requests, get_snapshot_deletes, get_snapshot_pushes, SnapshotClient,
};
pub use registry::{PageAlignedBuf, SnapshotData, SnapshotRegistry};
pub use server::SnapshotServer;

use crate::error::{Error, Result};

/// Call ids on the snapshot port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SnapshotCall {
    Push = 0,
    Delete = 1,
}

impl TryFrom<u8> for SnapshotCall {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(SnapshotCall::Push),
            1 => Ok(SnapshotCall::Delete),
            other => Err(Error::Transport(format!("unknown snapshot call id {other}"))),
        }
    }
}

/// Flat body for a push: 4-byte LE key length, key, raw snapshot bytes.
/// Large payloads stay a single contiguous slice end to end.
pub(crate) fn encode_push(key: &str, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + key.len() + data.len());
    body.extend_from_slice(&(key.len() as u32).to_le_bytes());
    body.extend_from_slice(key.as_bytes());
    body.extend_from_slice(data);
    body
}

pub(crate) fn decode_push(body: &[u8]) -> Result<(String, bytes::Bytes)> {
    if body.len() < 4 {
        return Err(Error::Transport("snapshot push body too short".to_string()));
    }
    let key_len = u32::from_le_bytes([body[0], body[1], body[2], body[3]]) as usize;
    if body.len() < 4 + key_len {
        return Err(Error::Transport(
            "snapshot push body shorter than its key".to_string(),
        ));
    }
    let key = std::str::from_utf8(&body[4..4 + key_len])
        .map_err(|_| Error::Transport("snapshot key is not utf-8".to_string()))?
        .to_string();
    Ok((key, bytes::Bytes::copy_from_slice(&body[4 + key_len..])))
}

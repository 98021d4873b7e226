//! Snapshot push/delete client.

use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use once_cell::sync::Lazy;
use tracing::debug;

use crate::config::Config;
use crate::error::Result;
use crate::mocking::is_mock_mode;
use crate::snapshot::{encode_push, SnapshotCall};
use crate::transport::MessageEndpointClient;

// Mock logs, ordered per process.
static SNAPSHOT_PUSHES: Lazy<Mutex<Vec<(String, String, Bytes)>>> =
    Lazy::new(|| Mutex::new(Vec::new()));
static SNAPSHOT_DELETES: Lazy<Mutex<Vec<(String, String)>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// `(host, key, bytes)` triples recorded while mock mode was on.
pub fn get_snapshot_pushes() -> Vec<(String, String, Bytes)> {
    SNAPSHOT_PUSHES.lock().unwrap().clone()
}

/// `(host, key)` pairs recorded while mock mode was on.
pub fn get_snapshot_deletes() -> Vec<(String, String)> {
    SNAPSHOT_DELETES.lock().unwrap().clone()
}

pub fn clear_mock_snapshot_requests() {
    SNAPSHOT_PUSHES.lock().unwrap().clear();
    SNAPSHOT_DELETES.lock().unwrap().clear();
}

/// Client for a peer's snapshot service. Both operations are
/// fire-and-forget.
pub struct SnapshotClient {
    host: String,
    client: MessageEndpointClient,
}

impl SnapshotClient {
    pub fn new(host: &str, config: &Config) -> Self {
        Self::with_ports(
            host,
            config.snapshot_port,
            config.reply_port(config.snapshot_port),
            config.client_timeout,
        )
    }

    pub fn with_ports(host: &str, port: u16, reply_port: u16, timeout: Duration) -> Self {
        Self {
            host: host.to_string(),
            client: MessageEndpointClient::new(host, port, reply_port, timeout),
        }
    }

    /// Push a named snapshot to the peer, which registers it locally.
    pub async fn push_snapshot(&self, key: &str, data: Bytes) -> Result<()> {
        if is_mock_mode() {
            SNAPSHOT_PUSHES
                .lock()
                .unwrap()
                .push((self.host.clone(), key.to_string(), data));
            return Ok(());
        }

        debug!(key, host = %self.host, size = data.len(), "pushing snapshot");
        let body = encode_push(key, &data);
        self.client.send_async(SnapshotCall::Push as u8, &body).await
    }

    /// Delete a named snapshot on the peer.
    pub async fn delete_snapshot(&self, key: &str) -> Result<()> {
        if is_mock_mode() {
            SNAPSHOT_DELETES
                .lock()
                .unwrap()
                .push((self.host.clone(), key.to_string()));
            return Ok(());
        }

        debug!(key, host = %self.host, "deleting snapshot");
        self.client
            .send_async(SnapshotCall::Delete as u8, key.as_bytes())
            .await
    }
}

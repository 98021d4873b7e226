//! Snapshot service endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::snapshot::{decode_push, SnapshotCall, SnapshotRegistry};
use crate::transport::{MessageEndpointServer, ServerHandler};

/// Applies pushed snapshots and deletions to the local registry.
pub struct SnapshotServer {
    server: MessageEndpointServer,
}

impl SnapshotServer {
    pub async fn start(registry: Arc<SnapshotRegistry>, config: &Config) -> Result<Self> {
        let handler = Arc::new(SnapshotHandler { registry });
        let server = MessageEndpointServer::start(
            handler,
            &config.bind_host,
            config.snapshot_port,
            config.reply_port(config.snapshot_port),
            config.server_workers,
        )
        .await?;
        Ok(Self { server })
    }

    pub fn async_port(&self) -> u16 {
        self.server.async_port()
    }

    pub fn sync_port(&self) -> u16 {
        self.server.sync_port()
    }

    pub async fn stop(&self) {
        self.server.stop().await;
    }
}

struct SnapshotHandler {
    registry: Arc<SnapshotRegistry>,
}

#[async_trait]
impl ServerHandler for SnapshotHandler {
    async fn handle_async(&self, header: u8, body: Bytes) -> Result<()> {
        match SnapshotCall::try_from(header)? {
            SnapshotCall::Push => {
                let (key, data) = decode_push(&body)?;
                debug!(key, size = data.len(), "received snapshot push");
                self.registry.take(&key, data)
            }
            SnapshotCall::Delete => {
                let key = std::str::from_utf8(&body)
                    .map_err(|_| Error::Transport("snapshot key is not utf-8".to_string()))?;
                self.registry.delete(key);
                Ok(())
            }
        }
    }

    async fn handle_sync(&self, header: u8, _body: Bytes) -> Result<Vec<u8>> {
        Err(Error::Transport(format!(
            "snapshot service has no sync call {header}"
        )))
    }
}

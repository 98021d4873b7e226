//! Cross-host MPI endpoints.
//!
//! Each world keeps one endpoint per remote host that owns at least one of
//! its ranks. Sends are fire-and-forget on the MPI port; the receiving
//! host's [`MpiServer`] routes messages into the right world's local
//! queues. FIFO per sender per socket gives the per-`(s, d)` ordering
//! guarantee.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::messages::{decode_message, encode_message, MpiHostsToRanksMessage, MpiMessage};
use crate::mocking::is_mock_mode;
use crate::mpi::MpiWorldRegistry;
use crate::scheduler::record_mock_mpi_message;
use crate::transport::{MessageEndpointClient, MessageEndpointServer, ServerHandler};

/// Call ids on the MPI port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MpiCall {
    Message = 0,
    HostRankTable = 1,
}

impl TryFrom<u8> for MpiCall {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MpiCall::Message),
            1 => Ok(MpiCall::HostRankTable),
            other => Err(Error::Transport(format!("unknown mpi call id {other}"))),
        }
    }
}

/// Sender half of a host pair. The receive half is the host's
/// [`MpiServer`].
pub struct MpiMessageEndpoint {
    host: String,
    client: MessageEndpointClient,
}

impl MpiMessageEndpoint {
    pub fn new(host: &str, config: &Config) -> Self {
        Self::with_ports(
            host,
            config.mpi_port,
            config.reply_port(config.mpi_port),
            config.client_timeout,
        )
    }

    pub fn with_ports(host: &str, port: u16, reply_port: u16, timeout: Duration) -> Self {
        Self {
            host: host.to_string(),
            client: MessageEndpointClient::new(host, port, reply_port, timeout),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Post one MPI message to the remote host.
    pub async fn send_message(&self, msg: &MpiMessage) -> Result<()> {
        if is_mock_mode() {
            record_mock_mpi_message(&self.host, msg);
            return Ok(());
        }

        debug!(
            host = %self.host,
            world = msg.world_id,
            sender = msg.sender,
            destination = msg.destination,
            "sending mpi message"
        );
        self.client
            .send_async(MpiCall::Message as u8, &encode_message(msg))
            .await
    }

    /// Share a world's rank→host table with the remote host.
    pub async fn send_host_rank_table(&self, table: &MpiHostsToRanksMessage) -> Result<()> {
        if is_mock_mode() {
            return Ok(());
        }
        self.client
            .send_async(MpiCall::HostRankTable as u8, &encode_message(table))
            .await
    }
}

/// Inbound MPI traffic for every world on this host.
pub struct MpiServer {
    server: MessageEndpointServer,
}

impl MpiServer {
    pub async fn start(registry: Arc<MpiWorldRegistry>, config: &Config) -> Result<Self> {
        let handler = Arc::new(MpiHandler { registry });
        let server = MessageEndpointServer::start(
            handler,
            &config.bind_host,
            config.mpi_port,
            config.reply_port(config.mpi_port),
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

struct MpiHandler {
    registry: Arc<MpiWorldRegistry>,
}

#[async_trait]
impl ServerHandler for MpiHandler {
    async fn handle_async(&self, header: u8, body: Bytes) -> Result<()> {
        match MpiCall::try_from(header)? {
            MpiCall::Message => {
                let msg: MpiMessage = decode_message(&body)?;
                self.registry.route_message(msg).await
            }
            MpiCall::HostRankTable => {
                let table: MpiHostsToRanksMessage = decode_message(&body)?;
                self.registry.apply_host_rank_table(table).await
            }
        }
    }

    async fn handle_sync(&self, header: u8, _body: Bytes) -> Result<Vec<u8>> {
        Err(Error::Transport(format!(
            "mpi service has no sync call {header}"
        )))
    }
}

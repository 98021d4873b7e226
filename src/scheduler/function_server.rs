//! Function-call service endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::messages::{
    decode_message, encode_message, BatchExecuteRequest, MpiMessage, ThreadResultRequest,
    UnregisterRequest,
};
use crate::mpi::MpiWorldRegistry;
use crate::scheduler::{FunctionCall, Scheduler};
use crate::transport::{MessageEndpointServer, ServerHandler};

/// Serves batch execution, resource queries, flushes, thread results and
/// inbound MPI messages for this host.
pub struct FunctionCallServer {
    server: MessageEndpointServer,
}

impl FunctionCallServer {
    pub async fn start(
        scheduler: Arc<Scheduler>,
        mpi_registry: Arc<MpiWorldRegistry>,
        config: &Config,
    ) -> Result<Self> {
        let handler = Arc::new(FunctionCallHandler {
            scheduler,
            mpi_registry,
        });
        let server = MessageEndpointServer::start(
            handler,
            &config.bind_host,
            config.function_call_port,
            config.reply_port(config.function_call_port),
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

struct FunctionCallHandler {
    scheduler: Arc<Scheduler>,
    mpi_registry: Arc<MpiWorldRegistry>,
}

#[async_trait]
impl ServerHandler for FunctionCallHandler {
    async fn handle_async(&self, header: u8, _body: Bytes) -> Result<()> {
        Err(Error::Transport(format!(
            "function-call service has no async call {header}"
        )))
    }

    async fn handle_sync(&self, header: u8, body: Bytes) -> Result<Vec<u8>> {
        match FunctionCall::try_from(header)? {
            FunctionCall::ExecuteFunctions => {
                let req: BatchExecuteRequest = decode_message(&body)?;
                debug!(messages = req.messages.len(), "received batch");
                self.scheduler.call_functions(req, true).await?;
                Ok(Vec::new())
            }
            FunctionCall::GetResources => {
                let resources = self.scheduler.get_this_host_resources().await;
                Ok(encode_message(&resources))
            }
            FunctionCall::Unregister => {
                let req: UnregisterRequest = decode_message(&body)?;
                let msg = req.function.ok_or_else(|| {
                    Error::InvalidArgument("unregister request missing function".to_string())
                })?;
                self.scheduler.remove_registered_host(&req.host, &msg).await;
                Ok(Vec::new())
            }
            FunctionCall::Flush => {
                self.scheduler.flush_locally().await?;
                Ok(Vec::new())
            }
            FunctionCall::SetThreadResult => {
                let req: ThreadResultRequest = decode_message(&body)?;
                self.scheduler
                    .set_thread_result_local(req.message_id, req.return_value)
                    .await;
                Ok(Vec::new())
            }
            FunctionCall::MpiMessage => {
                let msg: MpiMessage = decode_message(&body)?;
                self.mpi_registry.route_message(msg).await?;
                Ok(Vec::new())
            }
            FunctionCall::NoOp => Ok(Vec::new()),
        }
    }
}

//! Function-call client.
//!
//! One client per remote host; all operations are request/reply on the
//! sync socket with an empty reply except `getResources`. In mock mode the
//! client appends to process-wide logs instead of touching the network, and
//! `getResources` answers from per-host queued responses.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use once_cell::sync::Lazy;
use tracing::debug;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::messages::{
    decode_message, encode_message, BatchExecuteRequest, HostResources, MpiMessage,
    ResourceRequest, ThreadResultRequest, UnregisterRequest,
};
use crate::mocking::is_mock_mode;
use crate::transport::MessageEndpointClient;

/// Call ids on the function-call port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCall {
    ExecuteFunctions = 0,
    GetResources = 1,
    Unregister = 2,
    Flush = 3,
    SetThreadResult = 4,
    MpiMessage = 5,
    NoOp = 6,
}

impl TryFrom<u8> for FunctionCall {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(FunctionCall::ExecuteFunctions),
            1 => Ok(FunctionCall::GetResources),
            2 => Ok(FunctionCall::Unregister),
            3 => Ok(FunctionCall::Flush),
            4 => Ok(FunctionCall::SetThreadResult),
            5 => Ok(FunctionCall::MpiMessage),
            6 => Ok(FunctionCall::NoOp),
            other => Err(Error::Transport(format!(
                "unknown function call id {other}"
            ))),
        }
    }
}

// Mock logs and canned resource responses.
static BATCH_REQUESTS: Lazy<Mutex<Vec<(String, BatchExecuteRequest)>>> =
    Lazy::new(|| Mutex::new(Vec::new()));
static RESOURCE_RESPONSES: Lazy<Mutex<HashMap<String, VecDeque<HostResources>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));
static UNREGISTER_REQUESTS: Lazy<Mutex<Vec<(String, UnregisterRequest)>>> =
    Lazy::new(|| Mutex::new(Vec::new()));
static FLUSH_CALLS: Lazy<Mutex<Vec<String>>> = Lazy::new(|| Mutex::new(Vec::new()));
static THREAD_RESULTS: Lazy<Mutex<Vec<(String, ThreadResultRequest)>>> =
    Lazy::new(|| Mutex::new(Vec::new()));
static MPI_MESSAGES: Lazy<Mutex<Vec<(String, MpiMessage)>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Queue a canned `getResources` response for a host in mock mode.
pub fn queue_resource_response(host: &str, resources: HostResources) {
    RESOURCE_RESPONSES
        .lock()
        .unwrap()
        .entry(host.to_string())
        .or_default()
        .push_back(resources);
}

pub fn get_batch_requests() -> Vec<(String, BatchExecuteRequest)> {
    BATCH_REQUESTS.lock().unwrap().clone()
}

pub fn get_unregister_requests() -> Vec<(String, UnregisterRequest)> {
    UNREGISTER_REQUESTS.lock().unwrap().clone()
}

pub fn get_flush_calls() -> Vec<String> {
    FLUSH_CALLS.lock().unwrap().clone()
}

pub fn get_thread_results() -> Vec<(String, ThreadResultRequest)> {
    THREAD_RESULTS.lock().unwrap().clone()
}

pub fn get_mpi_messages() -> Vec<(String, MpiMessage)> {
    MPI_MESSAGES.lock().unwrap().clone()
}

pub(crate) fn record_mock_mpi_message(host: &str, msg: &MpiMessage) {
    MPI_MESSAGES
        .lock()
        .unwrap()
        .push((host.to_string(), msg.clone()));
}

pub fn clear_mock_function_calls() {
    BATCH_REQUESTS.lock().unwrap().clear();
    RESOURCE_RESPONSES.lock().unwrap().clear();
    UNREGISTER_REQUESTS.lock().unwrap().clear();
    FLUSH_CALLS.lock().unwrap().clear();
    THREAD_RESULTS.lock().unwrap().clear();
    MPI_MESSAGES.lock().unwrap().clear();
}

/// Client for a peer's function-call service.
pub struct FunctionCallClient {
    host: String,
    client: MessageEndpointClient,
}

impl FunctionCallClient {
    pub fn new(host: &str, config: &Config) -> Self {
        Self::with_ports(
            host,
            config.function_call_port,
            config.reply_port(config.function_call_port),
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

    /// Hand a batch to the peer's scheduler for forced-local execution.
    pub async fn execute_functions(&self, req: &BatchExecuteRequest) -> Result<()> {
        if is_mock_mode() {
            BATCH_REQUESTS
                .lock()
                .unwrap()
                .push((self.host.clone(), req.clone()));
            return Ok(());
        }

        debug!(host = %self.host, messages = req.messages.len(), "forwarding batch");
        self.client
            .request(FunctionCall::ExecuteFunctions as u8, &encode_message(req))
            .await?;
        Ok(())
    }

    /// Ask the peer for its current capacity report.
    pub async fn get_resources(&self) -> Result<HostResources> {
        if is_mock_mode() {
            let canned = RESOURCE_RESPONSES
                .lock()
                .unwrap()
                .get_mut(&self.host)
                .and_then(|queue| queue.pop_front())
                .unwrap_or_default();
            return Ok(canned);
        }

        let reply = self
            .client
            .request(
                FunctionCall::GetResources as u8,
                &encode_message(&ResourceRequest {}),
            )
            .await?;
        decode_message(&reply)
    }

    /// Remove a host from the peer's registered set for a function.
    pub async fn unregister(&self, req: &UnregisterRequest) -> Result<()> {
        if is_mock_mode() {
            UNREGISTER_REQUESTS
                .lock()
                .unwrap()
                .push((self.host.clone(), req.clone()));
            return Ok(());
        }

        self.client
            .request(FunctionCall::Unregister as u8, &encode_message(req))
            .await?;
        Ok(())
    }

    /// Trigger the peer's local flush path.
    pub async fn send_flush(&self) -> Result<()> {
        if is_mock_mode() {
            FLUSH_CALLS.lock().unwrap().push(self.host.clone());
            return Ok(());
        }

        self.client.request(FunctionCall::Flush as u8, &[]).await?;
        Ok(())
    }

    /// Complete a thread-result promise on the message's master host.
    pub async fn set_thread_result(&self, message_id: u64, return_value: i32) -> Result<()> {
        let req = ThreadResultRequest {
            message_id,
            return_value,
        };
        if is_mock_mode() {
            THREAD_RESULTS
                .lock()
                .unwrap()
                .push((self.host.clone(), req));
            return Ok(());
        }

        self.client
            .request(FunctionCall::SetThreadResult as u8, &encode_message(&req))
            .await?;
        Ok(())
    }

    /// Deliver an MPI message to the peer for queueing into its local
    /// world.
    pub async fn send_mpi_message(&self, msg: &MpiMessage) -> Result<()> {
        if is_mock_mode() {
            record_mock_mpi_message(&self.host, msg);
            return Ok(());
        }

        self.client
            .request(FunctionCall::MpiMessage as u8, &encode_message(msg))
            .await?;
        Ok(())
    }

    /// Round-trip with no side effects.
    pub async fn noop(&self) -> Result<()> {
        if is_mock_mode() {
            return Ok(());
        }
        self.client.request(FunctionCall::NoOp as u8, &[]).await?;
        Ok(())
    }
}

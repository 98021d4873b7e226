//! The per-host scheduler.
//!
//! One instance per host process, created once at startup and shared as an
//! `Arc`. All scheduler state sits behind a single write-preferring
//! readers-writer lock; placement decisions hold the writer lock end to end
//! so every admission sees a consistent global view.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use chrono::Utc;
use futures::future::BoxFuture;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::messages::{
    batch_exec_factory, decode_message, encode_message, result_key_from_message_id,
    status_key_from_message_id, BatchExecuteRequest, BatchType, HostResources, Message,
    MessageKind, UnregisterRequest,
};
use crate::mocking::is_test_mode;
use crate::scheduler::executor::{Executor, ExecutorFactory};
use crate::scheduler::function_client::FunctionCallClient;
use crate::snapshot::{SnapshotClient, SnapshotData, SnapshotRegistry};
use crate::store::{
    add_available_host, available_hosts, chained_key, remove_available_host, StateStore,
};

/// Mutable scheduler state, guarded by one writer-priority lock.
#[derive(Default)]
struct SchedulerState {
    resources: HostResources,
    warm: HashMap<String, Vec<Arc<dyn Executor>>>,
    executing: HashMap<String, Vec<Arc<dyn Executor>>>,
    in_flight: HashMap<String, i64>,
    registered_hosts: HashMap<String, HashSet<String>>,
    thread_results: HashMap<u64, watch::Sender<Option<i32>>>,
    recorded_all: Vec<Message>,
    recorded_local: Vec<Message>,
    recorded_shared: Vec<(String, Message)>,
}

impl SchedulerState {
    fn executor_count(&self, func: &str) -> usize {
        self.warm.get(func).map_or(0, Vec::len) + self.executing.get(func).map_or(0, Vec::len)
    }
}

/// Admission, placement and result plumbing for one host.
pub struct Scheduler {
    config: Config,
    this_host: String,
    store: Arc<dyn StateStore>,
    snapshots: Arc<SnapshotRegistry>,
    factory: Arc<dyn ExecutorFactory>,
    state: RwLock<SchedulerState>,
    self_weak: Weak<Scheduler>,
}

impl Scheduler {
    pub fn new(
        config: Config,
        store: Arc<dyn StateStore>,
        snapshots: Arc<SnapshotRegistry>,
        factory: Arc<dyn ExecutorFactory>,
    ) -> Arc<Self> {
        let this_host = config.this_host.clone();
        let cores = config.usable_cores() as i32;
        let mut state = SchedulerState::default();
        state.resources.cores = cores;

        info!(host = %this_host, cores, "scheduler created");

        Arc::new_cyclic(|weak| Self {
            config,
            this_host,
            store,
            snapshots,
            factory,
            state: RwLock::new(state),
            self_weak: weak.clone(),
        })
    }

    /// Narrow callback surface handed to executors.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            inner: self.self_weak.clone(),
        }
    }

    pub fn this_host(&self) -> &str {
        &self.this_host
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn snapshots(&self) -> &Arc<SnapshotRegistry> {
        &self.snapshots
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    pub async fn get_available_hosts(&self) -> Result<HashSet<String>> {
        available_hosts(self.store.as_ref()).await
    }

    /// Announce this host in the membership set.
    pub async fn add_host_to_global_set(&self) -> Result<()> {
        add_available_host(self.store.as_ref(), &self.this_host).await
    }

    pub async fn remove_host_from_global_set(&self, host: &str) -> Result<()> {
        remove_available_host(self.store.as_ref(), host).await
    }

    // ------------------------------------------------------------------
    // Placement
    // ------------------------------------------------------------------

    /// Admit a batch and place every message, locally or on peers.
    ///
    /// Returns one executed-host entry per message, in request order. With
    /// `force_local` all messages run here; otherwise a non-master host
    /// forwards the whole batch back to the master, and the master splits
    /// it across its free cores, the function's registered peers, then any
    /// other live hosts, overloading the remainder locally.
    pub async fn call_functions(
        &self,
        req: BatchExecuteRequest,
        force_local: bool,
    ) -> Result<Vec<String>> {
        let n = req.messages.len();
        if n == 0 {
            return Err(Error::PlacementFailed("empty batch".to_string()));
        }

        let first = req.messages[0].clone();
        let func = first.func_key();
        let master = first.master_host.clone();
        if master.is_empty() {
            warn!(%func, id = first.id, "batch has no master host");
            return Err(Error::PlacementFailed(format!(
                "message {} has no master host",
                first.id
            )));
        }

        let is_threads = matches!(req.batch_type(), BatchType::Threads);
        let mut state = self.state.write().await;

        if !force_local && master != self.this_host {
            // Not the master: hand the whole batch back. Happens on nested
            // batch executions only.
            debug!(%func, n, %master, "forwarding batch back to master");
            let client = FunctionCallClient::new(&master, &self.config);
            client.execute_functions(&req).await?;
            return Ok(vec![master; n]);
        }

        let mut executed = vec![String::new(); n];
        let mut local_idxs: Vec<usize> = Vec::new();

        if force_local {
            for (i, slot) in executed.iter_mut().enumerate() {
                local_idxs.push(i);
                *slot = self.this_host.clone();
            }
        } else {
            // Master with free choice. THREADS/PROCESSES need a pushable
            // snapshot before any distribution happens.
            let snapshot = if req.needs_snapshot() {
                if req.snapshot_key.is_empty() {
                    return Err(Error::PlacementFailed(format!(
                        "empty snapshot for distributed threads/processes ({func})"
                    )));
                }
                Some(self.snapshots.get(&req.snapshot_key)?)
            } else {
                None
            };

            let available = state.resources.available() as usize;
            let n_local = available.min(n);
            if n_local > 0 {
                debug!(%func, n_local, n, "executing locally");
                for (i, slot) in executed.iter_mut().enumerate().take(n_local) {
                    local_idxs.push(i);
                    *slot = self.this_host.clone();
                }
            }

            let mut offset = n_local;

            if offset < n {
                // Distribute the remainder over hosts already registered
                // for this function.
                let registered: Vec<String> = state
                    .registered_hosts
                    .get(&func)
                    .map(|set| set.iter().cloned().collect())
                    .unwrap_or_default();
                for host in registered {
                    let accepted = self
                        .schedule_on_host(&host, &req, &mut executed, offset, snapshot.as_deref())
                        .await?;
                    offset += accepted;
                    if offset >= n {
                        break;
                    }
                }
            }

            if offset < n {
                // Enlist unregistered hosts from the membership set.
                let all_hosts = available_hosts(self.store.as_ref()).await?;
                for host in all_hosts {
                    if host == self.this_host {
                        continue;
                    }
                    if state
                        .registered_hosts
                        .get(&func)
                        .is_some_and(|set| set.contains(&host))
                    {
                        continue;
                    }

                    let accepted = self
                        .schedule_on_host(&host, &req, &mut executed, offset, snapshot.as_deref())
                        .await?;
                    if accepted > 0 {
                        debug!(%func, %host, "registering host");
                        state
                            .registered_hosts
                            .entry(func.clone())
                            .or_default()
                            .insert(host.clone());
                    }
                    offset += accepted;
                    if offset >= n {
                        break;
                    }
                }
            }

            if offset < n {
                // No capacity anywhere: overload the rest locally.
                debug!(%func, overloaded = n - offset, "overloading locally");
                for i in offset..n {
                    local_idxs.push(i);
                    executed[i] = self.this_host.clone();
                }
            }
        }

        if !local_idxs.is_empty() {
            // Register result promises before any work can run, so waiters
            // never race the executor.
            for &i in &local_idxs {
                let id = req.messages[i].id;
                state
                    .thread_results
                    .entry(id)
                    .or_insert_with(|| watch::channel(None).0);
            }

            *state.in_flight.entry(func.clone()).or_default() += local_idxs.len() as i64;
            state.resources.functions_in_flight += local_idxs.len() as i32;

            let shared_req = Arc::new(req.clone());
            if is_threads {
                // One executor serves the whole thread batch; reuse the
                // last executing one when present.
                let executor = match state.executing.get(&func).and_then(|v| v.last()).cloned() {
                    Some(executor) => executor,
                    None => self.claim_executor(&mut state, &first).await?,
                };
                executor
                    .batch_execute_threads(local_idxs.clone(), shared_req)
                    .await?;
            } else {
                for &i in &local_idxs {
                    let executor = self.claim_executor(&mut state, &req.messages[i]).await?;
                    executor.execute_function(i, Arc::clone(&shared_req)).await?;
                }
            }
        }

        if is_test_mode() {
            for (i, host) in executed.iter().enumerate() {
                let msg = req.messages[i].clone();
                state.recorded_all.push(msg.clone());
                if host.is_empty() || *host == self.this_host {
                    state.recorded_local.push(msg);
                } else {
                    state.recorded_shared.push((host.clone(), msg));
                }
            }
        }

        Ok(executed)
    }

    /// Single-message convenience wrapper around a FUNCTIONS batch.
    pub async fn call_function(&self, msg: Message, force_local: bool) -> Result<String> {
        let executed = self
            .call_functions(batch_exec_factory(vec![msg]), force_local)
            .await?;
        Ok(executed.into_iter().next().expect("batch of one"))
    }

    /// Offer part of a batch to one peer, sized by its free cores.
    ///
    /// Pushes the batch snapshot first for THREADS/PROCESSES so the peer
    /// can restore before executing. Returns how many messages the peer
    /// accepted.
    async fn schedule_on_host(
        &self,
        host: &str,
        req: &BatchExecuteRequest,
        executed: &mut [String],
        offset: usize,
        snapshot: Option<&SnapshotData>,
    ) -> Result<usize> {
        let func = req.messages[0].func_key();
        let client = FunctionCallClient::new(host, &self.config);

        let resources = client.get_resources().await?;
        let available = resources.available() as usize;
        if available == 0 {
            debug!(%func, %host, "not scheduling, no resources");
            return Ok(0);
        }

        let remainder = req.messages.len() - offset;
        let accepted = available.min(remainder);

        let host_req = BatchExecuteRequest {
            messages: req.messages[offset..offset + accepted].to_vec(),
            batch_type: req.batch_type,
            snapshot_key: req.snapshot_key.clone(),
            snapshot_size: req.snapshot_size,
        };

        if req.needs_snapshot() {
            let snapshot = snapshot.expect("snapshot checked at admission");
            SnapshotClient::new(host, &self.config)
                .push_snapshot(&req.snapshot_key, snapshot.data.clone())
                .await?;
        }

        debug!(%func, %host, accepted, total = req.messages.len(), "sending sub-batch");
        client.execute_functions(&host_req).await?;

        for slot in executed.iter_mut().skip(offset).take(accepted) {
            *slot = host.to_string();
        }
        Ok(accepted)
    }

    /// Delete a snapshot on every peer registered for a message's
    /// function.
    pub async fn broadcast_snapshot_delete(&self, msg: &Message, snapshot_key: &str) -> Result<()> {
        let hosts = self.get_function_registered_hosts(msg).await;
        for host in hosts {
            SnapshotClient::new(&host, &self.config)
                .delete_snapshot(snapshot_key)
                .await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Executor pool
    // ------------------------------------------------------------------

    /// Claim an executor for a message's function: pop a warm one, scale up
    /// to the core count, or overload a random executing one.
    async fn claim_executor(
        &self,
        state: &mut SchedulerState,
        msg: &Message,
    ) -> Result<Arc<dyn Executor>> {
        let func = msg.func_key();
        let n_warm = state.warm.get(&func).map_or(0, Vec::len);
        let n_executing = state.executing.get(&func).map_or(0, Vec::len);
        let max_executors = state.resources.cores as usize;

        if n_warm > 0 {
            debug!(%func, "reusing warm executor");
            let executor = state
                .warm
                .get_mut(&func)
                .and_then(Vec::pop)
                .expect("warm set is non-empty");
            state
                .executing
                .entry(func)
                .or_default()
                .push(Arc::clone(&executor));
            return Ok(executor);
        }

        if n_warm + n_executing < max_executors {
            debug!(%func, from = n_warm + n_executing, "scaling up");
            let executor = self
                .factory
                .create_executor(msg, self.handle())
                .await?;
            state
                .executing
                .entry(func)
                .or_default()
                .push(Arc::clone(&executor));
            state.resources.bound_executors += 1;
            return Ok(executor);
        }

        // At capacity: overload a random executing executor, which queues
        // the extra job internally.
        let executing = state
            .executing
            .get(&func)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                Error::PlacementFailed(format!("no executors to overload for {func}"))
            })?;
        let idx = rand::thread_rng().gen_range(0..executing.len());
        debug!(%func, idx, executing = executing.len(), "overloading executor");
        Ok(Arc::clone(&executing[idx]))
    }

    /// Park an executing executor back in the warm set.
    pub async fn return_executor(&self, msg: &Message, executor: Arc<dyn Executor>) {
        let func = msg.func_key();
        let mut state = self.state.write().await;
        if let Some(executing) = state.executing.get_mut(&func) {
            executing.retain(|e| e.id() != executor.id());
        }
        state.warm.entry(func).or_default().push(executor);
    }

    /// Account one finished invocation.
    pub async fn notify_call_finished(&self, msg: &Message) {
        let mut state = self.state.write().await;
        let func = msg.func_key();
        if let Some(count) = state.in_flight.get_mut(&func) {
            *count = (*count - 1).max(0);
        }
        state.resources.functions_in_flight = (state.resources.functions_in_flight - 1).max(0);
    }

    /// Drop a finished executor from both pools.
    ///
    /// When this removed the last executor for a function mastered
    /// elsewhere, this host unregisters itself with the master.
    pub async fn notify_executor_finished(&self, executor_id: u64, msg: &Message) -> Result<()> {
        let mut state = self.state.write().await;
        let func = msg.func_key();

        if let Some(warm) = state.warm.get_mut(&func) {
            warm.retain(|e| e.id() != executor_id);
        }
        if let Some(executing) = state.executing.get_mut(&func) {
            executing.retain(|e| e.id() != executor_id);
        }

        if state.executor_count(&func) == 0 && self.this_host != msg.master_host {
            debug!(%func, master = %msg.master_host, "unregistering from master");
            let client = FunctionCallClient::new(&msg.master_host, &self.config);
            let req = UnregisterRequest {
                host: self.this_host.clone(),
                function: Some(msg.clone()),
            };
            client.unregister(&req).await?;
        }

        state.resources.bound_executors = (state.resources.bound_executors - 1).max(0);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Results
    // ------------------------------------------------------------------

    /// Publish a finished invocation: stamp it, enqueue it under the result
    /// key and store it under the status key, both with TTLs.
    pub async fn set_function_result(&self, msg: &mut Message) -> Result<()> {
        msg.executed_host = self.this_host.clone();
        msg.finish_timestamp = Utc::now().timestamp_millis();

        if msg.result_key.is_empty() {
            return Err(Error::InvalidArgument(
                "result key empty, cannot publish result".to_string(),
            ));
        }

        let bytes = encode_message(msg);
        self.store.enqueue_bytes(&msg.result_key, &bytes).await?;
        self.store
            .expire(&msg.result_key, self.config.result_ttl_secs)
            .await?;

        if !msg.status_key.is_empty() {
            self.store.set(&msg.status_key, &bytes).await?;
            self.store
                .expire(&msg.status_key, self.config.status_ttl_secs)
                .await?;
        }
        Ok(())
    }

    /// Wait for (or probe) the result of a message id.
    ///
    /// Blocking (`timeout_ms > 0`) surfaces an expired wait as
    /// `MessageTimeout`; non-blocking returns a synthetic EMPTY message
    /// when nothing has arrived yet.
    pub async fn get_function_result(&self, message_id: u64, timeout_ms: u64) -> Result<Message> {
        if message_id == 0 {
            return Err(Error::InvalidArgument(
                "must provide a non-zero message id".to_string(),
            ));
        }

        let key = result_key_from_message_id(message_id);
        if timeout_ms > 0 {
            match self.store.dequeue_bytes(&key, timeout_ms).await {
                Ok(bytes) => decode_message(&bytes),
                Err(Error::NoResponse) => Err(Error::MessageTimeout),
                Err(err) => Err(err),
            }
        } else {
            match self.store.dequeue_bytes(&key, 0).await {
                Ok(bytes) => decode_message(&bytes),
                Err(Error::NoResponse) => Ok(Message {
                    kind: MessageKind::Empty as i32,
                    ..Default::default()
                }),
                Err(err) => Err(err),
            }
        }
    }

    /// Wait for a chained invocation and fail loudly if it did.
    pub async fn await_chained_call(&self, message_id: u64, timeout_ms: u64) -> Result<Message> {
        let result = self.get_function_result(message_id, timeout_ms).await?;
        if result.return_value != 0 {
            return Err(Error::ChainedCallFailed(format!(
                "chained call {message_id} returned {}: {}",
                result.return_value,
                String::from_utf8_lossy(&result.output_data)
            )));
        }
        Ok(result)
    }

    /// Human-readable status derived from a non-blocking result probe.
    pub async fn get_message_status(&self, message_id: u64) -> Result<String> {
        let result = self.get_function_result(message_id, 0).await?;
        let output = String::from_utf8_lossy(&result.output_data).to_string();
        Ok(match result.kind() {
            MessageKind::Empty => "RUNNING".to_string(),
            _ if result.return_value == 0 => format!("SUCCESS: {output}"),
            _ => format!("FAILED: {output}"),
        })
    }

    /// Create the local promise entry for a message id, so waiters can
    /// register before the work runs.
    pub async fn register_thread(&self, message_id: u64) {
        let mut state = self.state.write().await;
        state
            .thread_results
            .entry(message_id)
            .or_insert_with(|| watch::channel(None).0);
    }

    /// Complete a thread result, locally or by telling the master host.
    pub async fn set_thread_result(&self, msg: &Message, return_value: i32) -> Result<()> {
        if msg.master_host == self.this_host {
            self.set_thread_result_local(msg.id, return_value).await;
            Ok(())
        } else {
            debug!(id = msg.id, return_value, master = %msg.master_host, "sending thread result");
            let client = FunctionCallClient::new(&msg.master_host, &self.config);
            client.set_thread_result(msg.id, return_value).await
        }
    }

    /// Complete the local promise for a message id. Completion is
    /// idempotent for waiters: later awaits return immediately.
    pub async fn set_thread_result_local(&self, message_id: u64, return_value: i32) {
        let mut state = self.state.write().await;
        state
            .thread_results
            .entry(message_id)
            .or_insert_with(|| watch::channel(None).0)
            .send_replace(Some(return_value));
    }

    /// Block until the promise for a message id completes.
    pub async fn await_thread_result(&self, message_id: u64) -> Result<i32> {
        let mut rx = {
            let state = self.state.read().await;
            match state.thread_results.get(&message_id) {
                Some(sender) => sender.subscribe(),
                None => {
                    warn!(message_id, "thread not registered on this host");
                    return Err(Error::UnregisteredThread(message_id));
                }
            }
        };

        loop {
            if let Some(value) = *rx.borrow_and_update() {
                return Ok(value);
            }
            if rx.changed().await.is_err() {
                return Err(Error::UnregisteredThread(message_id));
            }
        }
    }

    // ------------------------------------------------------------------
    // Flush / reset / shutdown
    // ------------------------------------------------------------------

    /// Flush every live host, then this one.
    pub async fn broadcast_flush(&self) -> Result<()> {
        let mut hosts = available_hosts(self.store.as_ref()).await?;
        hosts.remove(&self.this_host);

        for host in hosts {
            let client = FunctionCallClient::new(&host, &self.config);
            client.send_flush().await?;
        }

        self.flush_locally().await
    }

    /// Finalize warm executors and clear execution state. Holds the writer
    /// lock throughout so readers see pre- or post-flush state, never a
    /// mix.
    pub async fn flush_locally(&self) -> Result<()> {
        info!(host = %self.this_host, "flushing host");
        let mut state = self.state.write().await;

        for (_, executors) in state.warm.drain() {
            for executor in executors {
                executor.flush().await?;
                executor.finish().await?;
            }
        }
        state.executing.clear();
        state.in_flight.clear();
        state.resources.functions_in_flight = 0;
        state.resources.bound_executors = 0;
        Ok(())
    }

    /// Drop all executors, peers, counters and records; re-read the core
    /// count. Testing hook.
    pub async fn reset(&self) {
        let mut state = self.state.write().await;

        for (_, executors) in state.warm.drain() {
            for executor in executors {
                if let Err(err) = executor.finish().await {
                    warn!(?err, "executor finish failed during reset");
                }
            }
        }
        // Assumes nothing is currently executing, as callers quiesce first.
        state.executing.clear();

        state.registered_hosts.clear();
        state.in_flight.clear();
        state.recorded_all.clear();
        state.recorded_local.clear();
        state.recorded_shared.clear();

        state.resources = HostResources {
            cores: self.config.usable_cores() as i32,
            ..Default::default()
        };
    }

    /// Reset and leave the membership set.
    pub async fn shutdown(&self) -> Result<()> {
        self.reset().await;
        self.remove_host_from_global_set(&self.this_host).await
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub async fn get_this_host_resources(&self) -> HostResources {
        self.state.read().await.resources
    }

    pub async fn set_this_host_resources(&self, resources: HostResources) {
        self.state.write().await.resources = resources;
    }

    pub async fn get_function_in_flight_count(&self, msg: &Message) -> i64 {
        self.state
            .read()
            .await
            .in_flight
            .get(&msg.func_key())
            .copied()
            .unwrap_or(0)
    }

    pub async fn get_function_executor_count(&self, msg: &Message) -> usize {
        self.state.read().await.executor_count(&msg.func_key())
    }

    pub async fn get_function_registered_hosts(&self, msg: &Message) -> HashSet<String> {
        self.state
            .read()
            .await
            .registered_hosts
            .get(&msg.func_key())
            .cloned()
            .unwrap_or_default()
    }

    pub async fn remove_registered_host(&self, host: &str, msg: &Message) {
        let mut state = self.state.write().await;
        if let Some(set) = state.registered_hosts.get_mut(&msg.func_key()) {
            set.remove(host);
        }
    }

    pub async fn get_recorded_messages_all(&self) -> Vec<Message> {
        self.state.read().await.recorded_all.clone()
    }

    pub async fn get_recorded_messages_local(&self) -> Vec<Message> {
        self.state.read().await.recorded_local.clone()
    }

    pub async fn get_recorded_messages_shared(&self) -> Vec<(String, Message)> {
        self.state.read().await.recorded_shared.clone()
    }

    pub async fn clear_recorded_messages(&self) {
        let mut state = self.state.write().await;
        state.recorded_all.clear();
        state.recorded_local.clear();
        state.recorded_shared.clear();
    }

    // ------------------------------------------------------------------
    // Execution graph
    // ------------------------------------------------------------------

    /// Record a parent→child chaining edge.
    pub async fn log_chained_function(&self, parent_id: u64, chained_id: u64) -> Result<()> {
        let key = chained_key(parent_id);
        self.store.sadd(&key, &chained_id.to_string()).await?;
        self.store.expire(&key, self.config.status_ttl_secs).await
    }

    /// Ids chained directly from a message.
    pub async fn get_chained_functions(&self, message_id: u64) -> Result<HashSet<u64>> {
        let members = self.store.smembers(&chained_key(message_id)).await?;
        Ok(members
            .into_iter()
            .filter_map(|s| s.parse().ok())
            .collect())
    }

    /// Build the tree of chained invocations rooted at a message id.
    pub async fn get_function_exec_graph(&self, message_id: u64) -> Result<ExecGraph> {
        let root = self.exec_graph_node(message_id).await?;
        Ok(ExecGraph { root })
    }

    fn exec_graph_node(&self, message_id: u64) -> BoxFuture<'_, Result<ExecGraphNode>> {
        Box::pin(async move {
            let bytes = self
                .store
                .get(&status_key_from_message_id(message_id))
                .await?;
            let msg: Message = decode_message(&bytes)?;

            let mut chained: Vec<u64> = self
                .get_chained_functions(message_id)
                .await?
                .into_iter()
                .collect();
            chained.sort_unstable();

            let mut children = Vec::with_capacity(chained.len());
            for child in chained {
                children.push(self.exec_graph_node(child).await?);
            }

            Ok(ExecGraphNode { msg, children })
        })
    }
}

/// One node of an execution graph: a finished message and the calls it
/// chained.
#[derive(Debug, Clone, Serialize)]
pub struct ExecGraphNode {
    pub msg: Message,
    pub children: Vec<ExecGraphNode>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecGraph {
    pub root: ExecGraphNode,
}

/// Weak, narrow handle executors use to notify their owning scheduler.
///
/// Carries only the callback surface, never the scheduler itself, so the
/// executor→scheduler edge stays a one-way notification channel.
#[derive(Clone)]
pub struct SchedulerHandle {
    inner: Weak<Scheduler>,
}

impl SchedulerHandle {
    fn upgrade(&self) -> Result<Arc<Scheduler>> {
        self.inner
            .upgrade()
            .ok_or_else(|| Error::InvalidArgument("scheduler no longer running".to_string()))
    }

    pub async fn notify_call_finished(&self, msg: &Message) -> Result<()> {
        self.upgrade()?.notify_call_finished(msg).await;
        Ok(())
    }

    pub async fn notify_executor_finished(&self, executor_id: u64, msg: &Message) -> Result<()> {
        self.upgrade()?
            .notify_executor_finished(executor_id, msg)
            .await
    }

    pub async fn return_executor(&self, msg: &Message, executor: Arc<dyn Executor>) -> Result<()> {
        self.upgrade()?.return_executor(msg, executor).await;
        Ok(())
    }

    pub async fn set_function_result(&self, msg: &mut Message) -> Result<()> {
        self.upgrade()?.set_function_result(msg).await
    }

    pub async fn set_thread_result(&self, msg: &Message, return_value: i32) -> Result<()> {
        self.upgrade()?.set_thread_result(msg, return_value).await
    }
}

//! One MPI world: rank table, queue fabric, point-to-point primitives and
//! the collectives built on them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak};
use std::time::Instant;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{Error, Result};
use crate::messages::{
    batch_exec_factory, decode_message, encode_message, message_factory, Message,
    MessageKind, MpiDatatype, MpiHostsToRanksMessage, MpiMessage, MpiMessageType,
};
use crate::mpi::endpoint::MpiMessageEndpoint;
use crate::mpi::queue::MpiQueue;
use crate::mpi::{op_reduce, MpiOp, MpiStatus};
use crate::scheduler::Scheduler;
use crate::store::{rank_host_key, world_state_key};

/// A memory region one rank exposes for one-sided reads and writes.
///
/// Windows own their buffer; writes are unsynchronized beyond the region
/// lock, so callers coordinate concurrent readers externally.
pub struct RmaWindow {
    data: StdRwLock<Vec<u8>>,
}

impl RmaWindow {
    fn new(size: usize) -> Self {
        Self {
            data: StdRwLock::new(vec![0; size]),
        }
    }

    pub fn size(&self) -> usize {
        self.data.read().unwrap().len()
    }

    pub fn read(&self) -> Vec<u8> {
        self.data.read().unwrap().clone()
    }

    pub fn read_into(&self, buf: &mut [u8]) {
        let data = self.data.read().unwrap();
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
    }

    /// Copy `data` over the start of the window.
    pub fn write(&self, data: &[u8]) {
        let mut window = self.data.write().unwrap();
        let n = window.len().min(data.len());
        window[..n].copy_from_slice(&data[..n]);
    }
}

struct WorldMeta {
    id: i32,
    size: i32,
    this_host: String,
    user: String,
    function: String,
}

/// A group of ranks exchanging MPI messages, possibly split across hosts.
///
/// Same-host traffic goes through per-`(sender, destination)` queues;
/// cross-host traffic through one endpoint per remote host. Receives are
/// oblivious to locality: they always pop the local queue.
pub struct MpiWorld {
    scheduler: Arc<Scheduler>,
    meta: StdRwLock<WorldMeta>,
    rank_hosts: RwLock<HashMap<i32, String>>,
    queues: StdMutex<HashMap<(i32, i32), Arc<MpiQueue>>>,
    windows: StdRwLock<HashMap<i32, Arc<RmaWindow>>>,
    remote_endpoints: Mutex<HashMap<String, Arc<MpiMessageEndpoint>>>,
    async_requests: StdMutex<HashMap<i32, JoinHandle<Result<Option<MpiMessage>>>>>,
    next_request_id: AtomicI32,
    created_at: Instant,
    self_weak: Weak<MpiWorld>,
}

impl MpiWorld {
    pub fn new(scheduler: Arc<Scheduler>) -> Arc<Self> {
        let this_host = scheduler.this_host().to_string();
        Arc::new_cyclic(|weak| Self {
            scheduler,
            meta: StdRwLock::new(WorldMeta {
                id: -1,
                size: 0,
                this_host,
                user: String::new(),
                function: String::new(),
            }),
            rank_hosts: RwLock::new(HashMap::new()),
            queues: StdMutex::new(HashMap::new()),
            windows: StdRwLock::new(HashMap::new()),
            remote_endpoints: Mutex::new(HashMap::new()),
            async_requests: StdMutex::new(HashMap::new()),
            next_request_id: AtomicI32::new(1),
            created_at: Instant::now(),
            self_weak: weak.clone(),
        })
    }

    fn strong(&self) -> Arc<MpiWorld> {
        self.self_weak
            .upgrade()
            .expect("world is only reachable through its Arc")
    }

    pub fn id(&self) -> i32 {
        self.meta.read().unwrap().id
    }

    pub fn size(&self) -> i32 {
        self.meta.read().unwrap().size
    }

    pub fn user(&self) -> String {
        self.meta.read().unwrap().user.clone()
    }

    pub fn function(&self) -> String {
        self.meta.read().unwrap().function.clone()
    }

    pub fn this_host(&self) -> String {
        self.meta.read().unwrap().this_host.clone()
    }

    /// Pretend to be a different host. Testing hook; call before `create`
    /// or `initialise_from_msg`.
    pub fn override_host(&self, host: &str) {
        self.meta.write().unwrap().this_host = host.to_string();
    }

    /// Wall-clock seconds since this world instance was created.
    pub fn get_w_time(&self) -> f64 {
        self.created_at.elapsed().as_secs_f64()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Create a world as rank 0: claim the id, schedule the other `size-1`
    /// ranks through the scheduler and publish the rank→host table.
    pub async fn create(&self, call: &Message, world_id: i32, size: i32) -> Result<()> {
        if size <= 0 {
            return Err(Error::InvalidArgument(format!(
                "world size must be positive, got {size}"
            )));
        }

        let this_host = {
            let mut meta = self.meta.write().unwrap();
            meta.id = world_id;
            meta.size = size;
            meta.user = call.user.clone();
            meta.function = call.function.clone();
            meta.this_host.clone()
        };

        debug!(world_id, size, host = %this_host, "creating mpi world");

        self.set_rank_host(world_id, 0, &this_host).await?;

        if size > 1 {
            let mut messages = Vec::with_capacity((size - 1) as usize);
            for rank in 1..size {
                let mut msg = message_factory(&call.user, &call.function, &this_host);
                msg.is_mpi = true;
                msg.mpi_world_id = world_id;
                msg.mpi_rank = rank;
                msg.mpi_world_size = size;
                msg.kind = MessageKind::Invoke as i32;
                messages.push(msg);
            }

            let req = batch_exec_factory(messages);
            let executed = self.scheduler.call_functions(req, false).await?;

            for (i, host) in executed.iter().enumerate() {
                let rank = (i + 1) as i32;
                let host = if host.is_empty() { &this_host } else { host };
                self.set_rank_host(world_id, rank, host).await?;
            }
        }

        self.push_world_state().await
    }

    /// Join a world as a non-zero rank, reading the rank table published
    /// by the creator. `force_local` skips opening cross-host endpoints.
    pub async fn initialise_from_msg(&self, msg: &Message, force_local: bool) -> Result<()> {
        let this_host = {
            let mut meta = self.meta.write().unwrap();
            meta.id = msg.mpi_world_id;
            meta.size = msg.mpi_world_size;
            meta.user = msg.user.clone();
            meta.function = msg.function.clone();
            meta.this_host.clone()
        };

        let state_bytes = self
            .scheduler
            .store()
            .get(&world_state_key(msg.mpi_world_id))
            .await?;
        let table: MpiHostsToRanksMessage = decode_message(&state_bytes)?;
        {
            let mut rank_hosts = self.rank_hosts.write().await;
            for (rank, host) in table.hosts.iter().enumerate() {
                rank_hosts.insert(rank as i32, host.clone());
            }
        }

        // Register where this rank actually lives.
        if msg.mpi_rank >= 0 {
            self.set_rank_host(msg.mpi_world_id, msg.mpi_rank, &this_host)
                .await?;
        }

        if !force_local {
            self.open_remote_endpoints().await;
        }

        debug!(
            world_id = msg.mpi_world_id,
            rank = msg.mpi_rank,
            size = msg.mpi_world_size,
            "initialised world from message"
        );
        Ok(())
    }

    async fn set_rank_host(&self, world_id: i32, rank: i32, host: &str) -> Result<()> {
        self.rank_hosts.write().await.insert(rank, host.to_string());
        self.scheduler
            .store()
            .set(&rank_host_key(world_id, rank), host.as_bytes())
            .await
    }

    /// Publish the full rank→host table for joiners.
    async fn push_world_state(&self) -> Result<()> {
        let (world_id, size) = {
            let meta = self.meta.read().unwrap();
            (meta.id, meta.size)
        };

        let rank_hosts = self.rank_hosts.read().await;
        let mut hosts = Vec::with_capacity(size as usize);
        for rank in 0..size {
            hosts.push(rank_hosts.get(&rank).cloned().unwrap_or_default());
        }

        let table = MpiHostsToRanksMessage { world_id, hosts };
        self.scheduler
            .store()
            .set(&world_state_key(world_id), &encode_message(&table))
            .await
    }

    /// Create a send endpoint for every other host owning a rank.
    async fn open_remote_endpoints(&self) {
        let this_host = self.this_host();
        let hosts: Vec<String> = {
            let rank_hosts = self.rank_hosts.read().await;
            rank_hosts
                .values()
                .filter(|h| **h != this_host && !h.is_empty())
                .cloned()
                .collect()
        };

        let mut endpoints = self.remote_endpoints.lock().await;
        for host in hosts {
            endpoints.entry(host.clone()).or_insert_with(|| {
                Arc::new(MpiMessageEndpoint::new(&host, self.scheduler.config()))
            });
        }
    }

    /// Tear the world down: cancel async requests, drop queues, windows
    /// and endpoints. Idempotent.
    pub async fn destroy(&self) {
        let handles: Vec<JoinHandle<_>> = {
            let mut requests = self.async_requests.lock().unwrap();
            requests.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.abort();
        }

        self.queues.lock().unwrap().clear();
        self.windows.write().unwrap().clear();
        self.remote_endpoints.lock().await.clear();
        debug!(world_id = self.id(), "destroyed mpi world");
    }

    // ------------------------------------------------------------------
    // Rank plumbing
    // ------------------------------------------------------------------

    /// Host owning a rank, from the local table or the shared store.
    pub async fn get_host_for_rank(&self, rank: i32) -> Result<String> {
        self.check_rank(rank)?;

        if let Some(host) = self.rank_hosts.read().await.get(&rank) {
            return Ok(host.clone());
        }

        let bytes = self
            .scheduler
            .store()
            .get(&rank_host_key(self.id(), rank))
            .await
            .map_err(|_| Error::NotFound(format!("no host for rank {rank}")))?;
        let host = String::from_utf8(bytes)
            .map_err(|_| Error::Store(format!("rank {rank} host is not utf-8")))?;

        self.rank_hosts.write().await.insert(rank, host.clone());
        Ok(host)
    }

    fn check_rank(&self, rank: i32) -> Result<()> {
        let size = self.size();
        if rank < 0 || rank >= size {
            return Err(Error::InvalidArgument(format!(
                "rank {rank} out of range for world of size {size}"
            )));
        }
        Ok(())
    }

    fn queue_for(&self, send_rank: i32, recv_rank: i32) -> Arc<MpiQueue> {
        let mut queues = self.queues.lock().unwrap();
        Arc::clone(
            queues
                .entry((send_rank, recv_rank))
                .or_insert_with(|| Arc::new(MpiQueue::new())),
        )
    }

    /// The local in-memory queue for a rank pair. Only destinations on
    /// this host have one.
    pub async fn get_local_queue(&self, send_rank: i32, recv_rank: i32) -> Result<Arc<MpiQueue>> {
        self.check_rank(send_rank)?;
        let host = self.get_host_for_rank(recv_rank).await?;
        if host != self.this_host() {
            return Err(Error::InvalidArgument(format!(
                "rank {recv_rank} lives on {host}, not this host"
            )));
        }
        Ok(self.queue_for(send_rank, recv_rank))
    }

    pub async fn get_local_queue_size(&self, send_rank: i32, recv_rank: i32) -> Result<usize> {
        Ok(self.get_local_queue(send_rank, recv_rank).await?.len())
    }

    async fn endpoint_for(&self, host: &str) -> Arc<MpiMessageEndpoint> {
        let mut endpoints = self.remote_endpoints.lock().await;
        Arc::clone(endpoints.entry(host.to_string()).or_insert_with(|| {
            Arc::new(MpiMessageEndpoint::new(host, self.scheduler.config()))
        }))
    }

    /// Route an inbound message from a peer host: RMA operations execute
    /// on receipt, everything else (read replies included) lands on the
    /// destination queue.
    pub async fn handle_incoming(&self, msg: MpiMessage) -> Result<()> {
        match msg.message_type() {
            MpiMessageType::RmaWrite => self.synchronize_rma_write(&msg),
            MpiMessageType::RmaRead => self.respond_rma_read(msg).await,
            _ => self.enqueue_message(msg).await,
        }
    }

    /// Queue a message for a destination rank on this host.
    pub async fn enqueue_message(&self, msg: MpiMessage) -> Result<()> {
        let host = self.get_host_for_rank(msg.destination).await?;
        if host != self.this_host() {
            return Err(Error::InvalidArgument(format!(
                "message for rank {} routed to the wrong host",
                msg.destination
            )));
        }
        self.queue_for(msg.sender, msg.destination).push(msg);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Point-to-point
    // ------------------------------------------------------------------

    /// Send `count` elements to a rank, locally or across hosts.
    pub async fn send(
        &self,
        send_rank: i32,
        recv_rank: i32,
        data: &[u8],
        datatype: MpiDatatype,
        count: usize,
        message_type: MpiMessageType,
    ) -> Result<()> {
        self.check_rank(send_rank)?;
        self.check_rank(recv_rank)?;

        let payload_len = (count * datatype.size()).min(data.len());
        let msg = MpiMessage {
            world_id: self.id(),
            sender: send_rank,
            destination: recv_rank,
            datatype: datatype as i32,
            count: count as i32,
            buffer: data[..payload_len].to_vec(),
            message_type: message_type as i32,
            ..Default::default()
        };

        let dest_host = self.get_host_for_rank(recv_rank).await?;
        if dest_host == self.this_host() {
            self.queue_for(send_rank, recv_rank).push(msg);
        } else {
            self.endpoint_for(&dest_host).await.send_message(&msg).await?;
        }
        Ok(())
    }

    /// Receive from a rank into `buf`. Always pops the local queue; the
    /// head must carry the expected message type and datatype. Shorter
    /// payloads than requested are fine and reported in the status.
    pub async fn recv(
        &self,
        send_rank: i32,
        recv_rank: i32,
        buf: &mut [u8],
        datatype: MpiDatatype,
        count: usize,
        message_type: MpiMessageType,
    ) -> Result<MpiStatus> {
        let queue = self.get_local_queue(send_rank, recv_rank).await?;
        let msg = queue.pop(message_type, Some(datatype)).await?;

        let n = msg
            .buffer
            .len()
            .min(buf.len())
            .min(count * datatype.size());
        buf[..n].copy_from_slice(&msg.buffer[..n]);

        Ok(MpiStatus {
            source: msg.sender,
            bytes_size: msg.buffer.len(),
        })
    }

    /// Report the head message waiting from a rank without consuming it.
    pub async fn probe(&self, send_rank: i32, recv_rank: i32) -> Result<MpiStatus> {
        let queue = self.get_local_queue(send_rank, recv_rank).await?;
        let msg = queue.peek().await;
        Ok(MpiStatus {
            source: msg.sender,
            bytes_size: msg.buffer.len(),
        })
    }

    /// Queue an asynchronous send; returns a request id to await.
    pub fn isend(
        &self,
        send_rank: i32,
        recv_rank: i32,
        data: &[u8],
        datatype: MpiDatatype,
        count: usize,
        message_type: MpiMessageType,
    ) -> i32 {
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let world = self.strong();
        let data = data.to_vec();
        let handle = tokio::spawn(async move {
            world
                .send(send_rank, recv_rank, &data, datatype, count, message_type)
                .await
                .map(|_| None)
        });
        self.async_requests
            .lock()
            .unwrap()
            .insert(request_id, handle);
        request_id
    }

    /// Queue an asynchronous receive; the awaited request resolves to the
    /// received message for the caller to copy out.
    pub fn irecv(
        &self,
        send_rank: i32,
        recv_rank: i32,
        datatype: MpiDatatype,
        _count: usize,
        message_type: MpiMessageType,
    ) -> i32 {
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let world = self.strong();
        let handle = tokio::spawn(async move {
            let queue = world.get_local_queue(send_rank, recv_rank).await?;
            let msg = queue.pop(message_type, Some(datatype)).await?;
            Ok(Some(msg))
        });
        self.async_requests
            .lock()
            .unwrap()
            .insert(request_id, handle);
        request_id
    }

    /// Block until an async request completes. Sends resolve to `None`,
    /// receives to the delivered message.
    pub async fn await_async_request(&self, request_id: i32) -> Result<Option<MpiMessage>> {
        let handle = self
            .async_requests
            .lock()
            .unwrap()
            .remove(&request_id)
            .ok_or_else(|| Error::NotFound(format!("async request {request_id}")))?;
        handle
            .await
            .map_err(|e| Error::Transport(format!("async request failed: {e}")))?
    }

    /// Concurrent send to one neighbour and receive from another, as one
    /// operation.
    #[allow(clippy::too_many_arguments)]
    pub async fn send_recv(
        &self,
        send_data: &[u8],
        send_count: usize,
        dest_rank: i32,
        recv_buf: &mut [u8],
        recv_count: usize,
        source_rank: i32,
        my_rank: i32,
        datatype: MpiDatatype,
    ) -> Result<MpiStatus> {
        let send_id = self.isend(
            my_rank,
            dest_rank,
            send_data,
            datatype,
            send_count,
            MpiMessageType::Sendrecv,
        );
        let status = self
            .recv(
                source_rank,
                my_rank,
                recv_buf,
                datatype,
                recv_count,
                MpiMessageType::Sendrecv,
            )
            .await?;
        self.await_async_request(send_id).await?;
        Ok(status)
    }

    // ------------------------------------------------------------------
    // Collectives
    // ------------------------------------------------------------------

    /// All ranks enter before any rank leaves: rank 0 collects a token
    /// from everyone, then broadcasts the release.
    pub async fn barrier(&self, this_rank: i32) -> Result<()> {
        let size = self.size();
        if this_rank == 0 {
            for rank in 1..size {
                self.recv(rank, 0, &mut [], MpiDatatype::Byte, 0, MpiMessageType::Barrier)
                    .await?;
            }
            self.broadcast(0, &[], MpiDatatype::Byte, 0, MpiMessageType::Barrier)
                .await?;
        } else {
            self.send(this_rank, 0, &[], MpiDatatype::Byte, 0, MpiMessageType::Barrier)
                .await?;
            self.recv(0, this_rank, &mut [], MpiDatatype::Byte, 0, MpiMessageType::Barrier)
                .await?;
        }
        Ok(())
    }

    /// Root-side fan-out to every other rank. Non-roots receive with the
    /// same message type.
    pub async fn broadcast(
        &self,
        send_rank: i32,
        data: &[u8],
        datatype: MpiDatatype,
        count: usize,
        message_type: MpiMessageType,
    ) -> Result<()> {
        for rank in 0..self.size() {
            if rank == send_rank {
                continue;
            }
            self.send(send_rank, rank, data, datatype, count, message_type)
                .await?;
        }
        Ok(())
    }

    /// Split root's buffer into equal slices, slice `i` to rank `i`.
    #[allow(clippy::too_many_arguments)]
    pub async fn scatter(
        &self,
        send_rank: i32,
        recv_rank: i32,
        send_data: &[u8],
        send_count: usize,
        recv_buf: &mut [u8],
        recv_count: usize,
        datatype: MpiDatatype,
    ) -> Result<()> {
        let chunk = send_count * datatype.size();

        if recv_rank == send_rank {
            let needed = chunk * self.size() as usize;
            if send_data.len() < needed {
                return Err(Error::InvalidArgument(format!(
                    "scatter buffer too small: {} < {needed}",
                    send_data.len()
                )));
            }
            for rank in 0..self.size() {
                let slice = &send_data[rank as usize * chunk..(rank as usize + 1) * chunk];
                if rank == send_rank {
                    recv_buf[..chunk].copy_from_slice(slice);
                } else {
                    self.send(
                        send_rank,
                        rank,
                        slice,
                        datatype,
                        send_count,
                        MpiMessageType::Scatter,
                    )
                    .await?;
                }
            }
            Ok(())
        } else {
            self.recv(
                send_rank,
                recv_rank,
                recv_buf,
                datatype,
                recv_count,
                MpiMessageType::Scatter,
            )
            .await
            .map(|_| ())
        }
    }

    /// Inverse of scatter: root assembles slice `i` from rank `i`. An
    /// empty `send_data` at any rank means its slice is already in place
    /// in `recv_buf` (in-place gather).
    #[allow(clippy::too_many_arguments)]
    pub async fn gather(
        &self,
        send_rank: i32,
        recv_rank: i32,
        send_data: &[u8],
        send_count: usize,
        recv_buf: &mut [u8],
        recv_count: usize,
        datatype: MpiDatatype,
    ) -> Result<()> {
        let chunk = recv_count * datatype.size();

        if send_rank == recv_rank {
            let root = recv_rank as usize;
            if !send_data.is_empty() {
                recv_buf[root * chunk..(root + 1) * chunk]
                    .copy_from_slice(&send_data[..chunk]);
            }
            for rank in 0..self.size() {
                if rank == recv_rank {
                    continue;
                }
                let offset = rank as usize * chunk;
                self.recv(
                    rank,
                    recv_rank,
                    &mut recv_buf[offset..offset + chunk],
                    datatype,
                    recv_count,
                    MpiMessageType::Gather,
                )
                .await?;
            }
            Ok(())
        } else {
            let own: Vec<u8>;
            let payload = if send_data.is_empty() {
                let offset = send_rank as usize * chunk;
                own = recv_buf[offset..offset + chunk].to_vec();
                &own[..]
            } else {
                send_data
            };
            self.send(
                send_rank,
                recv_rank,
                payload,
                datatype,
                send_count,
                MpiMessageType::Gather,
            )
            .await
        }
    }

    /// Gather to rank 0 followed by a broadcast of the assembled buffer.
    pub async fn all_gather(
        &self,
        rank: i32,
        send_data: &[u8],
        send_count: usize,
        recv_buf: &mut [u8],
        recv_count: usize,
        datatype: MpiDatatype,
    ) -> Result<()> {
        let total = recv_count * self.size() as usize;

        if rank == 0 {
            self.gather(0, 0, send_data, send_count, recv_buf, recv_count, datatype)
                .await?;
            let full = recv_buf[..total * datatype.size()].to_vec();
            self.broadcast(0, &full, datatype, total, MpiMessageType::Allgather)
                .await
        } else {
            // In-place: the rank's own slice already sits in recv_buf.
            let chunk = recv_count * datatype.size();
            let own: Vec<u8> = if send_data.is_empty() {
                let offset = rank as usize * chunk;
                recv_buf[offset..offset + chunk].to_vec()
            } else {
                send_data.to_vec()
            };
            self.gather(rank, 0, &own, send_count, &mut [], recv_count, datatype)
                .await?;
            self.recv(0, rank, recv_buf, datatype, total, MpiMessageType::Allgather)
                .await
                .map(|_| ())
        }
    }

    /// Fold every rank's buffer into the root. An empty `send_data` at the
    /// root means `recv_buf` already holds its contribution (in-place).
    #[allow(clippy::too_many_arguments)]
    pub async fn reduce(
        &self,
        send_rank: i32,
        recv_rank: i32,
        send_data: &[u8],
        recv_buf: &mut [u8],
        datatype: MpiDatatype,
        count: usize,
        op: MpiOp,
    ) -> Result<()> {
        let nbytes = count * datatype.size();

        if send_rank == recv_rank {
            if !send_data.is_empty() {
                recv_buf[..nbytes].copy_from_slice(&send_data[..nbytes]);
            }
            let mut incoming = vec![0u8; nbytes];
            for rank in 0..self.size() {
                if rank == recv_rank {
                    continue;
                }
                self.recv(
                    rank,
                    recv_rank,
                    &mut incoming,
                    datatype,
                    count,
                    MpiMessageType::Reduce,
                )
                .await?;
                op_reduce(op, datatype, count, &incoming, recv_buf)?;
            }
            Ok(())
        } else {
            self.send(
                send_rank,
                recv_rank,
                send_data,
                datatype,
                count,
                MpiMessageType::Reduce,
            )
            .await
        }
    }

    /// Reduce to rank 0 then broadcast, leaving the folded value at every
    /// rank.
    pub async fn all_reduce(
        &self,
        rank: i32,
        send_data: &[u8],
        recv_buf: &mut [u8],
        datatype: MpiDatatype,
        count: usize,
        op: MpiOp,
    ) -> Result<()> {
        if rank == 0 {
            self.reduce(0, 0, send_data, recv_buf, datatype, count, op)
                .await?;
            let folded = recv_buf[..count * datatype.size()].to_vec();
            self.broadcast(0, &folded, datatype, count, MpiMessageType::Allreduce)
                .await
        } else {
            self.reduce(rank, 0, send_data, &mut [], datatype, count, op)
                .await?;
            self.recv(0, rank, recv_buf, datatype, count, MpiMessageType::Allreduce)
                .await
                .map(|_| ())
        }
    }

    /// Inclusive prefix fold, pipelined rank to rank: rank `r` ends with
    /// `fold(op, x_0..x_r)`.
    pub async fn scan(
        &self,
        rank: i32,
        send_data: &[u8],
        recv_buf: &mut [u8],
        datatype: MpiDatatype,
        count: usize,
        op: MpiOp,
    ) -> Result<()> {
        let nbytes = count * datatype.size();

        if !send_data.is_empty() {
            recv_buf[..nbytes].copy_from_slice(&send_data[..nbytes]);
        }

        if rank > 0 {
            let mut prefix = vec![0u8; nbytes];
            self.recv(rank - 1, rank, &mut prefix, datatype, count, MpiMessageType::Scan)
                .await?;
            op_reduce(op, datatype, count, &prefix, recv_buf)?;
        }

        if rank < self.size() - 1 {
            self.send(
                rank,
                rank + 1,
                &recv_buf[..nbytes],
                datatype,
                count,
                MpiMessageType::Scan,
            )
            .await?;
        }
        Ok(())
    }

    /// Rank `i` sends its `j`-th slice to rank `j`, which stores it at
    /// position `i`.
    #[allow(clippy::too_many_arguments)]
    pub async fn all_to_all(
        &self,
        rank: i32,
        send_data: &[u8],
        send_count: usize,
        recv_buf: &mut [u8],
        recv_count: usize,
        datatype: MpiDatatype,
    ) -> Result<()> {
        let chunk = send_count * datatype.size();
        let me = rank as usize;

        for other in 0..self.size() {
            if other == rank {
                continue;
            }
            let slice = &send_data[other as usize * chunk..(other as usize + 1) * chunk];
            self.send(rank, other, slice, datatype, send_count, MpiMessageType::Alltoall)
                .await?;
        }

        recv_buf[me * chunk..(me + 1) * chunk]
            .copy_from_slice(&send_data[me * chunk..(me + 1) * chunk]);

        for other in 0..self.size() {
            if other == rank {
                continue;
            }
            let offset = other as usize * chunk;
            self.recv(
                other,
                rank,
                &mut recv_buf[offset..offset + chunk],
                datatype,
                recv_count,
                MpiMessageType::Alltoall,
            )
            .await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Cartesian topology
    // ------------------------------------------------------------------

    /// Row-major coordinates of a rank in a periodic grid.
    pub fn get_cartesian_rank(&self, rank: i32, dims: &[i32; 3]) -> Result<[i32; 3]> {
        self.check_rank(rank)?;
        if dims.iter().any(|d| *d <= 0) {
            return Err(Error::InvalidArgument(format!(
                "cartesian dims must be positive: {dims:?}"
            )));
        }
        Ok([
            rank / (dims[1] * dims[2]),
            (rank / dims[2]) % dims[1],
            rank % dims[2],
        ])
    }

    pub fn get_rank_from_coords(&self, coords: &[i32; 3], dims: &[i32; 3]) -> i32 {
        coords[0] * dims[1] * dims[2] + coords[1] * dims[2] + coords[2]
    }

    /// Periodic shift along one dimension: who sends to this rank and
    /// whom this rank sends to, at displacement `disp`.
    pub fn shift_cartesian_coords(
        &self,
        rank: i32,
        direction: usize,
        disp: i32,
        dims: &[i32; 3],
    ) -> Result<(i32, i32)> {
        if direction >= 3 {
            return Err(Error::InvalidArgument(format!(
                "cartesian direction {direction} out of range"
            )));
        }
        let coords = self.get_cartesian_rank(rank, dims)?;
        let extent = dims[direction];

        let mut source = coords;
        source[direction] = (coords[direction] - disp).rem_euclid(extent);
        let mut destination = coords;
        destination[direction] = (coords[direction] + disp).rem_euclid(extent);

        Ok((
            self.get_rank_from_coords(&source, dims),
            self.get_rank_from_coords(&destination, dims),
        ))
    }

    // ------------------------------------------------------------------
    // RMA
    // ------------------------------------------------------------------

    /// Register a window of `size` bytes for a rank on this host.
    pub fn create_window(&self, rank: i32, size: usize) -> Arc<RmaWindow> {
        let window = Arc::new(RmaWindow::new(size));
        self.windows
            .write()
            .unwrap()
            .insert(rank, Arc::clone(&window));
        window
    }

    pub fn get_window(&self, rank: i32) -> Result<Arc<RmaWindow>> {
        self.windows
            .read()
            .unwrap()
            .get(&rank)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no rma window for rank {rank}")))
    }

    /// One-sided read from a rank's window into `recv_buf`.
    pub async fn rma_get(
        &self,
        origin_rank: i32,
        target_rank: i32,
        datatype: MpiDatatype,
        count: usize,
        recv_buf: &mut [u8],
    ) -> Result<()> {
        let nbytes = count * datatype.size();
        let target_host = self.get_host_for_rank(target_rank).await?;

        if target_host == self.this_host() {
            let window = self.get_window(target_rank)?;
            let data = window.read();
            let n = nbytes.min(data.len()).min(recv_buf.len());
            recv_buf[..n].copy_from_slice(&data[..n]);
            return Ok(());
        }

        // Remote read: the request carries no payload, only the count;
        // the reply lands on the (target, origin) queue with the window
        // contents.
        self.send(
            origin_rank,
            target_rank,
            &[],
            datatype,
            count,
            MpiMessageType::RmaRead,
        )
        .await?;

        let queue = self.queue_for(target_rank, origin_rank);
        let msg = queue.pop(MpiMessageType::RmaReadReply, Some(datatype)).await?;
        let n = nbytes.min(msg.buffer.len()).min(recv_buf.len());
        recv_buf[..n].copy_from_slice(&msg.buffer[..n]);
        Ok(())
    }

    /// One-sided write of `data` into a rank's window.
    pub async fn rma_put(
        &self,
        origin_rank: i32,
        data: &[u8],
        datatype: MpiDatatype,
        count: usize,
        target_rank: i32,
    ) -> Result<()> {
        let nbytes = (count * datatype.size()).min(data.len());
        let target_host = self.get_host_for_rank(target_rank).await?;

        if target_host == self.this_host() {
            let window = self.get_window(target_rank)?;
            window.write(&data[..nbytes]);
            return Ok(());
        }

        self.send(
            origin_rank,
            target_rank,
            data,
            datatype,
            count,
            MpiMessageType::RmaWrite,
        )
        .await
    }

    /// Apply a remote RMA write to the local window on receipt.
    pub fn synchronize_rma_write(&self, msg: &MpiMessage) -> Result<()> {
        let window = self.get_window(msg.destination)?;
        window.write(&msg.buffer);
        Ok(())
    }

    /// Serve a remote RMA read request by sending the window contents
    /// back to the origin rank.
    async fn respond_rma_read(&self, msg: MpiMessage) -> Result<()> {
        let window = self.get_window(msg.destination)?;
        let data = window.read();
        let nbytes = (msg.count as usize * msg.datatype().size()).min(data.len());
        self.send(
            msg.destination,
            msg.sender,
            &data[..nbytes],
            msg.datatype(),
            msg.count as usize,
            MpiMessageType::RmaReadReply,
        )
        .await
    }
}

//! Shared fixtures for unit and integration tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::config::Config;
use crate::error::Result;
use crate::messages::{BatchExecuteRequest, Message};
use crate::mocking::{set_mock_mode, set_test_mode};
use crate::scheduler::{
    clear_mock_function_calls, Executor, ExecutorFactory, Scheduler, SchedulerHandle,
};
use crate::snapshot::{clear_mock_snapshot_requests, SnapshotRegistry};
use crate::store::MemoryStore;

static NEXT_EXECUTOR_ID: AtomicU64 = AtomicU64::new(1);

/// Executor that records every job it is given and does nothing else.
/// Tests drive results through the scheduler directly.
pub struct TestExecutor {
    id: u64,
    owner: SchedulerHandle,
    executed: Mutex<Vec<(usize, Message)>>,
    thread_batches: Mutex<Vec<Vec<usize>>>,
    flush_count: AtomicU64,
    finish_count: AtomicU64,
}

impl TestExecutor {
    fn new(owner: SchedulerHandle) -> Self {
        Self {
            id: NEXT_EXECUTOR_ID.fetch_add(1, Ordering::SeqCst),
            owner,
            executed: Mutex::new(Vec::new()),
            thread_batches: Mutex::new(Vec::new()),
            flush_count: AtomicU64::new(0),
            finish_count: AtomicU64::new(0),
        }
    }

    /// `(index, message)` pairs this executor was asked to run.
    pub fn executed_messages(&self) -> Vec<(usize, Message)> {
        self.executed.lock().unwrap().clone()
    }

    pub fn thread_batches(&self) -> Vec<Vec<usize>> {
        self.thread_batches.lock().unwrap().clone()
    }

    pub fn flush_count(&self) -> u64 {
        self.flush_count.load(Ordering::SeqCst)
    }

    pub fn finish_count(&self) -> u64 {
        self.finish_count.load(Ordering::SeqCst)
    }

    pub fn owner(&self) -> &SchedulerHandle {
        &self.owner
    }
}

#[async_trait]
impl Executor for TestExecutor {
    fn id(&self) -> u64 {
        self.id
    }

    async fn execute_function(&self, index: usize, req: Arc<BatchExecuteRequest>) -> Result<()> {
        self.executed
            .lock()
            .unwrap()
            .push((index, req.messages[index].clone()));
        Ok(())
    }

    async fn batch_execute_threads(
        &self,
        indices: Vec<usize>,
        _req: Arc<BatchExecuteRequest>,
    ) -> Result<()> {
        self.thread_batches.lock().unwrap().push(indices);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.flush_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn finish(&self) -> Result<()> {
        self.finish_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory that hands out [`TestExecutor`]s and remembers them.
#[derive(Default)]
pub struct TestExecutorFactory {
    created: Mutex<Vec<Arc<TestExecutor>>>,
}

impl TestExecutorFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn created_executors(&self) -> Vec<Arc<TestExecutor>> {
        self.created.lock().unwrap().clone()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

#[async_trait]
impl ExecutorFactory for TestExecutorFactory {
    async fn create_executor(
        &self,
        _msg: &Message,
        owner: SchedulerHandle,
    ) -> Result<Arc<dyn Executor>> {
        let executor = Arc::new(TestExecutor::new(owner));
        self.created.lock().unwrap().push(Arc::clone(&executor));
        Ok(executor)
    }
}

/// Config pinned to a deterministic host name and core count.
pub fn test_config(cores: usize) -> Config {
    Config {
        this_host: "thisHost".to_string(),
        cores_override: Some(cores),
        ..Config::default()
    }
}

/// Everything a scheduler test needs, wired to in-process fakes.
pub struct TestContext {
    pub scheduler: Arc<Scheduler>,
    pub factory: Arc<TestExecutorFactory>,
    pub store: Arc<MemoryStore>,
    pub snapshots: Arc<SnapshotRegistry>,
}

/// Build a scheduler over a memory store with `cores` usable cores.
pub fn test_scheduler(cores: usize) -> TestContext {
    test_scheduler_on("thisHost", cores, Arc::new(MemoryStore::new()))
}

/// Build a scheduler for a named host over a shared store. Lets tests run
/// several "hosts" inside one process against the same membership state.
pub fn test_scheduler_on(host: &str, cores: usize, store: Arc<MemoryStore>) -> TestContext {
    let config = Config {
        this_host: host.to_string(),
        cores_override: Some(cores),
        ..Config::default()
    };
    let snapshots = Arc::new(SnapshotRegistry::new());
    let factory = TestExecutorFactory::new();
    let scheduler = Scheduler::new(
        config,
        Arc::clone(&store) as Arc<dyn crate::store::StateStore>,
        Arc::clone(&snapshots),
        Arc::clone(&factory) as Arc<dyn ExecutorFactory>,
    );
    TestContext {
        scheduler,
        factory,
        store,
        snapshots,
    }
}

/// Turns mock and test mode on for its lifetime and clears every mock log
/// on both ends. Tests using this should run serially.
pub struct MockModeGuard;

impl MockModeGuard {
    pub fn new() -> Self {
        set_mock_mode(true);
        set_test_mode(true);
        clear_mock_function_calls();
        clear_mock_snapshot_requests();
        Self
    }
}

impl Default for MockModeGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MockModeGuard {
    fn drop(&mut self) {
        clear_mock_function_calls();
        clear_mock_snapshot_requests();
        set_mock_mode(false);
        set_test_mode(false);
    }
}

//! Executor capability traits.
//!
//! Different user runtimes supply different executors; the scheduler holds
//! only these capability references. An executor runs one function at a
//! time; "warm" executors are idle and parked, "executing" ones are busy.
//! Executors talk back to their owning scheduler through the narrow
//! [`crate::scheduler::SchedulerHandle`] surface they are created with, so
//! no executor ever holds the scheduler itself.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::messages::{BatchExecuteRequest, Message};
use crate::scheduler::SchedulerHandle;

/// A runtime object able to run user functions.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    /// Stable identity used for pool bookkeeping.
    fn id(&self) -> u64;

    /// Run one message of a batch. Overloaded executors are expected to
    /// serialize jobs internally.
    async fn execute_function(&self, index: usize, req: Arc<BatchExecuteRequest>) -> Result<()>;

    /// Run several thread messages of a THREADS batch in one executor.
    async fn batch_execute_threads(
        &self,
        indices: Vec<usize>,
        req: Arc<BatchExecuteRequest>,
    ) -> Result<()>;

    /// Drop cached state (loaded snapshots, warm language runtimes).
    async fn flush(&self) -> Result<()>;

    /// Tear the executor down for good.
    async fn finish(&self) -> Result<()>;
}

/// Creates executors on demand when the scheduler scales a function up.
#[async_trait]
pub trait ExecutorFactory: Send + Sync + 'static {
    async fn create_executor(
        &self,
        msg: &Message,
        owner: SchedulerHandle,
    ) -> Result<Arc<dyn Executor>>;
}

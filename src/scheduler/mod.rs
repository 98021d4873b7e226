//! Admission, placement and result plumbing.

mod core;
mod executor;
mod function_client;
mod function_server;

pub use core::{ExecGraph, ExecGraphNode, Scheduler, SchedulerHandle};
pub use executor::{Executor, ExecutorFactory};
pub use function_client::{
    clear_mock_function_calls, get_batch_requests, get_flush_calls, get_mpi_messages,
    get_thread_results, get_unregister_requests, queue_resource_response, FunctionCall,
    FunctionCallClient,
};
pub(crate) use function_client::record_mock_mpi_message;
pub use function_server::FunctionCallServer;

//! Scheduler placement, accounting and result plumbing.

use serial_test::serial;

use filament::error::Error;
use filament::messages::{
    batch_exec_factory, message_factory, BatchExecuteRequest, BatchType, HostResources, Message,
    MessageKind,
};
use filament::scheduler::{
    get_batch_requests, get_flush_calls, get_unregister_requests, queue_resource_response, Executor,
};
use filament::snapshot::{get_snapshot_deletes, get_snapshot_pushes};
use filament::store::add_available_host;
use filament::test_support::{test_scheduler, MockModeGuard};

const USER: &str = "demo";
const FUNC: &str = "echo";

fn batch_of(n: usize, master: &str) -> BatchExecuteRequest {
    let messages = (0..n)
        .map(|_| message_factory(USER, FUNC, master))
        .collect();
    batch_exec_factory(messages)
}

#[tokio::test]
#[serial]
async fn test_local_placement_within_cores() {
    let _guard = MockModeGuard::new();
    let ctx = test_scheduler(4);

    let req = batch_of(3, "thisHost");
    let first = req.messages[0].clone();
    let executed = ctx.scheduler.call_functions(req, false).await.unwrap();

    assert_eq!(executed, vec!["thisHost"; 3]);
    assert_eq!(ctx.scheduler.get_function_in_flight_count(&first).await, 3);
    let resources = ctx.scheduler.get_this_host_resources().await;
    assert_eq!(resources.functions_in_flight, 3);
    assert_eq!(resources.bound_executors, 3);

    // One executor per message for a FUNCTIONS batch.
    assert_eq!(ctx.factory.created_count(), 3);
    assert_eq!(ctx.scheduler.get_recorded_messages_local().await.len(), 3);
    assert!(ctx.scheduler.get_recorded_messages_shared().await.is_empty());
}

#[tokio::test]
#[serial]
async fn test_non_master_forwards_to_master() {
    let _guard = MockModeGuard::new();
    let ctx = test_scheduler(4);

    let req = batch_of(2, "masterHost");
    let first = req.messages[0].clone();
    let executed = ctx.scheduler.call_functions(req, false).await.unwrap();

    assert_eq!(executed, vec!["masterHost"; 2]);
    let forwarded = get_batch_requests();
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].0, "masterHost");
    assert_eq!(forwarded[0].1.messages.len(), 2);

    // No local side effects.
    assert_eq!(ctx.scheduler.get_function_in_flight_count(&first).await, 0);
    assert_eq!(ctx.factory.created_count(), 0);
}

#[tokio::test]
#[serial]
async fn test_missing_master_host_fails_admission() {
    let _guard = MockModeGuard::new();
    let ctx = test_scheduler(2);

    let req = batch_of(1, "");
    match ctx.scheduler.call_functions(req, false).await {
        Err(Error::PlacementFailed(_)) => {}
        other => panic!("expected PlacementFailed, got {other:?}"),
    }
}

#[tokio::test]
#[serial]
async fn test_remote_placement_registers_host() {
    let _guard = MockModeGuard::new();
    let ctx = test_scheduler(1);
    add_available_host(ctx.store.as_ref(), "hostB").await.unwrap();
    queue_resource_response(
        "hostB",
        HostResources {
            cores: 2,
            ..Default::default()
        },
    );

    let req = batch_of(3, "thisHost");
    let first = req.messages[0].clone();
    let executed = ctx.scheduler.call_functions(req, false).await.unwrap();

    assert_eq!(
        executed,
        vec![
            "thisHost".to_string(),
            "hostB".to_string(),
            "hostB".to_string()
        ]
    );

    let registered = ctx.scheduler.get_function_registered_hosts(&first).await;
    assert!(registered.contains("hostB"));

    let sub_batches = get_batch_requests();
    assert_eq!(sub_batches.len(), 1);
    assert_eq!(sub_batches[0].0, "hostB");
    assert_eq!(sub_batches[0].1.messages.len(), 2);
    assert_eq!(ctx.scheduler.get_recorded_messages_shared().await.len(), 2);
}

#[tokio::test]
#[serial]
async fn test_overload_runs_everything_locally() {
    let _guard = MockModeGuard::new();
    let ctx = test_scheduler(1);

    let executed = ctx
        .scheduler
        .call_functions(batch_of(3, "thisHost"), false)
        .await
        .unwrap();

    assert_eq!(executed, vec!["thisHost"; 3]);

    // A single executor absorbs all three jobs.
    let resources = ctx.scheduler.get_this_host_resources().await;
    assert!(resources.bound_executors <= resources.cores);
    assert_eq!(ctx.factory.created_count(), 1);
    let executor = &ctx.factory.created_executors()[0];
    assert_eq!(executor.executed_messages().len(), 3);
}

#[tokio::test]
#[serial]
async fn test_threads_batch_requires_snapshot() {
    let _guard = MockModeGuard::new();
    let ctx = test_scheduler(2);

    let mut req = batch_of(2, "thisHost");
    req.batch_type = BatchType::Threads as i32;
    match ctx.scheduler.call_functions(req, false).await {
        Err(Error::PlacementFailed(_)) => {}
        other => panic!("expected PlacementFailed, got {other:?}"),
    }

    // A key pointing at nothing is just as fatal.
    let mut req = batch_of(2, "thisHost");
    req.batch_type = BatchType::Threads as i32;
    req.snapshot_key = "ghost".to_string();
    for msg in &mut req.messages {
        msg.snapshot_key = "ghost".to_string();
    }
    match ctx.scheduler.call_functions(req, false).await {
        Err(Error::SnapshotMissing(_)) => {}
        other => panic!("expected SnapshotMissing, got {other:?}"),
    }
}

#[tokio::test]
#[serial]
async fn test_threads_snapshot_pushed_before_remote_dispatch() {
    let _guard = MockModeGuard::new();
    let ctx = test_scheduler(1);

    let payload: Vec<u8> = (0..512u32).map(|i| i as u8).collect();
    ctx.snapshots
        .take("snap", bytes::Bytes::from(payload.clone()))
        .unwrap();

    // Local capacity exhausted, so the whole batch goes remote.
    ctx.scheduler
        .set_this_host_resources(HostResources {
            cores: 1,
            functions_in_flight: 1,
            ..Default::default()
        })
        .await;
    add_available_host(ctx.store.as_ref(), "hostB").await.unwrap();
    queue_resource_response(
        "hostB",
        HostResources {
            cores: 4,
            ..Default::default()
        },
    );

    let mut req = batch_of(2, "thisHost");
    req.batch_type = BatchType::Threads as i32;
    req.snapshot_key = "snap".to_string();
    req.snapshot_size = payload.len() as u64;
    for msg in &mut req.messages {
        msg.snapshot_key = "snap".to_string();
    }

    let executed = ctx.scheduler.call_functions(req, false).await.unwrap();
    assert_eq!(executed, vec!["hostB"; 2]);

    let pushes = get_snapshot_pushes();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].0, "hostB");
    assert_eq!(pushes[0].1, "snap");
    assert_eq!(&pushes[0].2[..], &payload[..]);
    assert_eq!(get_batch_requests().len(), 1);
}

#[tokio::test]
#[serial]
async fn test_threads_batch_shares_one_executor() {
    let _guard = MockModeGuard::new();
    let ctx = test_scheduler(4);

    let payload = vec![9u8; 64];
    ctx.snapshots
        .take("snap", bytes::Bytes::from(payload))
        .unwrap();

    let mut req = batch_of(3, "thisHost");
    req.batch_type = BatchType::Threads as i32;
    req.snapshot_key = "snap".to_string();
    for msg in &mut req.messages {
        msg.snapshot_key = "snap".to_string();
    }

    let executed = ctx.scheduler.call_functions(req, false).await.unwrap();
    assert_eq!(executed, vec!["thisHost"; 3]);

    assert_eq!(ctx.factory.created_count(), 1);
    let batches = ctx.factory.created_executors()[0].thread_batches();
    assert_eq!(batches, vec![vec![0, 1, 2]]);
}

#[tokio::test]
#[serial]
async fn test_thread_result_roundtrip() {
    let _guard = MockModeGuard::new();
    let ctx = test_scheduler(2);

    let req = batch_of(1, "thisHost");
    let id = req.messages[0].id;
    ctx.scheduler.call_functions(req, false).await.unwrap();

    ctx.scheduler.set_thread_result_local(id, 42).await;
    assert_eq!(ctx.scheduler.await_thread_result(id).await.unwrap(), 42);
    // Completion is idempotent for waiters.
    assert_eq!(ctx.scheduler.await_thread_result(id).await.unwrap(), 42);

    match ctx.scheduler.await_thread_result(99_999_999).await {
        Err(Error::UnregisteredThread(_)) => {}
        other => panic!("expected UnregisteredThread, got {other:?}"),
    }
}

#[tokio::test]
#[serial]
async fn test_function_result_roundtrip() {
    let _guard = MockModeGuard::new();
    let ctx = test_scheduler(2);

    let mut msg = message_factory(USER, FUNC, "thisHost");
    msg.output_data = b"all good".to_vec();
    ctx.scheduler.set_function_result(&mut msg).await.unwrap();
    assert_eq!(msg.executed_host, "thisHost");
    assert!(msg.finish_timestamp > 0);

    let result = ctx.scheduler.get_function_result(msg.id, 500).await.unwrap();
    assert_eq!(result.id, msg.id);
    assert_eq!(result.output_data, b"all good");

    // Queue drained: a non-blocking probe now yields the EMPTY marker.
    let empty = ctx.scheduler.get_function_result(msg.id, 0).await.unwrap();
    assert_eq!(empty.kind(), MessageKind::Empty);
}

#[tokio::test]
#[serial]
async fn test_blocking_result_times_out() {
    let _guard = MockModeGuard::new();
    let ctx = test_scheduler(2);

    match ctx.scheduler.get_function_result(12345, 50).await {
        Err(Error::MessageTimeout) => {}
        other => panic!("expected MessageTimeout, got {other:?}"),
    }
}

#[tokio::test]
#[serial]
async fn test_message_status_strings() {
    let _guard = MockModeGuard::new();
    let ctx = test_scheduler(2);

    let mut ok = message_factory(USER, FUNC, "thisHost");
    ok.output_data = b"fine".to_vec();
    ctx.scheduler.set_function_result(&mut ok).await.unwrap();
    assert_eq!(
        ctx.scheduler.get_message_status(ok.id).await.unwrap(),
        "SUCCESS: fine"
    );

    let mut failed = message_factory(USER, FUNC, "thisHost");
    failed.return_value = 1;
    failed.output_data = b"boom".to_vec();
    ctx.scheduler.set_function_result(&mut failed).await.unwrap();
    assert_eq!(
        ctx.scheduler.get_message_status(failed.id).await.unwrap(),
        "FAILED: boom"
    );

    let pending = message_factory(USER, FUNC, "thisHost");
    assert_eq!(
        ctx.scheduler.get_message_status(pending.id).await.unwrap(),
        "RUNNING"
    );
}

#[tokio::test]
#[serial]
async fn test_executor_finished_accounting() {
    let _guard = MockModeGuard::new();
    let ctx = test_scheduler(2);

    // Execute a function mastered elsewhere, forced local.
    let msg = message_factory(USER, FUNC, "masterHost");
    let req = batch_exec_factory(vec![msg.clone()]);
    ctx.scheduler.call_functions(req, true).await.unwrap();
    assert_eq!(ctx.factory.created_count(), 1);

    let executor = ctx.factory.created_executors()[0].clone();
    ctx.scheduler
        .notify_executor_finished(executor.id(), &msg)
        .await
        .unwrap();

    // The last executor for a non-master function unregisters the host.
    let unregisters = get_unregister_requests();
    assert_eq!(unregisters.len(), 1);
    assert_eq!(unregisters[0].0, "masterHost");
    assert_eq!(unregisters[0].1.host, "thisHost");

    let resources = ctx.scheduler.get_this_host_resources().await;
    assert_eq!(resources.bound_executors, 0);

    // Never below zero.
    ctx.scheduler
        .notify_executor_finished(executor.id(), &msg)
        .await
        .unwrap();
    let resources = ctx.scheduler.get_this_host_resources().await;
    assert_eq!(resources.bound_executors, 0);
}

#[tokio::test]
#[serial]
async fn test_notify_call_finished_saturates() {
    let _guard = MockModeGuard::new();
    let ctx = test_scheduler(2);

    let req = batch_of(1, "thisHost");
    let first = req.messages[0].clone();
    ctx.scheduler.call_functions(req, false).await.unwrap();
    assert_eq!(ctx.scheduler.get_function_in_flight_count(&first).await, 1);

    ctx.scheduler.notify_call_finished(&first).await;
    ctx.scheduler.notify_call_finished(&first).await;
    assert_eq!(ctx.scheduler.get_function_in_flight_count(&first).await, 0);
    let resources = ctx.scheduler.get_this_host_resources().await;
    assert_eq!(resources.functions_in_flight, 0);
}

#[tokio::test]
#[serial]
async fn test_broadcast_flush() {
    let _guard = MockModeGuard::new();
    let ctx = test_scheduler(2);

    for host in ["thisHost", "hostB", "hostC"] {
        add_available_host(ctx.store.as_ref(), host).await.unwrap();
    }

    // Park one executor in the warm set.
    let msg = message_factory(USER, FUNC, "thisHost");
    ctx.scheduler
        .call_functions(batch_exec_factory(vec![msg.clone()]), false)
        .await
        .unwrap();
    let executor = ctx.factory.created_executors()[0].clone();
    ctx.scheduler
        .return_executor(&msg, executor.clone())
        .await;

    ctx.scheduler.broadcast_flush().await.unwrap();

    let mut flushed = get_flush_calls();
    flushed.sort();
    assert_eq!(flushed, vec!["hostB".to_string(), "hostC".to_string()]);

    assert_eq!(executor.flush_count(), 1);
    assert_eq!(executor.finish_count(), 1);
    assert_eq!(ctx.scheduler.get_function_executor_count(&msg).await, 0);
}

#[tokio::test]
#[serial]
async fn test_reset_restores_initial_state() {
    let _guard = MockModeGuard::new();
    let ctx = test_scheduler(3);

    ctx.scheduler
        .call_functions(batch_of(2, "thisHost"), false)
        .await
        .unwrap();
    let probe = message_factory(USER, FUNC, "thisHost");
    assert!(ctx.scheduler.get_function_in_flight_count(&probe).await > 0);

    ctx.scheduler.reset().await;

    assert_eq!(ctx.scheduler.get_function_in_flight_count(&probe).await, 0);
    assert_eq!(ctx.scheduler.get_function_executor_count(&probe).await, 0);
    assert!(ctx.scheduler.get_recorded_messages_all().await.is_empty());
    let resources = ctx.scheduler.get_this_host_resources().await;
    assert_eq!(resources.cores, 3);
    assert_eq!(resources.bound_executors, 0);
    assert_eq!(resources.functions_in_flight, 0);
}

#[tokio::test]
#[serial]
async fn test_shutdown_leaves_membership() {
    let _guard = MockModeGuard::new();
    let ctx = test_scheduler(2);

    ctx.scheduler.add_host_to_global_set().await.unwrap();
    assert!(ctx
        .scheduler
        .get_available_hosts()
        .await
        .unwrap()
        .contains("thisHost"));

    ctx.scheduler.shutdown().await.unwrap();
    assert!(!ctx
        .scheduler
        .get_available_hosts()
        .await
        .unwrap()
        .contains("thisHost"));
}

#[tokio::test]
#[serial]
async fn test_execution_graph() {
    let _guard = MockModeGuard::new();
    let ctx = test_scheduler(2);

    let publish = |label: &'static [u8]| {
        let mut msg: Message = message_factory(USER, FUNC, "thisHost");
        msg.output_data = label.to_vec();
        msg
    };
    let mut root = publish(b"root");
    let mut child_a = publish(b"a");
    let mut child_b = publish(b"b");
    let mut grandchild = publish(b"aa");

    for msg in [&mut root, &mut child_a, &mut child_b, &mut grandchild] {
        ctx.scheduler.set_function_result(msg).await.unwrap();
    }

    ctx.scheduler
        .log_chained_function(root.id, child_a.id)
        .await
        .unwrap();
    ctx.scheduler
        .log_chained_function(root.id, child_b.id)
        .await
        .unwrap();
    ctx.scheduler
        .log_chained_function(child_a.id, grandchild.id)
        .await
        .unwrap();

    let chained = ctx.scheduler.get_chained_functions(root.id).await.unwrap();
    assert_eq!(chained.len(), 2);

    let graph = ctx
        .scheduler
        .get_function_exec_graph(root.id)
        .await
        .unwrap();
    assert_eq!(graph.root.msg.id, root.id);
    assert_eq!(graph.root.children.len(), 2);

    let ids: Vec<u64> = graph.root.children.iter().map(|c| c.msg.id).collect();
    let mut expected = vec![child_a.id, child_b.id];
    expected.sort_unstable();
    assert_eq!(ids, expected);

    let nested = graph
        .root
        .children
        .iter()
        .find(|c| c.msg.id == child_a.id)
        .expect("child a present");
    assert_eq!(nested.children.len(), 1);
    assert_eq!(nested.children[0].msg.id, grandchild.id);

    // The graph renders to JSON for external consumers.
    let rendered = serde_json::to_value(&graph).unwrap();
    assert_eq!(rendered["root"]["children"].as_array().unwrap().len(), 2);
}

#[tokio::test]
#[serial]
async fn test_call_function_convenience() {
    let _guard = MockModeGuard::new();
    let ctx = test_scheduler(2);

    let msg = message_factory(USER, FUNC, "thisHost");
    let host = ctx.scheduler.call_function(msg, false).await.unwrap();
    assert_eq!(host, "thisHost");
}

#[tokio::test]
#[serial]
async fn test_warm_executor_reuse() {
    let _guard = MockModeGuard::new();
    let ctx = test_scheduler(4);

    let msg = message_factory(USER, FUNC, "thisHost");
    ctx.scheduler
        .call_functions(batch_exec_factory(vec![msg.clone()]), false)
        .await
        .unwrap();
    assert_eq!(ctx.factory.created_count(), 1);

    // Park it, then run another message of the same function: no new
    // executor is created.
    let executor = ctx.factory.created_executors()[0].clone();
    ctx.scheduler.return_executor(&msg, executor).await;

    let again = message_factory(USER, FUNC, "thisHost");
    ctx.scheduler
        .call_functions(batch_exec_factory(vec![again]), false)
        .await
        .unwrap();
    assert_eq!(ctx.factory.created_count(), 1);
}

#[tokio::test]
#[serial]
async fn test_broadcast_snapshot_delete() {
    let _guard = MockModeGuard::new();
    let ctx = test_scheduler(1);
    add_available_host(ctx.store.as_ref(), "hostB").await.unwrap();
    queue_resource_response(
        "hostB",
        HostResources {
            cores: 4,
            ..Default::default()
        },
    );

    // Registering hostB happens as a side effect of remote placement.
    let req = batch_of(3, "thisHost");
    let first = req.messages[0].clone();
    ctx.scheduler.call_functions(req, false).await.unwrap();

    ctx.scheduler
        .broadcast_snapshot_delete(&first, "stale-snap")
        .await
        .unwrap();

    let deletes = get_snapshot_deletes();
    assert_eq!(
        deletes,
        vec![("hostB".to_string(), "stale-snap".to_string())]
    );
}

#[tokio::test]
#[serial]
async fn test_await_chained_call() {
    let _guard = MockModeGuard::new();
    let ctx = test_scheduler(2);

    let mut ok = message_factory(USER, FUNC, "thisHost");
    ctx.scheduler.set_function_result(&mut ok).await.unwrap();
    let result = ctx.scheduler.await_chained_call(ok.id, 500).await.unwrap();
    assert_eq!(result.id, ok.id);

    let mut failed = message_factory(USER, FUNC, "thisHost");
    failed.return_value = 3;
    failed.output_data = b"segfault".to_vec();
    ctx.scheduler.set_function_result(&mut failed).await.unwrap();
    match ctx.scheduler.await_chained_call(failed.id, 500).await {
        Err(Error::ChainedCallFailed(detail)) => assert!(detail.contains("segfault")),
        other => panic!("expected ChainedCallFailed, got {other:?}"),
    }
}

// Property: placement always returns one entry per admitted message, and
// every entry names this host or a live peer.
#[tokio::test]
#[serial]
async fn test_every_message_gets_a_host() {
    let _guard = MockModeGuard::new();
    for n in [1usize, 2, 5, 9] {
        let ctx = test_scheduler(2);
        add_available_host(ctx.store.as_ref(), "hostB").await.unwrap();
        queue_resource_response(
            "hostB",
            HostResources {
                cores: 3,
                ..Default::default()
            },
        );

        let executed = ctx
            .scheduler
            .call_functions(batch_of(n, "thisHost"), false)
            .await
            .unwrap();
        assert_eq!(executed.len(), n);
        for host in &executed {
            assert!(host == "thisHost" || host == "hostB", "unexpected host {host}");
        }
    }
}

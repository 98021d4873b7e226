//! MPI world semantics with every rank on one host.

use std::sync::Arc;

use serial_test::serial;

use filament::error::Error;
use filament::messages::{message_factory, Message, MpiDatatype, MpiMessageType};
use filament::mpi::{
    bytes_to_f64, bytes_to_i32, bytes_to_i64, f64_to_bytes, i32_to_bytes, i64_to_bytes, MpiOp,
    MpiWorld,
};
use filament::test_support::{test_scheduler, MockModeGuard, TestContext};

const WORLD_ID: i32 = 123;
const USER: &str = "mpi";
const FUNC: &str = "hellompi";

async fn local_world(size: i32) -> (TestContext, Arc<MpiWorld>, Message) {
    let ctx = test_scheduler(4);
    let msg = message_factory(USER, FUNC, "thisHost");
    let world = MpiWorld::new(Arc::clone(&ctx.scheduler));
    world.create(&msg, WORLD_ID, size).await.unwrap();
    (ctx, world, msg)
}

#[tokio::test]
#[serial]
async fn test_world_creation() {
    let _guard = MockModeGuard::new();
    let (ctx, world, _msg) = local_world(10).await;

    assert_eq!(world.id(), WORLD_ID);
    assert_eq!(world.size(), 10);
    assert_eq!(world.user(), USER);
    assert_eq!(world.function(), FUNC);

    // One scheduled join call per non-zero rank.
    let recorded = ctx.scheduler.get_recorded_messages_all().await;
    assert_eq!(recorded.len(), 9);
    for (i, call) in recorded.iter().enumerate() {
        assert_eq!(call.user, USER);
        assert_eq!(call.function, FUNC);
        assert!(call.is_mpi);
        assert_eq!(call.mpi_world_id, WORLD_ID);
        assert_eq!(call.mpi_rank, (i + 1) as i32);
        assert_eq!(call.mpi_world_size, 10);
    }

    // The creator is registered as rank 0's host.
    assert_eq!(world.get_host_for_rank(0).await.unwrap(), "thisHost");
    world.destroy().await;
}

#[tokio::test]
#[serial]
async fn test_world_loading_from_msg() {
    let _guard = MockModeGuard::new();
    let (ctx, world_a, msg) = local_world(10).await;

    let mut join = msg.clone();
    join.mpi_world_id = WORLD_ID;
    join.mpi_world_size = 10;
    join.mpi_rank = 3;

    let world_b = MpiWorld::new(Arc::clone(&ctx.scheduler));
    world_b.initialise_from_msg(&join, true).await.unwrap();

    assert_eq!(world_b.id(), WORLD_ID);
    assert_eq!(world_b.size(), 10);
    assert_eq!(world_b.user(), USER);
    assert_eq!(world_b.function(), FUNC);

    world_a.destroy().await;
    world_b.destroy().await;
}

#[tokio::test]
#[serial]
async fn test_send_and_recv_on_same_host() {
    let _guard = MockModeGuard::new();
    let (_ctx, world, _msg) = local_world(2).await;
    let payload = i32_to_bytes(&[0, 1, 2]);

    world
        .send(0, 1, &payload, MpiDatatype::Int, 3, MpiMessageType::Normal)
        .await
        .unwrap();

    assert_eq!(world.get_local_queue_size(0, 1).await.unwrap(), 1);
    assert_eq!(world.get_local_queue_size(1, 0).await.unwrap(), 0);

    let mut buf = vec![0u8; 12];
    let status = world
        .recv(0, 1, &mut buf, MpiDatatype::Int, 3, MpiMessageType::Normal)
        .await
        .unwrap();

    assert_eq!(bytes_to_i32(&buf), vec![0, 1, 2]);
    assert_eq!(status.source, 0);
    assert_eq!(status.bytes_size, 12);
    world.destroy().await;
}

#[tokio::test]
#[serial]
async fn test_recv_type_mismatch_keeps_message() {
    let _guard = MockModeGuard::new();
    let (_ctx, world, _msg) = local_world(2).await;
    let payload = i32_to_bytes(&[7]);

    world
        .send(0, 1, &payload, MpiDatatype::Int, 1, MpiMessageType::Bcast)
        .await
        .unwrap();

    let mut buf = vec![0u8; 4];
    match world
        .recv(0, 1, &mut buf, MpiDatatype::Int, 1, MpiMessageType::Normal)
        .await
    {
        Err(Error::TypeMismatch { .. }) => {}
        other => panic!("expected TypeMismatch, got {other:?}"),
    }
    assert_eq!(world.get_local_queue_size(0, 1).await.unwrap(), 1);

    world
        .recv(0, 1, &mut buf, MpiDatatype::Int, 1, MpiMessageType::Bcast)
        .await
        .unwrap();
    assert_eq!(bytes_to_i32(&buf), vec![7]);
    world.destroy().await;
}

#[tokio::test]
#[serial]
async fn test_send_recv_message_with_no_data() {
    let _guard = MockModeGuard::new();
    let (_ctx, world, _msg) = local_world(2).await;

    world
        .send(0, 1, &[], MpiDatatype::Int, 0, MpiMessageType::Normal)
        .await
        .unwrap();
    assert_eq!(world.get_local_queue_size(0, 1).await.unwrap(), 1);

    let status = world
        .recv(0, 1, &mut [], MpiDatatype::Int, 0, MpiMessageType::Normal)
        .await
        .unwrap();
    assert_eq!(status.bytes_size, 0);
    world.destroy().await;
}

#[tokio::test]
#[serial]
async fn test_recv_with_partial_data() {
    let _guard = MockModeGuard::new();
    let (_ctx, world, _msg) = local_world(2).await;

    // Sender provides fewer elements than the receiver asks for.
    let payload = i32_to_bytes(&[1, 2]);
    world
        .send(0, 1, &payload, MpiDatatype::Int, 2, MpiMessageType::Normal)
        .await
        .unwrap();

    let mut buf = vec![0u8; 16];
    let status = world
        .recv(0, 1, &mut buf, MpiDatatype::Int, 4, MpiMessageType::Normal)
        .await
        .unwrap();
    assert_eq!(status.bytes_size, 8);
    assert_eq!(bytes_to_i32(&buf[..8]), vec![1, 2]);
    world.destroy().await;
}

#[tokio::test]
#[serial]
async fn test_probe_leaves_message_queued() {
    let _guard = MockModeGuard::new();
    let (_ctx, world, _msg) = local_world(2).await;
    let payload = i32_to_bytes(&[5, 6, 7]);

    world
        .send(0, 1, &payload, MpiDatatype::Int, 3, MpiMessageType::Normal)
        .await
        .unwrap();

    let status = world.probe(0, 1).await.unwrap();
    assert_eq!(status.source, 0);
    assert_eq!(status.bytes_size, 12);
    assert_eq!(world.get_local_queue_size(0, 1).await.unwrap(), 1);
    world.destroy().await;
}

#[tokio::test]
#[serial]
async fn test_sending_to_invalid_rank() {
    let _guard = MockModeGuard::new();
    let (_ctx, world, _msg) = local_world(2).await;

    match world
        .send(0, 2, &[0u8; 4], MpiDatatype::Int, 1, MpiMessageType::Normal)
        .await
    {
        Err(Error::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {other:?}"),
    }
    match world
        .send(-1, 1, &[0u8; 4], MpiDatatype::Int, 1, MpiMessageType::Normal)
        .await
    {
        Err(Error::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {other:?}"),
    }
    world.destroy().await;
}

#[tokio::test]
#[serial]
async fn test_sendrecv_pair() {
    let _guard = MockModeGuard::new();
    let (_ctx, world, _msg) = local_world(2).await;

    let mut tasks = Vec::new();
    for rank in 0..2 {
        let world = Arc::clone(&world);
        tasks.push(tokio::spawn(async move {
            let other = 1 - rank;
            let outbound = i32_to_bytes(&[rank, rank * 10]);
            let mut inbound = vec![0u8; 8];
            world
                .send_recv(
                    &outbound,
                    2,
                    other,
                    &mut inbound,
                    2,
                    other,
                    rank,
                    MpiDatatype::Int,
                )
                .await
                .unwrap();
            assert_eq!(bytes_to_i32(&inbound), vec![other, other * 10]);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    world.destroy().await;
}

#[tokio::test]
#[serial]
async fn test_ring_sendrecv() {
    let _guard = MockModeGuard::new();
    let size = 5i32;
    let (_ctx, world, _msg) = local_world(size).await;

    let mut tasks = Vec::new();
    for rank in 0..size {
        let world = Arc::clone(&world);
        tasks.push(tokio::spawn(async move {
            let right = (rank + 1) % size;
            let left = (rank - 1 + size) % size;
            let outbound = i32_to_bytes(&[rank]);
            let mut inbound = vec![0u8; 4];
            world
                .send_recv(
                    &outbound,
                    1,
                    right,
                    &mut inbound,
                    1,
                    left,
                    rank,
                    MpiDatatype::Int,
                )
                .await
                .unwrap();
            assert_eq!(bytes_to_i32(&inbound), vec![left]);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    world.destroy().await;
}

#[tokio::test]
#[serial]
async fn test_async_send_and_recv() {
    let _guard = MockModeGuard::new();
    let (_ctx, world, _msg) = local_world(2).await;
    let payload = i32_to_bytes(&[3, 1, 4, 1, 5]);

    let send_id = world.isend(
        0,
        1,
        &payload,
        MpiDatatype::Int,
        5,
        MpiMessageType::Normal,
    );
    let recv_id = world.irecv(0, 1, MpiDatatype::Int, 5, MpiMessageType::Normal);

    assert!(world.await_async_request(send_id).await.unwrap().is_none());
    let received = world
        .await_async_request(recv_id)
        .await
        .unwrap()
        .expect("irecv resolves to a message");
    assert_eq!(bytes_to_i32(&received.buffer), vec![3, 1, 4, 1, 5]);

    // Awaiting an unknown request id fails.
    assert!(world.await_async_request(9999).await.is_err());
    world.destroy().await;
}

#[tokio::test]
#[serial]
async fn test_barrier_releases_all_ranks() {
    let _guard = MockModeGuard::new();
    let size = 4i32;
    let (_ctx, world, _msg) = local_world(size).await;

    let mut tasks = Vec::new();
    for rank in 0..size {
        let world = Arc::clone(&world);
        tasks.push(tokio::spawn(async move {
            world.barrier(rank).await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    world.destroy().await;
}

#[tokio::test]
#[serial]
async fn test_broadcast() {
    let _guard = MockModeGuard::new();
    let size = 5i32;
    let root = 2i32;
    let (_ctx, world, _msg) = local_world(size).await;
    let payload = i32_to_bytes(&[0, 1, 2]);

    world
        .broadcast(root, &payload, MpiDatatype::Int, 3, MpiMessageType::Bcast)
        .await
        .unwrap();

    for rank in 0..size {
        if rank == root {
            continue;
        }
        let mut buf = vec![0u8; 12];
        world
            .recv(root, rank, &mut buf, MpiDatatype::Int, 3, MpiMessageType::Bcast)
            .await
            .unwrap();
        assert_eq!(bytes_to_i32(&buf), vec![0, 1, 2]);
    }
    world.destroy().await;
}

#[tokio::test]
#[serial]
async fn test_scatter() {
    let _guard = MockModeGuard::new();
    let size = 4i32;
    let root = 2i32;
    let (_ctx, world, _msg) = local_world(size).await;

    // Rank i receives [2i, 2i+1].
    let all: Vec<i32> = (0..size * 2).collect();
    let send_data = i32_to_bytes(&all);

    let mut root_buf = vec![0u8; 8];
    world
        .scatter(root, root, &send_data, 2, &mut root_buf, 2, MpiDatatype::Int)
        .await
        .unwrap();
    assert_eq!(bytes_to_i32(&root_buf), vec![4, 5]);

    for rank in 0..size {
        if rank == root {
            continue;
        }
        let mut buf = vec![0u8; 8];
        world
            .scatter(root, rank, &[], 2, &mut buf, 2, MpiDatatype::Int)
            .await
            .unwrap();
        assert_eq!(bytes_to_i32(&buf), vec![2 * rank, 2 * rank + 1]);
    }
    world.destroy().await;
}

#[tokio::test]
#[serial]
async fn test_gather_then_scatter_restores_buffers() {
    let _guard = MockModeGuard::new();
    let size = 3i32;
    let root = 0i32;
    let (_ctx, world, _msg) = local_world(size).await;

    let per_rank: Vec<Vec<i32>> = (0..size).map(|r| vec![r * 10, r * 10 + 1]).collect();

    // Non-roots send their slices first.
    for rank in 1..size {
        world
            .gather(
                rank,
                root,
                &i32_to_bytes(&per_rank[rank as usize]),
                2,
                &mut [],
                2,
                MpiDatatype::Int,
            )
            .await
            .unwrap();
    }

    let mut gathered = vec![0u8; (size as usize) * 8];
    world
        .gather(
            root,
            root,
            &i32_to_bytes(&per_rank[0]),
            2,
            &mut gathered,
            2,
            MpiDatatype::Int,
        )
        .await
        .unwrap();
    assert_eq!(bytes_to_i32(&gathered), vec![0, 1, 10, 11, 20, 21]);

    // Scatter the gathered buffer back out: every rank sees its original
    // slice bitwise.
    let mut root_slice = vec![0u8; 8];
    world
        .scatter(root, root, &gathered, 2, &mut root_slice, 2, MpiDatatype::Int)
        .await
        .unwrap();
    assert_eq!(bytes_to_i32(&root_slice), per_rank[0]);

    for rank in 1..size {
        let mut buf = vec![0u8; 8];
        world
            .scatter(root, rank, &[], 2, &mut buf, 2, MpiDatatype::Int)
            .await
            .unwrap();
        assert_eq!(bytes_to_i32(&buf), per_rank[rank as usize]);
    }
    world.destroy().await;
}

#[tokio::test]
#[serial]
async fn test_gather_in_place_at_root() {
    let _guard = MockModeGuard::new();
    let size = 3i32;
    let root = 1i32;
    let (_ctx, world, _msg) = local_world(size).await;

    for rank in 0..size {
        if rank == root {
            continue;
        }
        world
            .gather(
                rank,
                root,
                &i32_to_bytes(&[rank]),
                1,
                &mut [],
                1,
                MpiDatatype::Int,
            )
            .await
            .unwrap();
    }

    // Root's slice is already in position; empty send marks in-place.
    let mut gathered = i32_to_bytes(&[0, root, 0]);
    world
        .gather(root, root, &[], 1, &mut gathered, 1, MpiDatatype::Int)
        .await
        .unwrap();
    assert_eq!(bytes_to_i32(&gathered), vec![0, 1, 2]);
    world.destroy().await;
}

#[tokio::test]
#[serial]
async fn test_allgather() {
    let _guard = MockModeGuard::new();
    let size = 3i32;
    let (_ctx, world, _msg) = local_world(size).await;

    let mut tasks = Vec::new();
    for rank in 0..size {
        let world = Arc::clone(&world);
        tasks.push(tokio::spawn(async move {
            let own = i32_to_bytes(&[rank, rank + 100]);
            let mut all = vec![0u8; (size as usize) * 8];
            world
                .all_gather(rank, &own, 2, &mut all, 2, MpiDatatype::Int)
                .await
                .unwrap();
            assert_eq!(bytes_to_i32(&all), vec![0, 100, 1, 101, 2, 102]);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    world.destroy().await;
}

#[tokio::test]
#[serial]
async fn test_reduce_min_over_doubles() {
    let _guard = MockModeGuard::new();
    let size = 5i32;
    let root = 3i32;
    let (_ctx, world, _msg) = local_world(size).await;

    for rank in 0..size {
        if rank == root {
            continue;
        }
        let base = 2.5 + rank as f64;
        world
            .reduce(
                rank,
                root,
                &f64_to_bytes(&[base, base * 10.0, base * 100.0]),
                &mut [],
                MpiDatatype::Double,
                3,
                MpiOp::Min,
            )
            .await
            .unwrap();
    }

    let base = 2.5 + root as f64;
    let mut result = vec![0u8; 24];
    world
        .reduce(
            root,
            root,
            &f64_to_bytes(&[base, base * 10.0, base * 100.0]),
            &mut result,
            MpiDatatype::Double,
            3,
            MpiOp::Min,
        )
        .await
        .unwrap();
    assert_eq!(bytes_to_f64(&result), vec![2.5, 25.0, 250.0]);
    world.destroy().await;
}

#[tokio::test]
#[serial]
async fn test_reduce_sum_in_place() {
    let _guard = MockModeGuard::new();
    let size = 4i32;
    let root = 0i32;
    let (_ctx, world, _msg) = local_world(size).await;

    for rank in 1..size {
        world
            .reduce(
                rank,
                root,
                &i64_to_bytes(&[rank as i64, 10 * rank as i64]),
                &mut [],
                MpiDatatype::LongLong,
                2,
                MpiOp::Sum,
            )
            .await
            .unwrap();
    }

    // Root contributes in place: its values are already in the result
    // buffer and the send buffer is empty.
    let mut result = i64_to_bytes(&[0, 0]);
    world
        .reduce(
            root,
            root,
            &[],
            &mut result,
            MpiDatatype::LongLong,
            2,
            MpiOp::Sum,
        )
        .await
        .unwrap();
    assert_eq!(bytes_to_i64(&result), vec![6, 60]);
    world.destroy().await;
}

#[tokio::test]
#[serial]
async fn test_allreduce() {
    let _guard = MockModeGuard::new();
    let size = 3i32;
    let (_ctx, world, _msg) = local_world(size).await;

    let mut tasks = Vec::new();
    for rank in 0..size {
        let world = Arc::clone(&world);
        tasks.push(tokio::spawn(async move {
            let own = i32_to_bytes(&[rank + 1, 2 * (rank + 1)]);
            let mut result = vec![0u8; 8];
            world
                .all_reduce(rank, &own, &mut result, MpiDatatype::Int, 2, MpiOp::Sum)
                .await
                .unwrap();
            assert_eq!(bytes_to_i32(&result), vec![6, 12]);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    world.destroy().await;
}

#[tokio::test]
#[serial]
async fn test_scan_inclusive_prefix() {
    let _guard = MockModeGuard::new();
    let size = 4i32;
    let (_ctx, world, _msg) = local_world(size).await;

    // Sequential in rank order: each rank feeds the next.
    let mut results = Vec::new();
    for rank in 0..size {
        let own = i32_to_bytes(&[rank + 1, (rank + 1) * 10]);
        let mut result = vec![0u8; 8];
        world
            .scan(rank, &own, &mut result, MpiDatatype::Int, 2, MpiOp::Sum)
            .await
            .unwrap();
        results.push(bytes_to_i32(&result));
    }

    assert_eq!(results[0], vec![1, 10]);
    assert_eq!(results[1], vec![3, 30]);
    assert_eq!(results[2], vec![6, 60]);
    assert_eq!(results[3], vec![10, 100]);
    world.destroy().await;
}

#[tokio::test]
#[serial]
async fn test_all_to_all() {
    let _guard = MockModeGuard::new();
    let size = 3i32;
    let (_ctx, world, _msg) = local_world(size).await;

    let mut tasks = Vec::new();
    for rank in 0..size {
        let world = Arc::clone(&world);
        tasks.push(tokio::spawn(async move {
            // Rank i's slice for rank j is [10*i + j].
            let slices: Vec<i32> = (0..size).map(|j| 10 * rank + j).collect();
            let send = i32_to_bytes(&slices);
            let mut recv = vec![0u8; (size as usize) * 4];
            world
                .all_to_all(rank, &send, 1, &mut recv, 1, MpiDatatype::Int)
                .await
                .unwrap();
            // Position i holds what rank i addressed to us.
            let expected: Vec<i32> = (0..size).map(|i| 10 * i + rank).collect();
            assert_eq!(bytes_to_i32(&recv), expected);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    world.destroy().await;
}

#[tokio::test]
#[serial]
async fn test_cartesian_communicator() {
    let _guard = MockModeGuard::new();
    // 5 processes in a 5x1 grid.
    {
        let (_ctx, world, _msg) = local_world(5).await;
        let dims = [5, 1, 1];
        let expected_coords = [[0, 0, 0], [1, 0, 0], [2, 0, 0], [3, 0, 0], [4, 0, 0]];
        let expected_shift = [
            [4, 1, 0, 0, 0, 0],
            [0, 2, 1, 1, 1, 1],
            [1, 3, 2, 2, 2, 2],
            [2, 4, 3, 3, 3, 3],
            [3, 0, 4, 4, 4, 4],
        ];
        check_cartesian(&world, 5, &dims, &expected_coords, &expected_shift);
        world.destroy().await;
    }

    // 4 processes in a 2x2 grid.
    {
        let (_ctx, world, _msg) = local_world(4).await;
        let dims = [2, 2, 1];
        let expected_coords = [[0, 0, 0], [0, 1, 0], [1, 0, 0], [1, 1, 0]];
        let expected_shift = [
            [2, 2, 1, 1, 0, 0],
            [3, 3, 0, 0, 1, 1],
            [0, 0, 3, 3, 2, 2],
            [1, 1, 2, 2, 3, 3],
        ];
        check_cartesian(&world, 4, &dims, &expected_coords, &expected_shift);
        world.destroy().await;
    }
}

fn check_cartesian(
    world: &MpiWorld,
    size: i32,
    dims: &[i32; 3],
    expected_coords: &[[i32; 3]],
    expected_shift: &[[i32; 6]],
) {
    for rank in 0..size {
        let coords = world.get_cartesian_rank(rank, dims).unwrap();
        assert_eq!(coords, expected_coords[rank as usize]);
        assert_eq!(world.get_rank_from_coords(&coords, dims), rank);

        for direction in 0..3 {
            let (source, destination) = world
                .shift_cartesian_coords(rank, direction, 1, dims)
                .unwrap();
            assert_eq!(
                source,
                expected_shift[rank as usize][direction * 2],
                "source mismatch rank {rank} dir {direction}"
            );
            assert_eq!(
                destination,
                expected_shift[rank as usize][direction * 2 + 1],
                "destination mismatch rank {rank} dir {direction}"
            );
        }
    }
}

#[tokio::test]
#[serial]
async fn test_rma_window_local_get_put() {
    let _guard = MockModeGuard::new();
    let (_ctx, world, _msg) = local_world(2).await;

    let window = world.create_window(1, 12);
    window.write(&i32_to_bytes(&[10, 20, 30]));

    let mut buf = vec![0u8; 12];
    world
        .rma_get(0, 1, MpiDatatype::Int, 3, &mut buf)
        .await
        .unwrap();
    assert_eq!(bytes_to_i32(&buf), vec![10, 20, 30]);

    world
        .rma_put(0, &i32_to_bytes(&[7, 8, 9]), MpiDatatype::Int, 3, 1)
        .await
        .unwrap();
    assert_eq!(bytes_to_i32(&window.read()), vec![7, 8, 9]);

    // Reading a rank with no window fails.
    let mut buf = vec![0u8; 4];
    match world.rma_get(1, 0, MpiDatatype::Int, 1, &mut buf).await {
        Err(Error::NotFound(_)) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }
    world.destroy().await;
}

#[tokio::test]
#[serial]
async fn test_world_time_advances() {
    let _guard = MockModeGuard::new();
    let (_ctx, world, _msg) = local_world(2).await;
    let before = world.get_w_time();
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    assert!(world.get_w_time() > before);
    world.destroy().await;
}

#[tokio::test]
#[serial]
async fn test_destroy_is_idempotent() {
    let _guard = MockModeGuard::new();
    let (_ctx, world, _msg) = local_world(2).await;
    world
        .send(0, 1, &i32_to_bytes(&[1]), MpiDatatype::Int, 1, MpiMessageType::Normal)
        .await
        .unwrap();
    world.create_window(0, 8);

    world.destroy().await;
    world.destroy().await;
    assert_eq!(world.get_local_queue_size(0, 1).await.unwrap(), 0);
}

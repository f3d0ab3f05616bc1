//! End-to-end tests for tessera-mesh.
//!
//! Every test runs one tokio task per worker on a shared in-process fabric
//! and bounds the whole run with a timeout, so a protocol deadlock fails
//! instead of hanging.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tessera_mesh::{
    ContextId, CrossGroupMatcher, Decomposition, Endpoint, ErrorKind, ExchangeConfig, ExchangePlan,
    Fabric, MeshError, PlanCache, Redistributor, Saved, WorkerGroup,
};
use tessera_tensor::{Local, Shape, Tensor};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Run `worker` on each of `n` endpoints concurrently; results in rank order.
async fn run_workers<F, Fut, T>(n: usize, worker: F) -> Vec<T>
where
    F: Fn(Endpoint) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    init_tracing();
    let handles: Vec<_> = Fabric::local(n)
        .into_iter()
        .map(|endpoint| tokio::spawn(worker(endpoint)))
        .collect();
    let joined = tokio::time::timeout(Duration::from_secs(10), join_all(handles))
        .await
        .expect("workers did not finish; likely deadlock");
    joined
        .into_iter()
        .map(|r| r.expect("worker panicked"))
        .collect()
}

async fn grid_group(world: &WorkerGroup, ranks: &[usize], shape: &[usize]) -> WorkerGroup {
    world
        .inclusive_subset(ranks)
        .await
        .unwrap()
        .attach_cartesian_topology(shape)
        .await
        .unwrap()
}

/// This worker's block of the global tensor `f`, or `Empty` off the grid.
fn local_block(global: &[usize], group: &WorkerGroup, f: impl Fn(&[usize]) -> f64) -> Local<f64> {
    let (Some(coord), Some(grid)) = (group.coord(), group.shape()) else {
        return Local::Empty;
    };
    let region = Decomposition::new(global, grid).unwrap().block(coord);
    let origin = region.origin();
    Tensor::from_fn(Shape::new(region.extents()), |idx| {
        let g: Vec<usize> = idx.iter().zip(&origin).map(|(i, o)| i + o).collect();
        f(&g)
    })
    .into()
}

fn dot(a: &Local<f64>, b: &Local<f64>) -> f64 {
    match (a.as_present(), b.as_present()) {
        (Some(a), Some(b)) => a.data().iter().zip(b.data()).map(|(x, y)| x * y).sum(),
        _ => 0.0,
    }
}

fn data(local: Local<f64>) -> Option<Vec<f64>> {
    local.into_present().map(Tensor::into_data)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn forward_three_to_two() {
    // Worker 5 belongs to neither group.
    let results = run_workers(6, |endpoint| async move {
        let world = WorkerGroup::world(endpoint);
        let src = grid_group(&world, &[0, 1, 2], &[3]).await;
        let dest = grid_group(&world, &[3, 4], &[2]).await;
        let plan = ExchangePlan::build(&src, &dest, &[12], ExchangeConfig::default())
            .await
            .unwrap();
        let mut redistribute = Redistributor::<f64>::new(Arc::new(plan));

        let x = local_block(&[12], &src, |g| g[0] as f64);
        let x = match x {
            Local::Present(t) => Local::Present(t.with_requires_grad(true)),
            Local::Empty => Local::Empty,
        };
        let (y, saved) = redistribute.forward(x).await.unwrap();
        let requires_grad = y.requires_grad();
        (data(y), saved, requires_grad)
    })
    .await;

    for (rank, (y, saved, _)) in results.iter().enumerate().take(3) {
        assert!(y.is_none(), "source-only worker {rank} got output");
        assert!(saved.requires_grad);
    }
    let (y3, _, grad3) = &results[3];
    assert_eq!(y3.as_deref(), Some(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0][..]));
    assert!(*grad3);
    let (y4, _, _) = &results[4];
    assert_eq!(y4.as_deref(), Some(&[6.0, 7.0, 8.0, 9.0, 10.0, 11.0][..]));

    let (y5, saved5, _) = &results[5];
    assert!(y5.is_none());
    assert_eq!(*saved5, Saved::default());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn backward_returns_gradients_to_source_layout() {
    let results = run_workers(5, |endpoint| async move {
        let world = WorkerGroup::world(endpoint);
        let src = grid_group(&world, &[0, 1, 2], &[3]).await;
        let dest = grid_group(&world, &[3, 4], &[2]).await;
        let plan = ExchangePlan::build(&src, &dest, &[12], ExchangeConfig::default())
            .await
            .unwrap();
        let mut redistribute = Redistributor::<f64>::new(Arc::new(plan));

        let dy = local_block(&[12], &dest, |g| 100.0 + g[0] as f64);
        let saved = Saved { requires_grad: true };
        data(redistribute.backward(&saved, dy).await.unwrap())
    })
    .await;

    assert_eq!(results[0], Some(vec![100.0, 101.0, 102.0, 103.0]));
    assert_eq!(results[1], Some(vec![104.0, 105.0, 106.0, 107.0]));
    assert_eq!(results[2], Some(vec![108.0, 109.0, 110.0, 111.0]));
    assert_eq!(results[3], None);
    assert_eq!(results[4], None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn identical_decomposition_is_identity() {
    let results = run_workers(2, |endpoint| async move {
        let world = WorkerGroup::world(endpoint);
        let grid = world.attach_cartesian_topology(&[2, 1]).await.unwrap();
        let plan = ExchangePlan::build(&grid, &grid, &[5, 3], ExchangeConfig::default())
            .await
            .unwrap();
        let layout = plan.layout().unwrap();
        assert_eq!(layout.outbound().len(), 1);
        assert_eq!(layout.inbound().len(), 1);
        assert_eq!(Some(layout.outbound()[0].partner), plan.union().rank());

        let x = local_block(&[5, 3], &grid, |g| (g[0] * 3 + g[1]) as f64);
        let expected = x.as_present().map(|t| t.data().to_vec());
        let mut redistribute = Redistributor::<f64>::new(Arc::new(plan));
        let (y, _) = redistribute.forward(x).await.unwrap();
        (data(y), expected)
    })
    .await;

    for (y, expected) in results {
        assert!(y.is_some());
        assert_eq!(y, expected);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn forward_then_backward_round_trips() {
    let global = [7, 4];
    let results = run_workers(5, move |endpoint| async move {
        let world = WorkerGroup::world(endpoint);
        let src = grid_group(&world, &[0, 1, 2, 3], &[2, 2]).await;
        let dest = grid_group(&world, &[4, 0, 2], &[3, 1]).await;
        let plan = ExchangePlan::build(&src, &dest, &global, ExchangeConfig::default())
            .await
            .unwrap();
        let mut redistribute = Redistributor::<f64>::new(Arc::new(plan));

        let x = local_block(&global, &src, |g| (g[0] * 10 + g[1]) as f64);
        let original = x.as_present().map(|t| t.data().to_vec());
        let (y, saved) = redistribute.forward(x).await.unwrap();
        let back = redistribute.backward(&saved, y).await.unwrap();
        (data(back), original)
    })
    .await;

    for (rank, (back, original)) in results.into_iter().enumerate() {
        assert_eq!(back, original, "worker {rank}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn backward_is_the_adjoint_of_forward() {
    // Source and destination share workers 2 and 3.
    let global = [5, 7];
    let results = run_workers(5, move |endpoint| async move {
        let world = WorkerGroup::world(endpoint);
        let src = grid_group(&world, &[0, 1, 2, 3], &[2, 2]).await;
        let dest = grid_group(&world, &[2, 3, 4], &[3, 1]).await;
        let plan = ExchangePlan::build(&src, &dest, &global, ExchangeConfig::default())
            .await
            .unwrap();
        let mut redistribute = Redistributor::<f64>::new(Arc::new(plan));

        let x = local_block(&global, &src, |g| ((g[0] * 7 + g[1] * 3) % 11) as f64 * 0.5);
        let y = local_block(&global, &dest, |g| ((g[0] * 5 + g[1]) % 13) as f64 - 6.0);

        let (fx, saved) = redistribute.forward(x.clone()).await.unwrap();
        let fty = redistribute.backward(&saved, y.clone()).await.unwrap();
        (dot(&fx, &y), dot(&x, &fty))
    })
    .await;

    let lhs: f64 = results.iter().map(|(l, _)| l).sum();
    let rhs: f64 = results.iter().map(|(_, r)| r).sum();
    assert!(lhs.abs() > 0.0);
    assert!((lhs - rhs).abs() < 1e-9, "<Fx, y> = {lhs}, <x, F*y> = {rhs}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn global_shape_reconstructed_from_local_blocks() {
    let results = run_workers(5, |endpoint| async move {
        let world = WorkerGroup::world(endpoint);
        let src = grid_group(&world, &[0, 1, 2], &[3]).await;
        let dest = grid_group(&world, &[3, 4], &[2]).await;
        let local = [4usize];
        let local = src.is_active().then_some(&local[..]);
        let plan = ExchangePlan::from_local_shape(&src, &dest, local, ExchangeConfig::default())
            .await
            .unwrap();
        plan.layout().map(|l| l.global_shape().to_vec())
    })
    .await;

    for shape in results {
        assert_eq!(shape, Some(vec![12]));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn plan_cache_builds_once_per_key() {
    let results = run_workers(3, |endpoint| async move {
        let world = WorkerGroup::world(endpoint);
        let src = grid_group(&world, &[0, 1], &[2]).await;
        let dest = grid_group(&world, &[1, 2], &[2]).await;
        let config = ExchangeConfig::default();
        let mut cache = PlanCache::new();

        let first = cache.get_or_build(&src, &dest, &[8], &config).await.unwrap();
        let again = cache.get_or_build(&src, &dest, &[8], &config).await.unwrap();
        let other = cache.get_or_build(&src, &dest, &[9], &config).await.unwrap();
        (Arc::ptr_eq(&first, &again), Arc::ptr_eq(&first, &other), cache.len())
    })
    .await;

    for (hit, miss, len) in results {
        assert!(hit);
        assert!(!miss);
        assert_eq!(len, 2);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replacing_the_plan_reuses_the_redistributor() {
    let results = run_workers(2, |endpoint| async move {
        let world = WorkerGroup::world(endpoint);
        let grid = world.attach_cartesian_topology(&[2]).await.unwrap();
        let config = ExchangeConfig::default();
        let small = ExchangePlan::build(&grid, &grid, &[4], config.clone()).await.unwrap();
        let large = ExchangePlan::build(&grid, &grid, &[10], config).await.unwrap();

        let mut redistribute = Redistributor::<f64>::new(Arc::new(small));
        let (y, _) = redistribute
            .forward(local_block(&[4], &grid, |g| g[0] as f64))
            .await
            .unwrap();
        let small_len = data(y).map(|d| d.len());

        redistribute.set_plan(Arc::new(large));
        let (y, _) = redistribute
            .forward(local_block(&[10], &grid, |g| g[0] as f64))
            .await
            .unwrap();
        (small_len, data(y).map(|d| d.len()))
    })
    .await;

    assert_eq!(results, vec![(Some(2), Some(5)), (Some(2), Some(5))]);
}

#[tokio::test]
async fn wrong_local_shape_is_rejected() {
    let results = run_workers(1, |endpoint| async move {
        let world = WorkerGroup::world(endpoint);
        let grid = world.attach_cartesian_topology(&[1]).await.unwrap();
        let plan = ExchangePlan::build(&grid, &grid, &[6], ExchangeConfig::default())
            .await
            .unwrap();
        let mut redistribute = Redistributor::<f32>::new(Arc::new(plan));
        let wrong = Local::Present(Tensor::<f32>::zeros(Shape::new(vec![5])));
        let shape_err = redistribute.forward(wrong).await.unwrap_err();
        let missing_err = redistribute.forward(Local::Empty).await.unwrap_err();
        (shape_err, missing_err)
    })
    .await;

    let (shape_err, missing_err) = &results[0];
    assert!(matches!(
        shape_err,
        MeshError::LocalShapeMismatch { expected, got } if expected == &vec![6] && got == &vec![5]
    ));
    assert!(matches!(missing_err, MeshError::MissingInput(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn zero_extent_axis_exchanges_empty_blocks() {
    let global = [0, 4];
    let results = run_workers(3, move |endpoint| async move {
        let world = WorkerGroup::world(endpoint);
        let src = grid_group(&world, &[0, 1], &[1, 2]).await;
        let dest = grid_group(&world, &[2], &[1, 1]).await;
        let plan = ExchangePlan::build(&src, &dest, &global, ExchangeConfig::default())
            .await
            .unwrap();
        let mut redistribute = Redistributor::<f64>::new(Arc::new(plan));

        let x = local_block(&global, &src, |_| 1.0);
        let (y, saved) = redistribute.forward(x).await.unwrap();
        let y_shape = y.shape().map(|s| s.dims().to_vec());
        let dx = redistribute.backward(&saved, y).await.unwrap();
        (y_shape, dx.shape().map(|s| s.dims().to_vec()))
    })
    .await;

    assert_eq!(
        results,
        vec![
            (None, Some(vec![0, 2])),
            (None, Some(vec![0, 2])),
            (Some(vec![0, 4]), None),
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bad_input_fails_every_worker() {
    // Worker 1 hands in a block of the wrong shape.
    let results = run_workers(5, |endpoint| async move {
        let rank = endpoint.rank();
        let world = WorkerGroup::world(endpoint);
        let src = grid_group(&world, &[0, 1, 2], &[3]).await;
        let dest = grid_group(&world, &[3, 4], &[2]).await;
        let plan = ExchangePlan::build(&src, &dest, &[12], ExchangeConfig::default())
            .await
            .unwrap();
        let mut redistribute = Redistributor::<f64>::new(Arc::new(plan));

        let x = if rank == 1 {
            Local::Present(Tensor::zeros(Shape::new(vec![3])))
        } else {
            local_block(&[12], &src, |g| g[0] as f64)
        };
        redistribute.forward(x).await.unwrap_err()
    })
    .await;

    for (rank, err) in results.iter().enumerate() {
        if rank == 1 {
            assert!(matches!(err, MeshError::LocalShapeMismatch { .. }), "{err}");
        } else {
            assert!(
                matches!(err, MeshError::PeerRejected { rank: 1, operation: "forward" }),
                "worker {rank}: {err}"
            );
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn missing_local_shape_fails_every_worker() {
    let results = run_workers(5, |endpoint| async move {
        let rank = endpoint.rank();
        let world = WorkerGroup::world(endpoint);
        let src = grid_group(&world, &[0, 1, 2], &[3]).await;
        let dest = grid_group(&world, &[3, 4], &[2]).await;
        let local = [4usize];
        let local = (src.is_active() && rank != 2).then_some(&local[..]);
        ExchangePlan::from_local_shape(&src, &dest, local, ExchangeConfig::default())
            .await
            .unwrap_err()
    })
    .await;

    assert!(matches!(results[2], MeshError::MissingInput("from_local_shape")));
    for rank in [0, 1, 3, 4] {
        assert!(matches!(results[rank], MeshError::PeerRejected { rank: 2, .. }));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn group_without_grid_fails_every_worker() {
    let results = run_workers(4, |endpoint| async move {
        let world = WorkerGroup::world(endpoint);
        let src = world.inclusive_subset(&[0, 1]).await.unwrap();
        let dest = grid_group(&world, &[2, 3], &[2]).await;
        ExchangePlan::build(&src, &dest, &[8], ExchangeConfig::default())
            .await
            .unwrap_err()
    })
    .await;

    for err in results {
        assert!(matches!(err, MeshError::NoTopology(_)), "{err}");
        assert_eq!(err.kind(), ErrorKind::InactiveGroup);
    }
}

#[tokio::test]
async fn union_requires_a_common_root() {
    let results = run_workers(1, |endpoint| async move {
        let world = WorkerGroup::world(endpoint.clone());
        let stranger = WorkerGroup::null(endpoint, ContextId(99));
        world.union(&stranger).await.unwrap_err()
    })
    .await;
    assert!(matches!(results[0], MeshError::RootMismatch { .. }));
    assert_eq!(results[0].kind(), ErrorKind::Configuration);
}

#[tokio::test]
async fn subset_ranks_are_validated() {
    let results = run_workers(2, |endpoint| async move {
        let world = WorkerGroup::world(endpoint);
        let out_of_range = world.inclusive_subset(&[0, 5]).await.unwrap_err();
        let duplicate = world.inclusive_subset(&[1, 1]).await.unwrap_err();
        (out_of_range, duplicate)
    })
    .await;
    for (out_of_range, duplicate) in results {
        assert!(matches!(out_of_range, MeshError::RankOutOfRange { rank: 5, size: 2 }));
        assert!(matches!(duplicate, MeshError::DuplicateRank { rank: 1 }));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn incompatible_grids_fail_on_every_worker() {
    let results = run_workers(5, |endpoint| async move {
        let world = WorkerGroup::world(endpoint);
        let src = grid_group(&world, &[0, 1], &[2]).await;
        let dest = grid_group(&world, &[2, 3, 4], &[3]).await;
        CrossGroupMatcher::distribution().build(&src, &dest).await.unwrap_err()
    })
    .await;
    for err in results {
        assert!(matches!(err, MeshError::IncompatibleGrids { rule: "distribution", .. }));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distribution_broadcasts_along_the_matching_axis() {
    let results = run_workers(9, |endpoint| async move {
        let rank = endpoint.rank();
        let world = WorkerGroup::world(endpoint);
        let src = grid_group(&world, &[0, 1, 2], &[3]).await;
        let dest = grid_group(&world, &[3, 4, 5, 6, 7, 8], &[2, 3]).await;

        // Stagger arrival so subgroup creations interleave differently.
        tokio::time::sleep(Duration::from_millis(((rank * 7) % 5) as u64)).await;
        let pair = CrossGroupMatcher::distribution().build(&src, &dest).await.unwrap();

        let value = if pair.send.is_active() {
            let value = [10 * src.coord().unwrap()[0] as i64];
            pair.send
                .broadcast_value(Some(&value[..]), 0, None)
                .await
                .unwrap()
        } else {
            pair.recv.broadcast_value(None, 0, None).await.unwrap()
        };
        (pair.send.members().to_vec(), pair.send.is_active(), pair.recv.is_active(), value)
    })
    .await;

    for k in 0..3 {
        let (members, send, recv, value) = &results[k];
        assert_eq!(members, &vec![k, 3 + k, 6 + k]);
        assert!(*send && !*recv);
        assert_eq!(value, &Some(vec![10 * k as i64]));
    }
    for r in 3..9 {
        let k = (r - 3) % 3;
        let (_, send, recv, value) = &results[r];
        assert!(!*send && *recv);
        assert_eq!(value, &Some(vec![10 * k as i64]), "dest worker {r}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_groups_create_distinct_send_and_receive_groups() {
    // Workers 0, 1 and 2 own a source slot and also sit on the destination
    // grid under a different index, so they create two subgroups each.
    for stagger in 0..5u64 {
        let results = run_workers(6, move |endpoint| async move {
            let rank = endpoint.rank() as u64;
            let world = WorkerGroup::world(endpoint);
            let src = grid_group(&world, &[0, 1, 2], &[3]).await;
            let dest = grid_group(&world, &[1, 2, 3, 4, 5, 0], &[2, 3]).await;

            tokio::time::sleep(Duration::from_millis((rank * 3 + stagger) % 7)).await;
            let pair = CrossGroupMatcher::distribution().build(&src, &dest).await.unwrap();
            (pair.send.members().to_vec(), pair.recv.members().to_vec())
        })
        .await;

        assert_eq!(results[0], (vec![0, 1, 4], vec![2, 0, 3]));
        assert_eq!(results[1], (vec![1, 2, 5], vec![0, 1, 4]));
        assert_eq!(results[2], (vec![2, 0, 3], vec![1, 2, 5]));
        assert_eq!(results[3].1, vec![2, 0, 3]);
        assert_eq!(results[4].1, vec![0, 1, 4]);
        assert_eq!(results[5].1, vec![1, 2, 5]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transposed_destination_matches_its_leading_axis() {
    // Destination grid [3, 2] read column-major lines up with source [3].
    let results = run_workers(9, |endpoint| async move {
        let world = WorkerGroup::world(endpoint);
        let src = grid_group(&world, &[0, 1, 2], &[3]).await;
        let dest = grid_group(&world, &[3, 4, 5, 6, 7, 8], &[3, 2]).await;

        let plain = CrossGroupMatcher::distribution().build(&src, &dest).await;
        let pair = CrossGroupMatcher::distribution()
            .transpose_dest(true)
            .build(&src, &dest)
            .await
            .unwrap();
        let members = if pair.send.is_active() {
            pair.send.members().to_vec()
        } else {
            pair.recv.members().to_vec()
        };
        (plain.is_err(), members)
    })
    .await;

    for (rank, (plain_failed, members)) in results.into_iter().enumerate() {
        assert!(plain_failed);
        let k = if rank < 3 { rank } else { (rank - 3) / 2 };
        assert_eq!(members, vec![k, 3 + 2 * k, 4 + 2 * k], "worker {rank}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn combination_shares_identical_send_and_receive_groups() {
    // Workers 2 and 3 are both source and destination owners.
    let results = run_workers(4, |endpoint| async move {
        let world = WorkerGroup::world(endpoint);
        let src = grid_group(&world, &[0, 1, 2, 3], &[2, 2]).await;
        let dest = grid_group(&world, &[2, 3], &[2]).await;
        let pair = CrossGroupMatcher::combination().build(&src, &dest).await.unwrap();
        (
            pair.send.members().to_vec(),
            pair.recv.is_active(),
            pair.send == pair.recv,
        )
    })
    .await;

    assert_eq!(results[0], (vec![2, 0], false, false));
    assert_eq!(results[1], (vec![3, 1], false, false));
    assert_eq!(results[2], (vec![2, 0], true, true));
    assert_eq!(results[3], (vec![3, 1], true, true));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn subtopology_splits_rows_and_columns() {
    let results = run_workers(6, |endpoint| async move {
        let world = WorkerGroup::world(endpoint);
        let grid = world.attach_cartesian_topology(&[2, 3]).await.unwrap();
        let row = grid.cartesian_subtopology(&[false, true]).await.unwrap();
        let column = grid.cartesian_subtopology(&[true, false]).await.unwrap();
        (
            row.members().to_vec(),
            row.shape().map(<[usize]>::to_vec),
            column.members().to_vec(),
            column.coord().map(<[usize]>::to_vec),
        )
    })
    .await;

    for (rank, (row, row_shape, column, column_coord)) in results.into_iter().enumerate() {
        let (i, j) = (rank / 3, rank % 3);
        assert_eq!(row, vec![3 * i, 3 * i + 1, 3 * i + 2]);
        assert_eq!(row_shape, Some(vec![3]));
        assert_eq!(column, vec![j, 3 + j]);
        assert_eq!(column_coord, Some(vec![i]));
    }
}

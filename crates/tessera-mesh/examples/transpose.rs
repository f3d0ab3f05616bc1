//! Row-split to column-split redistribution over four in-process workers.
//!
//! A 4x6 tensor starts split by rows over workers 0 and 1 (grid [2, 1])
//! and ends split by columns over workers 1, 2 and 3 (grid [1, 3]). The
//! gradient pass then sends ones back to the row layout.
//!
//! ```sh
//! RUST_LOG=tessera_mesh=debug cargo run --example transpose -p tessera-mesh
//! ```

use std::sync::Arc;

use tessera_mesh::{Decomposition, ExchangeConfig, ExchangePlan, Fabric, Redistributor, WorkerGroup};
use tessera_tensor::{Local, Shape, Tensor};

const GLOBAL: [usize; 2] = [4, 6];

async fn worker(world: WorkerGroup) -> tessera_mesh::Result<String> {
    let rank = world.endpoint().rank();
    let rows = world
        .inclusive_subset(&[0, 1])
        .await?
        .attach_cartesian_topology(&[2, 1])
        .await?;
    let columns = world
        .inclusive_subset(&[1, 2, 3])
        .await?
        .attach_cartesian_topology(&[1, 3])
        .await?;

    let plan = ExchangePlan::build(&rows, &columns, &GLOBAL, ExchangeConfig::default()).await?;
    let mut redistribute = Redistributor::<f32>::new(Arc::new(plan));

    let x: Local<f32> = match (rows.coord(), rows.shape()) {
        (Some(coord), Some(grid)) => {
            let block = Decomposition::new(&GLOBAL, grid)?.block(coord);
            let origin = block.origin();
            Tensor::from_fn(Shape::new(block.extents()), |idx| {
                ((idx[0] + origin[0]) * GLOBAL[1] + idx[1] + origin[1]) as f32
            })
            .into()
        }
        _ => Local::Empty,
    };

    let (y, saved) = redistribute.forward(x).await?;
    let grad = match y.shape() {
        Some(shape) => Tensor::from_fn(shape.clone(), |_| 1.0).into(),
        None => Local::Empty,
    };
    let dx = redistribute.backward(&saved, grad).await?;

    let describe = |local: &Local<f32>| match local.as_present() {
        Some(t) => format!("{} {:?}", t.shape(), t.data()),
        None => "-".to_string(),
    };
    Ok(format!(
        "worker {rank}: column block {}, row gradient {}",
        describe(&y),
        describe(&dx)
    ))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let handles: Vec<_> = Fabric::builder()
        .workers(4)
        .build()
        .into_iter()
        .map(|endpoint| tokio::spawn(worker(WorkerGroup::world(endpoint))))
        .collect();

    for handle in handles {
        println!("{}", handle.await??);
    }
    Ok(())
}

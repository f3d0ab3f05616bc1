//! tessera-mesh: worker groups and block redistribution for tensors.
//!
//! A set of workers shares an in-process message fabric. Workers form
//! groups, give them Cartesian topologies, and move a tensor decomposed
//! over one grid onto another grid. Each worker contributes only its local
//! block; the exchange is linear and its backward pass is the exact adjoint.
//!
//! # Architecture
//!
//! ```text
//!  src grid [3]                            dest grid [2]
//! ┌──────┬──────┬──────┐  pack + isend   ┌─────────┬─────────┐
//! │  w0  │  w1  │  w2  │ ──────────────→ │   w3    │   w4    │
//! │ 0..4 │ 4..8 │8..12 │ ←────────────── │  0..6   │  6..12  │
//! └──────┴──────┴──────┘    gradients    └─────────┴─────────┘
//! ```
//!
//! # Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use tessera_mesh::{ExchangeConfig, ExchangePlan, Fabric, Redistributor, WorkerGroup};
//!
//! // On every worker:
//! let world = WorkerGroup::world(endpoint);
//! let src = world.inclusive_subset(&[0, 1, 2]).await?.attach_cartesian_topology(&[3]).await?;
//! let dest = world.inclusive_subset(&[3, 4]).await?.attach_cartesian_topology(&[2]).await?;
//!
//! let plan = ExchangePlan::build(&src, &dest, &[12], ExchangeConfig::default()).await?;
//! let mut redistribute = Redistributor::<f64>::new(Arc::new(plan));
//! let (y, saved) = redistribute.forward(x).await?;
//! let dx = redistribute.backward(&saved, dy).await?;
//! ```

pub mod collective;
pub mod communicator;
pub mod config;
pub mod decomposition;
pub mod engine;
pub mod error;
pub mod grid;
pub mod group;
pub mod matcher;
pub mod plan;
pub mod protocol;
pub mod transport;

// Re-exports
pub use communicator::Communicator;
pub use config::ExchangeConfig;
pub use decomposition::{balanced_span, global_shape_from_local, Decomposition};
pub use engine::{
    AdjointFunction, ExchangePlan, GroupSignature, PlanCache, PlanKey, Redistributor, Saved,
};
pub use error::{ErrorKind, MeshError, Result};
pub use group::{Topology, WorkerGroup};
pub use matcher::{CrossGroupMatcher, MatchKind, SubgroupPair};
pub use plan::{Overlap, RedistributionPlan};
pub use protocol::{ContextId, Tag, PROTOCOL_VERSION};
pub use transport::{Completion, Endpoint, Fabric, FabricBuilder, Request, RequestSet};

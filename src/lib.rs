//! tessera: element types for distributed tensor redistribution.
//!
//! The foundation shared by the workspace: a single `Element` trait naming
//! the plain numeric types that can live in a distributed block and cross
//! the wire between workers.
//!
//! # Crates
//! - `tessera-tensor`: dense blocks, per-axis regions, contiguous pack/unpack
//! - `tessera-mesh`: worker groups, Cartesian topologies, redistribution

mod element;

pub use element::Element;

//! Dense N-dimensional blocks and per-axis regions.
//!
//! A [`Tensor`] is one worker's local block of a distributed array. A
//! [`Region`] names a rectangular sub-block of it with explicit per-axis
//! `[start, stop)` [`Span`]s, and the tensor's `pack`/`unpack` routines copy
//! such a sub-block to and from a flat buffer one contiguous run at a time.
//! [`Local`] is the tagged "this worker has a block or it does not" value
//! passed through redistribution.

mod error;
mod local;
mod region;
mod shape;
mod tensor;

pub use error::TensorError;
pub use local::Local;
pub use region::{Region, Span};
pub use shape::Shape;
pub use tensor::Tensor;

//! Error types for tessera-mesh.

use tessera_tensor::TensorError;

use crate::protocol::{ContextId, Tag};

/// Coarse classification of a [`MeshError`].
///
/// None of the classes is recoverable locally: configuration and
/// inactive-group errors are model-definition or caller bugs caught at
/// setup, communication failures abort the whole distributed job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Structurally invalid model definition.
    Configuration,
    /// An operation needing a rank or coordinate ran on an inactive member.
    InactiveGroup,
    /// The messaging substrate failed.
    Communication,
}

/// Errors that can occur in group construction and redistribution.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    /// Union of groups derived from unrelated root contexts.
    #[error("cannot union groups with different roots ({left} vs {right})")]
    RootMismatch { left: ContextId, right: ContextId },

    /// A rank outside `[0, size)` was named.
    #[error("rank {rank} out of range for group of size {size}")]
    RankOutOfRange { rank: usize, size: usize },

    /// A rank was listed twice when building a subgroup.
    #[error("rank {rank} listed more than once")]
    DuplicateRank { rank: usize },

    /// `product(shape)` differs from the group size.
    #[error("topology shape {shape:?} does not cover a group of size {size}")]
    TopologyMismatch { shape: Vec<usize>, size: usize },

    /// Axis mask length differs from the topology dimension.
    #[error("axis mask of length {mask} for a {dim}-dimensional topology")]
    AxisMaskMismatch { mask: usize, dim: usize },

    /// Source and destination grids fail the broadcast-shape rule.
    #[error("grid shapes {src:?} and {dest:?} are not {rule} compatible")]
    IncompatibleGrids {
        src: Vec<usize>,
        dest: Vec<usize>,
        rule: &'static str,
    },

    /// A matching index has no owner on the source side.
    #[error("no worker owns matching index {index}")]
    UnmatchedIndex { index: i64 },

    /// Broadcast root is not a member of the data group.
    #[error("root rank {root} is not a member of the source group")]
    RootNotInSource { root: usize },

    /// Grid dimensionality differs from the tensor dimensionality.
    #[error("grid {grid:?} cannot decompose a tensor of shape {global:?}")]
    GridRankMismatch { grid: Vec<usize>, global: Vec<usize> },

    /// Local input block does not match the decomposition.
    #[error("local block has shape {got:?}, expected {expected:?}")]
    LocalShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// Two inbound regions of one worker overlap.
    #[error("inbound regions from partners {first} and {second} overlap")]
    OverlappingInbound { first: usize, second: usize },

    /// Invalid exchange configuration.
    #[error("invalid exchange configuration: {0}")]
    Config(String),

    /// An active sending worker passed no block.
    #[error("{0} requires a local block on every active sending worker")]
    MissingInput(&'static str),

    /// Another worker rejected its own input; it reports the actual cause.
    #[error("union rank {rank} rejected its input to {operation}")]
    PeerRejected { rank: usize, operation: &'static str },

    /// Coordinate or rank queried on a worker outside the group.
    #[error("{0} requires an active group member")]
    InactiveGroup(&'static str),

    /// Cartesian query on a group without an attached topology.
    #[error("{0} requires a Cartesian topology")]
    NoTopology(&'static str),

    /// Peer's channel closed before a posted receive completed.
    #[error("peer {source_rank} hung up on {context} tag {tag}")]
    PeerHungUp {
        context: ContextId,
        source_rank: usize,
        tag: Tag,
    },

    /// Metadata collective received malformed contributions.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] postcard::Error),

    /// Packing or unpacking a block failed.
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

impl MeshError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InactiveGroup(_) | Self::NoTopology(_) => ErrorKind::InactiveGroup,
            Self::PeerHungUp { .. } | Self::Protocol(_) | Self::Serde(_) => {
                ErrorKind::Communication
            }
            _ => ErrorKind::Configuration,
        }
    }

    pub fn is_configuration(&self) -> bool {
        self.kind() == ErrorKind::Configuration
    }
}

/// Result alias for mesh operations.
pub type Result<T> = std::result::Result<T, MeshError>;

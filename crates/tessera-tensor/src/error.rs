use crate::Region;

/// Errors from building or slicing a [`Tensor`](crate::Tensor).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TensorError {
    #[error("data length {len} does not match shape {shape:?} ({numel} elements)")]
    DataLength {
        len: usize,
        shape: Vec<usize>,
        numel: usize,
    },

    #[error("region {region} has {region_ndim} axes but the tensor has {tensor_ndim}")]
    RankMismatch {
        region: Region,
        region_ndim: usize,
        tensor_ndim: usize,
    },

    #[error("region {region} is outside tensor shape {shape:?}")]
    OutOfBounds { region: Region, shape: Vec<usize> },

    #[error("buffer holds {len} elements but region {region} needs {volume}")]
    BufferLength {
        region: Region,
        len: usize,
        volume: usize,
    },
}

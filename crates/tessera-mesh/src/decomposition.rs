//! Balanced block decomposition of a global tensor over a process grid.
//!
//! Axis `a` of extent `n` split into `p` parts gives the first `n % p`
//! parts `n / p + 1` elements and the rest `n / p`, in order.

use serde::{Deserialize, Serialize};
use tessera_tensor::{Region, Span};

use crate::error::{MeshError, Result};
use crate::grid;
use crate::group::WorkerGroup;

/// Span of part `index` when `extent` elements are split into `parts`.
pub fn balanced_span(extent: usize, parts: usize, index: usize) -> Span {
    debug_assert!(index < parts);
    let base = extent / parts;
    let remainder = extent % parts;
    let start = index * base + index.min(remainder);
    let len = base + usize::from(index < remainder);
    Span::new(start, start + len)
}

/// How a global tensor is cut into one block per grid cell.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Decomposition {
    global: Vec<usize>,
    grid: Vec<usize>,
}

impl Decomposition {
    /// Decompose `global` over `grid`; one grid axis per tensor axis.
    pub fn new(global: &[usize], grid: &[usize]) -> Result<Self> {
        if global.len() != grid.len() {
            return Err(MeshError::GridRankMismatch {
                grid: grid.to_vec(),
                global: global.to_vec(),
            });
        }
        if grid.contains(&0) {
            return Err(MeshError::TopologyMismatch {
                shape: grid.to_vec(),
                size: 0,
            });
        }
        Ok(Self {
            global: global.to_vec(),
            grid: grid.to_vec(),
        })
    }

    pub fn global_shape(&self) -> &[usize] {
        &self.global
    }

    pub fn grid_shape(&self) -> &[usize] {
        &self.grid
    }

    /// Global region owned by the worker at `coord`.
    pub fn block(&self, coord: &[usize]) -> Region {
        debug_assert_eq!(coord.len(), self.grid.len());
        Region::new(
            self.global
                .iter()
                .zip(&self.grid)
                .zip(coord)
                .map(|((&n, &p), &c)| balanced_span(n, p, c))
                .collect(),
        )
    }

    /// Extents of the block owned by the worker at `coord`.
    pub fn local_shape(&self, coord: &[usize]) -> Vec<usize> {
        self.block(coord).extents()
    }

    /// Every block with its grid coordinate, in row-major grid order.
    pub fn blocks(&self) -> impl Iterator<Item = (Vec<usize>, Region)> + '_ {
        grid::coordinates(&self.grid).map(move |c| {
            let block = self.block(&c);
            (c, block)
        })
    }
}

/// Reconstruct the global tensor shape from every worker's local extents.
///
/// Collective over an active Cartesian `group`. Along each axis the global
/// extent is the sum of the local extents of the workers whose coordinate
/// is zero on every other axis. Inactive members get `None`.
pub async fn global_shape_from_local(group: &WorkerGroup, local_shape: &[usize]) -> Result<Option<Vec<usize>>> {
    if !group.is_active() {
        return Ok(None);
    }
    let coord = group.cartesian_coord()?;
    if coord.len() != local_shape.len() {
        return Err(MeshError::GridRankMismatch {
            grid: group.shape().unwrap_or_default().to_vec(),
            global: local_shape.to_vec(),
        });
    }

    let ndim = coord.len();
    let row: Vec<i64> = coord
        .iter()
        .chain(local_shape)
        .map(|&x| x as i64)
        .collect();
    let rows = group
        .allgather_vector(&row)
        .await?
        .ok_or(MeshError::InactiveGroup("global_shape_from_local"))?;

    let mut global = vec![0usize; ndim];
    for row in &rows {
        let (c, extents) = row.split_at(ndim);
        for axis in 0..ndim {
            let on_axis = c
                .iter()
                .enumerate()
                .all(|(other, &x)| other == axis || x == 0);
            if on_axis {
                global[axis] += extents[axis] as usize;
            }
        }
    }
    Ok(Some(global))
}

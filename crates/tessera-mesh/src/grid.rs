//! Index arithmetic on Cartesian process grids.

/// Number of cells in a grid.
pub fn volume(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Row-major coordinate of cell `index`.
pub fn coordinate_for_linear_index(mut index: usize, shape: &[usize]) -> Vec<usize> {
    let mut coordinate = vec![0usize; shape.len()];
    for axis in (0..shape.len()).rev() {
        let extent = shape[axis].max(1);
        coordinate[axis] = index % extent;
        index /= extent;
    }
    coordinate
}

/// Row-major linear index of `coord`, or `None` if it falls off the grid.
pub fn linear_index(coord: &[usize], shape: &[usize]) -> Option<usize> {
    if coord.len() != shape.len() {
        return None;
    }
    let mut index = 0usize;
    for (&c, &extent) in coord.iter().zip(shape) {
        if c >= extent {
            return None;
        }
        index = index * extent + c;
    }
    Some(index)
}

/// Row-major (C order) flattening of `index` within `shape`.
pub fn flat_index_c(shape: &[usize], index: &[usize]) -> i64 {
    let mut flat = 0i64;
    for (&i, &extent) in index.iter().zip(shape) {
        flat = flat * extent as i64 + i as i64;
    }
    flat
}

/// Column-major (Fortran order) flattening of `index` within `shape`.
pub fn flat_index_f(shape: &[usize], index: &[usize]) -> i64 {
    let mut flat = 0i64;
    for (&i, &extent) in index.iter().zip(shape).rev() {
        flat = flat * extent as i64 + i as i64;
    }
    flat
}

/// Every coordinate of the grid, in row-major order.
pub fn coordinates(shape: &[usize]) -> impl Iterator<Item = Vec<usize>> + '_ {
    (0..volume(shape)).map(move |i| coordinate_for_linear_index(i, shape))
}

use crate::{Region, Shape, TensorError};
use tessera::Element;

/// N-dimensional row-major tensor with CPU storage.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor<T: Element> {
    data: Vec<T>,
    shape: Shape,
    strides: Vec<usize>,
    requires_grad: bool,
}

impl<T: Element> Tensor<T> {
    /// Create a tensor from flat row-major data and shape.
    pub fn new(data: Vec<T>, shape: Shape) -> Result<Self, TensorError> {
        if data.len() != shape.numel() {
            return Err(TensorError::DataLength {
                len: data.len(),
                shape: shape.dims().to_vec(),
                numel: shape.numel(),
            });
        }
        let strides = shape.contiguous_strides();
        Ok(Self {
            data,
            shape,
            strides,
            requires_grad: false,
        })
    }

    /// Create a tensor filled with `T::ZERO`.
    pub fn zeros(shape: Shape) -> Self {
        let n = shape.numel();
        let strides = shape.contiguous_strides();
        Self {
            data: vec![T::ZERO; n],
            shape,
            strides,
            requires_grad: false,
        }
    }

    /// Create a tensor from a closure over the multi-index.
    pub fn from_fn(shape: Shape, f: impl Fn(&[usize]) -> T) -> Self {
        let n = shape.numel();
        let strides = shape.contiguous_strides();
        let ndim = shape.ndim();
        let mut data = Vec::with_capacity(n);
        let mut idx = vec![0usize; ndim];

        for _ in 0..n {
            data.push(f(&idx));
            // Increment multi-index
            for d in (0..ndim).rev() {
                idx[d] += 1;
                if idx[d] < shape[d] {
                    break;
                }
                idx[d] = 0;
            }
        }
        Self {
            data,
            shape,
            strides,
            requires_grad: false,
        }
    }

    /// 1-D tensor from slice.
    pub fn from_slice(s: &[T]) -> Self {
        Self::from_fn(Shape::from_slice(&[s.len()]), |idx| s[idx[0]])
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }
    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }
    pub fn numel(&self) -> usize {
        self.shape.numel()
    }
    pub fn data(&self) -> &[T] {
        &self.data
    }
    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }
    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    pub fn set_requires_grad(&mut self, requires_grad: bool) {
        self.requires_grad = requires_grad;
    }

    pub fn with_requires_grad(mut self, requires_grad: bool) -> Self {
        self.requires_grad = requires_grad;
        self
    }

    fn flat_index(&self, idx: &[usize]) -> usize {
        debug_assert_eq!(idx.len(), self.ndim());
        idx.iter()
            .zip(self.strides.iter())
            .map(|(i, s)| i * s)
            .sum()
    }

    /// Get element by multi-index.
    pub fn get(&self, idx: &[usize]) -> T {
        self.data[self.flat_index(idx)]
    }

    /// Set element by multi-index.
    pub fn set(&mut self, idx: &[usize], val: T) {
        let fi = self.flat_index(idx);
        self.data[fi] = val;
    }

    /// Copy the elements of `region` into `out` in row-major order.
    ///
    /// `out` is cleared first so a buffer can be reused across calls.
    pub fn pack_into(&self, region: &Region, out: &mut Vec<T>) -> Result<(), TensorError> {
        self.check_region(region)?;
        out.clear();
        out.reserve(region.volume());
        visit_runs(&self.strides, region, |offset, len| {
            out.extend_from_slice(&self.data[offset..offset + len]);
        });
        Ok(())
    }

    /// Copy the elements of `region` into a fresh buffer.
    pub fn pack(&self, region: &Region) -> Result<Vec<T>, TensorError> {
        let mut out = Vec::new();
        self.pack_into(region, &mut out)?;
        Ok(out)
    }

    /// Overwrite `region` with row-major `src`.
    pub fn unpack(&mut self, region: &Region, src: &[T]) -> Result<(), TensorError> {
        self.check_region(region)?;
        let volume = region.volume();
        if src.len() != volume {
            return Err(TensorError::BufferLength {
                region: region.clone(),
                len: src.len(),
                volume,
            });
        }
        let mut cursor = 0;
        let data = &mut self.data;
        visit_runs(&self.strides, region, |offset, len| {
            data[offset..offset + len].copy_from_slice(&src[cursor..cursor + len]);
            cursor += len;
        });
        Ok(())
    }

    fn check_region(&self, region: &Region) -> Result<(), TensorError> {
        if region.ndim() != self.ndim() {
            return Err(TensorError::RankMismatch {
                region: region.clone(),
                region_ndim: region.ndim(),
                tensor_ndim: self.ndim(),
            });
        }
        let fits = region
            .spans()
            .iter()
            .zip(self.shape.dims())
            .all(|(s, &d)| s.start <= s.stop && s.stop <= d);
        if !fits {
            return Err(TensorError::OutOfBounds {
                region: region.clone(),
                shape: self.shape.dims().to_vec(),
            });
        }
        Ok(())
    }
}

/// Walk the contiguous innermost-axis runs of `region` in row-major order,
/// calling `f(offset, len)` for each.
fn visit_runs(strides: &[usize], region: &Region, mut f: impl FnMut(usize, usize)) {
    let spans = region.spans();
    let Some((last, outer)) = spans.split_last() else {
        // Scalar block: exactly one element.
        f(0, 1);
        return;
    };
    if region.is_empty() {
        return;
    }

    let run = last.len();
    let mut idx: Vec<usize> = outer.iter().map(|s| s.start).collect();
    loop {
        let base: usize = idx
            .iter()
            .zip(strides)
            .map(|(i, s)| i * s)
            .sum::<usize>()
            + last.start;
        f(base, run);

        // Increment the outer multi-index
        let mut d = outer.len();
        loop {
            if d == 0 {
                return;
            }
            d -= 1;
            idx[d] += 1;
            if idx[d] < outer[d].stop {
                break;
            }
            idx[d] = outer[d].start;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Span;

    fn iota(dims: &[usize]) -> Tensor<i32> {
        let shape = Shape::from_slice(dims);
        let strides = shape.contiguous_strides();
        Tensor::from_fn(shape, |idx| {
            idx.iter().zip(&strides).map(|(i, s)| i * s).sum::<usize>() as i32
        })
    }

    #[test]
    fn tensor_basics() {
        let t = Tensor::<f32>::zeros(Shape::from_slice(&[2, 3]));
        assert_eq!(t.numel(), 6);
        assert!(t.data().iter().all(|&x| x == 0.0));
        assert!(!t.requires_grad());
        assert!(t.with_requires_grad(true).requires_grad());
    }

    #[test]
    fn new_checks_length() {
        let err = Tensor::new(vec![1.0f64; 5], Shape::from_slice(&[2, 3])).unwrap_err();
        assert!(matches!(err, TensorError::DataLength { len: 5, numel: 6, .. }));
    }

    #[test]
    fn pack_interior_block() {
        let t = iota(&[3, 4]);
        let region = Region::new(vec![Span::new(1, 3), Span::new(1, 3)]);
        assert_eq!(t.pack(&region).unwrap(), vec![5, 6, 9, 10]);
    }

    #[test]
    fn pack_three_dimensional() {
        let t = iota(&[2, 3, 4]);
        let region = Region::new(vec![Span::new(1, 2), Span::new(0, 2), Span::new(2, 4)]);
        assert_eq!(t.pack(&region).unwrap(), vec![14, 15, 18, 19]);
    }

    #[test]
    fn unpack_overwrites_only_region() {
        let mut t = Tensor::<i32>::zeros(Shape::from_slice(&[3, 3]));
        let region = Region::new(vec![Span::new(0, 2), Span::new(1, 3)]);
        t.unpack(&region, &[1, 2, 3, 4]).unwrap();
        assert_eq!(t.data(), &[0, 1, 2, 0, 3, 4, 0, 0, 0]);

        t.unpack(&region, &[9, 9, 9, 9]).unwrap();
        assert_eq!(t.get(&[0, 1]), 9);
        assert_eq!(t.get(&[2, 2]), 0);
    }

    #[test]
    fn pack_then_unpack_restores_block() {
        let src = iota(&[4, 5]);
        let mut dst = Tensor::<i32>::zeros(Shape::from_slice(&[4, 5]));
        for region in [
            Region::new(vec![Span::new(0, 2), Span::new(0, 5)]),
            Region::new(vec![Span::new(2, 4), Span::new(0, 3)]),
            Region::new(vec![Span::new(2, 4), Span::new(3, 5)]),
        ] {
            let buf = src.pack(&region).unwrap();
            dst.unpack(&region, &buf).unwrap();
        }
        assert_eq!(src, dst);
    }

    #[test]
    fn empty_region_moves_nothing() {
        let t = iota(&[4]);
        let region = Region::new(vec![Span::new(2, 2)]);
        assert!(t.pack(&region).unwrap().is_empty());
    }

    #[test]
    fn region_errors() {
        let mut t = iota(&[2, 2]);
        let wrong_rank = Region::new(vec![Span::new(0, 1)]);
        assert!(matches!(t.pack(&wrong_rank), Err(TensorError::RankMismatch { .. })));

        let outside = Region::new(vec![Span::new(0, 3), Span::new(0, 1)]);
        assert!(matches!(t.pack(&outside), Err(TensorError::OutOfBounds { .. })));

        let region = Region::full(&[2, 2]);
        assert!(matches!(
            t.unpack(&region, &[1, 2, 3]),
            Err(TensorError::BufferLength { volume: 4, .. })
        ));
    }
}

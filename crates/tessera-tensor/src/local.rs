use crate::{Shape, Tensor};
use tessera::Element;

/// A worker's share of a distributed array: either a block, or nothing
/// because the worker is not part of the group that owns the array.
#[derive(Debug, Clone, PartialEq)]
pub enum Local<T: Element> {
    Present(Tensor<T>),
    Empty,
}

impl<T: Element> Local<T> {
    pub fn is_present(&self) -> bool {
        matches!(self, Local::Present(_))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Local::Empty)
    }

    pub fn as_present(&self) -> Option<&Tensor<T>> {
        match self {
            Local::Present(t) => Some(t),
            Local::Empty => None,
        }
    }

    pub fn into_present(self) -> Option<Tensor<T>> {
        match self {
            Local::Present(t) => Some(t),
            Local::Empty => None,
        }
    }

    pub fn shape(&self) -> Option<&Shape> {
        self.as_present().map(Tensor::shape)
    }

    /// Gradient flag of the block; an empty share never requires one.
    pub fn requires_grad(&self) -> bool {
        self.as_present().is_some_and(Tensor::requires_grad)
    }
}

impl<T: Element> Default for Local<T> {
    fn default() -> Self {
        Local::Empty
    }
}

impl<T: Element> From<Tensor<T>> for Local<T> {
    fn from(t: Tensor<T>) -> Self {
        Local::Present(t)
    }
}

impl<T: Element> From<Option<Tensor<T>>> for Local<T> {
    fn from(t: Option<Tensor<T>>) -> Self {
        t.map_or(Local::Empty, Local::Present)
    }
}

//! `Tensor`: a reference to a GPU buffer plus shape/dtype metadata.
//!
//! Tensors are views; ownership of the backing buffer lives on
//! [`crate::buffer_pool::BufferPool`] and is tracked via
//! [`crate::buffer_pool::PoolBuffer`], not on the tensor itself (see the
//! "Ownership of GPU buffers" design note).

use crate::buffer_pool::PoolBuffer;
pub use shape::Shape;

/// Element type of a tensor's backing storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DType {
    F16,
    F32,
}

impl DType {
    pub fn byte_size(self) -> u32 {
        match self {
            DType::F16 => 2,
            DType::F32 => 4,
        }
    }
}

/// A reference to a GPU buffer plus `{dtype, shape, label}` metadata.
///
/// `row_offset` lets a `Tensor` name a sub-range of rows within a larger
/// backing buffer without copying — used by MoE dispatch to address one
/// expert's slice of a `[num_experts, max_tokens_per_expert, hidden_size]`
/// staging/output slab (spec §4.4). A `KernelSet` implementation is
/// responsible for applying `row_offset * row_stride_bytes` when binding the
/// buffer; every other caller leaves it at `0`.
#[derive(Clone, Debug)]
pub struct Tensor {
    pub buffer: PoolBuffer,
    pub dtype: DType,
    pub shape: Shape,
    pub row_offset: u32,
    pub label: &'static str,
}

impl Tensor {
    pub fn new(buffer: PoolBuffer, dtype: DType, shape: Shape, label: &'static str) -> Self {
        Self {
            buffer,
            dtype,
            shape,
            row_offset: 0,
            label,
        }
    }

    /// Total element count across all dimensions.
    pub fn numel(&self) -> u64 {
        self.shape.numel()
    }

    /// Total byte size implied by `shape` and `dtype`.
    pub fn byte_size(&self) -> u64 {
        self.numel() * self.dtype.byte_size() as u64
    }

    /// A view onto `row_offset` rows (of `shape`'s row width) further into
    /// this tensor's backing buffer, reinterpreted with `shape`. Shares the
    /// same `buffer` handle — no data is copied.
    pub fn view(&self, row_offset: u32, shape: Shape) -> Tensor {
        Tensor {
            buffer: self.buffer,
            dtype: self.dtype,
            shape,
            row_offset: self.row_offset + row_offset,
            label: self.label,
        }
    }
}

/// A small fixed-capacity shape, avoiding heap allocation for the common
/// case (tensors in this crate are at most rank 4: `[batch, seq, heads,
/// head_dim]` or similar).
pub mod shape {
    const MAX_RANK: usize = 4;

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Shape {
        dims: [u32; MAX_RANK],
        rank: u8,
    }

    impl Shape {
        pub fn new(dims: &[u32]) -> Self {
            assert!(dims.len() <= MAX_RANK, "tensor rank exceeds MAX_RANK");
            let mut buf = [1u32; MAX_RANK];
            buf[..dims.len()].copy_from_slice(dims);
            Self {
                dims: buf,
                rank: dims.len() as u8,
            }
        }

        pub fn as_slice(&self) -> &[u32] {
            &self.dims[..self.rank as usize]
        }

        pub fn rank(&self) -> usize {
            self.rank as usize
        }

        pub fn numel(&self) -> u64 {
            self.as_slice().iter().map(|&d| d as u64).product()
        }

        pub fn dim(&self, index: usize) -> u32 {
            self.dims[index]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::PoolBuffer;

    #[test]
    fn numel_multiplies_dims() {
        let shape = Shape::new(&[2, 3, 4]);
        assert_eq!(shape.numel(), 24);
    }

    #[test]
    fn byte_size_accounts_for_dtype() {
        let t = Tensor::new(
            PoolBuffer::dangling(),
            DType::F16,
            Shape::new(&[4, 8]),
            "test",
        );
        assert_eq!(t.byte_size(), 4 * 8 * 2);
    }
}

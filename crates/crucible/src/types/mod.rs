pub mod dispatch;

use std::sync::Arc;

use smallvec::SmallVec;

pub use dispatch::{DispatchConfig, GridSize, ThreadgroupSize};

/// Element types accepted at the kernel boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Dtype {
    F16,
    F32,
}

impl Dtype {
    #[must_use]
    pub const fn size_bytes(self) -> usize {
        match self {
            Dtype::F16 => 2,
            Dtype::F32 => 4,
        }
    }
}

/// Backing storage behind a [`TensorArg`].
///
/// The launch path only accepts `Metal` buffers; `Host` exists so layout
/// resolution and the planning half of the dispatcher can run (and be
/// tested) without a device. Handing a host buffer to `execute` is a
/// capability error, never a silent fallback.
#[derive(Clone, Debug)]
pub enum Buffer {
    #[cfg(target_os = "macos")]
    Metal(crate::metal_rt::MetalBuffer),
    Host(Arc<[u8]>),
}

impl Buffer {
    /// Wrap host bytes for planning/diagnostic use.
    pub fn from_host_bytes(bytes: impl Into<Arc<[u8]>>) -> Self {
        Buffer::Host(bytes.into())
    }

    /// Length of the underlying allocation in bytes.
    #[must_use]
    pub fn len_bytes(&self) -> usize {
        match self {
            #[cfg(target_os = "macos")]
            Buffer::Metal(buffer) => buffer.length(),
            Buffer::Host(bytes) => bytes.len(),
        }
    }
}

/// Opaque tensor handle at the kernel launch boundary.
///
/// Strides are expressed in bytes, one per dimension, so padded and
/// non-contiguous layouts pass through unchanged. `dims` follow Rust
/// row-major convention, outermost first: `[batch, heads, seq, head_dim]`
/// (rank 3 drops the batch dimension).
#[derive(Clone, Debug)]
pub struct TensorArg {
    pub buffer: Option<Buffer>,
    pub offset: usize,
    pub dtype: Dtype,
    pub dims: SmallVec<[usize; 4]>,
    pub strides: SmallVec<[usize; 4]>,
}

impl Default for TensorArg {
    fn default() -> Self {
        Self {
            buffer: None,
            offset: 0,
            dtype: Dtype::F16,
            dims: SmallVec::new(),
            strides: SmallVec::new(),
        }
    }
}

impl TensorArg {
    /// Describe a dense f16 tensor backed by host memory.
    pub fn host_f16(bytes: impl Into<Arc<[u8]>>, dims: &[usize]) -> Self {
        let mut arg = Self::with_layout(Dtype::F16, dims, &contiguous_byte_strides(dims, 2));
        arg.buffer = Some(Buffer::from_host_bytes(bytes));
        arg
    }

    /// Describe a tensor layout without attaching storage.
    pub fn with_layout(dtype: Dtype, dims: &[usize], byte_strides: &[usize]) -> Self {
        debug_assert_eq!(dims.len(), byte_strides.len());
        Self {
            buffer: None,
            offset: 0,
            dtype,
            dims: SmallVec::from_slice(dims),
            strides: SmallVec::from_slice(byte_strides),
        }
    }

    #[must_use]
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    #[must_use]
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }
}

/// Dense row-major byte strides for `dims` with the given element size.
#[must_use]
pub fn contiguous_byte_strides(dims: &[usize], elem_bytes: usize) -> SmallVec<[usize; 4]> {
    let mut strides: SmallVec<[usize; 4]> = SmallVec::from_elem(elem_bytes, dims.len());
    for i in (0..dims.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * dims[i + 1];
    }
    strides
}

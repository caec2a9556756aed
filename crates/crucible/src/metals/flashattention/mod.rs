//! Fused scaled-dot-product attention for Apple GPUs.
//!
//! The pipeline is a single generated kernel per [`FlashVariant`]: the
//! query/key product, bias and soft-cap, streaming softmax, and value
//! accumulation all happen in one pass over interleaved key blocks.
//! Split-parallel launches write unnormalized partials plus `(max, sum)`
//! metadata and are combined afterwards.

pub mod contract;
pub mod dispatch;
pub mod kernels;
pub mod runtime;
pub mod softmax;
pub mod stages;
pub mod tiling;
pub mod variants;

pub use runtime::{CompiledFlashAttention, FlashAttentionOp, combine_partials, compile};
pub use softmax::{AlibiParams, OnlineSoftmaxState, SOFTMAX_FTZ_THRESHOLD, alibi_slope};
pub use variants::{AccumPrecision, FlashVariant, HeadDims, SoftcapMode};

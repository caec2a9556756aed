//! Numeric policy for the online (streaming) softmax.
//!
//! The kernel and the host agree on three things: the flush-to-zero
//! threshold, the running (max, sum) update rule, and the ALiBi slope
//! schedule. They live here so the dispatcher, the merge-metadata
//! contract, and the tests all read the same constants the emitted Metal
//! source bakes in.

use half::f16;

/// Logit differences below this are flushed to exactly zero instead of
/// being exponentiated. Keeps denormals out of the rescale chain; the
/// exact value is a tunable precision/performance trade-off, not a
/// correctness bound (exp(-20) is already ~2e-9).
pub const SOFTMAX_FTZ_THRESHOLD: f32 = -20.0;

/// `exp(x)` under the flush-to-zero policy.
#[inline]
#[must_use]
pub fn exp_ftz(x: f32) -> f32 {
    if x <= SOFTMAX_FTZ_THRESHOLD { 0.0 } else { x.exp() }
}

/// Reduced-precision flavour of [`exp_ftz`]: rounding happens in f16
/// exactly where the paired-value kernel path rounds.
#[inline]
#[must_use]
pub fn exp_ftz_f16(x: f16) -> f16 {
    let x = x.to_f32();
    if x <= SOFTMAX_FTZ_THRESHOLD {
        f16::ZERO
    } else {
        f16::from_f32(x.exp())
    }
}

/// Running softmax state for one output row: the maximum logit seen so
/// far and the sum of `exp(logit - max)` over everything seen so far.
///
/// This is also the merge-metadata entry a split-parallel launch writes
/// per (query position, head, split): exactly the state needed to
/// combine partial outputs without recomputing scores.
#[derive(Clone, Copy, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[repr(C)]
pub struct OnlineSoftmaxState {
    pub max: f32,
    pub sum: f32,
}

impl OnlineSoftmaxState {
    /// Empty state: no logits observed.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            max: f32::NEG_INFINITY,
            sum: 0.0,
        }
    }

    /// Fold one block of logits into the state.
    ///
    /// Returns the factor the caller must scale its existing output
    /// accumulator by (the `exp(old_max - new_max)` decay). The running
    /// maximum is monotonically non-decreasing, so the factor is always
    /// in [0, 1] and the rescale is a decay, never a growth.
    pub fn update_block(&mut self, block: &[f32], weights_out: &mut [f32]) -> f32 {
        debug_assert_eq!(block.len(), weights_out.len());
        let block_max = block.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let new_max = self.max.max(block_max);
        if new_max == f32::NEG_INFINITY {
            // Fully-masked block; nothing to accumulate.
            weights_out.fill(0.0);
            return 1.0;
        }
        let rescale = if self.max == f32::NEG_INFINITY {
            1.0
        } else {
            exp_ftz(self.max - new_max)
        };
        let mut block_sum = 0.0f32;
        for (w, &logit) in weights_out.iter_mut().zip(block) {
            let e = exp_ftz(logit - new_max);
            *w = e;
            block_sum += e;
        }
        self.sum = self.sum * rescale + block_sum;
        self.max = new_max;
        rescale
    }

    /// Combine two partial states (the external combine step's math).
    ///
    /// Returns `(merged, self_scale, other_scale)`: the factors that the
    /// two partial output accumulators must be scaled by before adding.
    #[must_use]
    pub fn merge(self, other: Self) -> (Self, f32, f32) {
        if other.sum == 0.0 && other.max == f32::NEG_INFINITY {
            return (self, 1.0, 0.0);
        }
        if self.sum == 0.0 && self.max == f32::NEG_INFINITY {
            return (other, 0.0, 1.0);
        }
        let max = self.max.max(other.max);
        let self_scale = exp_ftz(self.max - max);
        let other_scale = exp_ftz(other.max - max);
        let merged = Self {
            max,
            sum: self.sum * self_scale + other.sum * other_scale,
        };
        (merged, self_scale, other_scale)
    }
}

/// ALiBi slope parameters precomputed on the host: `n_head_log2` is the
/// largest power of two not exceeding the query head count, and `m0`/`m1`
/// are the two geometric interpolation bases. Passing them in keeps the
/// per-head slope selection branch-only (no logarithm) on the device.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AlibiParams {
    pub n_head_log2: u32,
    pub m0: f32,
    pub m1: f32,
}

impl AlibiParams {
    /// Derive the schedule for `num_heads` query heads with the given
    /// maximum bias. `max_bias <= 0` disables ALiBi (slope 1.0 for all
    /// heads, and the kernel treats the mask as a plain additive bias).
    #[must_use]
    pub fn new(num_heads: u32, max_bias: f32) -> Self {
        debug_assert!(num_heads > 0);
        let n_head_log2 = 1u32 << (31 - num_heads.max(1).leading_zeros());
        Self {
            n_head_log2,
            m0: 2.0f32.powf(-max_bias / n_head_log2 as f32),
            m1: 2.0f32.powf(-max_bias / (2.0 * n_head_log2 as f32)),
        }
    }
}

/// Per-head ALiBi slope: geometric in the head index, with the second
/// base taking over past the power-of-two boundary.
#[must_use]
pub fn alibi_slope(max_bias: f32, head: u32, params: AlibiParams) -> f32 {
    if max_bias <= 0.0 {
        return 1.0;
    }
    if head < params.n_head_log2 {
        params.m0.powi(head as i32 + 1)
    } else {
        params.m1.powi(2 * (head - params.n_head_log2) as i32 + 1)
    }
}

//! Launch planning for the fused attention kernel: layout resolution,
//! variant selection, split policy, and the host half of the
//! split-parallel combine contract.
//!
//! `compile` is pure and runs on any host; `execute` (macOS only) hands
//! the plan to the Metal runtime.

use std::sync::Arc;

use crate::{
    device::OccupancyProvider,
    error::CrucibleError,
    metals::flashattention::{
        contract::resolve_accum_precision,
        dispatch::{group_size, resolved_split_degree, work_units},
        kernels::kernel_source,
        softmax::{AlibiParams, OnlineSoftmaxState},
        stages::{FlashAttentionStage, FlashParams},
        variants::{FlashVariant, HeadDims, SoftcapMode, TILE_WIDTHS, registry_row},
    },
    types::{DispatchConfig, Dtype, GridSize, TensorArg, ThreadgroupSize},
};

/// One fused attention launch as described by the caller.
#[derive(Clone, Copy, Debug)]
pub struct FlashAttentionOp<'a> {
    pub q: &'a TensorArg,
    pub k: &'a TensorArg,
    pub v: &'a TensorArg,
    /// Additive f16 bias of shape `[seq_q, seq_kv]`, scaled per head by
    /// the ALiBi slope when `max_bias > 0`.
    pub mask: Option<&'a TensorArg>,
    pub scale: f32,
    pub max_bias: f32,
    /// Zero disables soft-capping.
    pub softcap: f32,
    /// Accumulator precision request; `None` takes the contract default.
    pub precision: Option<crate::metals::flashattention::variants::AccumPrecision>,
}

/// A fully planned launch: everything `execute` needs, plus the output
/// and metadata extents the caller must allocate.
#[derive(Clone, Debug)]
pub struct CompiledFlashAttention {
    pub variant: FlashVariant,
    pub params: FlashParams,
    pub config: DispatchConfig,
    pub source: Arc<str>,
    pub scratch_bytes: usize,
    pub n_splits: u32,
    /// f32 elements in the output buffer. Unsplit: the final result of
    /// shape `[batch, heads, seq_q, head_v]`. Split: `n_splits`
    /// unnormalized partials stacked ahead of that shape. Each split
    /// writes one full-shape image outermost, deliberately not
    /// interleaved along the key axis it shards, so [`combine_partials`]
    /// walks partials and metadata with the same linear row index.
    pub out_len: usize,
    /// `(max, sum)` metadata entries, one per (split, batch, head, query
    /// position); zero when the launch is whole.
    pub meta_len: usize,
}

struct ResolvedLayout {
    batch: u32,
    heads: u32,
    seq: u32,
    dim: u32,
    stride_b: u32,
    stride_h: u32,
    stride_s: u32,
}

fn as_u32(value: usize, what: &'static str) -> Result<u32, CrucibleError> {
    u32::try_from(value).map_err(|_| CrucibleError::OperationFailed(format!("{what} {value} exceeds u32 range")))
}

fn resolve_layout(arg: &TensorArg, what: &'static str) -> Result<ResolvedLayout, CrucibleError> {
    if arg.dtype != Dtype::F16 {
        return Err(CrucibleError::UnsupportedDtype { operation: what, dtype: arg.dtype });
    }
    let (batch, heads, seq, dim, stride_b, stride_h, stride_s, stride_d) =
        match (arg.dims(), arg.strides()) {
            (&[b, h, s, d], &[sb, sh, ss, sd]) => (b, h, s, d, sb, sh, ss, sd),
            (&[h, s, d], &[sh, ss, sd]) => (1, h, s, d, 0, sh, ss, sd),
            _ => {
                return Err(CrucibleError::OperationNotSupported(format!(
                    "{what} must be rank 3 or 4, got shape {:?}",
                    arg.dims()
                )));
            }
        };
    if stride_d != arg.dtype.size_bytes() {
        return Err(CrucibleError::OperationNotSupported(format!(
            "{what} head dimension must be densely packed, got byte stride {stride_d}"
        )));
    }
    if heads == 0 || seq == 0 || dim == 0 {
        return Err(CrucibleError::OperationNotSupported(format!(
            "{what} has an empty dimension: shape {:?}",
            arg.dims()
        )));
    }
    Ok(ResolvedLayout {
        batch: as_u32(batch, "batch")?,
        heads: as_u32(heads, "head count")?,
        seq: as_u32(seq, "sequence length")?,
        dim: as_u32(dim, "head dimension")?,
        stride_b: as_u32(stride_b, "batch stride")?,
        stride_h: as_u32(stride_h, "head stride")?,
        stride_s: as_u32(stride_s, "sequence stride")?,
    })
}

fn resolve_mask_stride(arg: &TensorArg, seq_q: u32, seq_kv: u32) -> Result<u32, CrucibleError> {
    if arg.dtype != Dtype::F16 {
        return Err(CrucibleError::UnsupportedDtype { operation: "attention mask", dtype: arg.dtype });
    }
    let (rows, cols, stride_s, stride_c) = match (arg.dims(), arg.strides()) {
        (&[r, c], &[ss, sc]) => (r, c, ss, sc),
        (&[1, r, c], &[_, ss, sc]) => (r, c, ss, sc),
        _ => {
            return Err(CrucibleError::OperationNotSupported(format!(
                "attention mask must be [seq_q, seq_kv], got shape {:?}",
                arg.dims()
            )));
        }
    };
    if stride_c != arg.dtype.size_bytes() {
        return Err(CrucibleError::OperationNotSupported(
            "attention mask rows must be densely packed".to_string(),
        ));
    }
    if (rows as u64) < seq_q as u64 || (cols as u64) < seq_kv as u64 {
        return Err(CrucibleError::OperationNotSupported(format!(
            "attention mask {rows}x{cols} does not cover {seq_q} queries by {seq_kv} keys"
        )));
    }
    as_u32(stride_s, "mask row stride")
}

fn resolve_tile_width(dims: HeadDims, seq_len_q: u32) -> Result<u32, CrucibleError> {
    let forced_warps = match crucible_env::FA_WARPS.get() {
        Ok(value) => value,
        Err(err) => return Err(CrucibleError::OperationFailed(err.to_string())),
    };
    match forced_warps {
        None => Ok(FlashVariant::tile_width_for(dims, seq_len_q)),
        Some(warps) => {
            let tile_width = warps * 4;
            if !TILE_WIDTHS.contains(&tile_width) {
                return Err(CrucibleError::OperationFailed(format!(
                    "{} must be one of 2, 4, 8 or 16, got {warps}",
                    crucible_env::FA_WARPS.key()
                )));
            }
            Ok(tile_width.min(registry_row(dims).max_tile_width))
        }
    }
}

/// Plan a launch. Fails with [`CrucibleError::MissingCapability`] when
/// the device cannot run the simdgroup matrix path, and with a
/// descriptive error for any shape, dtype, or registry violation.
pub fn compile(
    op: &FlashAttentionOp<'_>,
    occupancy: &dyn OccupancyProvider,
) -> Result<CompiledFlashAttention, CrucibleError> {
    if !occupancy.supports_simdgroup_mma() {
        return Err(CrucibleError::MissingCapability(
            "device does not support simdgroup matrix multiplication".to_string(),
        ));
    }

    let q = resolve_layout(op.q, "attention queries")?;
    let k = resolve_layout(op.k, "attention keys")?;
    let v = resolve_layout(op.v, "attention values")?;

    if q.dim != k.dim {
        return Err(CrucibleError::OperationNotSupported(format!(
            "query head dimension {} does not match key head dimension {}",
            q.dim, k.dim
        )));
    }
    if k.seq != v.seq || k.heads != v.heads {
        return Err(CrucibleError::OperationNotSupported(format!(
            "key extent {}x{} does not match value extent {}x{}",
            k.heads, k.seq, v.heads, v.seq
        )));
    }
    if q.batch != k.batch || q.batch != v.batch {
        return Err(CrucibleError::OperationNotSupported(format!(
            "batch mismatch across q/k/v: {} vs {} vs {}",
            q.batch, k.batch, v.batch
        )));
    }

    let dims = HeadDims::from_sizes(q.dim, v.dim)?;
    let group = group_size(q.heads, k.heads)?;

    if op.max_bias > 0.0 && op.mask.is_none() {
        return Err(CrucibleError::OperationNotSupported(
            "positional bias requires a mask to scale".to_string(),
        ));
    }
    let mask_stride_s = match op.mask {
        Some(mask) => resolve_mask_stride(mask, q.seq, k.seq)?,
        None => 0,
    };

    let variant = FlashVariant {
        dims,
        tile_width: resolve_tile_width(dims, q.seq)?,
        precision: resolve_accum_precision(dims, op.precision)?,
        softcap: if op.softcap != 0.0 { SoftcapMode::Capped } else { SoftcapMode::Off },
    };
    variant.validate()?;

    let alibi = AlibiParams::new(q.heads, op.max_bias);
    // Soft-capping folds into the query pre-scale: the kernel applies
    // softcap * tanh(q k / softcap).
    let scale = if op.softcap != 0.0 { op.scale / op.softcap } else { op.scale };

    let units = work_units(q.seq, variant.tile_width, q.heads, q.batch);
    let n_kv_blocks = k.seq.div_ceil(variant.kv_block());
    let n_splits = resolved_split_degree(units, n_kv_blocks, occupancy)?;

    let params = FlashParams {
        q_stride_s: q.stride_s,
        q_stride_h: q.stride_h,
        q_stride_b: q.stride_b,
        k_stride_s: k.stride_s,
        k_stride_h: k.stride_h,
        k_stride_b: k.stride_b,
        v_stride_s: v.stride_s,
        v_stride_h: v.stride_h,
        v_stride_b: v.stride_b,
        mask_stride_s,
        seq_len_q: q.seq,
        seq_len_kv: k.seq,
        n_heads: q.heads,
        group_size: group,
        batch: q.batch,
        n_splits,
        scale,
        max_bias: op.max_bias,
        m0: alibi.m0,
        m1: alibi.m1,
        n_head_log2: alibi.n_head_log2,
        softcap: op.softcap,
    };

    let config = DispatchConfig::new(
        GridSize::new(
            q.seq.div_ceil(variant.tile_width) as usize,
            q.heads as usize,
            (q.batch * n_splits) as usize,
        ),
        ThreadgroupSize::d1(variant.threads_per_tg() as usize),
    );

    let rows = (q.batch * q.heads * q.seq) as usize;
    let out_len = n_splits as usize * rows * dims.v() as usize;
    let meta_len = if n_splits > 1 { n_splits as usize * rows } else { 0 };
    let scratch_bytes = FlashAttentionStage::new(variant).scratch().total_bytes();

    tracing::trace!(
        key = %variant.cache_key(),
        n_splits,
        work_units = units,
        grid = ?config.grid,
        "planned fused attention launch"
    );
    if crucible_env::is_set(crucible_env::EnvVar::DebugFa) {
        tracing::debug!(
            key = %variant.cache_key(),
            params = ?params,
            scratch_bytes,
            out_len,
            meta_len,
            group = ?config.group,
            "fused attention launch detail"
        );
    }

    Ok(CompiledFlashAttention {
        source: kernel_source(variant),
        scratch_bytes,
        variant,
        params,
        config,
        n_splits,
        out_len,
        meta_len,
    })
}

/// Combine unnormalized split partials on the host using the persisted
/// `(max, sum)` metadata.
///
/// `partials` is `[n_splits][rows][head_v]`, `meta` is `[n_splits][rows]`
/// where `rows` flattens (batch, head, query position) in launch order.
pub fn combine_partials(
    partials: &[f32],
    meta: &[OnlineSoftmaxState],
    n_splits: usize,
    rows: usize,
    head_v: usize,
) -> Result<Vec<f32>, CrucibleError> {
    if partials.len() != n_splits * rows * head_v || meta.len() != n_splits * rows {
        return Err(CrucibleError::OperationFailed(format!(
            "combine extents disagree: {} partial elements, {} metadata entries for {n_splits} splits x {rows} rows x {head_v}",
            partials.len(),
            meta.len()
        )));
    }
    let mut out = vec![0.0f32; rows * head_v];
    for row in 0..rows {
        let mut state = OnlineSoftmaxState::empty();
        let acc = &mut out[row * head_v..(row + 1) * head_v];
        for split in 0..n_splits {
            let entry = meta[split * rows + row];
            let (merged, old_scale, new_scale) = state.merge(entry);
            state = merged;
            let part = &partials[(split * rows + row) * head_v..(split * rows + row + 1) * head_v];
            for (o, &p) in acc.iter_mut().zip(part) {
                *o = *o * old_scale + p * new_scale;
            }
        }
        if state.sum > 0.0 {
            let inv = 1.0 / state.sum;
            for o in acc.iter_mut() {
                *o *= inv;
            }
        } else {
            acc.fill(0.0);
        }
    }
    Ok(out)
}

#[cfg(target_os = "macos")]
mod gpu {
    use super::CompiledFlashAttention;
    use crate::{
        error::CrucibleError,
        metal_rt::{MetalBuffer, MetalContext},
        metals::flashattention::stages::FlashAttentionStage,
        types::{Buffer, TensorArg},
    };

    /// Device-side results of one launch; contents depend on
    /// `n_splits` as described on [`CompiledFlashAttention`].
    pub struct FlashAttentionOutput {
        pub out: MetalBuffer,
        pub meta: Option<MetalBuffer>,
    }

    fn metal_buffer<'a>(arg: &'a TensorArg, what: &'static str) -> Result<(&'a MetalBuffer, usize), CrucibleError> {
        match &arg.buffer {
            Some(Buffer::Metal(buffer)) => Ok((buffer, arg.offset)),
            Some(Buffer::Host(_)) | None => Err(CrucibleError::InputNotFound(format!(
                "{what} is not backed by a device buffer"
            ))),
        }
    }

    impl CompiledFlashAttention {
        /// Encode and run the planned launch, blocking until completion.
        pub fn execute(
            &self,
            ctx: &mut MetalContext,
            q: &TensorArg,
            k: &TensorArg,
            v: &TensorArg,
            mask: Option<&TensorArg>,
        ) -> Result<FlashAttentionOutput, CrucibleError> {
            let pipeline = ctx.pipeline(
                &self.variant.cache_key(),
                &self.source,
                FlashAttentionStage::FUNCTION_NAME,
            )?;
            let out = ctx.new_buffer(self.out_len * 4)?;
            let meta = if self.meta_len > 0 {
                Some(ctx.new_buffer(self.meta_len * 8)?)
            } else {
                None
            };

            let (q_buf, q_off) = metal_buffer(q, "attention queries")?;
            let (k_buf, k_off) = metal_buffer(k, "attention keys")?;
            let (v_buf, v_off) = metal_buffer(v, "attention values")?;
            let mask_buf = match mask {
                Some(mask) => Some(metal_buffer(mask, "attention mask")?),
                None => None,
            };

            ctx.run(|encoder| {
                encoder.set_compute_pipeline_state(&pipeline);
                encoder.set_buffer(0, q_buf, q_off);
                encoder.set_buffer(1, k_buf, k_off);
                encoder.set_buffer(2, v_buf, v_off);
                match mask_buf {
                    // An unmasked launch still binds a valid buffer at
                    // slot 3; mask_stride_s == 0 keeps it unread.
                    Some((buffer, offset)) => encoder.set_buffer(3, buffer, offset),
                    None => encoder.set_buffer(3, q_buf, q_off),
                }
                encoder.set_buffer(4, &out, 0);
                encoder.set_buffer(5, meta.as_ref().unwrap_or(&out), 0);
                encoder.set_bytes(6, &self.params);
                encoder.set_threadgroup_memory_length(0, self.scratch_bytes);
                encoder.dispatch_threadgroups(self.config.grid, self.config.group);
            })?;

            Ok(FlashAttentionOutput { out, meta })
        }
    }
}

#[cfg(target_os = "macos")]
pub use gpu::FlashAttentionOutput;

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::{FlashAttentionOp, combine_partials, compile};
    use crate::{
        device::DeviceProfile,
        metals::flashattention::{
            softmax::OnlineSoftmaxState,
            variants::{AccumPrecision, HeadDims, SoftcapMode},
        },
        types::{Dtype, TensorArg, contiguous_byte_strides},
    };

    fn layout(dims: &[usize]) -> TensorArg {
        TensorArg::with_layout(Dtype::F16, dims, &contiguous_byte_strides(dims, 2))
    }

    fn device() -> DeviceProfile {
        DeviceProfile { execution_units: 10, simdgroup_mma: true }
    }

    fn op<'a>(q: &'a TensorArg, k: &'a TensorArg, v: &'a TensorArg) -> FlashAttentionOp<'a> {
        FlashAttentionOp {
            q,
            k,
            v,
            mask: None,
            scale: 0.125,
            max_bias: 0.0,
            softcap: 0.0,
            precision: None,
        }
    }

    #[test]
    #[serial]
    fn plans_a_basic_grouped_query_launch() {
        let q = layout(&[1, 8, 37, 64]);
        let k = layout(&[1, 2, 160, 64]);
        let v = layout(&[1, 2, 160, 64]);
        let compiled = compile(&op(&q, &k, &v), &device()).unwrap();

        assert_eq!(compiled.variant.dims, HeadDims::D64);
        assert_eq!(compiled.params.group_size, 4);
        assert_eq!(compiled.params.seq_len_kv, 160);
        // 37 queries round up to the widest useful tile.
        assert_eq!(compiled.variant.tile_width, 64);
        assert_eq!(compiled.config.grid.width, 1);
        assert_eq!(compiled.config.grid.height, 8);
        assert_eq!(
            compiled.config.grid.depth as u32,
            compiled.params.batch * compiled.n_splits
        );
        assert_eq!(
            compiled.out_len,
            compiled.n_splits as usize * 8 * 37 * 64
        );
    }

    #[test]
    #[serial]
    fn single_query_decode_splits_the_key_axis() {
        // One query tile over two heads: 2 work units on a 10-core
        // device, so the heuristic fans out to 4 splits.
        let q = layout(&[1, 2, 1, 128]);
        let k = layout(&[1, 2, 4096, 128]);
        let v = layout(&[1, 2, 4096, 128]);
        let compiled = compile(&op(&q, &k, &v), &device()).unwrap();

        assert_eq!(compiled.n_splits, 4);
        assert_eq!(compiled.meta_len, 4 * 2);
        assert_eq!(compiled.out_len, 4 * 2 * 128);
        assert_eq!(compiled.params.n_splits, 4);
    }

    #[test]
    #[serial]
    fn missing_mma_support_is_a_capability_error() {
        let q = layout(&[1, 2, 4, 64]);
        let k = layout(&[1, 2, 8, 64]);
        let v = layout(&[1, 2, 8, 64]);
        let no_mma = DeviceProfile { execution_units: 10, simdgroup_mma: false };
        let err = compile(&op(&q, &k, &v), &no_mma).unwrap_err();
        assert!(matches!(err, crate::error::CrucibleError::MissingCapability(_)));
    }

    #[test]
    #[serial]
    fn softcap_folds_into_the_query_prescale() {
        let q = layout(&[1, 4, 16, 128]);
        let k = layout(&[1, 4, 64, 128]);
        let v = layout(&[1, 4, 64, 128]);
        let mut capped = op(&q, &k, &v);
        capped.softcap = 30.0;
        capped.scale = 0.0883;
        let compiled = compile(&capped, &device()).unwrap();
        assert_eq!(compiled.variant.softcap, SoftcapMode::Capped);
        assert!((compiled.params.scale - 0.0883 / 30.0).abs() < 1e-9);
        assert_eq!(compiled.params.softcap, 30.0);
    }

    #[test]
    #[serial]
    fn softcap_outside_registry_envelope_is_rejected() {
        let q = layout(&[1, 4, 16, 64]);
        let k = layout(&[1, 4, 64, 64]);
        let v = layout(&[1, 4, 64, 64]);
        let mut capped = op(&q, &k, &v);
        capped.softcap = 50.0;
        assert!(compile(&capped, &device()).is_err());
    }

    #[test]
    #[serial]
    fn asymmetric_latent_heads_resolve() {
        let q = layout(&[1, 16, 4, 576]);
        let k = layout(&[1, 1, 512, 576]);
        let v = layout(&[1, 1, 512, 512]);
        let compiled = compile(&op(&q, &k, &v), &device()).unwrap();
        assert_eq!(compiled.variant.dims, HeadDims::D576V512);
        assert_eq!(compiled.variant.tile_width, 8);
        assert_eq!(compiled.params.group_size, 16);
    }

    #[test]
    #[serial]
    fn alibi_without_mask_is_rejected_and_slopes_are_planned() {
        let q = layout(&[1, 12, 8, 64]);
        let k = layout(&[1, 12, 32, 64]);
        let v = layout(&[1, 12, 32, 64]);
        let mut biased = op(&q, &k, &v);
        biased.max_bias = 8.0;
        assert!(compile(&biased, &device()).is_err());

        let mask = layout(&[8, 32]);
        biased.mask = Some(&mask);
        let compiled = compile(&biased, &device()).unwrap();
        assert_eq!(compiled.params.n_head_log2, 8);
        assert!(compiled.params.m0 > 0.0 && compiled.params.m0 < 1.0);
        assert_eq!(compiled.params.mask_stride_s, 64);
    }

    #[test]
    #[serial]
    fn mismatched_shapes_are_descriptive_errors() {
        let q = layout(&[1, 8, 4, 64]);
        let k = layout(&[1, 8, 32, 128]);
        let v = layout(&[1, 8, 32, 128]);
        assert!(compile(&op(&q, &k, &v), &device()).is_err());

        let k = layout(&[1, 3, 32, 64]);
        let v = layout(&[1, 3, 32, 64]);
        // 8 query heads cannot broadcast over 3 kv heads.
        assert!(compile(&op(&q, &k, &v), &device()).is_err());

        let f32_q = TensorArg::with_layout(
            Dtype::F32,
            &[1, 8, 4, 64],
            &crate::types::contiguous_byte_strides(&[1, 8, 4, 64], 4),
        );
        let k = layout(&[1, 8, 32, 64]);
        let v = layout(&[1, 8, 32, 64]);
        assert!(compile(&op(&f32_q, &k, &v), &device()).is_err());
    }

    #[test]
    #[serial]
    fn debug_flag_keeps_planning_intact() {
        let _guard = crucible_env::EnvVarGuard::set(crucible_env::EnvVar::DebugFa, "1");
        let q = layout(&[1, 2, 16, 64]);
        let k = layout(&[1, 2, 64, 64]);
        let v = layout(&[1, 2, 64, 64]);
        let compiled = compile(&op(&q, &k, &v), &device()).unwrap();
        assert_eq!(compiled.variant.dims, HeadDims::D64);
    }

    #[test]
    #[serial]
    fn explicit_precision_request_survives_planning() {
        let q = layout(&[1, 2, 16, 64]);
        let k = layout(&[1, 2, 64, 64]);
        let v = layout(&[1, 2, 64, 64]);
        let mut fast = op(&q, &k, &v);
        fast.precision = Some(AccumPrecision::F16);
        let compiled = compile(&fast, &device()).unwrap();
        assert_eq!(compiled.variant.precision, AccumPrecision::F16);
    }

    #[test]
    fn combine_matches_an_unsplit_accumulation() {
        // Two splits over four logits for one row, head_v = 2.
        let logits = [[0.4f32, 2.0], [1.1f32, -0.3]];
        let values = [[[1.0f32, 0.0], [0.0, 1.0]], [[0.5, 0.5], [2.0, -1.0]]];

        let mut partials = Vec::new();
        let mut meta = Vec::new();
        for split in 0..2 {
            let mut state = OnlineSoftmaxState::empty();
            let mut weights = [0.0f32; 2];
            state.update_block(&logits[split], &mut weights);
            let mut acc = [0.0f32; 2];
            for (w, val) in weights.iter().zip(values[split]) {
                acc[0] += w * val[0];
                acc[1] += w * val[1];
            }
            partials.extend_from_slice(&acc);
            meta.push(state);
        }
        let combined = combine_partials(&partials, &meta, 2, 1, 2).unwrap();

        // Reference: one pass over all four logits.
        let mut state = OnlineSoftmaxState::empty();
        let all: Vec<f32> = logits.iter().flatten().copied().collect();
        let mut weights = [0.0f32; 4];
        state.update_block(&all, &mut weights);
        let flat: Vec<[f32; 2]> = values.iter().flatten().copied().collect();
        let mut expect = [0.0f32; 2];
        for (w, val) in weights.iter().zip(flat) {
            expect[0] += w * val[0];
            expect[1] += w * val[1];
        }
        for e in &mut expect {
            *e /= state.sum;
        }
        assert!((combined[0] - expect[0]).abs() < 1e-6);
        assert!((combined[1] - expect[1]).abs() < 1e-6);
    }

    #[test]
    fn combine_with_an_empty_split_is_a_noop() {
        let partials = vec![0.0f32, 0.0, 3.0, 1.0];
        let meta = vec![
            OnlineSoftmaxState::empty(),
            OnlineSoftmaxState { max: 0.5, sum: 2.0 },
        ];
        let combined = combine_partials(&partials, &meta, 2, 1, 2).unwrap();
        assert!((combined[0] - 1.5).abs() < 1e-6);
        assert!((combined[1] - 0.5).abs() < 1e-6);
    }
}

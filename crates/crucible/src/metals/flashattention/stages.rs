//! Kernel parameter block, threadgroup scratch layout, and Metal source
//! emission for the fused attention kernel.
//!
//! One kernel function (`flash_attention`) is emitted per
//! [`FlashVariant`]; specialization happens through a `#define` header
//! prepended to a fixed body. The parameter struct here and the mirror
//! struct in the emitted source must stay field-for-field identical.

use crate::metals::flashattention::{
    softmax::SOFTMAX_FTZ_THRESHOLD,
    variants::{AccumPrecision, FlashVariant, REGISTRY, SoftcapMode, TILE_WIDTHS},
};

/// Hard ceiling on threadgroup memory per kernel launch.
pub const TG_MEMORY_LIMIT: usize = 32 * 1024;

/// Parameters bound as a constant buffer. Strides are in bytes; the
/// layout mirrors the `FlashParams` typedef in the emitted source
/// exactly, in declaration order.
#[derive(Clone, Copy, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[repr(C)]
pub struct FlashParams {
    pub q_stride_s: u32,
    pub q_stride_h: u32,
    pub q_stride_b: u32,
    pub k_stride_s: u32,
    pub k_stride_h: u32,
    pub k_stride_b: u32,
    pub v_stride_s: u32,
    pub v_stride_h: u32,
    pub v_stride_b: u32,
    /// Byte stride between mask rows; zero means no mask is bound.
    pub mask_stride_s: u32,
    pub seq_len_q: u32,
    pub seq_len_kv: u32,
    pub n_heads: u32,
    /// Query heads per key/value head (grouped-query broadcast factor).
    pub group_size: u32,
    pub batch: u32,
    pub n_splits: u32,
    pub scale: f32,
    pub max_bias: f32,
    pub m0: f32,
    pub m1: f32,
    pub n_head_log2: u32,
    pub softcap: f32,
}

/// Threadgroup memory arena carved by the kernel: the staged query tile,
/// then the score tile at accumulator width. Each score row carries eight
/// trailing columns holding per-row scale factors laid out as a
/// block-diagonal matrix, so fragment math can rescale whole rows.
/// Output accumulation lives in simdgroup matrix registers; the query
/// tile doubles as staging for the ragged value tail and for fragment
/// spills at finalize, both of which only run once it is dead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScratchLayout {
    pub q_bytes: usize,
    pub score_bytes: usize,
}

impl ScratchLayout {
    #[must_use]
    pub const fn for_variant(variant: FlashVariant) -> Self {
        let ncols = variant.tile_width as usize;
        let head_k = variant.dims.k() as usize;
        let kv_block = variant.kv_block() as usize;
        Self {
            q_bytes: ncols * head_k * 2,
            score_bytes: ncols * (kv_block + 8) * variant.precision.size_bytes(),
        }
    }

    pub const fn score_offset(&self) -> usize {
        self.q_bytes
    }

    /// Bytes to request from the encoder.
    #[must_use]
    pub const fn total_bytes(&self) -> usize {
        self.q_bytes + self.score_bytes
    }
}

// Every enumerated specialization must fit the threadgroup memory
// ceiling, and the query tile must be large enough for the two regions
// staged over it; an oversized row fails the build here, not on a device.
const _: () = {
    let mut i = 0;
    while i < REGISTRY.len() {
        let row = REGISTRY[i];
        let mut t = 0;
        while t < TILE_WIDTHS.len() {
            if TILE_WIDTHS[t] <= row.max_tile_width {
                let mut p = 0;
                while p < 2 {
                    let precision = if p == 0 { AccumPrecision::F32 } else { AccumPrecision::F16 };
                    if p == 0 || row.f16_accum {
                        let variant = FlashVariant {
                            dims: row.dims,
                            tile_width: TILE_WIDTHS[t],
                            precision,
                            softcap: SoftcapMode::Off,
                        };
                        let scratch = ScratchLayout::for_variant(variant);
                        assert!(scratch.total_bytes() <= TG_MEMORY_LIMIT);
                        // Ragged-tail value staging: 8 rows of HEAD_V halves.
                        assert!(8 * row.dims.v() as usize * 2 <= scratch.q_bytes);
                        // Finalize spill: one 8x8 accumulator block per simdgroup.
                        assert!(
                            variant.simdgroups() as usize * 64 * precision.size_bytes()
                                <= scratch.q_bytes
                        );
                    }
                    p += 1;
                }
            }
            t += 1;
        }
        i += 1;
    }
};

/// Source emitter for one attention specialization.
#[derive(Clone, Copy, Debug)]
pub struct FlashAttentionStage {
    pub variant: FlashVariant,
}

impl FlashAttentionStage {
    /// Every emitted library exposes exactly one kernel under this name;
    /// the variant lives in the cache key, not the symbol.
    pub const FUNCTION_NAME: &'static str = "flash_attention";

    #[must_use]
    pub const fn new(variant: FlashVariant) -> Self {
        Self { variant }
    }

    #[must_use]
    pub const fn scratch(&self) -> ScratchLayout {
        ScratchLayout::for_variant(self.variant)
    }

    /// Emit the complete Metal source for this specialization.
    #[must_use]
    pub fn emit_source(&self) -> String {
        let v = self.variant;
        let scratch = self.scratch();
        let acc_half = matches!(v.precision, AccumPrecision::F16) as u32;
        let use_softcap = matches!(v.softcap, SoftcapMode::Capped) as u32;
        let mut src = String::with_capacity(KERNEL_BODY.len() + 1024);
        src.push_str(&format!(
            "#define HEAD_K {head_k}\n\
             #define HEAD_V {head_v}\n\
             #define NCOLS {ncols}\n\
             #define KV_BLOCK {kv_block}\n\
             #define WARPS {warps}\n\
             #define VKQ_STRIDE {vkq}\n\
             #define ACC_HALF {acc_half}\n\
             #define USE_SOFTCAP {use_softcap}\n\
             #define SCORE_OFF {score_off}\n\
             #define FTZ_THRESHOLD {ftz:?}f\n\n",
            head_k = v.dims.k(),
            head_v = v.dims.v(),
            ncols = v.tile_width,
            kv_block = v.kv_block(),
            warps = v.simdgroups(),
            vkq = v.vkq_stride(),
            score_off = scratch.score_offset(),
            ftz = SOFTMAX_FTZ_THRESHOLD,
        ));
        src.push_str(KERNEL_BODY);
        src
    }
}

const KERNEL_BODY: &str = r#"
#include <metal_stdlib>
#include <metal_simdgroup_matrix>

using namespace metal;

typedef struct {
    uint  q_stride_s; uint q_stride_h; uint q_stride_b;
    uint  k_stride_s; uint k_stride_h; uint k_stride_b;
    uint  v_stride_s; uint v_stride_h; uint v_stride_b;
    uint  mask_stride_s;
    uint  seq_len_q;  uint seq_len_kv;
    uint  n_heads;    uint group_size; uint batch;
    uint  n_splits;
    float scale; float max_bias; float m0; float m1;
    uint  n_head_log2;
    float softcap;
} FlashParams;

#if ACC_HALF
typedef half  acc_t;
typedef simdgroup_half8x8  acc8x8_t;
#define W_STRIDE S_COLS
#else
typedef float acc_t;
typedef simdgroup_float8x8 acc8x8_t;
#define W_STRIDE (2 * S_COLS)
#endif

#define NTHREADS   (WARPS * 32)
// Score rows carry 8 trailing columns for the block-diagonal rescale.
#define S_COLS     (KV_BLOCK + 8)
#define ROW_STRIPS (NCOLS / 8)
#define COL_STRIPS (VKQ_STRIDE / 8)

// One threadgroup produces one NCOLS-wide query tile for one head of one
// batch element, restricted to one interleaved shard of the key blocks
// when split-parallel. Grid: (ceil(seq_len_q / NCOLS), n_heads,
// batch * n_splits).
kernel void flash_attention(
    device const char   * q_buf    [[buffer(0)]],
    device const char   * k_buf    [[buffer(1)]],
    device const char   * v_buf    [[buffer(2)]],
    device const char   * mask_buf [[buffer(3)]],
    device float        * out      [[buffer(4)]],
    device float2       * meta     [[buffer(5)]],
    constant FlashParams & p       [[buffer(6)]],
    threadgroup uchar   * shmem    [[threadgroup(0)]],
    uint3  tgpig [[threadgroup_position_in_grid]],
    ushort tpitg [[thread_index_in_threadgroup]],
    ushort tiisg [[thread_index_in_simdgroup]],
    ushort sgitg [[simdgroup_index_in_threadgroup]])
{
    const uint iq1       = tgpig.x * NCOLS;
    const uint head      = tgpig.y;
    const uint split     = tgpig.z % p.n_splits;
    const uint batch_idx = tgpig.z / p.n_splits;
    const uint head_kv   = head / p.group_size;

    threadgroup half  * q_tile = (threadgroup half  *)(shmem);
    threadgroup acc_t * s_tile = (threadgroup acc_t *)(shmem + SCORE_OFF);
    // Weight rows rewrite the score rows in place at half width.
    threadgroup half  * w_tile = (threadgroup half  *)(shmem + SCORE_OFF);

    device const char * q_base = q_buf + batch_idx * p.q_stride_b + head    * p.q_stride_h;
    device const char * k_base = k_buf + batch_idx * p.k_stride_b + head_kv * p.k_stride_h;
    device const char * v_base = v_buf + batch_idx * p.v_stride_b + head_kv * p.v_stride_h;

    float slope = 1.0f;
    if (p.max_bias > 0.0f) {
        slope = (head < p.n_head_log2)
            ? pow(p.m0, (float)(head + 1))
            : pow(p.m1, (float)(2 * (head - p.n_head_log2) + 1));
    }

    // Stage the query tile pre-scaled; rows past seq_len_q read as zero.
    for (uint i = tpitg; i < NCOLS * HEAD_K; i += NTHREADS) {
        const uint r = i / HEAD_K;
        const uint c = i % HEAD_K;
        half val = 0.0h;
        if (iq1 + r < p.seq_len_q) {
            device const half * qr = (device const half *)(q_base + (iq1 + r) * p.q_stride_s);
            val = (half)((float)qr[c] * p.scale);
        }
        q_tile[r * HEAD_K + c] = val;
    }
    threadgroup_barrier(mem_flags::mem_threadgroup);

    // Per-row softmax state lives in the scanning thread's registers.
    float m_reg = -INFINITY;
    float l_reg = 0.0f;

    // Each simdgroup owns one VKQ_STRIDE-wide slab of the value head
    // dimension; the trailing slab may be ragged and is clipped per
    // fragment column, which also idles simdgroups past the last slab.
    const uint col0 = sgitg * VKQ_STRIDE;

    acc8x8_t o_frag[ROW_STRIPS][COL_STRIPS];
    for (ushort jr = 0; jr < ROW_STRIPS; ++jr) {
        for (ushort cs = 0; cs < COL_STRIPS; ++cs) {
            o_frag[jr][cs] = make_filled_simdgroup_matrix<acc_t, 8, 8>((acc_t)0.0f);
        }
    }

    const uint n_blocks = (p.seq_len_kv + KV_BLOCK - 1) / KV_BLOCK;
    for (uint ib = split; ib < n_blocks; ib += p.n_splits) {
        const uint kv0      = ib * KV_BLOCK;
        const uint kv_valid = min((uint)KV_BLOCK, p.seq_len_kv - kv0);
        const uint kv_mma   = kv_valid / 8 * 8;
        const uint tail     = kv_valid - kv_mma;

        // Raw scores: Q (NCOLS x HEAD_K) times K^T, 8x8 fragments at
        // accumulator width over half operands, each simdgroup taking
        // 8-column strips of the score tile.
        for (uint strip = sgitg; strip < kv_mma / 8; strip += WARPS) {
            const uint jc = strip * 8;
            device const half * kp = (device const half *)(k_base + (kv0 + jc) * p.k_stride_s);
            for (uint jr = 0; jr < NCOLS; jr += 8) {
                acc8x8_t acc = make_filled_simdgroup_matrix<acc_t, 8, 8>((acc_t)0.0f);
                for (uint kk = 0; kk < HEAD_K; kk += 8) {
                    simdgroup_half8x8 mq;
                    simdgroup_load(mq, q_tile + jr * HEAD_K + kk, HEAD_K);
                    simdgroup_half8x8 mk;
                    simdgroup_load(mk, kp + kk, p.k_stride_s / 2, 0, true);
                    simdgroup_multiply_accumulate(acc, mq, mk, acc);
                }
                simdgroup_store(acc, s_tile + jr * S_COLS + jc, S_COLS);
            }
        }
        // Tail columns of a short final block fall back to scalar dots
        // so the fragment loads never touch rows past seq_len_kv.
        if (tail > 0) {
            for (uint i = tpitg; i < NCOLS * tail; i += NTHREADS) {
                const uint r = i / tail;
                const uint c = kv_mma + i % tail;
                device const half * kp = (device const half *)(k_base + (kv0 + c) * p.k_stride_s);
                float acc = 0.0f;
                for (uint kk = 0; kk < HEAD_K; ++kk) {
                    acc += (float)q_tile[r * HEAD_K + kk] * (float)kp[kk];
                }
                s_tile[r * S_COLS + c] = (acc_t)acc;
            }
        }
        threadgroup_barrier(mem_flags::mem_threadgroup);

        // Streaming softmax, one thread per query row: bias the logits,
        // fold the block into the running (max, sum), and rewrite the
        // row in place as flush-to-zero half weights. The half writes
        // trail the accumulator-width reads byte-wise, so a row never
        // clobbers a logit it has yet to read.
        if (tpitg < NCOLS) {
            const uint r = tpitg;
            threadgroup acc_t * srow = s_tile + r * S_COLS;
            threadgroup half  * wrow = (threadgroup half *)srow;
            float ms = 1.0f;
            if (iq1 + r < p.seq_len_q) {
                const float m_old = m_reg;
                float m_new = m_old;
                for (uint c = 0; c < kv_valid; ++c) {
                    float s = (float)srow[c];
#if USE_SOFTCAP
                    s = p.softcap * precise::tanh(s);
#endif
                    if (p.mask_stride_s != 0) {
                        device const half * mrow =
                            (device const half *)(mask_buf + (iq1 + r) * p.mask_stride_s);
                        s += slope * (float)mrow[kv0 + c];
                    }
                    srow[c] = (acc_t)s;
                    m_new = max(m_new, s);
                }
                if (m_new != -INFINITY) {
                    if (m_old != -INFINITY) {
                        const float d = m_old - m_new;
                        ms = (d <= FTZ_THRESHOLD) ? 0.0f : exp(d);
                    }
                    float l_add = 0.0f;
                    for (uint c = 0; c < kv_valid; ++c) {
                        const float d = (float)srow[c] - m_new;
                        const float w = (d <= FTZ_THRESHOLD) ? 0.0f : exp(d);
                        wrow[c] = (half)w;
                        l_add += w;
                    }
                    l_reg = l_reg * ms + l_add;
                    m_reg = m_new;
                } else {
                    // Fully-masked block: nothing to accumulate.
                    for (uint c = 0; c < kv_valid; ++c) {
                        wrow[c] = 0.0h;
                    }
                }
            } else {
                for (uint c = 0; c < kv_valid; ++c) {
                    wrow[c] = 0.0h;
                }
            }
            for (uint c = kv_valid; c < KV_BLOCK; ++c) {
                wrow[c] = 0.0h;
            }
            // This row's rescale factor, as its entry of the
            // block-diagonal matrix in the trailing score columns.
            for (uint jj = 0; jj < 8; ++jj) {
                srow[KV_BLOCK + jj] = (acc_t)((jj == (r & 7)) ? ms : 0.0f);
            }
        }
        threadgroup_barrier(mem_flags::mem_threadgroup);

        // Rescale the output fragments through the block-diagonal
        // multiply, then accumulate weights times values over the
        // simdgroup's slab, all in 8x8 fragments.
        if (col0 < HEAD_V) {
            for (ushort jr = 0; jr < ROW_STRIPS; ++jr) {
                acc8x8_t mm;
                simdgroup_load(mm, s_tile + (uint)jr * 8 * S_COLS + KV_BLOCK, S_COLS);
                for (ushort cs = 0; cs < COL_STRIPS; ++cs) {
                    simdgroup_multiply(o_frag[jr][cs], mm, o_frag[jr][cs]);
                }
            }
            for (uint jk = 0; jk < kv_mma; jk += 8) {
                device const half * vp = (device const half *)(v_base + (kv0 + jk) * p.v_stride_s);
                simdgroup_half8x8 mv[COL_STRIPS];
                for (ushort cs = 0; cs < COL_STRIPS; ++cs) {
                    const uint c = col0 + (uint)cs * 8;
                    if (c >= HEAD_V) { break; }
                    simdgroup_load(mv[cs], vp + c, p.v_stride_s / 2);
                }
                for (ushort jr = 0; jr < ROW_STRIPS; ++jr) {
                    simdgroup_half8x8 mw;
                    simdgroup_load(mw, w_tile + (uint)jr * 8 * W_STRIDE + jk, W_STRIDE);
                    for (ushort cs = 0; cs < COL_STRIPS; ++cs) {
                        const uint c = col0 + (uint)cs * 8;
                        if (c >= HEAD_V) { break; }
                        simdgroup_multiply_accumulate(o_frag[jr][cs], mw, mv[cs], o_frag[jr][cs]);
                    }
                }
            }
        }

        // The ragged value rows of a short final block are staged
        // zero-padded over the query tile, which is dead by then: the
        // ragged block is always the last one this threadgroup walks.
        if (tail > 0) {
            threadgroup half * v_stage = q_tile;
            for (uint i = tpitg; i < 8 * HEAD_V; i += NTHREADS) {
                const uint rr = i / HEAD_V;
                const uint cc = i % HEAD_V;
                half val = 0.0h;
                if (rr < tail) {
                    device const half * vp =
                        (device const half *)(v_base + (kv0 + kv_mma + rr) * p.v_stride_s);
                    val = vp[cc];
                }
                v_stage[i] = val;
            }
            threadgroup_barrier(mem_flags::mem_threadgroup);
            if (col0 < HEAD_V) {
                for (ushort jr = 0; jr < ROW_STRIPS; ++jr) {
                    simdgroup_half8x8 mw;
                    simdgroup_load(mw, w_tile + (uint)jr * 8 * W_STRIDE + kv_mma, W_STRIDE);
                    for (ushort cs = 0; cs < COL_STRIPS; ++cs) {
                        const uint c = col0 + (uint)cs * 8;
                        if (c >= HEAD_V) { break; }
                        simdgroup_half8x8 mv;
                        simdgroup_load(mv, v_stage + c, HEAD_V);
                        simdgroup_multiply_accumulate(o_frag[jr][cs], mw, mv, o_frag[jr][cs]);
                    }
                }
            }
        }
        threadgroup_barrier(mem_flags::mem_threadgroup);
    }

    // Finalize. A lone launch folds 1/sum into the same block-diagonal
    // multiply the streaming rescale used (zero for a fully-masked row);
    // a split launch keeps partials unnormalized and persists (max, sum)
    // metadata for the external combine.
    const uint out_base =
        (((p.n_splits > 1 ? split : 0) * p.batch + batch_idx) * p.n_heads + head) * p.seq_len_q;
    if (tpitg < NCOLS) {
        const uint r = tpitg;
        if (p.n_splits > 1 && iq1 + r < p.seq_len_q) {
            meta[out_base + iq1 + r] = float2(m_reg, l_reg);
        }
        float norm = 1.0f;
        if (p.n_splits == 1) {
            norm = (l_reg > 0.0f) ? 1.0f / l_reg : 0.0f;
        }
        threadgroup acc_t * srow = s_tile + r * S_COLS;
        for (uint jj = 0; jj < 8; ++jj) {
            srow[KV_BLOCK + jj] = (acc_t)((jj == (r & 7)) ? norm : 0.0f);
        }
    }
    threadgroup_barrier(mem_flags::mem_threadgroup);

    if (col0 < HEAD_V) {
        // Spill area over the dead query tile, one 8x8 accumulator block
        // per simdgroup, for fragments the device store cannot take
        // whole: ragged query rows, or a half accumulator into the float
        // output buffer.
        threadgroup acc_t * spill = (threadgroup acc_t *)(shmem) + sgitg * 64;
        for (ushort jr = 0; jr < ROW_STRIPS; ++jr) {
            acc8x8_t mm;
            simdgroup_load(mm, s_tile + (uint)jr * 8 * S_COLS + KV_BLOCK, S_COLS);
            const uint row0 = iq1 + (uint)jr * 8;
            if (row0 >= p.seq_len_q) { continue; }
            for (ushort cs = 0; cs < COL_STRIPS; ++cs) {
                const uint c = col0 + (uint)cs * 8;
                if (c >= HEAD_V) { break; }
                simdgroup_multiply(o_frag[jr][cs], mm, o_frag[jr][cs]);
#if !ACC_HALF
                if (row0 + 8 <= p.seq_len_q) {
                    simdgroup_store(o_frag[jr][cs], out + (out_base + row0) * HEAD_V + c, HEAD_V);
                    continue;
                }
#endif
                simdgroup_store(o_frag[jr][cs], spill, 8);
                simdgroup_barrier(mem_flags::mem_threadgroup);
                for (uint e = tiisg; e < 64; e += 32) {
                    const uint rr = e / 8;
                    if (row0 + rr < p.seq_len_q) {
                        out[(out_base + row0 + rr) * HEAD_V + c + e % 8] = (float)spill[e];
                    }
                }
                simdgroup_barrier(mem_flags::mem_threadgroup);
            }
        }
    }
}
"#;

//! Shared helpers for the attention integration tests: deterministic
//! data generation, a materialized two-pass reference, and a host mirror
//! of the streaming kernel schedule (blockwise online softmax over
//! interleaved key shards, combined through the metadata contract).
#![allow(dead_code)]

use half::f16;

use crucible::metals::flashattention::{OnlineSoftmaxState, alibi_slope, combine_partials, softmax::AlibiParams};

pub struct Lcg(pub u64);

impl Lcg {
    pub fn new(seed: u64) -> Self {
        Self(seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407))
    }

    pub fn next_f32(&mut self) -> f32 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        ((self.0 >> 33) as f32 / (1u64 << 31) as f32) - 1.0
    }
}

pub fn fill_f16(len: usize, seed: u64) -> Vec<f16> {
    let mut rng = Lcg::new(seed);
    (0..len).map(|_| f16::from_f32(rng.next_f32())).collect()
}

pub fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
}

/// Problem shape plus the scalar knobs of one attention launch. Tensors
/// are dense `[batch, heads, seq, dim]` f16; the mask is `[seq_q, seq_kv]`.
#[derive(Clone, Copy)]
pub struct AttnCase {
    pub batch: usize,
    pub heads_q: usize,
    pub heads_kv: usize,
    pub seq_q: usize,
    pub seq_kv: usize,
    pub dk: usize,
    pub dv: usize,
    pub scale: f32,
    pub max_bias: f32,
    pub softcap: f32,
}

impl AttnCase {
    pub fn q_len(&self) -> usize {
        self.batch * self.heads_q * self.seq_q * self.dk
    }

    pub fn k_len(&self) -> usize {
        self.batch * self.heads_kv * self.seq_kv * self.dk
    }

    pub fn v_len(&self) -> usize {
        self.batch * self.heads_kv * self.seq_kv * self.dv
    }

    fn logit(&self, q_row: &[f16], k_row: &[f16], mask_val: Option<f32>, slope: f32) -> f32 {
        let dot: f32 = q_row.iter().zip(k_row).map(|(a, b)| a.to_f32() * b.to_f32()).sum();
        let mut s = self.scale * dot;
        if self.softcap != 0.0 {
            s = self.softcap * (s / self.softcap).tanh();
        }
        if let Some(m) = mask_val {
            s += slope * m;
        }
        s
    }
}

pub fn head_slice(data: &[f16], heads: usize, seq: usize, dim: usize, b: usize, h: usize) -> &[f16] {
    let base = (b * heads + h) * seq * dim;
    &data[base..base + seq * dim]
}

/// Post-cap logit as the streaming schedule computes it: the scale (and
/// the cap divisor when capping) already folded into a prescaled f16
/// query row, then `softcap * tanh`. Any bias is added after the cap.
pub fn streamed_capped_logit(softcap: f32, q_row_prescaled: &[f16], k_row: &[f16]) -> f32 {
    let dot: f32 = q_row_prescaled
        .iter()
        .zip(k_row)
        .map(|(a, b)| a.to_f32() * b.to_f32())
        .sum();
    if softcap != 0.0 { softcap * dot.tanh() } else { dot }
}

/// Materialized two-pass reference: full logit row, exact softmax, then
/// the weighted sum. Output is `[batch, heads_q, seq_q, dv]` f32.
pub fn reference_attention(
    case: &AttnCase,
    q: &[f16],
    k: &[f16],
    v: &[f16],
    mask: Option<&[f32]>,
) -> Vec<f32> {
    let group = case.heads_q / case.heads_kv;
    let alibi = AlibiParams::new(case.heads_q as u32, case.max_bias);
    let mut out = vec![0.0f32; case.batch * case.heads_q * case.seq_q * case.dv];
    for b in 0..case.batch {
        for h in 0..case.heads_q {
            let slope = alibi_slope(case.max_bias, h as u32, alibi);
            let q_head = head_slice(q, case.heads_q, case.seq_q, case.dk, b, h);
            let k_head = head_slice(k, case.heads_kv, case.seq_kv, case.dk, b, h / group);
            let v_head = head_slice(v, case.heads_kv, case.seq_kv, case.dv, b, h / group);
            for iq in 0..case.seq_q {
                let q_row = &q_head[iq * case.dk..(iq + 1) * case.dk];
                let logits: Vec<f32> = (0..case.seq_kv)
                    .map(|ic| {
                        let k_row = &k_head[ic * case.dk..(ic + 1) * case.dk];
                        let m = mask.map(|m| m[iq * case.seq_kv + ic]);
                        case.logit(q_row, k_row, m, slope)
                    })
                    .collect();
                let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let row = &mut out[((b * case.heads_q + h) * case.seq_q + iq) * case.dv..][..case.dv];
                if max == f32::NEG_INFINITY {
                    continue;
                }
                let weights: Vec<f32> = logits.iter().map(|&s| (s - max).exp()).collect();
                let sum: f32 = weights.iter().sum();
                for (ic, w) in weights.iter().enumerate() {
                    let v_row = &v_head[ic * case.dv..(ic + 1) * case.dv];
                    for (o, val) in row.iter_mut().zip(v_row) {
                        *o += w * val.to_f32();
                    }
                }
                for o in row.iter_mut() {
                    *o /= sum;
                }
            }
        }
    }
    out
}

/// Host mirror of the kernel schedule: key blocks of `kv_block` walked in
/// `n_splits` interleaved shards, flush-to-zero online softmax per
/// block, unnormalized partials plus `(max, sum)` metadata per shard,
/// combined through [`combine_partials`].
pub fn streaming_attention(
    case: &AttnCase,
    q: &[f16],
    k: &[f16],
    v: &[f16],
    mask: Option<&[f32]>,
    kv_block: usize,
    n_splits: usize,
) -> Vec<f32> {
    let group = case.heads_q / case.heads_kv;
    let alibi = AlibiParams::new(case.heads_q as u32, case.max_bias);
    let prescale = if case.softcap != 0.0 { case.scale / case.softcap } else { case.scale };
    let n_blocks = case.seq_kv.div_ceil(kv_block);
    let rows_total = case.batch * case.heads_q * case.seq_q;

    let mut partials = vec![0.0f32; n_splits * rows_total * case.dv];
    let mut meta = vec![OnlineSoftmaxState::empty(); n_splits * rows_total];

    for b in 0..case.batch {
        for h in 0..case.heads_q {
            let slope = alibi_slope(case.max_bias, h as u32, alibi);
            let q_head = head_slice(q, case.heads_q, case.seq_q, case.dk, b, h);
            let k_head = head_slice(k, case.heads_kv, case.seq_kv, case.dk, b, h / group);
            let v_head = head_slice(v, case.heads_kv, case.seq_kv, case.dv, b, h / group);
            for iq in 0..case.seq_q {
                let q_row: Vec<f16> = q_head[iq * case.dk..(iq + 1) * case.dk]
                    .iter()
                    .map(|x| f16::from_f32(x.to_f32() * prescale))
                    .collect();
                let row_idx = (b * case.heads_q + h) * case.seq_q + iq;
                for split in 0..n_splits {
                    let mut state = OnlineSoftmaxState::empty();
                    let mut acc = vec![0.0f32; case.dv];
                    let mut ib = split;
                    while ib < n_blocks {
                        let kv0 = ib * kv_block;
                        let kv_valid = kv_block.min(case.seq_kv - kv0);
                        let logits: Vec<f32> = (0..kv_valid)
                            .map(|c| {
                                let ic = kv0 + c;
                                let k_row = &k_head[ic * case.dk..(ic + 1) * case.dk];
                                let mut s = streamed_capped_logit(case.softcap, &q_row, k_row);
                                if let Some(m) = mask {
                                    s += slope * m[iq * case.seq_kv + ic];
                                }
                                s
                            })
                            .collect();
                        let mut weights = vec![0.0f32; kv_valid];
                        let rescale = state.update_block(&logits, &mut weights);
                        for a in acc.iter_mut() {
                            *a *= rescale;
                        }
                        for (c, w) in weights.iter().enumerate() {
                            let v_row = &v_head[(kv0 + c) * case.dv..(kv0 + c + 1) * case.dv];
                            for (a, val) in acc.iter_mut().zip(v_row) {
                                *a += w * val.to_f32();
                            }
                        }
                        ib += n_splits;
                    }
                    meta[split * rows_total + row_idx] = state;
                    partials[(split * rows_total + row_idx) * case.dv..][..case.dv]
                        .copy_from_slice(&acc);
                }
            }
        }
    }

    combine_partials(&partials, &meta, n_splits, rows_total, case.dv).expect("combine extents agree")
}

/// Additive causal mask over `[seq_q, seq_kv]` where query `i` attends
/// keys `0..=offset + i`.
pub fn causal_mask(seq_q: usize, seq_kv: usize, offset: usize) -> Vec<f32> {
    let mut mask = vec![0.0f32; seq_q * seq_kv];
    for i in 0..seq_q {
        for j in 0..seq_kv {
            if j > offset + i {
                mask[i * seq_kv + j] = f32::NEG_INFINITY;
            }
        }
    }
    mask
}

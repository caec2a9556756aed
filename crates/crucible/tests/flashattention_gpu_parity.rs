//! Device parity: the generated kernel against the two-pass reference.
//! Runs only on Apple hardware with simdgroup matrix support.
#![cfg(target_os = "macos")]

mod common;

use common::{AttnCase, causal_mask, fill_f16, max_abs_diff, reference_attention};
use crucible::{
    Buffer, Dtype, TensorArg,
    metal_rt::MetalContext,
    metals::flashattention::{FlashAttentionOp, OnlineSoftmaxState, combine_partials, compile},
    types::contiguous_byte_strides,
};
use half::f16;
use serial_test::serial;

const TOLERANCE: f32 = 8e-2;

fn device_arg(ctx: &MetalContext, data: &[f16], dims: &[usize]) -> TensorArg {
    let buffer = ctx.new_buffer_from_slice(data).expect("device buffer");
    let mut arg = TensorArg::with_layout(Dtype::F16, dims, &contiguous_byte_strides(dims, 2));
    arg.buffer = Some(Buffer::Metal(buffer));
    arg
}

fn run_case(case: AttnCase, mask: Option<&[f32]>, seed: u64) {
    let mut ctx = match MetalContext::new() {
        Ok(ctx) => ctx,
        Err(_) => return,
    };

    let q = fill_f16(case.q_len(), seed);
    let k = fill_f16(case.k_len(), seed ^ 0x9e3779b97f4a7c15);
    let v = fill_f16(case.v_len(), seed ^ 0x6a09e667f3bcc908);

    let q_arg = device_arg(&ctx, &q, &[case.batch, case.heads_q, case.seq_q, case.dk]);
    let k_arg = device_arg(&ctx, &k, &[case.batch, case.heads_kv, case.seq_kv, case.dk]);
    let v_arg = device_arg(&ctx, &v, &[case.batch, case.heads_kv, case.seq_kv, case.dv]);
    let mask_f16: Option<Vec<f16>> = mask.map(|m| m.iter().map(|&x| f16::from_f32(x)).collect());
    let mask_arg = mask_f16
        .as_ref()
        .map(|m| device_arg(&ctx, m, &[case.seq_q, case.seq_kv]));

    let op = FlashAttentionOp {
        q: &q_arg,
        k: &k_arg,
        v: &v_arg,
        mask: mask_arg.as_ref(),
        scale: case.scale,
        max_bias: case.max_bias,
        softcap: case.softcap,
        precision: None,
    };
    let compiled = match compile(&op, &ctx) {
        Ok(compiled) => compiled,
        // No simdgroup matrix support on this part.
        Err(crucible::CrucibleError::MissingCapability(_)) => return,
        Err(err) => panic!("planning failed: {err}"),
    };
    let output = compiled
        .execute(&mut ctx, &q_arg, &k_arg, &v_arg, mask_arg.as_ref())
        .expect("launch");

    let rows = case.batch * case.heads_q * case.seq_q;
    let result = if compiled.n_splits > 1 {
        let partials: Vec<f32> = output.out.read_to_vec(compiled.out_len);
        let meta: Vec<OnlineSoftmaxState> = output
            .meta
            .expect("split launch persists metadata")
            .read_to_vec(compiled.meta_len);
        combine_partials(&partials, &meta, compiled.n_splits as usize, rows, case.dv).expect("combine")
    } else {
        output.out.read_to_vec(compiled.out_len)
    };

    let reference = reference_attention(&case, &q, &k, &v, mask);
    let diff = max_abs_diff(&reference, &result);
    assert!(diff < TOLERANCE, "max abs diff {diff}");
}

#[test]
#[serial]
fn prefill_matches_reference_on_device() {
    run_case(
        AttnCase {
            batch: 1,
            heads_q: 8,
            heads_kv: 2,
            seq_q: 33,
            seq_kv: 129,
            dk: 64,
            dv: 64,
            scale: 0.125,
            max_bias: 0.0,
            softcap: 0.0,
        },
        None,
        42,
    );
}

#[test]
#[serial]
fn causal_decode_with_splits_matches_on_device() {
    let case = AttnCase {
        batch: 1,
        heads_q: 4,
        heads_kv: 4,
        seq_q: 1,
        seq_kv: 1000,
        dk: 128,
        dv: 128,
        scale: 0.0883,
        max_bias: 0.0,
        softcap: 0.0,
    };
    let mask = causal_mask(case.seq_q, case.seq_kv, case.seq_kv - case.seq_q);
    run_case(case, Some(&mask), 7);
}

#[test]
#[serial]
fn softcapped_wide_heads_match_on_device() {
    run_case(
        AttnCase {
            batch: 1,
            heads_q: 2,
            heads_kv: 2,
            seq_q: 16,
            seq_kv: 64,
            dk: 256,
            dv: 256,
            scale: 1.0,
            max_bias: 0.0,
            softcap: 30.0,
        },
        None,
        11,
    );
}

//! Per-layer MoE dispatcher: gather → per-expert execution → scatter-add
//! (spec §4.4 steps 3-6).
//!
//! Building `token_offsets` requires a CPU readback of the router's top-k
//! expert indices (spec §4.4 step 4), which is only legal when no command
//! recorder is live ([`crate::device::Device::allow_readback`]). MoE
//! dispatch therefore requires a [`Dispatcher::Immediate`] call; attempting
//! it under a recording dispatcher is a fatal `KernelError`, not a silent
//! fallback, since `dispatch::run` only borrows the recorder and has no way
//! to submit-and-reopen it mid-batch. A prefill/batched-decode driver over
//! an MoE-bearing model must therefore either disable command batching for
//! that model or split its recorder at MoE layer boundaries.

use crate::error::KernelError;
use crate::layer::{reborrow, LayerContext};
use crate::recorder::Dispatcher;
use crate::tensor::{DType, Shape, Tensor};
use crate::weights::WeightBuffer;

use super::expert_cache::{DequantizedExpert, ExpertCacheKey};
use super::{router, ExpertWeights, MoeWeights};

/// Initial `max_tokens_per_expert` guess: the uniform share per expert plus
/// 50% headroom (spec §4.4 step 3's "e.g. `ceil(n·top_k/num_experts ·
/// 1.2-2×)`"), floored at 1.
fn initial_bound(n_tokens: u32, top_k: u32, num_experts: u32) -> u32 {
    let uniform = (n_tokens as u64 * top_k as u64).div_ceil(num_experts as u64);
    (uniform * 3).div_ceil(2).max(1) as u32
}

enum Assignment {
    Ok { counts: Vec<u32>, offsets: Vec<u32> },
    Overflow,
}

/// Pure counting-sort assignment of each `(token, k)` pair to a
/// `(expert, slot)` pair, given the already-resolved `expert_ids` (spec
/// §4.4 steps 3-4). Separated from the GPU-readback wrapper in
/// [`build_token_offsets`] so it can be unit tested without a device.
fn assign_token_offsets(
    expert_ids: &[u32],
    n_tokens: u32,
    top_k: u32,
    max_tokens_per_expert: u32,
) -> Assignment {
    let n = n_tokens as usize;
    let k = top_k as usize;
    let mut counts_by_expert: std::collections::HashMap<u32, u32> = std::collections::HashMap::new();
    let mut offsets = vec![u32::MAX; n * k];

    for t in 0..n {
        for j in 0..k {
            let e = expert_ids[t * k + j];
            let slot = *counts_by_expert.get(&e).unwrap_or(&0);
            if slot >= max_tokens_per_expert {
                return Assignment::Overflow;
            }
            offsets[t * k + j] = e * max_tokens_per_expert + slot;
            counts_by_expert.insert(e, slot + 1);
        }
    }

    let num_experts = counts_by_expert.keys().max().map_or(0, |&m| m + 1);
    let mut counts = vec![0u32; num_experts as usize];
    for (&e, &c) in &counts_by_expert {
        counts[e as usize] = c;
    }

    Assignment::Ok { counts, offsets }
}

/// Builds `token_offsets`/per-expert `counts` from the router's `indices`
/// tensor, retrying with a larger `max_tokens_per_expert` bound on overflow
/// up to `n_tokens`, per spec §4.4 step 3's "retry with a larger bound (up
/// to n_tokens); fail if still exceeded."
fn build_token_offsets(
    ctx: &LayerContext<'_>,
    indices: &Tensor,
    n_tokens: u32,
    top_k: u32,
    num_experts: u32,
    mut max_tokens_per_expert: u32,
) -> Result<(Vec<u32>, Vec<u32>, u32), KernelError> {
    let raw = ctx.device.buffer_pool().read(indices.buffer, indices.byte_size());
    let as_f32: &[f32] = bytemuck::cast_slice(&raw);
    let expert_ids: Vec<u32> = as_f32.iter().map(|&v| v.round() as u32).collect();

    loop {
        match assign_token_offsets(&expert_ids, n_tokens, top_k, max_tokens_per_expert) {
            Assignment::Ok { mut counts, offsets } => {
                debug_assert!(
                    offsets.iter().all(|&o| o != u32::MAX),
                    "moe: every (token, k) slot must receive a token_offsets entry"
                );
                counts.resize(num_experts as usize, 0);
                return Ok((counts, offsets, max_tokens_per_expert));
            }
            Assignment::Overflow => {
                if max_tokens_per_expert >= n_tokens {
                    return Err(KernelError::new(
                        "moe_gather",
                        format!(
                            "expert token count exceeds n_tokens bound ({n_tokens}) even at the maximum retry"
                        ),
                    )
                    .at_layer(ctx.layer_idx));
                }
                max_tokens_per_expert = (max_tokens_per_expert * 2).min(n_tokens).max(max_tokens_per_expert + 1);
            }
        }
    }
}

/// Uploads `data` as a fresh GPU buffer reinterpreted as `f32` (this
/// crate's `Tensor`/`KernelSet` boundary has no integer dtype; kernels that
/// consume `token_offsets` read it as integer-valued floats). Mirrors
/// `kv_cache.rs`'s direct-`wgpu` style for the CPU→GPU move this crate's
/// `KernelSet` boundary doesn't otherwise expose.
fn upload_u32_as_f32(ctx: &LayerContext<'_>, data: &[u32], label: &'static str) -> Tensor {
    let floats: Vec<f32> = data.iter().map(|&v| v as f32).collect();
    let bytes: &[u8] = bytemuck::cast_slice(&floats);
    let pool = ctx.device.buffer_pool();
    let buffer = pool.acquire(
        bytes.len() as u64,
        wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC,
        label,
    );
    ctx.device.wgpu_queue().write_buffer(&pool.raw(buffer), 0, bytes);
    Tensor::new(buffer, DType::F32, Shape::new(&[data.len() as u32]), label)
}

/// Copies `src`'s rows into `slab` starting at `dst_row_offset`, following
/// `kv_cache.rs`'s raw-`wgpu::CommandEncoder::copy_buffer_to_buffer` pattern
/// for writing one sub-range of a larger shared buffer (spec §4.4 step 5:
/// "writing into the expert's output slab").
fn copy_rows_into_slab(
    ctx: &LayerContext<'_>,
    dispatcher: &mut Dispatcher<'_>,
    src: &Tensor,
    slab: &Tensor,
    dst_row_offset: u32,
) {
    let row_bytes = slab.shape.dim(slab.shape.rank() - 1) as u64 * slab.dtype.byte_size() as u64;
    let dst_offset = dst_row_offset as u64 * row_bytes;
    let copy_bytes = src.byte_size();
    let pool = ctx.device.buffer_pool();

    match dispatcher {
        Dispatcher::Immediate => {
            let mut encoder = ctx
                .device
                .wgpu_device()
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("moe.copy_rows_into_slab"),
                });
            encoder.copy_buffer_to_buffer(&pool.raw(src.buffer), 0, &pool.raw(slab.buffer), dst_offset, copy_bytes);
            ctx.device.wgpu_queue().submit(std::iter::once(encoder.finish()));
        }
        Dispatcher::Recording(recorder) => {
            recorder.encoder_mut().copy_buffer_to_buffer(
                &pool.raw(src.buffer),
                0,
                &pool.raw(slab.buffer),
                dst_offset,
                copy_bytes,
            );
        }
    }
}

fn run_dense_expert(
    mut dispatcher: Dispatcher<'_>,
    ctx: &mut LayerContext<'_>,
    gate_up: Option<WeightBuffer>,
    gate: Option<WeightBuffer>,
    up: Option<WeightBuffer>,
    down: WeightBuffer,
    input: &Tensor,
) -> Result<Tensor, KernelError> {
    let gated = if let Some(gate_up) = gate_up {
        let gate_up_out = ctx
            .kernels
            .matmul(reborrow(&mut dispatcher), input, &gate_up.into_tensor(), None)?;
        let activated = ctx
            .kernels
            .silu_row_split(reborrow(&mut dispatcher), &gate_up_out, ctx.config.activation)?;
        ctx.device.buffer_pool().release(gate_up_out.buffer);
        activated
    } else {
        let gate = gate.expect("ExpertWeights::load guarantees gate when gate_up absent");
        let up = up.expect("ExpertWeights::load guarantees up when gate_up absent");
        let gate_out = ctx.kernels.matmul(reborrow(&mut dispatcher), input, &gate.into_tensor(), None)?;
        let up_out = ctx.kernels.matmul(reborrow(&mut dispatcher), input, &up.into_tensor(), None)?;
        let activated_gate = match ctx.config.activation {
            crate::config::Activation::Silu => ctx.kernels.silu(reborrow(&mut dispatcher), &gate_out)?,
            crate::config::Activation::Gelu => ctx.kernels.gelu(reborrow(&mut dispatcher), &gate_out)?,
        };
        ctx.device.buffer_pool().release(gate_out.buffer);
        let gated = ctx.kernels.residual_add(reborrow(&mut dispatcher), &activated_gate, &up_out)?;
        ctx.device.buffer_pool().release(activated_gate.buffer);
        ctx.device.buffer_pool().release(up_out.buffer);
        gated
    };
    let out = ctx.kernels.matmul(reborrow(&mut dispatcher), &gated, &down.into_tensor(), None)?;
    ctx.device.buffer_pool().release(gated.buffer);
    Ok(out)
}

#[allow(clippy::too_many_arguments)]
fn run_mxfp4_expert(
    mut dispatcher: Dispatcher<'_>,
    ctx: &mut LayerContext<'_>,
    weights: &MoeWeights,
    expert: u32,
    gate_up_packed: WeightBuffer,
    gate_up_scales: WeightBuffer,
    gate_up_bias: Option<WeightBuffer>,
    down_packed: WeightBuffer,
    down_scales: WeightBuffer,
    down_bias: Option<WeightBuffer>,
    input: &Tensor,
) -> Result<Tensor, KernelError> {
    let out_dtype = input.dtype;
    let cache_key = ExpertCacheKey { layer: weights.layer_idx, expert, out_dtype };

    let dequantized = match weights.expert_cache.get(cache_key) {
        Some(cached) => cached,
        None => {
            let gate_up = ctx.kernels.mxfp4_dequantize(
                reborrow(&mut dispatcher),
                &gate_up_packed.into_tensor(),
                &gate_up_scales.into_tensor(),
                out_dtype,
            )?;
            let down = ctx.kernels.mxfp4_dequantize(
                reborrow(&mut dispatcher),
                &down_packed.into_tensor(),
                &down_scales.into_tensor(),
                out_dtype,
            )?;
            let fresh = DequantizedExpert { gate_up, down };
            weights
                .expert_cache
                .insert(ctx.device.buffer_pool(), cache_key, fresh.clone());
            fresh
        }
    };

    let gate_up_out = ctx
        .kernels
        .matmul(reborrow(&mut dispatcher), input, &dequantized.gate_up, None)?;
    let gate_up_out = match gate_up_bias {
        Some(bias) => {
            let biased = ctx
                .kernels
                .bias_add(reborrow(&mut dispatcher), &gate_up_out, &bias.into_tensor())?;
            ctx.device.buffer_pool().release(gate_up_out.buffer);
            biased
        }
        None => gate_up_out,
    };
    let activated = ctx
        .kernels
        .silu_row_split(reborrow(&mut dispatcher), &gate_up_out, ctx.config.activation)?;
    ctx.device.buffer_pool().release(gate_up_out.buffer);
    let down_out = ctx.kernels.matmul(reborrow(&mut dispatcher), &activated, &dequantized.down, None)?;
    ctx.device.buffer_pool().release(activated.buffer);
    match down_bias {
        Some(bias) => {
            let out = ctx.kernels.bias_add(reborrow(&mut dispatcher), &down_out, &bias.into_tensor())?;
            ctx.device.buffer_pool().release(down_out.buffer);
            Ok(out)
        }
        None => Ok(down_out),
    }
}

fn run_expert(
    dispatcher: Dispatcher<'_>,
    ctx: &mut LayerContext<'_>,
    weights: &MoeWeights,
    expert: u32,
    input: &Tensor,
) -> Result<Tensor, KernelError> {
    match weights.experts[expert as usize] {
        ExpertWeights::Dense { gate_up, gate, up, down } => {
            run_dense_expert(dispatcher, ctx, gate_up, gate, up, down, input)
        }
        ExpertWeights::Mxfp4 {
            gate_up_packed,
            gate_up_scales,
            gate_up_bias,
            down_packed,
            down_scales,
            down_bias,
        } => run_mxfp4_expert(
            dispatcher,
            ctx,
            weights,
            expert,
            gate_up_packed,
            gate_up_scales,
            gate_up_bias,
            down_packed,
            down_scales,
            down_bias,
            input,
        ),
    }
}

/// Applies the optional sandwich-norm weight then the residual add —
/// identical in shape to `layer::ffn`'s dense-path helper of the same name,
/// duplicated here since `layer::ffn` is a private sibling module this
/// crate can't reach from `moe`.
fn finish(
    mut dispatcher: Dispatcher<'_>,
    ctx: &mut LayerContext<'_>,
    ffn_out: Tensor,
    residual: &Tensor,
    post_ffn_norm: Option<&WeightBuffer>,
) -> Result<Tensor, KernelError> {
    let normed = match post_ffn_norm {
        Some(norm_weight) => ctx.kernels.rms_norm(
            reborrow(&mut dispatcher),
            &ffn_out,
            &norm_weight.into_tensor(),
            ctx.config.rms_norm_eps,
            ctx.config.rms_norm_weight_offset,
        )?,
        None => ffn_out,
    };
    ctx.kernels.residual_add(dispatcher, residual, &normed)
}

pub fn run(
    mut dispatcher: Dispatcher<'_>,
    ctx: &mut LayerContext<'_>,
    weights: &MoeWeights,
    ffn_input: &Tensor,
    residual: &Tensor,
    post_ffn_norm: Option<&WeightBuffer>,
) -> Result<Tensor, KernelError> {
    if dispatcher.is_recording() {
        return Err(KernelError::new(
            "moe_dispatch",
            "MoE layers require an Immediate dispatcher: token_offsets construction reads back \
             router indices, which is illegal while a command recorder is open",
        )
        .at_layer(ctx.layer_idx));
    }
    if !ctx.device.allow_readback("moe_token_offsets") {
        return Err(KernelError::new(
            "moe_dispatch",
            "readback denied for moe_token_offsets despite an Immediate dispatcher",
        )
        .at_layer(ctx.layer_idx));
    }

    let n_tokens = ctx.n_tokens;
    let top_k = weights.descriptor.top_k;
    let num_experts = weights.descriptor.num_experts;
    let hidden_size = ffn_input.shape.dim(ffn_input.shape.rank() - 1);

    let (indices, route_weights) = router::route(reborrow(&mut dispatcher), ctx, weights, ffn_input)?;

    let bound = initial_bound(n_tokens, top_k, num_experts);
    let (counts, offsets, max_tokens_per_expert) =
        build_token_offsets(ctx, &indices, n_tokens, top_k, num_experts, bound)?;
    ctx.device.buffer_pool().release(indices.buffer);

    let token_offsets = upload_u32_as_f32(ctx, &offsets, "moe.token_offsets");

    let staging = ctx.kernels.moe_gather(
        reborrow(&mut dispatcher),
        ffn_input,
        &token_offsets,
        max_tokens_per_expert,
    )?;

    let slab_rows = num_experts * max_tokens_per_expert;
    let slab_shape = Shape::new(&[slab_rows, hidden_size]);
    let slab_bytes = slab_shape.numel() * staging.dtype.byte_size() as u64;
    let slab_buffer = ctx.device.buffer_pool().acquire(
        slab_bytes,
        wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC,
        "moe.expert_output_slab",
    );
    let output_slab = Tensor::new(slab_buffer, staging.dtype, slab_shape, "moe.expert_output_slab");

    for expert in 0..num_experts {
        let count = counts[expert as usize];
        if count == 0 {
            continue;
        }
        let expert_input = staging.view(expert * max_tokens_per_expert, Shape::new(&[count, hidden_size]));
        let expert_out = run_expert(reborrow(&mut dispatcher), ctx, weights, expert, &expert_input)?;
        copy_rows_into_slab(ctx, &mut dispatcher, &expert_out, &output_slab, expert * max_tokens_per_expert);
        ctx.device.buffer_pool().release(expert_out.buffer);
    }
    ctx.device.buffer_pool().release(staging.buffer);

    let accum_buffer = ctx.device.buffer_pool().acquire(
        ffn_input.byte_size(),
        wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
        "moe.scatter_accum_template",
    );
    let accum_template = Tensor::new(accum_buffer, ffn_input.dtype, ffn_input.shape, "moe.scatter_accum_template");

    let scattered = ctx.kernels.scatter_add(
        reborrow(&mut dispatcher),
        &accum_template,
        &output_slab,
        &token_offsets,
        &route_weights,
    )?;
    ctx.device.buffer_pool().release(accum_template.buffer);
    ctx.device.buffer_pool().release(output_slab.buffer);
    ctx.device.buffer_pool().release(token_offsets.buffer);

    finish(dispatcher, ctx, scattered, residual, post_ffn_norm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_bound_adds_headroom() {
        // 8 tokens, top_k=2, 4 experts -> uniform share is 4; headroom *1.5 -> 6.
        assert_eq!(initial_bound(8, 2, 4), 6);
    }

    #[test]
    fn initial_bound_floors_at_one() {
        assert_eq!(initial_bound(0, 1, 8), 1);
    }

    #[test]
    fn assigns_distinct_slots_per_expert() {
        // 3 tokens, top_k=1: experts [0, 1, 0].
        let ids = [0u32, 1, 0];
        match assign_token_offsets(&ids, 3, 1, 4) {
            Assignment::Ok { counts, offsets } => {
                assert_eq!(counts[0], 2);
                assert_eq!(counts[1], 1);
                assert_eq!(offsets, vec![0 * 4 + 0, 1 * 4 + 0, 0 * 4 + 1]);
            }
            Assignment::Overflow => panic!("expected no overflow"),
        }
    }

    #[test]
    fn overflow_when_bound_too_small() {
        let ids = [0u32, 0, 0];
        match assign_token_offsets(&ids, 3, 1, 2) {
            Assignment::Overflow => {}
            Assignment::Ok { .. } => panic!("expected overflow with max_tokens_per_expert=2 and 3 same-expert tokens"),
        }
    }

    #[test]
    fn every_slot_is_filled_on_success() {
        let ids = [2u32, 1, 0, 1];
        match assign_token_offsets(&ids, 4, 1, 8) {
            Assignment::Ok { offsets, .. } => assert!(offsets.iter().all(|&o| o != u32::MAX)),
            Assignment::Overflow => panic!("expected no overflow"),
        }
    }
}

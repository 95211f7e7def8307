//! Dense FFN sub-pipeline: fused 2-matmul (gate_up + silu_row_split),
//! separate gate/up 3-matmul fallback, LoRA-augmented down projection, and
//! the decode-only fused down+[norm+]residual fast path (spec §4.2).
//!
//! `run` owns the full `ffn(x) → [RMSNorm] → +residual` contract for the
//! layer — the caller ([`super::LayerExecutor::forward`]) never adds the
//! residual itself, so the sandwich-norm ordering (norm the sub-block
//! output, then add the residual) holds whether or not a fused kernel is
//! used underneath. MoE layers are handled by [`crate::moe`] instead —
//! `FfnWeights::Moe` routes there from [`run`], carrying the same contract.

use super::{optional_weight, reborrow, require_weight, LayerContext};
use crate::error::KernelError;
use crate::recorder::Dispatcher;
use crate::tensor::Tensor;
use crate::weights::{WeightBuffer, WeightStore};

pub struct DenseFfnWeights {
    pub gate_up: Option<WeightBuffer>,
    pub gate: Option<WeightBuffer>,
    pub up: Option<WeightBuffer>,
    pub down: WeightBuffer,
    pub down_lora: Option<super::attention::LoraWeights>,
}

pub enum FfnWeights {
    Dense(DenseFfnWeights),
    Moe(crate::moe::MoeWeights),
}

impl FfnWeights {
    pub fn load(store: &dyn WeightStore, config: &crate::config::ModelConfig, layer: usize) -> Result<Self, KernelError> {
        if let Some(moe) = crate::moe::MoeWeights::load(store, config, layer)? {
            return Ok(FfnWeights::Moe(moe));
        }

        let gate_up = optional_weight(store, layer, "gate_up_proj");
        let (gate, up) = if gate_up.is_none() {
            (
                Some(require_weight(store, layer, "gate_proj")?),
                Some(require_weight(store, layer, "up_proj")?),
            )
        } else {
            (None, None)
        };
        let down_lora = if store.get(&crate::weights::WeightKey::layer(layer, "down_proj.lora_down")).is_some() {
            Some(super::attention::LoraWeights {
                down: require_weight(store, layer, "down_proj.lora_down")?,
                up: require_weight(store, layer, "down_proj.lora_up")?,
            })
        } else {
            None
        };

        Ok(FfnWeights::Dense(DenseFfnWeights {
            gate_up,
            gate,
            up,
            down: require_weight(store, layer, "down_proj")?,
            down_lora,
        }))
    }
}

/// True when the decode-only fused `down → [RMSNorm →] +residual` kernels
/// are eligible: single token, f32 activations/weights throughout, no LoRA
/// on `down_proj`. The `KernelSet` implementation remains free to reject the
/// fused call (e.g. on a workgroup-size bound) and return a `KernelError`;
/// this is a static, conservative gate, not a runtime probe.
fn fused_down_residual_eligible(
    ctx: &LayerContext<'_>,
    weights: &DenseFfnWeights,
    activation_dtype: crate::tensor::DType,
) -> bool {
    ctx.n_tokens == 1
        && weights.down_lora.is_none()
        && activation_dtype == crate::tensor::DType::F32
        && weights.down.dtype == crate::tensor::DType::F32
}

pub fn run(
    mut dispatcher: Dispatcher<'_>,
    ctx: &mut LayerContext<'_>,
    weights: &FfnWeights,
    ffn_input: &Tensor,
    residual: &Tensor,
    post_ffn_norm: Option<&WeightBuffer>,
) -> Result<Tensor, KernelError> {
    match weights {
        FfnWeights::Moe(moe_weights) => {
            crate::moe::dispatch::run(dispatcher, ctx, moe_weights, ffn_input, residual, post_ffn_norm)
        }
        FfnWeights::Dense(weights) => {
            if let Some(gate_up) = &weights.gate_up {
                let gate_up_out = ctx.kernels.matmul(
                    reborrow(&mut dispatcher),
                    ffn_input,
                    &(*gate_up).into_tensor(),
                    None,
                )?;
                let activated =
                    ctx.kernels
                        .silu_row_split(reborrow(&mut dispatcher), &gate_up_out, ctx.config.activation)?;
                ctx.device.buffer_pool().release(gate_up_out.buffer);
                let out = finish_down(dispatcher, ctx, weights, &activated, residual, post_ffn_norm)?;
                ctx.device.buffer_pool().release(activated.buffer);
                return Ok(out);
            }

            let (gate, up) = (
                weights.gate.as_ref().expect("FfnWeights::load guarantees gate when gate_up absent"),
                weights.up.as_ref().expect("FfnWeights::load guarantees up when gate_up absent"),
            );
            let gate_out = ctx
                .kernels
                .matmul(reborrow(&mut dispatcher), ffn_input, &(*gate).into_tensor(), None)?;
            let up_out = ctx
                .kernels
                .matmul(reborrow(&mut dispatcher), ffn_input, &(*up).into_tensor(), None)?;
            let activated_gate = match ctx.config.activation {
                crate::config::Activation::Silu => ctx.kernels.silu(reborrow(&mut dispatcher), &gate_out)?,
                crate::config::Activation::Gelu => ctx.kernels.gelu(reborrow(&mut dispatcher), &gate_out)?,
            };
            ctx.device.buffer_pool().release(gate_out.buffer);
            let gated = ctx.kernels.residual_add(reborrow(&mut dispatcher), &activated_gate, &up_out)?;
            ctx.device.buffer_pool().release(activated_gate.buffer);
            ctx.device.buffer_pool().release(up_out.buffer);
            let out = finish_down(dispatcher, ctx, weights, &gated, residual, post_ffn_norm)?;
            ctx.device.buffer_pool().release(gated.buffer);
            Ok(out)
        }
    }
}

fn finish_down(
    mut dispatcher: Dispatcher<'_>,
    ctx: &mut LayerContext<'_>,
    weights: &DenseFfnWeights,
    gated: &Tensor,
    residual: &Tensor,
    post_ffn_norm: Option<&WeightBuffer>,
) -> Result<Tensor, KernelError> {
    if let Some(lora) = &weights.down_lora {
        let base = ctx
            .kernels
            .matmul(reborrow(&mut dispatcher), gated, &weights.down.into_tensor(), None)?;
        let down_small = ctx
            .kernels
            .matmul(reborrow(&mut dispatcher), gated, &lora.down.into_tensor(), None)?;
        let down_up = ctx
            .kernels
            .matmul(reborrow(&mut dispatcher), &down_small, &lora.up.into_tensor(), None)?;
        ctx.device.buffer_pool().release(down_small.buffer);
        let down_out = ctx.kernels.residual_add(reborrow(&mut dispatcher), &base, &down_up)?;
        ctx.device.buffer_pool().release(base.buffer);
        ctx.device.buffer_pool().release(down_up.buffer);
        return apply_norm_and_residual(dispatcher, ctx, down_out, residual, post_ffn_norm);
    }

    let eps = ctx.config.rms_norm_eps;
    let weight_offset = ctx.config.rms_norm_weight_offset;

    match (post_ffn_norm, fused_down_residual_eligible(ctx, weights, gated.dtype)) {
        (Some(norm_weight), true) => ctx.kernels.fused_matmul_rmsnorm_residual(
            dispatcher,
            gated,
            &weights.down.into_tensor(),
            &norm_weight.into_tensor(),
            residual,
            eps,
            weight_offset,
        ),
        (None, true) => ctx.kernels.fused_matmul_residual(dispatcher, gated, &weights.down.into_tensor(), residual),
        (_, false) => {
            let down_out = ctx
                .kernels
                .matmul(reborrow(&mut dispatcher), gated, &weights.down.into_tensor(), None)?;
            apply_norm_and_residual(dispatcher, ctx, down_out, residual, post_ffn_norm)
        }
    }
}

/// Applies the optional sandwich-norm `post_ffn_norm` weight to `down_out`,
/// then adds `residual` — the non-fused fallback for paths that can't (or
/// needn't) use [`crate::kernels::KernelSet::fused_matmul_residual`] /
/// `fused_matmul_rmsnorm_residual`.
fn apply_norm_and_residual(
    mut dispatcher: Dispatcher<'_>,
    ctx: &mut LayerContext<'_>,
    down_out: Tensor,
    residual: &Tensor,
    post_ffn_norm: Option<&WeightBuffer>,
) -> Result<Tensor, KernelError> {
    let normed = match post_ffn_norm {
        Some(norm_weight) => {
            let normed = ctx.kernels.rms_norm(
                reborrow(&mut dispatcher),
                &down_out,
                &norm_weight.into_tensor(),
                ctx.config.rms_norm_eps,
                ctx.config.rms_norm_weight_offset,
            )?;
            ctx.device.buffer_pool().release(down_out.buffer);
            normed
        }
        None => down_out,
    };
    let out = ctx.kernels.residual_add(dispatcher, residual, &normed)?;
    ctx.device.buffer_pool().release(normed.buffer);
    Ok(out)
}

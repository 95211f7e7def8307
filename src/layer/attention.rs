//! Attention sub-pipeline: Q/K/V projection (fused, separate, or
//! LoRA-augmented), optional per-head Q/K norm, RoPE with dual local/global
//! theta, KV cache update, masked attention, output projection (spec §4.2
//! steps 1-7).

use super::{optional_weight, reborrow, require_weight, LayerContext};
use crate::config::AttentionKind;
use crate::error::KernelError;
use crate::kernels::{AttentionOptions, RopeOptions};
use crate::recorder::Dispatcher;
use crate::tensor::Tensor;
use crate::weights::{WeightBuffer, WeightStore};

/// A low-rank correction pair `(down, up)` applied as `x + (x @ down) @ up`
/// alongside a base projection, disabling fused QKV for this layer (spec
/// §4.2 step 2's "LoRA-augmented" variant).
pub struct LoraWeights {
    pub down: WeightBuffer,
    pub up: WeightBuffer,
}

pub enum QkvWeights {
    Fused {
        qkv: WeightBuffer,
        q_size: u32,
        k_size: u32,
        v_size: u32,
    },
    Separate {
        q: WeightBuffer,
        k: WeightBuffer,
        v: WeightBuffer,
    },
    Lora {
        q: WeightBuffer,
        k: WeightBuffer,
        v: WeightBuffer,
        q_lora: LoraWeights,
        k_lora: LoraWeights,
        v_lora: LoraWeights,
    },
}

pub struct AttentionWeights {
    pub qkv: QkvWeights,
    pub q_norm: Option<WeightBuffer>,
    pub k_norm: Option<WeightBuffer>,
    pub o_proj: WeightBuffer,
}

impl AttentionWeights {
    pub fn load(store: &dyn WeightStore, layer: usize) -> Result<Self, KernelError> {
        let qkv = if store.get(&crate::weights::WeightKey::layer(layer, "qkv_proj")).is_some() {
            let qkv = require_weight(store, layer, "qkv_proj")?;
            let q_size = require_weight(store, layer, "q_size_hint")?.shape.dim(0);
            let k_size = require_weight(store, layer, "k_size_hint")?.shape.dim(0);
            let v_size = require_weight(store, layer, "v_size_hint")?.shape.dim(0);
            QkvWeights::Fused {
                qkv,
                q_size,
                k_size,
                v_size,
            }
        } else if store.get(&crate::weights::WeightKey::layer(layer, "q_proj.lora_down")).is_some() {
            QkvWeights::Lora {
                q: require_weight(store, layer, "q_proj")?,
                k: require_weight(store, layer, "k_proj")?,
                v: require_weight(store, layer, "v_proj")?,
                q_lora: LoraWeights {
                    down: require_weight(store, layer, "q_proj.lora_down")?,
                    up: require_weight(store, layer, "q_proj.lora_up")?,
                },
                k_lora: LoraWeights {
                    down: require_weight(store, layer, "k_proj.lora_down")?,
                    up: require_weight(store, layer, "k_proj.lora_up")?,
                },
                v_lora: LoraWeights {
                    down: require_weight(store, layer, "v_proj.lora_down")?,
                    up: require_weight(store, layer, "v_proj.lora_up")?,
                },
            }
        } else {
            QkvWeights::Separate {
                q: require_weight(store, layer, "q_proj")?,
                k: require_weight(store, layer, "k_proj")?,
                v: require_weight(store, layer, "v_proj")?,
            }
        };

        Ok(Self {
            qkv,
            q_norm: optional_weight(store, layer, "q_norm"),
            k_norm: optional_weight(store, layer, "k_norm"),
            o_proj: require_weight(store, layer, "o_proj")?,
        })
    }
}

fn project_lora(
    dispatcher: &mut Dispatcher<'_>,
    ctx: &mut LayerContext<'_>,
    input: &Tensor,
    base: &WeightBuffer,
    lora: &LoraWeights,
) -> Result<Tensor, KernelError> {
    let base_out = ctx
        .kernels
        .matmul(reborrow(dispatcher), input, &(*base).into_tensor(), None)?;
    let down = ctx
        .kernels
        .matmul(reborrow(dispatcher), input, &lora.down.into_tensor(), None)?;
    let up = ctx
        .kernels
        .matmul(reborrow(dispatcher), &down, &lora.up.into_tensor(), None)?;
    ctx.device.buffer_pool().release(down.buffer);
    let out = ctx.kernels.residual_add(reborrow(dispatcher), &base_out, &up)?;
    ctx.device.buffer_pool().release(base_out.buffer);
    ctx.device.buffer_pool().release(up.buffer);
    Ok(out)
}

/// True when the decode-only fused `o_proj → [RMSNorm →] +residual` kernels
/// are eligible: single token, f32 activations/weights throughout. Mirrors
/// `layer::ffn`'s `fused_down_residual_eligible` gate for the same reason —
/// a conservative static check, with the `KernelSet` implementation free to
/// reject the fused call itself and fall back.
fn fused_residual_eligible(ctx: &LayerContext<'_>, weights: &AttentionWeights, attn_dtype: crate::tensor::DType) -> bool {
    ctx.n_tokens == 1 && attn_dtype == crate::tensor::DType::F32 && weights.o_proj.dtype == crate::tensor::DType::F32
}

/// Runs attention and owns the full `Attn(x) → o_proj → [post_attn_norm] →
/// +residual` contract (spec §4.2 step 7's fused-output-projection
/// eligibility), the same way `ffn::run` owns `ffn(x) → [norm] → +residual`
/// — so the sandwich-norm ordering holds whether or not a fused kernel is
/// used underneath, and the caller never adds this sub-block's residual
/// itself.
pub fn run(
    mut dispatcher: Dispatcher<'_>,
    ctx: &mut LayerContext<'_>,
    weights: &AttentionWeights,
    normed_input: &Tensor,
    residual: &Tensor,
    post_attn_norm: Option<&WeightBuffer>,
) -> Result<Tensor, KernelError> {
    let (mut q, mut k, mut v) = match &weights.qkv {
        QkvWeights::Fused {
            qkv,
            q_size,
            k_size,
            v_size,
        } => {
            let fused = ctx
                .kernels
                .matmul(reborrow(&mut dispatcher), normed_input, &(*qkv).into_tensor(), None)?;
            ctx.kernels
                .split_qkv(reborrow(&mut dispatcher), &fused, *q_size, *k_size, *v_size)?
        }
        QkvWeights::Separate { q, k, v } => {
            let qt = ctx
                .kernels
                .matmul(reborrow(&mut dispatcher), normed_input, &(*q).into_tensor(), None)?;
            let kt = ctx
                .kernels
                .matmul(reborrow(&mut dispatcher), normed_input, &(*k).into_tensor(), None)?;
            let vt = ctx
                .kernels
                .matmul(reborrow(&mut dispatcher), normed_input, &(*v).into_tensor(), None)?;
            (qt, kt, vt)
        }
        QkvWeights::Lora {
            q,
            k,
            v,
            q_lora,
            k_lora,
            v_lora,
        } => {
            let qt = project_lora(&mut dispatcher, ctx, normed_input, q, q_lora)?;
            let kt = project_lora(&mut dispatcher, ctx, normed_input, k, k_lora)?;
            let vt = project_lora(&mut dispatcher, ctx, normed_input, v, v_lora)?;
            (qt, kt, vt)
        }
    };

    let eps = ctx.config.rms_norm_eps;
    let weight_offset = ctx.config.rms_norm_weight_offset;
    if let Some(q_norm) = &weights.q_norm {
        let normed_q = ctx
            .kernels
            .rms_norm(reborrow(&mut dispatcher), &q, &(*q_norm).into_tensor(), eps, weight_offset)?;
        ctx.device.buffer_pool().release(q.buffer);
        q = normed_q;
    }
    if let Some(k_norm) = &weights.k_norm {
        let normed_k = ctx
            .kernels
            .rms_norm(reborrow(&mut dispatcher), &k, &(*k_norm).into_tensor(), eps, weight_offset)?;
        ctx.device.buffer_pool().release(k.buffer);
        k = normed_k;
    }

    let attention_kind = ctx.config.attention_kind(ctx.layer_idx);
    let theta = match (attention_kind, ctx.config.rope.local_theta) {
        (AttentionKind::Sliding, Some(local_theta)) => local_theta,
        _ => ctx.config.rope.theta,
    };
    let rope_opts = RopeOptions {
        theta,
        position_offset: ctx.start_pos,
    };
    let roped_q = ctx.kernels.rope(reborrow(&mut dispatcher), &q, rope_opts)?;
    ctx.device.buffer_pool().release(q.buffer);
    q = roped_q;
    let roped_k = ctx.kernels.rope(reborrow(&mut dispatcher), &k, rope_opts)?;
    ctx.device.buffer_pool().release(k.buffer);
    k = roped_k;

    match &mut dispatcher {
        Dispatcher::Immediate => {
            ctx.kv_cache
                .update_from_gpu(ctx.device, ctx.layer_idx, &k, &v, ctx.start_pos, ctx.n_tokens);
        }
        Dispatcher::Recording(recorder) => {
            let pool = ctx.device.buffer_pool();
            ctx.kv_cache
                .record_update_from_gpu(recorder, pool, ctx.layer_idx, &k, &v, ctx.start_pos, ctx.n_tokens);
        }
    }
    ctx.device.buffer_pool().release(k.buffer);
    ctx.device.buffer_pool().release(v.buffer);

    let options = AttentionOptions {
        scale: ctx.config.attention_scale(),
        softcap: ctx.config.attention_softcap,
        sliding_window: match attention_kind {
            AttentionKind::Sliding => ctx.config.sliding_window,
            AttentionKind::Full => None,
        },
        causal: true,
    };
    let key_cache = Tensor::new(
        ctx.kv_cache.key_buffer(ctx.layer_idx),
        crate::tensor::DType::F32,
        q.shape,
        "kv_cache.key",
    );
    let value_cache = Tensor::new(
        ctx.kv_cache.value_buffer(ctx.layer_idx),
        crate::tensor::DType::F32,
        q.shape,
        "kv_cache.value",
    );
    let attn = ctx
        .kernels
        .attention(reborrow(&mut dispatcher), &q, &key_cache, &value_cache, options)?;
    ctx.device.buffer_pool().release(q.buffer);

    let eps = ctx.config.rms_norm_eps;
    let weight_offset = ctx.config.rms_norm_weight_offset;
    match (post_attn_norm, fused_residual_eligible(ctx, weights, attn.dtype)) {
        (Some(norm_weight), true) => {
            let out = ctx.kernels.fused_matmul_rmsnorm_residual(
                dispatcher,
                &attn,
                &weights.o_proj.into_tensor(),
                &norm_weight.into_tensor(),
                residual,
                eps,
                weight_offset,
            )?;
            ctx.device.buffer_pool().release(attn.buffer);
            Ok(out)
        }
        (None, true) => {
            let out = ctx.kernels.fused_matmul_residual(dispatcher, &attn, &weights.o_proj.into_tensor(), residual)?;
            ctx.device.buffer_pool().release(attn.buffer);
            Ok(out)
        }
        (_, false) => {
            let o_out = ctx
                .kernels
                .matmul(reborrow(&mut dispatcher), &attn, &weights.o_proj.into_tensor(), None)?;
            ctx.device.buffer_pool().release(attn.buffer);
            let normed = match post_attn_norm {
                Some(norm_weight) => {
                    let normed = ctx
                        .kernels
                        .rms_norm(reborrow(&mut dispatcher), &o_out, &norm_weight.into_tensor(), eps, weight_offset)?;
                    ctx.device.buffer_pool().release(o_out.buffer);
                    normed
                }
                None => o_out,
            };
            let out = ctx.kernels.residual_add(dispatcher, residual, &normed)?;
            ctx.device.buffer_pool().release(normed.buffer);
            Ok(out)
        }
    }
}

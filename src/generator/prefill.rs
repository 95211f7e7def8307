//! Prefill: embeds the full prompt, runs every layer once batched into a
//! single command recording, and computes logits for the last position
//! (spec §4.3 "Prefill").

use crate::config::ModelConfig;
use crate::device::Device;
use crate::error::{GenerationError, KernelError, LogitsHealthError, TokenRangeError};
use crate::kernels::KernelSet;
use crate::kv_cache::KvCache;
use crate::layer::{reborrow, LayerContext, LayerExecutor};
use crate::recorder::{CommandRecorder, Dispatcher};
use crate::tensor::{DType, Shape, Tensor};

use super::weights::ModelWeights;

/// Everything a caller needs out of a prefill pass: logits for the final
/// position (for sampling the first token) and the last layer's hidden
/// state (retained so a decode step immediately following prefill doesn't
/// need to re-embed and re-run every layer for position zero).
pub(crate) struct PrefillOutput {
    pub logits: Vec<f32>,
    pub last_hidden: Tensor,
}

/// Options narrowly relevant to prefill, threaded down from
/// `GenerateOptions` rather than taking the whole struct so this module
/// doesn't need to know about sampling-only fields.
pub(crate) struct PrefillOptions {
    pub disable_command_batching: bool,
    /// Layer indices at which to submit-and-wait mid-prefill and reopen a
    /// fresh recorder (spec §4.3 step 5's debug checkpoint feature).
    pub checkpoint_layers: Vec<usize>,
}

/// Uploads `token_ids` as a GPU tensor of u32 ids bit-reinterpreted as f32,
/// per the convention `KernelSet::embed_tokens` documents.
pub(crate) fn upload_token_ids(device: &dyn Device, token_ids: &[u32], label: &'static str) -> Tensor {
    let floats: Vec<f32> = token_ids.iter().map(|&id| id as f32).collect();
    let bytes: &[u8] = bytemuck::cast_slice(&floats);
    let pool = device.buffer_pool();
    let buffer = pool.acquire(
        bytes.len() as u64,
        wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC,
        label,
    );
    device.wgpu_queue().write_buffer(&pool.raw(buffer), 0, bytes);
    Tensor::new(buffer, DType::F32, Shape::new(&[token_ids.len() as u32]), label)
}

/// Validates every id is in `[0, vocab_size)` (spec §4.3 step 1). `pub(crate)`
/// so `Generator::generate` can re-check synchronously before ever
/// constructing a token stream, surfacing `TokenRangeError` before any GPU
/// work and before a caller observes `is_generating` held for longer than
/// this call (spec §8 scenario F).
pub(crate) fn validate_token_ids(token_ids: &[u32], vocab_size: u32) -> Result<(), TokenRangeError> {
    for &token_id in token_ids {
        if token_id >= vocab_size {
            return Err(TokenRangeError { token_id, vocab_size });
        }
    }
    Ok(())
}

pub(crate) fn is_healthy(logits: &[f32]) -> bool {
    logits.iter().any(|&v| v != 0.0) && logits.iter().all(|v| v.is_finite())
}

/// Applies tied-embedding `-inf` padding (step 7) and final-logit softcap
/// (step 8) to a raw logits row, in place.
pub(crate) fn finish_logits(logits: &mut Vec<f32>, config: &ModelConfig) {
    let lm_head_vocab = config.lm_head_vocab_size() as usize;
    if lm_head_vocab < config.vocab_size as usize {
        logits.resize(config.vocab_size as usize, f32::NEG_INFINITY);
    }
    if let Some(cap) = config.final_logit_softcap {
        for v in logits.iter_mut() {
            if v.is_finite() {
                *v = cap * (*v / cap).tanh();
            }
        }
    }
}

/// Encodes `final_norm -> lm_head` and returns the output tensor, against
/// either a borrowed recorder or a fresh `Immediate` dispatch.
pub(crate) fn encode_logits(
    mut dispatcher: Dispatcher<'_>,
    ctx: &LayerContext<'_>,
    weights: &ModelWeights,
    last_hidden: &Tensor,
) -> Result<Tensor, KernelError> {
    let eps = ctx.config.rms_norm_eps;
    let weight_offset = ctx.config.rms_norm_weight_offset;
    let normed = ctx.kernels.rms_norm(
        reborrow(&mut dispatcher),
        last_hidden,
        &weights.final_norm.into_tensor(),
        eps,
        weight_offset,
    )?;
    let logits_tensor = ctx
        .kernels
        .matmul(dispatcher, &normed, &weights.lm_head.into_tensor(), None)?;
    ctx.device.buffer_pool().release(normed.buffer);
    Ok(logits_tensor)
}

/// Reads back `logits_tensor`'s last row and applies the tied-embedding pad
/// and softcap. Returns `None` if the row is non-finite or all-zero — the
/// caller interprets that as "this path is unhealthy" rather than a hard
/// error.
pub(crate) fn read_logits(ctx: &LayerContext<'_>, logits_tensor: Tensor) -> Option<Vec<f32>> {
    let raw = ctx.device.buffer_pool().read(logits_tensor.buffer, logits_tensor.byte_size());
    ctx.device.buffer_pool().release(logits_tensor.buffer);

    let as_f32: &[f32] = bytemuck::cast_slice(&raw);
    let lm_head_vocab = ctx.config.lm_head_vocab_size() as usize;
    let row_start = as_f32.len().saturating_sub(lm_head_vocab);
    let mut logits = as_f32[row_start..].to_vec();

    if !is_healthy(&logits) {
        return None;
    }
    finish_logits(&mut logits, ctx.config);
    Some(logits)
}

/// Computes logits via a fresh `Immediate` pass (the unrecorded fallback):
/// every op submits and waits before `encode_logits` returns, so the
/// readback in `read_logits` is always safe immediately after.
fn compute_logits_immediate(
    ctx: &LayerContext<'_>,
    weights: &ModelWeights,
    last_hidden: &Tensor,
) -> Result<Option<Vec<f32>>, KernelError> {
    let logits_tensor = encode_logits(Dispatcher::Immediate, ctx, weights, last_hidden)?;
    Ok(read_logits(ctx, logits_tensor))
}

/// Computes logits by extending `recorder` with `final_norm -> lm_head`,
/// then submitting before reading back — the recorded GPU path (spec §4.3
/// step 6). `recorder` is always consumed: submitted on success, aborted on
/// an encoding failure, so no tracked buffer is ever leaked on this path.
fn compute_logits_recorded(
    mut recorder: CommandRecorder,
    ctx: &LayerContext<'_>,
    weights: &ModelWeights,
    last_hidden: &Tensor,
) -> Result<Option<Vec<f32>>, KernelError> {
    if !ctx.device.allow_readback("prefill_logits") {
        recorder.abort(ctx.device);
        return Err(KernelError::new(
            "prefill_logits",
            "readback denied while recorder is live; caller must submit before reading logits",
        ));
    }

    let encoded = encode_logits(Dispatcher::Recording(&mut recorder), ctx, weights, last_hidden);
    let logits_tensor = match encoded {
        Ok(t) => t,
        Err(e) => {
            recorder.abort(ctx.device);
            return Err(e);
        }
    };
    recorder.submit(ctx.device);
    Ok(read_logits(ctx, logits_tensor))
}

/// Runs the full prefill pass over `token_ids` (spec §4.3 "Prefill" steps
/// 1-8). `disable_recorded_logits` is a `&mut bool` so the caller's latch
/// persists across generation calls once the recorded GPU path has proven
/// unhealthy once (spec §9 Open Question 3: MoE dispatch is a separate,
/// always-fatal readback site — this latch only governs the final logits
/// peek).
#[allow(clippy::too_many_arguments)]
pub(crate) fn run(
    device: &dyn Device,
    kernels: &dyn KernelSet,
    config: &ModelConfig,
    kv_cache: &mut KvCache,
    weights: &ModelWeights,
    token_ids: &[u32],
    start_pos: u32,
    options: &PrefillOptions,
    disable_recorded_logits: &mut bool,
    embedding_scale: Option<f32>,
) -> Result<PrefillOutput, GenerationError> {
    validate_token_ids(token_ids, config.vocab_size)?;

    let n_tokens = token_ids.len() as u32;
    let ids_tensor = upload_token_ids(device, token_ids, "prefill.token_ids");

    let use_batching = !options.disable_command_batching;
    let mut recorder = if use_batching {
        Some(CommandRecorder::begin(device, "prefill"))
    } else {
        None
    };

    let dispatcher = match &mut recorder {
        Some(r) => Dispatcher::Recording(r),
        None => Dispatcher::Immediate,
    };
    let mut hidden = kernels.embed_tokens(dispatcher, &ids_tensor, &weights.embedding.into_tensor(), embedding_scale)?;
    device.buffer_pool().release(ids_tensor.buffer);

    for (layer_idx, layer_weights) in weights.layers.iter().enumerate() {
        let dispatcher = match &mut recorder {
            Some(r) => Dispatcher::Recording(r),
            None => Dispatcher::Immediate,
        };
        let mut ctx = LayerContext {
            device,
            kernels,
            config,
            layer_idx,
            kv_cache: &mut *kv_cache,
            start_pos,
            n_tokens,
        };
        let next = LayerExecutor::forward(dispatcher, &mut ctx, layer_weights, &hidden)?;
        device.buffer_pool().release(hidden.buffer);
        hidden = next;

        if options.checkpoint_layers.contains(&layer_idx) {
            if let Some(r) = recorder.take() {
                r.submit(device);
            }
            if use_batching {
                recorder = Some(CommandRecorder::begin(device, "prefill.checkpoint_continuation"));
            }
        }
    }

    let logits_ctx = LayerContext {
        device,
        kernels,
        config,
        layer_idx: weights.layers.len(),
        kv_cache: &mut *kv_cache,
        start_pos,
        n_tokens,
    };

    // Prefer extending the same recorder the layers were encoded into:
    // final_norm + lm_head join the one submit, and the readback happens
    // only after that submit lands (spec §4.3 step 6). If no recorder is
    // open (batching disabled) or the recorded path already latched
    // unhealthy, fall straight to the unrecorded `Immediate` path.
    let logits = if !*disable_recorded_logits {
        if let Some(active_recorder) = recorder.take() {
            match compute_logits_recorded(active_recorder, &logits_ctx, weights, &hidden)? {
                Some(logits) => Some(logits),
                None => {
                    log::warn!(
                        "prefill: recorded logits path produced unhealthy output, latching disable_recorded_logits"
                    );
                    *disable_recorded_logits = true;
                    compute_logits_immediate(&logits_ctx, weights, &hidden)?
                }
            }
        } else {
            compute_logits_immediate(&logits_ctx, weights, &hidden)?
        }
    } else {
        if let Some(r) = recorder.take() {
            r.submit(device);
        }
        compute_logits_immediate(&logits_ctx, weights, &hidden)?
    };

    let logits = logits.ok_or(LogitsHealthError { layer: None })?;

    Ok(PrefillOutput { logits, last_hidden: hidden })
}

//! Single-token decode step (spec §4.3 "Decode step (single token)").

use rand::Rng;

use crate::config::ModelConfig;
use crate::decode_buffers::DecodeBuffers;
use crate::device::Device;
use crate::error::{GenerationError, KernelError};
use crate::kernels::KernelSet;
use crate::kv_cache::KvCache;
use crate::layer::{LayerContext, LayerExecutor};
use crate::recorder::{CommandRecorder, Dispatcher};
use crate::tensor::Tensor;
use crate::tokenizer::SpecialTokens;

use super::options::GREEDY_THRESHOLD;
use super::prefill::{encode_logits, read_logits, upload_token_ids};
use super::sampling::{apply_repetition_penalty, sample_cpu};
use super::weights::ModelWeights;

pub(crate) struct DecodeOptions<'a> {
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
    pub repetition_penalty: f32,
    /// The most recently generated ids, newest last, already windowed to
    /// `repetition_penalty_window` by the caller.
    pub recent_tokens: &'a [u32],
    pub special_tokens: SpecialTokens,
    pub disable_command_batching: bool,
}

/// Reads back a single sampled id from a `[1]`-shaped f32-encoded tensor
/// (the same integer-as-f32-bits convention `embed_tokens`'s `token_ids`
/// argument uses).
fn read_sampled_id(device: &dyn Device, sampled: Tensor) -> u32 {
    let raw = device.buffer_pool().read(sampled.buffer, sampled.byte_size());
    device.buffer_pool().release(sampled.buffer);
    let as_f32: &[f32] = bytemuck::cast_slice(&raw);
    as_f32[0].round() as u32
}

/// `Ok(None)` means the sampled id was out of range or equal to `pad` — the
/// caller latches `disable_fused_decode` and retries via [`cpu_sample`].
fn accept_or_reject(config: &ModelConfig, special_tokens: SpecialTokens, token_id: u32) -> Option<u32> {
    let vocab_size = config.lm_head_vocab_size();
    if token_id >= vocab_size || special_tokens.pad == Some(token_id) {
        None
    } else {
        Some(token_id)
    }
}

/// Fused-GPU-sample path, batched: `final_norm -> lm_head -> sample`, all
/// appended to `recorder`, one submit, a 4-byte readback (spec §4.3 step 3
/// "Fused GPU sample path"). `recorder` is always consumed — submitted on
/// success, aborted on an encode failure.
fn fused_sample_recorded(
    mut recorder: CommandRecorder,
    ctx: &LayerContext<'_>,
    weights: &ModelWeights,
    last_hidden: &Tensor,
    options: &DecodeOptions<'_>,
) -> Result<Option<u32>, KernelError> {
    if !ctx.device.allow_readback("decode_fused_sample") {
        recorder.abort(ctx.device);
        return Err(KernelError::new(
            "decode_fused_sample",
            "readback denied while recorder is live; caller must submit before sampling",
        ));
    }

    let greedy = options.temperature < GREEDY_THRESHOLD;
    let (top_k, top_p) = if greedy { (1, 1.0) } else { (options.top_k, options.top_p) };

    let encoded: Result<Tensor, KernelError> = (|| {
        let logits = encode_logits(Dispatcher::Recording(&mut recorder), ctx, weights, last_hidden)?;
        let sampled = ctx
            .kernels
            .sample(Dispatcher::Recording(&mut recorder), &logits, options.temperature, top_k, top_p)?;
        ctx.device.buffer_pool().release(logits.buffer);
        Ok(sampled)
    })();

    let sampled = match encoded {
        Ok(t) => t,
        Err(e) => {
            recorder.abort(ctx.device);
            return Err(e);
        }
    };
    recorder.submit(ctx.device);

    let token_id = read_sampled_id(ctx.device, sampled);
    Ok(accept_or_reject(ctx.config, options.special_tokens, token_id))
}

/// Fused-GPU-sample path, unbatched: every op submits and waits on its own,
/// used when command batching is disabled.
fn fused_sample_immediate(
    ctx: &LayerContext<'_>,
    weights: &ModelWeights,
    last_hidden: &Tensor,
    options: &DecodeOptions<'_>,
) -> Result<Option<u32>, KernelError> {
    let greedy = options.temperature < GREEDY_THRESHOLD;
    let (top_k, top_p) = if greedy { (1, 1.0) } else { (options.top_k, options.top_p) };

    let logits = encode_logits(Dispatcher::Immediate, ctx, weights, last_hidden)?;
    let sampled = ctx
        .kernels
        .sample(Dispatcher::Immediate, &logits, options.temperature, top_k, top_p)?;
    ctx.device.buffer_pool().release(logits.buffer);

    let token_id = read_sampled_id(ctx.device, sampled);
    Ok(accept_or_reject(ctx.config, options.special_tokens, token_id))
}

/// CPU-reference sample path (spec §4.3 "CPU sample path"): read the full
/// logits row back, apply repetition penalty, sample on the CPU. Consumes
/// `recorder` when one is open (submitting before the read); runs a fresh
/// `Immediate` pass otherwise.
fn cpu_sample(
    recorder: Option<CommandRecorder>,
    ctx: &LayerContext<'_>,
    weights: &ModelWeights,
    last_hidden: &Tensor,
    options: &DecodeOptions<'_>,
    rng: &mut impl Rng,
) -> Result<u32, KernelError> {
    let logits_tensor = match recorder {
        Some(mut recorder) => {
            if !ctx.device.allow_readback("decode_cpu_sample") {
                recorder.abort(ctx.device);
                return Err(KernelError::new(
                    "decode_cpu_sample",
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
            logits_tensor
        }
        None => encode_logits(Dispatcher::Immediate, ctx, weights, last_hidden)?,
    };

    let mut logits = read_logits(ctx, logits_tensor)
        .ok_or_else(|| KernelError::new("decode_cpu_sample", "logits are unhealthy (non-finite or all-zero)"))?;

    apply_repetition_penalty(&mut logits, options.recent_tokens, options.repetition_penalty);
    Ok(sample_cpu(
        &mut logits,
        options.special_tokens.pad,
        options.temperature,
        options.top_k,
        options.top_p,
        rng,
    ))
}

/// Runs one decode step: embeds `token_id` into the decode ping buffer,
/// iterates every layer with a ping-pong buffer swap, samples the next
/// token, and returns its id (spec §4.3 "Decode step (single token)" steps
/// 1-4). `position` is this token's absolute position in the sequence —
/// the caller advances it, mirroring `kv_cache.current_seq_len()`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn run(
    device: &dyn Device,
    kernels: &dyn KernelSet,
    config: &ModelConfig,
    kv_cache: &mut KvCache,
    weights: &ModelWeights,
    decode_buffers: &mut DecodeBuffers,
    token_id: u32,
    position: u32,
    options: &DecodeOptions<'_>,
    disable_fused_decode: &mut bool,
    embedding_scale: Option<f32>,
    rng: &mut impl Rng,
) -> Result<u32, GenerationError> {
    let use_batching = !options.disable_command_batching;
    let mut recorder = if use_batching {
        Some(CommandRecorder::begin(device, "decode"))
    } else {
        None
    };

    let ids_tensor = upload_token_ids(device, &[token_id], "decode.token_id");
    let embedded = {
        let dispatcher = match &mut recorder {
            Some(r) => Dispatcher::Recording(r),
            None => Dispatcher::Immediate,
        };
        let embedded = kernels.embed_tokens(dispatcher, &ids_tensor, &weights.embedding.into_tensor(), embedding_scale)?;
        device.buffer_pool().release(ids_tensor.buffer);
        embedded
    };
    let mut hidden = {
        let mut dispatcher = match &mut recorder {
            Some(r) => Dispatcher::Recording(r),
            None => Dispatcher::Immediate,
        };
        decode_buffers.advance(device, &mut dispatcher, &embedded)
    };
    device.buffer_pool().release(embedded.buffer);

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
            start_pos: position,
            n_tokens: 1,
        };
        let next = LayerExecutor::forward(dispatcher, &mut ctx, layer_weights, &hidden)?;

        let mut copy_dispatcher = match &mut recorder {
            Some(r) => Dispatcher::Recording(r),
            None => Dispatcher::Immediate,
        };
        hidden = decode_buffers.advance(device, &mut copy_dispatcher, &next);
        device.buffer_pool().release(next.buffer);
    }

    let logits_ctx = LayerContext {
        device,
        kernels,
        config,
        layer_idx: weights.layers.len(),
        kv_cache: &mut *kv_cache,
        start_pos: position,
        n_tokens: 1,
    };

    let token_id = if !*disable_fused_decode {
        let sampled = match recorder.take() {
            Some(active_recorder) => fused_sample_recorded(active_recorder, &logits_ctx, weights, &hidden, options)?,
            None => fused_sample_immediate(&logits_ctx, weights, &hidden, options)?,
        };
        match sampled {
            Some(id) => id,
            None => {
                log::warn!("decode: fused GPU sample produced an out-of-range/pad id, latching disable_fused_decode");
                *disable_fused_decode = true;
                cpu_sample(None, &logits_ctx, weights, &hidden, options, rng)?
            }
        }
    } else {
        cpu_sample(recorder.take(), &logits_ctx, weights, &hidden, options, rng)?
    };

    Ok(token_id)
}

//! Batched multi-token decode (spec §4.3 "Batched multi-token decode"): `n`
//! decode steps recorded against a single `CommandRecorder` and submitted
//! once, instead of one recorder per token the way [`super::decode`] works.

use crate::config::ModelConfig;
use crate::decode_buffers::DecodeBuffers;
use crate::device::Device;
use crate::error::{GenerationError, KernelError};
use crate::kernels::KernelSet;
use crate::kv_cache::KvCache;
use crate::layer::{LayerContext, LayerExecutor};
use crate::recorder::{CommandRecorder, Dispatcher};
use crate::tensor::{DType, Shape, Tensor};
use crate::tokenizer::SpecialTokens;

use super::options::{StopCheckMode, GREEDY_THRESHOLD};
use super::prefill::encode_logits;
use super::weights::ModelWeights;

pub(crate) struct BatchedDecodeOptions<'a> {
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
    pub stop_check_mode: StopCheckMode,
    pub stop_token_ids: &'a [u32],
    pub max_tokens: u32,
    pub special_tokens: SpecialTokens,
}

pub(crate) struct BatchedDecodeOutput {
    /// The sampled prefix, truncated at the first stop condition if one was
    /// hit within the batch.
    pub token_ids: Vec<u32>,
    pub stopped: bool,
}

fn upload_scalar_f32(device: &dyn Device, value: f32, label: &'static str) -> Tensor {
    let pool = device.buffer_pool();
    let usage = wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC;
    let buffer = pool.acquire(4, usage, label);
    device.wgpu_queue().write_buffer(&pool.raw(buffer), 0, bytemuck::cast_slice(&[value]));
    Tensor::new(buffer, DType::F32, Shape::new(&[1]), label)
}

fn upload_zeroed_f32(device: &dyn Device, n: u32, label: &'static str) -> Tensor {
    let pool = device.buffer_pool();
    let usage = wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC;
    let bytes = n as u64 * 4;
    let buffer = pool.acquire(bytes, usage, label);
    device.wgpu_queue().write_buffer(&pool.raw(buffer), 0, &vec![0u8; bytes as usize]);
    Tensor::new(buffer, DType::F32, Shape::new(&[n]), label)
}

/// Records one decode step (embed -> layers -> logits -> sample) into
/// `recorder`, writing the sampled id into `tokens[step_index + 1]`, and,
/// when `stop_flags` is set, the per-token stop flag into
/// `stop_flags[step_index]`.
#[allow(clippy::too_many_arguments)]
fn record_step(
    device: &dyn Device,
    kernels: &dyn KernelSet,
    config: &ModelConfig,
    kv_cache: &mut KvCache,
    weights: &ModelWeights,
    decode_buffers: &mut DecodeBuffers,
    recorder: &mut CommandRecorder,
    tokens: &Tensor,
    stop_flags: Option<&Tensor>,
    step_index: u32,
    position: u32,
    options: &BatchedDecodeOptions<'_>,
    embedding_scale: Option<f32>,
) -> Result<(), KernelError> {
    let token_view = tokens.view(step_index, Shape::new(&[1]));
    let embedded = kernels.embed_tokens(
        Dispatcher::Recording(&mut *recorder),
        &token_view,
        &weights.embedding.into_tensor(),
        embedding_scale,
    )?;
    let mut hidden = decode_buffers.advance(device, &mut Dispatcher::Recording(&mut *recorder), &embedded);
    device.buffer_pool().release(embedded.buffer);

    for (layer_idx, layer_weights) in weights.layers.iter().enumerate() {
        let mut ctx = LayerContext {
            device,
            kernels,
            config,
            layer_idx,
            kv_cache: &mut *kv_cache,
            start_pos: position,
            n_tokens: 1,
        };
        let next = LayerExecutor::forward(Dispatcher::Recording(&mut *recorder), &mut ctx, layer_weights, &hidden)?;
        hidden = decode_buffers.advance(device, &mut Dispatcher::Recording(&mut *recorder), &next);
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
    let logits = encode_logits(Dispatcher::Recording(&mut *recorder), &logits_ctx, weights, &hidden)?;

    let greedy = options.temperature < GREEDY_THRESHOLD;
    let (top_k, top_p) = if greedy { (1, 1.0) } else { (options.top_k, options.top_p) };
    let sampled = kernels.sample(Dispatcher::Recording(&mut *recorder), &logits, options.temperature, top_k, top_p)?;
    device.buffer_pool().release(logits.buffer);

    let pool = device.buffer_pool();
    recorder.encoder_mut().copy_buffer_to_buffer(
        &pool.raw(sampled.buffer),
        0,
        &pool.raw(tokens.buffer),
        (step_index as u64 + 1) * 4,
        4,
    );

    if let Some(stop_flags) = stop_flags {
        let generated_position = upload_scalar_f32(device, (position + 1) as f32, "batched_decode.position");
        let flag = kernels.check_stop(
            Dispatcher::Recording(&mut *recorder),
            &sampled,
            &generated_position,
            options.stop_token_ids,
            options.max_tokens,
        )?;
        device.buffer_pool().release(generated_position.buffer);
        let pool = device.buffer_pool();
        recorder
            .encoder_mut()
            .copy_buffer_to_buffer(&pool.raw(flag.buffer), 0, &pool.raw(stop_flags.buffer), step_index as u64 * 4, 4);
        device.buffer_pool().release(flag.buffer);
    }

    device.buffer_pool().release(sampled.buffer);
    Ok(())
}

/// Runs `n` decode steps against one recorder and one submit (spec §4.3
/// "Batched multi-token decode"). `seed_token` is the already-sampled token
/// fed into step 0 (the generation loop's most recent token); the returned
/// `token_ids` are the `n` newly sampled ids, truncated at the first stop
/// condition. On a kernel failure mid-batch, the recorder is aborted, both
/// staging buffers are released, and the error propagates — the caller
/// latches a `disable_batched_decode` flag and retries via [`super::decode`].
#[allow(clippy::too_many_arguments)]
pub(crate) fn run(
    device: &dyn Device,
    kernels: &dyn KernelSet,
    config: &ModelConfig,
    kv_cache: &mut KvCache,
    weights: &ModelWeights,
    decode_buffers: &mut DecodeBuffers,
    seed_token: u32,
    start_position: u32,
    n: u32,
    options: &BatchedDecodeOptions<'_>,
    embedding_scale: Option<f32>,
) -> Result<BatchedDecodeOutput, GenerationError> {
    let tokens = {
        let pool = device.buffer_pool();
        let usage = wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC;
        let buffer = pool.acquire((n as u64 + 1) * 4, usage, "batched_decode.tokens");
        device
            .wgpu_queue()
            .write_buffer(&pool.raw(buffer), 0, bytemuck::cast_slice(&[seed_token as f32]));
        Tensor::new(buffer, DType::F32, Shape::new(&[n + 1]), "batched_decode.tokens")
    };

    let stop_flags = (options.stop_check_mode == StopCheckMode::PerToken)
        .then(|| upload_zeroed_f32(device, n, "batched_decode.stop_flags"));

    let mut recorder = CommandRecorder::begin(device, "batched_decode");

    let mut encode_result = Ok(());
    for i in 0..n {
        encode_result = record_step(
            device,
            kernels,
            config,
            kv_cache,
            weights,
            decode_buffers,
            &mut recorder,
            &tokens,
            stop_flags.as_ref(),
            i,
            start_position + i,
            options,
            embedding_scale,
        );
        if encode_result.is_err() {
            break;
        }
    }

    if let Err(e) = encode_result {
        recorder.abort(device);
        device.buffer_pool().release(tokens.buffer);
        if let Some(flags) = stop_flags {
            device.buffer_pool().release(flags.buffer);
        }
        return Err(e.into());
    }
    recorder.submit(device);

    let raw_tokens = device.buffer_pool().read(tokens.buffer, tokens.byte_size());
    device.buffer_pool().release(tokens.buffer);
    let token_floats: &[f32] = bytemuck::cast_slice(&raw_tokens);
    let mut token_ids: Vec<u32> = token_floats[1..].iter().map(|&v| v.round() as u32).collect();

    let flags: Option<Vec<u32>> = stop_flags.map(|flags_tensor| {
        let raw = device.buffer_pool().read(flags_tensor.buffer, flags_tensor.byte_size());
        device.buffer_pool().release(flags_tensor.buffer);
        let as_f32: &[f32] = bytemuck::cast_slice(&raw);
        as_f32.iter().map(|&v| v.round() as u32).collect()
    });

    let mut stopped = false;
    let mut actual_count = token_ids.len();
    for (i, &id) in token_ids.iter().enumerate() {
        let flagged = flags.as_ref().map(|f| f[i] != 0).unwrap_or(false);
        let is_pad = options.special_tokens.pad == Some(id);
        if flagged || is_pad || options.stop_token_ids.contains(&id) {
            actual_count = i + 1;
            stopped = true;
            break;
        }
    }
    token_ids.truncate(actual_count);

    Ok(BatchedDecodeOutput { token_ids, stopped })
}

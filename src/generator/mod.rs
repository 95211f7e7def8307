//! `Generator`: drives one generation call end to end — prefill, the decode
//! loop, stop detection, and KV-prefix reuse (spec §4.3, §5, §6).

mod batched_decode;
mod decode;
mod options;
mod prefill;
mod sampling;
mod stats;
mod weights;

pub use options::{AbortSignal, GenerateOptions, StopCheckMode};
pub use stats::GenerationStats;
pub use weights::ModelWeights;

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_stream::stream;
use futures_core::Stream;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::ModelConfig;
use crate::decode_buffers::DecodeBuffers;
use crate::device::Device;
use crate::error::{Busy, GenerationError};
use crate::kernels::KernelSet;
use crate::kv_cache::{KvCache, KvCacheConfig, Snapshot};
use crate::tensor::DType;
use crate::tokenizer::{SpecialTokens, Tokenizer};
use crate::weights::WeightStore;

use batched_decode::{BatchedDecodeOptions, BatchedDecodeOutput};
use decode::DecodeOptions;
use stats::StatsTimer;

/// One sampled token plus its decoded text fragment.
///
/// `batch_id` is `None` for the very first token (sampled straight from
/// prefill logits) and for every token produced by the single-token decode
/// path; it carries the same value for every token that came out of one
/// [`batched_decode`] call, which is this crate's stand-in for spec §6's
/// separate `on_token`/`on_batch` callbacks — a stream consumer groups
/// consecutive same-`batch_id` items exactly the way a registered `on_batch`
/// callback would have received them.
#[derive(Clone, Debug)]
pub struct GeneratedToken {
    pub id: u32,
    pub text: String,
    pub batch_id: Option<u64>,
}

struct RuntimeState {
    kv_cache: KvCache,
    decode_buffers: DecodeBuffers,
    disable_recorded_logits: bool,
    disable_fused_decode: bool,
    disable_batched_decode: bool,
}

/// Resets `is_generating` unconditionally on drop, covering spec §5
/// "Reentrancy"'s "cleared in an always-run cleanup block, even on error"
/// requirement. Moved into the `stream!` body as a captured upvalue rather
/// than constructed inside it, so its `Drop` still runs if the returned
/// stream is dropped before being polled even once, not just after partial
/// consumption.
struct GeneratingGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for GeneratingGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

fn recent_window(generated: &[u32], window: usize) -> &[u32] {
    let start = generated.len().saturating_sub(window);
    &generated[start..]
}

fn stop_now(
    config: &ModelConfig,
    options: &GenerateOptions,
    special_tokens: &SpecialTokens,
    last_id: u32,
    generated_text: &str,
    abort_signal: &AbortSignal,
    tokens_generated: u32,
) -> bool {
    if config.stop_token_ids.contains(&last_id) || special_tokens.eos == Some(last_id) {
        return true;
    }
    if options
        .stop_sequences
        .iter()
        .any(|seq| !seq.is_empty() && generated_text.ends_with(seq.as_str()))
    {
        return true;
    }
    if abort_signal.is_aborted() {
        return true;
    }
    tokens_generated >= options.max_tokens
}

/// Drives prefill + the decode loop for one model. Deliberately not `Sync`
/// (its mutable state lives in a `RefCell`, matching spec §5's
/// single-threaded cooperative scheduling model, where a host task driving
/// the stream owns the generator for the call's whole lifetime); contrast
/// with [`Device`]/[`KernelSet`]/[`Tokenizer`], which are `Send + Sync`
/// collaborators this type only ever borrows through `&dyn`.
pub struct Generator {
    device: Arc<dyn Device>,
    kernels: Arc<dyn KernelSet>,
    tokenizer: Arc<dyn Tokenizer>,
    weights: ModelWeights,
    config: ModelConfig,
    embedding_scale: Option<f32>,
    state: RefCell<RuntimeState>,
    is_generating: AtomicBool,
    stats: RefCell<GenerationStats>,
}

impl Generator {
    /// Loads every weight via `weight_store` and allocates the KV cache and
    /// decode ping/pong buffers. `config` is validated here, once, per spec
    /// §7's "validated exactly once, at construction" policy.
    pub fn new(
        device: Arc<dyn Device>,
        kernels: Arc<dyn KernelSet>,
        tokenizer: Arc<dyn Tokenizer>,
        weight_store: &dyn WeightStore,
        config: ModelConfig,
        kv_cache_config: KvCacheConfig,
        embedding_scale: Option<f32>,
    ) -> Result<Self, GenerationError> {
        config.validate()?;
        let weights = ModelWeights::load(weight_store, &config)?;
        let kv_cache = KvCache::new(device.buffer_pool(), kv_cache_config);
        let decode_buffers = DecodeBuffers::new(device.buffer_pool(), config.hidden_size, DType::F32);
        Ok(Self {
            device,
            kernels,
            tokenizer,
            weights,
            config,
            embedding_scale,
            state: RefCell::new(RuntimeState {
                kv_cache,
                decode_buffers,
                disable_recorded_logits: false,
                disable_fused_decode: false,
                disable_batched_decode: false,
            }),
            is_generating: AtomicBool::new(false),
            stats: RefCell::new(GenerationStats::default()),
        })
    }

    /// Counters from the most recently completed (or failed) call.
    pub fn stats(&self) -> GenerationStats {
        self.stats.borrow().clone()
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn try_enter(&self) -> Result<GeneratingGuard<'_>, GenerationError> {
        if self
            .is_generating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Busy.into());
        }
        Ok(GeneratingGuard { flag: &self.is_generating })
    }

    /// Starts a generation call over `prompt_tokens` (spec §4.3 "Generation
    /// loop"). Fails immediately with `Busy` if another call is already in
    /// progress on this instance, or with `TokenRangeError` if any prompt id
    /// is out of range — both checks happen synchronously, before any GPU
    /// work and before the returned stream is ever polled (spec §8 scenario
    /// F).
    pub fn generate(
        &self,
        prompt_tokens: Vec<u32>,
        options: GenerateOptions,
        abort_signal: AbortSignal,
    ) -> Result<impl Stream<Item = Result<GeneratedToken, GenerationError>> + '_, GenerationError> {
        let guard = self.try_enter()?;
        if let Err(e) = prefill::validate_token_ids(&prompt_tokens, self.config.vocab_size) {
            drop(guard);
            return Err(e.into());
        }
        Ok(self.drive(guard, prompt_tokens, 0, options, abort_signal))
    }

    /// Runs prefill over `prompt_tokens` and returns a cache snapshot plus
    /// the input token list, without sampling (spec §4.3 "KV-prefix reuse",
    /// §6 cache snapshot shape `{cache, seq_len, tokens}` — the token list
    /// rides alongside the snapshot as this method's second return value
    /// rather than as a field on [`Snapshot`] itself, since `Snapshot` is
    /// shared, buffer-backed state with no natural home for an owned
    /// `Vec<u32>` of a specific caller's prompt).
    pub fn prefill_kv_only(&self, prompt_tokens: Vec<u32>) -> Result<(Snapshot, Vec<u32>), GenerationError> {
        let _guard = self.try_enter()?;
        prefill::validate_token_ids(&prompt_tokens, self.config.vocab_size)?;

        let mut state = self.state.borrow_mut();
        state.kv_cache.reset();
        state.disable_recorded_logits = false;

        let prefill_options = prefill::PrefillOptions {
            disable_command_batching: false,
            checkpoint_layers: Vec::new(),
        };
        prefill::run(
            self.device.as_ref(),
            self.kernels.as_ref(),
            &self.config,
            &mut state.kv_cache,
            &self.weights,
            &prompt_tokens,
            0,
            &prefill_options,
            &mut state.disable_recorded_logits,
            self.embedding_scale,
        )?;

        let snapshot = state.kv_cache.snapshot(self.device.as_ref());
        Ok((snapshot, prompt_tokens))
    }

    /// Clones `snapshot` into the active cache, resumes `current_seq_len`
    /// from it, runs prefill only on `new_prompt_tokens`, and continues into
    /// the ordinary decode loop (spec §4.3 "KV-prefix reuse" / §8 scenario
    /// E).
    pub fn generate_with_prefix_kv(
        &self,
        snapshot: &Snapshot,
        new_prompt_tokens: Vec<u32>,
        options: GenerateOptions,
        abort_signal: AbortSignal,
    ) -> Result<impl Stream<Item = Result<GeneratedToken, GenerationError>> + '_, GenerationError> {
        let guard = self.try_enter()?;
        if let Err(e) = prefill::validate_token_ids(&new_prompt_tokens, self.config.vocab_size) {
            drop(guard);
            return Err(e.into());
        }
        let start_pos = snapshot.seq_len();
        {
            let mut state = self.state.borrow_mut();
            state.kv_cache.restore_from_snapshot(self.device.as_ref(), snapshot);
        }
        Ok(self.drive(guard, new_prompt_tokens, start_pos, options, abort_signal))
    }

    /// The shared generation loop behind both `generate` and
    /// `generate_with_prefix_kv`: prefill over `prompt_tokens` starting at
    /// `start_pos`, emit the prefill-sampled first token, then alternate
    /// batched/single-token decode steps, checking stop conditions after
    /// every yielded token, until `max_tokens` is reached or a stop fires
    /// (spec §4.3 "Generation loop", §5 "Cancellation").
    fn drive<'a>(
        &'a self,
        guard: GeneratingGuard<'a>,
        prompt_tokens: Vec<u32>,
        start_pos: u32,
        options: GenerateOptions,
        abort_signal: AbortSignal,
    ) -> impl Stream<Item = Result<GeneratedToken, GenerationError>> + 'a {
        stream! {
            let _guard = guard;
            let mut timer = StatsTimer::start();
            let mut state = self.state.borrow_mut();
            // Latched degradation flags reset at generation start (spec §9).
            state.disable_recorded_logits = false;
            state.disable_fused_decode = false;
            state.disable_batched_decode = false;

            if start_pos == 0 {
                state.kv_cache.reset();
            }

            let prompt_end_pos = start_pos + prompt_tokens.len() as u32;
            if prompt_end_pos >= state.kv_cache.max_seq_len() || options.max_tokens == 0 {
                // A prompt that fills the cache to capacity leaves no room
                // for even the first generated token's own KV entry (spec
                // §8 invariant 11); zero requested tokens is invariant 10.
                // Either way: emit nothing and return cleanly without
                // touching the GPU.
                let stats = timer.finish(0, None);
                *self.stats.borrow_mut() = stats;
                return;
            }

            let prefill_options = prefill::PrefillOptions {
                disable_command_batching: options.disable_command_batching,
                checkpoint_layers: Vec::new(),
            };
            let prefill_started = Instant::now();
            let prefill_result = prefill::run(
                self.device.as_ref(),
                self.kernels.as_ref(),
                &self.config,
                &mut state.kv_cache,
                &self.weights,
                &prompt_tokens,
                start_pos,
                &prefill_options,
                &mut state.disable_recorded_logits,
                self.embedding_scale,
            );
            timer.record_prefill(prefill_started.elapsed());

            let prefill_output = match prefill_result {
                Ok(output) => output,
                Err(e) => {
                    yield Err(e);
                    let stats = timer.finish(0, None);
                    *self.stats.borrow_mut() = stats;
                    return;
                }
            };

            let special_tokens = self.tokenizer.special_tokens();
            let mut rng = StdRng::from_entropy();
            let mut generated_ids: Vec<u32> = Vec::new();
            let mut generated_text = String::new();
            let mut next_batch_id: u64 = 0;

            let first_id = {
                let mut logits = prefill_output.logits;
                sampling::apply_repetition_penalty(&mut logits, &[], options.repetition_penalty);
                sampling::sample_cpu(&mut logits, special_tokens.pad, options.temperature, options.top_k, options.top_p, &mut rng)
            };
            timer.mark_first_token();
            generated_ids.push(first_id);
            let first_text = self.tokenizer.decode(&[first_id], false, false);
            generated_text.push_str(&first_text);
            yield Ok(GeneratedToken { id: first_id, text: first_text, batch_id: None });

            let mut position = start_pos + prompt_tokens.len() as u32;

            let mut finished = stop_now(
                &self.config,
                &options,
                &special_tokens,
                first_id,
                &generated_text,
                &abort_signal,
                generated_ids.len() as u32,
            );

            while !finished && generated_ids.len() < options.max_tokens as usize && position < state.kv_cache.max_seq_len() {
                let decode_started = Instant::now();

                let use_batched = !state.disable_batched_decode
                    && !options.disable_multi_token_decode
                    && options.batch_size > 1;

                if use_batched {
                    let remaining = options.max_tokens - generated_ids.len() as u32;
                    let room = state.kv_cache.max_seq_len() - position;
                    let batch_n = options.batch_size.min(remaining).min(room);
                    if batch_n == 0 {
                        break;
                    }
                    let batched_options = BatchedDecodeOptions {
                        temperature: options.temperature,
                        top_k: options.top_k,
                        top_p: options.top_p,
                        stop_check_mode: options.stop_check_mode,
                        stop_token_ids: &self.config.stop_token_ids,
                        max_tokens: options.max_tokens,
                        special_tokens,
                    };
                    let seed = *generated_ids.last().expect("the first token was always sampled above");
                    let batch_result: Result<BatchedDecodeOutput, GenerationError> = batched_decode::run(
                        self.device.as_ref(),
                        self.kernels.as_ref(),
                        &self.config,
                        &mut state.kv_cache,
                        &self.weights,
                        &mut state.decode_buffers,
                        seed,
                        position,
                        batch_n,
                        &batched_options,
                        self.embedding_scale,
                    );
                    timer.record_decode(decode_started.elapsed());

                    match batch_result {
                        Ok(output) => {
                            let batch_id = next_batch_id;
                            next_batch_id += 1;
                            for id in output.token_ids {
                                generated_ids.push(id);
                                position += 1;
                                let text = self.tokenizer.decode(&[id], false, false);
                                generated_text.push_str(&text);
                                yield Ok(GeneratedToken { id, text, batch_id: Some(batch_id) });
                                if stop_now(&self.config, &options, &special_tokens, id, &generated_text, &abort_signal, generated_ids.len() as u32) {
                                    finished = true;
                                    break;
                                }
                            }
                            if output.stopped {
                                finished = true;
                            }
                        }
                        Err(_) => {
                            // Batched decode fallback (spec §7: recovered,
                            // not surfaced; spec §8 scenario D): latch and
                            // retry the rest of the generation one token at
                            // a time.
                            log::warn!("batched decode failed mid-generation, latching disable_batched_decode");
                            state.disable_batched_decode = true;
                        }
                    }
                    continue;
                }

                let recent = recent_window(&generated_ids, options.repetition_penalty_window);
                let decode_options = DecodeOptions {
                    temperature: options.temperature,
                    top_k: options.top_k,
                    top_p: options.top_p,
                    repetition_penalty: options.repetition_penalty,
                    recent_tokens: recent,
                    special_tokens,
                    disable_command_batching: options.disable_command_batching,
                };
                let seed = *generated_ids.last().expect("the first token was always sampled above");
                let step_result = decode::run(
                    self.device.as_ref(),
                    self.kernels.as_ref(),
                    &self.config,
                    &mut state.kv_cache,
                    &self.weights,
                    &mut state.decode_buffers,
                    seed,
                    position,
                    &decode_options,
                    &mut state.disable_fused_decode,
                    self.embedding_scale,
                    &mut rng,
                );
                timer.record_decode(decode_started.elapsed());

                let id = match step_result {
                    Ok(id) => id,
                    Err(e) => {
                        yield Err(e);
                        finished = true;
                        break;
                    }
                };
                generated_ids.push(id);
                position += 1;
                let text = self.tokenizer.decode(&[id], false, false);
                generated_text.push_str(&text);
                yield Ok(GeneratedToken { id, text, batch_id: None });

                finished = stop_now(&self.config, &options, &special_tokens, id, &generated_text, &abort_signal, generated_ids.len() as u32);
            }

            let stats = timer.finish(generated_ids.len() as u32, None);
            *self.stats.borrow_mut() = stats;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generating_guard_resets_flag_on_drop() {
        let flag = AtomicBool::new(true);
        {
            let _guard = GeneratingGuard { flag: &flag };
        }
        assert!(!flag.load(Ordering::SeqCst));
    }

    #[test]
    fn stop_now_detects_stop_token_id() {
        let mut config = test_config();
        config.stop_token_ids = vec![7];
        let options = GenerateOptions::default();
        let special = SpecialTokens::default();
        let abort = AbortSignal::new();
        assert!(stop_now(&config, &options, &special, 7, "", &abort, 1));
    }

    #[test]
    fn stop_now_detects_stop_sequence_suffix() {
        let config = test_config();
        let mut options = GenerateOptions::default();
        options.stop_sequences = vec!["</s>".to_string()];
        let special = SpecialTokens::default();
        let abort = AbortSignal::new();
        assert!(stop_now(&config, &options, &special, 0, "hello</s>", &abort, 1));
    }

    #[test]
    fn stop_now_respects_abort_signal() {
        let config = test_config();
        let options = GenerateOptions::default();
        let special = SpecialTokens::default();
        let abort = AbortSignal::new();
        abort.abort();
        assert!(stop_now(&config, &options, &special, 0, "", &abort, 1));
    }

    #[test]
    fn stop_now_stops_at_max_tokens() {
        let config = test_config();
        let mut options = GenerateOptions::default();
        options.max_tokens = 3;
        let special = SpecialTokens::default();
        let abort = AbortSignal::new();
        assert!(stop_now(&config, &options, &special, 0, "", &abort, 3));
        assert!(!stop_now(&config, &options, &special, 0, "", &abort, 2));
    }

    #[test]
    fn recent_window_clamps_to_available_length() {
        let generated = vec![1, 2, 3];
        assert_eq!(recent_window(&generated, 10), &[1, 2, 3]);
        assert_eq!(recent_window(&generated, 2), &[2, 3]);
        assert_eq!(recent_window(&generated, 0), &[] as &[u32]);
    }

    fn test_config() -> ModelConfig {
        use crate::config::{Activation, RopeConfig};
        ModelConfig {
            num_layers: 1,
            hidden_size: 4,
            intermediate_size: 8,
            num_heads: 1,
            num_kv_heads: 1,
            head_dim: 4,
            vocab_size: 16,
            rms_norm_eps: 1e-6,
            rms_norm_weight_offset: false,
            activation: Activation::Silu,
            rope: RopeConfig { theta: 10000.0, local_theta: None, scaling: None },
            sliding_window: None,
            attention_softcap: None,
            final_logit_softcap: None,
            query_pre_attn_scalar: None,
            query_key_norm: false,
            tied_embeddings: false,
            embedding_vocab_size: None,
            stop_token_ids: vec![],
            layer_attention_types: None,
            moe: None,
            chat_template_tag: None,
        }
    }
}

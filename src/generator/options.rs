//! Generate-time options, resolved from call-time overrides layered on
//! runtime defaults (spec §4.3, §6).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Whether the batched decode path checks for stop conditions once per
/// completed batch or records a per-token stop-flag kernel (spec §4.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopCheckMode {
    Batch,
    PerToken,
}

/// Cooperative abort signal (spec §5 "Cancellation"): checked between
/// yielded tokens, never polled mid-batch.
#[derive(Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-call generation options. Any field a caller leaves at
/// [`GenerateOptions::default`]'s value is still an explicit choice — this
/// crate has no separate "unset" representation, matching spec §6's flat
/// named-option list.
#[derive(Clone, Debug)]
pub struct GenerateOptions {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub repetition_penalty: f32,
    /// Window (in most-recently-generated tokens) the repetition penalty
    /// considers. Not itself a spec §6 named option, but a concrete cutoff
    /// is required to implement "the last `repetition_penalty_window`
    /// generated ids" (spec §4.3 "Repetition penalty").
    pub repetition_penalty_window: usize,
    pub stop_sequences: Vec<String>,
    pub use_chat_template: bool,
    pub batch_size: u32,
    pub stop_check_mode: StopCheckMode,
    pub disable_command_batching: bool,
    pub disable_multi_token_decode: bool,
    pub profile: bool,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_tokens: 256,
            temperature: 1.0,
            top_p: 1.0,
            top_k: 0,
            repetition_penalty: 1.0,
            repetition_penalty_window: 64,
            stop_sequences: Vec::new(),
            use_chat_template: false,
            batch_size: 1,
            stop_check_mode: StopCheckMode::Batch,
            disable_command_batching: false,
            disable_multi_token_decode: false,
            profile: false,
        }
    }
}

/// Below this temperature, sampling takes the deterministic argmax path
/// instead of the stochastic one (spec §4.3 "record argmax (if
/// `temperature < greedy_threshold`)").
pub const GREEDY_THRESHOLD: f32 = 1e-5;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_signal_starts_clear() {
        let signal = AbortSignal::new();
        assert!(!signal.is_aborted());
        signal.abort();
        assert!(signal.is_aborted());
    }

    #[test]
    fn abort_signal_clone_shares_state() {
        let signal = AbortSignal::new();
        let clone = signal.clone();
        clone.abort();
        assert!(signal.is_aborted());
    }
}

//! Error taxonomy for the inference pipeline core.
//!
//! Every variant carries a one-line diagnostic naming the failing
//! sub-component (and layer index, where applicable) per the external
//! interface contract. Recoverable degradations (fused-sample fallback,
//! batched-decode fallback) are *not* represented here — they are internal
//! latch state on [`crate::generator::Generator`] and never escape to the
//! caller.

use thiserror::Error;

/// A GPU kernel dispatch failed: bad dispatch, validation error, or an
/// unsupported dtype combination for the given kernel.
#[derive(Debug, Error)]
#[error("kernel '{kernel}' failed at layer {layer:?}: {reason}")]
pub struct KernelError {
    pub kernel: &'static str,
    pub layer: Option<usize>,
    pub reason: String,
}

impl KernelError {
    pub fn new(kernel: &'static str, reason: impl Into<String>) -> Self {
        Self {
            kernel,
            layer: None,
            reason: reason.into(),
        }
    }

    pub fn at_layer(mut self, layer: usize) -> Self {
        self.layer = Some(layer);
        self
    }
}

/// `ModelConfig` (or another construction-time input) is invalid. Always
/// surfaced on construction, never mid-generation.
#[derive(Debug, Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

impl ConfigError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// A token id passed to `generate`/`prefill` is outside `[0, vocab_size)`.
#[derive(Debug, Error)]
#[error("token id {token_id} is out of range for vocab_size {vocab_size}")]
pub struct TokenRangeError {
    pub token_id: u32,
    pub vocab_size: u32,
}

/// Logits were non-finite or all-zero on both the recorded and unrecorded
/// compute paths — indicates upstream NaN production from attention/matmul.
#[derive(Debug, Error)]
#[error("logits are unhealthy at layer {layer:?} (non-finite or all-zero on both compute paths)")]
pub struct LogitsHealthError {
    pub layer: Option<usize>,
}

/// A second `generate`/`prefill` call arrived while one was already running
/// on this pipeline instance.
#[derive(Debug, Error)]
#[error("a generation is already in progress on this pipeline instance")]
pub struct Busy;

/// `prefill_kv_only` completed but the resulting cache could not be cloned
/// into a [`crate::kv_cache::Snapshot`].
#[derive(Debug, Error)]
#[error("KV cache snapshot unavailable: {0}")]
pub struct SnapshotUnavailable(pub String);

/// Top-level error type returned by the public `Pipeline` surface.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error(transparent)]
    Kernel(#[from] KernelError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    TokenRange(#[from] TokenRangeError),
    #[error(transparent)]
    LogitsHealth(#[from] LogitsHealthError),
    #[error(transparent)]
    Busy(#[from] Busy),
    #[error(transparent)]
    SnapshotUnavailable(#[from] SnapshotUnavailable),
}

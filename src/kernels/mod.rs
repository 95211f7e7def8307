//! `KernelSet`: the external collaborator boundary for individual GPU
//! kernels (matmul, attention, RMSNorm, softmax+top-k, gather, scatter-add,
//! etc. — spec §1's "deliberately out of scope" list). This crate never
//! compiles WGSL; a `KernelSet` implementation owns pipeline creation and
//! bind-group wiring and is handed to the ops layer at construction.
//!
//! The trait's shape — one method per kernel, each taking a [`Dispatcher`]
//! rather than exposing separate run/record entry points — mirrors the
//! teacher's `ShaderDevice::create_compute_pipeline` in spirit (bind-group
//! layouts derived once from a descriptor, reused across dispatches) while
//! dropping everything specific to runtime shader compilation: the teacher
//! resolves `naga` modules and emits WGSL per pipeline (`webgpu/pipeline.rs`
//! `load_shader`), which belongs to the kernel implementations this crate
//! treats as external.

use crate::recorder::Dispatcher;
use crate::tensor::Tensor;
use crate::error::KernelError;

/// Scalar options shared by several kernels (attention, RoPE, softcapping).
/// Grouped here rather than threaded as loose `f32` arguments through every
/// `KernelSet` method, matching the teacher's descriptor-struct style for
/// pipeline creation (`ComputePipelineDesc`, `RenderPipelineDesc`).
#[derive(Clone, Copy, Debug, Default)]
pub struct AttentionOptions {
    pub scale: f32,
    pub softcap: Option<f32>,
    pub sliding_window: Option<u32>,
    pub causal: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RopeOptions {
    pub theta: f32,
    pub position_offset: u32,
}

/// One method per kernel named in spec §4.1. Every method takes the input
/// tensor(s), any weights, scalar options, and a [`Dispatcher`] — absent a
/// recorder the call submits and waits; with one, it appends to the
/// recorder's encoder and returns a tensor tracked for deferred release.
///
/// A `KernelSet` implementation is provided by the embedding application
/// (spec §1's "individual kernel implementations" are out of scope here);
/// `LayerExecutor`, `MoeDispatcher`, and `Generator` are the only callers.
pub trait KernelSet: Send + Sync {
    fn rms_norm(
        &self,
        dispatcher: Dispatcher<'_>,
        input: &Tensor,
        weight: &Tensor,
        eps: f32,
        weight_offset: bool,
    ) -> Result<Tensor, KernelError>;

    fn residual_add(
        &self,
        dispatcher: Dispatcher<'_>,
        a: &Tensor,
        b: &Tensor,
    ) -> Result<Tensor, KernelError>;

    /// General matmul with auto-transpose of `weight` when its layout
    /// requires it (spec §4.1 "Design Notes").
    fn matmul(
        &self,
        dispatcher: Dispatcher<'_>,
        input: &Tensor,
        weight: &Tensor,
        bias: Option<&Tensor>,
    ) -> Result<Tensor, KernelError>;

    /// Gathers rows of `embedding_table` selected by `token_ids` into a
    /// `[n_tokens, hidden_size]` tensor, optionally scaling the result (some
    /// architectures scale embeddings by `sqrt(hidden_size)`). `token_ids`
    /// carries u32 ids bit-reinterpreted as f32, per the same
    /// integer-tensor convention `moe::dispatch` uses for `token_offsets` —
    /// `Tensor` has no integer `DType` to address rows with directly.
    fn embed_tokens(
        &self,
        dispatcher: Dispatcher<'_>,
        token_ids: &Tensor,
        embedding_table: &Tensor,
        embedding_scale: Option<f32>,
    ) -> Result<Tensor, KernelError>;

    fn silu(&self, dispatcher: Dispatcher<'_>, input: &Tensor) -> Result<Tensor, KernelError>;
    fn gelu(&self, dispatcher: Dispatcher<'_>, input: &Tensor) -> Result<Tensor, KernelError>;

    /// Splits a fused `gate_up` activation in half along the last dimension
    /// and computes `activation(gate) ⊙ up` in one dispatch.
    fn silu_row_split(
        &self,
        dispatcher: Dispatcher<'_>,
        gate_up: &Tensor,
        activation: crate::config::Activation,
    ) -> Result<Tensor, KernelError>;

    fn attention(
        &self,
        dispatcher: Dispatcher<'_>,
        query: &Tensor,
        key_cache: &Tensor,
        value_cache: &Tensor,
        options: AttentionOptions,
    ) -> Result<Tensor, KernelError>;

    fn rope(
        &self,
        dispatcher: Dispatcher<'_>,
        input: &Tensor,
        options: RopeOptions,
    ) -> Result<Tensor, KernelError>;

    fn cast(
        &self,
        dispatcher: Dispatcher<'_>,
        input: &Tensor,
        target: crate::tensor::DType,
    ) -> Result<Tensor, KernelError>;

    /// Splits a fused QKV projection into three tensors sized
    /// `q_size`/`k_size`/`v_size` along the last dimension.
    fn split_qkv(
        &self,
        dispatcher: Dispatcher<'_>,
        qkv: &Tensor,
        q_size: u32,
        k_size: u32,
        v_size: u32,
    ) -> Result<(Tensor, Tensor, Tensor), KernelError>;

    /// Fused softmax + top-k over the last dimension, producing per-token
    /// `(indices[top_k], weights[top_k])`.
    fn softmax_top_k(
        &self,
        dispatcher: Dispatcher<'_>,
        logits: &Tensor,
        top_k: u32,
        renormalize: bool,
    ) -> Result<(Tensor, Tensor), KernelError>;

    /// Gathers rows of `input` selected by `token_offsets` into a
    /// contiguous buffer sized for at most `max_tokens_per_expert` rows.
    fn moe_gather(
        &self,
        dispatcher: Dispatcher<'_>,
        input: &Tensor,
        token_offsets: &Tensor,
        max_tokens_per_expert: u32,
    ) -> Result<Tensor, KernelError>;

    /// Scatters `expert_output` rows into a fresh zero-initialized tensor
    /// shaped like `accum`, weighted by `routing_weights`, summing across
    /// the `top_k` experts that share a token (spec §4.4 step 6). `accum`'s
    /// contents are not read — only its `shape`/`dtype` matter, since every
    /// token receives exactly `top_k` contributions and nothing is carried
    /// over from `accum` itself.
    fn scatter_add(
        &self,
        dispatcher: Dispatcher<'_>,
        accum: &Tensor,
        expert_output: &Tensor,
        token_offsets: &Tensor,
        routing_weights: &Tensor,
    ) -> Result<Tensor, KernelError>;

    fn bias_add(
        &self,
        dispatcher: Dispatcher<'_>,
        input: &Tensor,
        bias: &Tensor,
    ) -> Result<Tensor, KernelError>;

    /// Dequantizes an MXFP4 block-quantised weight into `target` dtype.
    fn mxfp4_dequantize(
        &self,
        dispatcher: Dispatcher<'_>,
        packed: &Tensor,
        scales: &Tensor,
        target: crate::tensor::DType,
    ) -> Result<Tensor, KernelError>;

    /// Fused `matmul(input, weight) + residual`.
    fn fused_matmul_residual(
        &self,
        dispatcher: Dispatcher<'_>,
        input: &Tensor,
        weight: &Tensor,
        residual: &Tensor,
    ) -> Result<Tensor, KernelError>;

    /// Fused `RMSNorm(matmul(input, weight)) + residual`, used for the
    /// decode-only fused down+norm+residual FFN path (spec §4.2).
    fn fused_matmul_rmsnorm_residual(
        &self,
        dispatcher: Dispatcher<'_>,
        input: &Tensor,
        weight: &Tensor,
        norm_weight: &Tensor,
        residual: &Tensor,
        eps: f32,
        weight_offset: bool,
    ) -> Result<Tensor, KernelError>;

    /// Samples one token per row of `logits` directly on the GPU
    /// (temperature/top-k/top-p folded into the kernel); used by the
    /// fused-GPU-sample decode fast path. Returns the sampled token ids.
    fn sample(
        &self,
        dispatcher: Dispatcher<'_>,
        logits: &Tensor,
        temperature: f32,
        top_k: u32,
        top_p: f32,
    ) -> Result<Tensor, KernelError>;

    /// Writes `1` into `stop_flags[slot]` when `sampled[slot]` equals one of
    /// `eos_ids` or `position[slot] >= max_tokens`. Used by the batched
    /// decode per-token stop-check path (spec §4.3 step 2).
    fn check_stop(
        &self,
        dispatcher: Dispatcher<'_>,
        sampled: &Tensor,
        position: &Tensor,
        eos_ids: &[u32],
        max_tokens: u32,
    ) -> Result<Tensor, KernelError>;
}

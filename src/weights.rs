//! `WeightStore`: the model-loader collaborator boundary (spec §1, §6). The
//! loader and weight format are out of scope here — this crate only
//! consumes already-loaded GPU-resident weight buffers by name.

use crate::tensor::DType;

/// Memory layout of a weight matrix, set by the loader at load time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WeightLayout {
    RowMajor,
    ColumnMajor,
}

/// An immutable GPU buffer plus the metadata ops need to use it correctly.
/// Weights live for the model's lifetime and are never released during
/// inference (spec §3).
#[derive(Clone, Copy, Debug)]
pub struct WeightBuffer {
    pub buffer: crate::buffer_pool::PoolBuffer,
    pub dtype: DType,
    pub layout: WeightLayout,
    pub shape: crate::tensor::Shape,
}

// `WeightBuffer::into_tensor` is defined in `crate::layer` (it's that
// module's sub-pipelines — attention/ffn/prefill/decode — that consume a
// weight as a plain `Tensor`); this module only owns the storage type.

/// Lookup key for a per-layer weight, e.g. `layer_3.attn.q_proj`.
pub struct WeightKey {
    pub layer: Option<usize>,
    pub name: &'static str,
}

impl WeightKey {
    pub fn global(name: &'static str) -> Self {
        Self { layer: None, name }
    }

    pub fn layer(layer: usize, name: &'static str) -> Self {
        Self {
            layer: Some(layer),
            name,
        }
    }
}

/// Collaborator exposing model weights by name. Embedding and LM-head
/// lookups use fixed names; per-layer weights are addressed by
/// `layer_{i}` plus a sub-name (spec §6).
pub trait WeightStore: Send + Sync {
    /// `None` means the weight is absent — callers distinguish missing
    /// optional weights (Q/K norm, post-attn norm, LoRA adapters) from a
    /// missing mandatory weight, which is a fatal `KernelError` at the call
    /// site (spec §4.2 "Failure semantics").
    fn get(&self, key: &WeightKey) -> Option<WeightBuffer>;

    fn embedding(&self) -> WeightBuffer;
    fn lm_head(&self) -> WeightBuffer;
}

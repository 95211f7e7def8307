//! GPU inference pipeline core for a WebGPU transformer runtime: per-layer
//! forward execution, command batching and buffer lifetime management, and
//! the token generation loop.
//!
//! This crate deliberately stops at the boundary of the GPU kernels
//! themselves — matmul, attention, RoPE, and the rest are an external
//! collaborator implementing [`kernels::KernelSet`], the same way weight
//! storage ([`weights::WeightStore`]) and tokenization
//! ([`tokenizer::Tokenizer`]) are. What lives here is everything that
//! drives those kernels in the right order, batches their GPU commands,
//! and manages the buffers those commands read and write.
//!
//! Start at [`generator::Generator`] for the token generation loop, or
//! [`layer::LayerExecutor`] for a single transformer layer's forward pass.

mod buffer_pool;
mod config;
mod decode_buffers;
mod device;
mod error;
mod generator;
mod kernels;
mod kv_cache;
mod layer;
mod moe;
mod recorder;
mod tensor;
mod tokenizer;
mod weights;

pub use buffer_pool::{BufferPool, PoolBuffer};
pub use config::{
    Activation, AttentionKind, ModelConfig, MoeDescriptor, MoeWeightFormat, RopeConfig, RopeScaling, RopeScalingKind,
};
pub use decode_buffers::DecodeBuffers;
pub use device::{Device, DeviceCapabilities, DeviceInitError, WgpuDevice};
pub use error::{Busy, ConfigError, GenerationError, KernelError, LogitsHealthError, SnapshotUnavailable, TokenRangeError};
pub use generator::{AbortSignal, GenerateOptions, GeneratedToken, GenerationStats, Generator, ModelWeights, StopCheckMode};
pub use kernels::{AttentionOptions, KernelSet, RopeOptions};
pub use kv_cache::{KvCache, KvCacheConfig, Snapshot as KvCacheSnapshot};
pub use layer::plan::{LayerPlan, NormSlot, PlanExecutor, PlanSpec, PlanSpecStep, SlotId, Step};
pub use layer::{AttentionWeights, DenseFfnWeights, FfnWeights, LayerContext, LayerExecutor, LayerWeights, NormVariant};
pub use recorder::{CommandRecorder, Dispatcher};
pub use tensor::{DType, Shape, Tensor};
pub use tokenizer::{SpecialTokens, Tokenizer};
pub use weights::{WeightBuffer, WeightKey, WeightLayout, WeightStore};

//! Mixture-of-Experts FFN: router + dispatcher replacing the dense FFN for
//! layers whose weights include a router (spec §4.4).
//!
//! No direct teacher/pack analog exists for MoE routing (a grep for
//! "moe"/"expert" across the example pack turns up nothing beyond metadata
//! parsing) — this module is built directly from spec semantics, reusing
//! this crate's own established idioms: the dense FFN's gather/compute/
//! combine shape (`layer::ffn`), the raw-`wgpu`-copy pattern for writing
//! into a sub-range of a shared buffer (`kv_cache.rs`), and the buffer
//! pool's `RwLock`-guarded central-store shape (`buffer_pool.rs`) for the
//! dequantisation cache.
//!
//! **Simplification from the spec's on-demand loading**: spec §4.4 step 5
//! says "ensure its weights are loaded (on-demand, memoised...)" per
//! expert. This crate's `WeightStore` lookups are cheap handle fetches (the
//! loader already placed every weight on the GPU before `LayerWeights::load`
//! runs), so there's no meaningful "not yet loaded" state to memoize for
//! the weight *handles* themselves — `MoeWeights::load` fetches every
//! expert's handles eagerly, once, here. The genuinely expensive on-demand
//! step the spec is pointing at is MXFP4 *dequantisation*, which this
//! module keeps lazy (first use) and memoised via [`expert_cache`].

pub mod dispatch;
mod expert_cache;
mod router;

use crate::config::{MoeDescriptor, MoeWeightFormat, ModelConfig};
use crate::error::KernelError;
use crate::layer::{optional_weight, require_weight};
use crate::weights::{WeightBuffer, WeightKey, WeightStore};

use expert_cache::ExpertCache;

/// Bound on simultaneously-cached dequantised `(gate_up, down)` pairs per
/// MoE layer. A full layer's expert count is typically much larger (8-128),
/// so this is meant to hold only the experts active across a handful of
/// recent tokens/steps, not the whole layer.
const DEFAULT_EXPERT_CACHE_CAPACITY: usize = 8;

#[derive(Clone, Copy)]
pub enum ExpertWeights {
    Dense {
        gate_up: Option<WeightBuffer>,
        gate: Option<WeightBuffer>,
        up: Option<WeightBuffer>,
        down: WeightBuffer,
    },
    Mxfp4 {
        gate_up_packed: WeightBuffer,
        gate_up_scales: WeightBuffer,
        gate_up_bias: Option<WeightBuffer>,
        down_packed: WeightBuffer,
        down_scales: WeightBuffer,
        down_bias: Option<WeightBuffer>,
    },
}

impl ExpertWeights {
    fn load(
        store: &dyn WeightStore,
        layer: usize,
        expert: u32,
        format: MoeWeightFormat,
    ) -> Result<Self, KernelError> {
        match format {
            MoeWeightFormat::DensePerExpert => {
                let gate_up = optional_weight(store, layer, expert_name(expert, "gate_up_proj"));
                let (gate, up) = if gate_up.is_none() {
                    (
                        Some(require_weight(store, layer, expert_name(expert, "gate_proj"))?),
                        Some(require_weight(store, layer, expert_name(expert, "up_proj"))?),
                    )
                } else {
                    (None, None)
                };
                Ok(ExpertWeights::Dense {
                    gate_up,
                    gate,
                    up,
                    down: require_weight(store, layer, expert_name(expert, "down_proj"))?,
                })
            }
            MoeWeightFormat::Mxfp4Fused => Ok(ExpertWeights::Mxfp4 {
                gate_up_packed: require_weight(store, layer, expert_name(expert, "gate_up_proj.packed"))?,
                gate_up_scales: require_weight(store, layer, expert_name(expert, "gate_up_proj.scales"))?,
                gate_up_bias: optional_weight(store, layer, expert_name(expert, "gate_up_proj.bias")),
                down_packed: require_weight(store, layer, expert_name(expert, "down_proj.packed"))?,
                down_scales: require_weight(store, layer, expert_name(expert, "down_proj.scales"))?,
                down_bias: optional_weight(store, layer, expert_name(expert, "down_proj.bias")),
            }),
        }
    }
}

/// Leaks a bounded, load-time-only string to satisfy `WeightKey`'s
/// `&'static str` name convention for dynamically-numbered per-expert
/// weight names. Called at most `num_experts` times per MoE layer, once at
/// model load — not a hot-path allocation.
fn expert_name(expert: u32, suffix: &str) -> &'static str {
    Box::leak(format!("expert{expert}.{suffix}").into_boxed_str())
}

/// All weights for one MoE layer: the router plus every expert's weight
/// handles, looked up once via [`WeightStore`] (spec §4.4).
pub struct MoeWeights {
    pub router_weight: WeightBuffer,
    pub router_bias: Option<WeightBuffer>,
    pub experts: Vec<ExpertWeights>,
    pub descriptor: MoeDescriptor,
    pub layer_idx: usize,
    expert_cache: ExpertCache,
}

impl MoeWeights {
    /// Returns `Ok(None)` when `layer` is not an MoE layer (no `moe`
    /// descriptor on `config`, or no `router_weight` present for this
    /// layer) — layers are resolved individually from weight presence per
    /// the Architectural Variants design note, not from a single
    /// model-wide MoE/dense split.
    pub fn load(store: &dyn WeightStore, config: &ModelConfig, layer: usize) -> Result<Option<Self>, KernelError> {
        let descriptor = match config.moe {
            Some(d) => d,
            None => return Ok(None),
        };
        if store.get(&WeightKey::layer(layer, "router_weight")).is_none() {
            return Ok(None);
        }

        let router_weight = require_weight(store, layer, "router_weight")?;
        let router_bias = if descriptor.router_has_bias {
            Some(require_weight(store, layer, "router_bias")?)
        } else {
            None
        };

        let experts = (0..descriptor.num_experts)
            .map(|e| ExpertWeights::load(store, layer, e, descriptor.weight_format))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(Self {
            router_weight,
            router_bias,
            experts,
            descriptor,
            layer_idx: layer,
            expert_cache: ExpertCache::new(DEFAULT_EXPERT_CACHE_CAPACITY),
        }))
    }
}

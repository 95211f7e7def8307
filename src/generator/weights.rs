//! `ModelWeights`: every weight handle the generator needs, looked up once
//! via [`WeightStore`] at construction and reused for every call (spec §4.3
//! data flow: `embed → [layer × N] → final_norm → lm_head`).

use crate::error::KernelError;
use crate::layer::LayerWeights;
use crate::weights::{WeightBuffer, WeightKey, WeightStore};

pub struct ModelWeights {
    pub embedding: WeightBuffer,
    pub final_norm: WeightBuffer,
    pub lm_head: WeightBuffer,
    pub layers: Vec<LayerWeights>,
}

impl ModelWeights {
    pub fn load(store: &dyn WeightStore, config: &crate::config::ModelConfig) -> Result<Self, KernelError> {
        let final_norm = store.get(&WeightKey::global("final_norm")).ok_or_else(|| {
            KernelError::new("weight_lookup", "missing mandatory global weight 'final_norm'")
        })?;
        let layers = (0..config.num_layers as usize)
            .map(|layer| LayerWeights::load(store, config, layer))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            embedding: store.embedding(),
            final_norm,
            lm_head: store.lm_head(),
            layers,
        })
    }
}

//! The fully resolved, immutable description of model shape and behavior.
//!
//! `ModelConfig` is produced by an external loader (out of scope here, per
//! spec §1) and validated exactly once, at construction — never mid
//! generation, per §7.

use crate::error::ConfigError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Activation {
    Silu,
    Gelu,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AttentionKind {
    Full,
    Sliding,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RopeScalingKind {
    Linear,
    Yarn,
}

#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RopeScaling {
    pub kind: RopeScalingKind,
    pub factor: f32,
    pub beta_fast: Option<f32>,
    pub beta_slow: Option<f32>,
    pub original_max_position_embeddings: Option<u32>,
}

/// RoPE configuration, including the dual-theta (local/global) variant used
/// for models that mix sliding and full attention layers.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RopeConfig {
    pub theta: f32,
    /// Theta used for `sliding` layers when the model distinguishes local
    /// from global rotary frequencies (e.g. Gemma 3). `None` means the same
    /// `theta` is used for every layer.
    pub local_theta: Option<f32>,
    pub scaling: Option<RopeScaling>,
}

/// Weight-format variant for a Mixture-of-Experts FFN layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MoeWeightFormat {
    /// Independent dense `gate`/`up`/`down` matrices per expert.
    DensePerExpert,
    /// MXFP4 block-quantised fused `gate_up` plus per-expert bias
    /// (GPT-OSS style).
    Mxfp4Fused,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MoeDescriptor {
    pub num_experts: u32,
    pub top_k: u32,
    pub renormalize_routing_weights: bool,
    pub router_has_bias: bool,
    pub weight_format: MoeWeightFormat,
}

/// The fully resolved, immutable description of model shape and behavior.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct ModelConfig {
    pub num_layers: u32,
    pub hidden_size: u32,
    pub intermediate_size: u32,
    pub num_heads: u32,
    pub num_kv_heads: u32,
    pub head_dim: u32,
    pub vocab_size: u32,
    pub rms_norm_eps: f32,
    /// Gemma-family variant: RMSNorm weights are applied as `1 + w` instead
    /// of `w`.
    pub rms_norm_weight_offset: bool,
    pub activation: Activation,
    pub rope: RopeConfig,
    pub sliding_window: Option<u32>,
    pub attention_softcap: Option<f32>,
    pub final_logit_softcap: Option<f32>,
    /// Scale applied before the softmax in scaled-dot-product attention.
    /// `scale = 1 / sqrt(query_pre_attn_scalar)`; defaults to `head_dim`
    /// when `None`.
    pub query_pre_attn_scalar: Option<f32>,
    pub query_key_norm: bool,
    pub tied_embeddings: bool,
    /// Vocab size of the LM head weight, when it differs from `vocab_size`
    /// (tied embeddings with a truncated output projection).
    pub embedding_vocab_size: Option<u32>,
    pub stop_token_ids: Vec<u32>,
    /// Per-layer attention type, indexed by layer. `None` means every layer
    /// is `Full`.
    pub layer_attention_types: Option<Vec<AttentionKind>>,
    pub moe: Option<MoeDescriptor>,
    pub chat_template_tag: Option<String>,
}

impl ModelConfig {
    /// Validate internal consistency. Called once by the external loader
    /// immediately after construction; never called again during
    /// generation, per the error-propagation policy in spec §7.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_layers == 0 {
            return Err(ConfigError::new("num_layers must be > 0"));
        }
        if self.hidden_size == 0 || self.intermediate_size == 0 {
            return Err(ConfigError::new("hidden_size/intermediate_size must be > 0"));
        }
        if self.num_heads == 0 || self.num_kv_heads == 0 {
            return Err(ConfigError::new("num_heads/num_kv_heads must be > 0"));
        }
        if self.num_heads % self.num_kv_heads != 0 {
            return Err(ConfigError::new(format!(
                "num_heads ({}) must be a multiple of num_kv_heads ({})",
                self.num_heads, self.num_kv_heads
            )));
        }
        if self.head_dim == 0 {
            return Err(ConfigError::new("head_dim must be > 0"));
        }
        if self.head_dim * self.num_heads != self.hidden_size {
            return Err(ConfigError::new(format!(
                "head_dim ({}) * num_heads ({}) must equal hidden_size ({})",
                self.head_dim, self.num_heads, self.hidden_size
            )));
        }
        if self.vocab_size == 0 {
            return Err(ConfigError::new("vocab_size must be > 0"));
        }
        if self.rms_norm_eps <= 0.0 {
            return Err(ConfigError::new("rms_norm_eps must be > 0"));
        }
        if let Some(embed_vocab) = self.embedding_vocab_size {
            if embed_vocab > self.vocab_size {
                return Err(ConfigError::new(
                    "embedding_vocab_size cannot exceed vocab_size",
                ));
            }
        }
        if let Some(ref types) = self.layer_attention_types {
            if types.len() != self.num_layers as usize {
                return Err(ConfigError::new(format!(
                    "layer_attention_types has {} entries, expected num_layers ({})",
                    types.len(),
                    self.num_layers
                )));
            }
            if types.contains(&AttentionKind::Sliding) && self.sliding_window.is_none() {
                return Err(ConfigError::new(
                    "sliding attention layers configured but sliding_window is unset",
                ));
            }
        }
        if let Some(moe) = self.moe {
            if moe.num_experts == 0 {
                return Err(ConfigError::new("moe.num_experts must be > 0"));
            }
            if moe.top_k == 0 || moe.top_k > moe.num_experts {
                return Err(ConfigError::new(
                    "moe.top_k must be in [1, num_experts]",
                ));
            }
        }
        if let Some(scaling) = self.rope.scaling {
            if scaling.factor <= 0.0 {
                return Err(ConfigError::new("rope scaling factor must be > 0"));
            }
        }
        Ok(())
    }

    /// Attention type for `layer_idx`, defaulting to `Full` when the model
    /// does not distinguish per-layer attention types.
    pub fn attention_kind(&self, layer_idx: usize) -> AttentionKind {
        match &self.layer_attention_types {
            Some(types) => types[layer_idx],
            None => AttentionKind::Full,
        }
    }

    /// Effective LM-head vocab size (may be smaller than `vocab_size` under
    /// tied embeddings with a truncated output projection).
    pub fn lm_head_vocab_size(&self) -> u32 {
        self.embedding_vocab_size.unwrap_or(self.vocab_size)
    }

    /// `1/sqrt(query_pre_attn_scalar)`, defaulting to `1/sqrt(head_dim)`.
    pub fn attention_scale(&self) -> f32 {
        let scalar = self.query_pre_attn_scalar.unwrap_or(self.head_dim as f32);
        1.0 / scalar.sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ModelConfig {
        ModelConfig {
            num_layers: 2,
            hidden_size: 8,
            intermediate_size: 16,
            num_heads: 2,
            num_kv_heads: 2,
            head_dim: 4,
            vocab_size: 32,
            rms_norm_eps: 1e-6,
            rms_norm_weight_offset: false,
            activation: Activation::Silu,
            rope: RopeConfig {
                theta: 10000.0,
                local_theta: None,
                scaling: None,
            },
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

    #[test]
    fn validates_a_well_formed_config() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn rejects_head_mismatch() {
        let mut cfg = base_config();
        cfg.num_kv_heads = 3;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_head_dim_mismatch() {
        let mut cfg = base_config();
        cfg.head_dim = 5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_sliding_without_window() {
        let mut cfg = base_config();
        cfg.layer_attention_types = Some(vec![AttentionKind::Sliding, AttentionKind::Full]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn default_attention_scale_uses_head_dim() {
        let cfg = base_config();
        assert!((cfg.attention_scale() - 0.5).abs() < 1e-6);
    }
}

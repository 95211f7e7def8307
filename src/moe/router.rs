//! Router: per-token top-k expert selection (spec §4.4 steps 1-2).

use crate::error::KernelError;
use crate::layer::{reborrow, LayerContext};
use crate::recorder::Dispatcher;
use crate::tensor::Tensor;

use super::MoeWeights;

/// `logits = x · gate_weight [+ bias]`, then a fused softmax+top-k over the
/// expert dimension, returning per-token `(indices[top_k], weights[top_k])`
/// as GPU tensors — `indices` still needs a CPU readback downstream (see
/// `moe::dispatch`) to build `token_offsets`, but stays on the GPU here
/// since the fused kernel itself runs there.
pub fn route(
    mut dispatcher: Dispatcher<'_>,
    ctx: &mut LayerContext<'_>,
    weights: &MoeWeights,
    ffn_input: &Tensor,
) -> Result<(Tensor, Tensor), KernelError> {
    let bias = weights.router_bias.map(|b| b.into_tensor());
    let logits = ctx.kernels.matmul(
        reborrow(&mut dispatcher),
        ffn_input,
        &weights.router_weight.into_tensor(),
        bias.as_ref(),
    )?;
    ctx.kernels.softmax_top_k(
        dispatcher,
        &logits,
        weights.descriptor.top_k,
        weights.descriptor.renormalize_routing_weights,
    )
}

//! Declarative, refcounted alternative to [`super::LayerExecutor::forward`]:
//! a compiled, JSON-driven step list describing named buffer slots and a
//! small set of ops — `save`, `load`, `attention`, `rmsnorm`, `ffn`,
//! `residual_add`, `noop` (spec §4.2 "Layer pipeline plan", Design Notes'
//! "JSON-driven layer pipeline plan").
//!
//! No teacher/pack analog exists for an op-plan IR (`blade-graphics` has no
//! such concept); the refcounted-slot ownership model instead generalises
//! this crate's own three-owner buffer model (`buffer_pool.rs`) to per-slot
//! demand counts computed once at compile time, and step execution reuses
//! `LayerExecutor`'s own primitives (`attention::run`, `ffn::run`,
//! `KernelSet::rms_norm`/`residual_add`) rather than reimplementing them.

use std::collections::HashMap;

use crate::buffer_pool::PoolBuffer;
use crate::error::{ConfigError, KernelError};
use crate::recorder::Dispatcher;
use crate::tensor::Tensor;

use super::{attention, ffn, reborrow, LayerContext, LayerWeights};

/// Opaque handle to a named slot, resolved from the JSON plan's string names
/// at [`LayerPlan::compile`] time. `STATE` and `RESIDUAL` are always present
/// and reserved; every other slot is one a compiled plan declares itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotId(u32);

impl SlotId {
    pub const STATE: SlotId = SlotId(0);
    pub const RESIDUAL: SlotId = SlotId(1);
}

/// Which of a layer's (up to four) RMSNorm weights a `rmsnorm` step applies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormSlot {
    Input,
    PostAttn,
    PreFfn,
    PostFfn,
}

/// One typed step of a compiled plan. Resolved from [`PlanSpecStep`]'s
/// string-keyed JSON form by [`LayerPlan::compile`].
#[derive(Clone, Copy, Debug)]
pub enum Step {
    /// Aliases `from`'s current buffer into `into` (shares the backing
    /// `PoolBuffer`; no data copy, no read consumed). `save` and `load` are
    /// the same aliasing operation under two names, distinguished only by
    /// authored intent — stash a value now for later retrieval, or bring an
    /// earlier-stashed value back as the active input to subsequent steps.
    Save { from: SlotId, into: SlotId },
    Load { from: SlotId, into: SlotId },
    /// Runs attention including its trailing `[post_attn_norm] + residual`,
    /// matching `attention::run`'s contract.
    Attention { input: SlotId, residual: SlotId, output: SlotId },
    RmsNorm { input: SlotId, norm: NormSlot, output: SlotId },
    /// Runs the layer's FFN (dense or MoE) including its trailing
    /// `[norm] + residual`, matching `ffn::run`'s contract.
    Ffn { input: SlotId, residual: SlotId, output: SlotId },
    ResidualAdd { a: SlotId, b: SlotId, output: SlotId },
    Noop,
}

impl Step {
    /// Slots this step reads, used at compile time to precompute each
    /// slot's total read demand.
    fn inputs(&self) -> [Option<SlotId>; 2] {
        match *self {
            Step::Save { from, .. } => [Some(from), None],
            Step::Load { from, .. } => [Some(from), None],
            Step::Attention { input, residual, .. } => [Some(input), Some(residual)],
            Step::RmsNorm { input, .. } => [Some(input), None],
            Step::Ffn { input, residual, .. } => [Some(input), Some(residual)],
            Step::ResidualAdd { a, b, .. } => [Some(a), Some(b)],
            Step::Noop => [None, None],
        }
    }
}

/// JSON-deserializable plan description: named slots and steps referencing
/// them by name (spec §4.2's "JSON-driven step list"). Compiled once into a
/// [`LayerPlan`] before use — `steps`' slot names need not be predeclared,
/// they're discovered as they're referenced.
#[derive(serde::Deserialize)]
pub struct PlanSpec {
    pub steps: Vec<PlanSpecStep>,
    pub output: String,
}

#[derive(serde::Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PlanSpecStep {
    Save { from: String, into: String },
    Load { from: String, into: String },
    Attention { input: String, residual: String, output: String },
    Rmsnorm { input: String, norm: NormSlot, output: String },
    Ffn { input: String, residual: String, output: String },
    ResidualAdd { a: String, b: String, output: String },
    Noop,
}

/// A compiled plan: typed [`Step`]s plus each slot's precomputed read
/// demand, ready for repeated execution by [`PlanExecutor`].
pub struct LayerPlan {
    steps: Vec<Step>,
    /// Number of times each slot is read across `steps`. Slots that are
    /// written but never read (including, legitimately, `output`) are
    /// simply absent here and treated as demand `0`.
    demand: HashMap<SlotId, u32>,
    output: SlotId,
}

impl LayerPlan {
    /// Resolves `spec`'s string slot names to [`SlotId`]s and precomputes
    /// read-demand per slot. Fails if `output` is never the target of any
    /// step (an authoring error — the plan would have nothing to return).
    pub fn compile(spec: &PlanSpec) -> Result<Self, ConfigError> {
        let mut names: HashMap<String, SlotId> = HashMap::new();
        names.insert("state".to_string(), SlotId::STATE);
        names.insert("residual".to_string(), SlotId::RESIDUAL);
        let mut next_id = 2u32;

        fn resolve(name: &str, names: &mut HashMap<String, SlotId>, next_id: &mut u32) -> SlotId {
            if let Some(&id) = names.get(name) {
                return id;
            }
            let id = SlotId(*next_id);
            *next_id += 1;
            names.insert(name.to_string(), id);
            id
        }

        let steps: Vec<Step> = spec
            .steps
            .iter()
            .map(|s| match s {
                PlanSpecStep::Save { from, into } => Step::Save {
                    from: resolve(from, &mut names, &mut next_id),
                    into: resolve(into, &mut names, &mut next_id),
                },
                PlanSpecStep::Load { from, into } => Step::Load {
                    from: resolve(from, &mut names, &mut next_id),
                    into: resolve(into, &mut names, &mut next_id),
                },
                PlanSpecStep::Attention { input, residual, output } => Step::Attention {
                    input: resolve(input, &mut names, &mut next_id),
                    residual: resolve(residual, &mut names, &mut next_id),
                    output: resolve(output, &mut names, &mut next_id),
                },
                PlanSpecStep::Rmsnorm { input, norm, output } => Step::RmsNorm {
                    input: resolve(input, &mut names, &mut next_id),
                    norm: *norm,
                    output: resolve(output, &mut names, &mut next_id),
                },
                PlanSpecStep::Ffn { input, residual, output } => Step::Ffn {
                    input: resolve(input, &mut names, &mut next_id),
                    residual: resolve(residual, &mut names, &mut next_id),
                    output: resolve(output, &mut names, &mut next_id),
                },
                PlanSpecStep::ResidualAdd { a, b, output } => Step::ResidualAdd {
                    a: resolve(a, &mut names, &mut next_id),
                    b: resolve(b, &mut names, &mut next_id),
                    output: resolve(output, &mut names, &mut next_id),
                },
                PlanSpecStep::Noop => Step::Noop,
            })
            .collect();

        let output = *names
            .get(&spec.output)
            .ok_or_else(|| ConfigError::new(format!("plan: output slot '{}' is never written", spec.output)))?;

        let mut demand: HashMap<SlotId, u32> = HashMap::new();
        for step in &steps {
            for input in step.inputs().into_iter().flatten() {
                *demand.entry(input).or_insert(0) += 1;
            }
        }

        Ok(Self { steps, demand, output })
    }
}

/// Runtime slot storage for one [`PlanExecutor::run`] call: the current
/// tensor bound to each slot, plus a refcount keyed by the underlying
/// `PoolBuffer` (not by `SlotId`) — two slots aliasing the same buffer via
/// `save`/`load` share one count, so releasing through one alias can't free
/// a buffer another alias still names.
struct SlotTable {
    tensors: HashMap<SlotId, Tensor>,
    buffer_refs: HashMap<PoolBuffer, u32>,
}

impl SlotTable {
    fn new() -> Self {
        Self {
            tensors: HashMap::new(),
            buffer_refs: HashMap::new(),
        }
    }

    /// Binds `tensor` to `slot`. `extra_demand` adds on top of the slot's
    /// compiled read count — used only to protect `STATE`/`RESIDUAL` with
    /// one implicit reference on behalf of the caller, who keeps its own
    /// handle to `hidden_states` beyond this call.
    fn put(&mut self, plan: &LayerPlan, slot: SlotId, tensor: Tensor, extra_demand: u32) {
        let demand = plan.demand.get(&slot).copied().unwrap_or(0) + extra_demand;
        *self.buffer_refs.entry(tensor.buffer).or_insert(0) += demand;
        self.tensors.insert(slot, tensor);
    }

    /// Reads `slot`'s current tensor, consuming one unit of its buffer's
    /// shared refcount. Releases (or tracks) the buffer the instant the
    /// count reaches zero — the only place a plan step's intermediate
    /// buffer is freed on the success path.
    fn take(&mut self, device: &dyn crate::device::Device, dispatcher: &mut Dispatcher<'_>, slot: SlotId) -> Tensor {
        let tensor = self
            .tensors
            .get(&slot)
            .unwrap_or_else(|| panic!("plan: slot {slot:?} read before it was written"))
            .clone();
        let count = self
            .buffer_refs
            .get_mut(&tensor.buffer)
            .expect("plan: buffer_refs missing an entry for a bound slot");
        *count -= 1;
        if *count == 0 {
            release_or_track(device, dispatcher, tensor.buffer);
        }
        tensor
    }

    /// Mid-plan exception cleanup pass (spec §4.2, Design Notes' "JSON-driven
    /// layer pipeline plan": "on exception mid-plan, any slot-held
    /// non-`state` buffers must be released or tracked so the pool does not
    /// leak"). Releases every buffer still holding a positive refcount
    /// except those in `protected`.
    ///
    /// This crate protects both `state` and `residual`, not only `state` as
    /// the spec's wording literally singles out — see DESIGN.md's Open
    /// Question on plan exception cleanup scope: both slots are seeded from
    /// the same externally-owned `hidden_states` buffer the caller still
    /// holds, so releasing either on a partial-plan failure would free a
    /// buffer the caller has not relinquished.
    fn release_live(&mut self, device: &dyn crate::device::Device, dispatcher: &mut Dispatcher<'_>, protected: &[PoolBuffer]) {
        for (&buffer, &count) in self.buffer_refs.iter() {
            if count > 0 && !protected.contains(&buffer) {
                release_or_track(device, dispatcher, buffer);
            }
        }
    }
}

fn release_or_track(device: &dyn crate::device::Device, dispatcher: &mut Dispatcher<'_>, buffer: PoolBuffer) {
    match dispatcher {
        Dispatcher::Immediate => device.buffer_pool().release(buffer),
        Dispatcher::Recording(recorder) => recorder.track(device.buffer_pool(), buffer),
    }
}

/// Executes a compiled [`LayerPlan`] against one layer's weights and input
/// state, implementing the same `input_norm -> attention -> residual ->
/// ffn_norm -> ffn -> residual` contract as [`super::LayerExecutor::forward`],
/// but driven by the plan's step list instead of hardcoded control flow.
pub struct PlanExecutor;

impl PlanExecutor {
    pub fn run(
        plan: &LayerPlan,
        mut dispatcher: Dispatcher<'_>,
        ctx: &mut LayerContext<'_>,
        weights: &LayerWeights,
        hidden_states: &Tensor,
    ) -> Result<Tensor, KernelError> {
        let mut slots = SlotTable::new();
        // STATE and RESIDUAL both start bound to the caller-owned
        // hidden_states buffer; the extra demand unit each keeps their
        // shared refcount above zero even once every step that reads them
        // has run, since the caller retains its own reference afterward.
        slots.put(plan, SlotId::STATE, hidden_states.clone(), 1);
        slots.put(plan, SlotId::RESIDUAL, hidden_states.clone(), 1);

        match Self::run_steps(plan, &mut slots, &mut dispatcher, ctx, weights) {
            Ok(()) => Ok(slots
                .tensors
                .get(&plan.output)
                .unwrap_or_else(|| panic!("plan: output slot {:?} was never written", plan.output))
                .clone()),
            Err(e) => {
                slots.release_live(ctx.device, &mut dispatcher, &[hidden_states.buffer]);
                Err(e)
            }
        }
    }

    fn run_steps(
        plan: &LayerPlan,
        slots: &mut SlotTable,
        dispatcher: &mut Dispatcher<'_>,
        ctx: &mut LayerContext<'_>,
        weights: &LayerWeights,
    ) -> Result<(), KernelError> {
        let eps = ctx.config.rms_norm_eps;
        let weight_offset = ctx.config.rms_norm_weight_offset;

        for step in &plan.steps {
            match *step {
                Step::Save { from, into } | Step::Load { from, into } => {
                    let tensor = slots
                        .tensors
                        .get(&from)
                        .unwrap_or_else(|| panic!("plan: slot {from:?} read before it was written"))
                        .clone();
                    // Aliasing binds a second name to the same buffer; it
                    // does not consume `from`'s own read demand.
                    slots.put(plan, into, tensor, 0);
                }
                Step::Attention { input, residual, output } => {
                    let input_tensor = slots.take(ctx.device, dispatcher, input);
                    let residual_tensor = slots.take(ctx.device, dispatcher, residual);
                    let out = attention::run(
                        reborrow(dispatcher),
                        ctx,
                        &weights.attention,
                        &input_tensor,
                        &residual_tensor,
                        weights.post_attn_norm.as_ref(),
                    )
                    .map_err(|e| e.at_layer(ctx.layer_idx))?;
                    slots.put(plan, output, out, 0);
                }
                Step::RmsNorm { input, norm, output } => {
                    let input_tensor = slots.take(ctx.device, dispatcher, input);
                    let norm_weight = match norm {
                        NormSlot::Input => &weights.input_norm,
                        NormSlot::PostAttn => weights
                            .post_attn_norm
                            .as_ref()
                            .expect("plan: rmsnorm step references absent post_attn_norm weight"),
                        NormSlot::PreFfn => &weights.pre_ffn_norm,
                        NormSlot::PostFfn => weights
                            .post_ffn_norm
                            .as_ref()
                            .expect("plan: rmsnorm step references absent post_ffn_norm weight"),
                    };
                    let out = ctx
                        .kernels
                        .rms_norm(reborrow(dispatcher), &input_tensor, &norm_weight.into_tensor(), eps, weight_offset)
                        .map_err(|e| e.at_layer(ctx.layer_idx))?;
                    slots.put(plan, output, out, 0);
                }
                Step::Ffn { input, residual, output } => {
                    let input_tensor = slots.take(ctx.device, dispatcher, input);
                    let residual_tensor = slots.take(ctx.device, dispatcher, residual);
                    let out = ffn::run(
                        reborrow(dispatcher),
                        ctx,
                        &weights.ffn,
                        &input_tensor,
                        &residual_tensor,
                        weights.post_ffn_norm.as_ref(),
                    )
                    .map_err(|e| e.at_layer(ctx.layer_idx))?;
                    slots.put(plan, output, out, 0);
                }
                Step::ResidualAdd { a, b, output } => {
                    let a_tensor = slots.take(ctx.device, dispatcher, a);
                    let b_tensor = slots.take(ctx.device, dispatcher, b);
                    let out = ctx
                        .kernels
                        .residual_add(reborrow(dispatcher), &a_tensor, &b_tensor)
                        .map_err(|e| e.at_layer(ctx.layer_idx))?;
                    slots.put(plan, output, out, 0);
                }
                Step::Noop => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(op: &str) -> String {
        op.to_string()
    }

    #[test]
    fn compile_resolves_reserved_and_temp_slot_names() {
        let spec = PlanSpec {
            steps: vec![
                PlanSpecStep::Rmsnorm {
                    input: step("state"),
                    norm: NormSlot::Input,
                    output: step("normed"),
                },
                PlanSpecStep::Attention {
                    input: step("normed"),
                    residual: step("residual"),
                    output: step("after_attn"),
                },
            ],
            output: step("after_attn"),
        };
        let plan = LayerPlan::compile(&spec).expect("valid plan compiles");
        assert_eq!(plan.steps.len(), 2);
        // `state` and `residual` are each read exactly once.
        assert_eq!(plan.demand.get(&SlotId::STATE), Some(&1));
        assert_eq!(plan.demand.get(&SlotId::RESIDUAL), Some(&1));
    }

    #[test]
    fn compile_rejects_unwritten_output() {
        let spec = PlanSpec {
            steps: vec![PlanSpecStep::Noop],
            output: step("never_written"),
        };
        assert!(LayerPlan::compile(&spec).is_err());
    }

    #[test]
    fn save_and_load_alias_without_consuming_a_read() {
        let spec = PlanSpec {
            steps: vec![
                PlanSpecStep::Save {
                    from: step("state"),
                    into: step("stashed"),
                },
                PlanSpecStep::Load {
                    from: step("stashed"),
                    into: step("restored"),
                },
            ],
            output: step("restored"),
        };
        let plan = LayerPlan::compile(&spec).expect("valid plan compiles");
        // `state` is read once (by the `save` step); `stashed` is read once
        // (by the `load` step); neither aliasing step itself adds demand
        // beyond the single read each performs.
        assert_eq!(plan.demand.get(&SlotId::STATE), Some(&1));
    }
}

//! CPU reference sampling path (spec §4.3 "Sampling (CPU reference)",
//! "Repetition penalty"). Pure functions over a logits slice so they're
//! testable without a device.

use rand::Rng;

/// Standard repetition penalty: tokens in `recent_tokens` have their logit
/// divided by `penalty` if positive, multiplied by `penalty` if negative
/// (spec §4.3). A no-op when `penalty == 1.0`.
pub fn apply_repetition_penalty(logits: &mut [f32], recent_tokens: &[u32], penalty: f32) {
    if penalty == 1.0 {
        return;
    }
    for &id in recent_tokens {
        let Some(logit) = logits.get_mut(id as usize) else {
            continue;
        };
        if *logit > 0.0 {
            *logit /= penalty;
        } else {
            *logit *= penalty;
        }
    }
}

fn argmax(logits: &[f32]) -> u32 {
    logits
        .iter()
        .enumerate()
        .fold((0usize, f32::NEG_INFINITY), |(best_i, best_v), (i, &v)| {
            if v > best_v {
                (i, v)
            } else {
                (best_i, best_v)
            }
        })
        .0 as u32
}

fn softmax_inplace(xs: &mut [f32]) {
    let max = xs.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for x in xs.iter_mut() {
        *x = (*x - max).exp();
        sum += *x;
    }
    if sum > 0.0 {
        for x in xs.iter_mut() {
            *x /= sum;
        }
    }
}

/// CPU reference sampling (spec §4.3):
/// 1. mask `pad` with `-inf`;
/// 2. `temperature == 0` returns the argmax;
/// 3. otherwise scale by `1/temperature`, softmax, sort descending, keep
///    top-k (if `top_k > 0`), keep the smallest prefix whose cumulative
///    probability reaches `top_p`, renormalise (uniform over candidates if
///    the remaining mass is zero), and sample by inverse CDF.
///
/// `logits` is mutated (the pad mask is applied in place); callers that
/// need the original values should clone first.
pub fn sample_cpu(logits: &mut [f32], pad: Option<u32>, temperature: f32, top_k: u32, top_p: f32, rng: &mut impl Rng) -> u32 {
    if let Some(pad) = pad {
        if let Some(l) = logits.get_mut(pad as usize) {
            *l = f32::NEG_INFINITY;
        }
    }

    if temperature == 0.0 {
        return argmax(logits);
    }

    let inv_temperature = 1.0 / temperature;
    let mut probs: Vec<f32> = logits.iter().map(|&l| l * inv_temperature).collect();
    softmax_inplace(&mut probs);

    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| probs[b].partial_cmp(&probs[a]).expect("sampling: logits must not contain NaN"));
    if top_k > 0 {
        order.truncate(top_k as usize);
    }

    let top_p = top_p.clamp(f32::MIN_POSITIVE, 1.0);
    let mut cumulative = 0.0f32;
    let mut cutoff = order.len();
    for (i, &idx) in order.iter().enumerate() {
        cumulative += probs[idx];
        if cumulative >= top_p {
            cutoff = i + 1;
            break;
        }
    }
    order.truncate(cutoff.max(1));

    let total: f32 = order.iter().map(|&i| probs[i]).sum();
    if total <= 0.0 {
        let pick = rng.gen_range(0..order.len());
        return order[pick] as u32;
    }

    let target = rng.gen::<f32>() * total;
    let mut acc = 0.0f32;
    for &idx in &order {
        acc += probs[idx];
        if acc >= target {
            return idx as u32;
        }
    }
    *order.last().expect("order is non-empty") as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn greedy_returns_argmax_regardless_of_rng() {
        let mut logits = vec![0.1, 5.0, -3.0, 2.0];
        let mut rng = rand::rngs::StdRng::seed_from_u64(0);
        assert_eq!(sample_cpu(&mut logits, None, 0.0, 0, 1.0, &mut rng), 1);
    }

    #[test]
    fn pad_is_masked_even_if_it_would_win() {
        let mut logits = vec![0.0, 100.0, 0.0];
        let mut rng = rand::rngs::StdRng::seed_from_u64(0);
        assert_eq!(sample_cpu(&mut logits, Some(1), 0.0, 0, 1.0, &mut rng), 0);
    }

    #[test]
    fn single_surviving_candidate_is_deterministic_under_top_k_1() {
        let mut logits = vec![1.0, 9.0, 2.0, 0.0];
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        for _ in 0..10 {
            assert_eq!(sample_cpu(&mut logits.clone(), None, 0.8, 1, 1.0, &mut rng), 1);
        }
    }

    #[test]
    fn repetition_penalty_divides_positive_and_multiplies_negative() {
        let mut logits = vec![2.0, -2.0, 3.0];
        apply_repetition_penalty(&mut logits, &[0, 1], 2.0);
        assert_eq!(logits[0], 1.0);
        assert_eq!(logits[1], -4.0);
        assert_eq!(logits[2], 3.0);
    }

    #[test]
    fn repetition_penalty_is_noop_at_one() {
        let mut logits = vec![2.0, -2.0];
        apply_repetition_penalty(&mut logits, &[0, 1], 1.0);
        assert_eq!(logits, vec![2.0, -2.0]);
    }

    #[test]
    fn out_of_range_recent_token_is_ignored() {
        let mut logits = vec![1.0, 2.0];
        apply_repetition_penalty(&mut logits, &[50], 2.0);
        assert_eq!(logits, vec![1.0, 2.0]);
    }
}

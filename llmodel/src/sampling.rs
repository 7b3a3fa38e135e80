//! Token sampling.

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::engine::PromptContext;

/// RNG for generation step `step` of a stream seeded with `seed`.
///
/// Deriving the generator from the pair keeps sampling reproducible after a
/// state restore without serializing generator internals.
pub fn step_rng(seed: u64, step: u64) -> StdRng {
    StdRng::seed_from_u64(seed ^ step.wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

pub fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Penalise tokens that appear in `recent`, the llama.cpp way: positive
/// logits are divided by the penalty and negative ones multiplied.
pub fn apply_repeat_penalty(logits: &mut [f32], recent: &[usize], penalty: f32) {
    if penalty == 1.0 {
        return;
    }
    let mut seen = vec![false; logits.len()];
    for &tok in recent {
        if tok < logits.len() && !seen[tok] {
            seen[tok] = true;
            let l = &mut logits[tok];
            *l = if *l > 0.0 { *l / penalty } else { *l * penalty };
        }
    }
}

/// Pick the next token from `logits`.
pub fn sample(logits: &[f32], recent: &[usize], ctx: &PromptContext, rng: &mut impl Rng) -> usize {
    let mut logits = logits.to_vec();
    apply_repeat_penalty(&mut logits, recent, ctx.repeat_penalty);

    if ctx.temp <= 0.0 {
        return argmax(&logits);
    }

    let mut candidates: Vec<(usize, f32)> = logits
        .iter()
        .enumerate()
        .map(|(i, &l)| (i, l / ctx.temp))
        .collect();
    candidates.sort_by(|a, b| b.1.total_cmp(&a.1));
    if ctx.top_k > 0 && ctx.top_k < candidates.len() {
        candidates.truncate(ctx.top_k);
    }

    // softmax over the survivors, already sorted by descending logit
    let max = candidates.first().map(|c| c.1).unwrap_or(0.0);
    let mut probs: Vec<f32> = candidates.iter().map(|c| (c.1 - max).exp()).collect();
    let sum: f32 = probs.iter().sum();
    for p in probs.iter_mut() {
        *p /= sum;
    }

    if ctx.top_p < 1.0 {
        let mut cumulative = 0.0;
        let mut keep = probs.len();
        for (i, p) in probs.iter().enumerate() {
            cumulative += p;
            if cumulative >= ctx.top_p {
                keep = i + 1;
                break;
            }
        }
        probs.truncate(keep.max(1));
    }

    if ctx.min_p > 0.0 {
        let threshold = probs[0] * ctx.min_p;
        let keep = probs.iter().take_while(|&&p| p >= threshold).count();
        probs.truncate(keep.max(1));
    }

    match WeightedIndex::new(&probs) {
        Ok(dist) => candidates[dist.sample(rng)].0,
        Err(_) => candidates[0].0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> PromptContext {
        PromptContext {
            repeat_penalty: 1.0,
            ..PromptContext::default()
        }
    }

    #[test]
    fn greedy_picks_max() {
        let ctx = PromptContext { temp: 0.0, ..ctx() };
        let logits = [0.1, 2.0, -1.0, 1.9];
        assert_eq!(sample(&logits, &[], &ctx, &mut step_rng(1, 0)), 1);
    }

    #[test]
    fn repeat_penalty_changes_greedy_choice() {
        let ctx = PromptContext { temp: 0.0, repeat_penalty: 2.0, ..ctx() };
        let logits = [0.1, 2.0, -1.0, 1.9];
        assert_eq!(sample(&logits, &[1], &ctx, &mut step_rng(1, 0)), 3);
    }

    #[test]
    fn top_k_one_is_greedy() {
        let ctx = PromptContext { top_k: 1, temp: 1.5, ..ctx() };
        let logits = [0.3, 0.2, 0.9, 0.1];
        for step in 0..20 {
            assert_eq!(sample(&logits, &[], &ctx, &mut step_rng(5, step)), 2);
        }
    }

    #[test]
    fn min_p_filters_unlikely_tokens() {
        let ctx = PromptContext { top_k: 0, top_p: 1.0, min_p: 0.5, temp: 1.0, ..ctx() };
        let logits = [5.0, 4.9, -10.0, -10.0];
        for step in 0..50 {
            let tok = sample(&logits, &[], &ctx, &mut step_rng(11, step));
            assert!(tok < 2);
        }
    }

    #[test]
    fn same_step_same_draw() {
        let ctx = PromptContext { top_k: 0, top_p: 1.0, temp: 1.0, ..ctx() };
        let logits = [0.0; 16];
        let a = sample(&logits, &[], &ctx, &mut step_rng(3, 4));
        let b = sample(&logits, &[], &ctx, &mut step_rng(3, 4));
        assert_eq!(a, b);
    }
}

//! Token selection over a single row of logits.
//!
//! Kept free of any tensor library so it can be exercised without a model:
//! the TorchScript backend pulls the last row to the CPU and feeds it here.

/// Penalises tokens that already appear in `seen`. Positive logits are
/// divided by `penalty`, negative ones multiplied, so a penalty above 1
/// always makes a repeat less likely. A penalty of 1 is a no-op.
pub fn apply_repeat_penalty(logits: &mut [f32], seen: &[i64], penalty: f64) {
    if penalty <= 0.0 || penalty == 1.0 {
        return;
    }
    let penalty = penalty as f32;
    let mut ids: Vec<usize> = seen
        .iter()
        .filter_map(|&id| usize::try_from(id).ok())
        .filter(|&id| id < logits.len())
        .collect();
    ids.sort_unstable();
    ids.dedup();
    for id in ids {
        let logit = &mut logits[id];
        if *logit > 0.0 {
            *logit /= penalty;
        } else {
            *logit *= penalty;
        }
    }
}

pub fn argmax(logits: &[f32]) -> Option<i64> {
    logits
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(id, _)| id as i64)
}

/// Applies temperature, then keeps the `top_k` most likely tokens (0 keeps
/// all) and the smallest prefix of those whose cumulative probability
/// reaches `top_p`. Returns `(token, probability)` pairs, most likely first,
/// renormalised to sum to 1.
pub fn candidates(logits: &[f32], temperature: f64, top_k: usize, top_p: f64) -> Vec<(i64, f32)> {
    let temperature = temperature.max(f64::MIN_POSITIVE) as f32;
    let mut ranked: Vec<(i64, f32)> = logits
        .iter()
        .enumerate()
        .map(|(id, &logit)| (id as i64, logit / temperature))
        .collect();
    ranked.sort_unstable_by(|a, b| b.1.total_cmp(&a.1));
    if top_k > 0 {
        ranked.truncate(top_k);
    }
    let Some(&(_, max)) = ranked.first() else {
        return ranked;
    };

    // Stable softmax over the survivors.
    for (_, value) in ranked.iter_mut() {
        *value = (*value - max).exp();
    }
    normalize(&mut ranked);

    if top_p < 1.0 {
        let mut cumulative = 0.0_f32;
        let mut keep = ranked.len();
        for (idx, &(_, p)) in ranked.iter().enumerate() {
            cumulative += p;
            if f64::from(cumulative) >= top_p {
                keep = idx + 1;
                break;
            }
        }
        ranked.truncate(keep.max(1));
        normalize(&mut ranked);
    }
    ranked
}

/// Picks from `candidates` given a uniform draw `u` in `[0, 1)`.
pub fn pick(candidates: &[(i64, f32)], u: f32) -> Option<i64> {
    let mut acc = 0.0_f32;
    for &(id, p) in candidates {
        acc += p;
        if u < acc {
            return Some(id);
        }
    }
    // Rounding can leave the total just under 1.
    candidates.last().map(|&(id, _)| id)
}

fn normalize(ranked: &mut [(i64, f32)]) {
    let sum: f32 = ranked.iter().map(|&(_, p)| p).sum();
    if sum > 0.0 {
        for (_, p) in ranked.iter_mut() {
            *p /= sum;
        }
    }
}

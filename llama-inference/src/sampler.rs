//! Draws one token id from next-token logits under temperature scaling,
//! repetition penalty, top-k and top-p truncation.

#[cfg(test)]
#[path = "../tests/unit/sampler_test.rs"]
mod sampler_test;

use crate::tokenizer::TokenId;

/// xorshift64* generator. One u64 of state keeps the serialized session
/// blob trivial and the draws reproducible across platforms.
#[derive(Debug, Clone)]
pub struct Rng {
    state: u64,
}

impl Rng {
    pub fn new(seed: u64) -> Self {
        Self {
            // xorshift has a fixed point at zero.
            state: if seed == 0 { 0x9E3779B97F4A7C15 } else { seed },
        }
    }

    pub fn state(&self) -> u64 {
        self.state
    }

    pub fn set_state(&mut self, state: u64) {
        self.state = if state == 0 { 0x9E3779B97F4A7C15 } else { state };
    }

    fn next_u32(&mut self) -> u32 {
        self.state ^= self.state >> 12;
        self.state ^= self.state << 25;
        self.state ^= self.state >> 27;
        ((self.state.wrapping_mul(0x2545F4914F6CDD1D)) >> 32) as u32
    }

    /// Uniform float in [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 / 16777216.0
    }
}

/// Sample one token. With `temp <= 0` this is a deterministic argmax over
/// the raw logits; otherwise logits are scaled by `1/temp`, ids present in
/// `last_n_tokens` are penalized (negative logits grow in magnitude rather
/// than flipping sign), the candidates are cut to the `top_k` best, softmax
/// normalized, cut again at cumulative probability `top_p`, and one index is
/// drawn from the remaining mass.
pub fn sample_top_p_top_k(
    logits: &[f32],
    last_n_tokens: &[TokenId],
    top_k: i32,
    top_p: f32,
    temp: f32,
    repeat_penalty: f32,
    rng: &mut Rng,
) -> TokenId {
    let n_logits = logits.len();

    if temp <= 0.0 {
        return logits
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(i, _)| i as TokenId)
            .unwrap_or_default();
    }

    let scale = 1.0 / temp;
    let mut candidates: Vec<(f32, TokenId)> = logits
        .iter()
        .enumerate()
        .map(|(i, &logit)| {
            let id = i as TokenId;
            let mut scaled = logit * scale;
            if last_n_tokens.contains(&id) {
                if logit < 0.0 {
                    scaled *= repeat_penalty;
                } else {
                    scaled /= repeat_penalty;
                }
            }
            (scaled, id)
        })
        .collect();

    let k = if top_k > 0 {
        (top_k as usize).min(n_logits)
    } else {
        n_logits
    };
    if k < n_logits {
        candidates.select_nth_unstable_by(k - 1, |a, b| b.0.total_cmp(&a.0));
        candidates.truncate(k);
    }
    candidates.sort_unstable_by(|a, b| b.0.total_cmp(&a.0));

    // Softmax over the kept candidates.
    let maxl = candidates[0].0;
    let mut probs: Vec<f32> = candidates.iter().map(|&(l, _)| (l - maxl).exp()).collect();
    let sum: f32 = probs.iter().sum();
    for p in probs.iter_mut() {
        *p /= sum;
    }

    if top_p < 1.0 {
        let mut cumsum = 0.0f64;
        for (i, &p) in probs.iter().enumerate() {
            cumsum += p as f64;
            if cumsum >= top_p as f64 {
                probs.truncate(i + 1);
                candidates.truncate(i + 1);
                break;
            }
        }
    }

    // Draw from the truncated probabilities as-is; the cutoff mass is the
    // implicit normalizer.
    let total: f32 = probs.iter().sum();
    let r = rng.next_f32() * total;
    let mut cdf = 0.0f32;
    for (i, &p) in probs.iter().enumerate() {
        cdf += p;
        if r < cdf {
            return candidates[i].1;
        }
    }
    candidates[probs.len() - 1].1
}

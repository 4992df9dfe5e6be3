//! Batched forward pass: embeds a batch of token ids, runs every
//! transformer block against the KV-cache, and produces next-token logits.

use crate::kv_cache::KvCache;
use crate::model::Model;
use crate::tensor::matvec;
use crate::tokenizer::TokenId;
use rayon::prelude::*;

const RMS_NORM_EPS: f32 = 1e-6;
const ROPE_THETA: f32 = 10000.0;

/// Grow-only intermediate buffers reused by every eval.
///
/// Buffers fall into two groups: group 0 wraps the attention block, group 1
/// the feed-forward block. Per-group high-water marks are recorded so a
/// session can report its real scratch footprint.
pub struct EvalScratch {
    // group 0 (attention)
    xn: Vec<f32>,
    q: Vec<f32>,
    k: Vec<f32>,
    v: Vec<f32>,
    att_out: Vec<f32>,
    attn_proj: Vec<f32>,
    // group 1 (feed-forward)
    gate: Vec<f32>,
    up: Vec<f32>,
    ffn_out: Vec<f32>,
    // ungrouped compute buffers
    hidden: Vec<f32>,
    ff_in: Vec<f32>,
    norm_w: Vec<f32>,
    high_water: [usize; 2],
}

impl EvalScratch {
    pub fn new() -> Self {
        Self {
            xn: Vec::new(),
            q: Vec::new(),
            k: Vec::new(),
            v: Vec::new(),
            att_out: Vec::new(),
            attn_proj: Vec::new(),
            gate: Vec::new(),
            up: Vec::new(),
            ffn_out: Vec::new(),
            hidden: Vec::new(),
            ff_in: Vec::new(),
            norm_w: Vec::new(),
            high_water: [0; 2],
        }
    }

    /// High-water mark of scratch group `i` in bytes.
    pub fn high_water(&self, i: usize) -> usize {
        self.high_water[i]
    }

    /// Bytes currently held across all buffers.
    pub fn total_bytes(&self) -> usize {
        4 * (self.xn.len()
            + self.q.len()
            + self.k.len()
            + self.v.len()
            + self.att_out.len()
            + self.attn_proj.len()
            + self.gate.len()
            + self.up.len()
            + self.ffn_out.len()
            + self.hidden.len()
            + self.ff_in.len()
            + self.norm_w.len())
    }

    fn ensure(buf: &mut Vec<f32>, len: usize) {
        if buf.len() < len {
            buf.resize(len, 0.0);
        }
    }
}

impl Default for EvalScratch {
    fn default() -> Self {
        Self::new()
    }
}

/// Evaluate `tokens` with `n_past` positions already cached. Writes logits
/// for the last position (or all positions if `logits_all`) and, when
/// `embedding` is given, the final post-norm hidden state of the last
/// position.
#[allow(clippy::too_many_arguments)]
pub fn forward(
    model: &Model,
    kv: &mut KvCache,
    scratch: &mut EvalScratch,
    tokens: &[TokenId],
    n_past: usize,
    logits_all: bool,
    logits: &mut Vec<f32>,
    embedding: Option<&mut Vec<f32>>,
) {
    let hp = &model.hparams;
    let n = tokens.len();
    let n_embd = hp.n_embd as usize;
    let n_head = hp.n_head as usize;
    let n_vocab = hp.n_vocab as usize;
    let n_rot = hp.n_rot as usize;
    let n_ff = hp.n_ff() as usize;
    let head_dim = n_embd / n_head;

    assert!(n > 0, "eval needs at least one token");
    assert!(
        n_past + n <= hp.n_ctx as usize,
        "eval overruns the context window: {} + {} > {}",
        n_past,
        n,
        hp.n_ctx
    );

    EvalScratch::ensure(&mut scratch.hidden, n * n_embd);
    EvalScratch::ensure(&mut scratch.ff_in, n * n_embd);
    EvalScratch::ensure(&mut scratch.norm_w, n_embd);

    // Token embedding lookup.
    for (t, &token) in tokens.iter().enumerate() {
        model
            .tok_embeddings
            .dequantize_row(token as usize, &mut scratch.hidden[t * n_embd..(t + 1) * n_embd]);
    }

    for (il, layer) in model.layers.iter().enumerate() {
        // ---- attention block (scratch group 0) ----
        EvalScratch::ensure(&mut scratch.xn, n * n_embd);
        EvalScratch::ensure(&mut scratch.q, n * n_embd);
        EvalScratch::ensure(&mut scratch.k, n * n_embd);
        EvalScratch::ensure(&mut scratch.v, n * n_embd);
        EvalScratch::ensure(&mut scratch.att_out, n * n_embd);
        EvalScratch::ensure(&mut scratch.attn_proj, n * n_embd);
        scratch.high_water[0] = scratch.high_water[0].max(4 * 6 * n * n_embd);

        layer.attention_norm.dequantize_row(0, &mut scratch.norm_w);
        for t in 0..n {
            let row = t * n_embd;
            rms_norm_mul(
                &mut scratch.xn[row..row + n_embd],
                &scratch.hidden[row..row + n_embd],
                &scratch.norm_w,
            );
        }

        for t in 0..n {
            let row = t * n_embd;
            let xn = &scratch.xn[row..row + n_embd];
            matvec(&mut scratch.q[row..row + n_embd], &layer.wq, xn);
            matvec(&mut scratch.k[row..row + n_embd], &layer.wk, xn);
            matvec(&mut scratch.v[row..row + n_embd], &layer.wv, xn);

            // RoPE before the cache write, so cached keys carry position.
            let pos = n_past + t;
            rope_inplace(&mut scratch.q[row..row + n_embd], pos, n_head, head_dim, n_rot);
            rope_inplace(&mut scratch.k[row..row + n_embd], pos, n_head, head_dim, n_rot);
        }

        kv.store_k(il, n_past, &scratch.k[..n * n_embd]);
        kv.store_v(il, n_past, &scratch.v[..n * n_embd]);

        let attention_scale = 1.0 / (head_dim as f32).sqrt();
        let kv_ref = &*kv;
        let q_ref = &scratch.q;
        scratch.att_out[..n * n_embd]
            .par_chunks_mut(head_dim)
            .enumerate()
            .for_each(|(idx, out)| {
                let t = idx / n_head;
                let h = idx % n_head;
                let head_offset = h * head_dim;
                let q_head = &q_ref[t * n_embd + head_offset..t * n_embd + head_offset + head_dim];

                // Causal mask: query t sees positions up to n_past + t only.
                let visible = n_past + t + 1;
                let mut scores = Vec::with_capacity(visible);
                for j in 0..visible {
                    scores.push(kv_ref.k_dot(il, j, head_offset, q_head) * attention_scale);
                }
                softmax(&mut scores);

                out.fill(0.0);
                for (j, &weight) in scores.iter().enumerate() {
                    kv_ref.v_accumulate(il, j, head_offset, weight, out);
                }
            });

        for t in 0..n {
            let row = t * n_embd;
            matvec(
                &mut scratch.attn_proj[row..row + n_embd],
                &layer.wo,
                &scratch.att_out[row..row + n_embd],
            );
        }

        for i in 0..n * n_embd {
            scratch.ff_in[i] = scratch.attn_proj[i] + scratch.hidden[i];
        }

        // ---- feed-forward block (scratch group 1) ----
        EvalScratch::ensure(&mut scratch.gate, n * n_ff);
        EvalScratch::ensure(&mut scratch.up, n * n_ff);
        EvalScratch::ensure(&mut scratch.ffn_out, n * n_embd);
        scratch.high_water[1] = scratch.high_water[1].max(4 * (2 * n * n_ff + n * n_embd));

        layer.ffn_norm.dequantize_row(0, &mut scratch.norm_w);
        for t in 0..n {
            let row = t * n_embd;
            rms_norm_mul(
                &mut scratch.xn[row..row + n_embd],
                &scratch.ff_in[row..row + n_embd],
                &scratch.norm_w,
            );
        }

        for t in 0..n {
            let row = t * n_embd;
            let ff_row = t * n_ff;
            let xn = &scratch.xn[row..row + n_embd];
            matvec(&mut scratch.gate[ff_row..ff_row + n_ff], &layer.w1, xn);
            matvec(&mut scratch.up[ff_row..ff_row + n_ff], &layer.w3, xn);
        }

        // SwiGLU: silu(w1 x) ⊙ (w3 x)
        for (gate, &up) in scratch.gate[..n * n_ff]
            .iter_mut()
            .zip(&scratch.up[..n * n_ff])
        {
            *gate = *gate / (1.0 + (-*gate).exp()) * up;
        }

        for t in 0..n {
            let row = t * n_embd;
            let ff_row = t * n_ff;
            matvec(
                &mut scratch.ffn_out[row..row + n_embd],
                &layer.w2,
                &scratch.gate[ff_row..ff_row + n_ff],
            );
        }

        for i in 0..n * n_embd {
            scratch.hidden[i] = scratch.ffn_out[i] + scratch.ff_in[i];
        }
    }

    // ---- final norm and lm head (no scratch group) ----
    model.norm.dequantize_row(0, &mut scratch.norm_w);
    for t in 0..n {
        let row = t * n_embd;
        rms_norm_mul(
            &mut scratch.xn[row..row + n_embd],
            &scratch.hidden[row..row + n_embd],
            &scratch.norm_w,
        );
    }

    if let Some(embedding) = embedding {
        embedding.resize(n_embd, 0.0);
        embedding.copy_from_slice(&scratch.xn[(n - 1) * n_embd..n * n_embd]);
    }

    if logits_all {
        logits.resize(n * n_vocab, 0.0);
        for t in 0..n {
            matvec(
                &mut logits[t * n_vocab..(t + 1) * n_vocab],
                &model.output,
                &scratch.xn[t * n_embd..(t + 1) * n_embd],
            );
        }
    } else {
        logits.resize(n_vocab, 0.0);
        matvec(
            logits,
            &model.output,
            &scratch.xn[(n - 1) * n_embd..n * n_embd],
        );
    }

    kv.advance(n);
}

/// RMS-normalize `x` into `out` and scale element-wise by `weight`.
fn rms_norm_mul(out: &mut [f32], x: &[f32], weight: &[f32]) {
    debug_assert_eq!(out.len(), x.len());
    debug_assert_eq!(x.len(), weight.len());

    let mean_sq = x.iter().map(|&v| v * v).sum::<f32>() / x.len() as f32;
    let inv_rms = 1.0 / (mean_sq + RMS_NORM_EPS).sqrt();
    for ((out, &v), &w) in out.iter_mut().zip(x).zip(weight) {
        *out = w * (v * inv_rms);
    }
}

pub(crate) fn softmax(x: &mut [f32]) {
    let max_val = x.iter().fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
    let mut sum = 0.0f32;
    for v in x.iter_mut() {
        *v = (*v - max_val).exp();
        sum += *v;
    }
    let inv_sum = sum.recip();
    for v in x.iter_mut() {
        *v *= inv_sum;
    }
}

/// Rotary position embedding over the first `n_rot` dims of every head,
/// rotating adjacent element pairs.
fn rope_inplace(x: &mut [f32], pos: usize, n_head: usize, head_dim: usize, n_rot: usize) {
    let theta_scale = ROPE_THETA.powf(-2.0 / n_rot as f32);
    for h in 0..n_head {
        let base = h * head_dim;
        let mut theta = pos as f32;
        for i in (0..n_rot).step_by(2) {
            let (sin, cos) = theta.sin_cos();
            let x0 = x[base + i];
            let x1 = x[base + i + 1];
            x[base + i] = x0 * cos - x1 * sin;
            x[base + i + 1] = x0 * sin + x1 * cos;
            theta *= theta_scale;
        }
    }
}

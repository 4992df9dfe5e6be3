//! Inference session: owns the loaded model, KV-cache, scratch, RNG,
//! logits and timing counters, and exposes the public API surface.

use crate::error::{Error, Result};
use crate::eval::{forward, EvalScratch};
use crate::kv_cache::{KvCache, KvDtype};
use crate::loader::ModelLoader;
use crate::model::{Hparams, Model};
use crate::sampler::{sample_top_p_top_k, Rng};
use crate::tokenizer::{TokenId, Vocabulary};
use log::info;
use std::borrow::Cow;
use std::path::Path;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Serialized sessions reserve this much room for the RNG rendering.
const STATE_RNG_BUF_SIZE: usize = 64 * 1024;

pub type ProgressCallback = Box<dyn FnMut(f32) + Send>;

/// Session creation parameters; `..Default::default()` fills the usual case.
pub struct SessionParams {
    /// Context window for this session.
    pub n_ctx: u32,
    /// Model part count; inferred from the file when `None`.
    pub n_parts: Option<u32>,
    /// RNG seed; 0 draws one from the clock.
    pub seed: u64,
    /// Keep the KV-cache in f16 instead of f32.
    pub f16_kv: bool,
    /// Keep logits for every evaluated position, not just the last.
    pub logits_all: bool,
    /// Load only the vocabulary, no weights.
    pub vocab_only: bool,
    pub use_mmap: bool,
    pub use_mlock: bool,
    /// Make the final hidden state available through `get_embeddings`.
    pub embedding: bool,
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            n_ctx: 512,
            n_parts: None,
            seed: 0,
            f16_kv: false,
            logits_all: false,
            vocab_only: false,
            use_mmap: true,
            use_mlock: false,
            embedding: false,
            progress_callback: None,
        }
    }
}

impl std::fmt::Debug for SessionParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionParams")
            .field("n_ctx", &self.n_ctx)
            .field("n_parts", &self.n_parts)
            .field("seed", &self.seed)
            .field("f16_kv", &self.f16_kv)
            .field("logits_all", &self.logits_all)
            .field("vocab_only", &self.vocab_only)
            .field("use_mmap", &self.use_mmap)
            .field("use_mlock", &self.use_mlock)
            .field("embedding", &self.embedding)
            .field("progress_callback", &self.progress_callback.is_some())
            .finish()
    }
}

/// Accumulated wall-clock counters; load time is re-measured at the first
/// eval so mmap page faults count toward it.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timings {
    pub t_load: Duration,
    pub t_sample: Duration,
    pub n_sample: u32,
    pub t_eval: Duration,
    pub n_eval: u32,
    pub t_p_eval: Duration,
    pub n_p_eval: u32,
    pub t_total: Duration,
}

impl std::fmt::Display for Timings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let per = |t: Duration, n: u32| t.as_secs_f64() * 1000.0 / n.max(1) as f64;
        writeln!(f, "       load time = {:8.2} ms", self.t_load.as_secs_f64() * 1000.0)?;
        writeln!(
            f,
            "     sample time = {:8.2} ms / {:5} runs   ({:8.2} ms per run)",
            self.t_sample.as_secs_f64() * 1000.0,
            self.n_sample,
            per(self.t_sample, self.n_sample)
        )?;
        writeln!(
            f,
            "prompt eval time = {:8.2} ms / {:5} tokens ({:8.2} ms per token)",
            self.t_p_eval.as_secs_f64() * 1000.0,
            self.n_p_eval,
            per(self.t_p_eval, self.n_p_eval)
        )?;
        writeln!(
            f,
            "       eval time = {:8.2} ms / {:5} runs   ({:8.2} ms per run)",
            self.t_eval.as_secs_f64() * 1000.0,
            self.n_eval,
            per(self.t_eval, self.n_eval)
        )?;
        write!(f, "      total time = {:8.2} ms", self.t_total.as_secs_f64() * 1000.0)
    }
}

/// One inference session over a loaded model.
///
/// Not safe for concurrent calls; callers serialize. Independent sessions
/// may share a mapped model file freely.
pub struct Session {
    hparams: Hparams,
    vocab: Vocabulary,
    model: Option<Model>,
    kv: Option<KvCache>,
    scratch: EvalScratch,
    rng: Rng,

    logits: Vec<f32>,
    logits_capacity: usize,
    logits_all: bool,
    embedding: Vec<f32>,

    pool: Option<(usize, rayon::ThreadPool)>,
    mem_per_token: usize,

    t_start: Instant,
    t_load: Duration,
    has_evaluated_once: bool,
    t_sample: Duration,
    n_sample: u32,
    t_eval: Duration,
    n_eval: u32,
    t_p_eval: Duration,
    n_p_eval: u32,
}

impl Session {
    /// Open a model file and build a session around it.
    pub fn new(path: &Path, mut params: SessionParams) -> Result<Self> {
        let t_start = Instant::now();

        let seed = if params.seed == 0 {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(1)
        } else {
            params.seed
        };

        let mut loader = ModelLoader::open(
            path,
            params.n_parts,
            params.use_mmap,
            params.vocab_only,
        )?;
        let vocab = Vocabulary::from_tokens(loader.take_vocab());

        let mut hparams = loader.hparams().clone();
        hparams.n_ctx = params.n_ctx;

        let (model, kv) = if params.vocab_only {
            (None, None)
        } else {
            let mut progress: ProgressCallback = match params.progress_callback.take() {
                Some(cb) => cb,
                None => {
                    let mut last_pct = 0u32;
                    Box::new(move |p: f32| {
                        let pct = (p * 100.0) as u32;
                        if pct >= last_pct + 10 || pct == 100 {
                            last_pct = pct;
                            info!("loading model: {pct:3}%");
                        }
                    })
                }
            };
            let model = Model::load(&mut loader, params.n_ctx, params.use_mlock, &mut progress)?;

            let kv_dtype = if params.f16_kv { KvDtype::F16 } else { KvDtype::F32 };
            let kv = KvCache::new(
                hparams.n_layer as usize,
                hparams.n_ctx as usize,
                hparams.n_embd as usize,
                kv_dtype,
            )?;
            info!(
                "kv self size  = {:7.2} MB",
                kv.size_bytes() as f64 / 1024.0 / 1024.0
            );
            (Some(model), Some(kv))
        };

        let n_vocab = hparams.n_vocab as usize;
        let logits_capacity = if params.logits_all {
            hparams.n_ctx as usize * n_vocab
        } else {
            n_vocab
        };
        let embedding = if params.embedding && !params.vocab_only {
            vec![0.0; hparams.n_embd as usize]
        } else {
            Vec::new()
        };

        Ok(Self {
            hparams,
            vocab,
            model,
            kv,
            scratch: EvalScratch::new(),
            rng: Rng::new(seed),
            logits: Vec::with_capacity(logits_capacity),
            logits_capacity,
            logits_all: params.logits_all,
            embedding,
            pool: None,
            mem_per_token: 0,
            t_load: t_start.elapsed(),
            t_start,
            has_evaluated_once: false,
            t_sample: Duration::ZERO,
            n_sample: 0,
            t_eval: Duration::ZERO,
            n_eval: 0,
            t_p_eval: Duration::ZERO,
            n_p_eval: 0,
        })
    }

    pub fn n_vocab(&self) -> usize {
        self.vocab.n_vocab()
    }

    pub fn n_ctx(&self) -> usize {
        self.hparams.n_ctx as usize
    }

    pub fn n_embd(&self) -> usize {
        self.hparams.n_embd as usize
    }

    pub fn hparams(&self) -> &Hparams {
        &self.hparams
    }

    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    /// Logits written by the last eval: `n_vocab` floats, or
    /// `n_vocab * n_tokens` when the session keeps all positions.
    pub fn get_logits(&self) -> &[f32] {
        &self.logits
    }

    /// Final hidden state of the last evaluated position; empty unless the
    /// session was created with `embedding`.
    pub fn get_embeddings(&self) -> &[f32] {
        &self.embedding
    }

    pub fn token_bytes(&self, token: TokenId) -> Option<&[u8]> {
        self.vocab.token_bytes(token)
    }

    pub fn token_to_str(&self, token: TokenId) -> Option<Cow<'_, str>> {
        self.vocab.token_to_str(token)
    }

    pub fn tokenize(&self, text: &str, add_bos: bool) -> Vec<TokenId> {
        self.vocab.tokenize(text, add_bos)
    }

    /// Evaluate a batch of tokens with `n_past` positions already cached.
    pub fn eval(&mut self, tokens: &[TokenId], n_past: usize, n_threads: usize) -> Result<()> {
        let t_start = Instant::now();
        let n = tokens.len();

        self.ensure_pool(n_threads);
        let model = self.model.as_ref().expect("eval on a vocab-only session");
        let kv = self.kv.as_mut().expect("eval on a vocab-only session");
        let scratch = &mut self.scratch;
        let logits = &mut self.logits;
        let logits_all = self.logits_all;
        let embedding = if self.embedding.is_empty() {
            None
        } else {
            Some(&mut self.embedding)
        };

        match &self.pool {
            Some((_, pool)) => pool.install(|| {
                forward(model, kv, scratch, tokens, n_past, logits_all, logits, embedding)
            }),
            None => forward(model, kv, scratch, tokens, n_past, logits_all, logits, embedding),
        }

        if self.mem_per_token == 0 {
            self.mem_per_token = self.scratch.total_bytes() / n;
        }

        // Single-token evals and prompt batches are timed separately.
        if n == 1 {
            self.t_eval += t_start.elapsed();
            self.n_eval += 1;
        } else {
            self.t_p_eval += t_start.elapsed();
            self.n_p_eval += n as u32;
        }
        if !self.has_evaluated_once {
            self.t_load = self.t_start.elapsed();
            self.has_evaluated_once = true;
        }
        Ok(())
    }

    fn ensure_pool(&mut self, n_threads: usize) {
        if n_threads == 0 {
            self.pool = None;
            return;
        }
        if self.pool.as_ref().map(|(n, _)| *n) == Some(n_threads) {
            return;
        }
        match rayon::ThreadPoolBuilder::new().num_threads(n_threads).build() {
            Ok(pool) => self.pool = Some((n_threads, pool)),
            Err(err) => {
                log::warn!("falling back to the global thread pool: {err}");
                self.pool = None;
            }
        }
    }

    /// Sample one token from the last eval's logits.
    pub fn sample(
        &mut self,
        last_n_tokens: &[TokenId],
        top_k: i32,
        top_p: f32,
        temp: f32,
        repeat_penalty: f32,
    ) -> TokenId {
        let t_start = Instant::now();
        let n_vocab = self.hparams.n_vocab as usize;
        assert!(
            self.logits.len() >= n_vocab,
            "sample requires a preceding eval"
        );
        let logits = &self.logits[self.logits.len() - n_vocab..];
        let token = sample_top_p_top_k(
            logits,
            last_n_tokens,
            top_k,
            top_p,
            temp,
            repeat_penalty,
            &mut self.rng,
        );
        self.t_sample += t_start.elapsed();
        self.n_sample += 1;
        token
    }

    /// Tokens currently held by the KV-cache.
    pub fn kv_cache_token_count(&self) -> usize {
        self.kv.as_ref().map(|kv| kv.n_tokens()).unwrap_or(0)
    }

    /// Raw KV-cache snapshot (keys plane, then values plane).
    pub fn kv_cache_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        if let Some(kv) = &self.kv {
            out.reserve(kv.size_bytes());
            kv.copy_bytes_to(&mut out);
        }
        out
    }

    /// Replace the KV-cache contents with a snapshot of identical geometry.
    pub fn set_kv_cache(&mut self, bytes: &[u8], n_tokens: usize) -> Result<()> {
        match self.kv.as_mut() {
            Some(kv) => kv.restore_bytes(bytes, n_tokens),
            None => Err(Error::StateMismatch(
                "session has no kv cache".to_string(),
            )),
        }
    }

    fn kv_size_bytes(&self) -> usize {
        self.kv.as_ref().map(|kv| kv.size_bytes()).unwrap_or(0)
    }

    /// Exact byte size of the blob produced by `copy_state_data`.
    pub fn state_size(&self) -> usize {
        8 + STATE_RNG_BUF_SIZE              // rng length + fixed rng region
            + 8 + 8                         // logits capacity + size
            + self.logits_capacity * 4
            + 8                             // embedding size
            + self.embedding.len() * 4
            + 8 + 4                         // kv size + token count
            + self.kv_size_bytes()
    }

    /// Serialize RNG, logits, embedding and KV-cache into one blob.
    pub fn copy_state_data(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.state_size());

        let rng_text = self.rng.state().to_string();
        out.extend_from_slice(&(rng_text.len() as u64).to_le_bytes());
        out.extend_from_slice(rng_text.as_bytes());
        out.resize(8 + STATE_RNG_BUF_SIZE, 0);

        out.extend_from_slice(&(self.logits_capacity as u64).to_le_bytes());
        out.extend_from_slice(&(self.logits.len() as u64).to_le_bytes());
        for &v in &self.logits {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.resize(out.len() + (self.logits_capacity - self.logits.len()) * 4, 0);

        out.extend_from_slice(&(self.embedding.len() as u64).to_le_bytes());
        for &v in &self.embedding {
            out.extend_from_slice(&v.to_le_bytes());
        }

        out.extend_from_slice(&(self.kv_size_bytes() as u64).to_le_bytes());
        out.extend_from_slice(&(self.kv_cache_token_count() as i32).to_le_bytes());
        if let Some(kv) = &self.kv {
            kv.copy_bytes_to(&mut out);
        }

        debug_assert_eq!(out.len(), self.state_size());
        out
    }

    /// Restore a blob from `copy_state_data`. The session must have been
    /// created with matching parameters; mismatches are rejected rather than
    /// partially applied. Returns the bytes consumed.
    pub fn set_state_data(&mut self, src: &[u8]) -> Result<usize> {
        let expected = self.state_size();
        if src.len() < expected {
            return Err(Error::StateMismatch(format!(
                "state blob is {} bytes, expected {}",
                src.len(),
                expected
            )));
        }

        let mut off = 0usize;
        let rng_size = read_u64(src, &mut off)? as usize;
        if rng_size > STATE_RNG_BUF_SIZE {
            return Err(Error::StateMismatch(format!(
                "rng rendering of {rng_size} bytes exceeds the reserved region"
            )));
        }
        let rng_state = std::str::from_utf8(&src[off..off + rng_size])
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| Error::StateMismatch("rng state does not parse".to_string()))?;
        self.rng.set_state(rng_state);
        off += STATE_RNG_BUF_SIZE;

        let logits_capacity = read_u64(src, &mut off)? as usize;
        if logits_capacity != self.logits_capacity {
            return Err(Error::StateMismatch(format!(
                "logits capacity {} != {}",
                logits_capacity, self.logits_capacity
            )));
        }
        let logits_size = read_u64(src, &mut off)? as usize;
        if logits_size > logits_capacity {
            return Err(Error::StateMismatch(
                "logits size exceeds capacity".to_string(),
            ));
        }
        self.logits.clear();
        for chunk in src[off..off + logits_size * 4].chunks_exact(4) {
            self.logits
                .push(f32::from_le_bytes(chunk.try_into().expect("chunk is 4 bytes")));
        }
        off += logits_capacity * 4;

        let embedding_size = read_u64(src, &mut off)? as usize;
        if embedding_size != self.embedding.len() {
            return Err(Error::StateMismatch(format!(
                "embedding size {} != {}",
                embedding_size,
                self.embedding.len()
            )));
        }
        for (dst, chunk) in self
            .embedding
            .iter_mut()
            .zip(src[off..off + embedding_size * 4].chunks_exact(4))
        {
            *dst = f32::from_le_bytes(chunk.try_into().expect("chunk is 4 bytes"));
        }
        off += embedding_size * 4;

        let kv_size = read_u64(src, &mut off)? as usize;
        let kv_ntok = i32::from_le_bytes(
            src[off..off + 4].try_into().expect("slice is 4 bytes"),
        );
        off += 4;
        if kv_size != self.kv_size_bytes() {
            return Err(Error::StateMismatch(format!(
                "kv cache size {} != {}",
                kv_size,
                self.kv_size_bytes()
            )));
        }
        if kv_size > 0 {
            let kv = self.kv.as_mut().expect("kv size nonzero implies a cache");
            kv.restore_bytes(&src[off..off + kv_size], kv_ntok as usize)?;
            off += kv_size;
        }

        debug_assert_eq!(off, expected);
        Ok(off)
    }

    pub fn timings(&self) -> Timings {
        Timings {
            t_load: self.t_load,
            t_sample: self.t_sample,
            n_sample: self.n_sample,
            t_eval: self.t_eval,
            n_eval: self.n_eval,
            t_p_eval: self.t_p_eval,
            n_p_eval: self.n_p_eval,
            t_total: self.t_start.elapsed(),
        }
    }

    pub fn reset_timings(&mut self) {
        self.t_start = Instant::now();
        self.t_sample = Duration::ZERO;
        self.n_sample = 0;
        self.t_eval = Duration::ZERO;
        self.n_eval = 0;
        self.t_p_eval = Duration::ZERO;
        self.n_p_eval = 0;
    }

    /// Scratch bytes used per token, measured on the first eval.
    pub fn mem_per_token(&self) -> usize {
        self.mem_per_token
    }

    /// High-water mark of the attention (0) and feed-forward (1) scratch
    /// groups, in bytes.
    pub fn scratch_high_water(&self, group: usize) -> usize {
        self.scratch.high_water(group)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("hparams", &self.hparams)
            .field("vocab", &self.vocab)
            .field("kv_tokens", &self.kv_cache_token_count())
            .field("has_evaluated_once", &self.has_evaluated_once)
            .finish_non_exhaustive()
    }
}

fn read_u64(src: &[u8], off: &mut usize) -> Result<u64> {
    let bytes: [u8; 8] = src
        .get(*off..*off + 8)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| Error::StateMismatch("state blob truncated".to_string()))?;
    *off += 8;
    Ok(u64::from_le_bytes(bytes))
}

//! Hyperparameters, model classes and the weight store assembled from the
//! loader's reconciled tensor map.

use crate::error::Result;
use crate::file_io::MemoryLock;
use crate::loader::ModelLoader;
use crate::tensor::Tensor;
use log::info;
use memmap2::Mmap;
use std::sync::Arc;

/// Quantization regime of a whole model file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ftype {
    AllF32,
    MostlyF16,
    MostlyQ4_0,
    MostlyQ4_1,
    MostlyQ4_1SomeF16,
    Unknown(u32),
}

impl Ftype {
    pub fn from_u32(value: u32) -> Self {
        match value {
            0 => Ftype::AllF32,
            1 => Ftype::MostlyF16,
            2 => Ftype::MostlyQ4_0,
            3 => Ftype::MostlyQ4_1,
            4 => Ftype::MostlyQ4_1SomeF16,
            other => Ftype::Unknown(other),
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            Ftype::AllF32 => 0,
            Ftype::MostlyF16 => 1,
            Ftype::MostlyQ4_0 => 2,
            Ftype::MostlyQ4_1 => 3,
            Ftype::MostlyQ4_1SomeF16 => 4,
            Ftype::Unknown(other) => other,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Ftype::AllF32 => "all F32",
            Ftype::MostlyF16 => "mostly F16",
            Ftype::MostlyQ4_0 => "mostly Q4_0",
            Ftype::MostlyQ4_1 => "mostly Q4_1",
            Ftype::MostlyQ4_1SomeF16 => "mostly Q4_1, some F16",
            Ftype::Unknown(_) => "unknown, may not work",
        }
    }
}

/// Hyperparameters as stored in the file header, plus the session's context
/// length (`n_ctx` is caller input, not a file field).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hparams {
    pub n_vocab: u32,
    pub n_ctx: u32,
    pub n_embd: u32,
    pub n_mult: u32,
    pub n_head: u32,
    pub n_layer: u32,
    pub n_rot: u32,
    pub ftype: Ftype,
}

impl Hparams {
    /// Feed-forward width: `2/3 * 4 * n_embd`, rounded up to `n_mult`.
    pub fn n_ff(&self) -> u32 {
        ((2 * (4 * self.n_embd) / 3 + self.n_mult - 1) / self.n_mult) * self.n_mult
    }

    pub fn head_dim(&self) -> u32 {
        self.n_embd / self.n_head
    }

    pub fn model_class(&self) -> ModelClass {
        match self.n_layer {
            32 => ModelClass::Model7B,
            40 => ModelClass::Model13B,
            60 => ModelClass::Model30B,
            80 => ModelClass::Model65B,
            _ => ModelClass::Unknown,
        }
    }
}

const MB: usize = 1024 * 1024;

/// Model size class inferred from the layer count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelClass {
    Unknown,
    Model7B,
    Model13B,
    Model30B,
    Model65B,
}

impl ModelClass {
    pub fn name(self) -> &'static str {
        match self {
            ModelClass::Unknown => "unknown",
            ModelClass::Model7B => "7B",
            ModelClass::Model13B => "13B",
            ModelClass::Model30B => "30B",
            ModelClass::Model65B => "65B",
        }
    }

    // The memory tables below were computed for n_ctx == 2048.

    pub fn mem_req_scratch0(self) -> usize {
        512 * MB
    }

    pub fn mem_req_scratch1(self) -> usize {
        512 * MB
    }

    /// 2 * n_embd * n_ctx * n_layer * sizeof(f16)
    pub fn mem_req_kv_self(self) -> usize {
        match self {
            ModelClass::Unknown | ModelClass::Model7B => 1026 * MB,
            ModelClass::Model13B => 1608 * MB,
            ModelClass::Model30B => 3124 * MB,
            ModelClass::Model65B => 5120 * MB,
        }
    }

    pub fn mem_req_eval(self) -> usize {
        match self {
            ModelClass::Unknown | ModelClass::Model7B => 768 * MB,
            ModelClass::Model13B => 1024 * MB,
            ModelClass::Model30B => 1280 * MB,
            ModelClass::Model65B => 1536 * MB,
        }
    }
}

/// Weights of one transformer block.
pub struct Layer {
    pub attention_norm: Tensor,

    pub wq: Tensor,
    pub wk: Tensor,
    pub wv: Tensor,
    pub wo: Tensor,

    pub ffn_norm: Tensor,

    pub w1: Tensor,
    pub w2: Tensor,
    pub w3: Tensor,
}

pub struct Model {
    pub hparams: Hparams,
    pub model_class: ModelClass,

    pub tok_embeddings: Tensor,
    pub norm: Tensor,
    pub output: Tensor,
    pub layers: Vec<Layer>,

    // Locks are declared before the mapping so residency is released before
    // the last mapping reference can go away.
    _locks: Vec<MemoryLock>,
    _mapping: Option<Arc<Mmap>>,
}

impl Model {
    /// Build the weight store from an opened loader. Every expected tensor
    /// is requested by exact name; the loader rejects missing names, shape
    /// mismatches and unrequested leftovers.
    pub fn load(
        loader: &mut ModelLoader,
        n_ctx: u32,
        use_mlock: bool,
        progress: &mut dyn FnMut(f32),
    ) -> Result<Self> {
        let mut hparams = loader.hparams().clone();
        hparams.n_ctx = n_ctx;
        let model_class = hparams.model_class();

        info!("format     = {}", loader.file_version().name());
        info!("n_vocab    = {}", hparams.n_vocab);
        info!("n_ctx      = {}", hparams.n_ctx);
        info!("n_embd     = {}", hparams.n_embd);
        info!("n_mult     = {}", hparams.n_mult);
        info!("n_head     = {}", hparams.n_head);
        info!("n_layer    = {}", hparams.n_layer);
        info!("n_rot      = {}", hparams.n_rot);
        info!("ftype      = {} ({})", hparams.ftype.to_u32(), hparams.ftype.name());
        info!("n_ff       = {}", hparams.n_ff());
        info!("n_parts    = {}", loader.n_parts());
        info!("model size = {}", model_class.name());

        let data_size = loader.total_data_size();
        let mem_required = data_size
            + model_class.mem_req_scratch0()
            + model_class.mem_req_scratch1()
            + model_class.mem_req_eval();
        info!(
            "mem required  = {:7.2} MB (+ {:7.2} MB per state)",
            mem_required as f64 / 1024.0 / 1024.0,
            model_class.mem_req_kv_self() as f64 / 1024.0 / 1024.0,
        );

        let expected = Self::expected_tensors(&hparams);
        let mut tensors = loader.load_tensors(&expected, progress, use_mlock)?;

        let mut take = |name: &str| -> Tensor {
            tensors
                .remove(name)
                .expect("expected tensor was validated by the loader")
        };

        let tok_embeddings = take("tok_embeddings.weight");
        let norm = take("norm.weight");
        let output = take("output.weight");
        let mut layers = Vec::with_capacity(hparams.n_layer as usize);
        for i in 0..hparams.n_layer {
            layers.push(Layer {
                attention_norm: take(&format!("layers.{i}.attention_norm.weight")),
                wq: take(&format!("layers.{i}.attention.wq.weight")),
                wk: take(&format!("layers.{i}.attention.wk.weight")),
                wv: take(&format!("layers.{i}.attention.wv.weight")),
                wo: take(&format!("layers.{i}.attention.wo.weight")),
                ffn_norm: take(&format!("layers.{i}.ffn_norm.weight")),
                w1: take(&format!("layers.{i}.feed_forward.w1.weight")),
                w2: take(&format!("layers.{i}.feed_forward.w2.weight")),
                w3: take(&format!("layers.{i}.feed_forward.w3.weight")),
            });
        }

        let mut locks = Vec::new();
        if let Some(lock) = loader.take_mmap_lock() {
            locks.push(lock);
        }

        let mut model = Self {
            hparams,
            model_class,
            tok_embeddings,
            norm,
            output,
            layers,
            _locks: locks,
            _mapping: loader.mapping(),
        };

        if use_mlock && !loader.use_mmap() {
            model.lock_owned_buffers();
        }
        Ok(model)
    }

    fn expected_tensors(hparams: &Hparams) -> Vec<(String, Vec<usize>)> {
        let n_embd = hparams.n_embd as usize;
        let n_vocab = hparams.n_vocab as usize;
        let n_ff = hparams.n_ff() as usize;

        let mut expected = vec![
            ("tok_embeddings.weight".to_string(), vec![n_embd, n_vocab]),
            ("norm.weight".to_string(), vec![n_embd]),
            ("output.weight".to_string(), vec![n_embd, n_vocab]),
        ];
        for i in 0..hparams.n_layer {
            let prefix = format!("layers.{i}");
            expected.push((format!("{prefix}.attention_norm.weight"), vec![n_embd]));
            expected.push((format!("{prefix}.attention.wq.weight"), vec![n_embd, n_embd]));
            expected.push((format!("{prefix}.attention.wk.weight"), vec![n_embd, n_embd]));
            expected.push((format!("{prefix}.attention.wv.weight"), vec![n_embd, n_embd]));
            expected.push((format!("{prefix}.attention.wo.weight"), vec![n_embd, n_embd]));
            expected.push((format!("{prefix}.ffn_norm.weight"), vec![n_embd]));
            expected.push((format!("{prefix}.feed_forward.w1.weight"), vec![n_embd, n_ff]));
            expected.push((format!("{prefix}.feed_forward.w2.weight"), vec![n_ff, n_embd]));
            expected.push((format!("{prefix}.feed_forward.w3.weight"), vec![n_embd, n_ff]));
        }
        expected
    }

    fn lock_owned_buffers(&mut self) {
        let mut locks = Vec::new();
        let mut lock = |tensor: &Tensor| {
            let bytes = tensor.bytes();
            let mut region = MemoryLock::new(bytes.as_ptr());
            region.grow_to(bytes.len());
            locks.push(region);
        };
        lock(&self.tok_embeddings);
        lock(&self.norm);
        lock(&self.output);
        for layer in &self.layers {
            for tensor in [
                &layer.attention_norm,
                &layer.wq,
                &layer.wk,
                &layer.wv,
                &layer.wo,
                &layer.ffn_norm,
                &layer.w1,
                &layer.w2,
                &layer.w3,
            ] {
                lock(tensor);
            }
        }
        self._locks.extend(locks);
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("hparams", &self.hparams)
            .field("model_class", &self.model_class)
            .field("n_tensors", &(3 + 9 * self.layers.len()))
            .finish()
    }
}

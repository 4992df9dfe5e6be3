//! Inference runtime for LLaMA-family decoder-only models.
//!
//! Loads quantized models in the ggml/ggmf/ggjt on-disk formats (including
//! multi-part splits), evaluates the transformer against a per-session
//! KV-cache, tokenizes text with the score-ranked byte-pair vocabulary,
//! samples next tokens, and requantizes models to 4-bit dtypes.

mod error;
mod eval;
mod file_io;
mod kv_cache;
mod loader;
mod model;
mod quantize;
mod sampler;
mod session;
mod tensor;
mod tokenizer;

pub use error::{Error, Result};
pub use kv_cache::KvDtype;
pub use loader::FileVersion;
pub use model::{Ftype, Hparams, ModelClass};
pub use quantize::quantize_model;
pub use session::{ProgressCallback, Session, SessionParams, Timings};
pub use tokenizer::{TokenId, Vocabulary, TOKEN_BOS, TOKEN_EOS};

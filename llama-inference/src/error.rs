//! Error kinds surfaced by the loader, session and quantizer.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown (magic, version) combination: {magic:#010x}, {version:#010x}; is this really a model file?")]
    BadMagic { magic: u32, version: u32 },

    #[error("unrecognized tensor dtype {0}")]
    UnknownDtype(u32),

    #[error("tensor '{name}' should not be {n_dims}-dimensional")]
    BadDimension { name: String, n_dims: u32 },

    #[error("tensor '{0}' is missing from the model file")]
    MissingTensor(String),

    #[error("model file contained more tensors than expected")]
    UnexpectedExtraTensor,

    #[error("tensor '{name}' has wrong shape; expected {expected:?}, got {actual:?}")]
    WrongShape {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("inconsistent tensor shards in '{name}': {reason}")]
    InconsistentShards { name: String, reason: String },

    #[error("hyperparameters inconsistent between model file parts")]
    InconsistentHparams,

    #[error("failed to allocate {0} bytes")]
    AllocationFailed(usize),

    #[error("tensor size overflows multiplying {a} * {b}")]
    Overflow { a: usize, b: usize },

    #[error("file type {0} is not a valid quantization target")]
    InvalidQuantizationTarget(u32),

    #[error("session state does not match this session: {0}")]
    StateMismatch(String),
}

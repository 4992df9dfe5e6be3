//! Per-session key/value attention cache.
//!
//! Both planes hold `n_layer * n_ctx * n_embd` elements in the session's
//! chosen precision. Keys are layer-major and position-minor: the slot for
//! layer `l`, position `p` starts at element `(l * n_ctx + p) * n_embd`.
//! Values are stored transposed within each layer (embedding-major,
//! position-minor) so that attention accumulates over positions with a
//! unit stride.

#[cfg(test)]
#[path = "../tests/unit/kv_cache_test.rs"]
mod kv_cache_test;

use crate::error::{Error, Result};
use half::f16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvDtype {
    F16,
    F32,
}

impl KvDtype {
    pub fn size(self) -> usize {
        match self {
            KvDtype::F16 => 2,
            KvDtype::F32 => 4,
        }
    }
}

enum KvBuf {
    F16(Vec<f16>),
    F32(Vec<f32>),
}

impl KvBuf {
    fn new(dtype: KvDtype, len: usize) -> Result<Self> {
        match dtype {
            KvDtype::F16 => {
                let mut data = Vec::new();
                data.try_reserve_exact(len)
                    .map_err(|_| Error::AllocationFailed(len * dtype.size()))?;
                data.resize(len, f16::ZERO);
                Ok(KvBuf::F16(data))
            }
            KvDtype::F32 => {
                let mut data = Vec::new();
                data.try_reserve_exact(len)
                    .map_err(|_| Error::AllocationFailed(len * dtype.size()))?;
                data.resize(len, 0.0);
                Ok(KvBuf::F32(data))
            }
        }
    }

    #[inline]
    fn set(&mut self, index: usize, value: f32) {
        match self {
            KvBuf::F16(data) => data[index] = f16::from_f32(value),
            KvBuf::F32(data) => data[index] = value,
        }
    }

    fn as_bytes(&self) -> &[u8] {
        // SAFETY: f16 and f32 are plain-old-data; the cache is snapshotted
        // and restored on the same host, so the native byte order round-trips.
        match self {
            KvBuf::F16(data) => unsafe {
                std::slice::from_raw_parts(data.as_ptr() as *const u8, data.len() * 2)
            },
            KvBuf::F32(data) => unsafe {
                std::slice::from_raw_parts(data.as_ptr() as *const u8, data.len() * 4)
            },
        }
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as for as_bytes; every bit pattern is a valid f16/f32.
        match self {
            KvBuf::F16(data) => unsafe {
                std::slice::from_raw_parts_mut(data.as_mut_ptr() as *mut u8, data.len() * 2)
            },
            KvBuf::F32(data) => unsafe {
                std::slice::from_raw_parts_mut(data.as_mut_ptr() as *mut u8, data.len() * 4)
            },
        }
    }
}

pub struct KvCache {
    k: KvBuf,
    v: KvBuf,
    dtype: KvDtype,
    n_layer: usize,
    n_ctx: usize,
    n_embd: usize,
    n: usize,
}

impl KvCache {
    pub fn new(n_layer: usize, n_ctx: usize, n_embd: usize, dtype: KvDtype) -> Result<Self> {
        let n_elements = n_layer * n_ctx * n_embd;
        Ok(Self {
            k: KvBuf::new(dtype, n_elements)?,
            v: KvBuf::new(dtype, n_elements)?,
            dtype,
            n_layer,
            n_ctx,
            n_embd,
            n: 0,
        })
    }

    pub fn dtype(&self) -> KvDtype {
        self.dtype
    }

    /// Tokens currently stored; positions `[0, n)` are valid.
    pub fn n_tokens(&self) -> usize {
        self.n
    }

    pub fn advance(&mut self, n_new: usize) {
        self.n += n_new;
        debug_assert!(self.n <= self.n_ctx);
    }

    /// Total bytes of both planes.
    pub fn size_bytes(&self) -> usize {
        2 * self.n_layer * self.n_ctx * self.n_embd * self.dtype.size()
    }

    /// Store keys for `keys.len() / n_embd` new positions of `layer`,
    /// starting at position `past`. `keys` is row-major `[N, n_embd]`.
    pub fn store_k(&mut self, layer: usize, past: usize, keys: &[f32]) {
        debug_assert_eq!(keys.len() % self.n_embd, 0);
        let base = (layer * self.n_ctx + past) * self.n_embd;
        for (i, &value) in keys.iter().enumerate() {
            self.k.set(base + i, value);
        }
    }

    /// Store values for new positions of `layer` starting at `past`;
    /// `vals` is row-major `[N, n_embd]` and lands transposed.
    pub fn store_v(&mut self, layer: usize, past: usize, vals: &[f32]) {
        debug_assert_eq!(vals.len() % self.n_embd, 0);
        let layer_base = layer * self.n_ctx * self.n_embd;
        for (t, row) in vals.chunks_exact(self.n_embd).enumerate() {
            let pos = past + t;
            for (e, &value) in row.iter().enumerate() {
                self.v.set(layer_base + e * self.n_ctx + pos, value);
            }
        }
    }

    /// Dot product of `q` with the key at (`layer`, `pos`), starting at
    /// element `head_offset` within the position's embedding.
    #[inline]
    pub fn k_dot(&self, layer: usize, pos: usize, head_offset: usize, q: &[f32]) -> f32 {
        let base = (layer * self.n_ctx + pos) * self.n_embd + head_offset;
        match &self.k {
            KvBuf::F16(data) => q
                .iter()
                .zip(&data[base..base + q.len()])
                .map(|(&a, &b)| a * b.to_f32())
                .sum(),
            KvBuf::F32(data) => q
                .iter()
                .zip(&data[base..base + q.len()])
                .map(|(&a, &b)| a * b)
                .sum(),
        }
    }

    /// `out[d] += weight * V[layer, pos, head_offset + d]`.
    #[inline]
    pub fn v_accumulate(
        &self,
        layer: usize,
        pos: usize,
        head_offset: usize,
        weight: f32,
        out: &mut [f32],
    ) {
        let base = layer * self.n_ctx * self.n_embd + head_offset * self.n_ctx + pos;
        match &self.v {
            KvBuf::F16(data) => {
                for (d, o) in out.iter_mut().enumerate() {
                    *o += weight * data[base + d * self.n_ctx].to_f32();
                }
            }
            KvBuf::F32(data) => {
                for (d, o) in out.iter_mut().enumerate() {
                    *o += weight * data[base + d * self.n_ctx];
                }
            }
        }
    }

    /// Raw snapshot, keys plane then values plane.
    pub fn copy_bytes_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.k.as_bytes());
        out.extend_from_slice(self.v.as_bytes());
    }

    /// Restore a snapshot taken from a cache with identical geometry.
    pub fn restore_bytes(&mut self, src: &[u8], n_tokens: usize) -> Result<()> {
        if src.len() != self.size_bytes() {
            return Err(Error::StateMismatch(format!(
                "kv cache is {} bytes, snapshot is {}",
                self.size_bytes(),
                src.len()
            )));
        }
        let half = src.len() / 2;
        self.k.as_bytes_mut().copy_from_slice(&src[..half]);
        self.v.as_bytes_mut().copy_from_slice(&src[half..]);
        self.n = n_tokens;
        Ok(())
    }

    /// Raw key-plane bytes, for tests and external snapshots.
    pub fn k_bytes(&self) -> &[u8] {
        self.k.as_bytes()
    }
}

#[cfg(test)]
#[path = "../tests/unit/tensor_test.rs"]
mod tensor_test;

use crate::error::{Error, Result};
use half::f16;
use memmap2::Mmap;
use rayon::prelude::*;
use std::sync::Arc;

/// Elements per block for the 4-bit quantized dtypes.
pub const QK: usize = 32;

const Q4_0_BLOCK_BYTES: usize = 4 + QK / 2;
const Q4_1_BLOCK_BYTES: usize = 8 + QK / 2;

/// On-disk element type of a tensor.
///
/// Q4_0 packs 32 elements into 20 bytes: an f32 scale followed by 16 bytes
/// of nibbles (low nibble = even element, bias 8). Q4_1 adds an f32 minimum
/// before the nibbles, 24 bytes per block.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dtype {
    F32,
    F16,
    Q4_0,
    Q4_1,
}

impl Dtype {
    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Dtype::F32),
            1 => Ok(Dtype::F16),
            2 => Ok(Dtype::Q4_0),
            3 => Ok(Dtype::Q4_1),
            other => Err(Error::UnknownDtype(other)),
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            Dtype::F32 => 0,
            Dtype::F16 => 1,
            Dtype::Q4_0 => 2,
            Dtype::Q4_1 => 3,
        }
    }

    /// Bytes occupied by one block of `block_size()` elements.
    pub fn element_size(self) -> usize {
        match self {
            Dtype::F32 => 4,
            Dtype::F16 => 2,
            Dtype::Q4_0 => Q4_0_BLOCK_BYTES,
            Dtype::Q4_1 => Q4_1_BLOCK_BYTES,
        }
    }

    /// Elements per block; 1 for the float dtypes.
    pub fn block_size(self) -> usize {
        match self {
            Dtype::F32 | Dtype::F16 => 1,
            Dtype::Q4_0 | Dtype::Q4_1 => QK,
        }
    }

    pub fn is_quantized(self) -> bool {
        matches!(self, Dtype::Q4_0 | Dtype::Q4_1)
    }

    pub fn name(self) -> &'static str {
        match self {
            Dtype::F32 => "f32",
            Dtype::F16 => "f16",
            Dtype::Q4_0 => "q4_0",
            Dtype::Q4_1 => "q4_1",
        }
    }
}

/// Byte size of a tensor with the given shape, with overflow checking.
pub fn tensor_size(ne: &[usize], dtype: Dtype) -> Result<usize> {
    let mut size = dtype.element_size();
    for &dim in ne {
        size = size
            .checked_mul(dim)
            .ok_or(Error::Overflow { a: size, b: dim })?;
    }
    Ok(size / dtype.block_size())
}

/// Backing storage for a tensor: a range of a shared read-only mapping, or
/// a buffer owned by the model.
pub enum TensorData {
    Owned(Vec<u8>),
    Mapped {
        map: Arc<Mmap>,
        offset: usize,
        len: usize,
    },
}

/// A named weight tensor with its dtype, shape and data.
pub struct Tensor {
    pub name: String,
    pub dtype: Dtype,
    pub ne: Vec<usize>,
    data: TensorData,
}

impl Tensor {
    pub fn new(name: String, dtype: Dtype, ne: Vec<usize>, data: TensorData) -> Self {
        Self {
            name,
            dtype,
            ne,
            data,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        match &self.data {
            TensorData::Owned(buf) => buf,
            TensorData::Mapped { map, offset, len } => &map[*offset..*offset + *len],
        }
    }

    pub fn nelements(&self) -> usize {
        self.ne.iter().product()
    }

    /// Number of rows; 1-D tensors are a single row.
    pub fn nrows(&self) -> usize {
        if self.ne.len() == 2 { self.ne[1] } else { 1 }
    }

    /// Elements per row.
    pub fn row_width(&self) -> usize {
        self.ne[0]
    }

    fn row_bytes(&self) -> usize {
        self.ne[0] / self.dtype.block_size() * self.dtype.element_size()
    }

    /// Dequantize row `row` into `dst` (`row_width()` floats).
    pub fn dequantize_row(&self, row: usize, dst: &mut [f32]) {
        debug_assert_eq!(dst.len(), self.row_width());
        let rb = self.row_bytes();
        dequantize(self.dtype, &self.bytes()[row * rb..(row + 1) * rb], dst);
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("name", &self.name)
            .field("dtype", &self.dtype)
            .field("ne", &self.ne)
            .field("mapped", &matches!(self.data, TensorData::Mapped { .. }))
            .finish()
    }
}

/// Dequantize `src` (raw bytes of `dtype`) into `dst`.
pub fn dequantize(dtype: Dtype, src: &[u8], dst: &mut [f32]) {
    match dtype {
        Dtype::F32 => {
            for (out, chunk) in dst.iter_mut().zip(src.chunks_exact(4)) {
                *out = f32::from_le_bytes(chunk.try_into().expect("chunk is 4 bytes"));
            }
        }
        Dtype::F16 => {
            for (out, chunk) in dst.iter_mut().zip(src.chunks_exact(2)) {
                *out = f16::from_le_bytes(chunk.try_into().expect("chunk is 2 bytes")).to_f32();
            }
        }
        Dtype::Q4_0 => {
            for (block, out) in src.chunks_exact(Q4_0_BLOCK_BYTES).zip(dst.chunks_mut(QK)) {
                let d = f32::from_le_bytes(block[..4].try_into().expect("scale is 4 bytes"));
                for (j, &packed) in block[4..].iter().enumerate() {
                    out[2 * j] = ((packed & 0x0F) as i32 - 8) as f32 * d;
                    out[2 * j + 1] = ((packed >> 4) as i32 - 8) as f32 * d;
                }
            }
        }
        Dtype::Q4_1 => {
            for (block, out) in src.chunks_exact(Q4_1_BLOCK_BYTES).zip(dst.chunks_mut(QK)) {
                let d = f32::from_le_bytes(block[..4].try_into().expect("scale is 4 bytes"));
                let m = f32::from_le_bytes(block[4..8].try_into().expect("min is 4 bytes"));
                for (j, &packed) in block[8..].iter().enumerate() {
                    out[2 * j] = (packed & 0x0F) as f32 * d + m;
                    out[2 * j + 1] = (packed >> 4) as f32 * d + m;
                }
            }
        }
    }
}

fn dot_row(dtype: Dtype, row: &[u8], x: &[f32]) -> f32 {
    match dtype {
        Dtype::F32 => row
            .chunks_exact(4)
            .zip(x)
            .map(|(chunk, &v)| f32::from_le_bytes(chunk.try_into().expect("chunk is 4 bytes")) * v)
            .sum(),
        Dtype::F16 => row
            .chunks_exact(2)
            .zip(x)
            .map(|(chunk, &v)| {
                f16::from_le_bytes(chunk.try_into().expect("chunk is 2 bytes")).to_f32() * v
            })
            .sum(),
        Dtype::Q4_0 => row
            .chunks_exact(Q4_0_BLOCK_BYTES)
            .zip(x.chunks_exact(QK))
            .map(|(block, xs)| {
                let d = f32::from_le_bytes(block[..4].try_into().expect("scale is 4 bytes"));
                let mut sum = 0.0f32;
                for (j, &packed) in block[4..].iter().enumerate() {
                    sum += ((packed & 0x0F) as i32 - 8) as f32 * xs[2 * j]
                        + ((packed >> 4) as i32 - 8) as f32 * xs[2 * j + 1];
                }
                sum * d
            })
            .sum(),
        Dtype::Q4_1 => row
            .chunks_exact(Q4_1_BLOCK_BYTES)
            .zip(x.chunks_exact(QK))
            .map(|(block, xs)| {
                let d = f32::from_le_bytes(block[..4].try_into().expect("scale is 4 bytes"));
                let m = f32::from_le_bytes(block[4..8].try_into().expect("min is 4 bytes"));
                let mut sum = 0.0f32;
                for (j, &packed) in block[8..].iter().enumerate() {
                    sum += ((packed & 0x0F) as f32 * d + m) * xs[2 * j]
                        + ((packed >> 4) as f32 * d + m) * xs[2 * j + 1];
                }
                sum
            })
            .sum(),
    }
}

/// `out[r] = dot(w.row(r), x)` for every row of `w`, in parallel.
pub fn matvec(out: &mut [f32], w: &Tensor, x: &[f32]) {
    assert_eq!(x.len(), w.row_width(), "input width mismatch for {}", w.name);
    assert_eq!(out.len(), w.nrows(), "output width mismatch for {}", w.name);

    let rb = w.row_bytes();
    let bytes = w.bytes();
    out.par_iter_mut().enumerate().for_each(|(r, out_val)| {
        *out_val = dot_row(w.dtype, &bytes[r * rb..(r + 1) * rb], x);
    });
}

/// Quantize `src` to Q4_0 blocks appended to `dst`, updating the 16-bin
/// nibble histogram. Returns the number of bytes written.
pub fn quantize_q4_0(src: &[f32], dst: &mut Vec<u8>, row_width: usize, hist: &mut [i64]) -> usize {
    assert_eq!(row_width % QK, 0);
    assert_eq!(src.len() % row_width, 0);
    assert_eq!(hist.len(), 16);

    let start = dst.len();
    for block in src.chunks_exact(QK) {
        let amax = block.iter().fold(0.0f32, |acc, &v| acc.max(v.abs()));
        let d = amax / 7.0;
        let id = if d != 0.0 { 1.0 / d } else { 0.0 };

        dst.extend_from_slice(&d.to_le_bytes());
        for pair in block.chunks_exact(2) {
            let q0 = ((pair[0] * id).round() as i8 + 8) as u8;
            let q1 = ((pair[1] * id).round() as i8 + 8) as u8;
            hist[(q0 & 0x0F) as usize] += 1;
            hist[(q1 & 0x0F) as usize] += 1;
            dst.push((q0 & 0x0F) | (q1 << 4));
        }
    }
    dst.len() - start
}

/// Quantize `src` to Q4_1 blocks appended to `dst`. Returns bytes written.
pub fn quantize_q4_1(src: &[f32], dst: &mut Vec<u8>, row_width: usize, hist: &mut [i64]) -> usize {
    assert_eq!(row_width % QK, 0);
    assert_eq!(src.len() % row_width, 0);
    assert_eq!(hist.len(), 16);

    let start = dst.len();
    for block in src.chunks_exact(QK) {
        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        for &v in block {
            min = min.min(v);
            max = max.max(v);
        }
        let d = (max - min) / 15.0;
        let id = if d != 0.0 { 1.0 / d } else { 0.0 };

        dst.extend_from_slice(&d.to_le_bytes());
        dst.extend_from_slice(&min.to_le_bytes());
        for pair in block.chunks_exact(2) {
            let q0 = (((pair[0] - min) * id).round() as u8).min(15);
            let q1 = (((pair[1] - min) * id).round() as u8).min(15);
            hist[q0 as usize] += 1;
            hist[q1 as usize] += 1;
            dst.push(q0 | (q1 << 4));
        }
    }
    dst.len() - start
}

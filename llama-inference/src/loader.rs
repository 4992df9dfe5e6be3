//! Model-file loader for the ggml/ggmf/ggjt binary formats.
//!
//! Parses the header, vocabulary and tensor metadata of one or more model
//! parts, reconciles per-part shards into logical tensors, and loads tensor
//! data either through buffered reads or a shared read-only mapping.

#[cfg(test)]
#[path = "../tests/unit/loader_test.rs"]
mod loader_test;

use crate::error::{Error, Result};
use crate::file_io::{MemoryLock, ModelFileReader, ModelFileWriter};
use crate::model::{Ftype, Hparams};
use crate::tensor::{tensor_size, Dtype, Tensor, TensorData};
use log::{info, warn};
use memmap2::Mmap;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const MAGIC_GGML: u32 = u32::from_le_bytes(*b"ggml");
const MAGIC_GGMF: u32 = u32::from_le_bytes(*b"ggmf");
const MAGIC_GGJT: u32 = u32::from_le_bytes(*b"ggjt");

/// Tensor payloads in ggjt files are padded to this boundary, which is what
/// makes them mappable.
pub const TENSOR_ALIGNMENT: u64 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FileVersion {
    /// Legacy 'ggml' magic: no per-token scores, no alignment padding.
    Ggml,
    /// Added the version field and vocabulary scores.
    GgmfV1,
    /// Added tensor alignment padding, enabling mmap.
    GgjtV1,
}

impl FileVersion {
    pub fn name(self) -> &'static str {
        match self {
            FileVersion::Ggml => "'ggml' (old version with low tokenizer quality and no mmap support)",
            FileVersion::GgmfV1 => "ggmf v1 (old version with no mmap support)",
            FileVersion::GgjtV1 => "ggjt v1 (latest)",
        }
    }

    fn has_scores(self) -> bool {
        self >= FileVersion::GgmfV1
    }

    fn has_padding(self) -> bool {
        self >= FileVersion::GgjtV1
    }
}

/// How a logical tensor is distributed over the model parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitType {
    None,
    ByColumns,
    ByRows,
}

/// One tensor's occurrence in one model part.
#[derive(Debug, Clone)]
pub struct TensorShard {
    pub ne: Vec<usize>,
    pub dtype: Dtype,
    pub size: usize,
    pub file_idx: usize,
    pub file_off: u64,
}

/// A logical tensor reconciled across all parts.
#[derive(Debug)]
pub struct LoadTensor {
    pub name: String,
    pub dtype: Dtype,
    pub split_type: SplitType,
    pub ne: Vec<usize>,
    pub size: usize,
    pub shards: Vec<TensorShard>,
}

impl LoadTensor {
    fn new(name: String) -> Self {
        Self {
            name,
            dtype: Dtype::F32,
            split_type: SplitType::None,
            ne: Vec::new(),
            size: 0,
            shards: Vec::new(),
        }
    }

    fn finalize(&mut self) -> Result<()> {
        let first = &self.shards[0];
        for shard in &self.shards {
            if shard.dtype != first.dtype {
                return Err(Error::InconsistentShards {
                    name: self.name.clone(),
                    reason: format!("dtype {:?} vs {:?}", shard.dtype, first.dtype),
                });
            }
            if shard.ne != first.ne {
                return Err(Error::InconsistentShards {
                    name: self.name.clone(),
                    reason: format!("shape {:?} vs {:?}", shard.ne, first.ne),
                });
            }
        }
        self.dtype = first.dtype;

        // 1-D tensors are duplicated in every part; single-part tensors are
        // whole already.
        self.split_type = if first.ne.len() == 1 || self.shards.len() == 1 {
            SplitType::None
        } else if self.name.starts_with("tok_embeddings.")
            || self.name.ends_with(".attention.wo.weight")
            || self.name.ends_with(".feed_forward.w2.weight")
        {
            SplitType::ByColumns
        } else {
            SplitType::ByRows
        };

        let n_shards = self.shards.len();
        self.ne = match self.split_type {
            SplitType::None => first.ne.clone(),
            SplitType::ByColumns => vec![
                first.ne[0]
                    .checked_mul(n_shards)
                    .ok_or(Error::Overflow {
                        a: first.ne[0],
                        b: n_shards,
                    })?,
                first.ne[1],
            ],
            SplitType::ByRows => vec![
                first.ne[0],
                first.ne[1]
                    .checked_mul(n_shards)
                    .ok_or(Error::Overflow {
                        a: first.ne[1],
                        b: n_shards,
                    })?,
            ],
        };
        self.size = tensor_size(&self.ne, self.dtype)?;
        Ok(())
    }
}

#[derive(Default)]
struct TensorsMap {
    tensors: Vec<LoadTensor>,
    name_to_idx: HashMap<String, usize>,
}

/// Header, vocabulary and tensor metadata of a single model part.
struct FileLoader {
    file: ModelFileReader,
    version: FileVersion,
    hparams: Hparams,
    vocab_tokens: Vec<(Vec<u8>, f32)>,
}

impl FileLoader {
    fn open(path: &Path, file_idx: usize, tensors_map: &mut TensorsMap) -> Result<Self> {
        info!("loading model part from {}", path.display());
        let mut file = ModelFileReader::open(path)?;

        let version = Self::read_magic(&mut file)?;
        let hparams = Self::read_hparams(&mut file)?;
        let vocab_tokens = Self::read_vocab(&mut file, version, hparams.n_vocab as usize)?;

        let mut loader = Self {
            file,
            version,
            hparams,
            vocab_tokens,
        };
        loader.read_tensor_metadata(file_idx, tensors_map)?;
        Ok(loader)
    }

    fn read_magic(file: &mut ModelFileReader) -> Result<FileVersion> {
        let magic = file.read_u32()?;
        if magic == MAGIC_GGML {
            return Ok(FileVersion::Ggml);
        }
        let version = file.read_u32()?;
        match (magic, version) {
            (MAGIC_GGMF, 1) => Ok(FileVersion::GgmfV1),
            (MAGIC_GGJT, 1) => Ok(FileVersion::GgjtV1),
            _ => Err(Error::BadMagic { magic, version }),
        }
    }

    fn read_hparams(file: &mut ModelFileReader) -> Result<Hparams> {
        Ok(Hparams {
            n_vocab: file.read_u32()?,
            n_ctx: 0,
            n_embd: file.read_u32()?,
            n_mult: file.read_u32()?,
            n_head: file.read_u32()?,
            n_layer: file.read_u32()?,
            n_rot: file.read_u32()?,
            ftype: Ftype::from_u32(file.read_u32()?),
        })
    }

    fn read_vocab(
        file: &mut ModelFileReader,
        version: FileVersion,
        n_vocab: usize,
    ) -> Result<Vec<(Vec<u8>, f32)>> {
        let mut tokens = Vec::with_capacity(n_vocab);
        for _ in 0..n_vocab {
            let len = file.read_u32()? as usize;
            let text = file.read_bytes(len)?;
            let score = if version.has_scores() {
                file.read_f32()?
            } else {
                0.0
            };
            tokens.push((text, score));
        }
        Ok(tokens)
    }

    fn read_tensor_metadata(&mut self, file_idx: usize, tensors_map: &mut TensorsMap) -> Result<()> {
        while self.file.tell()? < self.file.size() {
            let n_dims = self.file.read_u32()?;
            let name_len = self.file.read_u32()? as usize;
            let dtype = Dtype::from_u32(self.file.read_u32()?)?;
            if !(1..=2).contains(&n_dims) {
                return Err(Error::BadDimension {
                    name: format!("tensor #{}", tensors_map.tensors.len()),
                    n_dims,
                });
            }
            let mut ne = Vec::with_capacity(n_dims as usize);
            for _ in 0..n_dims {
                ne.push(self.file.read_u32()? as usize);
            }
            let name = String::from_utf8_lossy(&self.file.read_bytes(name_len)?).into_owned();

            if self.version.has_padding() {
                // skip to the next multiple of 32 bytes
                let skip = self.file.tell()?.wrapping_neg() & (TENSOR_ALIGNMENT - 1);
                self.file.seek(SeekFrom::Current(skip as i64))?;
            }

            let size = tensor_size(&ne, dtype)?;
            let shard = TensorShard {
                ne,
                dtype,
                size,
                file_idx,
                file_off: self.file.tell()?,
            };
            self.file.seek(SeekFrom::Current(size as i64))?;

            let idx = match tensors_map.name_to_idx.get(&name) {
                Some(&idx) => idx,
                None => {
                    tensors_map.tensors.push(LoadTensor::new(name.clone()));
                    let idx = tensors_map.tensors.len() - 1;
                    tensors_map.name_to_idx.insert(name, idx);
                    idx
                }
            };
            tensors_map.tensors[idx].shards.push(shard);
        }
        Ok(())
    }
}

/// Loader over all parts of a model, exposing the reconciled tensor map.
pub struct ModelLoader {
    file_loaders: Vec<FileLoader>,
    tensors_map: TensorsMap,
    use_mmap: bool,
    mapping: Option<Arc<Mmap>>,
    mmap_lock: Option<MemoryLock>,
}

impl ModelLoader {
    /// Open `base` plus its numbered sibling parts (`base.1`, `base.2`, …).
    /// `n_parts` overrides the part count inferred from the embedding width.
    pub fn open(
        base: &Path,
        n_parts: Option<u32>,
        use_mmap: bool,
        vocab_only: bool,
    ) -> Result<Self> {
        let mut tensors_map = TensorsMap::default();
        let first = FileLoader::open(base, 0, &mut tensors_map)?;
        let mut file_loaders = vec![first];

        let n_parts = if vocab_only {
            1
        } else {
            match n_parts {
                Some(n) => n,
                None => Self::guess_n_parts(&tensors_map, &file_loaders[0].hparams)?,
            }
        };
        for i in 1..n_parts {
            let mut os = base.as_os_str().to_owned();
            os.push(format!(".{i}"));
            let path = PathBuf::from(os);
            let ith = FileLoader::open(&path, i as usize, &mut tensors_map)?;
            if ith.hparams != file_loaders[0].hparams {
                return Err(Error::InconsistentHparams);
            }
            file_loaders.push(ith);
        }

        for tensor in &mut tensors_map.tensors {
            tensor.finalize()?;
        }

        let mut use_mmap = use_mmap;
        if use_mmap && Self::alignment_prevents_mmap(&tensors_map) {
            warn!("can't use mmap because tensors are not aligned; convert to the ggjt format to avoid this");
            use_mmap = false;
        }

        Ok(Self {
            file_loaders,
            tensors_map,
            use_mmap,
            mapping: None,
            mmap_lock: None,
        })
    }

    fn guess_n_parts(tensors_map: &TensorsMap, hparams: &Hparams) -> Result<u32> {
        let idx = tensors_map
            .name_to_idx
            .get("tok_embeddings.weight")
            .ok_or_else(|| Error::MissingTensor("tok_embeddings.weight".to_string()))?;
        let shard_width = tensors_map.tensors[*idx].shards[0].ne[0] as u32;
        Ok(hparams.n_embd / shard_width)
    }

    // The format nominally pads to 32 bytes, but any 4-byte aligned file maps
    // fine, so only reject on that.
    fn alignment_prevents_mmap(tensors_map: &TensorsMap) -> bool {
        tensors_map
            .tensors
            .iter()
            .flat_map(|t| &t.shards)
            .any(|shard| shard.file_off & 3 != 0)
    }

    pub fn hparams(&self) -> &Hparams {
        &self.file_loaders[0].hparams
    }

    pub fn file_version(&self) -> FileVersion {
        self.file_loaders[0].version
    }

    pub fn n_parts(&self) -> usize {
        self.file_loaders.len()
    }

    pub fn use_mmap(&self) -> bool {
        self.use_mmap
    }

    pub fn take_vocab(&mut self) -> Vec<(Vec<u8>, f32)> {
        std::mem::take(&mut self.file_loaders[0].vocab_tokens)
    }

    pub fn tensors(&self) -> &[LoadTensor] {
        &self.tensors_map.tensors
    }

    /// Total bytes of reconciled tensor data across all parts.
    pub fn total_data_size(&self) -> usize {
        self.tensors_map.tensors.iter().map(|t| t.size).sum()
    }

    pub fn mapping(&self) -> Option<Arc<Mmap>> {
        self.mapping.clone()
    }

    /// Hand off the residency lock so it lives exactly as long as the model.
    pub fn take_mmap_lock(&mut self) -> Option<MemoryLock> {
        self.mmap_lock.take()
    }

    /// Load every tensor named in `expected`, validating the request set
    /// against the file contents both ways, in file order. Progress is
    /// reported as loaded-bytes over total-bytes; with mmap plus pinning the
    /// lock grows after each tensor so read pages stay resident.
    pub fn load_tensors(
        &mut self,
        expected: &[(String, Vec<usize>)],
        progress: &mut dyn FnMut(f32),
        use_mlock: bool,
    ) -> Result<HashMap<String, Tensor>> {
        for (name, ne) in expected {
            let idx = self
                .tensors_map
                .name_to_idx
                .get(name)
                .ok_or_else(|| Error::MissingTensor(name.clone()))?;
            let tensor = &self.tensors_map.tensors[*idx];
            if &tensor.ne != ne {
                return Err(Error::WrongShape {
                    name: name.clone(),
                    expected: ne.clone(),
                    actual: tensor.ne.clone(),
                });
            }
        }
        if expected.len() != self.tensors_map.tensors.len() {
            return Err(Error::UnexpectedExtraTensor);
        }

        if self.use_mmap && self.mapping.is_none() {
            let mapping = self.file_loaders[0].file.map()?;
            if use_mlock {
                self.mmap_lock = Some(MemoryLock::new(mapping.as_ptr()));
            }
            self.mapping = Some(mapping);
        }

        let data_size = self.total_data_size();
        let mut done_size = 0usize;
        let mut out = HashMap::with_capacity(expected.len());
        for idx in 0..self.tensors_map.tensors.len() {
            progress(done_size as f32 / data_size as f32);
            let data = self.load_data_for(idx)?;
            let tensor = &self.tensors_map.tensors[idx];
            done_size += tensor.size;
            if let Some(mlock) = self.mmap_lock.as_mut() {
                mlock.grow_to(done_size);
            }
            out.insert(
                tensor.name.clone(),
                Tensor::new(tensor.name.clone(), tensor.dtype, tensor.ne.clone(), data),
            );
        }
        progress(1.0);
        Ok(out)
    }

    /// Read one reconciled tensor's bytes through buffered I/O (the
    /// quantizer path; also the fallback when mapping is off).
    pub fn load_tensor_data(&mut self, idx: usize) -> Result<Vec<u8>> {
        match self.load_data_for_buffered(idx)? {
            TensorData::Owned(buf) => Ok(buf),
            TensorData::Mapped { .. } => unreachable!("buffered load produced a mapping"),
        }
    }

    fn load_data_for(&mut self, idx: usize) -> Result<TensorData> {
        if self.use_mmap {
            let tensor = &self.tensors_map.tensors[idx];
            // A mappable file is never split.
            assert_eq!(tensor.shards.len(), 1, "mmap requires single-shard tensors");
            let map = self.mapping.clone().expect("mapping was created above");
            return Ok(TensorData::Mapped {
                map,
                offset: tensor.shards[0].file_off as usize,
                len: tensor.size,
            });
        }
        self.load_data_for_buffered(idx)
    }

    fn load_data_for_buffered(&mut self, idx: usize) -> Result<TensorData> {
        let tensor = &self.tensors_map.tensors[idx];
        let split_type = tensor.split_type;
        let size = tensor.size;
        let num_rows = *tensor.ne.last().expect("tensor has at least one dim");
        let shards = tensor.shards.clone();

        let mut data = vec![0u8; size];
        match split_type {
            SplitType::None => {
                let file = &mut self.file_loaders[shards[0].file_idx].file;
                file.seek(SeekFrom::Start(shards[0].file_off))?;
                file.read_into(&mut data)?;
            }
            SplitType::ByRows => {
                let mut offset = 0;
                for shard in &shards {
                    let file = &mut self.file_loaders[shard.file_idx].file;
                    file.seek(SeekFrom::Start(shard.file_off))?;
                    file.read_into(&mut data[offset..offset + shard.size])?;
                    offset += shard.size;
                }
                debug_assert_eq!(offset, size);
            }
            SplitType::ByColumns => {
                // Per-shard data is row-major over the shard's narrow width;
                // interleave rows to get row-major over the full width.
                let mut tmp_bufs = Vec::with_capacity(shards.len());
                for shard in &shards {
                    let file = &mut self.file_loaders[shard.file_idx].file;
                    file.seek(SeekFrom::Start(shard.file_off))?;
                    let mut buf = vec![0u8; shard.size];
                    file.read_into(&mut buf)?;
                    tmp_bufs.push(buf);
                }
                let per_shard_row_size = shards[0].size / num_rows;
                let mut out_offset = 0;
                for row in 0..num_rows {
                    for tmp_buf in &tmp_bufs {
                        data[out_offset..out_offset + per_shard_row_size].copy_from_slice(
                            &tmp_buf[row * per_shard_row_size..(row + 1) * per_shard_row_size],
                        );
                        out_offset += per_shard_row_size;
                    }
                }
                debug_assert_eq!(out_offset, size);
            }
        }
        Ok(TensorData::Owned(data))
    }
}

/// Writes a model in the latest (ggjt v1) format; used by the quantizer.
pub struct FileSaver {
    file: ModelFileWriter,
}

impl FileSaver {
    pub fn create(
        path: &Path,
        hparams: &Hparams,
        new_ftype: Ftype,
        vocab_tokens: &[(Vec<u8>, f32)],
        source_version: FileVersion,
    ) -> Result<Self> {
        info!("saving model to {}", path.display());
        let mut file = ModelFileWriter::create(path)?;

        file.write_all(b"ggjt")?;
        file.write_u32(1)?;

        file.write_u32(hparams.n_vocab)?;
        file.write_u32(hparams.n_embd)?;
        file.write_u32(hparams.n_mult)?;
        file.write_u32(hparams.n_head)?;
        file.write_u32(hparams.n_layer)?;
        file.write_u32(hparams.n_rot)?;
        file.write_u32(new_ftype.to_u32())?;

        if !source_version.has_scores() {
            warn!("input is an old file without vocabulary scores; writing zero scores");
        }
        for (text, score) in vocab_tokens {
            file.write_u32(text.len() as u32)?;
            file.write_all(text)?;
            file.write_f32(*score)?;
        }

        Ok(Self { file })
    }

    pub fn write_tensor(
        &mut self,
        name: &str,
        dtype: Dtype,
        ne: &[usize],
        data: &[u8],
    ) -> Result<()> {
        debug_assert_eq!(data.len(), tensor_size(ne, dtype)?);
        self.file.write_u32(ne.len() as u32)?;
        self.file.write_u32(name.len() as u32)?;
        self.file.write_u32(dtype.to_u32())?;
        for &dim in ne {
            self.file.write_u32(dim as u32)?;
        }
        self.file.write_all(name.as_bytes())?;
        self.file.pad_to(TENSOR_ALIGNMENT)?;
        self.file.write_all(data)?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<()> {
        self.file.flush()
    }
}

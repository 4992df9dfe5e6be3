use super::*;
use crate::model::ModelClass;
use std::path::PathBuf;
use tempfile::TempDir;

struct FileBuilder {
    buf: Vec<u8>,
    version: FileVersion,
}

impl FileBuilder {
    fn new(version: FileVersion) -> Self {
        let mut buf = Vec::new();
        match version {
            FileVersion::Ggml => buf.extend_from_slice(b"ggml"),
            FileVersion::GgmfV1 => {
                buf.extend_from_slice(b"ggmf");
                buf.extend_from_slice(&1u32.to_le_bytes());
            }
            FileVersion::GgjtV1 => {
                buf.extend_from_slice(b"ggjt");
                buf.extend_from_slice(&1u32.to_le_bytes());
            }
        }
        Self { buf, version }
    }

    fn hparams(mut self, fields: [u32; 7]) -> Self {
        for v in fields {
            self.buf.extend_from_slice(&v.to_le_bytes());
        }
        self
    }

    fn vocab_token(mut self, text: &[u8], score: f32) -> Self {
        self.buf.extend_from_slice(&(text.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(text);
        if self.version.has_scores() {
            self.buf.extend_from_slice(&score.to_le_bytes());
        }
        self
    }

    fn tensor(mut self, name: &str, dtype: Dtype, ne: &[u32], data: &[u8]) -> Self {
        self.buf.extend_from_slice(&(ne.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(&(name.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(&dtype.to_u32().to_le_bytes());
        for &dim in ne {
            self.buf.extend_from_slice(&dim.to_le_bytes());
        }
        self.buf.extend_from_slice(name.as_bytes());
        if self.version.has_padding() {
            while self.buf.len() % TENSOR_ALIGNMENT as usize != 0 {
                self.buf.push(0);
            }
        }
        self.buf.extend_from_slice(data);
        self
    }

    fn raw(mut self, bytes: &[u8]) -> Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    fn write(self, dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, &self.buf).unwrap();
        path
    }
}

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn nop_progress() -> impl FnMut(f32) {
    |_| {}
}

// hparams with n_embd = 4 so a shard width of 2 infers two parts
const HPARAMS_2PART: [u32; 7] = [4, 4, 32, 1, 1, 4, 0];

#[test]
fn magic_detection_accepts_all_three_versions() {
    let dir = TempDir::new().unwrap();

    let cases = [
        (FileVersion::Ggml, "legacy"),
        (FileVersion::GgmfV1, "ggmf"),
        (FileVersion::GgjtV1, "ggjt"),
    ];
    for (version, name) in cases {
        let path = FileBuilder::new(version)
            .hparams([0, 4, 32, 1, 1, 4, 0])
            .write(&dir, name);
        let loader = ModelLoader::open(&path, None, false, true).unwrap();
        assert_eq!(loader.file_version(), version);
    }
}

#[test]
fn unknown_magic_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad");
    std::fs::write(&path, b"xxxxyyyyzzzz").unwrap();
    assert!(matches!(
        ModelLoader::open(&path, None, false, true),
        Err(Error::BadMagic { .. })
    ));
}

#[test]
fn unknown_version_is_rejected() {
    let dir = TempDir::new().unwrap();
    let mut bytes = b"ggmf".to_vec();
    bytes.extend_from_slice(&2u32.to_le_bytes());
    let path = dir.path().join("v2");
    std::fs::write(&path, &bytes).unwrap();
    assert!(matches!(
        ModelLoader::open(&path, None, false, true),
        Err(Error::BadMagic { magic: _, version: 2 })
    ));
}

#[test]
fn ggmf_vocab_carries_scores() {
    let dir = TempDir::new().unwrap();
    let path = FileBuilder::new(FileVersion::GgmfV1)
        .hparams([2, 4, 32, 1, 1, 4, 0])
        .vocab_token(b"hello", 1.5)
        .vocab_token(b"world", -0.5)
        .write(&dir, "scored");

    let mut loader = ModelLoader::open(&path, None, false, true).unwrap();
    let vocab = loader.take_vocab();
    assert_eq!(vocab[0], (b"hello".to_vec(), 1.5));
    assert_eq!(vocab[1], (b"world".to_vec(), -0.5));
}

#[test]
fn legacy_vocab_gets_zero_scores() {
    let dir = TempDir::new().unwrap();
    let path = FileBuilder::new(FileVersion::Ggml)
        .hparams([2, 4, 32, 1, 1, 4, 0])
        .vocab_token(b"a", 9.0) // score ignored by the writer for this version
        .vocab_token(b"b", 9.0)
        .write(&dir, "legacy");

    let mut loader = ModelLoader::open(&path, None, false, true).unwrap();
    let vocab = loader.take_vocab();
    assert_eq!(vocab[0].1, 0.0);
    assert_eq!(vocab[1].1, 0.0);
}

#[test]
fn ggjt_tensor_offsets_are_aligned() {
    let dir = TempDir::new().unwrap();
    let path = FileBuilder::new(FileVersion::GgjtV1)
        .hparams([2, 4, 32, 1, 1, 4, 0])
        .vocab_token(b"a", 0.0)
        .vocab_token(b"b", 0.0)
        .tensor(
            "tok_embeddings.weight",
            Dtype::F32,
            &[4, 2],
            &f32_bytes(&[0.0; 8]),
        )
        .tensor("norm.weight", Dtype::F32, &[4], &f32_bytes(&[1.0; 4]))
        .write(&dir, "aligned");

    let loader = ModelLoader::open(&path, None, true, false).unwrap();
    assert!(loader.use_mmap());
    for tensor in loader.tensors() {
        for shard in &tensor.shards {
            assert_eq!(shard.file_off % TENSOR_ALIGNMENT, 0, "{}", tensor.name);
        }
    }
}

#[test]
fn unaligned_file_falls_back_to_buffered_reads() {
    let dir = TempDir::new().unwrap();
    let path = FileBuilder::new(FileVersion::GgmfV1)
        .hparams([1, 4, 32, 1, 1, 4, 0])
        .vocab_token(b"a", 0.0)
        .tensor(
            "tok_embeddings.weight",
            Dtype::F32,
            &[4, 1],
            &f32_bytes(&[0.0; 4]),
        )
        .write(&dir, "unaligned");

    let loader = ModelLoader::open(&path, None, true, false).unwrap();
    assert!(!loader.use_mmap());
}

#[test]
fn bad_dimension_count_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = FileBuilder::new(FileVersion::GgmfV1)
        .hparams([0, 4, 32, 1, 1, 4, 0])
        .raw(&3u32.to_le_bytes()) // n_dims
        .raw(&1u32.to_le_bytes()) // name_len
        .raw(&0u32.to_le_bytes()) // dtype
        .write(&dir, "threedee");
    assert!(matches!(
        ModelLoader::open(&path, None, false, true),
        Err(Error::BadDimension { n_dims: 3, .. })
    ));
}

#[test]
fn unknown_dtype_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = FileBuilder::new(FileVersion::GgmfV1)
        .hparams([0, 4, 32, 1, 1, 4, 0])
        .raw(&1u32.to_le_bytes()) // n_dims
        .raw(&1u32.to_le_bytes()) // name_len
        .raw(&9u32.to_le_bytes()) // dtype
        .write(&dir, "odd-dtype");
    assert!(matches!(
        ModelLoader::open(&path, None, false, true),
        Err(Error::UnknownDtype(9))
    ));
}

fn two_part_model(dir: &TempDir) -> PathBuf {
    // Part 0 and part 1 carry a column-split embedding matrix, a row-split
    // attention matrix, and a duplicated 1-D norm vector.
    let shard0_emb: Vec<f32> = vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0];
    let shard1_emb: Vec<f32> = vec![10.0, 11.0, 12.0, 13.0, 14.0, 15.0, 16.0, 17.0];
    let shard0_wq: Vec<f32> = (0..8).map(|i| i as f32).collect();
    let shard1_wq: Vec<f32> = (0..8).map(|i| 100.0 + i as f32).collect();

    let base = FileBuilder::new(FileVersion::GgmfV1)
        .hparams(HPARAMS_2PART)
        .vocab_token(b"a", 0.0)
        .vocab_token(b"b", 0.0)
        .vocab_token(b"c", 0.0)
        .vocab_token(b"d", 0.0)
        .tensor(
            "tok_embeddings.weight",
            Dtype::F32,
            &[2, 4],
            &f32_bytes(&shard0_emb),
        )
        .tensor(
            "layers.0.attention.wq.weight",
            Dtype::F32,
            &[4, 2],
            &f32_bytes(&shard0_wq),
        )
        .tensor("norm.weight", Dtype::F32, &[4], &f32_bytes(&[1.0, 2.0, 3.0, 4.0]))
        .write(dir, "model");
    FileBuilder::new(FileVersion::GgmfV1)
        .hparams(HPARAMS_2PART)
        .vocab_token(b"a", 0.0)
        .vocab_token(b"b", 0.0)
        .vocab_token(b"c", 0.0)
        .vocab_token(b"d", 0.0)
        .tensor(
            "tok_embeddings.weight",
            Dtype::F32,
            &[2, 4],
            &f32_bytes(&shard1_emb),
        )
        .tensor(
            "layers.0.attention.wq.weight",
            Dtype::F32,
            &[4, 2],
            &f32_bytes(&shard1_wq),
        )
        .tensor("norm.weight", Dtype::F32, &[4], &f32_bytes(&[9.0, 9.0, 9.0, 9.0]))
        .write(dir, "model.1");
    base
}

#[test]
fn column_split_interleaves_rows() {
    let dir = TempDir::new().unwrap();
    let base = two_part_model(&dir);

    let mut loader = ModelLoader::open(&base, None, false, false).unwrap();
    assert_eq!(loader.n_parts(), 2);

    let expected = vec![
        ("tok_embeddings.weight".to_string(), vec![4usize, 4]),
        ("layers.0.attention.wq.weight".to_string(), vec![4, 4]),
        ("norm.weight".to_string(), vec![4]),
    ];
    let tensors = loader
        .load_tensors(&expected, &mut nop_progress(), false)
        .unwrap();

    // row 0 of the embedding = concat(shard0 row 0, shard1 row 0)
    let emb = &tensors["tok_embeddings.weight"];
    assert_eq!(emb.ne, vec![4, 4]);
    let mut row = [0.0f32; 4];
    emb.dequantize_row(0, &mut row);
    assert_eq!(row, [0.0, 1.0, 10.0, 11.0]);
    emb.dequantize_row(3, &mut row);
    assert_eq!(row, [6.0, 7.0, 16.0, 17.0]);
}

#[test]
fn row_split_concatenates_shards() {
    let dir = TempDir::new().unwrap();
    let base = two_part_model(&dir);

    let mut loader = ModelLoader::open(&base, None, false, false).unwrap();
    let expected = vec![
        ("tok_embeddings.weight".to_string(), vec![4usize, 4]),
        ("layers.0.attention.wq.weight".to_string(), vec![4, 4]),
        ("norm.weight".to_string(), vec![4]),
    ];
    let tensors = loader
        .load_tensors(&expected, &mut nop_progress(), false)
        .unwrap();

    let wq = &tensors["layers.0.attention.wq.weight"];
    let mut row = [0.0f32; 4];
    wq.dequantize_row(0, &mut row);
    assert_eq!(row, [0.0, 1.0, 2.0, 3.0]);
    wq.dequantize_row(2, &mut row);
    assert_eq!(row, [100.0, 101.0, 102.0, 103.0]);

    // 1-D tensors are duplicated per part; the first copy wins
    let norm = &tensors["norm.weight"];
    norm.dequantize_row(0, &mut row);
    assert_eq!(row, [1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn inconsistent_hparams_between_parts_are_rejected() {
    let dir = TempDir::new().unwrap();
    FileBuilder::new(FileVersion::GgmfV1)
        .hparams(HPARAMS_2PART)
        .vocab_token(b"a", 0.0)
        .vocab_token(b"b", 0.0)
        .vocab_token(b"c", 0.0)
        .vocab_token(b"d", 0.0)
        .tensor(
            "tok_embeddings.weight",
            Dtype::F32,
            &[2, 4],
            &f32_bytes(&[0.0; 8]),
        )
        .write(&dir, "model");
    let mut other = HPARAMS_2PART;
    other[2] = 64; // different n_mult
    FileBuilder::new(FileVersion::GgmfV1)
        .hparams(other)
        .vocab_token(b"a", 0.0)
        .vocab_token(b"b", 0.0)
        .vocab_token(b"c", 0.0)
        .vocab_token(b"d", 0.0)
        .tensor(
            "tok_embeddings.weight",
            Dtype::F32,
            &[2, 4],
            &f32_bytes(&[0.0; 8]),
        )
        .write(&dir, "model.1");

    assert!(matches!(
        ModelLoader::open(dir.path().join("model").as_path(), None, false, false),
        Err(Error::InconsistentHparams)
    ));
}

#[test]
fn inconsistent_shard_dtypes_are_rejected() {
    let dir = TempDir::new().unwrap();
    FileBuilder::new(FileVersion::GgmfV1)
        .hparams(HPARAMS_2PART)
        .vocab_token(b"a", 0.0)
        .vocab_token(b"b", 0.0)
        .vocab_token(b"c", 0.0)
        .vocab_token(b"d", 0.0)
        .tensor(
            "tok_embeddings.weight",
            Dtype::F32,
            &[2, 4],
            &f32_bytes(&[0.0; 8]),
        )
        .write(&dir, "model");
    let f16_data: Vec<u8> = (0..8)
        .flat_map(|_| half::f16::from_f32(0.0).to_le_bytes())
        .collect();
    FileBuilder::new(FileVersion::GgmfV1)
        .hparams(HPARAMS_2PART)
        .vocab_token(b"a", 0.0)
        .vocab_token(b"b", 0.0)
        .vocab_token(b"c", 0.0)
        .vocab_token(b"d", 0.0)
        .tensor("tok_embeddings.weight", Dtype::F16, &[2, 4], &f16_data)
        .write(&dir, "model.1");

    assert!(matches!(
        ModelLoader::open(dir.path().join("model").as_path(), None, false, false),
        Err(Error::InconsistentShards { .. })
    ));
}

fn single_tensor_file(dir: &TempDir) -> PathBuf {
    FileBuilder::new(FileVersion::GgjtV1)
        .hparams([1, 4, 32, 1, 1, 4, 0])
        .vocab_token(b"a", 0.0)
        .tensor(
            "tok_embeddings.weight",
            Dtype::F32,
            &[4, 1],
            &f32_bytes(&[1.0, 2.0, 3.0, 4.0]),
        )
        .tensor("norm.weight", Dtype::F32, &[4], &f32_bytes(&[1.0; 4]))
        .write(dir, "single")
}

#[test]
fn requesting_a_wrong_shape_fails() {
    let dir = TempDir::new().unwrap();
    let path = single_tensor_file(&dir);
    let mut loader = ModelLoader::open(&path, None, false, false).unwrap();
    let expected = vec![
        ("tok_embeddings.weight".to_string(), vec![8usize, 1]),
        ("norm.weight".to_string(), vec![4]),
    ];
    assert!(matches!(
        loader.load_tensors(&expected, &mut nop_progress(), false),
        Err(Error::WrongShape { .. })
    ));
}

#[test]
fn requesting_a_missing_tensor_fails() {
    let dir = TempDir::new().unwrap();
    let path = single_tensor_file(&dir);
    let mut loader = ModelLoader::open(&path, None, false, false).unwrap();
    let expected = vec![("output.weight".to_string(), vec![4usize, 1])];
    assert!(matches!(
        loader.load_tensors(&expected, &mut nop_progress(), false),
        Err(Error::MissingTensor(name)) if name == "output.weight"
    ));
}

#[test]
fn leaving_a_file_tensor_unrequested_fails() {
    let dir = TempDir::new().unwrap();
    let path = single_tensor_file(&dir);
    let mut loader = ModelLoader::open(&path, None, false, false).unwrap();
    let expected = vec![("tok_embeddings.weight".to_string(), vec![4usize, 1])];
    assert!(matches!(
        loader.load_tensors(&expected, &mut nop_progress(), false),
        Err(Error::UnexpectedExtraTensor)
    ));
}

#[test]
fn mapped_and_buffered_loads_agree() {
    let dir = TempDir::new().unwrap();
    let path = single_tensor_file(&dir);
    let expected = vec![
        ("tok_embeddings.weight".to_string(), vec![4usize, 1]),
        ("norm.weight".to_string(), vec![4]),
    ];

    let mut mapped = ModelLoader::open(&path, None, true, false).unwrap();
    assert!(mapped.use_mmap());
    let mapped_tensors = mapped
        .load_tensors(&expected, &mut nop_progress(), false)
        .unwrap();

    let mut buffered = ModelLoader::open(&path, None, false, false).unwrap();
    let buffered_tensors = buffered
        .load_tensors(&expected, &mut nop_progress(), false)
        .unwrap();

    for (name, _) in &expected {
        assert_eq!(
            mapped_tensors[name].bytes(),
            buffered_tensors[name].bytes(),
            "{name}"
        );
    }
}

#[test]
fn missing_embedding_tensor_prevents_part_inference() {
    let dir = TempDir::new().unwrap();
    let path = FileBuilder::new(FileVersion::GgmfV1)
        .hparams([1, 4, 32, 1, 1, 4, 0])
        .vocab_token(b"a", 0.0)
        .tensor("norm.weight", Dtype::F32, &[4], &f32_bytes(&[1.0; 4]))
        .write(&dir, "no-embeddings");
    assert!(matches!(
        ModelLoader::open(&path, None, false, false),
        Err(Error::MissingTensor(_))
    ));
}

#[test]
fn derived_hparams_match_known_model_shapes() {
    let hparams = Hparams {
        n_vocab: 32000,
        n_ctx: 512,
        n_embd: 4096,
        n_mult: 256,
        n_head: 32,
        n_layer: 32,
        n_rot: 64,
        ftype: Ftype::MostlyF16,
    };
    assert_eq!(hparams.n_ff(), 11008);
    assert_eq!(hparams.head_dim(), 128);
    assert_eq!(hparams.model_class(), ModelClass::Model7B);

    for (n_layer, class) in [
        (32, ModelClass::Model7B),
        (40, ModelClass::Model13B),
        (60, ModelClass::Model30B),
        (80, ModelClass::Model65B),
        (12, ModelClass::Unknown),
    ] {
        let hp = Hparams { n_layer, ..hparams.clone() };
        assert_eq!(hp.model_class(), class);
    }
}

//! On-disk model format.
//!
//! A model file is a fixed [`ModelHeader`], the vocabulary as a `u32` count
//! followed by length-prefixed UTF-8 strings, then every `f32` tensor of the
//! [`Transformer`] in declaration order. Integers and floats are stored in
//! native byte order, little-endian on every supported target.

use bytemuck::{Pod, Zeroable};
use memmap2::MmapOptions;
use ndarray::{Array, Array1, Array2, Dimension};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::borrow::Cow;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use crate::error::{LLModelError, Result};
use crate::model::{ModelArgs, Transformer};
use crate::tokenizer::{BOS_TOKEN, EOS_TOKEN, UNK_TOKEN};

/// Magic bytes at the start of every model file.
pub const MODEL_MAGIC: [u8; 4] = *b"LLMR";

/// Current format version.
pub const MODEL_VERSION: u32 = 1;

/// Size in bytes of [`ModelHeader`].
pub const HEADER_LEN: usize = std::mem::size_of::<ModelHeader>();

/// Words used for the vocabulary of demo models, after the special tokens.
pub const DEMO_WORDS: &[&str] = &[
    "hello", "world", "how", "are", "you", "i", "am", "fine", "the", "a", "model", "is",
    "running", "on", "this", "machine", "and", "it", "says", "thanks", "for", "asking",
    "what", "can", "do", "today", "good", "morning", "night", "yes", "no", "maybe",
];

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct ModelHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub max_seq_len: u32,
    pub vocab_size: u32,
    pub dim: u32,
    pub n_layers: u32,
    pub n_heads: u32,
    pub hidden_dim: u32,
}

impl ModelHeader {
    pub fn new(args: &ModelArgs) -> Self {
        Self {
            magic: MODEL_MAGIC,
            version: MODEL_VERSION,
            max_seq_len: args.max_seq_len as u32,
            vocab_size: args.vocab_size as u32,
            dim: args.dim as u32,
            n_layers: args.n_layers as u32,
            n_heads: args.n_heads as u32,
            hidden_dim: args.hidden_dim as u32,
        }
    }

    pub fn args(&self) -> ModelArgs {
        ModelArgs {
            max_seq_len: self.max_seq_len as usize,
            vocab_size: self.vocab_size as usize,
            dim: self.dim as usize,
            n_layers: self.n_layers as usize,
            n_heads: self.n_heads as usize,
            hidden_dim: self.hidden_dim as usize,
        }
    }

    /// Parse and validate a header from the start of `bytes`.
    ///
    /// Content without the magic is reported as unsupported so that other
    /// implementations may be tried; anything after the magic that does not
    /// make sense is an invalid model.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < MODEL_MAGIC.len() || bytes[..MODEL_MAGIC.len()] != MODEL_MAGIC {
            return Err(LLModelError::Unsupported("missing LLMR magic".to_string()));
        }
        if bytes.len() < HEADER_LEN {
            return Err(LLModelError::invalid_model("truncated header"));
        }
        let header: ModelHeader = bytemuck::pod_read_unaligned(&bytes[..HEADER_LEN]);
        header.validate()?;
        Ok(header)
    }

    /// Read only the header of the file at `path`.
    pub fn read_from_path(path: &Path) -> Result<Self> {
        let mut bytes = Vec::with_capacity(HEADER_LEN);
        File::open(path)?
            .take(HEADER_LEN as u64)
            .read_to_end(&mut bytes)?;
        Self::parse(&bytes)
    }

    fn validate(&self) -> Result<()> {
        if self.version != MODEL_VERSION {
            return Err(LLModelError::invalid_model(format!(
                "unsupported version {}",
                self.version
            )));
        }
        if self.max_seq_len == 0 || self.dim == 0 || self.n_layers == 0 || self.hidden_dim == 0 {
            return Err(LLModelError::invalid_model("zero-sized hyper-parameter"));
        }
        if self.n_heads == 0 || self.dim % self.n_heads != 0 {
            return Err(LLModelError::invalid_model(format!(
                "dim {} is not divisible by {} heads",
                self.dim, self.n_heads
            )));
        }
        if self.vocab_size < 3 {
            return Err(LLModelError::invalid_model("vocabulary is too small"));
        }
        Ok(())
    }
}

/// Cursor over the tensor section of a model file.
pub struct TensorReader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> TensorReader<'a> {
    pub fn new(buf: &'a [u8], offset: usize) -> Self {
        Self { buf, offset }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| {
                LLModelError::invalid_model(format!(
                    "unexpected end of file at byte {} (wanted {} more)",
                    self.offset, len
                ))
            })?;
        let bytes = &self.buf[self.offset..end];
        self.offset = end;
        Ok(bytes)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| LLModelError::invalid_model("vocabulary entry is not UTF-8"))
    }

    pub fn read_f32s(&mut self, n: usize) -> Result<Vec<f32>> {
        let len = n
            .checked_mul(4)
            .ok_or_else(|| LLModelError::invalid_model("tensor too large"))?;
        let bytes = self.take(len)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    pub fn read_array1(&mut self, n: usize) -> Result<Array1<f32>> {
        Ok(Array1::from(self.read_f32s(n)?))
    }

    pub fn read_array2(&mut self, rows: usize, cols: usize) -> Result<Array2<f32>> {
        let data = self.read_f32s(rows * cols)?;
        Array2::from_shape_vec((rows, cols), data)
            .map_err(|e| LLModelError::invalid_model(format!("tensor shape: {}", e)))
    }
}

/// Sequential writer for the model format.
pub struct TensorWriter<W: Write> {
    inner: W,
}

impl<W: Write> TensorWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn write_u32(&mut self, v: u32) -> Result<()> {
        self.inner.write_all(&v.to_ne_bytes())?;
        Ok(())
    }

    pub fn write_string(&mut self, s: &str) -> Result<()> {
        self.write_u32(s.len() as u32)?;
        self.inner.write_all(s.as_bytes())?;
        Ok(())
    }

    pub fn write_tensor<D: Dimension>(&mut self, t: &Array<f32, D>) -> Result<()> {
        let contiguous = t.as_standard_layout();
        let values: Cow<'_, [f32]> = match contiguous.as_slice() {
            Some(s) => Cow::Borrowed(s),
            None => Cow::Owned(contiguous.iter().copied().collect()),
        };
        self.inner.write_all(bytemuck::cast_slice(&*values))?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// A complete model: hyper-parameters, vocabulary and weights.
pub struct ModelFile {
    pub vocab: Vec<String>,
    pub transformer: Transformer,
}

impl ModelFile {
    /// Build a model with seeded random weights over `vocab`.
    pub fn new(mut args: ModelArgs, vocab: Vec<String>, seed: u64) -> Self {
        args.vocab_size = vocab.len();
        let transformer = Transformer::new(args, &mut StdRng::seed_from_u64(seed));
        Self { vocab, transformer }
    }

    /// A small model over [`DEMO_WORDS`], handy for smoke tests and the CLI.
    pub fn demo(args: ModelArgs, seed: u64) -> Self {
        let vocab = [UNK_TOKEN, BOS_TOKEN, EOS_TOKEN]
            .iter()
            .chain(DEMO_WORDS.iter())
            .map(|s| s.to_string())
            .collect();
        Self::new(args, vocab, seed)
    }

    pub fn args(&self) -> &ModelArgs {
        &self.transformer.args
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = TensorWriter::new(BufWriter::new(file));
        writer.inner.write_all(bytemuck::bytes_of(&ModelHeader::new(self.args())))?;
        writer.write_u32(self.vocab.len() as u32)?;
        for token in &self.vocab {
            writer.write_string(token)?;
        }
        self.transformer.write(&mut writer)?;
        writer.into_inner().flush()?;
        Ok(())
    }

    /// Memory-map and parse the file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Err(LLModelError::Unsupported("empty file".to_string()));
        }
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        Self::from_bytes(&mmap[..])
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header = ModelHeader::parse(bytes)?;
        let args = header.args();
        let mut reader = TensorReader::new(bytes, HEADER_LEN);

        let n_vocab = reader.read_u32()? as usize;
        if n_vocab != args.vocab_size {
            return Err(LLModelError::invalid_model(format!(
                "vocabulary has {} entries, header says {}",
                n_vocab, args.vocab_size
            )));
        }
        let vocab = (0..n_vocab)
            .map(|_| reader.read_string())
            .collect::<Result<Vec<_>>>()?;

        let transformer = Transformer::read(&mut reader, args)?;
        if reader.offset() != bytes.len() {
            return Err(LLModelError::invalid_model(format!(
                "{} trailing bytes after tensors",
                bytes.len() - reader.offset()
            )));
        }
        Ok(Self { vocab, transformer })
    }
}

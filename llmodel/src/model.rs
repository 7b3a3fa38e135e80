use ndarray::{s, Array1, Array2, Axis};
use rand::Rng;
use std::io::Write;

use crate::error::Result;
use crate::format::{TensorReader, TensorWriter};

/// Configuration for the transformer model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelArgs {
    /// Maximum sequence length supported, also the context window.
    pub max_seq_len: usize,
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Embedding/hidden dimension.
    pub dim: usize,
    /// Number of layers.
    pub n_layers: usize,
    /// Number of attention heads.
    pub n_heads: usize,
    /// Hidden dimension of the feed-forward network.
    pub hidden_dim: usize,
}

impl Default for ModelArgs {
    fn default() -> Self {
        Self {
            max_seq_len: 128,
            vocab_size: 1024,
            dim: 64,
            n_layers: 2,
            n_heads: 4,
            hidden_dim: 256,
        }
    }
}

impl ModelArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of `f32` parameters in a model with these arguments.
    pub fn param_count(&self) -> usize {
        let per_layer = 2 * self.dim + 4 * self.dim * self.dim + 2 * self.dim * self.hidden_dim;
        2 * self.vocab_size * self.dim + self.n_layers * per_layer + self.dim
    }
}

/// Embedding layer mapping token ids to vectors.
pub struct Embedding {
    weight: Array2<f32>, // vocab_size x dim
}

impl Embedding {
    pub fn new(vocab_size: usize, dim: usize, rng: &mut impl Rng) -> Self {
        let weight = Array2::from_shape_fn((vocab_size, dim), |_| rng.gen_range(-0.1..0.1));
        Self { weight }
    }

    pub fn forward(&self, tokens: &[usize]) -> Array2<f32> {
        let mut out = Array2::<f32>::zeros((tokens.len(), self.weight.ncols()));
        for (i, &tok) in tokens.iter().enumerate() {
            out.row_mut(i).assign(&self.weight.row(tok));
        }
        out
    }

    fn read(reader: &mut TensorReader<'_>, vocab_size: usize, dim: usize) -> Result<Self> {
        Ok(Self { weight: reader.read_array2(vocab_size, dim)? })
    }

    fn write<W: Write>(&self, writer: &mut TensorWriter<W>) -> Result<()> {
        writer.write_tensor(&self.weight)
    }
}

/// Fully connected layer without bias.
pub struct Linear {
    weight: Array2<f32>, // out x in
}

impl Linear {
    pub fn new(in_features: usize, out_features: usize, rng: &mut impl Rng) -> Self {
        let weight =
            Array2::from_shape_fn((out_features, in_features), |_| rng.gen_range(-0.1..0.1));
        Self { weight }
    }

    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        x.dot(&self.weight.t())
    }

    fn read(reader: &mut TensorReader<'_>, in_features: usize, out_features: usize) -> Result<Self> {
        Ok(Self { weight: reader.read_array2(out_features, in_features)? })
    }

    fn write<W: Write>(&self, writer: &mut TensorWriter<W>) -> Result<()> {
        writer.write_tensor(&self.weight)
    }
}

/// Root mean square layer normalization.
pub struct RMSNorm {
    weight: Array1<f32>,
    eps: f32,
}

impl RMSNorm {
    pub fn new(dim: usize) -> Self {
        Self {
            weight: Array1::ones(dim),
            eps: 1e-6,
        }
    }

    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let mean = x
            .mapv(|v| v * v)
            .mean_axis(Axis(1))
            .unwrap_or_else(|| Array1::zeros(x.nrows()));
        let denom = mean.mapv(|m| (m + self.eps).sqrt()).insert_axis(Axis(1));
        let norm = x / &denom;
        norm * &self.weight.view().insert_axis(Axis(0))
    }

    fn read(reader: &mut TensorReader<'_>, dim: usize) -> Result<Self> {
        Ok(Self { weight: reader.read_array1(dim)?, eps: 1e-6 })
    }

    fn write<W: Write>(&self, writer: &mut TensorWriter<W>) -> Result<()> {
        writer.write_tensor(&self.weight)
    }
}

/// Causal multi-head self attention.
pub struct Attention {
    wq: Linear,
    wk: Linear,
    wv: Linear,
    wo: Linear,
    n_heads: usize,
    head_dim: usize,
}

impl Attention {
    pub fn new(dim: usize, n_heads: usize, rng: &mut impl Rng) -> Self {
        let head_dim = dim / n_heads;
        Self {
            wq: Linear::new(dim, dim, rng),
            wk: Linear::new(dim, dim, rng),
            wv: Linear::new(dim, dim, rng),
            wo: Linear::new(dim, dim, rng),
            n_heads,
            head_dim,
        }
    }

    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let q = self.wq.forward(x);
        let k = self.wk.forward(x);
        let v = self.wv.forward(x);
        let seq = x.nrows();
        let scale = (self.head_dim as f32).sqrt();

        let mut out = Array2::<f32>::zeros((seq, self.n_heads * self.head_dim));
        for h in 0..self.n_heads {
            let cols = h * self.head_dim..(h + 1) * self.head_dim;
            let qh = q.slice(s![.., cols.clone()]);
            let kh = k.slice(s![.., cols.clone()]);
            let vh = v.slice(s![.., cols.clone()]);
            let mut out_h = out.slice_mut(s![.., cols]);

            for i in 0..seq {
                // position i only attends to positions 0..=i
                let mut scores: Vec<f32> = (0..=i)
                    .map(|j| qh.row(i).dot(&kh.row(j)) / scale)
                    .collect();
                let max = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
                let mut sum = 0.0;
                for s in scores.iter_mut() {
                    *s = (*s - max).exp();
                    sum += *s;
                }
                for (j, s) in scores.iter().enumerate() {
                    let coeff = s / sum;
                    for d in 0..self.head_dim {
                        out_h[[i, d]] += coeff * vh[[j, d]];
                    }
                }
            }
        }
        self.wo.forward(&out)
    }

    fn read(reader: &mut TensorReader<'_>, dim: usize, n_heads: usize) -> Result<Self> {
        Ok(Self {
            wq: Linear::read(reader, dim, dim)?,
            wk: Linear::read(reader, dim, dim)?,
            wv: Linear::read(reader, dim, dim)?,
            wo: Linear::read(reader, dim, dim)?,
            n_heads,
            head_dim: dim / n_heads,
        })
    }

    fn write<W: Write>(&self, writer: &mut TensorWriter<W>) -> Result<()> {
        self.wq.write(writer)?;
        self.wk.write(writer)?;
        self.wv.write(writer)?;
        self.wo.write(writer)
    }
}

/// Simple feed-forward network using SILU activation.
pub struct MLP {
    w1: Linear,
    w2: Linear,
}

impl MLP {
    pub fn new(dim: usize, hidden_dim: usize, rng: &mut impl Rng) -> Self {
        Self {
            w1: Linear::new(dim, hidden_dim, rng),
            w2: Linear::new(hidden_dim, dim, rng),
        }
    }

    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let hidden = self.w1.forward(x).mapv(|v| v * (1.0 / (1.0 + (-v).exp()))); // silu
        self.w2.forward(&hidden)
    }

    fn read(reader: &mut TensorReader<'_>, dim: usize, hidden_dim: usize) -> Result<Self> {
        Ok(Self {
            w1: Linear::read(reader, dim, hidden_dim)?,
            w2: Linear::read(reader, hidden_dim, dim)?,
        })
    }

    fn write<W: Write>(&self, writer: &mut TensorWriter<W>) -> Result<()> {
        self.w1.write(writer)?;
        self.w2.write(writer)
    }
}

/// Transformer block consisting of attention and feed-forward layers.
pub struct Block {
    attn_norm: RMSNorm,
    attn: Attention,
    ffn_norm: RMSNorm,
    ffn: MLP,
}

impl Block {
    pub fn new(args: &ModelArgs, rng: &mut impl Rng) -> Self {
        Self {
            attn_norm: RMSNorm::new(args.dim),
            attn: Attention::new(args.dim, args.n_heads, rng),
            ffn_norm: RMSNorm::new(args.dim),
            ffn: MLP::new(args.dim, args.hidden_dim, rng),
        }
    }

    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let h = self.attn_norm.forward(x);
        let h = self.attn.forward(&h);
        let x = x + &h;
        let h = self.ffn_norm.forward(&x);
        let h = self.ffn.forward(&h);
        x + &h
    }

    fn read(reader: &mut TensorReader<'_>, args: &ModelArgs) -> Result<Self> {
        Ok(Self {
            attn_norm: RMSNorm::read(reader, args.dim)?,
            attn: Attention::read(reader, args.dim, args.n_heads)?,
            ffn_norm: RMSNorm::read(reader, args.dim)?,
            ffn: MLP::read(reader, args.dim, args.hidden_dim)?,
        })
    }

    fn write<W: Write>(&self, writer: &mut TensorWriter<W>) -> Result<()> {
        self.attn_norm.write(writer)?;
        self.attn.write(writer)?;
        self.ffn_norm.write(writer)?;
        self.ffn.write(writer)
    }
}

/// Decoder-only transformer used for generation and embedding.
pub struct Transformer {
    pub args: ModelArgs,
    embed: Embedding,
    layers: Vec<Block>,
    norm: RMSNorm,
    head: Linear,
}

impl Transformer {
    /// Build a model with random weights drawn from `rng`.
    pub fn new(args: ModelArgs, rng: &mut impl Rng) -> Self {
        let embed = Embedding::new(args.vocab_size, args.dim, rng);
        let layers = (0..args.n_layers).map(|_| Block::new(&args, rng)).collect();
        let norm = RMSNorm::new(args.dim);
        let head = Linear::new(args.dim, args.vocab_size, rng);
        Self { args, embed, layers, norm, head }
    }

    /// Final normalised hidden states, one row per token.
    pub fn hidden(&self, tokens: &[usize]) -> Array2<f32> {
        let mut h = self.embed.forward(tokens);
        for layer in &self.layers {
            h = layer.forward(&h);
        }
        self.norm.forward(&h)
    }

    /// Logits over the vocabulary, one row per token.
    pub fn forward(&self, tokens: &[usize]) -> Array2<f32> {
        let h = self.hidden(tokens);
        self.head.forward(&h)
    }

    /// Logits for the position after the last token.
    pub fn next_logits(&self, tokens: &[usize]) -> Array1<f32> {
        let logits = self.forward(tokens);
        logits.row(logits.nrows() - 1).to_owned()
    }

    pub(crate) fn read(reader: &mut TensorReader<'_>, args: ModelArgs) -> Result<Self> {
        let embed = Embedding::read(reader, args.vocab_size, args.dim)?;
        let layers = (0..args.n_layers)
            .map(|_| Block::read(reader, &args))
            .collect::<Result<Vec<_>>>()?;
        let norm = RMSNorm::read(reader, args.dim)?;
        let head = Linear::read(reader, args.dim, args.vocab_size)?;
        Ok(Self { args, embed, layers, norm, head })
    }

    pub(crate) fn write<W: Write>(&self, writer: &mut TensorWriter<W>) -> Result<()> {
        self.embed.write(writer)?;
        for layer in &self.layers {
            layer.write(writer)?;
        }
        self.norm.write(writer)?;
        self.head.write(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn small_args() -> ModelArgs {
        ModelArgs {
            max_seq_len: 16,
            vocab_size: 20,
            dim: 8,
            n_layers: 1,
            n_heads: 2,
            hidden_dim: 16,
        }
    }

    #[test]
    fn test_forward_shapes() {
        let args = small_args();
        let model = Transformer::new(args.clone(), &mut StdRng::seed_from_u64(1));
        let tokens = vec![1_usize, 2, 3];
        let logits = model.forward(&tokens);
        assert_eq!(logits.nrows(), tokens.len());
        assert_eq!(logits.ncols(), args.vocab_size);
        assert_eq!(model.hidden(&tokens).ncols(), args.dim);
    }

    #[test]
    fn test_attention_is_causal() {
        let model = Transformer::new(small_args(), &mut StdRng::seed_from_u64(2));
        let short = model.forward(&[4, 5]);
        let long = model.forward(&[4, 5, 6, 7]);
        for (a, b) in short.row(1).iter().zip(long.row(1).iter()) {
            assert!((a - b).abs() < 1e-5, "later tokens leaked into earlier positions");
        }
    }

    #[test]
    fn test_same_seed_same_weights() {
        let a = Transformer::new(small_args(), &mut StdRng::seed_from_u64(7));
        let b = Transformer::new(small_args(), &mut StdRng::seed_from_u64(7));
        assert_eq!(a.next_logits(&[1, 2]), b.next_logits(&[1, 2]));
    }

    #[test]
    fn test_param_count() {
        let args = small_args();
        // embed 160 + layer (16 + 256 + 256) + norm 8 + head 160
        assert_eq!(args.param_count(), 160 + 528 + 8 + 160);
    }
}

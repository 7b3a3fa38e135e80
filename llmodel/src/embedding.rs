//! Embedding options and pooling helpers.

use ndarray::{Array1, Array2, Axis};

use crate::error::{LLModelError, Result};

/// Prefixes accepted in Atlas-compatible mode.
pub const ATLAS_PREFIXES: &[&str] = &["search_query", "search_document", "classification", "clustering"];

/// Prefix used in Atlas mode when the caller gives none.
pub const ATLAS_DEFAULT_PREFIX: &str = "search_document";

/// Longest text, in tokens, Atlas mode accepts when averaging.
pub const ATLAS_MAX_TOKENS: usize = 8192;

/// Texts evaluated between two checks of the cancel callback.
pub const EMBED_BATCH_TEXTS: usize = 8;

#[derive(Debug, Clone, Default)]
pub struct EmbedOptions<'a> {
    /// Instruction prefix applied to every text as `"{prefix}: {text}"`.
    pub prefix: Option<&'a str>,
    /// Truncate each vector to this many dimensions.
    pub dimensionality: Option<usize>,
    /// Average window-sized chunks of long texts instead of truncating them.
    pub do_mean: bool,
    /// Behave like the Nomic Atlas API.
    pub atlas: bool,
}

impl<'a> EmbedOptions<'a> {
    /// Floats produced per text for a model of `native` dimensions.
    pub fn output_size(&self, native: usize) -> usize {
        match self.dimensionality {
            Some(d) if d > 0 => d.min(native),
            _ => native,
        }
    }

    /// The prefix to apply, after Atlas validation.
    pub fn effective_prefix(&self) -> Result<Option<&'a str>> {
        if !self.atlas {
            return Ok(self.prefix);
        }
        match self.prefix {
            None => Ok(Some(ATLAS_DEFAULT_PREFIX)),
            Some(p) if ATLAS_PREFIXES.contains(&p) => Ok(Some(p)),
            Some(p) => Err(LLModelError::embedding(format!(
                "prefix '{}' is not supported in Atlas mode",
                p
            ))),
        }
    }
}

pub fn apply_prefix(prefix: Option<&str>, text: &str) -> String {
    match prefix {
        Some(p) => format!("{}: {}", p, text),
        None => text.to_string(),
    }
}

/// Split `tokens` into windows of at most `n_ctx`. Without `do_mean` only the
/// first window is kept.
pub fn chunk_tokens(tokens: &[usize], n_ctx: usize, do_mean: bool) -> Vec<&[usize]> {
    let n_ctx = n_ctx.max(1);
    if do_mean {
        tokens.chunks(n_ctx).collect()
    } else {
        vec![&tokens[..tokens.len().min(n_ctx)]]
    }
}

/// Mean of the rows of `hidden`.
pub fn mean_pool(hidden: &Array2<f32>) -> Array1<f32> {
    hidden
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(hidden.ncols()))
}

pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn output_size_caps_at_native() {
        let opts = |d| EmbedOptions { dimensionality: d, ..Default::default() };
        assert_eq!(opts(None).output_size(64), 64);
        assert_eq!(opts(Some(0)).output_size(64), 64);
        assert_eq!(opts(Some(16)).output_size(64), 16);
        assert_eq!(opts(Some(128)).output_size(64), 64);
    }

    #[test]
    fn atlas_prefixes() {
        let atlas = |prefix| EmbedOptions { prefix, atlas: true, ..Default::default() };
        assert_eq!(atlas(None).effective_prefix().unwrap(), Some("search_document"));
        assert_eq!(atlas(Some("clustering")).effective_prefix().unwrap(), Some("clustering"));
        assert!(atlas(Some("summarize")).effective_prefix().is_err());

        let plain = EmbedOptions { prefix: Some("summarize"), ..Default::default() };
        assert_eq!(plain.effective_prefix().unwrap(), Some("summarize"));
    }

    #[test]
    fn chunking() {
        let tokens: Vec<usize> = (0..10).collect();
        assert_eq!(chunk_tokens(&tokens, 4, true).len(), 3);
        let truncated = chunk_tokens(&tokens, 4, false);
        assert_eq!(truncated, vec![&tokens[..4]]);
    }

    #[test]
    fn pooling_and_normalizing() {
        let hidden = array![[1.0_f32, 3.0], [3.0, 1.0]];
        let mut pooled = mean_pool(&hidden).to_vec();
        assert_eq!(pooled, vec![2.0, 2.0]);
        l2_normalize(&mut pooled);
        assert_abs_diff_eq!(pooled[0], std::f32::consts::FRAC_1_SQRT_2, epsilon = 1e-6);
    }
}

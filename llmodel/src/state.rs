//! Serialized generation state.
//!
//! The blob is a [`StateHeader`] followed by the logits of the last position
//! in context. The tokens in context travel separately so callers can keep
//! them next to the blob.

use bytemuck::{Pod, Zeroable};

use crate::engine::Token;
use crate::error::{LLModelError, Result};
use crate::model::ModelArgs;

pub const STATE_MAGIC: [u8; 4] = *b"LLST";
pub const STATE_VERSION: u32 = 1;
pub const STATE_HEADER_LEN: usize = std::mem::size_of::<StateHeader>();

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct StateHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub vocab_size: u32,
    pub n_ctx: u32,
    pub dim: u32,
    pub n_past: u32,
    pub seed: u64,
    pub step: u64,
}

/// Generation state that is independent of the token history.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub n_past: usize,
    pub seed: u64,
    pub step: u64,
    /// Logits for the next position, empty when nothing is in context.
    pub logits: Vec<f32>,
}

/// Exact blob size for a model with `args`.
pub fn state_size(args: &ModelArgs) -> usize {
    STATE_HEADER_LEN + args.vocab_size * std::mem::size_of::<f32>()
}

/// Write `snapshot` into the front of `dest`.
///
/// Fails without touching `dest` when it cannot hold the whole blob.
pub fn encode(args: &ModelArgs, snapshot: &Snapshot, dest: &mut [u8]) -> Result<usize> {
    let size = state_size(args);
    if dest.len() < size {
        return Err(LLModelError::state(format!(
            "destination holds {} bytes, state needs {}",
            dest.len(),
            size
        )));
    }
    if !snapshot.logits.is_empty() && snapshot.logits.len() != args.vocab_size {
        return Err(LLModelError::state(format!(
            "{} logits for a vocabulary of {}",
            snapshot.logits.len(),
            args.vocab_size
        )));
    }

    let header = StateHeader {
        magic: STATE_MAGIC,
        version: STATE_VERSION,
        vocab_size: args.vocab_size as u32,
        n_ctx: args.max_seq_len as u32,
        dim: args.dim as u32,
        n_past: snapshot.n_past as u32,
        seed: snapshot.seed,
        step: snapshot.step,
    };
    let (head, body) = dest[..size].split_at_mut(STATE_HEADER_LEN);
    head.copy_from_slice(bytemuck::bytes_of(&header));
    if snapshot.logits.is_empty() {
        body.fill(0);
    } else {
        body.copy_from_slice(bytemuck::cast_slice(&snapshot.logits[..]));
    }
    Ok(size)
}

/// Parse and validate a blob against `args` and the accompanying tokens.
pub fn decode(args: &ModelArgs, src: &[u8], input_tokens: &[Token]) -> Result<Snapshot> {
    let size = state_size(args);
    if src.len() != size {
        return Err(LLModelError::state(format!(
            "blob is {} bytes, this model expects {}",
            src.len(),
            size
        )));
    }
    let header: StateHeader = bytemuck::pod_read_unaligned(&src[..STATE_HEADER_LEN]);
    if header.magic != STATE_MAGIC {
        return Err(LLModelError::state("bad magic"));
    }
    if header.version != STATE_VERSION {
        return Err(LLModelError::state(format!("unsupported version {}", header.version)));
    }
    if header.vocab_size as usize != args.vocab_size
        || header.n_ctx as usize != args.max_seq_len
        || header.dim as usize != args.dim
    {
        return Err(LLModelError::state(format!(
            "saved for vocab {} / ctx {} / dim {}, model has {} / {} / {}",
            header.vocab_size,
            header.n_ctx,
            header.dim,
            args.vocab_size,
            args.max_seq_len,
            args.dim
        )));
    }

    let n_past = header.n_past as usize;
    if n_past != input_tokens.len() {
        return Err(LLModelError::state(format!(
            "blob has {} tokens in context, {} input tokens given",
            n_past,
            input_tokens.len()
        )));
    }
    if n_past > args.max_seq_len {
        return Err(LLModelError::state("more tokens than the context window"));
    }
    if let Some(bad) = input_tokens
        .iter()
        .find(|&&t| t < 0 || t as usize >= args.vocab_size)
    {
        return Err(LLModelError::state(format!("token {} is out of vocabulary", bad)));
    }

    let logits = if n_past == 0 {
        Vec::new()
    } else {
        src[STATE_HEADER_LEN..]
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    };
    Ok(Snapshot {
        n_past,
        seed: header.seed,
        step: header.step,
        logits,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> ModelArgs {
        ModelArgs {
            max_seq_len: 8,
            vocab_size: 5,
            dim: 4,
            n_layers: 1,
            n_heads: 1,
            hidden_dim: 8,
        }
    }

    fn snapshot() -> Snapshot {
        Snapshot {
            n_past: 2,
            seed: 9,
            step: 3,
            logits: vec![0.5, -1.0, 2.0, 0.0, 3.25],
        }
    }

    #[test]
    fn header_is_packed() {
        assert_eq!(STATE_HEADER_LEN, 40);
        assert_eq!(state_size(&args()), 60);
    }

    #[test]
    fn encode_then_decode() -> Result<()> {
        let mut buf = vec![0u8; 60];
        assert_eq!(encode(&args(), &snapshot(), &mut buf)?, 60);
        assert_eq!(decode(&args(), &buf, &[1, 3])?, snapshot());
        Ok(())
    }

    #[test]
    fn short_destination_is_untouched() {
        let mut buf = vec![0xAAu8; 59];
        assert!(encode(&args(), &snapshot(), &mut buf).is_err());
        assert!(buf.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn decode_rejects_mismatches() -> Result<()> {
        let mut buf = vec![0u8; 60];
        encode(&args(), &snapshot(), &mut buf)?;

        assert!(decode(&args(), &buf[..59], &[1, 3]).is_err());
        assert!(decode(&args(), &buf, &[1]).is_err());
        assert!(decode(&args(), &buf, &[1, 7]).is_err());

        let mut other = args();
        other.max_seq_len = 16;
        assert!(decode(&other, &buf, &[1, 3]).is_err());

        buf[0] = b'X';
        assert!(decode(&args(), &buf, &[1, 3]).is_err());
        Ok(())
    }
}

use std::collections::HashMap;

pub const UNK_TOKEN: &str = "<unk>";
pub const BOS_TOKEN: &str = "<s>";
pub const EOS_TOKEN: &str = "</s>";

/// Simple whitespace tokenizer backed by a fixed vocabulary.
#[derive(Debug, Clone)]
pub struct Tokenizer {
    vocab: HashMap<String, usize>,
    inv_vocab: Vec<String>,
    unk_id: usize,
}

impl Tokenizer {
    /// Create a tokenizer from a list of tokens. `<unk>` is the unknown
    /// token when present, otherwise the first entry is used.
    pub fn new(tokens: Vec<String>) -> Self {
        let mut vocab = HashMap::with_capacity(tokens.len());
        for (i, tok) in tokens.iter().enumerate() {
            vocab.entry(tok.clone()).or_insert(i);
        }
        let unk_id = vocab.get(UNK_TOKEN).copied().unwrap_or(0);
        Self { vocab, inv_vocab: tokens, unk_id }
    }

    /// Encode a string into token ids using whitespace splitting. Unknown
    /// tokens map to the `unk` id.
    pub fn encode(&self, text: &str) -> Vec<usize> {
        text.split_whitespace()
            .map(|s| self.vocab.get(s).copied().unwrap_or(self.unk_id))
            .collect()
    }

    /// Decode token ids back into a space separated string.
    pub fn decode(&self, tokens: &[usize]) -> String {
        tokens
            .iter()
            .map(|&id| self.text(id))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Text of a single token, `<unk>` for out of range ids.
    pub fn text(&self, id: usize) -> &str {
        self.inv_vocab
            .get(id)
            .or_else(|| self.inv_vocab.get(self.unk_id))
            .map(|s| s.as_str())
            .unwrap_or(UNK_TOKEN)
    }

    /// Text emitted when `id` is generated: the token preceded by a space.
    pub fn piece(&self, id: usize) -> String {
        format!(" {}", self.text(id))
    }

    pub fn vocab_size(&self) -> usize {
        self.inv_vocab.len()
    }

    pub fn contains(&self, token: &str) -> bool {
        self.vocab.contains_key(token)
    }

    pub fn bos_id(&self) -> Option<usize> {
        self.vocab.get(BOS_TOKEN).copied()
    }

    pub fn eos_id(&self) -> Option<usize> {
        self.vocab.get(EOS_TOKEN).copied()
    }

    /// Named special tokens present in the vocabulary.
    pub fn special_tokens(&self) -> Vec<(String, String)> {
        [("bos_token", BOS_TOKEN), ("eos_token", EOS_TOKEN), ("unk_token", UNK_TOKEN)]
            .iter()
            .filter(|(_, tok)| self.contains(tok))
            .map(|(name, tok)| (name.to_string(), tok.to_string()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab(words: &[&str]) -> Vec<String> {
        words.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn encode_decode_roundtrip() {
        let tokenizer = Tokenizer::new(vocab(&["<unk>", "hello", "world"]));
        let ids = tokenizer.encode("hello world");
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(tokenizer.decode(&ids), "hello world");
    }

    #[test]
    fn unknown_token() {
        let tokenizer = Tokenizer::new(vocab(&["<unk>", "foo"]));
        let ids = tokenizer.encode("bar");
        assert_eq!(ids, vec![0]);
        assert_eq!(tokenizer.decode(&ids), "<unk>");
        assert_eq!(tokenizer.text(99), "<unk>");
    }

    #[test]
    fn special_tokens_follow_vocab() {
        let tokenizer = Tokenizer::new(vocab(&["<unk>", "<s>", "</s>", "hi"]));
        assert_eq!(tokenizer.bos_id(), Some(1));
        assert_eq!(tokenizer.eos_id(), Some(2));
        assert_eq!(tokenizer.special_tokens().len(), 3);

        let plain = Tokenizer::new(vocab(&["<unk>", "hi"]));
        assert_eq!(plain.bos_id(), None);
        assert_eq!(
            plain.special_tokens(),
            vec![("unk_token".to_string(), "<unk>".to_string())]
        );
    }

    #[test]
    fn piece_has_leading_space() {
        let tokenizer = Tokenizer::new(vocab(&["<unk>", "hi"]));
        assert_eq!(tokenizer.piece(1), " hi");
    }
}

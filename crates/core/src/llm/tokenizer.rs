//! Token counting shared by the context budgeter and the model transport.

use anyhow::Result;
use tiktoken_rs::CoreBPE;

/// Counts tokens the way the downstream model does
pub trait Tokenizer: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// `cl100k_base` byte-pair encoding
pub struct Cl100kTokenizer {
    bpe: CoreBPE,
}

impl Cl100kTokenizer {
    pub fn new() -> Result<Self> {
        Ok(Self {
            bpe: tiktoken_rs::cl100k_base()?,
        })
    }
}

impl Tokenizer for Cl100kTokenizer {
    fn count(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}

/// One token per whitespace-separated word
#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceTokenizer;

impl Tokenizer for WhitespaceTokenizer {
    fn count(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whitespace_tokenizer() {
        assert_eq!(WhitespaceTokenizer.count("a  b\tc\n"), 3);
        assert_eq!(WhitespaceTokenizer.count(""), 0);
    }

    #[test]
    fn test_cl100k_counts_tokens() {
        let tokenizer = Cl100kTokenizer::new().unwrap();
        assert_eq!(tokenizer.count(""), 0);
        assert!(tokenizer.count("hello world") >= 2);
    }
}

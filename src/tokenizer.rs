use anyhow::{anyhow, Result};
use tiktoken_rs::{cl100k_base, o200k_base, p50k_base, r50k_base, CoreBPE};

/// BPE token counter. Special-token text is counted as ordinary text, so
/// arbitrary user content never fails to encode.
pub struct TokenCounter {
    encoder: CoreBPE,
    encoding: String,
}

impl TokenCounter {
    pub fn new(encoding: &str) -> Result<Self> {
        let encoder = match encoding {
            "o200k_base" => o200k_base()?,
            "cl100k_base" => cl100k_base()?,
            "p50k_base" => p50k_base()?,
            "r50k_base" => r50k_base()?,
            other => return Err(anyhow!("unknown tokenizer encoding: {}", other)),
        };
        Ok(Self {
            encoder,
            encoding: encoding.to_string(),
        })
    }

    pub fn encoding(&self) -> &str {
        &self.encoding
    }

    pub fn count(&self, text: &str) -> usize {
        self.encoder.encode_ordinary(text).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_tokens() {
        let counter = TokenCounter::new("o200k_base").unwrap();
        assert_eq!(counter.count(""), 0);
        assert_eq!(counter.count("hello world"), 2);
    }

    #[test]
    fn test_special_tokens_are_plain_text() {
        let counter = TokenCounter::new("o200k_base").unwrap();
        assert!(counter.count("<|endoftext|>") > 1);
    }

    #[test]
    fn test_unknown_encoding() {
        assert!(TokenCounter::new("nope").is_err());
    }
}

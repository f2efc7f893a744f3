//! Token-counting port (spec §4.4/§9): `CountTokens(text) -> int`, with per-model
//! variants and a character-ratio fallback that callers must label as estimated.

use std::sync::OnceLock;

use tiktoken_rs::CoreBPE;

/// Result of a token count: the count itself, and whether it was a real tokenizer
/// measurement or the character-ratio approximation.
#[derive(Debug, Clone, Copy)]
pub struct TokenCount {
    pub tokens: u32,
    pub estimated: bool,
}

/// A pluggable per-model token counter. The default implementation below uses a real
/// BPE tokenizer for OpenAI-family models (the one vendor family `tiktoken-rs` actually
/// covers) and falls back to a character-ratio estimate for everything else.
pub trait TokenizerPort: Send + Sync {
    fn count_tokens(&self, provider: &str, model_id: &str, text: &str) -> TokenCount;
}

fn cl100k() -> &'static CoreBPE {
    static CELL: OnceLock<CoreBPE> = OnceLock::new();
    CELL.get_or_init(|| tiktoken_rs::cl100k_base().expect("cl100k_base vocab is statically bundled"))
}

/// Roughly 4 characters per token — the standard approximation used when no real
/// tokenizer is available for a vendor.
fn char_ratio_estimate(text: &str) -> u32 {
    ((text.chars().count() as f64) / 4.0).ceil() as u32
}

pub struct DefaultTokenizer;

impl TokenizerPort for DefaultTokenizer {
    fn count_tokens(&self, provider: &str, _model_id: &str, text: &str) -> TokenCount {
        if provider.eq_ignore_ascii_case("openai") || provider.eq_ignore_ascii_case("azure-openai")
        {
            let tokens = cl100k().encode_with_special_tokens(text).len() as u32;
            TokenCount { tokens, estimated: false }
        } else {
            TokenCount { tokens: char_ratio_estimate(text), estimated: true }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_uses_real_tokenizer() {
        let t = DefaultTokenizer;
        let count = t.count_tokens("openai", "gpt-3.5-turbo", "Hello, world!");
        assert!(!count.estimated);
        assert!(count.tokens > 0);
    }

    #[test]
    fn unknown_provider_falls_back_to_char_ratio_and_is_marked_estimated() {
        let t = DefaultTokenizer;
        let count = t.count_tokens("cohere", "command-r", "a".repeat(40).as_str());
        assert!(count.estimated);
        assert_eq!(count.tokens, 10);
    }

    #[test]
    fn char_ratio_rounds_up() {
        assert_eq!(char_ratio_estimate("abc"), 1);
        assert_eq!(char_ratio_estimate("abcde"), 2);
    }
}

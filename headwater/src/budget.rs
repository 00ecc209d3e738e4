//! Token accounting used by the table serializer.
//!
//! Everything that needs token counts receives a [`TokenBudgeter`] explicitly;
//! there is no process-global tokenizer. The Hugging Face implementation lives
//! in the `estuary` crate; [`WhitespaceBudgeter`] is the dependency-free one.

/// Count, split and re-join text in model tokens.
///
/// Implementations must be deterministic for a fixed input.
pub trait TokenBudgeter: Send + Sync {
    /// Split `text` into tokens, without special tokens.
    fn tokenize(&self, text: &str) -> Vec<String>;

    /// Join tokens produced by [`tokenize`](Self::tokenize) back into text.
    fn detokenize(&self, tokens: &[String]) -> String;

    fn count_tokens(&self, text: &str) -> usize {
        self.tokenize(text).len()
    }

    /// Tokens the model wraps around every sequence (e.g. BOS/EOS). Reserved
    /// out of every budget.
    fn special_tokens(&self) -> usize {
        0
    }
}

/// Treats every whitespace-separated word as one token.
#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceBudgeter;

impl TokenBudgeter for WhitespaceBudgeter {
    fn tokenize(&self, text: &str) -> Vec<String> {
        text.split_whitespace().map(str::to_string).collect()
    }

    fn detokenize(&self, tokens: &[String]) -> String {
        tokens.join(" ")
    }

    fn count_tokens(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }
}

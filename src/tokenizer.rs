//! Hugging Face tokenizer as a [`TokenBudgeter`].
//!
//! Token budgets are counted in the tokens of the model the data is generated
//! for, `facebook/bart-large` by default. The tokenizer is loaded once and
//! passed around explicitly.

use std::path::Path;

use headwater::budget::{TokenBudgeter, WhitespaceBudgeter};
use hf_hub::{Repo, RepoType, api::sync::Api};
use thiserror::Error;
use tokenizers::Tokenizer;
use tracing::{info, warn};

// ============================================================================
// Configuration
// ============================================================================

/// Default tokenizer repository on the Hugging Face Hub.
pub const DEFAULT_TOKENIZER_REPO: &str = "facebook/bart-large";

/// Tokenizer name selecting [`WhitespaceBudgeter`] instead of a model
/// tokenizer.
pub const WHITESPACE_TOKENIZER: &str = "whitespace";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Error, Debug)]
pub enum TokenizerError {
    #[error("Failed to load tokenizer: {0}")]
    Load(String),

    #[error("HF Hub error: {0}")]
    HfHub(#[from] hf_hub::api::sync::ApiError),
}

// ============================================================================
// Hugging Face Budgeter
// ============================================================================

pub struct HfTokenBudgeter {
    tokenizer: Tokenizer,
    /// Tokens the post-processor adds around every sequence.
    special_tokens: usize,
}

impl HfTokenBudgeter {
    pub fn new(tokenizer: Tokenizer) -> Self {
        let special_tokens = tokenizer
            .encode("", true)
            .map(|encoding| encoding.get_ids().len())
            .unwrap_or(0);
        Self {
            tokenizer,
            special_tokens,
        }
    }

    /// Load a local `tokenizer.json`.
    pub fn from_file(path: &Path) -> Result<Self, TokenizerError> {
        info!("Loading tokenizer from {}", path.display());
        let tokenizer = Tokenizer::from_file(path)
            .map_err(|e| TokenizerError::Load(format!("{}: {e}", path.display())))?;
        Ok(Self::new(tokenizer))
    }

    /// Download (or reuse the cached) `tokenizer.json` of a Hub repository.
    pub fn from_pretrained(repo_id: &str) -> Result<Self, TokenizerError> {
        info!("Fetching tokenizer for {repo_id} from the Hub");
        let api = Api::new()?;
        let repo = api.repo(Repo::new(repo_id.to_string(), RepoType::Model));
        let path = repo.get("tokenizer.json")?;
        Self::from_file(&path)
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }
}

impl TokenBudgeter for HfTokenBudgeter {
    fn tokenize(&self, text: &str) -> Vec<String> {
        match self.tokenizer.encode(text, false) {
            Ok(encoding) => encoding.get_tokens().to_vec(),
            Err(e) => {
                warn!("Tokenization failed, splitting on whitespace: {e}");
                WhitespaceBudgeter.tokenize(text)
            }
        }
    }

    fn detokenize(&self, tokens: &[String]) -> String {
        let ids: Option<Vec<u32>> = tokens
            .iter()
            .map(|token| self.tokenizer.token_to_id(token))
            .collect();
        let decoded = match ids {
            Some(ids) => self.tokenizer.decode(&ids, true).map_err(|e| e.to_string()),
            None => Err("token outside the vocabulary".to_string()),
        };
        decoded.unwrap_or_else(|e| {
            warn!("Detokenization failed, joining tokens: {e}");
            tokens.join(" ")
        })
    }

    fn count_tokens(&self, text: &str) -> usize {
        match self.tokenizer.encode(text, false) {
            Ok(encoding) => encoding.get_ids().len(),
            Err(_) => WhitespaceBudgeter.count_tokens(text),
        }
    }

    fn special_tokens(&self) -> usize {
        self.special_tokens
    }
}

/// Resolve a tokenizer name: `whitespace`, a path to a `tokenizer.json`, or a
/// Hub repository id.
pub fn load_budgeter(name: &str) -> Result<Box<dyn TokenBudgeter>, TokenizerError> {
    if name == WHITESPACE_TOKENIZER {
        info!("Using whitespace token budgets");
        return Ok(Box::new(WhitespaceBudgeter));
    }
    let path = Path::new(name);
    let budgeter = if path.is_file() {
        HfTokenBudgeter::from_file(path)?
    } else {
        HfTokenBudgeter::from_pretrained(name)?
    };
    Ok(Box::new(budgeter))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Word-level tokenizer with a whitespace pre-tokenizer and no
    /// post-processor.
    const WORD_LEVEL_TOKENIZER: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {"[UNK]": 0, "col": 1, ":": 2, "|": 3, "row": 4, "1": 5, "city": 6, "nyc": 7},
            "unk_token": "[UNK]"
        }
    }"#;

    #[test]
    fn test_load_whitespace_budgeter() {
        let budgeter = load_budgeter(WHITESPACE_TOKENIZER).unwrap();
        assert_eq!(budgeter.count_tokens("col : city"), 3);
    }

    #[test]
    fn test_word_level_tokenizer_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokenizer.json");
        std::fs::write(&path, WORD_LEVEL_TOKENIZER).unwrap();

        let budgeter = load_budgeter(path.to_str().unwrap()).unwrap();
        assert_eq!(budgeter.count_tokens("col : city row 1 : nyc"), 7);
        assert_eq!(budgeter.special_tokens(), 0);

        let tokens = budgeter.tokenize("row 1 : nyc");
        assert_eq!(tokens, ["row", "1", ":", "nyc"]);
        assert_eq!(budgeter.detokenize(&tokens[..2]), "row 1");
    }

    #[test]
    fn test_invalid_tokenizer_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokenizer.json");
        std::fs::write(&path, "{}").unwrap();
        assert!(matches!(
            HfTokenBudgeter::from_file(&path),
            Err(TokenizerError::Load(_))
        ));
    }

    #[test]
    #[ignore] // Run with: cargo test --release -- --ignored test_bart_budgeter
    fn test_bart_budgeter() {
        let budgeter =
            HfTokenBudgeter::from_pretrained(DEFAULT_TOKENIZER_REPO).expect("Failed to load tokenizer");
        assert_eq!(budgeter.special_tokens(), 2);

        let text = "col : city | pop row 1 : nyc | 8";
        let tokens = budgeter.tokenize(text);
        assert_eq!(tokens.len(), budgeter.count_tokens(text));
        assert_eq!(budgeter.detokenize(&tokens), text);
    }
}

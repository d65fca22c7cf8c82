//! Token vocabularies mapping subword terms to integer ids.

use std::convert::TryFrom;
use std::fs;
use std::path::Path;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{NmtError, Result};
use crate::special_tokens::{self, BOS, EOS, UNK};

/// Token identifier used throughout the crate.
pub type TokenId = u32;

/// File name under which both vocabularies are persisted.
pub const VOCAB_FILE: &str = "vocab.json";

/// Ordered token inventory. Ids are positions; the reserved tokens always come first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct Vocabulary {
    tokens: Vec<String>,
    index: FxHashMap<String, TokenId>,
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self::with_reserved()
    }
}

impl Vocabulary {
    /// Creates a vocabulary holding only the reserved tokens (pad, unknown, begin, end).
    #[must_use]
    pub fn with_reserved() -> Self {
        let mut vocab = Self {
            tokens: Vec::new(),
            index: FxHashMap::default(),
        };
        for token in special_tokens::reserved_tokens() {
            vocab.add(token);
        }
        vocab
    }

    /// Adds `token` if unseen and returns its id.
    pub fn add(&mut self, token: &str) -> TokenId {
        if let Some(&id) = self.index.get(token) {
            return id;
        }
        let id = self.tokens.len() as TokenId;
        self.tokens.push(token.to_string());
        self.index.insert(token.to_string(), id);
        id
    }

    /// Looks up the id of `token`.
    #[must_use]
    pub fn id(&self, token: &str) -> Option<TokenId> {
        self.index.get(token).copied()
    }

    /// Looks up the token stored at `id`.
    #[must_use]
    pub fn token(&self, id: TokenId) -> Option<&str> {
        self.tokens.get(id as usize).map(String::as_str)
    }

    /// Tokens in id order.
    #[must_use]
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Number of tokens including the reserved ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Always false: the reserved tokens are never removed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Maps `words` to ids, falling back to the unknown id. With `bounds`, the result is
    /// wrapped in begin/end markers.
    #[must_use]
    pub fn convert_to_ids<S: AsRef<str>>(&self, words: &[S], bounds: bool) -> Vec<TokenId> {
        let mut ids = Vec::with_capacity(words.len() + if bounds { 2 } else { 0 });
        if bounds {
            ids.push(BOS);
        }
        ids.extend(
            words
                .iter()
                .map(|word| self.id(word.as_ref()).unwrap_or(UNK)),
        );
        if bounds {
            ids.push(EOS);
        }
        ids
    }
}

impl TryFrom<Vec<String>> for Vocabulary {
    type Error = String;

    fn try_from(tokens: Vec<String>) -> std::result::Result<Self, Self::Error> {
        let reserved = special_tokens::reserved_tokens();
        if tokens.len() < reserved.len()
            || tokens.iter().zip(reserved).any(|(have, want)| have != want)
        {
            return Err(format!(
                "vocabulary must start with the reserved tokens {reserved:?}"
            ));
        }
        let mut index = FxHashMap::default();
        for (id, token) in tokens.iter().enumerate() {
            if index.insert(token.clone(), id as TokenId).is_some() {
                return Err(format!("duplicate vocabulary token {token:?}"));
            }
        }
        Ok(Self { tokens, index })
    }
}

impl From<Vocabulary> for Vec<String> {
    fn from(vocab: Vocabulary) -> Self {
        vocab.tokens
    }
}

/// Source and target vocabularies persisted together.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VocabularyPair {
    /// Vocabulary for the source side.
    pub source: Vocabulary,
    /// Vocabulary for the target side.
    pub target: Vocabulary,
}

impl VocabularyPair {
    /// Writes both vocabularies to `path` as JSON.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string(self)?;
        fs::write(path, json).map_err(|err| NmtError::io_at(err, path))
    }

    /// Reads vocabularies written by [`VocabularyPair::save_to_file`].
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|err| NmtError::io_at(err, path))?;
        Ok(serde_json::from_str(&raw)?)
    }
}

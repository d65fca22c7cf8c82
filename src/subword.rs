//! Shared source/target subword model.
//!
//! The model is a frequency-ordered BPE merge table learned over the words of both sides of the
//! training corpora. Encoded pieces follow the usual continuation convention: every piece except
//! the last one of a word carries an `@@` suffix, so `lower` may become `["low@@", "er"]`.
//!
//! ```no_run
//! use nmtbuild::config::SubwordConfig;
//! use nmtbuild::subword::SubwordLearner;
//!
//! # fn main() -> nmtbuild::Result<()> {
//! let mut learner = SubwordLearner::new(SubwordConfig::default())?;
//! learner.add_pair("the lower house", "la camera bassa");
//! let model = learner.finish()?;
//! let pieces = model.encode_line("the lowest house");
//! model.save_to_file("model.bpe")?;
//! # Ok(())
//! # }
//! ```

mod learner;
mod word;

use std::cmp::Reverse;
use std::fs;
use std::path::Path;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::config::SubwordConfig;
use crate::error::{NmtError, Result};
use crate::serialization::save_huggingface_tokenizer;

/// Suffix marking the final symbol of a word inside the merge table. Words are split on
/// whitespace, so the marker never occurs in word content.
pub const END_OF_WORD: &str = "\u{2028}";
/// Suffix carried by every encoded piece that does not end a word.
pub const CONTINUATION: &str = "@@";

const MODEL_FORMAT_VERSION: u32 = 2;
const ENCODER_CACHE_LIMIT: usize = 1 << 16;

/// Side of a sentence pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// Source language.
    Source,
    /// Target language.
    Target,
}

/// Streams word counts out of corpora and learns a [`SubwordModel`] from them.
///
/// Only distinct words and their counts are kept in memory.
#[derive(Debug, Clone)]
pub struct SubwordLearner {
    cfg: SubwordConfig,
    source_words: FxHashMap<String, usize>,
    target_words: FxHashMap<String, usize>,
    lines: usize,
}

impl SubwordLearner {
    /// Creates a learner, validating the configuration.
    pub fn new(cfg: SubwordConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            source_words: FxHashMap::default(),
            target_words: FxHashMap::default(),
            lines: 0,
        })
    }

    /// Counts the words of one line of `side`.
    pub fn add_line(&mut self, side: Side, line: &str) {
        let counts = match side {
            Side::Source => &mut self.source_words,
            Side::Target => &mut self.target_words,
        };
        for word in line.split_whitespace() {
            match counts.get_mut(word) {
                Some(count) => *count += 1,
                None => {
                    counts.insert(word.to_string(), 1);
                }
            }
        }
        self.lines += 1;
    }

    /// Counts both sides of a sentence pair.
    pub fn add_pair(&mut self, source: &str, target: &str) {
        self.add_line(Side::Source, source);
        self.add_line(Side::Target, target);
    }

    /// Number of lines counted so far.
    #[must_use]
    pub fn lines(&self) -> usize {
        self.lines
    }

    /// Learns the merge table over the combined counts and derives per-side terms.
    pub fn finish(self) -> Result<SubwordModel> {
        let mut combined = self.source_words.clone();
        for (word, count) in &self.target_words {
            *combined.entry(word.clone()).or_insert(0) += count;
        }
        let learned = learner::learn_merges(&combined, &self.cfg)?;
        drop(combined);

        let mut model = SubwordModel::from_parts(
            self.cfg,
            learned.alphabet,
            learned.merges,
            Vec::new(),
            Vec::new(),
        );
        model.source_terms = model.collect_terms(&self.source_words);
        model.target_terms = model.collect_terms(&self.target_words);
        Ok(model)
    }
}

/// Learned merge table plus the subword terms observed on each side.
#[derive(Debug, Clone)]
pub struct SubwordModel {
    config: SubwordConfig,
    alphabet: Vec<String>,
    merges: Vec<(String, String)>,
    source_terms: Vec<String>,
    target_terms: Vec<String>,
    ranks: FxHashMap<String, FxHashMap<String, u32>>,
}

#[derive(Serialize, Deserialize)]
struct StoredModel {
    version: u32,
    config: SubwordConfig,
    alphabet: Vec<String>,
    merges: Vec<(String, String)>,
    source_terms: Vec<String>,
    target_terms: Vec<String>,
}

impl SubwordModel {
    fn from_parts(
        config: SubwordConfig,
        alphabet: Vec<String>,
        merges: Vec<(String, String)>,
        source_terms: Vec<String>,
        target_terms: Vec<String>,
    ) -> Self {
        let mut ranks: FxHashMap<String, FxHashMap<String, u32>> = FxHashMap::default();
        for (rank, (left, right)) in merges.iter().enumerate() {
            ranks
                .entry(left.clone())
                .or_default()
                .entry(right.clone())
                .or_insert(rank as u32);
        }
        Self {
            config,
            alphabet,
            merges,
            source_terms,
            target_terms,
            ranks,
        }
    }

    /// Configuration the model was learned with.
    #[must_use]
    pub fn config(&self) -> &SubwordConfig {
        &self.config
    }

    /// Initial symbols (characters, word-final ones suffixed with [`END_OF_WORD`]).
    #[must_use]
    pub fn alphabet(&self) -> &[String] {
        &self.alphabet
    }

    /// Merge table in learning order.
    #[must_use]
    pub fn merges(&self) -> &[(String, String)] {
        &self.merges
    }

    /// Subword terms observed on the source side.
    #[must_use]
    pub fn source_terms(&self) -> &[String] {
        &self.source_terms
    }

    /// Subword terms observed on the target side.
    #[must_use]
    pub fn target_terms(&self) -> &[String] {
        &self.target_terms
    }

    fn rank(&self, left: &str, right: &str) -> Option<u32> {
        self.ranks.get(left).and_then(|rights| rights.get(right)).copied()
    }

    /// Splits a single word into subword pieces. Whitespace inside `word` separates words, as
    /// in [`SubwordModel::encode_line`].
    #[must_use]
    pub fn encode_word(&self, word: &str) -> Vec<String> {
        if word.contains(char::is_whitespace) {
            return self.encode_line(word);
        }
        let mut symbols = learner::initial_symbols(word);
        while symbols.len() > 1 {
            let best = symbols
                .windows(2)
                .filter_map(|window| self.rank(&window[0], &window[1]))
                .min();
            let Some(rank) = best else {
                break;
            };
            let (left, right) = &self.merges[rank as usize];
            let mut merged = Vec::with_capacity(symbols.len());
            let mut i = 0usize;
            while i < symbols.len() {
                if i + 1 < symbols.len() && symbols[i] == *left && symbols[i + 1] == *right {
                    merged.push(format!("{left}{right}"));
                    i += 2;
                } else {
                    merged.push(std::mem::take(&mut symbols[i]));
                    i += 1;
                }
            }
            symbols = merged;
        }

        symbols
            .into_iter()
            .map(|symbol| match symbol.strip_suffix(END_OF_WORD) {
                Some(stem) => stem.to_string(),
                None => format!("{symbol}{CONTINUATION}"),
            })
            .collect()
    }

    /// Splits a whitespace-tokenized line into subword pieces.
    #[must_use]
    pub fn encode_line(&self, line: &str) -> Vec<String> {
        line.split_whitespace()
            .flat_map(|word| self.encode_word(word))
            .collect()
    }

    /// Returns a caching encoder for bulk encoding.
    #[must_use]
    pub fn encoder(&self) -> SubwordEncoder<'_> {
        SubwordEncoder {
            model: self,
            cache: FxHashMap::default(),
        }
    }

    fn collect_terms(&self, word_counts: &FxHashMap<String, usize>) -> Vec<String> {
        let mut frequencies: FxHashMap<String, usize> = FxHashMap::default();
        for (word, &count) in word_counts {
            for piece in self.encode_word(word) {
                *frequencies.entry(piece).or_insert(0) += count;
            }
        }
        let mut terms: Vec<(String, usize)> = frequencies.into_iter().collect();
        terms.sort_unstable_by(|a, b| (Reverse(a.1), &a.0).cmp(&(Reverse(b.1), &b.0)));
        if let Some(limit) = self.config.max_vocabulary_size {
            terms.truncate(limit);
        }
        terms.into_iter().map(|(term, _)| term).collect()
    }

    /// Persists the model as JSON.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let stored = StoredModel {
            version: MODEL_FORMAT_VERSION,
            config: self.config.clone(),
            alphabet: self.alphabet.clone(),
            merges: self.merges.clone(),
            source_terms: self.source_terms.clone(),
            target_terms: self.target_terms.clone(),
        };
        let json = serde_json::to_string(&stored)?;
        fs::write(path, json).map_err(|err| NmtError::io_at(err, path))
    }

    /// Loads a model written by [`SubwordModel::save_to_file`].
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|err| NmtError::io_at(err, path))?;
        let stored: StoredModel = serde_json::from_str(&raw)?;
        if stored.version != MODEL_FORMAT_VERSION {
            return Err(NmtError::Serialization(format!(
                "unsupported subword model version {} in {path:?}",
                stored.version
            )));
        }
        Ok(Self::from_parts(
            stored.config,
            stored.alphabet,
            stored.merges,
            stored.source_terms,
            stored.target_terms,
        ))
    }

    /// Writes the model as a Hugging Face `tokenizer.json` file.
    pub fn save_huggingface<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        save_huggingface_tokenizer(self, path, false)
    }
}

/// Encoder memoising per-word results; the cache is reset once it grows past a fixed size.
#[derive(Debug)]
pub struct SubwordEncoder<'a> {
    model: &'a SubwordModel,
    cache: FxHashMap<String, Vec<String>>,
}

impl SubwordEncoder<'_> {
    /// Splits a whitespace-tokenized line into subword pieces.
    pub fn encode_line(&mut self, line: &str) -> Vec<String> {
        let mut pieces = Vec::new();
        for word in line.split_whitespace() {
            if let Some(cached) = self.cache.get(word) {
                pieces.extend(cached.iter().cloned());
                continue;
            }
            let encoded = self.model.encode_word(word);
            pieces.extend(encoded.iter().cloned());
            if self.cache.len() >= ENCODER_CACHE_LIMIT {
                self.cache.clear();
            }
            self.cache.insert(word.to_string(), encoded);
        }
        pieces
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn learn(pairs: &[(&str, &str)], symbols: usize) -> SubwordModel {
        let cfg = SubwordConfig::builder()
            .symbols(symbols)
            .min_frequency(1)
            .show_progress(false)
            .build()
            .expect("valid config");
        let mut learner = SubwordLearner::new(cfg).expect("learner");
        for (source, target) in pairs {
            learner.add_pair(source, target);
        }
        learner.finish().expect("learn")
    }

    #[test]
    fn encoding_concatenates_back_to_words() {
        let model = learn(
            &[
                ("the lower house", "la camera bassa"),
                ("the lowest bid", "la offerta piu bassa"),
            ],
            20,
        );
        let pieces = model.encode_line("the lowest camera");
        let rebuilt = pieces.join(" ").replace("@@ ", "");
        assert_eq!(rebuilt, "the lowest camera");
        assert!(pieces.last().is_some_and(|piece| !piece.ends_with(CONTINUATION)));
    }

    #[test]
    fn unseen_characters_fall_back_to_single_symbols() {
        let model = learn(&[("aa aa", "bb bb")], 5);
        assert_eq!(model.encode_word("xyz"), vec!["x@@", "y@@", "z"]);
        assert!(model.encode_line("   ").is_empty());
    }

    #[test]
    fn markup_lookalike_words_keep_every_character() {
        let model = learn(&[("<w></w>a ab a</w>b", "</w> a</w>b")], 20);
        for word in ["a</w>b", "</w>", "<w></w>a", "b</w>"] {
            let pieces = model.encode_word(word);
            assert!(pieces.iter().all(|piece| !piece.is_empty()), "{word}: {pieces:?}");
            assert_eq!(pieces.join(" ").replace("@@ ", ""), word);
            assert!(!pieces.last().is_some_and(|piece| piece.ends_with(CONTINUATION)));
        }
    }

    #[test]
    fn encode_word_splits_embedded_whitespace() {
        let model = learn(&[("low lower", "basso")], 10);
        assert_eq!(model.encode_word("low\u{2028}low"), model.encode_line("low low"));
    }

    #[test]
    fn terms_are_side_specific_and_frequency_ordered() {
        let model = learn(&[("dog dog dog cat", "cane gatto")], 50);
        assert_eq!(model.source_terms()[0], "dog");
        assert!(model.source_terms().iter().all(|term| term != "cane"));
        assert!(model.target_terms().iter().any(|term| term == "cane"));
    }

    #[test]
    fn max_vocabulary_size_truncates_terms() {
        let cfg = SubwordConfig::builder()
            .symbols(1)
            .min_frequency(1)
            .max_vocabulary_size(Some(2))
            .show_progress(false)
            .build()
            .expect("valid config");
        let mut learner = SubwordLearner::new(cfg).expect("learner");
        learner.add_pair("abcdef ghijkl", "mnopqr");
        let model = learner.finish().expect("learn");
        assert_eq!(model.source_terms().len(), 2);
        assert_eq!(model.target_terms().len(), 2);
    }

    #[test]
    fn caching_encoder_matches_model() {
        let model = learn(&[("red green blue red", "rosso verde blu rosso")], 30);
        let mut encoder = model.encoder();
        for line in ["red blue", "red blue", "green"] {
            assert_eq!(encoder.encode_line(line), model.encode_line(line));
        }
    }

    #[test]
    fn save_and_load_preserve_encoding() {
        let model = learn(&[("translation pipeline", "pipeline di traduzione")], 40);
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("model.bpe");
        model.save_to_file(&path).expect("save");
        let loaded = SubwordModel::load_from_file(&path).expect("load");
        assert_eq!(loaded.merges(), model.merges());
        assert_eq!(loaded.source_terms(), model.source_terms());
        assert_eq!(
            loaded.encode_line("translation di pipeline"),
            model.encode_line("translation di pipeline")
        );
    }
}

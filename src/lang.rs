//! Language pair keys used to name corpora files and models.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Directed pair of language tags, e.g. `en → it`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LanguagePair {
    /// Source language tag.
    pub source: String,
    /// Target language tag.
    pub target: String,
}

impl LanguagePair {
    /// Creates a pair from two language tags.
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }

    /// Returns the pair with source and target swapped.
    #[must_use]
    pub fn reversed(&self) -> Self {
        Self::new(self.target.clone(), self.source.clone())
    }

    /// True when both pairs cover the same two languages in either direction.
    #[must_use]
    pub fn equals_ignore_direction(&self, other: &Self) -> bool {
        self == other || (self.source == other.target && self.target == other.source)
    }

    /// Languages in `[source, target]` order, as consumed by corpus readers and writers.
    #[must_use]
    pub fn langs(&self) -> [&str; 2] {
        [self.source.as_str(), self.target.as_str()]
    }

    /// Canonical model name, `model.<source>__<target>`.
    #[must_use]
    pub fn model_name(&self) -> String {
        format!("model.{}__{}", self.source, self.target)
    }
}

impl fmt::Display for LanguagePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} \u{2192} {}", self.source, self.target)
    }
}

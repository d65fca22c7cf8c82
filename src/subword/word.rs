use super::learner::{Pair, SymbolId};

/// Outcome of merging a specific pair within a [`Word`].
#[derive(Default)]
pub(crate) struct MergeOutcome {
    /// Number of pair occurrences replaced inside the word.
    pub(crate) merges: usize,
    /// Pair count deltas emitted by the merge. Negative values represent removals,
    /// positive values represent newly formed adjacent pairs.
    pub(crate) deltas: Vec<(Pair, i32)>,
}

/// Symbol sequence of one distinct corpus word.
#[derive(Clone, Default, Debug)]
pub(crate) struct Word {
    symbols: Vec<SymbolId>,
}

impl Word {
    pub(crate) fn from_symbols(symbols: Vec<SymbolId>) -> Self {
        Self { symbols }
    }

    /// Returns true when the word contains at least two symbols.
    pub(crate) fn has_pairs(&self) -> bool {
        self.symbols.len() >= 2
    }

    /// Invokes the provided closure for each adjacent symbol pair.
    pub(crate) fn for_each_pair<F>(&self, mut f: F)
    where
        F: FnMut(Pair),
    {
        for window in self.symbols.windows(2) {
            f((window[0], window[1]));
        }
    }

    /// Applies the selected merge pair throughout the word and returns the resulting deltas.
    pub(crate) fn merge(
        &mut self,
        left: SymbolId,
        right: SymbolId,
        replacement: SymbolId,
    ) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        if self.symbols.len() < 2 {
            return outcome;
        }

        let mut i = 0usize;
        while i + 1 < self.symbols.len() {
            if self.symbols[i] == left && self.symbols[i + 1] == right {
                let prev = if i > 0 {
                    Some(self.symbols[i - 1])
                } else {
                    None
                };
                let next = self.symbols.get(i + 2).copied();

                // Remove affected adjacency counts.
                if let Some(prev) = prev {
                    outcome.deltas.push(((prev, left), -1));
                }
                outcome.deltas.push(((left, right), -1));
                if let Some(next) = next {
                    outcome.deltas.push(((right, next), -1));
                }

                self.symbols[i] = replacement;
                self.symbols.remove(i + 1);
                outcome.merges += 1;

                // Emit adjacencies formed with the merged symbol.
                if let Some(prev) = prev {
                    outcome.deltas.push(((prev, replacement), 1));
                }
                if let Some(next) = next {
                    outcome.deltas.push(((replacement, next), 1));
                }
            }
            i += 1;
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(outcome: &MergeOutcome, pair: Pair) -> i32 {
        outcome
            .deltas
            .iter()
            .filter(|(p, _)| *p == pair)
            .map(|(_, d)| d)
            .sum()
    }

    #[test]
    fn merge_replaces_all_pairs() {
        let mut word = Word::from_symbols(vec![1, 2, 1, 2, 3]);
        assert!(word.has_pairs());
        let result = word.merge(1, 2, 99);
        assert_eq!(result.merges, 2);
        assert_eq!(net(&result, (1, 2)), -2);
        assert_eq!(net(&result, (99, 99)), 1);
        assert_eq!(net(&result, (99, 3)), 1);
    }

    #[test]
    fn overlapping_runs_balance_deltas() {
        let mut word = Word::from_symbols(vec![7, 7, 7, 7]);
        let result = word.merge(7, 7, 8);
        assert_eq!(result.merges, 2);
        assert_eq!(net(&result, (8, 7)), 0);
        assert_eq!(net(&result, (8, 8)), 1);
        let mut pairs = Vec::new();
        word.for_each_pair(|pair| pairs.push(pair));
        assert_eq!(pairs, vec![(8, 8)]);
    }

    #[test]
    fn single_symbol_words_have_no_pairs() {
        let mut word = Word::from_symbols(vec![5]);
        assert!(!word.has_pairs());
        let outcome = word.merge(5, 5, 6);
        assert_eq!(outcome.merges, 0);
        assert!(outcome.deltas.is_empty());
    }
}

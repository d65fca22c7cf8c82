//! Frequency-ordered merge learning over weighted word counts.

use std::cmp::Ordering;
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, BinaryHeap};
use std::time::Instant;

use log::info;
use rayon::prelude::*;
use rustc_hash::FxHashMap;

use super::word::Word;
use super::END_OF_WORD;
use crate::config::SubwordConfig;
use crate::error::{NmtError, Result};

/// Symbol identifier local to a learning run.
pub(crate) type SymbolId = u32;
/// Adjacent symbol pair encoded as `(left, right)`.
pub(crate) type Pair = (SymbolId, SymbolId);

/// Result of a learning run: the initial symbol alphabet and the ordered merge table.
#[derive(Debug, Clone, Default)]
pub(crate) struct LearnedMerges {
    pub(crate) alphabet: Vec<String>,
    pub(crate) merges: Vec<(String, String)>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct PairScore {
    frequency: usize,
    pair: Pair,
}

impl PairScore {
    fn new(pair: Pair, frequency: usize) -> Self {
        Self { frequency, pair }
    }
}

impl Ord for PairScore {
    fn cmp(&self, other: &Self) -> Ordering {
        self.frequency
            .cmp(&other.frequency)
            .then_with(|| other.pair.cmp(&self.pair))
    }
}

impl PartialOrd for PairScore {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct SymbolTable {
    strings: Vec<String>,
    ids: FxHashMap<String, SymbolId>,
}

impl SymbolTable {
    fn intern(&mut self, symbol: String) -> Result<SymbolId> {
        if let Some(&id) = self.ids.get(&symbol) {
            return Ok(id);
        }
        let id = SymbolId::try_from(self.strings.len())
            .map_err(|_| NmtError::Internal("symbol table exceeded u32::MAX".into()))?;
        self.ids.insert(symbol.clone(), id);
        self.strings.push(symbol);
        Ok(id)
    }

    fn get(&self, id: SymbolId) -> &str {
        &self.strings[id as usize]
    }
}

/// Splits `word` into its initial symbols: one per character, the last one carrying the
/// end-of-word suffix.
pub(crate) fn initial_symbols(word: &str) -> Vec<String> {
    let mut symbols: Vec<String> = word.chars().map(String::from).collect();
    if let Some(last) = symbols.last_mut() {
        last.push_str(END_OF_WORD);
    }
    symbols
}

/// Learns up to `cfg.symbols` merges from weighted word counts.
pub(crate) fn learn_merges(
    word_counts: &FxHashMap<String, usize>,
    cfg: &SubwordConfig,
) -> Result<LearnedMerges> {
    cfg.validate()?;
    let mut entries: Vec<(&String, usize)> = word_counts
        .iter()
        .filter(|(word, _)| !word.is_empty())
        .map(|(word, &count)| (word, count))
        .collect();
    entries.sort_unstable_by(|a, b| a.0.cmp(b.0));

    let alphabet: BTreeSet<String> = entries
        .iter()
        .flat_map(|(word, _)| initial_symbols(word))
        .collect();
    let mut table = SymbolTable {
        strings: Vec::with_capacity(alphabet.len()),
        ids: FxHashMap::default(),
    };
    for symbol in &alphabet {
        table.intern(symbol.clone())?;
    }

    let mut words = Vec::with_capacity(entries.len());
    let mut counts = Vec::with_capacity(entries.len());
    for (word, count) in &entries {
        let symbols = initial_symbols(word)
            .into_iter()
            .map(|symbol| table.ids[&symbol])
            .collect();
        words.push(Word::from_symbols(symbols));
        counts.push(*count);
    }

    let mut pair_counts = compute_pair_counts(&words, &counts);
    let mut heap = BinaryHeap::with_capacity(pair_counts.len().max(1));
    for (&pair, &count) in &pair_counts {
        if count >= cfg.min_frequency {
            heap.push(PairScore::new(pair, count));
        }
    }

    let mut merges: Vec<(String, String)> = Vec::with_capacity(cfg.symbols.min(1 << 16));
    let start = Instant::now();

    while merges.len() < cfg.symbols {
        let best_candidate = loop {
            match heap.pop() {
                Some(score) => {
                    let current = pair_counts.get(&score.pair).copied().unwrap_or(0);
                    if current == 0 || current != score.frequency {
                        continue;
                    }
                    if current < cfg.min_frequency {
                        continue;
                    }
                    break Some((score.pair, current));
                }
                None => break None,
            }
        };
        let Some((best_pair, frequency)) = best_candidate else {
            break;
        };

        let left = table.get(best_pair.0).to_string();
        let right = table.get(best_pair.1).to_string();
        let replacement = table.intern(format!("{left}{right}"))?;

        let applied = apply_merge(
            &mut words,
            &counts,
            best_pair,
            replacement,
            &mut pair_counts,
            &mut heap,
        );
        if applied == 0 {
            break;
        }
        merges.push((left, right));

        if cfg.show_progress && merges.len() % 1000 == 0 {
            info!(
                "merge {:>7} freq {:>9} distinct_pairs {:>9} elapsed {:.2?}",
                merges.len(),
                frequency,
                pair_counts.len(),
                start.elapsed()
            );
        }
    }

    if cfg.show_progress {
        info!(
            "learned {} merges over {} distinct words in {:.2?}",
            merges.len(),
            words.len(),
            start.elapsed()
        );
    }

    Ok(LearnedMerges {
        alphabet: alphabet.into_iter().collect(),
        merges,
    })
}

fn compute_pair_counts(words: &[Word], counts: &[usize]) -> FxHashMap<Pair, usize> {
    words
        .par_iter()
        .zip(counts.par_iter())
        .map(|(word, &count)| {
            let mut local = FxHashMap::default();
            if word.has_pairs() {
                word.for_each_pair(|pair| *local.entry(pair).or_insert(0) += count);
            }
            local
        })
        .reduce(FxHashMap::default, |mut acc, local| {
            for (pair, count) in local {
                *acc.entry(pair).or_insert(0) += count;
            }
            acc
        })
}

#[derive(Default)]
struct MergeAdjustments {
    deltas: FxHashMap<Pair, i64>,
    merges: usize,
}

fn apply_merge(
    words: &mut [Word],
    counts: &[usize],
    pair: Pair,
    replacement: SymbolId,
    pair_counts: &mut FxHashMap<Pair, usize>,
    heap: &mut BinaryHeap<PairScore>,
) -> usize {
    let aggregate = words
        .par_iter_mut()
        .zip(counts.par_iter())
        .map(|(word, &count)| {
            let mut local = MergeAdjustments::default();
            let outcome = word.merge(pair.0, pair.1, replacement);
            local.merges = outcome.merges * count;
            for (key, delta) in outcome.deltas {
                *local.deltas.entry(key).or_insert(0) += i64::from(delta) * count as i64;
            }
            local
        })
        .reduce(MergeAdjustments::default, |mut acc, mut local| {
            acc.merges += local.merges;
            for (key, delta) in local.deltas.drain() {
                *acc.deltas.entry(key).or_insert(0) += delta;
            }
            acc
        });

    for (key, delta) in aggregate.deltas {
        apply_delta(pair_counts, heap, key, delta);
    }
    aggregate.merges
}

fn apply_delta(
    pair_counts: &mut FxHashMap<Pair, usize>,
    heap: &mut BinaryHeap<PairScore>,
    pair: Pair,
    delta: i64,
) {
    match delta.cmp(&0) {
        Ordering::Greater => {
            let count = pair_counts.entry(pair).or_insert(0);
            *count += delta.unsigned_abs() as usize;
            heap.push(PairScore::new(pair, *count));
        }
        Ordering::Less => {
            if let Entry::Occupied(mut occupied) = pair_counts.entry(pair) {
                let new_value = occupied
                    .get()
                    .saturating_sub(delta.unsigned_abs() as usize);
                if new_value == 0 {
                    occupied.remove();
                } else {
                    *occupied.get_mut() = new_value;
                    heap.push(PairScore::new(pair, new_value));
                }
            }
        }
        Ordering::Equal => {}
    }
}

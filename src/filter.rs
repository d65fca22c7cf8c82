//! Parallel length/ratio filtering of bilingual corpora.

use std::fs;
use std::path::Path;
use std::thread;

use log::{debug, info};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;

use crate::config::FilterConfig;
use crate::corpus::BilingualCorpus;
use crate::error::{NmtError, Result};
use crate::lang::LanguagePair;
use crate::metrics::FilterStats;

/// A filtered corpus together with the tally that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct FilteredCorpus {
    /// Destination corpus, same name as the input.
    pub corpus: BilingualCorpus,
    /// Kept/dropped counters.
    pub stats: FilterStats,
}

/// Drops sentence pairs whose token counts or length ratio fall outside [`FilterConfig`].
#[derive(Debug, Clone)]
pub struct CorpusFilter {
    cfg: FilterConfig,
    pair: LanguagePair,
}

impl CorpusFilter {
    /// Creates a filter for `pair`, validating the thresholds.
    pub fn new(cfg: FilterConfig, pair: LanguagePair) -> Result<Self> {
        cfg.validate()?;
        Ok(Self { cfg, pair })
    }

    /// Returns the active thresholds.
    #[must_use]
    pub fn config(&self) -> &FilterConfig {
        &self.cfg
    }

    /// True when the pair satisfies both the length window and the ratio bound.
    #[must_use]
    pub fn accepts(&self, source: &str, target: &str) -> bool {
        let src_len = source.split_whitespace().count();
        let trg_len = target.split_whitespace().count();

        let (min, max) = (self.cfg.min_tokens, self.cfg.max_tokens);
        if src_len > max || trg_len > max {
            return false;
        }
        if src_len < min || trg_len < min {
            return false;
        }

        let ratio = src_len.max(trg_len) as f64 / src_len.min(trg_len) as f64;
        ratio <= self.cfg.max_ratio
    }

    /// Filters every corpus into `dest`, one worker per corpus.
    ///
    /// The pool holds `min(available_parallelism, corpora.len())` threads and lives only for the
    /// duration of the call. Results follow the input order; the first failing corpus aborts the
    /// call with its error.
    pub fn filter<P: AsRef<Path>>(
        &self,
        corpora: &[BilingualCorpus],
        dest: P,
    ) -> Result<Vec<FilteredCorpus>> {
        let dest = dest.as_ref();
        fs::create_dir_all(dest).map_err(|err| NmtError::io_at(err, dest))?;
        if corpora.is_empty() {
            return Ok(Vec::new());
        }

        let cpus = thread::available_parallelism().map_or(1, |n| n.get());
        let workers = cpus.min(corpora.len());
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|idx| format!("corpus-filter-{idx}"))
            .build()
            .map_err(|err| NmtError::Internal(format!("unable to build filter pool: {err}")))?;
        debug!("filtering {} corpora with {workers} workers", corpora.len());

        let results = pool.install(|| {
            corpora
                .par_iter()
                .map(|corpus| self.filter_corpus(corpus, dest))
                .collect::<Result<Vec<_>>>()
        });
        drop(pool);
        results
    }

    fn filter_corpus(&self, corpus: &BilingualCorpus, dest: &Path) -> Result<FilteredCorpus> {
        let langs = self.pair.langs();
        let output = BilingualCorpus::make_parallel(corpus.name(), dest, &langs);
        let mut stats = FilterStats::default();

        let reader = corpus.reader(langs)?;
        let mut writer = output.writer(langs)?;
        for entry in reader {
            let (source, target) = entry?;
            if self.accepts(&source, &target) {
                writer.write_pair(&source, &target)?;
                stats.kept += 1;
            } else {
                stats.dropped += 1;
            }
        }
        writer.finish()?;

        info!(
            "filtered corpus {}: kept {} of {} pairs ({} dropped)",
            corpus.name(),
            stats.kept,
            stats.total(),
            stats.dropped
        );
        Ok(FilteredCorpus {
            corpus: output,
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn words(count: usize) -> String {
        vec!["w"; count].join(" ")
    }

    fn filter(min: usize, max: usize, ratio: f64) -> CorpusFilter {
        let cfg = FilterConfig::builder()
            .min_tokens(min)
            .max_tokens(max)
            .max_ratio(ratio)
            .build()
            .expect("valid thresholds");
        CorpusFilter::new(cfg, LanguagePair::new("en", "it")).expect("filter")
    }

    #[test]
    fn accepts_enforces_window_and_ratio() {
        let filter = filter(1, 80, 3.0);
        assert!(!filter.accepts(&words(90), &words(30)));
        assert!(!filter.accepts(&words(5), &words(20)));
        assert!(filter.accepts(&words(5), &words(10)));
        assert!(filter.accepts(&words(5), &words(15)));
        assert!(!filter.accepts("", "ciao"));
        assert!(!filter.accepts("   ", "ciao"));
    }

    #[test]
    fn accepts_counts_runs_of_whitespace_once() {
        let filter = filter(2, 2, 1.0);
        assert!(filter.accepts("a \t  b", "c  d"));
    }

    #[test]
    fn filter_preserves_relative_order_per_corpus() {
        let dir = tempdir().expect("tempdir");
        let input = dir.path().join("in");
        let dest = dir.path().join("out");
        let pair = LanguagePair::new("en", "it");

        let mut corpora = Vec::new();
        for name in ["alpha", "beta", "gamma"] {
            let corpus = BilingualCorpus::make_parallel(name, &input, &pair.langs());
            let mut writer = corpus.writer(pair.langs()).expect("writer");
            for idx in 0..50 {
                let source = format!("{name} {idx}");
                let target = if idx % 3 == 0 {
                    words(20)
                } else {
                    format!("{name} {idx} t")
                };
                writer.write_pair(&source, &target).expect("write");
            }
            writer.finish().expect("finish");
            corpora.push(corpus);
        }

        let filter = filter(1, 80, 3.0);
        let filtered = filter.filter(&corpora, &dest).expect("filter");
        assert_eq!(filtered.len(), 3);
        for (input, output) in corpora.iter().zip(&filtered) {
            assert_eq!(input.name(), output.corpus.name());
            assert_eq!(output.corpus.get_folder(), dest.as_path());
            let kept: Vec<_> = output
                .corpus
                .reader(pair.langs())
                .expect("reader")
                .collect::<Result<_>>()
                .expect("read");
            let expected: Vec<_> = input
                .reader(pair.langs())
                .expect("reader")
                .map(|entry| entry.expect("pair"))
                .filter(|(s, t)| filter.accepts(s, t))
                .collect();
            assert_eq!(kept, expected);
            assert_eq!(output.stats.kept, expected.len());
            assert_eq!(output.stats.total(), 50);
        }
    }

    #[test]
    fn filter_surfaces_worker_failure() {
        let dir = tempdir().expect("tempdir");
        let pair = LanguagePair::new("en", "it");
        let missing = BilingualCorpus::make_parallel("missing", dir.path(), &pair.langs());
        let filter = filter(1, 80, 3.0);
        let err = filter
            .filter(&[missing], dir.path().join("out"))
            .expect_err("missing corpus must fail");
        assert!(matches!(err, NmtError::Io { .. }));
    }

    #[test]
    fn filter_with_no_corpora_is_a_no_op() {
        let dir = tempdir().expect("tempdir");
        let filter = filter(1, 80, 3.0);
        let out = dir.path().join("out");
        assert!(filter.filter(&[], &out).expect("filter").is_empty());
        assert!(out.is_dir());
    }
}

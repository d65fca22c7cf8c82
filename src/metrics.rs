//! Tallies reported by the filtering, packing and scheduling stages.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Outcome of filtering a single corpus.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilterStats {
    /// Pairs written to the destination corpus.
    pub kept: usize,
    /// Pairs rejected by the length or ratio policy.
    pub dropped: usize,
}

impl FilterStats {
    /// Total pairs read.
    #[must_use]
    pub fn total(&self) -> usize {
        self.kept + self.dropped
    }
}

/// Outcome of packing one dataset split.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackStats {
    /// Pairs appended to the packed dataset.
    pub added: usize,
    /// Pairs skipped because one side encoded to nothing.
    pub ignored: usize,
}

impl PackStats {
    /// Pairs processed so far, `added + ignored`.
    #[must_use]
    pub fn processed(&self) -> usize {
        self.added + self.ignored
    }
}

/// Timing of one executed pipeline step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepTiming {
    /// Step name.
    pub name: String,
    /// Whether the step ran in skip mode.
    pub skipped: bool,
    /// Wall-clock duration.
    pub elapsed: Duration,
}

#[cfg(target_os = "linux")]
fn current_rss_kb() -> Option<usize> {
    use std::fs::File;
    use std::io::{BufRead, BufReader};

    let file = File::open("/proc/self/status").ok()?;
    for line in BufReader::new(file).lines().map_while(Result::ok) {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let value = rest
                .split_whitespace()
                .find_map(|part| part.parse::<usize>().ok());
            return value;
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn current_rss_kb() -> Option<usize> {
    None
}

/// Samples the current resident set size (RSS) on supported platforms.
pub fn sample_rss_kb() -> Option<usize> {
    current_rss_kb()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_stats_processed_sums_both_counters() {
        let stats = PackStats {
            added: 7,
            ignored: 3,
        };
        assert_eq!(stats.processed(), 10);
        let filter = FilterStats {
            kept: 2,
            dropped: 5,
        };
        assert_eq!(filter.total(), 7);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn rss_sample_available_on_linux() {
        assert!(sample_rss_kb().is_some());
    }
}

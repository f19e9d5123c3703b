//! Published-msg_id index used by compaction to filter re-reads.
//!
//! Exact set for small partitions, bloom filter once the candidate volume
//! crosses the configured threshold. Bloom false positives make the engine
//! skip a genuinely-new record; re-running compaction within the raw
//! retention window recovers it, which is why the false-positive rate stays
//! configurable and small.

use std::collections::HashSet;

use bloomfilter::Bloom;
use tracing::debug;

/// Sizing knobs, normally sourced from `DedupConfig`.
#[derive(Debug, Clone, Copy)]
pub struct DedupSizing {
    /// At or above this many expected entries, switch to a bloom filter.
    pub bloom_threshold: usize,
    pub bloom_fp_rate: f64,
}

impl Default for DedupSizing {
    fn default() -> Self {
        Self {
            bloom_threshold: 1_000_000,
            bloom_fp_rate: 0.001,
        }
    }
}

pub enum DedupIndex {
    Exact(HashSet<String>),
    Bloom { filter: Box<Bloom<str>>, entries: usize },
}

impl DedupIndex {
    /// Build an index sized for `expected` already-published entries.
    pub fn with_capacity(expected: usize, sizing: DedupSizing) -> Self {
        if expected >= sizing.bloom_threshold {
            debug!(expected, fp_rate = sizing.bloom_fp_rate, "dedup using bloom filter");
            Self::Bloom {
                filter: Box::new(Bloom::new_for_fp_rate(expected.max(1), sizing.bloom_fp_rate)),
                entries: 0,
            }
        } else {
            Self::Exact(HashSet::with_capacity(expected))
        }
    }

    pub fn insert(&mut self, msg_id: &str) {
        match self {
            Self::Exact(set) => {
                set.insert(msg_id.to_string());
            }
            Self::Bloom { filter, entries } => {
                filter.set(msg_id);
                *entries += 1;
            }
        }
    }

    /// `true` means "definitely or probably published" — callers skip the
    /// record. Exact mode never reports a false positive.
    pub fn probably_contains(&self, msg_id: &str) -> bool {
        match self {
            Self::Exact(set) => set.contains(msg_id),
            Self::Bloom { filter, .. } => filter.check(msg_id),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Exact(set) => set.len(),
            Self::Bloom { entries, .. } => *entries,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_mode_below_threshold() {
        let mut idx = DedupIndex::with_capacity(10, DedupSizing::default());
        assert!(matches!(idx, DedupIndex::Exact(_)));
        idx.insert("A");
        assert!(idx.probably_contains("A"));
        assert!(!idx.probably_contains("B"));
    }

    #[test]
    fn bloom_mode_at_threshold() {
        let sizing = DedupSizing {
            bloom_threshold: 100,
            bloom_fp_rate: 0.001,
        };
        let mut idx = DedupIndex::with_capacity(100, sizing);
        assert!(matches!(idx, DedupIndex::Bloom { .. }));
        for i in 0..100 {
            idx.insert(&format!("msg-{i}"));
        }
        // No false negatives, ever.
        for i in 0..100 {
            assert!(idx.probably_contains(&format!("msg-{i}")));
        }
        assert_eq!(idx.len(), 100);
    }

    #[test]
    fn empty_index_contains_nothing() {
        let idx = DedupIndex::with_capacity(0, DedupSizing::default());
        assert!(idx.is_empty());
        assert!(!idx.probably_contains("anything"));
    }
}

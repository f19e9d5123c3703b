//! Cross-batch topic consolidation.
//!
//! Topics describing one thread tend to land in adjacent batches, so the
//! merger only compares neighbours in the flattened, batch-ordered topic
//! list — and re-scans after every merge until a full pass changes nothing.

use std::collections::HashSet;

use tracing::debug;

use crate::types::Topic;

/// Strategy seam: the orchestrator takes any implementation, so an
/// embedding-based merger can drop in without touching the pipeline.
pub trait MergeStrategy: Send + Sync {
    fn merge(&self, batch_topics: Vec<Vec<Topic>>) -> Vec<Topic>;
}

/// Jaccard keyword overlap with a bonus for touching/overlapping time
/// windows.
pub struct KeywordOverlapMerger {
    pub threshold: f64,
    pub time_bonus: f64,
}

impl KeywordOverlapMerger {
    pub fn new(threshold: f64, time_bonus: f64) -> Self {
        Self {
            threshold,
            time_bonus,
        }
    }

    fn similarity(&self, a: &Topic, b: &Topic) -> f64 {
        let ka = normalized_set(&a.keywords);
        let kb = normalized_set(&b.keywords);
        if ka.is_empty() || kb.is_empty() {
            return 0.0;
        }
        let intersection = ka.intersection(&kb).count() as f64;
        let union = ka.union(&kb).count() as f64;
        let mut score = intersection / union;
        if let (Some(ra), Some(rb)) = (parse_range(&a.time_range), parse_range(&b.time_range)) {
            if ra.0 <= rb.1 && rb.0 <= ra.1 {
                score += self.time_bonus;
            }
        }
        score
    }
}

impl Default for KeywordOverlapMerger {
    fn default() -> Self {
        Self::new(0.35, 0.1)
    }
}

impl MergeStrategy for KeywordOverlapMerger {
    fn merge(&self, batch_topics: Vec<Vec<Topic>>) -> Vec<Topic> {
        let mut topics: Vec<Topic> = batch_topics.into_iter().flatten().collect();
        let before = topics.len();

        loop {
            let mut merged_any = false;
            let mut i = 0;
            while i + 1 < topics.len() {
                let score = self.similarity(&topics[i], &topics[i + 1]);
                if score >= self.threshold {
                    let right = topics.remove(i + 1);
                    let left = std::mem::replace(&mut topics[i], placeholder());
                    topics[i] = merge_pair(left, right);
                    merged_any = true;
                    // Stay put: the merged topic may now match its new
                    // right-hand neighbour.
                } else {
                    i += 1;
                }
            }
            if !merged_any {
                break;
            }
        }

        debug!(before, after = topics.len(), "topics merged");
        topics
    }
}

fn placeholder() -> Topic {
    Topic {
        title: String::new(),
        summary: String::new(),
        keywords: Vec::new(),
        participants: Vec::new(),
        message_ids: Vec::new(),
        confidence: 0.0,
        time_range: String::new(),
        notes: String::new(),
    }
}

/// Lowercased, punctuation-stripped, deduplicated keyword set.
fn normalized_set(keywords: &[String]) -> HashSet<String> {
    keywords
        .iter()
        .map(|k| normalize_keyword(k))
        .filter(|k| !k.is_empty())
        .collect()
}

fn normalize_keyword(keyword: &str) -> String {
    keyword
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect()
}

/// "HH:MM-HH:MM" → (start, end) in minutes since midnight.
fn parse_range(range: &str) -> Option<(u32, u32)> {
    let (start, end) = range.split_once('-')?;
    Some((parse_hhmm(start)?, parse_hhmm(end)?))
}

fn parse_hhmm(t: &str) -> Option<u32> {
    let (h, m) = t.trim().split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    (h < 24 && m < 60).then_some(h * 60 + m)
}

fn format_hhmm(minutes: u32) -> String {
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

fn merge_pair(earlier: Topic, later: Topic) -> Topic {
    // Later summaries saw more context, unless suspiciously thin.
    let summary = if later.summary.len() * 2 < earlier.summary.len() {
        earlier.summary.clone()
    } else {
        later.summary.clone()
    };

    let time_range = match (parse_range(&earlier.time_range), parse_range(&later.time_range)) {
        (Some(a), Some(b)) => format!(
            "{}-{}",
            format_hhmm(a.0.min(b.0)),
            format_hhmm(a.1.max(b.1))
        ),
        (Some(_), None) => earlier.time_range.clone(),
        _ => later.time_range.clone(),
    };

    Topic {
        title: if earlier.title.is_empty() {
            later.title
        } else {
            earlier.title
        },
        summary,
        keywords: union_ordered(earlier.keywords, later.keywords, normalize_keyword),
        participants: union_ordered(earlier.participants, later.participants, |p| p.to_string()),
        message_ids: union_ordered(earlier.message_ids, later.message_ids, |m| m.to_string()),
        confidence: earlier.confidence.min(later.confidence),
        time_range,
        notes: if later.notes.is_empty() {
            earlier.notes
        } else {
            later.notes
        },
    }
}

/// First sequence, then the second's entries whose key is unseen.
fn union_ordered(
    first: Vec<String>,
    second: Vec<String>,
    key: impl Fn(&str) -> String,
) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(first.len() + second.len());
    for item in first.into_iter().chain(second) {
        if seen.insert(key(&item)) {
            out.push(item);
        }
    }
    out
}

//! Greedy first-fit packing of a day's messages under the model context
//! budget.

use tracing::debug;

use crate::types::NormalizedMessage;

/// Deterministic token estimate for a rendered line.
///
/// Roughly four ASCII characters per token; anything outside ASCII (CJK in
/// particular) counts as one token per character. Intentionally conservative
/// — the configured budget should sit below the model's hard limit anyway.
pub fn estimate_tokens(text: &str) -> usize {
    let mut ascii = 0usize;
    let mut wide = 0usize;
    for c in text.chars() {
        if c.is_ascii() {
            ascii += 1;
        } else {
            wide += 1;
        }
    }
    ascii.div_ceil(4) + wide
}

/// Split `messages` (already chronological) into batches whose estimated
/// token cost stays within `max_tokens`. Every message lands in exactly one
/// batch, in order; a single message over the budget becomes its own batch
/// rather than being dropped.
pub fn pack(messages: Vec<NormalizedMessage>, max_tokens: usize) -> Vec<Vec<NormalizedMessage>> {
    let mut batches = Vec::new();
    let mut current: Vec<NormalizedMessage> = Vec::new();
    let mut current_tokens = 0usize;

    for msg in messages {
        let cost = estimate_tokens(&msg.display_line());
        if !current.is_empty() && current_tokens + cost > max_tokens {
            batches.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current_tokens += cost;
        current.push(msg);
    }
    if !current.is_empty() {
        batches.push(current);
    }

    debug!(batches = batches.len(), "messages packed");
    batches
}

//! Drives the model over one batch: prompt render → bounded retry →
//! protocol parse.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::LlmError;
use crate::prompt::{system_prompt, user_prompt};
use crate::protocol::parse_topics;
use crate::provider::{ChatRequest, LlmProvider};
use crate::types::{NormalizedMessage, Topic};

/// First retry delay; doubles per attempt.
const BACKOFF_BASE: Duration = Duration::from_secs(1);
/// Ceiling for the doubling schedule.
const BACKOFF_MAX: Duration = Duration::from_secs(10);
/// Response token allowance per batch.
const RESPONSE_MAX_TOKENS: u32 = 4_096;

pub struct TopicAnalyst {
    provider: Arc<dyn LlmProvider>,
    model: String,
    max_attempts: u32,
}

impl TopicAnalyst {
    pub fn new(provider: Arc<dyn LlmProvider>, model: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            provider,
            model: model.into(),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Analyse one batch of messages into topic clusters.
    ///
    /// Transient failures (timeout, connection, rate limit) retry with
    /// exponential backoff up to the configured attempt count, then surface
    /// as `Unavailable`. A response that parses to zero topics is a
    /// `Protocol` error and is not retried — the model answered, it just
    /// answered uselessly.
    pub async fn analyze_batch(&self, batch: &[NormalizedMessage]) -> Result<Vec<Topic>, LlmError> {
        let lines: Vec<String> = batch.iter().map(|m| m.display_line()).collect();
        let req = ChatRequest {
            model: self.model.clone(),
            system: system_prompt(),
            user: user_prompt(&lines),
            max_tokens: RESPONSE_MAX_TOKENS,
        };

        let mut delay = BACKOFF_BASE;
        for attempt in 1..=self.max_attempts {
            match self.provider.send(&req).await {
                Ok(resp) => {
                    debug!(
                        provider = self.provider.name(),
                        attempt,
                        tokens_in = resp.tokens_in,
                        tokens_out = resp.tokens_out,
                        "model responded"
                    );
                    return parse_topics(&resp.content);
                }
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let wait = match &e {
                        LlmError::RateLimit { retry_after_ms } => {
                            delay.max(Duration::from_millis(*retry_after_ms))
                        }
                        _ => delay,
                    };
                    warn!(
                        provider = self.provider.name(),
                        attempt,
                        max = self.max_attempts,
                        error = %e,
                        retry_in = ?wait,
                        "transient model failure, backing off"
                    );
                    sleep(wait).await;
                    delay = (delay * 2).min(BACKOFF_MAX);
                }
                Err(e) if e.is_transient() => {
                    return Err(LlmError::Unavailable(format!(
                        "retries exhausted after {} attempts: {e}",
                        self.max_attempts
                    )));
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("retry loop always returns")
    }
}

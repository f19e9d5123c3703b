use async_trait::async_trait;

use crate::error::LlmError;

/// One chat-completion request: a system prompt establishing the analyst
/// role and a user prompt carrying the rendered message lines.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
}

/// Common interface for chat-completion providers. The analysis pipeline
/// only ever talks to this trait; tests substitute deterministic stubs.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name for logging and error messages.
    fn name(&self) -> &str;

    /// Send one request, wait for the full response.
    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, LlmError>;
}

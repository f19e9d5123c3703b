use thiserror::Error;

/// Model-service failures. `is_transient` gates the retry loop.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimit { retry_after_ms: u64 },

    #[error("authentication rejected: {0}")]
    Authentication(String),

    #[error("malformed request: {0}")]
    BadRequest(String),

    #[error("response violated the result protocol: {0}")]
    Protocol(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

impl LlmError {
    /// Only these classes are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::Timeout(_) | LlmError::Connection(_) | LlmError::RateLimit { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("lake error: {0}")]
    Storage(#[from] chatlake_lake::LakeError),

    #[error("metadata error: {0}")]
    Meta(#[from] chatlake_meta::MetaError),

    #[error("run cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, AnalysisError>;

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::LlmError;
use crate::provider::{ChatRequest, ChatResponse, LlmProvider};

/// OpenAI-compatible chat-completions client. Works against any endpoint
/// speaking the `/v1/chat/completions` contract via `api_base`.
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    chat_path: String,
}

impl OpenAiProvider {
    pub fn new(api_key: String, base_url: String, request_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(request_timeout)
                .build()
                .expect("reqwest client with static config"),
            api_key,
            base_url,
            chat_path: "/v1/chat/completions".to_string(),
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let url = format!("{}{}", self.base_url, self.chat_path);
        let body = serde_json::json!({
            "model": req.model,
            "messages": [
                {"role": "system", "content": req.system},
                {"role": "user", "content": req.user},
            ],
            "max_tokens": req.max_tokens,
            "stream": false,
        });

        debug!(model = %req.model, "sending analysis request");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = resp.status().as_u16();
        match status {
            429 => {
                let retry = resp
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(|s| s * 1000)
                    .unwrap_or(5000);
                return Err(LlmError::RateLimit {
                    retry_after_ms: retry,
                });
            }
            401 | 403 => {
                let text = resp.text().await.unwrap_or_default();
                return Err(LlmError::Authentication(text));
            }
            400 | 404 | 422 => {
                let text = resp.text().await.unwrap_or_default();
                warn!(status, body = %text, "model endpoint rejected request");
                return Err(LlmError::BadRequest(text));
            }
            s if !(200..300).contains(&s) => {
                let text = resp.text().await.unwrap_or_default();
                warn!(status, body = %text, "model endpoint error");
                return Err(LlmError::Unavailable(format!("status {s}: {text}")));
            }
            _ => {}
        }

        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::Protocol(format!("undecodable response body: {e}")))?;

        let content = api_resp
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        Ok(ChatResponse {
            content,
            tokens_in: api_resp.usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0),
            tokens_out: api_resp
                .usage
                .as_ref()
                .map(|u| u.completion_tokens)
                .unwrap_or(0),
        })
    }
}

fn classify_transport(e: reqwest::Error) -> LlmError {
    if e.is_timeout() {
        LlmError::Timeout(e.to_string())
    } else if e.is_connect() {
        LlmError::Connection(e.to_string())
    } else {
        LlmError::Unavailable(e.to_string())
    }
}

// OpenAI API response types (private — only used for deserialization)

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

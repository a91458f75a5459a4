use crate::errors::{is_transient, retry_after_hint};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

/// Channel the streaming variant pushes incremental text deltas into.
pub type DeltaSender = UnboundedSender<String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopReason {
    #[default]
    EndTurn,
    ToolUse,
    MaxTokens,
}

impl StopReason {
    /// Map a provider `finish_reason` string.
    pub fn from_finish_reason(reason: Option<&str>) -> Self {
        match reason {
            Some("tool_calls" | "tool_use" | "function_call") => Self::ToolUse,
            Some("length" | "max_tokens") => Self::MaxTokens,
            _ => Self::EndTurn,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LLMResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub stop_reason: StopReason,
    /// Input token count reported by the provider (if available).
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

impl LLMResponse {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Message {
    pub role: String,
    pub content: String,
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    pub tool_call_id: Option<String>,
    /// Whether this tool result represents an error (for role="tool" messages)
    pub is_error: bool,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Option<Vec<ToolCallRequest>>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
            tool_calls,
            ..Default::default()
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self {
            role: "tool".into(),
            content: content.into(),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
            is_error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value, // JSON Schema
}

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 10000,
        }
    }
}

impl From<&crate::config::RetrySettings> for RetryConfig {
    fn from(s: &crate::config::RetrySettings) -> Self {
        Self {
            max_retries: s.max_retries,
            initial_delay_ms: s.initial_delay_ms,
            max_delay_ms: s.max_delay_ms,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based), honoring an upstream
    /// `retry-after` hint when present.
    pub fn delay_for(&self, attempt: usize, err: &anyhow::Error) -> std::time::Duration {
        let ms = if let Some(secs) = retry_after_hint(err) {
            let hinted = secs.saturating_mul(1000);
            if hinted > self.max_delay_ms {
                warn!(
                    "retry-after hint of {}s exceeds the {}ms cap, clamping",
                    secs, self.max_delay_ms
                );
            } else {
                debug!("Using retry-after hint: {}s", secs);
            }
            hinted.min(self.max_delay_ms)
        } else {
            crate::utils::exponential_backoff_delay(
                attempt.saturating_sub(1) as u32,
                self.initial_delay_ms,
                self.max_delay_ms,
            )
        };
        std::time::Duration::from_millis(ms)
    }
}

/// Parameters for a chat request to a model provider.
#[derive(Debug, Clone)]
pub struct ChatRequest<'a> {
    pub messages: Vec<Message>,
    pub tools: Option<Vec<ToolDefinition>>,
    pub model: Option<&'a str>,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn chat(&self, req: ChatRequest<'_>) -> anyhow::Result<LLMResponse>;

    /// Streaming variant. Text is pushed into `deltas` as it arrives; the
    /// returned response carries the full content and any tool calls.
    ///
    /// The default implementation calls `chat` and emits the content as a
    /// single delta.
    async fn chat_stream(
        &self,
        req: ChatRequest<'_>,
        deltas: DeltaSender,
    ) -> anyhow::Result<LLMResponse> {
        let response = self.chat(req).await?;
        if let Some(ref content) = response.content
            && !content.is_empty()
        {
            let _ = deltas.send(content.clone());
        }
        Ok(response)
    }

    fn default_model(&self) -> &str;

    /// Chat with automatic retry on transient errors.
    async fn chat_with_retry(
        &self,
        req: ChatRequest<'_>,
        retry_config: Option<RetryConfig>,
    ) -> anyhow::Result<LLMResponse> {
        let config = retry_config.unwrap_or_default();
        let mut attempt = 0;
        loop {
            match self.chat(req.clone()).await {
                Ok(response) => {
                    if attempt > 0 {
                        debug!("Chat request succeeded on attempt {}", attempt);
                    }
                    return Ok(response);
                }
                Err(e) => {
                    if !is_transient(&e) || attempt >= config.max_retries {
                        return Err(e);
                    }
                    attempt += 1;
                    let delay = config.delay_for(attempt, &e);
                    warn!(
                        "Provider retry attempt {}/{} in {:?} after error: {}",
                        attempt, config.max_retries, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

use crate::config::ProviderConfig;
use crate::providers::base::{
    ChatRequest, DeltaSender, LLMProvider, LLMResponse, Message, StopReason, ToolCallRequest,
};
use crate::providers::errors::ProviderErrorHandler;
use crate::providers::provider_http_client;
use crate::providers::sse::{SseDecoder, SseEvent};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Provider for any OpenAI-compatible chat completions endpoint.
pub struct OpenAIProvider {
    api_key: String,
    default_model: String,
    base_url: String,
    provider_name: String,
    client: Client,
}

impl OpenAIProvider {
    pub fn new(
        api_key: String,
        default_model: String,
        base_url: String,
        provider_name: String,
    ) -> Self {
        Self {
            api_key,
            default_model,
            base_url,
            provider_name,
            client: provider_http_client(),
        }
    }

    pub fn from_config(config: &ProviderConfig, default_model: &str) -> Self {
        Self::new(
            config.api_key.clone(),
            default_model.to_string(),
            config.api_base.clone(),
            config.name.clone(),
        )
    }

    fn message_to_json(msg: Message) -> Value {
        let mut m = json!({
            "role": msg.role,
            "content": msg.content,
        });
        if let Some(tool_calls) = msg.tool_calls {
            m["tool_calls"] = json!(
                tool_calls
                    .into_iter()
                    .map(|tc| {
                        let args_str = serde_json::to_string(&tc.arguments)
                            .unwrap_or_else(|_| "{}".to_string());
                        json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {"name": tc.name, "arguments": args_str}
                        })
                    })
                    .collect::<Vec<_>>()
            );
        }
        if let Some(tool_call_id) = msg.tool_call_id {
            m["tool_call_id"] = json!(tool_call_id);
        }
        m
    }

    fn build_payload(&self, req: ChatRequest<'_>, stream: bool) -> Value {
        let messages: Vec<Value> = req.messages.into_iter().map(Self::message_to_json).collect();
        let mut payload = json!({
            "model": req.model.unwrap_or(&self.default_model),
            "messages": messages,
            "max_tokens": req.max_tokens,
            "temperature": req.temperature,
        });
        if let Some(tools) = req.tools
            && !tools.is_empty()
        {
            payload["tools"] = json!(
                tools
                    .into_iter()
                    .map(|t| json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters
                        }
                    }))
                    .collect::<Vec<_>>()
            );
        }
        if stream {
            payload["stream"] = json!(true);
            payload["stream_options"] = json!({"include_usage": true});
        }
        payload
    }

    fn parse_arguments(raw: Option<&str>) -> Value {
        raw.filter(|s| !s.trim().is_empty())
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_else(|| json!({}))
    }

    fn parse_response(json: &Value) -> Result<LLMResponse> {
        let choice = json["choices"]
            .as_array()
            .and_then(|arr| arr.first())
            .context("No choices in chat completion response")?;

        let message = &choice["message"];
        let content = message["content"].as_str().map(ToString::to_string);

        let tool_calls = message["tool_calls"]
            .as_array()
            .map(|calls| {
                calls
                    .iter()
                    .filter_map(|tc| {
                        let function = tc["function"].as_object()?;
                        Some(ToolCallRequest {
                            id: tc["id"].as_str().unwrap_or_default().to_string(),
                            name: function
                                .get("name")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            arguments: Self::parse_arguments(
                                function.get("arguments").and_then(Value::as_str),
                            ),
                        })
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let mut stop_reason = StopReason::from_finish_reason(choice["finish_reason"].as_str());
        if !tool_calls.is_empty() {
            stop_reason = StopReason::ToolUse;
        }

        Ok(LLMResponse {
            content,
            tool_calls,
            stop_reason,
            input_tokens: json["usage"]["prompt_tokens"].as_u64(),
            output_tokens: json["usage"]["completion_tokens"].as_u64(),
        })
    }

    async fn post(&self, payload: &Value) -> Result<reqwest::Response> {
        self.client
            .post(&self.base_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(payload)
            .send()
            .await
            .with_context(|| format!("Failed to send request to {} API", self.provider_name))
    }
}

/// Accumulates streamed chunks into a complete response.
#[derive(Default)]
struct StreamAccumulator {
    content: String,
    // keyed by the `index` field; ids and names arrive once, arguments in pieces
    tool_calls: BTreeMap<u64, (String, String, String)>,
    finish_reason: Option<String>,
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

impl StreamAccumulator {
    fn apply(&mut self, event: &SseEvent, deltas: &DeltaSender) {
        let Some(data) = event.data.as_ref() else {
            return;
        };
        if let Some(usage) = data.get("usage").filter(|u| u.is_object()) {
            self.input_tokens = usage["prompt_tokens"].as_u64();
            self.output_tokens = usage["completion_tokens"].as_u64();
        }
        let Some(choice) = data["choices"].as_array().and_then(|c| c.first()) else {
            return;
        };
        if let Some(reason) = choice["finish_reason"].as_str() {
            self.finish_reason = Some(reason.to_string());
        }
        let delta = &choice["delta"];
        if let Some(text) = delta["content"].as_str()
            && !text.is_empty()
        {
            self.content.push_str(text);
            let _ = deltas.send(text.to_string());
        }
        if let Some(calls) = delta["tool_calls"].as_array() {
            for call in calls {
                let index = call["index"].as_u64().unwrap_or(0);
                let entry = self.tool_calls.entry(index).or_default();
                if let Some(id) = call["id"].as_str() {
                    entry.0 = id.to_string();
                }
                if let Some(name) = call["function"]["name"].as_str() {
                    entry.1.push_str(name);
                }
                if let Some(args) = call["function"]["arguments"].as_str() {
                    entry.2.push_str(args);
                }
            }
        }
    }

    fn finish(self) -> LLMResponse {
        let tool_calls: Vec<ToolCallRequest> = self
            .tool_calls
            .into_values()
            .map(|(id, name, args)| ToolCallRequest {
                id,
                name,
                arguments: OpenAIProvider::parse_arguments(Some(&args)),
            })
            .collect();
        let stop_reason = if tool_calls.is_empty() {
            StopReason::from_finish_reason(self.finish_reason.as_deref())
        } else {
            StopReason::ToolUse
        };
        LLMResponse {
            content: (!self.content.is_empty()).then_some(self.content),
            tool_calls,
            stop_reason,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
        }
    }
}

#[async_trait]
impl LLMProvider for OpenAIProvider {
    async fn chat(&self, req: ChatRequest<'_>) -> Result<LLMResponse> {
        let payload = self.build_payload(req, false);
        let resp = self.post(&payload).await?;
        let json = ProviderErrorHandler::check_response(resp, &self.provider_name).await?;
        Self::parse_response(&json)
    }

    async fn chat_stream(&self, req: ChatRequest<'_>, deltas: DeltaSender) -> Result<LLMResponse> {
        let payload = self.build_payload(req, true);
        let resp = self.post(&payload).await?;
        let resp = ProviderErrorHandler::check_http_status(resp, &self.provider_name).await?;

        let mut decoder = SseDecoder::new();
        let mut acc = StreamAccumulator::default();
        let mut stream = resp.bytes_stream();
        // Chunks may split a multi-byte character; hold back the incomplete tail
        let mut pending: Vec<u8> = Vec::new();
        'outer: while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .with_context(|| format!("{} stream interrupted", self.provider_name))?;
            pending.extend_from_slice(&chunk);
            let text = drain_utf8(&mut pending);
            for event in decoder.push(&text) {
                if event.done {
                    break 'outer;
                }
                acc.apply(&event, &deltas);
            }
        }
        if let Some(event) = decoder.finish()
            && !event.done
        {
            acc.apply(&event, &deltas);
        }
        debug!(
            "{} stream finished ({} chars, {} tool calls)",
            self.provider_name,
            acc.content.len(),
            acc.tool_calls.len()
        );
        Ok(acc.finish())
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }
}

/// Decode the complete prefix of `pending` and remove it. Invalid sequences
/// become U+FFFD; only an incomplete trailing sequence is kept for the next chunk.
fn drain_utf8(pending: &mut Vec<u8>) -> String {
    let mut out = String::new();
    let mut start = 0;
    while start < pending.len() {
        match std::str::from_utf8(&pending[start..]) {
            Ok(rest) => {
                out.push_str(rest);
                start = pending.len();
            }
            Err(e) => {
                let valid = start + e.valid_up_to();
                out.push_str(&String::from_utf8_lossy(&pending[start..valid]));
                match e.error_len() {
                    Some(bad) => {
                        warn!("skipping {} invalid byte(s) in model stream", bad);
                        out.push(char::REPLACEMENT_CHARACTER);
                        start = valid + bad;
                    }
                    None => {
                        start = valid;
                        break;
                    }
                }
            }
        }
    }
    pending.drain(..start);
    out
}

use crate::agent::tokens::estimate_tokens;
use crate::providers::base::{Message, ToolCallRequest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "user")]
    User,
    #[serde(rename = "assistant")]
    Assistant,
    #[serde(rename = "tool-result")]
    ToolResult,
    /// Synopsis of compacted turns.
    #[serde(rename = "summary")]
    Summary,
}

/// One entry in a transcript. `approx_tokens` is fixed at construction so the
/// transcript total is always the sum of its turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    #[serde(rename = "approxTokens")]
    pub approx_tokens: usize,
    /// Tool requests issued by an assistant turn.
    #[serde(default, rename = "toolCalls", skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    /// For tool-result turns, the request this answers.
    #[serde(default, rename = "callId", skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
    #[serde(default = "chrono::Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    fn build(
        role: Role,
        content: String,
        tool_calls: Vec<ToolCallRequest>,
        call_id: Option<String>,
        is_error: bool,
        model: &str,
    ) -> Self {
        let mut turn = Self {
            role,
            content,
            approx_tokens: 0,
            tool_calls,
            call_id,
            is_error,
            timestamp: Utc::now(),
        };
        turn.approx_tokens = estimate_tokens(&turn.token_text(), model);
        turn
    }

    pub fn user(content: impl Into<String>, model: &str) -> Self {
        Self::build(Role::User, content.into(), Vec::new(), None, false, model)
    }

    pub fn assistant(
        content: impl Into<String>,
        tool_calls: Vec<ToolCallRequest>,
        model: &str,
    ) -> Self {
        Self::build(Role::Assistant, content.into(), tool_calls, None, false, model)
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        payload: impl Into<String>,
        is_error: bool,
        model: &str,
    ) -> Self {
        Self::build(
            Role::ToolResult,
            payload.into(),
            Vec::new(),
            Some(call_id.into()),
            is_error,
            model,
        )
    }

    pub fn summary(text: impl Into<String>, model: &str) -> Self {
        Self::build(Role::Summary, text.into(), Vec::new(), None, false, model)
    }

    /// Replace the content and re-estimate.
    pub fn set_content(&mut self, content: impl Into<String>, model: &str) {
        self.content = content.into();
        self.approx_tokens = estimate_tokens(&self.token_text(), model);
    }

    /// Text the estimate is computed from: content plus serialized tool requests.
    pub fn token_text(&self) -> String {
        if self.tool_calls.is_empty() {
            return self.content.clone();
        }
        let mut text = self.content.clone();
        for tc in &self.tool_calls {
            text.push('\n');
            text.push_str(&tc.name);
            text.push_str(&tc.arguments.to_string());
        }
        text
    }

    pub fn to_message(&self) -> Message {
        match self.role {
            Role::User => Message::user(self.content.clone()),
            Role::Assistant => Message::assistant(
                self.content.clone(),
                (!self.tool_calls.is_empty()).then(|| self.tool_calls.clone()),
            ),
            Role::ToolResult => Message::tool_result(
                self.call_id.clone().unwrap_or_default(),
                self.content.clone(),
                self.is_error,
            ),
            Role::Summary => Message::system(format!(
                "[Previous conversation summary: {}]",
                self.content
            )),
        }
    }
}

// Shared test helpers; not every binary uses every item.
#![allow(unused)]

use async_trait::async_trait;
use parlance::agent::compaction::Summarizer;
use parlance::agent::tools::backend::{CapabilityBackend, CapabilityTool};
use parlance::agent::{ConversationOrchestrator, OrchestratorConfig};
use parlance::channels::{OutboundMessage, Transport};
use parlance::config::{CapabilityDecl, Config};
use parlance::providers::base::{
    ChatRequest, LLMProvider, LLMResponse, Message, StopReason, ToolCallRequest, ToolDefinition,
};
use parlance::session::InMemorySessionStore;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub messages: Vec<Message>,
    pub tools: Option<Vec<ToolDefinition>>,
}

pub struct MockProvider {
    responses: Mutex<VecDeque<anyhow::Result<LLMResponse>>>,
    pub calls: Mutex<Vec<RecordedCall>>,
    pub default_response: String,
}

impl MockProvider {
    pub fn with_responses(responses: Vec<LLMResponse>) -> Arc<Self> {
        Self::with_results(responses.into_iter().map(Ok).collect())
    }

    pub fn with_results(results: Vec<anyhow::Result<LLMResponse>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(VecDeque::from(results)),
            calls: Mutex::new(Vec::new()),
            default_response: "Mock response".to_string(),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn recorded(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl LLMProvider for MockProvider {
    async fn chat(&self, req: ChatRequest<'_>) -> anyhow::Result<LLMResponse> {
        self.calls.lock().unwrap().push(RecordedCall {
            messages: req.messages,
            tools: req.tools,
        });
        let next = self.responses.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(text_response(&self.default_response)))
    }

    fn default_model(&self) -> &str {
        "gpt-4o"
    }
}

// --- Response builders ---

pub fn text_response(content: &str) -> LLMResponse {
    LLMResponse::text(content)
}

pub fn tool_response(calls: Vec<ToolCallRequest>) -> LLMResponse {
    LLMResponse {
        content: None,
        tool_calls: calls,
        stop_reason: StopReason::ToolUse,
        ..LLMResponse::default()
    }
}

pub fn tool_call(id: &str, name: &str, arguments: Value) -> ToolCallRequest {
    ToolCallRequest {
        id: id.to_string(),
        name: name.to_string(),
        arguments,
    }
}

// --- Transport ---

#[derive(Default)]
pub struct RecordingTransport {
    pub sent: Mutex<Vec<OutboundMessage>>,
}

impl RecordingTransport {
    pub fn texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.content.clone())
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, msg: &OutboundMessage) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(msg.clone());
        Ok(())
    }
}

// --- Capabilities ---

/// Echoes parameters back. `{"fail": true}` yields an error payload.
#[derive(Default)]
pub struct EchoCapability {
    pub invocations: AtomicUsize,
}

impl EchoCapability {
    pub fn count(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CapabilityBackend for EchoCapability {
    async fn invoke(&self, name: &str, params: &Value) -> String {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if params["fail"].as_bool() == Some(true) {
            return json!({"error": format!("{} upstream unavailable", name)}).to_string();
        }
        json!({"capability": name, "echo": params}).to_string()
    }
}

pub fn echo_decl(name: &str) -> CapabilityDecl {
    CapabilityDecl {
        name: name.to_string(),
        description: format!("Echo capability {}", name),
        parameters: json!({
            "type": "object",
            "properties": {
                "text": {"type": "string"},
                "fail": {"type": "boolean"}
            },
            "required": ["text"]
        }),
        cacheable: false,
        allow_subagents: true,
        timeout_secs: None,
    }
}

pub struct FailingSummarizer;

#[async_trait]
impl Summarizer for FailingSummarizer {
    async fn summarize(&self, _text: &str) -> anyhow::Result<String> {
        anyhow::bail!("summarizer offline")
    }
}

pub struct FixedSummarizer(pub &'static str);

#[async_trait]
impl Summarizer for FixedSummarizer {
    async fn summarize(&self, _text: &str) -> anyhow::Result<String> {
        Ok(self.0.to_string())
    }
}

pub struct TestRuntime {
    pub orchestrator: ConversationOrchestrator,
    pub provider: Arc<MockProvider>,
    pub transport: Arc<RecordingTransport>,
    pub echo: Arc<EchoCapability>,
}

/// Orchestrator over a mock provider with one `echo` capability.
pub async fn runtime(provider: Arc<MockProvider>, config: Config) -> TestRuntime {
    runtime_with(provider, config, |_| {}).await
}

pub async fn runtime_with(
    provider: Arc<MockProvider>,
    config: Config,
    customize: impl FnOnce(&mut OrchestratorConfig),
) -> TestRuntime {
    let transport = Arc::new(RecordingTransport::default());
    let echo = Arc::new(EchoCapability::default());
    let mut deps = OrchestratorConfig::new(
        config,
        provider.clone(),
        transport.clone(),
        Arc::new(InMemorySessionStore::new()),
    );
    deps.summarizer = Some(Arc::new(FixedSummarizer("earlier conversation summary")));
    deps.tools = vec![Arc::new(CapabilityTool::new(echo_decl("echo"), echo.clone()))];
    customize(&mut deps);
    TestRuntime {
        orchestrator: ConversationOrchestrator::new(deps)
            .await
            .expect("build orchestrator"),
        provider,
        transport,
        echo,
    }
}

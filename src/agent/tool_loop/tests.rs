use super::*;
use crate::agent::compaction::Summarizer;
use crate::agent::hooks::{Hook, HookOutcome};
use crate::agent::tools::registry::ToolRegistry;
use crate::agent::tools::{Tool, ToolResult};
use crate::config::ContextConfig;
use crate::errors::RuntimeError;
use crate::providers::base::{LLMResponse, StopReason};
use crate::session::Role;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const MODEL: &str = "gpt-4o";

struct ScriptedProvider {
    responses: Mutex<VecDeque<Result<LLMResponse>>>,
    requests: Mutex<Vec<(usize, bool)>>,
}

impl ScriptedProvider {
    fn new(responses: Vec<Result<LLMResponse>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Whether the nth request carried a tool catalog.
    fn had_tools(&self, n: usize) -> bool {
        self.requests.lock().unwrap()[n].1
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    async fn chat(&self, req: ChatRequest<'_>) -> Result<LLMResponse> {
        self.requests
            .lock()
            .unwrap()
            .push((req.messages.len(), req.tools.is_some()));
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(LLMResponse::text("out of script")))
    }

    fn default_model(&self) -> &str {
        MODEL
    }
}

fn tool_call(id: &str, symbol: &str) -> LLMResponse {
    LLMResponse {
        content: None,
        tool_calls: vec![ToolCallRequest {
            id: id.to_string(),
            name: "get_quote".to_string(),
            arguments: json!({"symbol": symbol}),
        }],
        stop_reason: StopReason::ToolUse,
        ..LLMResponse::default()
    }
}

struct QuoteTool {
    calls: Arc<AtomicUsize>,
    delay: Duration,
}

#[async_trait]
impl Tool for QuoteTool {
    fn name(&self) -> &str {
        "get_quote"
    }
    fn description(&self) -> &str {
        "quote"
    }
    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {"symbol": {"type": "string"}}, "required": ["symbol"]})
    }
    async fn execute(&self, params: Value, _ctx: &ExecutionContext) -> Result<ToolResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(ToolResult::new(format!("{}=42", params["symbol"].as_str().unwrap_or("?"))))
    }
}

struct NoSummary;

#[async_trait]
impl Summarizer for NoSummary {
    async fn summarize(&self, _text: &str) -> Result<String> {
        Ok("summary".into())
    }
}

struct Fixture {
    dispatcher: ToolDispatcher,
    context: ContextWindowManager,
    hooks: HookRegistry,
    settings: LoopSettings,
    exec_ctx: ExecutionContext,
    calls: Arc<AtomicUsize>,
}

fn fixture(max_iterations: usize, tool_delay: Duration) -> Fixture {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(QuoteTool {
        calls: calls.clone(),
        delay: tool_delay,
    }));
    Fixture {
        dispatcher: ToolDispatcher::new(Arc::new(registry)),
        context: ContextWindowManager::new(ContextConfig::default(), MODEL, Arc::new(NoSummary)),
        hooks: HookRegistry::new(),
        settings: LoopSettings {
            model: MODEL.to_string(),
            max_output_tokens: 512,
            temperature: 0.0,
            max_iterations,
            retry: RetryConfig {
                max_retries: 2,
                initial_delay_ms: 1,
                max_delay_ms: 2,
            },
            tool_notice_delay: Duration::from_millis(20),
        },
        exec_ctx: ExecutionContext::for_session("s1", "alice", "cli"),
        calls,
    }
}

impl Fixture {
    fn tool_loop<'a>(&'a self, provider: &'a dyn LLMProvider) -> ToolLoop<'a> {
        ToolLoop::new(
            provider,
            &self.dispatcher,
            &self.context,
            &self.hooks,
            &self.settings,
            &self.exec_ctx,
        )
    }
}

#[tokio::test]
async fn test_terminal_response_appends_assistant_turn() {
    let fx = fixture(5, Duration::ZERO);
    let provider = ScriptedProvider::new(vec![Ok(LLMResponse::text("hi there"))]);
    let mut turns = vec![Turn::user("hello", MODEL)];

    let outcome = fx.tool_loop(&provider).run("sys", &mut turns).await.unwrap();

    assert_eq!(outcome.exit, LoopExit::Completed("hi there".into()));
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[1].role, Role::Assistant);
    assert_eq!(outcome.dispatched, 0);
}

#[tokio::test]
async fn test_n_tool_turns_produce_n_results() {
    let fx = fixture(10, Duration::ZERO);
    let provider = ScriptedProvider::new(vec![
        Ok(tool_call("c1", "SOL")),
        Ok(tool_call("c2", "ETH")),
        Ok(tool_call("c3", "BTC")),
        Ok(LLMResponse::text("done")),
    ]);
    let mut turns = vec![Turn::user("prices", MODEL)];

    let outcome = fx.tool_loop(&provider).run("sys", &mut turns).await.unwrap();

    assert_eq!(outcome.dispatched, 3);
    assert_eq!(fx.calls.load(Ordering::SeqCst), 3);
    let results: Vec<&Turn> = turns.iter().filter(|t| t.role == Role::ToolResult).collect();
    assert_eq!(results.len(), 3);
    assert_eq!(results[1].call_id.as_deref(), Some("c2"));
    assert_eq!(results[1].content, "ETH=42");
}

#[tokio::test]
async fn test_parallel_results_keep_request_order() {
    let fx = fixture(5, Duration::ZERO);
    let mut batch = tool_call("a", "SOL");
    batch.tool_calls.push(ToolCallRequest {
        id: "b".into(),
        name: "missing_tool".into(),
        arguments: json!({}),
    });
    batch.tool_calls.push(ToolCallRequest {
        id: "c".into(),
        name: "get_quote".into(),
        arguments: json!({"symbol": "ETH"}),
    });
    let provider = ScriptedProvider::new(vec![Ok(batch), Ok(LLMResponse::text("ok"))]);
    let mut turns = vec![Turn::user("go", MODEL)];

    fx.tool_loop(&provider).run("sys", &mut turns).await.unwrap();

    let ids: Vec<_> = turns
        .iter()
        .filter(|t| t.role == Role::ToolResult)
        .map(|t| (t.call_id.clone().unwrap(), t.is_error))
        .collect();
    assert_eq!(
        ids,
        vec![("a".into(), false), ("b".into(), true), ("c".into(), false)]
    );
}

struct BlockQuotes;

#[async_trait]
impl Hook for BlockQuotes {
    fn name(&self) -> &str {
        "block-quotes"
    }
    async fn handle(&self, _ctx: &HookContext) -> Result<HookOutcome> {
        Ok(HookOutcome::block("quotes are disabled"))
    }
}

#[tokio::test]
async fn test_blocking_hook_prevents_dispatch() {
    let fx = fixture(5, Duration::ZERO);
    fx.hooks.register(HookPoint::ToolBeforeCall, Arc::new(BlockQuotes));
    let provider = ScriptedProvider::new(vec![Ok(tool_call("c1", "SOL")), Ok(LLMResponse::text("sorry"))]);
    let mut turns = vec![Turn::user("price", MODEL)];

    fx.tool_loop(&provider).run("sys", &mut turns).await.unwrap();

    assert_eq!(fx.calls.load(Ordering::SeqCst), 0);
    let result = turns.iter().find(|t| t.role == Role::ToolResult).unwrap();
    assert!(result.is_error);
    assert!(result.content.contains("quotes are disabled"));
}

struct RewriteSymbol;

#[async_trait]
impl Hook for RewriteSymbol {
    fn name(&self) -> &str {
        "rewrite"
    }
    async fn handle(&self, _ctx: &HookContext) -> Result<HookOutcome> {
        Ok(HookOutcome::update(json!({"params": {"symbol": "JUP"}})))
    }
}

#[tokio::test]
async fn test_hook_can_rewrite_params() {
    let fx = fixture(5, Duration::ZERO);
    fx.hooks.register(HookPoint::ToolBeforeCall, Arc::new(RewriteSymbol));
    let provider = ScriptedProvider::new(vec![Ok(tool_call("c1", "SOL")), Ok(LLMResponse::text("ok"))]);
    let mut turns = vec![Turn::user("price", MODEL)];

    fx.tool_loop(&provider).run("sys", &mut turns).await.unwrap();

    let result = turns.iter().find(|t| t.role == Role::ToolResult).unwrap();
    assert_eq!(result.content, "JUP=42");
}

#[tokio::test]
async fn test_iteration_limit_forces_final_answer_without_tools() {
    let fx = fixture(2, Duration::ZERO);
    let provider = ScriptedProvider::new(vec![
        Ok(tool_call("c1", "SOL")),
        Ok(tool_call("c2", "SOL")),
        Ok(LLMResponse::text("best effort")),
    ]);
    let mut turns = vec![Turn::user("loop forever", MODEL)];

    let outcome = fx.tool_loop(&provider).run("sys", &mut turns).await.unwrap();

    assert_eq!(outcome.exit, LoopExit::IterationLimit("best effort".into()));
    assert_eq!(provider.calls(), 3);
    assert!(provider.had_tools(0));
    assert!(!provider.had_tools(2));
}

#[tokio::test]
async fn test_transient_errors_are_retried() {
    let fx = fixture(5, Duration::ZERO);
    let provider = ScriptedProvider::new(vec![
        Err(RuntimeError::ModelUnavailable {
            message: "503".into(),
            retryable: true,
        }
        .into()),
        Ok(LLMResponse::text("recovered")),
    ]);
    let mut turns = vec![Turn::user("hi", MODEL)];

    let outcome = fx.tool_loop(&provider).run("sys", &mut turns).await.unwrap();
    assert_eq!(outcome.exit.text(), Some("recovered"));
    assert_eq!(provider.calls(), 2);
}

#[tokio::test]
async fn test_fatal_errors_are_not_retried() {
    let fx = fixture(5, Duration::ZERO);
    let provider = ScriptedProvider::new(vec![Err(RuntimeError::Auth("bad key".into()).into())]);
    let mut turns = vec![Turn::user("hi", MODEL)];

    assert!(fx.tool_loop(&provider).run("sys", &mut turns).await.is_err());
    assert_eq!(provider.calls(), 1);
}

#[derive(Default)]
struct CollectingSink {
    text: Mutex<String>,
    notices: Mutex<Vec<String>>,
}

#[async_trait]
impl StreamSink for CollectingSink {
    async fn push_text(&self, delta: &str) {
        self.text.lock().unwrap().push_str(delta);
    }
    async fn notice(&self, text: &str) {
        self.notices.lock().unwrap().push(text.to_string());
    }
}

#[tokio::test]
async fn test_no_retry_after_output_streamed() {
    let fx = fixture(5, Duration::ZERO);
    let mut partial = tool_call("c1", "SOL");
    partial.content = Some("Checking".into());
    let provider = ScriptedProvider::new(vec![
        Ok(partial),
        Err(RuntimeError::ModelUnavailable {
            message: "reset".into(),
            retryable: true,
        }
        .into()),
        Ok(LLMResponse::text("never reached")),
    ]);
    let sink = CollectingSink::default();
    let mut turns = vec![Turn::user("hi", MODEL)];

    let result = fx.tool_loop(&provider).with_sink(&sink).run("sys", &mut turns).await;

    assert!(result.is_err());
    assert_eq!(provider.calls(), 2);
    assert_eq!(*sink.text.lock().unwrap(), "Checking");
}

#[tokio::test]
async fn test_slow_tool_emits_running_and_finished_notices() {
    let fx = fixture(5, Duration::from_millis(80));
    let provider = ScriptedProvider::new(vec![Ok(tool_call("c1", "SOL")), Ok(LLMResponse::text("ok"))]);
    let sink = CollectingSink::default();
    let mut turns = vec![Turn::user("hi", MODEL)];

    fx.tool_loop(&provider).with_sink(&sink).run("sys", &mut turns).await.unwrap();

    let notices = sink.notices.lock().unwrap().clone();
    assert_eq!(notices.len(), 2);
    assert!(notices[0].starts_with("Running get_quote"));
    assert!(notices[1].starts_with("Finished get_quote"));
}

#[tokio::test]
async fn test_fast_tool_emits_no_notice() {
    let fx = fixture(5, Duration::ZERO);
    let provider = ScriptedProvider::new(vec![Ok(tool_call("c1", "SOL")), Ok(LLMResponse::text("ok"))]);
    let sink = CollectingSink::default();
    let mut turns = vec![Turn::user("hi", MODEL)];

    fx.tool_loop(&provider).with_sink(&sink).run("sys", &mut turns).await.unwrap();
    assert!(sink.notices.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_pause_stops_before_next_submission() {
    let fx = fixture(5, Duration::ZERO);
    let provider = ScriptedProvider::new(vec![Ok(LLMResponse::text("unused"))]);
    let token = CancellationToken::new();
    token.cancel();
    let mut turns = vec![Turn::user("hi", MODEL)];

    let outcome = fx
        .tool_loop(&provider)
        .with_pause(&token)
        .run("sys", &mut turns)
        .await
        .unwrap();

    assert_eq!(outcome.exit, LoopExit::Paused);
    assert_eq!(provider.calls(), 0);
    assert_eq!(turns.len(), 1);
}

#[tokio::test]
async fn test_elapsed_deadline_times_out() {
    let fx = fixture(5, Duration::ZERO);
    let provider = ScriptedProvider::new(vec![]);
    let mut turns = vec![Turn::user("hi", MODEL)];

    let outcome = fx
        .tool_loop(&provider)
        .with_deadline(Instant::now())
        .run("sys", &mut turns)
        .await
        .unwrap();
    assert_eq!(outcome.exit, LoopExit::TimedOut);
}

#[tokio::test]
async fn test_oversized_result_is_truncated_and_compaction_forced() {
    struct BigTool;
    #[async_trait]
    impl Tool for BigTool {
        fn name(&self) -> &str {
            "dump"
        }
        fn description(&self) -> &str {
            "dump"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _p: Value, _c: &ExecutionContext) -> Result<ToolResult> {
            Ok(ToolResult::new("z ".repeat(20_000)))
        }
    }

    let mut registry = ToolRegistry::with_max_result_chars(1_000_000);
    registry.register(Arc::new(BigTool));
    let context_config = ContextConfig {
        max_tokens: 2_000,
        reserve_tokens: 0,
        compact_threshold: 0.4,
        min_recent_turns: 2,
        keep_recent_turns: 2,
        ..ContextConfig::default()
    };
    let mut fx = fixture(5, Duration::ZERO);
    fx.dispatcher = ToolDispatcher::new(Arc::new(registry));
    fx.context = ContextWindowManager::new(context_config, MODEL, Arc::new(NoSummary));

    let provider = ScriptedProvider::new(vec![
        Ok(LLMResponse {
            tool_calls: vec![ToolCallRequest {
                id: "d1".into(),
                name: "dump".into(),
                arguments: json!({}),
            }],
            stop_reason: StopReason::ToolUse,
            ..LLMResponse::default()
        }),
        Ok(LLMResponse::text("summarized")),
    ]);
    let mut turns = vec![
        Turn::user("earlier", MODEL),
        Turn::assistant("reply", Vec::new(), MODEL),
        Turn::user("dump it", MODEL),
    ];

    let outcome = fx.tool_loop(&provider).run("sys", &mut turns).await.unwrap();

    let result = turns.iter().find(|t| t.role == Role::ToolResult).unwrap();
    assert!(result.approx_tokens <= 1_000);
    assert_eq!(outcome.compactions, 1);
    assert_eq!(turns[0].role, Role::Summary);
}

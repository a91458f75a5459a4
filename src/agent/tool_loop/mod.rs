//! The tool-use loop shared by user sessions and subagent runs.
//!
//! One iteration: consult the context guard, submit the transcript, and
//! either finish on a terminal response or dispatch every requested tool and
//! append the results in request order. Pause and deadline are checked only
//! at iteration boundaries, never during an in-flight dispatch.

use crate::agent::compaction::ContextWindowManager;
use crate::agent::hooks::{HookContext, HookPoint, HookRegistry, HookResult};
use crate::agent::tokens::estimate_tokens;
use crate::agent::tools::ExecutionContext;
use crate::agent::tools::registry::{ToolCallResult, ToolDispatcher};
use crate::errors::is_transient;
use crate::providers::base::{
    ChatRequest, LLMProvider, LLMResponse, Message, RetryConfig, ToolCallRequest, ToolDefinition,
};
use crate::session::Turn;
use anyhow::Result;
use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::{Value, json};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const WRAP_UP_PROMPT: &str = "You have reached the tool-use limit for this request. Do not call any more tools. Summarize what you found so far and give your best answer.";
const WRAP_UP_FALLBACK: &str = "I reached the tool-use limit before finishing. Please narrow the request and try again.";

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub model: String,
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub max_iterations: usize,
    pub retry: RetryConfig,
    /// A tool batch still running after this long gets a progress notice.
    pub tool_notice_delay: Duration,
}

/// Receives model text as it streams plus out-of-band notices.
#[async_trait]
pub trait StreamSink: Send + Sync {
    async fn push_text(&self, delta: &str);
    /// The current response asked for tools; later text belongs to a new reply.
    async fn end_segment(&self) {}
    async fn notice(&self, text: &str);
}

/// Told about every completed tool iteration.
#[async_trait]
pub trait IterationObserver: Send + Sync {
    async fn on_iteration(&self, iteration: usize, max_iterations: usize, tools: &[String]);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// The model gave a terminal answer.
    Completed(String),
    /// Iteration ceiling hit; the text comes from one final call without tools.
    IterationLimit(String),
    Paused,
    TimedOut,
}

impl LoopExit {
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Completed(t) | Self::IterationLimit(t) => Some(t),
            Self::Paused | Self::TimedOut => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Completed(_) => "completed",
            Self::IterationLimit(_) => "iteration_limit",
            Self::Paused => "paused",
            Self::TimedOut => "timed_out",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub exit: LoopExit,
    pub iterations: usize,
    pub dispatched: usize,
    pub compactions: u32,
    /// Summary text from the most recent successful compaction.
    pub last_summary: Option<String>,
    /// Whether any model text reached the stream sink.
    pub streamed: bool,
}

#[derive(Default)]
struct LoopState {
    iterations: usize,
    dispatched: usize,
    compactions: u32,
    last_summary: Option<String>,
    streamed: bool,
}

impl LoopState {
    fn finish(self, exit: LoopExit) -> LoopOutcome {
        LoopOutcome {
            exit,
            iterations: self.iterations,
            dispatched: self.dispatched,
            compactions: self.compactions,
            last_summary: self.last_summary,
            streamed: self.streamed,
        }
    }
}

enum Gate {
    Run(ToolCallRequest),
    Blocked(ToolCallResult),
}

pub struct ToolLoop<'a> {
    provider: &'a dyn LLMProvider,
    dispatcher: &'a ToolDispatcher,
    context: &'a ContextWindowManager,
    hooks: &'a HookRegistry,
    settings: &'a LoopSettings,
    exec_ctx: &'a ExecutionContext,
    pause: Option<&'a CancellationToken>,
    deadline: Option<Instant>,
    sink: Option<&'a dyn StreamSink>,
    observer: Option<&'a dyn IterationObserver>,
}

impl<'a> ToolLoop<'a> {
    pub fn new(
        provider: &'a dyn LLMProvider,
        dispatcher: &'a ToolDispatcher,
        context: &'a ContextWindowManager,
        hooks: &'a HookRegistry,
        settings: &'a LoopSettings,
        exec_ctx: &'a ExecutionContext,
    ) -> Self {
        Self {
            provider,
            dispatcher,
            context,
            hooks,
            settings,
            exec_ctx,
            pause: None,
            deadline: None,
            sink: None,
            observer: None,
        }
    }

    #[must_use]
    pub fn with_pause(mut self, token: &'a CancellationToken) -> Self {
        self.pause = Some(token);
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn with_sink(mut self, sink: &'a dyn StreamSink) -> Self {
        self.sink = Some(sink);
        self
    }

    #[must_use]
    pub fn with_observer(mut self, observer: &'a dyn IterationObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    fn hook_ctx(&self, point: HookPoint, payload: Value) -> HookContext {
        HookContext::new(
            point,
            self.exec_ctx.session_id.clone(),
            self.exec_ctx.participant_id.clone(),
            payload,
        )
    }

    fn interrupted(&self) -> Option<LoopExit> {
        if self.pause.is_some_and(CancellationToken::is_cancelled) {
            return Some(LoopExit::Paused);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Some(LoopExit::TimedOut);
        }
        None
    }

    /// Drive the loop over `turns` until a terminal response, the iteration
    /// ceiling, a pause, or the deadline. Every produced turn is appended to
    /// `turns`, including the final assistant turn. Model failures that
    /// survive the retry policy are returned as errors.
    pub async fn run(&self, system_prompt: &str, turns: &mut Vec<Turn>) -> Result<LoopOutcome> {
        let model = self.settings.model.as_str();
        let mut state = LoopState::default();
        let tools = self.dispatcher.definitions();
        let system_tokens = estimate_tokens(system_prompt, model);

        self.hooks.trigger(self.hook_ctx(
            HookPoint::AgentBeforeStart,
            json!({"turns": turns.len(), "tools": tools.len()}),
        ));

        let result = self
            .iterate(system_prompt, system_tokens, &tools, turns, &mut state)
            .await;

        let exit_label = match &result {
            Ok(exit) => exit.label(),
            Err(_) => "failed",
        };
        self.hooks.trigger(self.hook_ctx(
            HookPoint::AgentEnd,
            json!({"exit": exit_label, "iterations": state.iterations, "dispatched": state.dispatched}),
        ));

        result.map(|exit| state.finish(exit))
    }

    async fn iterate(
        &self,
        system_prompt: &str,
        system_tokens: usize,
        tools: &[ToolDefinition],
        turns: &mut Vec<Turn>,
        state: &mut LoopState,
    ) -> Result<LoopExit> {
        let model = self.settings.model.as_str();

        for iteration in 1..=self.settings.max_iterations {
            if let Some(exit) = self.interrupted() {
                info!(session_id = %self.exec_ctx.session_id, "loop stopped at iteration {}: {:?}", iteration, exit);
                return Ok(exit);
            }
            self.compact_if_needed(turns, system_tokens, state).await;

            state.iterations = iteration;
            let response = self
                .submit(system_prompt, turns, Some(tools), None, state)
                .await?;

            if !response.has_tool_calls() {
                let text = response.content.unwrap_or_default();
                turns.push(Turn::assistant(text.clone(), Vec::new(), model));
                return Ok(LoopExit::Completed(text));
            }

            if let Some(sink) = self.sink {
                sink.end_segment().await;
            }
            debug!(
                session_id = %self.exec_ctx.session_id,
                "iteration {}: {} tool call(s)",
                iteration,
                response.tool_calls.len()
            );
            turns.push(Turn::assistant(
                response.content.unwrap_or_default(),
                response.tool_calls.clone(),
                model,
            ));

            let results = self.run_tool_calls(&response.tool_calls).await;
            state.dispatched += results.len();
            for result in results {
                let payload = self.context.fit_tool_result(&result.payload);
                turns.push(Turn::tool_result(result.call_id, payload, result.is_error, model));
            }
            if let Some(observer) = self.observer {
                let names: Vec<String> = response.tool_calls.iter().map(|c| c.name.clone()).collect();
                observer
                    .on_iteration(iteration, self.settings.max_iterations, &names)
                    .await;
            }
        }

        if let Some(exit) = self.interrupted() {
            return Ok(exit);
        }
        warn!(
            session_id = %self.exec_ctx.session_id,
            "reached max iterations ({}), requesting a final answer",
            self.settings.max_iterations
        );
        self.compact_if_needed(turns, system_tokens, state).await;
        let response = self
            .submit(
                system_prompt,
                turns,
                None,
                Some(Message::user(WRAP_UP_PROMPT)),
                state,
            )
            .await?;
        let text = response
            .content
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| WRAP_UP_FALLBACK.to_string());
        turns.push(Turn::assistant(text.clone(), Vec::new(), model));
        Ok(LoopExit::IterationLimit(text))
    }

    async fn compact_if_needed(&self, turns: &mut Vec<Turn>, extra: usize, state: &mut LoopState) {
        let status = self.context.check_guard(turns, extra);
        if !status.should_compact {
            return;
        }
        info!(
            session_id = %self.exec_ctx.session_id,
            "context at {:.0}% of budget, compacting",
            status.percent_used * 100.0
        );
        self.hooks.trigger(self.hook_ctx(
            HookPoint::CompactionBefore,
            json!({"percentUsed": status.percent_used, "turns": turns.len()}),
        ));
        let result = self.context.compact(turns).await;
        self.hooks.trigger(self.hook_ctx(
            HookPoint::CompactionAfter,
            json!({
                "success": result.success,
                "tokensBefore": result.tokens_before,
                "tokensAfter": result.tokens_after,
                "removedTurnCount": result.removed_turn_count,
            }),
        ));
        if result.success {
            state.compactions += 1;
            state.last_summary = Some(result.summary_text);
        } else {
            warn!(
                session_id = %self.exec_ctx.session_id,
                "compaction did not shrink the transcript, proceeding over budget"
            );
        }
    }

    async fn submit(
        &self,
        system_prompt: &str,
        turns: &[Turn],
        tools: Option<&[ToolDefinition]>,
        extra: Option<Message>,
        state: &mut LoopState,
    ) -> Result<LLMResponse> {
        let mut messages = Vec::with_capacity(turns.len() + 2);
        messages.push(Message::system(system_prompt));
        messages.extend(turns.iter().map(Turn::to_message));
        messages.extend(extra);
        let tools = tools.filter(|t| !t.is_empty()).map(<[ToolDefinition]>::to_vec);

        let retry = &self.settings.retry;
        let mut attempt = 0;
        loop {
            let req = ChatRequest {
                messages: messages.clone(),
                tools: tools.clone(),
                model: Some(&self.settings.model),
                max_tokens: self.settings.max_output_tokens,
                temperature: self.settings.temperature,
            };
            let result = match self.sink {
                Some(sink) => self.submit_streaming(req, sink, state).await,
                None => self.provider.chat(req).await,
            };
            match result {
                Ok(response) => return Ok(response),
                Err(e) => {
                    if state.streamed {
                        warn!("model call failed after output was streamed, not retrying: {}", e);
                        return Err(e);
                    }
                    if !is_transient(&e) || attempt >= retry.max_retries {
                        return Err(e);
                    }
                    attempt += 1;
                    let delay = retry.delay_for(attempt, &e);
                    warn!(
                        "model retry {}/{} in {:?} after error: {}",
                        attempt, retry.max_retries, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn submit_streaming(
        &self,
        req: ChatRequest<'_>,
        sink: &dyn StreamSink,
        state: &mut LoopState,
    ) -> Result<LLMResponse> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        let call = self.provider.chat_stream(req, tx);
        // ends once the provider future completes and drops its sender
        let forward = async {
            let mut any = false;
            while let Some(delta) = rx.recv().await {
                sink.push_text(&delta).await;
                any = true;
            }
            any
        };
        let (result, any) = tokio::join!(call, forward);
        state.streamed |= any;
        result
    }

    /// Gate each call through `tool:before_call`, dispatch the survivors in
    /// parallel, and return results in request order.
    async fn run_tool_calls(&self, calls: &[ToolCallRequest]) -> Vec<ToolCallResult> {
        let mut gates = Vec::with_capacity(calls.len());
        for call in calls {
            gates.push(self.gate(call).await);
        }

        let futs = gates.iter().map(|gate| async move {
            match gate {
                Gate::Run(call) => self.dispatcher.dispatch(call, self.exec_ctx).await,
                Gate::Blocked(result) => result.clone(),
            }
        });
        let names: Vec<&str> = calls.iter().map(|c| c.name.as_str()).collect();
        let results = self.with_notice(join_all(futs), &names.join(", ")).await;

        if self.hooks.has_hooks(HookPoint::ToolAfterCall) {
            for (call, result) in calls.iter().zip(&results) {
                self.hooks.trigger(self.hook_ctx(
                    HookPoint::ToolAfterCall,
                    json!({
                        "tool": call.name,
                        "callId": result.call_id,
                        "isError": result.is_error,
                        "result": result.payload,
                    }),
                ));
            }
        }
        results
    }

    async fn gate(&self, call: &ToolCallRequest) -> Gate {
        if !self.hooks.has_hooks(HookPoint::ToolBeforeCall) {
            return Gate::Run(call.clone());
        }
        let ctx = self.hook_ctx(
            HookPoint::ToolBeforeCall,
            json!({"tool": call.name, "params": call.arguments, "callId": call.id}),
        );
        match self.hooks.trigger_with_result(ctx).await {
            HookResult::Blocked { hook, reason } => {
                info!(tool = %call.name, "tool call blocked by hook '{}': {}", hook, reason);
                Gate::Blocked(ToolCallResult::error(
                    &call.id,
                    format!("Blocked by hook '{}': {}", hook, reason),
                ))
            }
            HookResult::Continue(payload) => {
                let mut call = call.clone();
                if let Some(params) = payload.get("params") {
                    call.arguments = params.clone();
                }
                Gate::Run(call)
            }
        }
    }

    /// Await `fut`; if it outlives the notice delay, bracket it with a
    /// running and a finished notice.
    async fn with_notice<F: Future>(&self, fut: F, label: &str) -> F::Output {
        let Some(sink) = self.sink else {
            return fut.await;
        };
        tokio::pin!(fut);
        tokio::select! {
            out = &mut fut => out,
            () = tokio::time::sleep(self.settings.tool_notice_delay) => {
                sink.notice(&format!("Running {}…", label)).await;
                let out = fut.await;
                sink.notice(&format!("Finished {}.", label)).await;
                out
            }
        }
    }
}

#[cfg(test)]
mod tests;

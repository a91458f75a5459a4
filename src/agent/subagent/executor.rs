use super::{RunContext, SubagentExecutor};
use crate::agent::compaction::{ContextWindowManager, Summarizer};
use crate::agent::embeddings::Embedder;
use crate::agent::hooks::HookRegistry;
use crate::agent::tool_loop::{IterationObserver, LoopOutcome, LoopSettings, ToolLoop};
use crate::agent::tools::{ExecutionContext, ToolDispatcher, ToolRegistry};
use crate::config::ContextConfig;
use crate::providers::base::LLMProvider;
use crate::session::Turn;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::sync::{Arc, OnceLock, RwLock};
use tracing::debug;

const SUBAGENT_PROMPT: &str = "You are a background worker handling one delegated task for a \
parent conversation. Nobody will answer questions, so work autonomously with the tools you \
have. When you are done, reply with a concise report of what you found or did.";

/// Runs subagent tasks through the shared tool loop.
///
/// The tool registry is attached after construction because the spawn tool
/// itself needs a handle to this executor before the registry is frozen.
pub struct LoopExecutor {
    provider: Arc<dyn LLMProvider>,
    tools: OnceLock<Arc<ToolRegistry>>,
    hooks: Arc<HookRegistry>,
    summarizer: Arc<dyn Summarizer>,
    embedder: Option<Arc<dyn Embedder>>,
    limits: RwLock<(LoopSettings, ContextConfig)>,
}

impl LoopExecutor {
    pub fn new(
        provider: Arc<dyn LLMProvider>,
        hooks: Arc<HookRegistry>,
        summarizer: Arc<dyn Summarizer>,
        settings: LoopSettings,
        context: ContextConfig,
    ) -> Self {
        Self {
            provider,
            tools: OnceLock::new(),
            hooks,
            summarizer,
            embedder: None,
            limits: RwLock::new((settings, context)),
        }
    }

    /// Embedder for near-duplicate filtering in each run's context window.
    #[must_use]
    pub fn with_embedder(mut self, embedder: Option<Arc<dyn Embedder>>) -> Self {
        self.embedder = embedder;
        self
    }

    /// Attach the main registry. Only the first call has an effect.
    pub fn set_tools(&self, tools: Arc<ToolRegistry>) {
        if self.tools.set(tools).is_err() {
            debug!("subagent tool registry already set");
        }
    }

    pub fn update_limits(&self, settings: LoopSettings, context: ContextConfig) {
        if let Ok(mut limits) = self.limits.write() {
            *limits = (settings, context);
        }
    }

    fn limits(&self) -> (LoopSettings, ContextConfig) {
        match self.limits.read() {
            Ok(l) => l.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl SubagentExecutor for LoopExecutor {
    async fn execute(
        &self,
        ctx: &RunContext,
        transcript: &mut Vec<Turn>,
        observer: &dyn IterationObserver,
    ) -> Result<LoopOutcome> {
        let registry = self
            .tools
            .get()
            .cloned()
            .ok_or_else(|| anyhow!("subagent tools not initialised"))?;
        let (mut settings, context) = self.limits();
        settings.max_iterations = ctx.max_turns;

        let dispatcher = ToolDispatcher::for_subagent(registry, ctx.spec.tool_allowlist.as_deref());
        let window = ContextWindowManager::new(
            context,
            settings.model.clone(),
            Arc::clone(&self.summarizer),
        )
        .with_embedder(self.embedder.clone());
        let exec_ctx = ExecutionContext {
            session_id: ctx.spec.parent_session_id.clone(),
            participant_id: ctx.spec.participant_id.clone(),
            channel: "subagent".to_string(),
            subagent_run_id: Some(ctx.run_id.clone()),
        };

        if transcript.is_empty() {
            transcript.push(Turn::user(ctx.spec.task.clone(), &settings.model));
        }

        ToolLoop::new(
            self.provider.as_ref(),
            &dispatcher,
            &window,
            &self.hooks,
            &settings,
            &exec_ctx,
        )
        .with_pause(&ctx.pause)
        .with_deadline(ctx.deadline)
        .with_observer(observer)
        .run(SUBAGENT_PROMPT, transcript)
        .await
    }
}

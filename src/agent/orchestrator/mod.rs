//! Top-level turn handling.
//!
//! A turn goes through admission control, the `message:before` hook, system
//! prompt assembly and the shared tool loop, then `message:after`. Only the
//! orchestrator handling a session mutates it, and a per-session lock keeps
//! overlapping turns for the same session from interleaving.

pub mod streaming;

pub use streaming::{StreamingReply, TransportAnnouncer};

use crate::agent::compaction::{ContextWindowManager, ProviderSummarizer, Summarizer};
use crate::agent::embeddings::Embedder;
use crate::agent::hooks::{HookContext, HookPoint, HookRegistry, HookResult};
use crate::agent::rate_limit::RateLimiter;
use crate::agent::subagent::{
    Announcer, LoopExecutor, SubagentExecutor, SubagentRegistry, SubagentRun, SubagentScheduler,
    SubagentSpec,
};
use crate::agent::tokens::clip_to_tokens;
use crate::agent::tool_loop::{LoopSettings, ToolLoop};
use crate::agent::tools::backend::{CapabilityBackend, register_catalog, register_http_capabilities};
use crate::agent::tools::subagent::{SpawnSubagentTool, SubagentControlTool};
use crate::agent::tools::{ExecutionContext, Tool, ToolDispatcher, ToolRegistry};
use crate::channels::{InboundMessage, Transport};
use crate::config::Config;
use crate::errors::{GENERIC_FAILURE_MESSAGE, RuntimeError};
use crate::providers::base::{LLMProvider, RetryConfig};
use crate::session::{Session, SessionStore, Turn};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// External memory or context appended to the system prompt.
#[async_trait]
pub trait ContextSource: Send + Sync {
    fn name(&self) -> &str;

    /// Text relevant to `query`, or `None` when there is nothing to add.
    async fn context(&self, session: &Session, query: &str) -> Result<Option<String>>;
}

/// Everything the orchestrator needs at construction.
pub struct OrchestratorConfig {
    pub config: Config,
    pub provider: Arc<dyn LLMProvider>,
    pub transport: Arc<dyn Transport>,
    pub sessions: Arc<dyn SessionStore>,
    pub hooks: Arc<HookRegistry>,
    /// Defaults to summarizing with the conversation provider.
    pub summarizer: Option<Arc<dyn Summarizer>>,
    pub embedder: Option<Arc<dyn Embedder>>,
    pub context_sources: Vec<Arc<dyn ContextSource>>,
    /// Capabilities registered in addition to the configured catalog.
    pub tools: Vec<Arc<dyn Tool>>,
    /// Serves the configured catalog. Defaults to the HTTP backend at
    /// `capabilities.endpoint`.
    pub capability_backend: Option<Arc<dyn CapabilityBackend>>,
}

impl OrchestratorConfig {
    pub fn new(
        config: Config,
        provider: Arc<dyn LLMProvider>,
        transport: Arc<dyn Transport>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            config,
            provider,
            transport,
            sessions,
            hooks: Arc::new(HookRegistry::new()),
            summarizer: None,
            embedder: None,
            context_sources: Vec::new(),
            tools: Vec::new(),
            capability_backend: None,
        }
    }
}

fn loop_settings(config: &Config) -> LoopSettings {
    LoopSettings {
        model: config.agent.model.clone(),
        max_output_tokens: config.agent.max_output_tokens,
        temperature: config.agent.temperature,
        max_iterations: config.agent.max_tool_iterations,
        retry: RetryConfig::from(&config.agent.retry),
        tool_notice_delay: Duration::from_millis(config.streaming.tool_notice_delay_ms),
    }
}

/// Sections that `reload_config` can apply without a restart.
fn sweep_interval(config: &Config) -> Duration {
    Duration::from_secs(config.rate_limit.sweep_interval_secs.max(1))
}

fn reloadable_eq(a: &Config, b: &Config) -> bool {
    a.agent == b.agent
        && a.rate_limit == b.rate_limit
        && a.context == b.context
        && a.streaming == b.streaming
        && a.subagents == b.subagents
}

pub struct ConversationOrchestrator {
    provider: Arc<dyn LLMProvider>,
    transport: Arc<dyn Transport>,
    sessions: Arc<dyn SessionStore>,
    hooks: Arc<HookRegistry>,
    tools: Arc<ToolRegistry>,
    rate_limiter: Arc<RateLimiter>,
    scheduler: Arc<SubagentScheduler>,
    executor: Arc<LoopExecutor>,
    announcer: Arc<dyn Announcer>,
    summarizer: Arc<dyn Summarizer>,
    embedder: Option<Arc<dyn Embedder>>,
    context_sources: Vec<Arc<dyn ContextSource>>,
    config: RwLock<Config>,
    session_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    sweeper: Mutex<JoinHandle<()>>,
}

impl ConversationOrchestrator {
    pub async fn new(config: OrchestratorConfig) -> Result<Self> {
        let OrchestratorConfig {
            config,
            provider,
            transport,
            sessions,
            hooks,
            summarizer,
            embedder,
            context_sources,
            tools: extra_tools,
            capability_backend,
        } = config;
        config.validate()?;

        let summarizer = summarizer.unwrap_or_else(|| {
            Arc::new(ProviderSummarizer::new(Arc::clone(&provider), None)) as Arc<dyn Summarizer>
        });
        let rate_limiter = Arc::new(RateLimiter::new(&config.rate_limit));
        let sweeper = rate_limiter.spawn_sweeper(sweep_interval(&config));

        let scheduler = Arc::new(SubagentScheduler::new(
            config.subagents.clone(),
            Arc::new(SubagentRegistry::new()),
        ));
        let executor = Arc::new(LoopExecutor::new(
            Arc::clone(&provider),
            Arc::clone(&hooks),
            Arc::clone(&summarizer),
            loop_settings(&config),
            config.context.clone(),
        )
        .with_embedder(embedder.clone()));
        let announcer: Arc<dyn Announcer> = Arc::new(TransportAnnouncer::new(Arc::clone(&transport)));

        let mut registry = ToolRegistry::with_max_result_chars(config.capabilities.max_result_chars);
        let catalog = match &capability_backend {
            Some(backend) => register_catalog(&mut registry, &config.capabilities.catalog, backend),
            None => register_http_capabilities(&mut registry, &config.capabilities),
        };
        for tool in extra_tools {
            registry.register(tool);
        }
        registry.register(Arc::new(SpawnSubagentTool::new(
            Arc::clone(&scheduler),
            Arc::clone(&executor) as Arc<dyn SubagentExecutor>,
            Arc::clone(&announcer),
        )));
        registry.register(Arc::new(SubagentControlTool::new(Arc::clone(&scheduler))));
        let tools = Arc::new(registry);
        executor.set_tools(Arc::clone(&tools));

        info!(
            "orchestrator ready: model={}, {} tools ({} from catalog), {} context sources",
            config.agent.model,
            tools.len(),
            catalog,
            context_sources.len()
        );

        Ok(Self {
            provider,
            transport,
            sessions,
            hooks,
            tools,
            rate_limiter,
            scheduler,
            executor,
            announcer,
            summarizer,
            embedder,
            context_sources,
            config: RwLock::new(config),
            session_locks: Mutex::new(HashMap::new()),
            sweeper: Mutex::new(sweeper),
        })
    }

    pub fn config(&self) -> Config {
        match self.config.read() {
            Ok(c) => c.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    pub fn scheduler(&self) -> &Arc<SubagentScheduler> {
        &self.scheduler
    }

    fn session_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.session_locks.lock() {
            Ok(l) => l,
            Err(poisoned) => poisoned.into_inner(),
        };
        // drop locks nobody is waiting on
        locks.retain(|id, lock| id == session_id || Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(session_id.to_string()).or_default())
    }

    /// Handle one inbound message against a caller-owned session. Returns
    /// the reply text, or `None` when it was already streamed through the
    /// transport.
    pub async fn handle_message(
        &self,
        msg: &InboundMessage,
        session: &mut Session,
    ) -> Result<Option<String>> {
        let lock = self.session_lock(&session.id);
        let _guard = lock.lock().await;
        self.process(msg, session).await
    }

    /// Like [`Self::handle_message`], with the session loaded from and saved
    /// back to the session store.
    pub async fn handle_turn(&self, msg: &InboundMessage) -> Result<Option<String>> {
        let lock = self.session_lock(&msg.session_id);
        let _guard = lock.lock().await;

        let mut session = self
            .sessions
            .load(&msg.session_id)
            .await?
            .unwrap_or_else(|| Session::new(&msg.session_id, &msg.participant_id, &msg.channel));
        let reply = self.process(msg, &mut session).await;
        if let Err(e) = self.sessions.save(&session).await {
            warn!(session_id = %session.id, "failed to save session: {}", e);
        }
        reply
    }

    async fn process(&self, msg: &InboundMessage, session: &mut Session) -> Result<Option<String>> {
        let config = self.config();
        let model = session.model(&config.agent.model).to_string();

        let key = self.rate_limiter.key_for(&msg.participant_id);
        let decision = self.rate_limiter.check(&key);
        if !decision.allowed {
            let err = RuntimeError::AdmissionDenied {
                reset_in: decision.reset_in,
            };
            warn!(session_id = %session.id, participant = %msg.participant_id, "{}", err);
            metrics::counter!("parlance_admission_denied_total").increment(1);
            return Ok(Some(format!(
                "You're sending messages too quickly. Please wait {}s and try again.",
                decision.reset_in.as_secs().max(1)
            )));
        }

        session.push(Turn::user(msg.content.clone(), &model));
        let hook = self
            .hooks
            .trigger_with_result(HookContext::new(
                HookPoint::MessageBefore,
                session.id.clone(),
                msg.participant_id.clone(),
                json!({"content": msg.content, "channel": msg.channel}),
            ))
            .await;
        let text = match hook {
            HookResult::Blocked { hook, reason } => {
                session.turns.pop();
                info!(session_id = %session.id, "message blocked by hook '{}'", hook);
                metrics::counter!("parlance_turns_total", "outcome" => "blocked").increment(1);
                return Ok(Some(reason));
            }
            HookResult::Continue(payload) => match payload["content"].as_str() {
                Some(rewritten) if rewritten != msg.content => {
                    debug!(session_id = %session.id, "message rewritten by hook");
                    if let Some(turn) = session.turns.last_mut() {
                        turn.set_content(rewritten, &model);
                    }
                    rewritten.to_string()
                }
                _ => msg.content.clone(),
            },
        };

        let system_prompt = self.system_prompt(&config, session, &text, &model).await;

        let mut settings = loop_settings(&config);
        settings.model.clone_from(&model);
        let dispatcher = ToolDispatcher::new(Arc::clone(&self.tools));
        let context = ContextWindowManager::new(
            config.context.clone(),
            model.clone(),
            Arc::clone(&self.summarizer),
        )
        .with_embedder(self.embedder.clone());
        let exec_ctx = ExecutionContext::for_session(&session.id, &msg.participant_id, &msg.channel);

        let sink = (config.streaming.enabled && self.transport.supports_editing()).then(|| {
            StreamingReply::new(
                Arc::clone(&self.transport),
                &session.id,
                Duration::from_millis(config.streaming.flush_interval_ms),
            )
        });
        let mut tool_loop = ToolLoop::new(
            self.provider.as_ref(),
            &dispatcher,
            &context,
            &self.hooks,
            &settings,
            &exec_ctx,
        );
        if let Some(sink) = &sink {
            tool_loop = tool_loop.with_sink(sink);
        }

        let result = tool_loop.run(&system_prompt, &mut session.turns).await;
        let streamed = match &sink {
            Some(sink) => sink.finish().await,
            None => false,
        };
        session.updated_at = chrono::Utc::now();

        match result {
            Ok(outcome) => {
                session.compaction_count += outcome.compactions;
                if let Some(summary) = outcome.last_summary.clone() {
                    session.last_checkpoint_summary = Some(summary);
                }
                let reply = outcome.exit.text().unwrap_or_default().to_string();
                self.hooks.trigger(HookContext::new(
                    HookPoint::MessageAfter,
                    session.id.clone(),
                    msg.participant_id.clone(),
                    json!({
                        "content": reply,
                        "iterations": outcome.iterations,
                        "dispatched": outcome.dispatched,
                    }),
                ));
                metrics::counter!("parlance_turns_total", "outcome" => "completed").increment(1);
                info!(
                    session_id = %session.id,
                    "turn complete: {} iterations, {} tool calls, {} compactions",
                    outcome.iterations,
                    outcome.dispatched,
                    outcome.compactions
                );
                Ok(if streamed && outcome.streamed { None } else { Some(reply) })
            }
            Err(e) => {
                error!(session_id = %session.id, "turn failed: {:#}", e);
                self.hooks.trigger(HookContext::new(
                    HookPoint::Error,
                    session.id.clone(),
                    msg.participant_id.clone(),
                    json!({"error": e.to_string(), "stage": "turn"}),
                ));
                metrics::counter!("parlance_turns_total", "outcome" => "failed").increment(1);
                Ok(Some(GENERIC_FAILURE_MESSAGE.to_string()))
            }
        }
    }

    async fn system_prompt(&self, config: &Config, session: &Session, query: &str, model: &str) -> String {
        let mut prompt = config.agent.system_prompt.clone();
        if self.context_sources.is_empty() {
            return prompt;
        }

        let mut sections = Vec::new();
        for source in &self.context_sources {
            match source.context(session, query).await {
                Ok(Some(text)) if !text.trim().is_empty() => sections.push(text),
                Ok(_) => {}
                Err(e) => warn!(session_id = %session.id, "context source '{}' failed: {}", source.name(), e),
            }
        }
        if sections.is_empty() {
            return prompt;
        }
        let joined = sections.join("\n\n");
        let clipped = clip_to_tokens(&joined, config.agent.context_ceiling_tokens, model);
        if clipped.len() < joined.len() {
            debug!(
                session_id = %session.id,
                "context clipped to {} tokens",
                config.agent.context_ceiling_tokens
            );
        }
        prompt.push_str("\n\n# Context\n\n");
        prompt.push_str(clipped);
        prompt
    }

    /// Start a background run owned by `session_id`. Progress and the result
    /// are announced through the transport.
    pub async fn start_subagent(
        &self,
        session_id: &str,
        participant_id: &str,
        task: &str,
        tool_allowlist: Option<Vec<String>>,
    ) -> Result<String, RuntimeError> {
        let mut spec = SubagentSpec::new(session_id, participant_id, task);
        spec.tool_allowlist = tool_allowlist;
        let executor = Arc::clone(&self.executor) as Arc<dyn SubagentExecutor>;
        self.scheduler
            .start_background(spec, executor, Arc::clone(&self.announcer))
            .await
    }

    pub async fn pause(&self, run_id: &str, session_id: &str) -> Result<bool, RuntimeError> {
        self.scheduler.pause(run_id, session_id).await
    }

    pub async fn resume(&self, run_id: &str, session_id: &str) -> Result<bool, RuntimeError> {
        self.scheduler.resume(run_id, session_id).await
    }

    pub async fn status(&self, run_id: &str, session_id: &str) -> Result<SubagentRun, RuntimeError> {
        self.scheduler.status(run_id, session_id).await
    }

    /// Apply reloadable tunables. Provider and capability changes need a
    /// restart and are only reported.
    pub fn reload_config(&self, new: Config) -> Result<(), RuntimeError> {
        new.validate()?;
        let mut current = self
            .config
            .write()
            .map_err(|_| RuntimeError::Config("config lock poisoned".into()))?;
        if reloadable_eq(&current, &new) {
            if current.provider != new.provider || current.capabilities != new.capabilities {
                warn!("provider and capability changes take effect after restart");
            }
            return Err(RuntimeError::ConfigReloadNoop);
        }

        self.rate_limiter.update_limits(&new.rate_limit);
        if current.rate_limit.sweep_interval_secs != new.rate_limit.sweep_interval_secs {
            self.restart_sweeper(sweep_interval(&new));
        }
        self.scheduler.update_config(&new.subagents);
        self.executor
            .update_limits(loop_settings(&new), new.context.clone());
        if current.provider != new.provider || current.capabilities != new.capabilities {
            warn!("provider and capability changes take effect after restart");
        }
        let (provider, capabilities) = (current.provider.clone(), current.capabilities.clone());
        *current = new;
        current.provider = provider;
        current.capabilities = capabilities;
        info!("configuration reloaded");
        Ok(())
    }

    fn restart_sweeper(&self, interval: Duration) {
        let mut sweeper = match self.sweeper.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        sweeper.abort();
        *sweeper = self.rate_limiter.spawn_sweeper(interval);
        info!("rate limit sweeper restarted every {:?}", interval);
    }
}

impl Drop for ConversationOrchestrator {
    fn drop(&mut self) {
        match self.sweeper.get_mut() {
            Ok(s) => s.abort(),
            Err(poisoned) => poisoned.into_inner().abort(),
        }
    }
}

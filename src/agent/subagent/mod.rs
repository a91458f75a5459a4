//! Background subagent runs.
//!
//! A run is an isolated tool-use loop with its own transcript and its own
//! context window manager. The only shared mutable state is the
//! [`SubagentRegistry`], which the scheduler owns through an explicit `Arc`
//! and locks for every mutation.
//!
//! Pausing is cooperative and best-effort: [`SubagentScheduler::pause`] flips a
//! cancellation token that the loop polls between tool iterations. An
//! in-flight dispatch always runs to completion.

mod executor;
mod registry;

pub use executor::LoopExecutor;
pub use registry::SubagentRegistry;

use crate::agent::tool_loop::{IterationObserver, LoopExit, LoopOutcome};
use crate::config::SubagentConfig;
use crate::errors::RuntimeError;
use crate::session::Turn;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunProgress {
    pub message: String,
    pub percent: Option<u8>,
}

/// Snapshot of one run. The registry holds the live copy.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubagentRun {
    pub id: String,
    pub parent_session_id: String,
    pub task: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_allowlist: Option<Vec<String>>,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<RunProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Loop iterations consumed across every activation.
    pub turns_used: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What to run and on whose behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubagentSpec {
    pub parent_session_id: String,
    pub participant_id: String,
    pub task: String,
    pub tool_allowlist: Option<Vec<String>>,
}

impl SubagentSpec {
    pub fn new(
        parent_session_id: impl Into<String>,
        participant_id: impl Into<String>,
        task: impl Into<String>,
    ) -> Self {
        Self {
            parent_session_id: parent_session_id.into(),
            participant_id: participant_id.into(),
            task: task.into(),
            tool_allowlist: None,
        }
    }

    #[must_use]
    pub fn with_allowlist(mut self, tools: Vec<String>) -> Self {
        self.tool_allowlist = Some(tools);
        self
    }
}

/// Everything an executor needs for one activation of a run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub spec: SubagentSpec,
    /// Iterations left in the run's turn budget.
    pub max_turns: usize,
    pub deadline: Instant,
    pub pause: CancellationToken,
}

/// Drives a run's loop over its transcript.
#[async_trait]
pub trait SubagentExecutor: Send + Sync {
    async fn execute(
        &self,
        ctx: &RunContext,
        transcript: &mut Vec<Turn>,
        observer: &dyn IterationObserver,
    ) -> Result<LoopOutcome>;
}

/// Receives progress and completion notices for background runs.
#[async_trait]
pub trait Announcer: Send + Sync {
    async fn progress(&self, run: &SubagentRun);
    async fn finished(&self, run: &SubagentRun);
}

/// Records per-iteration progress and forwards it to the announcer no more
/// often than the configured interval.
struct ProgressReporter {
    registry: Arc<SubagentRegistry>,
    run_id: String,
    announcer: Option<Arc<dyn Announcer>>,
    interval: Duration,
    last_announced: Mutex<Option<Instant>>,
}

impl ProgressReporter {
    fn due(&self) -> bool {
        let Ok(mut last) = self.last_announced.lock() else {
            return false;
        };
        let now = Instant::now();
        match *last {
            Some(prev) if now.duration_since(prev) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

#[async_trait]
impl IterationObserver for ProgressReporter {
    async fn on_iteration(&self, iteration: usize, max_iterations: usize, tools: &[String]) {
        let percent = (iteration * 100)
            .checked_div(max_iterations)
            .map(|p| u8::try_from(p.min(99)).unwrap_or(99));
        let progress = RunProgress {
            message: format!("step {}: called {}", iteration, tools.join(", ")),
            percent,
        };
        let Some(run) = self.registry.set_progress(&self.run_id, progress).await else {
            return;
        };
        if let Some(announcer) = &self.announcer
            && self.due()
        {
            announcer.progress(&run).await;
        }
    }
}

pub struct SubagentScheduler {
    registry: Arc<SubagentRegistry>,
    semaphore: Arc<Semaphore>,
    config: RwLock<SubagentConfig>,
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Counts one background activation until it has recorded and announced its
/// outcome.
struct InFlight<'a>(&'a SubagentScheduler);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl SubagentScheduler {
    pub fn new(config: SubagentConfig, registry: Arc<SubagentRegistry>) -> Self {
        Self {
            registry,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            config: RwLock::new(config),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    pub fn registry(&self) -> &Arc<SubagentRegistry> {
        &self.registry
    }

    fn config(&self) -> SubagentConfig {
        match self.config.read() {
            Ok(c) => c.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Apply reloadable limits. Concurrency is fixed at construction.
    pub fn update_config(&self, new: &SubagentConfig) -> bool {
        let Ok(mut config) = self.config.write() else {
            return false;
        };
        if *config == *new {
            return false;
        }
        if config.max_concurrent != new.max_concurrent {
            warn!(
                "subagent maxConcurrent change ({} -> {}) takes effect after restart",
                config.max_concurrent, new.max_concurrent
            );
        }
        let max_concurrent = config.max_concurrent;
        *config = new.clone();
        config.max_concurrent = max_concurrent;
        info!(
            "subagent limits updated: maxTurns={}, timeoutSecs={}, progressIntervalSecs={}",
            config.max_turns, config.timeout_secs, config.progress_interval_secs
        );
        true
    }

    /// Run to completion (or pause) before returning.
    pub async fn start(
        &self,
        spec: SubagentSpec,
        executor: Arc<dyn SubagentExecutor>,
    ) -> Result<SubagentRun, RuntimeError> {
        let id = self
            .registry
            .create(spec, executor, None, self.config().max_tracked_runs)
            .await?;
        self.drive(&id).await
    }

    /// Schedule the run and return its id immediately. Progress and the
    /// final result go to `announcer`.
    pub async fn start_background(
        self: &Arc<Self>,
        spec: SubagentSpec,
        executor: Arc<dyn SubagentExecutor>,
        announcer: Arc<dyn Announcer>,
    ) -> Result<String, RuntimeError> {
        let id = self
            .registry
            .create(spec, executor, Some(announcer), self.config().max_tracked_runs)
            .await?;
        self.spawn_drive(id.clone());
        Ok(id)
    }

    fn spawn_drive(self: &Arc<Self>, id: String) {
        let scheduler = Arc::clone(self);
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let _in_flight = InFlight(&scheduler);
            if let Err(e) = scheduler.drive(&id).await {
                warn!(run_id = %id, "subagent run could not be driven: {}", e);
            }
        });
    }

    /// Request a cooperative pause. Only a running run can be paused.
    pub async fn pause(&self, id: &str, session_id: &str) -> Result<bool, RuntimeError> {
        let run = self.registry.get_owned(id, session_id).await?;
        if run.status != RunStatus::Running {
            return Ok(false);
        }
        let paused = self.registry.request_pause(id).await;
        if paused {
            info!(run_id = %id, "pause requested");
        }
        Ok(paused)
    }

    /// Re-enter a paused run with its accumulated transcript. Terminal runs
    /// are left alone and report `false`.
    pub async fn resume(self: &Arc<Self>, id: &str, session_id: &str) -> Result<bool, RuntimeError> {
        let run = self.registry.get_owned(id, session_id).await?;
        match run.status {
            RunStatus::Completed | RunStatus::Failed => Ok(false),
            RunStatus::Running | RunStatus::Pending => {
                Err(RuntimeError::SubagentAlreadyRunning(id.to_string()))
            }
            RunStatus::Paused => {
                if !self.registry.mark_pending(id).await {
                    return Err(RuntimeError::SubagentAlreadyRunning(id.to_string()));
                }
                info!(run_id = %id, "resuming subagent run");
                self.spawn_drive(id.to_string());
                Ok(true)
            }
        }
    }

    pub async fn status(&self, id: &str, session_id: &str) -> Result<SubagentRun, RuntimeError> {
        self.registry.get_owned(id, session_id).await
    }

    pub async fn list(&self, session_id: &str) -> Vec<SubagentRun> {
        self.registry.list_for(session_id).await
    }

    /// Background activations that have not yet finished or paused.
    pub fn active(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until every background activation has finished or paused and
    /// its announcement went out. Returns `false` if `limit` elapsed first.
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        tokio::time::timeout(limit, async {
            loop {
                let idle = self.idle.notified();
                if self.in_flight.load(Ordering::SeqCst) == 0 {
                    return;
                }
                idle.await;
            }
        })
        .await
        .is_ok()
    }

    /// One activation: wait for a concurrency slot, run the loop, record the
    /// outcome and announce it.
    async fn drive(&self, id: &str) -> Result<SubagentRun, RuntimeError> {
        let config = self.config();
        let _permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| RuntimeError::Internal(anyhow::anyhow!("subagent scheduler closed")))?;

        let activation = self.registry.begin(id, &config).await?;
        info!(run_id = %id, "subagent run started: {}", activation.ctx.spec.task);

        let reporter = ProgressReporter {
            registry: Arc::clone(&self.registry),
            run_id: id.to_string(),
            announcer: activation.announcer.clone(),
            interval: Duration::from_secs(config.progress_interval_secs),
            last_announced: Mutex::new(None),
        };
        let mut transcript = activation.transcript;
        let outcome = activation
            .executor
            .execute(&activation.ctx, &mut transcript, &reporter)
            .await;

        let (status, result, error, turns) = match outcome {
            Ok(outcome) => {
                let turns = outcome.iterations;
                match outcome.exit {
                    LoopExit::Completed(text) => (RunStatus::Completed, Some(text), None, turns),
                    LoopExit::IterationLimit(text) => (
                        RunStatus::Completed,
                        Some(format!("{}\n\n(stopped at the {}-turn limit)", text, config.max_turns)),
                        None,
                        turns,
                    ),
                    LoopExit::Paused => (RunStatus::Paused, None, None, turns),
                    LoopExit::TimedOut => (
                        RunStatus::Failed,
                        None,
                        Some(format!("timed out after {}s", config.timeout_secs)),
                        turns,
                    ),
                }
            }
            Err(e) => (RunStatus::Failed, None, Some(e.to_string()), 0),
        };

        let run = self
            .registry
            .finish(id, transcript, status, result, error, turns)
            .await?;
        match run.status {
            RunStatus::Completed => info!(run_id = %id, "subagent run completed"),
            RunStatus::Paused => info!(run_id = %id, "subagent run paused"),
            _ => warn!(run_id = %id, "subagent run failed: {}", run.error.as_deref().unwrap_or("")),
        }
        if run.status.is_terminal()
            && let Some(announcer) = &activation.announcer
        {
            announcer.finished(&run).await;
        }
        Ok(run)
    }
}

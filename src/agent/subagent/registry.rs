use super::{Announcer, RunContext, RunProgress, RunStatus, SubagentExecutor, SubagentRun, SubagentSpec};
use crate::config::SubagentConfig;
use crate::errors::RuntimeError;
use crate::session::Turn;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

struct RunEntry {
    run: SubagentRun,
    spec: SubagentSpec,
    transcript: Vec<Turn>,
    pause: CancellationToken,
    executor: Arc<dyn SubagentExecutor>,
    announcer: Option<Arc<dyn Announcer>>,
    seq: u64,
}

/// Handed to the scheduler when a run moves to `Running`.
pub(super) struct Activation {
    pub ctx: RunContext,
    pub transcript: Vec<Turn>,
    pub executor: Arc<dyn SubagentExecutor>,
    pub announcer: Option<Arc<dyn Announcer>>,
}

#[derive(Default)]
struct Inner {
    runs: HashMap<String, RunEntry>,
    next_seq: u64,
}

/// Every tracked run, keyed by id.
#[derive(Default)]
pub struct SubagentRegistry {
    inner: Mutex<Inner>,
}

impl SubagentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.runs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.runs.is_empty()
    }

    pub(super) async fn create(
        &self,
        spec: SubagentSpec,
        executor: Arc<dyn SubagentExecutor>,
        announcer: Option<Arc<dyn Announcer>>,
        max_tracked: usize,
    ) -> Result<String, RuntimeError> {
        let mut inner = self.inner.lock().await;
        Self::evict_finished(&mut inner, max_tracked.max(1));
        if inner.runs.len() >= max_tracked.max(1) {
            return Err(RuntimeError::Internal(anyhow::anyhow!(
                "too many unfinished subagent runs ({})",
                inner.runs.len()
            )));
        }

        let id = loop {
            let candidate = Uuid::new_v4().to_string()[..8].to_string();
            if !inner.runs.contains_key(&candidate) {
                break candidate;
            }
        };
        let now = Utc::now();
        let run = SubagentRun {
            id: id.clone(),
            parent_session_id: spec.parent_session_id.clone(),
            task: spec.task.clone(),
            tool_allowlist: spec.tool_allowlist.clone(),
            status: RunStatus::Pending,
            progress: None,
            result: None,
            error: None,
            turns_used: 0,
            created_at: now,
            updated_at: now,
        };
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.runs.insert(
            id.clone(),
            RunEntry {
                run,
                spec,
                transcript: Vec::new(),
                pause: CancellationToken::new(),
                executor,
                announcer,
                seq,
            },
        );
        Ok(id)
    }

    /// Drop the oldest terminal runs until there is room for one more.
    fn evict_finished(inner: &mut Inner, max_tracked: usize) {
        while inner.runs.len() >= max_tracked {
            let oldest = inner
                .runs
                .values()
                .filter(|e| e.run.status.is_terminal())
                .min_by_key(|e| e.seq)
                .map(|e| e.run.id.clone());
            let Some(id) = oldest else {
                return;
            };
            debug!(run_id = %id, "evicting finished subagent run");
            inner.runs.remove(&id);
        }
    }

    /// Move a pending run to `Running` and hand out its transcript together
    /// with a fresh pause token and deadline.
    pub(super) async fn begin(
        &self,
        id: &str,
        config: &SubagentConfig,
    ) -> Result<Activation, RuntimeError> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .runs
            .get_mut(id)
            .ok_or_else(|| RuntimeError::SubagentNotFound(id.to_string()))?;
        if entry.run.status != RunStatus::Pending {
            return Err(RuntimeError::SubagentAlreadyRunning(id.to_string()));
        }
        entry.run.status = RunStatus::Running;
        entry.run.updated_at = Utc::now();
        entry.pause = CancellationToken::new();

        let ctx = RunContext {
            run_id: id.to_string(),
            spec: entry.spec.clone(),
            max_turns: config.max_turns.saturating_sub(entry.run.turns_used),
            deadline: Instant::now() + Duration::from_secs(config.timeout_secs),
            pause: entry.pause.clone(),
        };
        Ok(Activation {
            ctx,
            transcript: std::mem::take(&mut entry.transcript),
            executor: Arc::clone(&entry.executor),
            announcer: entry.announcer.clone(),
        })
    }

    pub(super) async fn finish(
        &self,
        id: &str,
        transcript: Vec<Turn>,
        status: RunStatus,
        result: Option<String>,
        error: Option<String>,
        turns: usize,
    ) -> Result<SubagentRun, RuntimeError> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .runs
            .get_mut(id)
            .ok_or_else(|| RuntimeError::SubagentNotFound(id.to_string()))?;
        entry.transcript = transcript;
        entry.run.status = status;
        entry.run.result = result;
        entry.run.error = error;
        entry.run.turns_used += turns;
        entry.run.updated_at = Utc::now();
        if status == RunStatus::Completed {
            entry.run.progress = Some(RunProgress {
                message: "done".to_string(),
                percent: Some(100),
            });
        }
        Ok(entry.run.clone())
    }

    pub(super) async fn set_progress(&self, id: &str, progress: RunProgress) -> Option<SubagentRun> {
        let mut inner = self.inner.lock().await;
        let entry = inner.runs.get_mut(id)?;
        entry.run.progress = Some(progress);
        entry.run.updated_at = Utc::now();
        Some(entry.run.clone())
    }

    pub(super) async fn request_pause(&self, id: &str) -> bool {
        let inner = self.inner.lock().await;
        match inner.runs.get(id) {
            Some(entry) if entry.run.status == RunStatus::Running => {
                entry.pause.cancel();
                true
            }
            _ => false,
        }
    }

    pub(super) async fn mark_pending(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.runs.get_mut(id) {
            Some(entry) if entry.run.status == RunStatus::Paused => {
                entry.run.status = RunStatus::Pending;
                entry.run.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    /// Runs are only visible to the session that started them.
    pub async fn get_owned(&self, id: &str, session_id: &str) -> Result<SubagentRun, RuntimeError> {
        let inner = self.inner.lock().await;
        inner
            .runs
            .get(id)
            .filter(|e| e.run.parent_session_id == session_id)
            .map(|e| e.run.clone())
            .ok_or_else(|| RuntimeError::SubagentNotFound(id.to_string()))
    }

    pub async fn list_for(&self, session_id: &str) -> Vec<SubagentRun> {
        let inner = self.inner.lock().await;
        let mut entries: Vec<&RunEntry> = inner
            .runs
            .values()
            .filter(|e| e.run.parent_session_id == session_id)
            .collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.run.clone()).collect()
    }

    /// Copy of a run's transcript as of its last activation.
    pub async fn transcript(&self, id: &str) -> Option<Vec<Turn>> {
        let inner = self.inner.lock().await;
        inner.runs.get(id).map(|e| e.transcript.clone())
    }
}

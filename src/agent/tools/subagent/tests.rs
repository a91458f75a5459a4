use super::*;
use crate::agent::subagent::{RunContext, SubagentRegistry};
use crate::agent::tool_loop::{IterationObserver, LoopExit, LoopOutcome};
use crate::config::SubagentConfig;
use crate::session::Turn;
use std::sync::Mutex;
use std::time::Duration;

struct InstantExecutor;

#[async_trait]
impl SubagentExecutor for InstantExecutor {
    async fn execute(
        &self,
        ctx: &RunContext,
        _transcript: &mut Vec<Turn>,
        _observer: &dyn IterationObserver,
    ) -> Result<LoopOutcome> {
        Ok(LoopOutcome {
            exit: LoopExit::Completed(format!("report for {}", ctx.spec.task)),
            iterations: 1,
            dispatched: 0,
            compactions: 0,
            last_summary: None,
            streamed: false,
        })
    }
}

#[derive(Default)]
struct Finished(Mutex<Vec<SubagentRun>>);

#[async_trait]
impl Announcer for Finished {
    async fn progress(&self, _run: &SubagentRun) {}
    async fn finished(&self, run: &SubagentRun) {
        self.0.lock().unwrap().push(run.clone());
    }
}

fn scheduler() -> Arc<SubagentScheduler> {
    Arc::new(SubagentScheduler::new(
        SubagentConfig::default(),
        Arc::new(SubagentRegistry::new()),
    ))
}

fn ctx(session: &str) -> ExecutionContext {
    ExecutionContext::for_session(session, "alice", "cli")
}

async fn spawn(tool: &SpawnSubagentTool, params: Value, session: &str) -> String {
    let result = tool.execute(params, &ctx(session)).await.unwrap();
    assert!(!result.is_error, "{}", result.content);
    result
        .content
        .split_whitespace()
        .nth(3)
        .unwrap()
        .trim_end_matches('.')
        .to_string()
}

#[tokio::test]
async fn test_spawn_returns_run_id_and_announces() {
    let scheduler = scheduler();
    let announcer = Arc::new(Finished::default());
    let tool = SpawnSubagentTool::new(scheduler.clone(), Arc::new(InstantExecutor), announcer.clone());

    let id = spawn(&tool, json!({"task": "scan logs", "tools": ["grep"]}), "s1").await;
    assert_eq!(id.len(), 8);

    for _ in 0..100 {
        if !announcer.0.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let finished = announcer.0.lock().unwrap().clone();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].id, id);
    assert_eq!(finished[0].tool_allowlist, Some(vec!["grep".to_string()]));
    assert_eq!(finished[0].result.as_deref(), Some("report for scan logs"));
}

#[tokio::test]
async fn test_spawn_requires_task() {
    let tool = SpawnSubagentTool::new(scheduler(), Arc::new(InstantExecutor), Arc::new(Finished::default()));
    assert!(tool.execute(json!({"task": "  "}), &ctx("s1")).await.is_err());
}

#[test]
fn test_both_tools_hidden_from_subagents() {
    let scheduler = scheduler();
    let spawn = SpawnSubagentTool::new(scheduler.clone(), Arc::new(InstantExecutor), Arc::new(Finished::default()));
    let control = SubagentControlTool::new(scheduler);
    assert_eq!(spawn.subagent_access(), SubagentAccess::Denied);
    assert_eq!(control.subagent_access(), SubagentAccess::Denied);
}

#[tokio::test]
async fn test_control_status_and_ownership() {
    let scheduler = scheduler();
    let run = scheduler
        .start(SubagentSpec::new("s1", "alice", "index docs"), Arc::new(InstantExecutor))
        .await
        .unwrap();
    let control = SubagentControlTool::new(scheduler);

    let own = control
        .execute(json!({"action": "status", "run_id": run.id}), &ctx("s1"))
        .await
        .unwrap();
    assert!(!own.is_error);
    assert!(own.content.contains("completed"));
    assert!(own.content.contains("report for index docs"));

    let foreign = control
        .execute(json!({"action": "status", "run_id": run.id}), &ctx("s2"))
        .await
        .unwrap();
    assert!(foreign.is_error);
    assert!(foreign.content.contains("not found"));
}

#[tokio::test]
async fn test_control_resume_finished_run_reports_noop() {
    let scheduler = scheduler();
    let run = scheduler
        .start(SubagentSpec::new("s1", "alice", "t"), Arc::new(InstantExecutor))
        .await
        .unwrap();
    let control = SubagentControlTool::new(scheduler);

    let result = control
        .execute(json!({"action": "resume", "run_id": run.id}), &ctx("s1"))
        .await
        .unwrap();
    assert!(!result.is_error);
    assert!(result.content.contains("already finished"));

    let paused = control
        .execute(json!({"action": "pause", "run_id": run.id}), &ctx("s1"))
        .await
        .unwrap();
    assert!(paused.content.contains("not running"));
}

#[tokio::test]
async fn test_control_list_and_missing_run_id() {
    let scheduler = scheduler();
    let control = SubagentControlTool::new(scheduler.clone());

    let empty = control.execute(json!({"action": "list"}), &ctx("s1")).await.unwrap();
    assert!(empty.content.contains("No subagent runs"));

    scheduler
        .start(SubagentSpec::new("s1", "alice", "first"), Arc::new(InstantExecutor))
        .await
        .unwrap();
    let listed = control.execute(json!({"action": "list"}), &ctx("s1")).await.unwrap();
    assert!(listed.content.contains("first"));

    let missing = control.execute(json!({"action": "pause"}), &ctx("s1")).await.unwrap();
    assert!(missing.is_error);
}

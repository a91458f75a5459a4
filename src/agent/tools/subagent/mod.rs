use crate::agent::subagent::{
    Announcer, RunStatus, SubagentExecutor, SubagentRun, SubagentScheduler, SubagentSpec,
};
use crate::agent::tools::base::{ExecutionContext, SubagentAccess};
use crate::agent::tools::{Tool, ToolResult};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;

/// Starts a background subagent run on behalf of the calling session.
pub struct SpawnSubagentTool {
    scheduler: Arc<SubagentScheduler>,
    executor: Arc<dyn SubagentExecutor>,
    announcer: Arc<dyn Announcer>,
}

impl SpawnSubagentTool {
    pub fn new(
        scheduler: Arc<SubagentScheduler>,
        executor: Arc<dyn SubagentExecutor>,
        announcer: Arc<dyn Announcer>,
    ) -> Self {
        Self {
            scheduler,
            executor,
            announcer,
        }
    }
}

#[async_trait]
impl Tool for SpawnSubagentTool {
    fn name(&self) -> &str {
        "spawn_subagent"
    }

    fn description(&self) -> &str {
        "Start a background subagent for a task that needs several tool calls and can run on its own. Returns a run id immediately; progress and the final report are posted to the conversation. Use subagent_control to check on it."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "Self-contained description of what the subagent should do"
                },
                "tools": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Optional allowlist of tool names the subagent may use"
                }
            },
            "required": ["task"]
        })
    }

    fn subagent_access(&self) -> SubagentAccess {
        SubagentAccess::Denied
    }

    async fn execute(&self, params: Value, ctx: &ExecutionContext) -> Result<ToolResult> {
        let task = params["task"]
            .as_str()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| anyhow::anyhow!("Missing 'task' parameter"))?;

        let mut spec = SubagentSpec::new(&ctx.session_id, &ctx.participant_id, task);
        if let Some(tools) = params["tools"].as_array() {
            spec = spec.with_allowlist(
                tools
                    .iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect(),
            );
        }

        let id = self
            .scheduler
            .start_background(spec, Arc::clone(&self.executor), Arc::clone(&self.announcer))
            .await?;
        Ok(ToolResult::new(format!(
            "Started subagent run {}. It works in the background and reports back when done.",
            id
        )))
    }
}

/// Status, pause, resume and listing for the calling session's runs.
pub struct SubagentControlTool {
    scheduler: Arc<SubagentScheduler>,
}

impl SubagentControlTool {
    pub fn new(scheduler: Arc<SubagentScheduler>) -> Self {
        Self { scheduler }
    }
}

fn describe(run: &SubagentRun) -> String {
    let mut line = format!("- [{}] {}: {}", run.id, run.status, run.task);
    if let Some(progress) = &run.progress
        && run.status != RunStatus::Completed
    {
        line.push_str(&format!(" ({})", progress.message));
    }
    if let Some(error) = &run.error {
        line.push_str(&format!("\n  error: {}", error));
    }
    if let Some(result) = &run.result {
        line.push_str(&format!("\n  result: {}", result));
    }
    line
}

#[async_trait]
impl Tool for SubagentControlTool {
    fn name(&self) -> &str {
        "subagent_control"
    }

    fn description(&self) -> &str {
        "Inspect or steer background subagent runs started from this conversation: list them, get one run's status, pause a running run, or resume a paused one."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["list", "status", "pause", "resume"],
                    "description": "Action to perform"
                },
                "run_id": {
                    "type": "string",
                    "description": "Subagent run id (required except for list)"
                }
            },
            "required": ["action"]
        })
    }

    fn subagent_access(&self) -> SubagentAccess {
        SubagentAccess::Denied
    }

    async fn execute(&self, params: Value, ctx: &ExecutionContext) -> Result<ToolResult> {
        let action = params["action"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'action' parameter"))?;
        let session = ctx.session_id.as_str();

        if action == "list" {
            let runs = self.scheduler.list(session).await;
            if runs.is_empty() {
                return Ok(ToolResult::new("No subagent runs in this conversation."));
            }
            let lines: Vec<String> = runs.iter().map(describe).collect();
            return Ok(ToolResult::new(format!("Subagent runs:\n{}", lines.join("\n"))));
        }

        let Some(id) = params["run_id"].as_str() else {
            return Ok(ToolResult::error(format!("'run_id' is required for {}", action)));
        };
        let outcome = match action {
            "status" => self.scheduler.status(id, session).await.map(|run| describe(&run)),
            "pause" => self.scheduler.pause(id, session).await.map(|paused| {
                if paused {
                    format!("Pause requested for run {}; it stops after the current step.", id)
                } else {
                    format!("Run {} is not running, nothing to pause.", id)
                }
            }),
            "resume" => self.scheduler.resume(id, session).await.map(|resumed| {
                if resumed {
                    format!("Run {} resumed.", id)
                } else {
                    format!("Run {} already finished; nothing to resume.", id)
                }
            }),
            other => return Ok(ToolResult::error(format!("Unknown action: {}", other))),
        };
        Ok(match outcome {
            Ok(text) => ToolResult::new(text),
            Err(e) => ToolResult::error(e.to_string()),
        })
    }
}

#[cfg(test)]
mod tests;

use crate::providers::base::ToolDefinition;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(120);

/// What a capability handler hands back: a serialized payload and whether it
/// describes a failure.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }

    /// Collapse a fallible computation into a result, prefixing errors with
    /// the capability name.
    pub fn from_result(result: anyhow::Result<String>, error_prefix: &str) -> Self {
        match result {
            Ok(content) => Self::new(content),
            Err(e) => Self::error(format!("{} error: {}", error_prefix, e)),
        }
    }
}

impl std::fmt::Display for ToolResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.content)
    }
}

/// Who is making the call. Passed to every execution.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pub session_id: String,
    pub participant_id: String,
    pub channel: String,
    /// Set when the caller is a subagent run rather than a user session.
    pub subagent_run_id: Option<String>,
}

impl ExecutionContext {
    pub fn for_session(session_id: &str, participant_id: &str, channel: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            participant_id: participant_id.to_string(),
            channel: channel.to_string(),
            subagent_run_id: None,
        }
    }

    pub fn is_subagent(&self) -> bool {
        self.subagent_run_id.is_some()
    }
}

/// How a capability is exposed inside subagent runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubagentAccess {
    Full,
    /// Hidden from subagent catalogs and refused at dispatch.
    Denied,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the parameters object.
    fn parameters(&self) -> Value;

    async fn execute(&self, params: Value, ctx: &ExecutionContext) -> anyhow::Result<ToolResult>;

    /// Only read-only capabilities may opt in; results are reused for
    /// identical parameters within the cache TTL.
    fn cacheable(&self) -> bool {
        false
    }

    fn execution_timeout(&self) -> Duration {
        DEFAULT_EXECUTION_TIMEOUT
    }

    fn subagent_access(&self) -> SubagentAccess {
        SubagentAccess::Full
    }

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

/// Cross-cutting interception around every execution.
#[async_trait]
pub trait ToolMiddleware: Send + Sync {
    /// Return `Some` to short-circuit execution (e.g. a cache hit).
    async fn before_execute(
        &self,
        _name: &str,
        _params: &Value,
        _ctx: &ExecutionContext,
        _tool: &dyn Tool,
    ) -> Option<ToolResult> {
        None
    }

    /// `elapsed` covers the guarded execution only, not earlier middleware.
    async fn after_execute(
        &self,
        _name: &str,
        _params: &Value,
        _ctx: &ExecutionContext,
        _tool: &dyn Tool,
        _elapsed: Duration,
        _result: &mut ToolResult,
    ) {
    }
}

use crate::agent::tools::base::{ExecutionContext, SubagentAccess, Tool, ToolMiddleware, ToolResult};
use crate::agent::truncation::truncate_tool_result;
use crate::providers::base::{ToolCallRequest, ToolDefinition};
use anyhow::Result;
use lru::LruCache;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Serialize with object keys sorted recursively so equal parameters always
/// produce the same cache key.
fn canonical_json(value: &Value) -> String {
    serde_json::to_string(&canonical_value(value)).unwrap_or_default()
}

fn canonical_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonical_value(v))).collect();
            Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
        }
        Value::Array(arr) => Value::Array(arr.iter().map(canonical_value).collect()),
        other => other.clone(),
    }
}

const DEFAULT_CACHE_MAX_ENTRIES: usize = 128;
const DEFAULT_CACHE_TTL_SECS: u64 = 300;
pub const DEFAULT_MAX_RESULT_CHARS: usize = 10_000;

/// Check `params` against the tool's declared JSON schema: the value must be
/// an object, required fields must be present and non-null, declared field
/// types and enums must match. Returns a message for the model on failure.
pub fn validate_tool_params(tool: &dyn Tool, params: &Value) -> Option<String> {
    if !params.is_object() {
        return Some(format!(
            "Invalid arguments for tool '{}': expected an object but got {}",
            tool.name(),
            value_type_name(params)
        ));
    }
    let schema = tool.parameters();
    let mut errors = Vec::new();

    if let Some(required) = schema["required"].as_array() {
        for field in required.iter().filter_map(Value::as_str) {
            if params.get(field).is_none_or(Value::is_null) {
                errors.push(format!("missing required parameter '{}'", field));
            }
        }
    }

    if let Some(properties) = schema["properties"].as_object() {
        for (field, field_schema) in properties {
            let Some(value) = params.get(field).filter(|v| !v.is_null()) else {
                continue;
            };
            if let Some(expected) = field_schema["type"].as_str() {
                let type_ok = match expected {
                    "string" => value.is_string(),
                    "number" => value.is_number(),
                    "integer" => value.is_i64() || value.is_u64(),
                    "boolean" => value.is_boolean(),
                    "array" => value.is_array(),
                    "object" => value.is_object(),
                    _ => true,
                };
                if !type_ok {
                    errors.push(format!(
                        "parameter '{}' should be {} but got {}",
                        field,
                        expected,
                        value_type_name(value)
                    ));
                    continue;
                }
            }
            if let Some(allowed) = field_schema["enum"].as_array()
                && !allowed.contains(value)
            {
                errors.push(format!(
                    "parameter '{}' must be one of {}",
                    field,
                    Value::Array(allowed.clone())
                ));
            }
        }
    }

    if errors.is_empty() {
        None
    } else {
        Some(format!(
            "Invalid arguments for tool '{}': {}",
            tool.name(),
            errors.join("; ")
        ))
    }
}

fn value_type_name(v: &Value) -> &'static str {
    match v {
        Value::String(_) => "string",
        Value::Number(_) => "number",
        Value::Bool(_) => "boolean",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
        Value::Null => "null",
    }
}

struct CachedResult {
    result: ToolResult,
    cached_at: Instant,
}

/// Named capability handlers plus the middleware every execution runs through.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    middleware: Vec<Arc<dyn ToolMiddleware>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::with_max_result_chars(DEFAULT_MAX_RESULT_CHARS)
    }

    pub fn with_max_result_chars(max_result_chars: usize) -> Self {
        Self {
            tools: HashMap::new(),
            middleware: vec![
                // truncation runs before the cache stores, so hits are already cut
                Arc::new(TruncationMiddleware::new(max_result_chars)),
                Arc::new(CacheMiddleware::new(
                    DEFAULT_CACHE_MAX_ENTRIES,
                    DEFAULT_CACHE_TTL_SECS,
                )),
                Arc::new(LoggingMiddleware),
            ],
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if name.is_empty() || name.len() > 256 || name.chars().any(char::is_control) {
            warn!(
                "tool registry: rejecting tool with invalid name (len={})",
                name.len()
            );
            return;
        }
        if self.tools.contains_key(&name) {
            warn!("tool registry: overwriting duplicate tool '{}'", name);
        }
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Tool>)> {
        self.tools.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Run a tool through the middleware pipeline: `before_execute` (may
    /// short-circuit), guarded execution, then `after_execute`.
    pub async fn execute(
        &self,
        name: &str,
        params: Value,
        ctx: &ExecutionContext,
    ) -> Result<ToolResult> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("Tool '{}' not found", name))?
            .clone();

        for mw in &self.middleware {
            if let Some(result) = mw.before_execute(name, &params, ctx, tool.as_ref()).await {
                return Ok(result);
            }
        }

        let started = Instant::now();
        let mut result = self
            .execute_with_guards(name, tool.clone(), params.clone(), ctx)
            .await?;
        let elapsed = started.elapsed();

        for mw in &self.middleware {
            mw.after_execute(name, &params, ctx, tool.as_ref(), elapsed, &mut result)
                .await;
        }

        Ok(result)
    }

    /// Execute in a spawned task so panics are caught and the per-tool
    /// timeout is enforced. Both become error results.
    async fn execute_with_guards(
        &self,
        name: &str,
        tool: Arc<dyn Tool>,
        params: Value,
        ctx: &ExecutionContext,
    ) -> Result<ToolResult> {
        let tool_name = name.to_string();
        let ctx = ctx.clone();
        let timeout = tool.execution_timeout();
        let timeout_secs = timeout.as_secs();

        let handle = tokio::task::spawn(async move {
            tokio::time::timeout(timeout, tool.execute(params, &ctx)).await
        });

        match handle.await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                warn!("Tool '{}' timed out after {}s", tool_name, timeout_secs);
                Ok(ToolResult::error(format!(
                    "Tool '{}' timed out after {}s",
                    tool_name, timeout_secs
                )))
            }
            Err(join_err) if join_err.is_panic() => {
                let panic_payload = join_err.into_panic();
                let panic_msg = panic_payload
                    .downcast_ref::<String>()
                    .map(String::as_str)
                    .or_else(|| panic_payload.downcast_ref::<&str>().copied())
                    .unwrap_or("unknown cause");
                error!("Tool '{}' panicked: {}", tool_name, panic_msg);
                Ok(ToolResult::error(format!(
                    "Tool '{}' crashed: {}",
                    tool_name, panic_msg
                )))
            }
            Err(_) => Err(anyhow::anyhow!("Tool '{}' was cancelled", tool_name)),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one tool request, matched back to the request by `call_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallResult {
    pub call_id: String,
    pub payload: String,
    pub is_error: bool,
}

impl ToolCallResult {
    pub fn error(call_id: &str, payload: impl Into<String>) -> Self {
        Self {
            call_id: call_id.to_string(),
            payload: payload.into(),
            is_error: true,
        }
    }
}

/// A loop's view of the registry. Parent loops see every tool; subagent loops
/// see only tools open to subagents, further narrowed by an optional
/// allowlist.
#[derive(Clone)]
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    allowlist: Option<HashSet<String>>,
    for_subagent: bool,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            allowlist: None,
            for_subagent: false,
        }
    }

    pub fn for_subagent(registry: Arc<ToolRegistry>, allowlist: Option<&[String]>) -> Self {
        Self {
            registry,
            allowlist: allowlist.map(|names| names.iter().cloned().collect()),
            for_subagent: true,
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    fn permits(&self, tool: &dyn Tool) -> bool {
        if self.for_subagent && tool.subagent_access() == SubagentAccess::Denied {
            return false;
        }
        self.allowlist
            .as_ref()
            .is_none_or(|allowed| allowed.contains(tool.name()))
    }

    /// Sorted names of the tools this view may call.
    pub fn available(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .registry
            .iter()
            .filter(|(_, t)| self.permits(t.as_ref()))
            .map(|(name, _)| name.to_string())
            .collect();
        names.sort();
        names
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .registry
            .iter()
            .filter(|(_, t)| self.permits(t.as_ref()))
            .map(|(_, t)| t.to_definition())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Resolve, validate and execute one request. Never fails: every problem
    /// comes back as an error result the model can read.
    pub async fn dispatch(&self, call: &ToolCallRequest, ctx: &ExecutionContext) -> ToolCallResult {
        let tool = match self.registry.get(&call.name) {
            Some(tool) if self.permits(tool.as_ref()) => tool,
            Some(_) => {
                warn!(tool = %call.name, "tool not available in this context");
                record_dispatch(&call.name, "rejected");
                return ToolCallResult::error(
                    &call.id,
                    format!(
                        "Error: tool '{}' is not available here. Available tools: {}",
                        call.name,
                        self.available().join(", ")
                    ),
                );
            }
            None => {
                warn!("model called unknown tool: {}", call.name);
                record_dispatch(&call.name, "rejected");
                return ToolCallResult::error(
                    &call.id,
                    format!(
                        "Error: tool '{}' does not exist. Available tools: {}",
                        call.name,
                        self.available().join(", ")
                    ),
                );
            }
        };

        if let Some(message) = validate_tool_params(tool.as_ref(), &call.arguments) {
            warn!(tool = %call.name, "param validation failed: {}", message);
            record_dispatch(&call.name, "invalid");
            return ToolCallResult::error(&call.id, message);
        }

        match self
            .registry
            .execute(&call.name, call.arguments.clone(), ctx)
            .await
        {
            Ok(result) => {
                record_dispatch(&call.name, if result.is_error { "error" } else { "ok" });
                ToolCallResult {
                    call_id: call.id.clone(),
                    payload: result.content,
                    is_error: result.is_error,
                }
            }
            Err(e) => {
                warn!(tool = %call.name, "tool execution failed: {}", e);
                record_dispatch(&call.name, "error");
                ToolCallResult::error(&call.id, format!("Tool execution failed: {}", e))
            }
        }
    }
}

fn record_dispatch(tool: &str, outcome: &'static str) {
    metrics::counter!(
        "parlance_tool_dispatch_total",
        "tool" => tool.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// LRU result cache for capabilities that declare themselves cacheable.
pub struct CacheMiddleware {
    cache: Mutex<LruCache<String, CachedResult>>,
    ttl_secs: u64,
}

impl CacheMiddleware {
    pub fn new(max_entries: usize, ttl_secs: u64) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN),
            )),
            ttl_secs,
        }
    }

    fn key(name: &str, params: &Value) -> String {
        format!("{}#{}:{}", name.len(), name, canonical_json(params))
    }
}

#[async_trait::async_trait]
impl ToolMiddleware for CacheMiddleware {
    async fn before_execute(
        &self,
        name: &str,
        params: &Value,
        _ctx: &ExecutionContext,
        tool: &dyn Tool,
    ) -> Option<ToolResult> {
        if !tool.cacheable() {
            return None;
        }
        let key = Self::key(name, params);
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.get(&key) {
            if cached.cached_at.elapsed().as_secs() < self.ttl_secs {
                debug!(
                    "cache hit for tool '{}' (age: {:?})",
                    name,
                    cached.cached_at.elapsed()
                );
                return Some(cached.result.clone());
            }
            cache.pop(&key);
        }
        None
    }

    async fn after_execute(
        &self,
        name: &str,
        params: &Value,
        _ctx: &ExecutionContext,
        tool: &dyn Tool,
        _elapsed: Duration,
        result: &mut ToolResult,
    ) {
        if !tool.cacheable() || result.is_error {
            return;
        }
        self.cache.lock().await.put(
            Self::key(name, params),
            CachedResult {
                result: result.clone(),
                cached_at: Instant::now(),
            },
        );
    }
}

pub struct TruncationMiddleware {
    max_chars: usize,
}

impl TruncationMiddleware {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }
}

#[async_trait::async_trait]
impl ToolMiddleware for TruncationMiddleware {
    async fn after_execute(
        &self,
        _name: &str,
        _params: &Value,
        _ctx: &ExecutionContext,
        _tool: &dyn Tool,
        _elapsed: Duration,
        result: &mut ToolResult,
    ) {
        result.content = truncate_tool_result(&result.content, self.max_chars);
    }
}

pub struct LoggingMiddleware;

#[async_trait::async_trait]
impl ToolMiddleware for LoggingMiddleware {
    async fn before_execute(
        &self,
        name: &str,
        params: &Value,
        ctx: &ExecutionContext,
        _tool: &dyn Tool,
    ) -> Option<ToolResult> {
        debug!(
            session_id = %ctx.session_id,
            "executing tool: {} with arguments: {}",
            name,
            params
        );
        None
    }

    async fn after_execute(
        &self,
        name: &str,
        _params: &Value,
        ctx: &ExecutionContext,
        _tool: &dyn Tool,
        elapsed: Duration,
        result: &mut ToolResult,
    ) {
        if result.is_error {
            warn!(
                session_id = %ctx.session_id,
                "tool '{}' returned error after {:?}: {}",
                name,
                elapsed,
                result.content
            );
        } else {
            info!(
                session_id = %ctx.session_id,
                "tool '{}' completed in {:?} ({} chars)",
                name,
                elapsed,
                result.content.len()
            );
        }
    }
}

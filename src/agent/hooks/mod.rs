//! Extension points around the conversation loop.
//!
//! Handlers register against a fixed set of [`HookPoint`]s. Two invocation
//! modes exist:
//!
//! - [`HookRegistry::trigger`] runs every handler in a background task;
//!   errors and block requests are logged and otherwise ignored.
//! - [`HookRegistry::trigger_with_result`] runs handlers in registration
//!   order. Each sees the payload as merged so far and may contribute a
//!   partial update or block the rest of the chain.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    MessageBefore,
    MessageAfter,
    AgentBeforeStart,
    AgentEnd,
    ToolBeforeCall,
    ToolAfterCall,
    CompactionBefore,
    CompactionAfter,
    Error,
}

impl HookPoint {
    pub const ALL: [Self; 9] = [
        Self::MessageBefore,
        Self::MessageAfter,
        Self::AgentBeforeStart,
        Self::AgentEnd,
        Self::ToolBeforeCall,
        Self::ToolAfterCall,
        Self::CompactionBefore,
        Self::CompactionAfter,
        Self::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MessageBefore => "message:before",
            Self::MessageAfter => "message:after",
            Self::AgentBeforeStart => "agent:before_start",
            Self::AgentEnd => "agent:end",
            Self::ToolBeforeCall => "tool:before_call",
            Self::ToolAfterCall => "tool:after_call",
            Self::CompactionBefore => "compaction:before",
            Self::CompactionAfter => "compaction:after",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookPoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown hook point '{}'", s))
    }
}

/// Per-invocation context. Never persisted.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub point: HookPoint,
    pub session_id: String,
    pub participant_id: String,
    pub payload: Value,
}

impl HookContext {
    pub fn new(
        point: HookPoint,
        session_id: impl Into<String>,
        participant_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            point,
            session_id: session_id.into(),
            participant_id: participant_id.into(),
            payload,
        }
    }
}

/// What a single handler decided.
#[derive(Debug, Clone, PartialEq)]
pub enum HookOutcome {
    /// Keep going, optionally merging a partial update into the payload.
    Continue(Option<Value>),
    /// Stop the chain; the caller should not proceed.
    Block(String),
}

impl HookOutcome {
    pub fn pass() -> Self {
        Self::Continue(None)
    }

    pub fn update(partial: Value) -> Self {
        Self::Continue(Some(partial))
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self::Block(reason.into())
    }
}

/// Result of a chained invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum HookResult {
    Continue(Value),
    Blocked { hook: String, reason: String },
}

impl HookResult {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }

    /// Deserialize the merged payload. `Ok(None)` when blocked.
    pub fn payload_as<T: DeserializeOwned>(&self) -> anyhow::Result<Option<T>> {
        match self {
            Self::Continue(v) => Ok(Some(serde_json::from_value(v.clone())?)),
            Self::Blocked { .. } => Ok(None),
        }
    }
}

#[async_trait]
pub trait Hook: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, ctx: &HookContext) -> anyhow::Result<HookOutcome>;
}

/// Shallow merge: object keys from `partial` overwrite those in `base`;
/// any other shape replaces `base` outright.
fn merge_payload(base: &mut Value, partial: Value) {
    match (base, partial) {
        (Value::Object(base_map), Value::Object(partial_map)) => {
            for (k, v) in partial_map {
                base_map.insert(k, v);
            }
        }
        (base, partial) => *base = partial,
    }
}

#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<HashMap<HookPoint, Vec<Arc<dyn Hook>>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, point: HookPoint, hook: Arc<dyn Hook>) {
        debug!("registering hook '{}' at {}", hook.name(), point);
        match self.hooks.write() {
            Ok(mut hooks) => hooks.entry(point).or_default().push(hook),
            Err(poisoned) => poisoned
                .into_inner()
                .entry(point)
                .or_default()
                .push(hook),
        }
    }

    /// Remove every registration of the named hook. Returns how many were removed.
    pub fn unregister(&self, name: &str) -> usize {
        let Ok(mut hooks) = self.hooks.write() else {
            return 0;
        };
        let mut removed = 0;
        for list in hooks.values_mut() {
            let before = list.len();
            list.retain(|h| h.name() != name);
            removed += before - list.len();
        }
        removed
    }

    fn handlers(&self, point: HookPoint) -> Vec<Arc<dyn Hook>> {
        self.hooks
            .read()
            .ok()
            .and_then(|h| h.get(&point).cloned())
            .unwrap_or_default()
    }

    pub fn has_hooks(&self, point: HookPoint) -> bool {
        !self.handlers(point).is_empty()
    }

    /// Fire-and-forget. Returns the background task handle, or `None` when
    /// nothing is registered for the point.
    pub fn trigger(&self, ctx: HookContext) -> Option<JoinHandle<()>> {
        let handlers = self.handlers(ctx.point);
        if handlers.is_empty() {
            return None;
        }
        Some(tokio::spawn(async move {
            for hook in handlers {
                match hook.handle(&ctx).await {
                    Ok(HookOutcome::Block(reason)) => {
                        debug!(
                            "hook '{}' requested a block at {} (ignored): {}",
                            hook.name(),
                            ctx.point,
                            reason
                        );
                    }
                    Ok(HookOutcome::Continue(_)) => {}
                    Err(e) => {
                        warn!("hook '{}' failed at {}: {}", hook.name(), ctx.point, e);
                    }
                }
            }
        }))
    }

    /// Run handlers in order, merging partial results forward. A failing
    /// handler is logged and skipped; a blocking handler ends the chain.
    pub async fn trigger_with_result(&self, ctx: HookContext) -> HookResult {
        let handlers = self.handlers(ctx.point);
        let mut ctx = ctx;
        for hook in handlers {
            match hook.handle(&ctx).await {
                Ok(HookOutcome::Continue(Some(partial))) => {
                    merge_payload(&mut ctx.payload, partial);
                }
                Ok(HookOutcome::Continue(None)) => {}
                Ok(HookOutcome::Block(reason)) => {
                    debug!(
                        session_id = %ctx.session_id,
                        "hook '{}' blocked {}: {}",
                        hook.name(),
                        ctx.point,
                        reason
                    );
                    return HookResult::Blocked {
                        hook: hook.name().to_string(),
                        reason,
                    };
                }
                Err(e) => {
                    warn!("hook '{}' failed at {}: {}", hook.name(), ctx.point, e);
                }
            }
        }
        HookResult::Continue(ctx.payload)
    }
}

//! Capabilities served by an external dispatcher.
//!
//! Each catalog entry from configuration becomes a [`Tool`] whose execution is
//! forwarded to a [`CapabilityBackend`]. Backends never fail across the
//! boundary: transport and upstream problems come back as `{"error": ...}`
//! payloads.

use crate::agent::tools::base::{ExecutionContext, SubagentAccess, Tool, ToolResult};
use crate::agent::tools::registry::ToolRegistry;
use crate::config::{CapabilitiesConfig, CapabilityDecl};
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const BACKEND_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_ERROR_BODY_CHARS: usize = 500;

#[async_trait]
pub trait CapabilityBackend: Send + Sync {
    /// Invoke a named capability and return its serialized result.
    async fn invoke(&self, name: &str, params: &Value) -> String;
}

fn error_payload(message: impl Into<String>) -> String {
    json!({"error": message.into()}).to_string()
}

/// True when a payload is an object carrying a string `error` field.
pub fn is_error_payload(payload: &str) -> bool {
    let trimmed = payload.trim_start();
    if !trimmed.starts_with('{') {
        return false;
    }
    serde_json::from_str::<Value>(trimmed)
        .ok()
        .is_some_and(|v| v.get("error").is_some_and(Value::is_string))
}

/// POSTs `{"name", "params"}` to a dispatcher endpoint.
pub struct HttpCapabilityBackend {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpCapabilityBackend {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        let client = Client::builder()
            .user_agent(format!("parlance/{}", env!("CARGO_PKG_VERSION")))
            .timeout(BACKEND_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        }
    }

    async fn post(&self, name: &str, params: &Value) -> Result<String> {
        let mut req = self
            .client
            .post(&self.endpoint)
            .json(&json!({"name": name, "params": params}));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            let cut = crate::utils::floor_char_boundary(&body, MAX_ERROR_BODY_CHARS);
            anyhow::bail!("dispatcher returned HTTP {}: {}", status.as_u16(), &body[..cut]);
        }
        Ok(body)
    }
}

#[async_trait]
impl CapabilityBackend for HttpCapabilityBackend {
    async fn invoke(&self, name: &str, params: &Value) -> String {
        debug!("invoking capability '{}' at {}", name, self.endpoint);
        match self.post(name, params).await {
            Ok(body) => body,
            Err(e) => {
                warn!("capability '{}' failed: {}", name, e);
                error_payload(e.to_string())
            }
        }
    }
}

/// A declared capability routed to a backend.
pub struct CapabilityTool {
    decl: CapabilityDecl,
    backend: Arc<dyn CapabilityBackend>,
}

impl CapabilityTool {
    pub fn new(decl: CapabilityDecl, backend: Arc<dyn CapabilityBackend>) -> Self {
        Self { decl, backend }
    }
}

#[async_trait]
impl Tool for CapabilityTool {
    fn name(&self) -> &str {
        &self.decl.name
    }

    fn description(&self) -> &str {
        &self.decl.description
    }

    fn parameters(&self) -> Value {
        self.decl.parameters.clone()
    }

    async fn execute(&self, params: Value, _ctx: &ExecutionContext) -> Result<ToolResult> {
        let payload = self.backend.invoke(&self.decl.name, &params).await;
        let is_error = is_error_payload(&payload);
        Ok(ToolResult {
            content: payload,
            is_error,
        })
    }

    fn cacheable(&self) -> bool {
        self.decl.cacheable
    }

    fn execution_timeout(&self) -> Duration {
        self.decl
            .timeout_secs
            .map_or(Duration::from_secs(120), Duration::from_secs)
    }

    fn subagent_access(&self) -> SubagentAccess {
        if self.decl.allow_subagents {
            SubagentAccess::Full
        } else {
            SubagentAccess::Denied
        }
    }
}

/// Register every catalog entry against `backend`. Returns how many were added.
pub fn register_catalog(
    registry: &mut ToolRegistry,
    catalog: &[CapabilityDecl],
    backend: &Arc<dyn CapabilityBackend>,
) -> usize {
    for decl in catalog {
        registry.register(Arc::new(CapabilityTool::new(decl.clone(), backend.clone())));
    }
    catalog.len()
}

/// Build the HTTP backend from configuration and register its catalog.
/// Without an endpoint nothing is registered.
pub fn register_http_capabilities(registry: &mut ToolRegistry, config: &CapabilitiesConfig) -> usize {
    let Some(endpoint) = config.endpoint.as_deref() else {
        return 0;
    };
    let backend: Arc<dyn CapabilityBackend> =
        Arc::new(HttpCapabilityBackend::new(endpoint, config.api_key.clone()));
    let count = register_catalog(registry, &config.catalog, &backend);
    info!("registered {} capabilities from {}", count, endpoint);
    count
}

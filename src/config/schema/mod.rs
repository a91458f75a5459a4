mod agent;
mod providers;

pub use agent::{
    AgentConfig, ContextConfig, DedupConfig, RateLimitConfig, RateLimitScope, RetrySettings,
    StreamingConfig, SubagentConfig,
};
pub use providers::{CapabilitiesConfig, CapabilityDecl, ProviderConfig};

use crate::errors::RuntimeError;
use serde::{Deserialize, Serialize};

pub(crate) fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default, rename = "rateLimit")]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub subagents: SubagentConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub capabilities: CapabilitiesConfig,
}

impl Config {
    pub fn validate(&self) -> Result<(), RuntimeError> {
        self.validate_agent()?;
        self.validate_rate_limit()?;
        self.validate_context()?;
        self.validate_subagents()?;
        self.validate_capabilities()?;
        Ok(())
    }

    fn validate_agent(&self) -> Result<(), RuntimeError> {
        let a = &self.agent;
        if a.max_output_tokens == 0 {
            return Err(RuntimeError::Config(
                "agent.maxOutputTokens must be > 0".into(),
            ));
        }
        if a.temperature.is_nan() || a.temperature < 0.0 || a.temperature > 2.0 {
            return Err(RuntimeError::Config(
                "agent.temperature must be a finite number between 0.0 and 2.0".into(),
            ));
        }
        if a.max_tool_iterations == 0 || a.max_tool_iterations > 1000 {
            return Err(RuntimeError::Config(
                "agent.maxToolIterations must be between 1 and 1000".into(),
            ));
        }
        if a.retry.initial_delay_ms > a.retry.max_delay_ms {
            return Err(RuntimeError::Config(
                "agent.retry.initialDelayMs must not exceed agent.retry.maxDelayMs".into(),
            ));
        }
        Ok(())
    }

    fn validate_rate_limit(&self) -> Result<(), RuntimeError> {
        let r = &self.rate_limit;
        if r.enabled {
            if r.window_ms == 0 {
                return Err(RuntimeError::Config("rateLimit.windowMs must be > 0".into()));
            }
            if r.max_requests == 0 {
                return Err(RuntimeError::Config(
                    "rateLimit.maxRequests must be > 0".into(),
                ));
            }
        }
        Ok(())
    }

    fn validate_context(&self) -> Result<(), RuntimeError> {
        let c = &self.context;
        if c.reserve_tokens >= c.max_tokens {
            return Err(RuntimeError::Config(
                "context.reserveTokens must be smaller than context.maxTokens".into(),
            ));
        }
        if !(c.compact_threshold > 0.0 && c.compact_threshold <= 1.0) {
            return Err(RuntimeError::Config(
                "context.compactThreshold must be in (0.0, 1.0]".into(),
            ));
        }
        if c.min_recent_turns == 0 {
            return Err(RuntimeError::Config(
                "context.minRecentTurns must be > 0".into(),
            ));
        }
        if !(c.max_tool_result_share > 0.0 && c.max_tool_result_share <= 1.0) {
            return Err(RuntimeError::Config(
                "context.maxToolResultShare must be in (0.0, 1.0]".into(),
            ));
        }
        if c.dedup.enabled && !(0.0..=1.0).contains(&c.dedup.similarity_threshold) {
            return Err(RuntimeError::Config(
                "context.dedup.similarityThreshold must be between 0.0 and 1.0".into(),
            ));
        }
        Ok(())
    }

    fn validate_subagents(&self) -> Result<(), RuntimeError> {
        let s = &self.subagents;
        if s.max_concurrent == 0 {
            return Err(RuntimeError::Config(
                "subagents.maxConcurrent must be > 0".into(),
            ));
        }
        if s.max_turns == 0 {
            return Err(RuntimeError::Config("subagents.maxTurns must be > 0".into()));
        }
        if s.timeout_secs == 0 {
            return Err(RuntimeError::Config(
                "subagents.timeoutSecs must be > 0".into(),
            ));
        }
        Ok(())
    }

    fn validate_capabilities(&self) -> Result<(), RuntimeError> {
        let mut seen = std::collections::HashSet::new();
        for decl in &self.capabilities.catalog {
            if decl.name.is_empty() {
                return Err(RuntimeError::Config(
                    "capabilities.catalog entries must have a name".into(),
                ));
            }
            if !seen.insert(decl.name.as_str()) {
                return Err(RuntimeError::Config(format!(
                    "capabilities.catalog has duplicate entry '{}'",
                    decl.name
                )));
            }
            if !decl.parameters.is_object() {
                return Err(RuntimeError::Config(format!(
                    "capabilities.catalog.{}.parameters must be a JSON schema object",
                    decl.name
                )));
            }
        }
        if !self.capabilities.catalog.is_empty() && self.capabilities.endpoint.is_none() {
            return Err(RuntimeError::Config(
                "capabilities.endpoint is required when a catalog is configured".into(),
            ));
        }
        Ok(())
    }
}

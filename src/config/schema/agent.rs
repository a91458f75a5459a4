use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries", rename = "maxRetries")]
    pub max_retries: usize,
    #[serde(default = "default_initial_delay_ms", rename = "initialDelayMs")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms", rename = "maxDelayMs")]
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_retries() -> usize {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    10000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_output_tokens", rename = "maxOutputTokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tool_iterations", rename = "maxToolIterations")]
    pub max_tool_iterations: usize,
    #[serde(default = "default_system_prompt", rename = "systemPrompt")]
    pub system_prompt: String,
    /// Upper bound, in tokens, for externally supplied memory/context
    /// appended to the system prompt.
    #[serde(default = "default_context_ceiling", rename = "contextCeilingTokens")]
    pub context_ceiling_tokens: usize,
    #[serde(default)]
    pub retry: RetrySettings,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_output_tokens: default_max_output_tokens(),
            temperature: default_temperature(),
            max_tool_iterations: default_max_tool_iterations(),
            system_prompt: default_system_prompt(),
            context_ceiling_tokens: default_context_ceiling(),
            retry: RetrySettings::default(),
        }
    }
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_max_output_tokens() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tool_iterations() -> usize {
    20
}

fn default_system_prompt() -> String {
    "You are a helpful assistant. Use the available tools when they help answer the \
     user, and explain failures plainly."
        .to_string()
}

fn default_context_ceiling() -> usize {
    2000
}

/// Whether admission is counted per participant or across all participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitScope {
    #[default]
    Participant,
    Global,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "super::default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub scope: RateLimitScope,
    #[serde(default = "default_window_ms", rename = "windowMs")]
    pub window_ms: u64,
    #[serde(default = "default_max_requests", rename = "maxRequests")]
    pub max_requests: u32,
    #[serde(default = "default_sweep_interval", rename = "sweepIntervalSecs")]
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scope: RateLimitScope::default(),
            window_ms: default_window_ms(),
            max_requests: default_max_requests(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_max_requests() -> u32 {
    20
}

fn default_sweep_interval() -> u64 {
    300
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_similarity", rename = "similarityThreshold")]
    pub similarity_threshold: f32,
    /// How many previously kept turns a candidate is compared against.
    #[serde(default = "default_dedup_window")]
    pub window: usize,
    /// Local embedding model (requires the `embeddings` feature).
    #[serde(default = "default_embedding_model")]
    pub model: String,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            similarity_threshold: default_similarity(),
            window: default_dedup_window(),
            model: default_embedding_model(),
        }
    }
}

fn default_similarity() -> f32 {
    0.95
}

fn default_dedup_window() -> usize {
    5
}

fn default_embedding_model() -> String {
    "BAAI/bge-small-en-v1.5".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_max_tokens", rename = "maxTokens")]
    pub max_tokens: usize,
    #[serde(default = "default_reserve_tokens", rename = "reserveTokens")]
    pub reserve_tokens: usize,
    #[serde(default = "default_compact_threshold", rename = "compactThreshold")]
    pub compact_threshold: f64,
    /// Hard floor on verbatim turns kept by compaction.
    #[serde(default = "default_min_recent", rename = "minRecentTurns")]
    pub min_recent_turns: usize,
    #[serde(default = "default_keep_recent", rename = "keepRecentTurns")]
    pub keep_recent_turns: usize,
    /// Largest share of the usable budget a single tool result may occupy.
    #[serde(default = "default_result_share", rename = "maxToolResultShare")]
    pub max_tool_result_share: f64,
    #[serde(default)]
    pub dedup: DedupConfig,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            reserve_tokens: default_reserve_tokens(),
            compact_threshold: default_compact_threshold(),
            min_recent_turns: default_min_recent(),
            keep_recent_turns: default_keep_recent(),
            max_tool_result_share: default_result_share(),
            dedup: DedupConfig::default(),
        }
    }
}

impl ContextConfig {
    /// Tokens available to the transcript once the output reserve is set aside.
    pub fn usable_tokens(&self) -> usize {
        self.max_tokens.saturating_sub(self.reserve_tokens)
    }
}

fn default_max_tokens() -> usize {
    128_000
}

fn default_reserve_tokens() -> usize {
    8_000
}

fn default_compact_threshold() -> f64 {
    0.85
}

fn default_min_recent() -> usize {
    4
}

fn default_keep_recent() -> usize {
    10
}

fn default_result_share() -> f64 {
    0.5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingConfig {
    #[serde(default = "super::default_true")]
    pub enabled: bool,
    #[serde(default = "default_flush_interval", rename = "flushIntervalMs")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_notice_delay", rename = "toolNoticeDelayMs")]
    pub tool_notice_delay_ms: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            flush_interval_ms: default_flush_interval(),
            tool_notice_delay_ms: default_notice_delay(),
        }
    }
}

fn default_flush_interval() -> u64 {
    1000
}

fn default_notice_delay() -> u64 {
    3000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubagentConfig {
    #[serde(default = "default_max_concurrent", rename = "maxConcurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_subagent_turns", rename = "maxTurns")]
    pub max_turns: usize,
    #[serde(default = "default_subagent_timeout", rename = "timeoutSecs")]
    pub timeout_secs: u64,
    #[serde(default = "default_progress_interval", rename = "progressIntervalSecs")]
    pub progress_interval_secs: u64,
    #[serde(default = "default_max_tracked", rename = "maxTrackedRuns")]
    pub max_tracked_runs: usize,
}

impl Default for SubagentConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_turns: default_subagent_turns(),
            timeout_secs: default_subagent_timeout(),
            progress_interval_secs: default_progress_interval(),
            max_tracked_runs: default_max_tracked(),
        }
    }
}

fn default_max_concurrent() -> usize {
    5
}

fn default_subagent_turns() -> usize {
    15
}

fn default_subagent_timeout() -> u64 {
    300
}

fn default_progress_interval() -> u64 {
    5
}

fn default_max_tracked() -> usize {
    100
}

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_api_base", rename = "apiBase")]
    pub api_base: String,
    #[serde(default, rename = "apiKey")]
    pub api_key: String,
    /// Display name used in logs and error messages.
    #[serde(default = "default_provider_name")]
    pub name: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            api_key: String::new(),
            name: default_provider_name(),
        }
    }
}

fn default_api_base() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_provider_name() -> String {
    "OpenAI".to_string()
}

/// One capability the remote dispatcher exposes to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDecl {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_parameters")]
    pub parameters: Value,
    /// Read-only capabilities may have their results cached briefly.
    #[serde(default)]
    pub cacheable: bool,
    /// Whether subagents may call this capability.
    #[serde(default = "super::default_true", rename = "allowSubagents")]
    pub allow_subagents: bool,
    #[serde(default, rename = "timeoutSecs")]
    pub timeout_secs: Option<u64>,
}

fn default_parameters() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilitiesConfig {
    /// Endpoint of the capability dispatcher service. When unset, no remote
    /// capabilities are registered.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default, rename = "apiKey")]
    pub api_key: Option<String>,
    #[serde(default)]
    pub catalog: Vec<CapabilityDecl>,
    #[serde(default = "default_max_result_chars", rename = "maxResultChars")]
    pub max_result_chars: usize,
}

impl Default for CapabilitiesConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            catalog: Vec::new(),
            max_result_chars: default_max_result_chars(),
        }
    }
}

fn default_max_result_chars() -> usize {
    10000
}

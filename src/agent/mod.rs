pub mod compaction;
pub mod embeddings;
pub mod hooks;
pub mod orchestrator;
pub mod rate_limit;
pub mod subagent;
pub mod tokens;
pub mod tool_loop;
pub mod tools;
pub mod truncation;

pub use orchestrator::{ContextSource, ConversationOrchestrator, OrchestratorConfig};

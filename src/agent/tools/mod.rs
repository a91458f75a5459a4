pub mod backend;
pub mod base;
pub mod registry;
pub mod subagent;

pub use base::{ExecutionContext, SubagentAccess, Tool, ToolMiddleware, ToolResult};
pub use registry::{ToolCallResult, ToolDispatcher, ToolRegistry};

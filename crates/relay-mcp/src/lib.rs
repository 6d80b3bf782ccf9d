pub mod bridge;
pub mod executor;
pub mod parse;

pub use bridge::{ToolInfo, ToolServer, ToolTransport};
pub use executor::McpExecutor;
pub use parse::{parse_tool_call, ToolCall};

pub mod agent;
pub mod prompts;
pub mod types;

pub use agent::{parse_tool_arguments, WebMcpAgent};
pub use prompts::system_prompt;
pub use types::{ChatEvent, HistoryRecord};

pub mod openai;
pub mod provider;

pub use openai::OpenAIProvider;
pub use provider::{
    ChatRequest, ChatStream, Message, MessageRole, ModelProvider, StreamAccumulator, StreamChunk,
    ToolCall, ToolCallDelta, ToolSpec,
};

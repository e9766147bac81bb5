use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::Result;

/// A chat model that streams completions and can request tool calls
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn stream_message(&self, request: ChatRequest) -> Result<Box<dyn ChatStream>>;
    fn get_provider_name(&self) -> &str;
    fn model(&self) -> &str;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub id: String,
    pub messages: Vec<Message>,
    pub model: String,
    pub temperature: Option<f32>,
    pub tools: Vec<ToolSpec>,
}

impl ChatRequest {
    pub fn new(messages: Vec<Message>, model: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            messages,
            model,
            temperature: None,
            tools: Vec::new(),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }
}

/// Function tool bound to a request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: JsonValue,
}

/// A tool call requested by the model, arguments still as raw text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum MessageRole {
    #[serde(rename = "user")]
    User,
    #[serde(rename = "assistant")]
    Assistant,
    #[serde(rename = "system")]
    System,
    #[serde(rename = "tool")]
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    /// Set on assistant messages that requested tools
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Set on tool result messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn new(role: MessageRole, content: String) -> Self {
        Self {
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn user(content: String) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: String) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn system(content: String) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn assistant_tool_calls(content: String, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::new(MessageRole::Assistant, content)
        }
    }

    pub fn tool_result(tool_call_id: String, name: String, content: String) -> Self {
        Self {
            tool_call_id: Some(tool_call_id),
            name: Some(name),
            ..Self::new(MessageRole::Tool, content)
        }
    }
}

/// Fragment of a tool call as it arrives in a stream, keyed by `index`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

#[async_trait]
pub trait ChatStream: Send {
    /// Next chunk, `None` once the model is done
    async fn next_chunk(&mut self) -> Result<Option<StreamChunk>>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamChunk {
    pub delta: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallDelta>,
    pub finish_reason: Option<String>,
}

impl StreamChunk {
    pub fn text(delta: impl Into<String>) -> Self {
        Self {
            delta: delta.into(),
            ..Default::default()
        }
    }
}

/// Joins streamed text and tool-call fragments into the final round output.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    content: String,
    tool_calls: BTreeMap<usize, ToolCall>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &StreamChunk) {
        self.content.push_str(&chunk.delta);
        for delta in &chunk.tool_calls {
            let call = self.tool_calls.entry(delta.index).or_insert_with(|| ToolCall {
                id: String::new(),
                name: String::new(),
                arguments: String::new(),
            });
            if let Some(id) = delta.id.as_deref().filter(|id| !id.is_empty()) {
                call.id = id.to_string();
            }
            if let Some(name) = delta.name.as_deref().filter(|name| !name.is_empty()) {
                call.name = name.to_string();
            }
            if let Some(arguments) = &delta.arguments {
                call.arguments.push_str(arguments);
            }
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Calls in index order. Fragments that never received a name are dropped.
    pub fn finish(self) -> (String, Vec<ToolCall>) {
        let calls = self
            .tool_calls
            .into_values()
            .filter(|call| !call.name.is_empty())
            .collect();
        (self.content, calls)
    }
}

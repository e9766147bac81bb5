use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Events streamed to the client during one chat turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    Status {
        content: String,
    },
    AiResponseStart {
        content: String,
    },
    AiResponseChunk {
        content: String,
    },
    AiResponseEnd {
        content: String,
    },
    ToolPlan {
        content: String,
        tool_count: usize,
    },
    ToolStart {
        tool_id: String,
        tool_name: String,
        tool_args: JsonValue,
        progress: String,
    },
    ToolEnd {
        tool_id: String,
        tool_name: String,
        result: String,
    },
    ToolError {
        tool_id: String,
        error: String,
    },
    Error {
        content: String,
    },
}

impl ChatEvent {
    pub fn status(content: impl Into<String>) -> Self {
        Self::Status { content: content.into() }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::Error { content: content.into() }
    }

    /// Final answer text when this event closes a response
    pub fn final_text(&self) -> Option<&str> {
        match self {
            Self::AiResponseEnd { content } => Some(content),
            _ => None,
        }
    }
}

/// One completed exchange of a session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub user_input: String,
    #[serde(default)]
    pub ai_response: Option<String>,
}

impl HistoryRecord {
    pub fn new(user_input: impl Into<String>, ai_response: Option<String>) -> Self {
        Self {
            user_input: user_input.into(),
            ai_response,
        }
    }
}

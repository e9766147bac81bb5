use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// MCP protocol version spoken by the client
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Implementation information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

impl Implementation {
    pub fn this_client() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Initialization request parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: JsonValue,
    pub client_info: Implementation,
}

impl Default for InitializeParams {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: serde_json::json!({}),
            client_info: Implementation::this_client(),
        }
    }
}

/// Initialization result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: JsonValue,
    #[serde(default)]
    pub server_info: Option<Implementation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// MCP Tool definition as advertised by a server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Option<JsonValue>,
}

/// Result of `tools/list`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<Tool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Tool execution request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolParams {
    pub name: String,
    pub arguments: JsonValue,
}

/// Content structure for tool results
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Audio {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: JsonValue,
    },
}

/// A content entry; unknown content kinds are kept as raw JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContentItem {
    Known(Content),
    Other(JsonValue),
}

impl ContentItem {
    pub fn render(&self) -> String {
        match self {
            ContentItem::Known(Content::Text { text }) => text.clone(),
            ContentItem::Known(other) => serde_json::to_string(other).unwrap_or_default(),
            ContentItem::Other(value) => value.to_string(),
        }
    }
}

/// Tool execution result
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ContentItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<JsonValue>,
    #[serde(default)]
    pub is_error: bool,
}

impl CallToolResult {
    /// Flattens the result into the text handed back to the model.
    pub fn render_text(&self) -> String {
        if self.content.is_empty() {
            return self
                .structured_content
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_default();
        }
        self.content
            .iter()
            .map(ContentItem::render)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_uses_camel_case_schema() {
        let tool: Tool = serde_json::from_value(json!({
            "name": "get_weather",
            "description": "Current weather",
            "inputSchema": {
                "type": "object",
                "properties": { "city": { "type": "string" } },
                "required": ["city"]
            }
        }))
        .unwrap();

        assert_eq!(tool.name, "get_weather");
        assert_eq!(tool.input_schema.unwrap()["required"], json!(["city"]));
    }

    #[test]
    fn test_initialize_params_wire_names() {
        let value = serde_json::to_value(InitializeParams::default()).unwrap();
        assert_eq!(value["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(value["clientInfo"]["name"], "mcpmode");
    }

    #[test]
    fn test_call_result_renders_text_and_other_content() {
        let result: CallToolResult = serde_json::from_value(json!({
            "content": [
                { "type": "text", "text": "line one" },
                { "type": "image", "data": "AAAA", "mimeType": "image/png" },
                { "type": "hologram", "payload": 1 }
            ],
            "isError": false
        }))
        .unwrap();

        let text = result.render_text();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "line one");
        assert!(lines[1].contains("image/png"));
        assert!(lines[2].contains("hologram"));
    }

    #[test]
    fn test_structured_content_used_when_no_content() {
        let result: CallToolResult = serde_json::from_value(json!({
            "content": [],
            "structuredContent": { "temp": 21 }
        }))
        .unwrap();
        assert_eq!(result.render_text(), r#"{"temp":21}"#);
    }
}

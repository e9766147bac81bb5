use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    Client, StatusCode,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::{Duration, Instant};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{debug, error, warn};

use crate::app::config::AgentSettings;
use crate::error::{Error, Result};
use crate::models::provider::{
    ChatRequest, ChatStream, Message, MessageRole, ModelProvider, StreamChunk, ToolCallDelta,
};

// Backoff delays are RETRY_FACTOR * 2^n milliseconds.
const RETRY_BASE_MILLIS: u64 = 2;
const RETRY_FACTOR: u64 = 100;
const RETRY_MAX_DELAY: Duration = Duration::from_secs(8);

/// OpenAI-compatible chat completions endpoint
pub struct OpenAIProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
    // Applies per operation: connecting, waiting for headers, and each body read.
    timeout: Duration,
    max_retries: usize,
}

impl OpenAIProvider {
    pub fn from_settings(settings: &AgentSettings) -> Result<Self> {
        Self::with_options(
            settings.api_key.clone(),
            settings.base_url.clone(),
            settings.model.clone(),
            settings.temperature,
            settings.timeout,
            settings.max_retries,
        )
    }

    pub fn with_options(
        api_key: String,
        base_url: String,
        model: String,
        temperature: f32,
        timeout: Duration,
        max_retries: usize,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| Error::model_provider(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            temperature,
            timeout,
            max_retries,
        })
    }

    fn create_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();

        let auth_value = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|e| Error::model_provider(format!("Invalid API key format: {}", e)))?;
        headers.insert(AUTHORIZATION, auth_value);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        Ok(headers)
    }

    fn build_request(&self, request: &ChatRequest) -> OpenAIRequest {
        let tools = request
            .tools
            .iter()
            .map(|tool| OpenAITool {
                kind: "function",
                function: OpenAIFunction {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: tool.parameters.clone(),
                },
            })
            .collect();

        OpenAIRequest {
            model: if request.model.is_empty() {
                self.model.clone()
            } else {
                request.model.clone()
            },
            messages: convert_messages(&request.messages),
            temperature: Some(request.temperature.unwrap_or(self.temperature)),
            stream: true,
            tools,
        }
    }

    async fn open_stream(&self, body: &OpenAIRequest) -> std::result::Result<reqwest::Response, Attempt> {
        let url = format!("{}/chat/completions", self.base_url);
        let headers = self.create_headers().map_err(Attempt::fatal)?;

        let send = self.client.post(&url).headers(headers).json(body).send();
        let response = match tokio::time::timeout(self.timeout, send).await {
            Ok(result) => result.map_err(|e| Attempt {
                retryable: e.is_timeout() || e.is_connect() || e.is_request(),
                error: Error::model_provider(format!("HTTP request failed: {}", e)),
            })?,
            Err(_) => {
                return Err(Attempt {
                    retryable: true,
                    error: Error::model_provider(format!(
                        "No response headers within {:?}",
                        self.timeout
                    )),
                })
            }
        };

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("OpenAI API error: {} - {}", status, error_text);
            return Err(Attempt {
                retryable: status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error(),
                error: Error::model_provider(format!("API error {}: {}", status, error_text)),
            });
        }
        Ok(response)
    }
}

/// Outcome of one failed request attempt
struct Attempt {
    error: Error,
    retryable: bool,
}

impl Attempt {
    fn fatal(error: Error) -> Self {
        Self { error, retryable: false }
    }
}

fn convert_messages(messages: &[Message]) -> Vec<OpenAIMessage> {
    messages
        .iter()
        .map(|msg| {
            let tool_calls: Vec<OpenAIToolCall> = msg
                .tool_calls
                .iter()
                .map(|call| OpenAIToolCall {
                    id: call.id.clone(),
                    kind: "function",
                    function: OpenAIFunctionCall {
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    },
                })
                .collect();

            OpenAIMessage {
                role: match msg.role {
                    MessageRole::User => "user",
                    MessageRole::Assistant => "assistant",
                    MessageRole::System => "system",
                    MessageRole::Tool => "tool",
                },
                content: if tool_calls.is_empty() || !msg.content.is_empty() {
                    Some(msg.content.clone())
                } else {
                    None
                },
                tool_calls,
                tool_call_id: msg.tool_call_id.clone(),
                name: msg.name.clone(),
            }
        })
        .collect()
}

#[async_trait]
impl ModelProvider for OpenAIProvider {
    async fn stream_message(&self, request: ChatRequest) -> Result<Box<dyn ChatStream>> {
        let body = self.build_request(&request);
        debug!(
            "Sending streaming request: model={}, messages={}, tools={}",
            body.model,
            body.messages.len(),
            body.tools.len()
        );

        let strategy = ExponentialBackoff::from_millis(RETRY_BASE_MILLIS)
            .factor(RETRY_FACTOR)
            .max_delay(RETRY_MAX_DELAY)
            .map(jitter)
            .take(self.max_retries);

        let start_time = Instant::now();
        let response = RetryIf::spawn(
            strategy,
            || self.open_stream(&body),
            |attempt: &Attempt| {
                if attempt.retryable {
                    warn!("Retrying model request: {}", attempt.error);
                }
                attempt.retryable
            },
        )
        .await
        .map_err(|attempt| attempt.error)?;
        debug!("Model stream opened in {:?}", start_time.elapsed());

        Ok(Box::new(OpenAIStream::new(response, self.timeout)))
    }

    fn get_provider_name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OpenAITool>,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: &'static str,
    content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<OpenAIToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Debug, Serialize)]
struct OpenAITool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: OpenAIFunction,
}

#[derive(Debug, Serialize)]
struct OpenAIFunction {
    name: String,
    description: String,
    parameters: JsonValue,
}

#[derive(Debug, Serialize)]
struct OpenAIToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: &'static str,
    function: OpenAIFunctionCall,
}

#[derive(Debug, Serialize)]
struct OpenAIFunctionCall {
    name: String,
    arguments: String,
}

// Streaming response structures
#[derive(Debug, Deserialize)]
struct OpenAIStreamResponse {
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChoice {
    #[serde(default)]
    delta: OpenAIStreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAIStreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAIStreamToolCall>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamToolCall {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<OpenAIStreamFunction>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// What one SSE line means for the stream
#[derive(Debug)]
enum SseLine {
    Chunk(StreamChunk),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> SseLine {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return SseLine::Skip;
    }
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim_start();
    if data == "[DONE]" {
        return SseLine::Done;
    }

    let response = match serde_json::from_str::<OpenAIStreamResponse>(data) {
        Ok(response) => response,
        Err(e) => {
            debug!("Failed to parse stream response: {} (data: {})", e, data);
            return SseLine::Skip;
        }
    };

    let mut chunk = StreamChunk::default();
    for choice in response.choices {
        if let Some(content) = choice.delta.content {
            chunk.delta.push_str(&content);
        }
        chunk.tool_calls.extend(choice.delta.tool_calls.into_iter().map(|tc| {
            let (name, arguments) = match tc.function {
                Some(function) => (function.name, function.arguments),
                None => (None, None),
            };
            ToolCallDelta {
                index: tc.index,
                id: tc.id,
                name,
                arguments,
            }
        }));
        if choice.finish_reason.is_some() {
            chunk.finish_reason = choice.finish_reason;
        }
    }

    if chunk.delta.is_empty() && chunk.tool_calls.is_empty() && chunk.finish_reason.is_none() {
        SseLine::Skip
    } else {
        SseLine::Chunk(chunk)
    }
}

pub struct OpenAIStream {
    response: reqwest::Response,
    /// Longest allowed gap between two body reads
    idle_timeout: Duration,
    buffer: Vec<u8>,
    finished: bool,
}

impl OpenAIStream {
    pub fn new(response: reqwest::Response, idle_timeout: Duration) -> Self {
        Self {
            response,
            idle_timeout,
            buffer: Vec::new(),
            finished: false,
        }
    }

    async fn read_next_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(newline_pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
                return decode_line(&line[..newline_pos]).map(Some);
            }
            if self.finished {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                let line = std::mem::take(&mut self.buffer);
                return decode_line(&line).map(Some);
            }

            match tokio::time::timeout(self.idle_timeout, self.response.chunk()).await {
                Ok(Ok(Some(chunk))) => self.buffer.extend_from_slice(&chunk),
                Ok(Ok(None)) => self.finished = true,
                Ok(Err(e)) => return Err(Error::model_provider(format!("Stream read error: {}", e))),
                Err(_) => {
                    return Err(Error::model_provider(format!(
                        "Stream stalled: no data for {:?}",
                        self.idle_timeout
                    )))
                }
            }
        }
    }
}

fn decode_line(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| Error::model_provider(format!("Invalid UTF-8 in stream: {}", e)))
}

#[async_trait]
impl ChatStream for OpenAIStream {
    async fn next_chunk(&mut self) -> Result<Option<StreamChunk>> {
        while let Some(line) = self.read_next_line().await? {
            match parse_sse_line(&line) {
                SseLine::Chunk(chunk) => return Ok(Some(chunk)),
                SseLine::Done => {
                    self.finished = true;
                    self.buffer.clear();
                    return Ok(None);
                }
                SseLine::Skip => continue,
            }
        }
        Ok(None)
    }
}

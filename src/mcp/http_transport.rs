use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::mcp::protocol::ProtocolMessage;
use crate::mcp::transport::{Transport, TransportStatus};

const SESSION_HEADER: &str = "mcp-session-id";

/// Streamable HTTP transport: every message is POSTed to the server URL and
/// the reply arrives either as a JSON body or as a short SSE stream.
pub struct StreamableHttpTransport {
    client: Client,
    url: Url,
    headers: HeaderMap,
    session_id: RwLock<Option<String>>,
    inbox: Mutex<VecDeque<ProtocolMessage>>,
    status: RwLock<TransportStatus>,
}

impl StreamableHttpTransport {
    pub fn new(url: &str, headers: &HashMap<String, String>, timeout: Duration) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| Error::mcp(format!("Invalid MCP server URL '{}': {}", url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::mcp(format!(
                "Invalid MCP server scheme '{}'. Must be 'http' or 'https'",
                url.scheme()
            )));
        }

        let mut header_map = HeaderMap::new();
        for (key, value) in headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| Error::mcp(format!("Invalid header name '{}': {}", key, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::mcp(format!("Invalid header value for '{}': {}", key, e)))?;
            header_map.insert(name, value);
        }

        let client = Client::builder()
            .http1_only()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::mcp(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url,
            headers: header_map,
            session_id: RwLock::new(None),
            inbox: Mutex::new(VecDeque::new()),
            status: RwLock::new(TransportStatus::new("streamable_http")),
        })
    }

    pub async fn session_id(&self) -> Option<String> {
        self.session_id.read().await.clone()
    }

    async fn request_headers(&self) -> Result<HeaderMap> {
        let mut headers = self.headers.clone();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json, text/event-stream"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(session) = self.session_id.read().await.as_deref() {
            let value = HeaderValue::from_str(session)
                .map_err(|e| Error::mcp(format!("Invalid session id from server: {}", e)))?;
            headers.insert(HeaderName::from_static(SESSION_HEADER), value);
        }
        Ok(headers)
    }

    async fn record_error(&self) {
        self.status.write().await.error_count += 1;
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn send(&self, message: &ProtocolMessage) -> Result<()> {
        let body = message.serialize()?;
        debug!("POST {} <- {}", self.url, body);

        let response = self
            .client
            .post(self.url.clone())
            .headers(self.request_headers().await?)
            .body(body)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                self.record_error().await;
                return Err(Error::mcp(format!("HTTP request to MCP server failed: {}", e)));
            }
        };

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut current = self.session_id.write().await;
            if current.as_deref() != Some(session) {
                debug!("MCP session established: {}", session);
                *current = Some(session.to_string());
            }
        }

        let status = response.status();
        if status == StatusCode::ACCEPTED || status == StatusCode::NO_CONTENT {
            self.status.write().await.messages_sent += 1;
            return Ok(());
        }
        if !status.is_success() {
            self.record_error().await;
            let text = response.text().await.unwrap_or_default();
            return Err(Error::mcp(format!("MCP server returned {}: {}", status, text)));
        }

        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("text/event-stream"))
            .unwrap_or(false);
        let text = response.text().await?;

        let messages = if is_event_stream {
            parse_event_stream(&text)
        } else if text.trim().is_empty() {
            Vec::new()
        } else {
            parse_json_body(&text)?
        };

        {
            let mut status = self.status.write().await;
            status.messages_sent += 1;
            status.messages_received += messages.len() as u64;
            status.last_activity = Some(Instant::now());
        }
        self.inbox.lock().await.extend(messages);
        Ok(())
    }

    async fn receive(&self) -> Result<Option<ProtocolMessage>> {
        Ok(self.inbox.lock().await.pop_front())
    }

    async fn is_connected(&self) -> bool {
        self.status.read().await.is_connected
    }

    async fn close(&self) -> Result<()> {
        let session = self.session_id.write().await.take();
        if let Some(session) = session {
            let result = self
                .client
                .delete(self.url.clone())
                .header(SESSION_HEADER, session)
                .send()
                .await;
            if let Err(e) = result {
                debug!("Failed to end MCP session: {}", e);
            }
        }
        self.status.write().await.is_connected = false;
        Ok(())
    }

    async fn get_status(&self) -> TransportStatus {
        self.status.read().await.clone()
    }
}

/// A JSON body holds one message or a batch.
fn parse_json_body(text: &str) -> Result<Vec<ProtocolMessage>> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| Error::mcp(format!("Invalid JSON from MCP server: {}", e)))?;
    let items = match value {
        serde_json::Value::Array(items) => items,
        other => vec![other],
    };
    items
        .into_iter()
        .map(|item| {
            serde_json::from_value(item)
                .map_err(|e| Error::mcp(format!("Invalid JSON-RPC message from MCP server: {}", e)))
        })
        .collect()
}

/// Collects the `data:` payload of every event; events that are not
/// JSON-RPC messages are dropped.
fn parse_event_stream(text: &str) -> Vec<ProtocolMessage> {
    let mut messages = Vec::new();
    let mut data = String::new();

    let mut flush = |data: &mut String| {
        if data.is_empty() {
            return;
        }
        match ProtocolMessage::parse(data) {
            Ok(message) => messages.push(message),
            Err(e) => warn!("Skipping SSE event from MCP server: {}", e),
        }
        data.clear();
    };

    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            flush(&mut data);
        } else if let Some(payload) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(payload.strip_prefix(' ').unwrap_or(payload));
        }
    }
    flush(&mut data);

    messages
}

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::chat::{ChatEvent, HistoryRecord, WebMcpAgent};
use crate::error::{Error, Result};
use crate::server::session::SessionStore;

pub const DEFAULT_BIND: &str = "127.0.0.1:8003";

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Frames a client may send
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    UserMsg {
        content: String,
        #[serde(default)]
        session_id: Option<String>,
    },
    GetTools,
    ClearHistory {
        #[serde(default)]
        session_id: Option<String>,
    },
    Ping,
}

/// Frames the server sends besides chat events
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Session { session_id: String },
    Tools { data: JsonValue },
    HistoryCleared,
    Pong,
}

/// WebSocket front end for a shared agent
pub struct ChatServer {
    agent: Arc<WebMcpAgent>,
    sessions: Arc<SessionStore>,
}

impl ChatServer {
    pub fn new(agent: Arc<WebMcpAgent>) -> Self {
        Self::with_sessions(agent, Arc::new(SessionStore::default()))
    }

    pub fn with_sessions(agent: Arc<WebMcpAgent>, sessions: Arc<SessionStore>) -> Self {
        Self { agent, sessions }
    }

    pub fn sessions(&self) -> Arc<SessionStore> {
        self.sessions.clone()
    }

    pub async fn bind(addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(addr).await?;
        info!("WebSocket server listening on ws://{}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accepts connections until `shutdown` resolves
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("WebSocket server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };
                    let connection = Connection {
                        agent: self.agent.clone(),
                        sessions: self.sessions.clone(),
                        session_id: Uuid::new_v4().to_string(),
                    };
                    let sessions = self.sessions.clone();
                    let session_id = connection.session_id.clone();
                    let span = info_span!("ws", %peer, session_id = %session_id);
                    tokio::spawn(
                        async move {
                            if let Err(e) = connection.run(stream, peer).await {
                                debug!("Connection ended with error: {}", e);
                            }
                            // the generated id dies with the connection
                            sessions.clear(&session_id);
                        }
                        .instrument(span),
                    );
                }
            }
        }
    }
}

struct Connection {
    agent: Arc<WebMcpAgent>,
    sessions: Arc<SessionStore>,
    session_id: String,
}

impl Connection {
    async fn run(self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let ws = accept_async(stream).await?;
        info!("Client connected: {}", peer);

        let (mut sink, mut incoming) = ws.split();
        send_json(
            &mut sink,
            &ServerFrame::Session {
                session_id: self.session_id.clone(),
            },
        )
        .await?;

        while let Some(message) = incoming.next().await {
            match message? {
                Message::Text(text) => self.handle_text(&mut sink, &text).await?,
                Message::Binary(_) => {
                    send_json(&mut sink, &ChatEvent::error("Binary frames are not supported")).await?
                }
                Message::Close(_) => break,
                _ => {}
            }
        }

        info!("Client disconnected: {}", peer);
        Ok(())
    }

    async fn handle_text(&self, sink: &mut WsSink, text: &str) -> Result<()> {
        let frame = match serde_json::from_str::<ClientFrame>(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Malformed client frame: {}", e);
                return send_json(sink, &ChatEvent::error(format!("Invalid message: {}", e))).await;
            }
        };

        match frame {
            ClientFrame::UserMsg { content, session_id } => {
                let session_id = session_id.unwrap_or_else(|| self.session_id.clone());
                self.run_turn(sink, content, session_id).await
            }
            ClientFrame::GetTools => {
                let data = self.agent.tools_info().await;
                send_json(sink, &ServerFrame::Tools { data }).await
            }
            ClientFrame::ClearHistory { session_id } => {
                let session_id = session_id.unwrap_or_else(|| self.session_id.clone());
                self.sessions.clear(&session_id);
                debug!(session = %session_id, "History cleared");
                send_json(sink, &ServerFrame::HistoryCleared).await
            }
            ClientFrame::Ping => send_json(sink, &ServerFrame::Pong).await,
        }
    }

    /// Forwards every event of one turn and records the final answer
    async fn run_turn(&self, sink: &mut WsSink, content: String, session_id: String) -> Result<()> {
        let history = self.sessions.history(&session_id);
        let (tx, mut rx) = mpsc::channel::<ChatEvent>(64);

        let agent = self.agent.clone();
        let input = content.clone();
        let turn_session = session_id.clone();
        let turn = tokio::spawn(async move {
            agent.chat_stream(&input, &history, Some(&turn_session), &tx).await;
        });

        let mut final_text = None;
        let mut send_error = None;
        while let Some(event) = rx.recv().await {
            if let Some(text) = event.final_text() {
                final_text = Some(text.to_string());
            }
            if let Err(e) = send_json(sink, &event).await {
                send_error = Some(e);
                break;
            }
        }
        drop(rx);

        if let Err(e) = turn.await {
            error!("Chat turn task failed: {}", e);
        }
        if let Some(e) = send_error {
            return Err(e);
        }

        if let Some(text) = final_text {
            self.sessions
                .append(&session_id, HistoryRecord::new(content, Some(text)));
        }
        Ok(())
    }
}

async fn send_json<T: Serialize>(sink: &mut WsSink, value: &T) -> Result<()> {
    let text = serde_json::to_string(value)?;
    sink.send(Message::Text(text)).await.map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::config::AgentSettings;
    use crate::mcp::{ToolDescriptor, ToolExecutor};
    use crate::models::{ChatRequest, ChatStream, ModelProvider, StreamChunk};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio_tungstenite::connect_async;

    struct EchoProvider;

    struct OneShot(Option<StreamChunk>);

    #[async_trait]
    impl ChatStream for OneShot {
        async fn next_chunk(&mut self) -> Result<Option<StreamChunk>> {
            Ok(self.0.take())
        }
    }

    #[async_trait]
    impl ModelProvider for EchoProvider {
        async fn stream_message(&self, request: ChatRequest) -> Result<Box<dyn ChatStream>> {
            let last = request.messages.last().map(|m| m.content.clone()).unwrap_or_default();
            let turns = request.messages.len();
            Ok(Box::new(OneShot(Some(StreamChunk::text(format!("echo:{}:{}", turns, last))))))
        }

        fn get_provider_name(&self) -> &str {
            "echo"
        }

        fn model(&self) -> &str {
            "echo"
        }
    }

    struct NoTools;

    #[async_trait]
    impl ToolExecutor for NoTools {
        fn tools(&self) -> &[ToolDescriptor] {
            &[]
        }

        fn server_names(&self) -> Vec<String> {
            Vec::new()
        }

        async fn call_tool(&self, name: &str, _arguments: JsonValue) -> Result<String> {
            Err(Error::ToolNotFound(name.to_string()))
        }

        async fn close(&self) {}
    }

    async fn start() -> (String, Arc<SessionStore>, oneshot::Sender<()>) {
        let agent = Arc::new(WebMcpAgent::with_components(
            AgentSettings::default(),
            Arc::new(EchoProvider),
            Arc::new(NoTools),
        ));
        let server = ChatServer::new(agent);
        let sessions = server.sessions();
        let listener = ChatServer::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            server
                .serve(listener, async {
                    let _ = stop_rx.await;
                })
                .await
                .unwrap();
        });
        (url, sessions, stop_tx)
    }

    /// Turns are handled in order, so a pong means earlier turns are recorded
    async fn sync<S>(ws: &mut S)
    where
        S: futures_util::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
            + futures_util::Sink<Message>
            + Unpin,
    {
        let _ = ws.send(Message::Text(r#"{"type":"ping"}"#.to_string())).await;
        assert_eq!(next_json(ws).await, json!({"type": "pong"}));
    }

    async fn next_json<S>(ws: &mut S) -> JsonValue
    where
        S: futures_util::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                _ => continue,
            }
        }
    }

    #[test]
    fn test_client_frame_parsing() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"user_msg","content":"hi"}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::UserMsg {
                content: "hi".to_string(),
                session_id: None
            }
        );
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(frame, ClientFrame::Ping);
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"dance"}"#).is_err());

        let pong = serde_json::to_value(ServerFrame::HistoryCleared).unwrap();
        assert_eq!(pong, json!({"type": "history_cleared"}));
    }

    #[tokio::test]
    async fn test_websocket_session_flow() {
        let (url, sessions, stop) = start().await;
        let (mut ws, _) = connect_async(url.as_str()).await.unwrap();

        let hello = next_json(&mut ws).await;
        assert_eq!(hello["type"], "session");
        let session_id = hello["session_id"].as_str().unwrap().to_string();

        ws.send(Message::Text(r#"{"type":"ping"}"#.to_string())).await.unwrap();
        assert_eq!(next_json(&mut ws).await, json!({"type": "pong"}));

        ws.send(Message::Text("not json".to_string())).await.unwrap();
        assert_eq!(next_json(&mut ws).await["type"], "error");

        ws.send(Message::Text(r#"{"type":"get_tools"}"#.to_string())).await.unwrap();
        let tools = next_json(&mut ws).await;
        assert_eq!(tools["type"], "tools");
        assert_eq!(tools["data"]["total_tools"], 0);

        ws.send(Message::Text(r#"{"type":"user_msg","content":"hello"}"#.to_string()))
            .await
            .unwrap();
        let mut types = Vec::new();
        let final_text = loop {
            let event = next_json(&mut ws).await;
            types.push(event["type"].as_str().unwrap().to_string());
            if event["type"] == "ai_response_end" {
                break event["content"].as_str().unwrap().to_string();
            }
        };
        assert_eq!(types, vec!["status", "ai_response_start", "ai_response_chunk", "ai_response_end"]);
        assert_eq!(final_text, "echo:2:hello");

        // history from the first turn is replayed into the second
        ws.send(Message::Text(r#"{"type":"user_msg","content":"again"}"#.to_string()))
            .await
            .unwrap();
        let final_text = loop {
            let event = next_json(&mut ws).await;
            if event["type"] == "ai_response_end" {
                break event["content"].as_str().unwrap().to_string();
            }
        };
        assert_eq!(final_text, "echo:4:again");
        sync(&mut ws).await;
        assert_eq!(sessions.history(&session_id).len(), 2);

        ws.send(Message::Text(r#"{"type":"clear_history"}"#.to_string())).await.unwrap();
        assert_eq!(next_json(&mut ws).await, json!({"type": "history_cleared"}));
        assert!(sessions.history(&session_id).is_empty());

        let _ = stop.send(());
    }

    #[tokio::test]
    async fn test_explicit_session_id_is_used() {
        let (url, sessions, stop) = start().await;
        let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
        let _ = next_json(&mut ws).await;

        ws.send(Message::Text(
            r#"{"type":"user_msg","content":"hi","session_id":"fixed"}"#.to_string(),
        ))
        .await
        .unwrap();
        loop {
            if next_json(&mut ws).await["type"] == "ai_response_end" {
                break;
            }
        }
        sync(&mut ws).await;
        assert_eq!(sessions.history("fixed")[0].ai_response.as_deref(), Some("echo:2:hi"));

        let _ = stop.send(());
    }

    #[tokio::test]
    async fn test_generated_session_is_dropped_on_disconnect() {
        let (url, sessions, stop) = start().await;
        let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
        let session_id = next_json(&mut ws).await["session_id"].as_str().unwrap().to_string();

        ws.send(Message::Text(r#"{"type":"user_msg","content":"hi"}"#.to_string()))
            .await
            .unwrap();
        loop {
            if next_json(&mut ws).await["type"] == "ai_response_end" {
                break;
            }
        }
        sync(&mut ws).await;
        assert_eq!(sessions.session_count(), 1);

        ws.close(None).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while sessions.session_count() > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert!(sessions.history(&session_id).is_empty());

        let _ = stop.send(());
    }
}

use serde_json::{json, Value as JsonValue};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::app::config::{AgentSettings, McpConfig};
use crate::chat::prompts::system_prompt;
use crate::chat::types::{ChatEvent, HistoryRecord};
use crate::error::{Error, Result};
use crate::mcp::{McpClient, ToolExecutor};
use crate::models::{
    ChatRequest, Message, ModelProvider, OpenAIProvider, StreamAccumulator, ToolCall, ToolSpec,
};
use crate::platform::AppPaths;

pub const STATUS_STARTED: &str = "开始生成...";
pub const RESPONSE_STARTED: &str = "AI正在回复...";
pub const ROUNDS_EXHAUSTED: &str = "已达到最大推理轮数，请缩小问题范围或稍后重试。";

#[derive(Clone)]
struct Runtime {
    provider: Arc<dyn ModelProvider>,
    executor: Arc<dyn ToolExecutor>,
}

/// Why a turn stopped early
enum TurnAbort {
    /// The event receiver went away
    Closed,
    Failed(Error),
}

impl From<Error> for TurnAbort {
    fn from(error: Error) -> Self {
        TurnAbort::Failed(error)
    }
}

type TurnResult<T> = std::result::Result<T, TurnAbort>;

async fn emit(events: &mpsc::Sender<ChatEvent>, event: ChatEvent) -> TurnResult<()> {
    events.send(event).await.map_err(|_| TurnAbort::Closed)
}

/// Chat agent that streams model output and runs MCP tools between rounds
pub struct WebMcpAgent {
    settings: AgentSettings,
    runtime: RwLock<Option<Runtime>>,
}

impl WebMcpAgent {
    pub fn new(settings: AgentSettings) -> Self {
        Self {
            settings,
            runtime: RwLock::new(None),
        }
    }

    /// An agent that is ready to chat with the given model and tools
    pub fn with_components(
        settings: AgentSettings,
        provider: Arc<dyn ModelProvider>,
        executor: Arc<dyn ToolExecutor>,
    ) -> Self {
        Self {
            settings,
            runtime: RwLock::new(Some(Runtime { provider, executor })),
        }
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    /// Connects the model and every MCP server. Failures are logged and
    /// reported as `false`.
    pub async fn initialize(&self) -> Result<bool> {
        match self.initialize_strict().await {
            Ok(()) => Ok(true),
            Err(e) => {
                error!("Agent initialization failed: {:#}", anyhow::Error::new(e));
                Ok(false)
            }
        }
    }

    pub async fn initialize_strict(&self) -> Result<()> {
        self.settings.validate()?;
        info!(model = %self.settings.model, base_url = %self.settings.base_url, "Initializing agent");

        let provider = OpenAIProvider::from_settings(&self.settings)?;

        let config_path = self.mcp_config_path();
        let config = McpConfig::load(&config_path).await;
        let servers = config.server_configs();
        if servers.is_empty() {
            info!("No external MCP servers configured, running without tools");
        }
        let client = McpClient::connect(&servers).await;

        let runtime = Runtime {
            provider: Arc::new(provider),
            executor: Arc::new(client),
        };
        if let Some(previous) = self.runtime.write().await.replace(runtime) {
            previous.executor.close().await;
        }

        info!("Agent initialized");
        Ok(())
    }

    fn mcp_config_path(&self) -> PathBuf {
        match AppPaths::new() {
            Ok(paths) => paths.resolve_mcp_config(self.settings.mcp_config_path.as_deref()),
            Err(e) => {
                warn!("Could not resolve application directories: {}", e);
                self.settings
                    .mcp_config_path
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(crate::platform::paths::MCP_CONFIG_FILE))
            }
        }
    }

    async fn runtime(&self) -> Option<Runtime> {
        self.runtime.read().await.clone()
    }

    /// Runs one chat turn, sending every event to `events`. A dropped
    /// receiver ends the turn quietly.
    pub async fn chat_stream(
        &self,
        user_input: &str,
        history: &[HistoryRecord],
        session_id: Option<&str>,
        events: &mpsc::Sender<ChatEvent>,
    ) {
        let span = info_span!("chat", session_id = session_id.unwrap_or("-"));
        let outcome = self.run_turn(user_input, history, events).instrument(span).await;

        match outcome {
            Ok(()) => {}
            Err(TurnAbort::Closed) => debug!("Event receiver closed, turn abandoned"),
            Err(TurnAbort::Failed(e)) => {
                error!("Chat turn failed: {}", e);
                let _ = events
                    .send(ChatEvent::error(format!("处理请求时出错: {}", e)))
                    .await;
            }
        }
    }

    async fn run_turn(
        &self,
        user_input: &str,
        history: &[HistoryRecord],
        events: &mpsc::Sender<ChatEvent>,
    ) -> TurnResult<()> {
        info!("Processing user input: {}", preview(user_input));
        emit(events, ChatEvent::status(STATUS_STARTED)).await?;

        let runtime = self.runtime().await.ok_or(Error::NotInitialized)?;
        let tools: Vec<ToolSpec> = runtime
            .executor
            .tools()
            .iter()
            .map(|tool| ToolSpec {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: tool.model_schema(),
            })
            .collect();

        let mut messages = history_messages(history, user_input);

        for round in 1..=self.settings.max_rounds {
            debug!(round, "Starting reasoning round");

            let mut request_messages = Vec::with_capacity(messages.len() + 1);
            request_messages.push(Message::system(system_prompt()));
            request_messages.extend(messages.iter().cloned());
            let request = ChatRequest::new(request_messages, runtime.provider.model().to_string())
                .with_temperature(self.settings.temperature)
                .with_tools(tools.clone());

            let mut response_started = false;
            let mut streamed = String::new();
            let mut accumulator = StreamAccumulator::new();
            let mut failed = false;

            match runtime.provider.stream_message(request).await {
                Ok(mut stream) => loop {
                    match stream.next_chunk().await {
                        Ok(Some(chunk)) => {
                            if !chunk.delta.is_empty() {
                                if !response_started {
                                    emit(events, response_start()).await?;
                                    response_started = true;
                                }
                                streamed.push_str(&chunk.delta);
                                emit(events, ChatEvent::AiResponseChunk { content: chunk.delta.clone() }).await?;
                            }
                            accumulator.push(&chunk);
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(round, "Model stream failed: {}", e);
                            failed = true;
                            break;
                        }
                    }
                },
                Err(e) => {
                    warn!(round, "Model request failed: {}", e);
                    failed = true;
                }
            }

            let (content, tool_calls) = if failed {
                (String::new(), Vec::new())
            } else {
                accumulator.finish()
            };

            if !tool_calls.is_empty() {
                if response_started {
                    warn!(round, "Model streamed text before requesting tools");
                }
                self.run_tools(&runtime, tool_calls, &mut messages, events).await?;
                continue;
            }

            let final_text = if streamed.is_empty() { content } else { streamed };
            if !response_started {
                emit(events, response_start()).await?;
                if !final_text.is_empty() {
                    emit(events, ChatEvent::AiResponseChunk { content: final_text.clone() }).await?;
                }
            }
            emit(events, ChatEvent::AiResponseEnd { content: final_text }).await?;
            return Ok(());
        }

        warn!(max_rounds = self.settings.max_rounds, "Reasoning round limit reached");
        emit(events, response_start()).await?;
        emit(events, ChatEvent::AiResponseChunk { content: ROUNDS_EXHAUSTED.to_string() }).await?;
        emit(events, ChatEvent::AiResponseEnd { content: ROUNDS_EXHAUSTED.to_string() }).await?;
        Ok(())
    }

    async fn run_tools(
        &self,
        runtime: &Runtime,
        tool_calls: Vec<ToolCall>,
        messages: &mut Vec<Message>,
        events: &mpsc::Sender<ChatEvent>,
    ) -> TurnResult<()> {
        let count = tool_calls.len();
        emit(
            events,
            ChatEvent::ToolPlan {
                content: format!("AI决定调用 {} 个工具", count),
                tool_count: count,
            },
        )
        .await?;

        let tool_calls: Vec<ToolCall> = tool_calls
            .into_iter()
            .enumerate()
            .map(|(i, mut call)| {
                if call.id.is_empty() {
                    call.id = format!("call_{}", i + 1);
                }
                call
            })
            .collect();
        messages.push(Message::assistant_tool_calls(String::new(), tool_calls.clone()));

        for (i, call) in tool_calls.into_iter().enumerate() {
            let arguments = parse_tool_arguments(&call.arguments);
            emit(
                events,
                ChatEvent::ToolStart {
                    tool_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    tool_args: arguments.clone(),
                    progress: format!("{}/{}", i + 1, count),
                },
            )
            .await?;

            let result = match runtime.executor.call_tool(&call.name, arguments).await {
                Ok(text) => {
                    debug!(tool = %call.name, "Tool finished");
                    emit(
                        events,
                        ChatEvent::ToolEnd {
                            tool_id: call.id.clone(),
                            tool_name: call.name.clone(),
                            result: text.clone(),
                        },
                    )
                    .await?;
                    text
                }
                Err(e) => {
                    let message = match &e {
                        Error::ToolNotFound(_) => e.to_string(),
                        _ => format!("工具执行出错: {}", e),
                    };
                    error!(tool = %call.name, "{}", message);
                    emit(
                        events,
                        ChatEvent::ToolError {
                            tool_id: call.id.clone(),
                            error: message.clone(),
                        },
                    )
                    .await?;
                    format!("错误: {}", message)
                }
            };

            messages.push(Message::tool_result(call.id, call.name, result));
        }
        Ok(())
    }

    /// Servers and tools as shown to clients
    pub async fn tools_info(&self) -> JsonValue {
        match self.runtime().await {
            Some(runtime) => runtime.executor.tools_info(),
            None => json!({ "servers": {}, "total_tools": 0, "server_count": 0 }),
        }
    }

    pub async fn close(&self) {
        if let Some(runtime) = self.runtime.write().await.take() {
            runtime.executor.close().await;
            info!("Agent closed");
        }
    }
}

fn response_start() -> ChatEvent {
    ChatEvent::AiResponseStart {
        content: RESPONSE_STARTED.to_string(),
    }
}

fn preview(text: &str) -> String {
    text.chars().take(50).collect()
}

/// Prior exchanges followed by the new user input. The system prompt is
/// added per round and never stored here.
pub fn history_messages(history: &[HistoryRecord], user_input: &str) -> Vec<Message> {
    let mut messages = Vec::with_capacity(history.len() * 2 + 1);
    for record in history {
        messages.push(Message::user(record.user_input.clone()));
        if let Some(response) = record.ai_response.as_deref().filter(|r| !r.is_empty()) {
            messages.push(Message::assistant(response.to_string()));
        }
    }
    messages.push(Message::user(user_input.to_string()));
    messages
}

/// Tool arguments as a JSON object. Anything the model sent that is not an
/// object is wrapped as `{"$raw": ...}`.
pub fn parse_tool_arguments(raw: &str) -> JsonValue {
    if raw.trim().is_empty() {
        return json!({});
    }
    match serde_json::from_str::<JsonValue>(raw) {
        Ok(value @ JsonValue::Object(_)) => value,
        Ok(JsonValue::String(text)) => json!({ "$raw": text }),
        Ok(other) => json!({ "$raw": other.to_string() }),
        Err(_) => json!({ "$raw": raw }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::ToolDescriptor;
    use crate::models::{ChatStream, StreamChunk, ToolCallDelta};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Plays back one scripted round per request
    struct ScriptedProvider {
        rounds: Mutex<VecDeque<Result<Vec<Result<StreamChunk>>>>>,
        requests: Mutex<Vec<ChatRequest>>,
        repeat_last: bool,
    }

    impl ScriptedProvider {
        fn new(rounds: Vec<Result<Vec<Result<StreamChunk>>>>) -> Self {
            Self {
                rounds: Mutex::new(rounds.into()),
                requests: Mutex::new(Vec::new()),
                repeat_last: false,
            }
        }

        fn forever(round: Vec<StreamChunk>) -> Self {
            Self {
                repeat_last: true,
                ..Self::new(vec![Ok(round.into_iter().map(Ok).collect())])
            }
        }
    }

    struct ScriptedStream(VecDeque<Result<StreamChunk>>);

    #[async_trait]
    impl ChatStream for ScriptedStream {
        async fn next_chunk(&mut self) -> Result<Option<StreamChunk>> {
            self.0.pop_front().transpose()
        }
    }

    fn clone_round(round: &Result<Vec<Result<StreamChunk>>>) -> Result<Vec<Result<StreamChunk>>> {
        match round {
            Ok(chunks) => Ok(chunks
                .iter()
                .map(|c| match c {
                    Ok(chunk) => Ok(chunk.clone()),
                    Err(e) => Err(Error::model_provider(e.to_string())),
                })
                .collect()),
            Err(e) => Err(Error::model_provider(e.to_string())),
        }
    }

    #[async_trait]
    impl ModelProvider for ScriptedProvider {
        async fn stream_message(&self, request: ChatRequest) -> Result<Box<dyn ChatStream>> {
            self.requests.lock().push(request);
            let round = {
                let mut rounds = self.rounds.lock();
                if self.repeat_last && rounds.len() == 1 {
                    rounds.front().map(clone_round)
                } else {
                    rounds.pop_front()
                }
            };
            let chunks = round.unwrap_or_else(|| Ok(Vec::new()))?;
            Ok(Box::new(ScriptedStream(chunks.into())))
        }

        fn get_provider_name(&self) -> &str {
            "scripted"
        }

        fn model(&self) -> &str {
            "scripted-model"
        }
    }

    struct FakeTools {
        tools: Vec<ToolDescriptor>,
        calls: Mutex<Vec<(String, JsonValue)>>,
    }

    impl FakeTools {
        fn new(names: &[&str]) -> Self {
            Self {
                tools: names
                    .iter()
                    .map(|name| ToolDescriptor {
                        name: name.to_string(),
                        original_name: name.to_string(),
                        server: "fake".to_string(),
                        description: format!("{} tool", name),
                        input_schema: json!({"type": "object", "properties": {"q": {"type": "string"}}}),
                    })
                    .collect(),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ToolExecutor for FakeTools {
        fn tools(&self) -> &[ToolDescriptor] {
            &self.tools
        }

        fn server_names(&self) -> Vec<String> {
            vec!["fake".to_string()]
        }

        async fn call_tool(&self, name: &str, arguments: JsonValue) -> Result<String> {
            if !self.tools.iter().any(|t| t.name == name) {
                return Err(Error::ToolNotFound(name.to_string()));
            }
            self.calls.lock().push((name.to_string(), arguments.clone()));
            if name == "broken" {
                return Err(Error::tool_execution("boom"));
            }
            Ok(format!("{} result for {}", name, arguments))
        }

        async fn close(&self) {}
    }

    fn tool_call_chunk(id: &str, name: &str, arguments: &str) -> StreamChunk {
        StreamChunk {
            tool_calls: vec![ToolCallDelta {
                index: 0,
                id: Some(id.to_string()),
                name: Some(name.to_string()),
                arguments: Some(arguments.to_string()),
            }],
            finish_reason: Some("tool_calls".to_string()),
            ..Default::default()
        }
    }

    fn settings() -> AgentSettings {
        AgentSettings {
            api_key: "sk-test".to_string(),
            ..Default::default()
        }
    }

    async fn run(agent: &WebMcpAgent, input: &str, history: &[HistoryRecord]) -> Vec<ChatEvent> {
        let (tx, mut rx) = mpsc::channel(256);
        agent.chat_stream(input, history, Some("session-1"), &tx).await;
        drop(tx);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn agent(provider: ScriptedProvider, tools: FakeTools) -> (WebMcpAgent, Arc<ScriptedProvider>, Arc<FakeTools>) {
        let provider = Arc::new(provider);
        let tools = Arc::new(tools);
        let agent = WebMcpAgent::with_components(settings(), provider.clone(), tools.clone());
        (agent, provider, tools)
    }

    #[test]
    fn test_parse_tool_arguments() {
        assert_eq!(parse_tool_arguments(""), json!({}));
        assert_eq!(parse_tool_arguments("  "), json!({}));
        assert_eq!(parse_tool_arguments(r#"{"city":"Oslo"}"#), json!({"city": "Oslo"}));
        assert_eq!(parse_tool_arguments("not json"), json!({"$raw": "not json"}));
        assert_eq!(parse_tool_arguments("[1,2]"), json!({"$raw": "[1,2]"}));
        assert_eq!(parse_tool_arguments("42"), json!({"$raw": "42"}));
        assert_eq!(parse_tool_arguments(r#""text""#), json!({"$raw": "text"}));
    }

    #[test]
    fn test_history_messages_skip_empty_responses() {
        let history = vec![
            HistoryRecord::new("first", Some("answer".to_string())),
            HistoryRecord::new("second", None),
            HistoryRecord::new("third", Some(String::new())),
        ];
        let messages = history_messages(&history, "now");
        let contents: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "answer", "second", "third", "now"]);
    }

    #[tokio::test]
    async fn test_plain_answer_event_order() {
        let (agent, provider, _) = agent(
            ScriptedProvider::new(vec![Ok(vec![Ok(StreamChunk::text("你")), Ok(StreamChunk::text("好"))])]),
            FakeTools::new(&["search"]),
        );

        let events = run(&agent, "hi", &[HistoryRecord::new("earlier", Some("reply".to_string()))]).await;
        assert_eq!(
            events,
            vec![
                ChatEvent::status(STATUS_STARTED),
                response_start(),
                ChatEvent::AiResponseChunk { content: "你".to_string() },
                ChatEvent::AiResponseChunk { content: "好".to_string() },
                ChatEvent::AiResponseEnd { content: "你好".to_string() },
            ]
        );

        let requests = provider.requests.lock();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert!(request.messages[0].content.starts_with("今天是 "));
        assert_eq!(request.messages.len(), 4);
        assert_eq!(request.tools[0].name, "search");
        assert_eq!(request.model, "scripted-model");
    }

    #[tokio::test]
    async fn test_text_before_tool_calls_still_runs_tools() {
        let (agent, provider, tools) = agent(
            ScriptedProvider::new(vec![
                Ok(vec![
                    Ok(StreamChunk::text("thinking")),
                    Ok(tool_call_chunk("call_t", "search", r#"{"q":"rust"}"#)),
                ]),
                Ok(vec![Ok(StreamChunk::text("found it"))]),
            ]),
            FakeTools::new(&["search"]),
        );

        let events = run(&agent, "search please", &[]).await;
        assert_eq!(
            events,
            vec![
                ChatEvent::status(STATUS_STARTED),
                response_start(),
                ChatEvent::AiResponseChunk { content: "thinking".to_string() },
                ChatEvent::ToolPlan {
                    content: "AI决定调用 1 个工具".to_string(),
                    tool_count: 1
                },
                ChatEvent::ToolStart {
                    tool_id: "call_t".to_string(),
                    tool_name: "search".to_string(),
                    tool_args: json!({"q": "rust"}),
                    progress: "1/1".to_string(),
                },
                ChatEvent::ToolEnd {
                    tool_id: "call_t".to_string(),
                    tool_name: "search".to_string(),
                    result: r#"search result for {"q":"rust"}"#.to_string(),
                },
                response_start(),
                ChatEvent::AiResponseChunk { content: "found it".to_string() },
                ChatEvent::AiResponseEnd { content: "found it".to_string() },
            ]
        );

        assert_eq!(tools.calls.lock().len(), 1);
        assert_eq!(provider.requests.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_tool_round_then_answer() {
        let (agent, provider, tools) = agent(
            ScriptedProvider::new(vec![
                Ok(vec![Ok(tool_call_chunk("call_abc", "search", r#"{"q":"mcp"}"#))]),
                Ok(vec![Ok(StreamChunk::text("done"))]),
            ]),
            FakeTools::new(&["search"]),
        );

        let events = run(&agent, "look it up", &[]).await;
        assert_eq!(events[0], ChatEvent::status(STATUS_STARTED));
        assert_eq!(
            events[1],
            ChatEvent::ToolPlan {
                content: "AI决定调用 1 个工具".to_string(),
                tool_count: 1
            }
        );
        assert_eq!(
            events[2],
            ChatEvent::ToolStart {
                tool_id: "call_abc".to_string(),
                tool_name: "search".to_string(),
                tool_args: json!({"q": "mcp"}),
                progress: "1/1".to_string(),
            }
        );
        assert!(matches!(&events[3], ChatEvent::ToolEnd { tool_id, .. } if tool_id == "call_abc"));
        assert_eq!(events[4], response_start());
        assert_eq!(events.last().and_then(ChatEvent::final_text), Some("done"));

        assert_eq!(tools.calls.lock()[0], ("search".to_string(), json!({"q": "mcp"})));

        let requests = provider.requests.lock();
        let second = &requests[1].messages;
        let assistant = &second[second.len() - 2];
        assert_eq!(assistant.tool_calls[0].id, "call_abc");
        assert!(assistant.content.is_empty());
        let tool_message = &second[second.len() - 1];
        assert_eq!(tool_message.tool_call_id.as_deref(), Some("call_abc"));
        assert_eq!(tool_message.name.as_deref(), Some("search"));
        assert!(tool_message.content.starts_with("search result"));
    }

    #[tokio::test]
    async fn test_unknown_tool_reports_error_and_continues() {
        let (agent, provider, _) = agent(
            ScriptedProvider::new(vec![
                Ok(vec![Ok(tool_call_chunk("", "missing", ""))]),
                Ok(vec![Ok(StreamChunk::text("sorry"))]),
            ]),
            FakeTools::new(&["search"]),
        );

        let events = run(&agent, "use a tool", &[]).await;
        assert!(events.contains(&ChatEvent::ToolError {
            tool_id: "call_1".to_string(),
            error: "工具 'missing' 未找到".to_string(),
        }));
        assert!(events.contains(&ChatEvent::ToolStart {
            tool_id: "call_1".to_string(),
            tool_name: "missing".to_string(),
            tool_args: json!({}),
            progress: "1/1".to_string(),
        }));

        let requests = provider.requests.lock();
        let tool_message = requests[1].messages.last().unwrap();
        assert_eq!(tool_message.content, "错误: 工具 'missing' 未找到");
        assert_eq!(tool_message.tool_call_id.as_deref(), Some("call_1"));
    }

    #[tokio::test]
    async fn test_failing_tool_result_is_fed_back() {
        let (agent, provider, _) = agent(
            ScriptedProvider::new(vec![
                Ok(vec![Ok(tool_call_chunk("call_9", "broken", "{}"))]),
                Ok(vec![Ok(StreamChunk::text("ok"))]),
            ]),
            FakeTools::new(&["broken"]),
        );

        let events = run(&agent, "break it", &[]).await;
        assert!(events.contains(&ChatEvent::ToolError {
            tool_id: "call_9".to_string(),
            error: "工具执行出错: boom".to_string(),
        }));
        let requests = provider.requests.lock();
        assert_eq!(requests[1].messages.last().unwrap().content, "错误: 工具执行出错: boom");
    }

    #[tokio::test]
    async fn test_round_limit() {
        let (agent, provider, _) = {
            let provider = Arc::new(ScriptedProvider::forever(vec![tool_call_chunk("call_1", "search", "{}")]));
            let tools = Arc::new(FakeTools::new(&["search"]));
            let settings = AgentSettings {
                max_rounds: 3,
                ..settings()
            };
            let agent = WebMcpAgent::with_components(settings, provider.clone(), tools.clone());
            (agent, provider, tools)
        };

        let events = run(&agent, "loop", &[]).await;
        let plans = events.iter().filter(|e| matches!(e, ChatEvent::ToolPlan { .. })).count();
        assert_eq!(plans, 3);
        assert_eq!(provider.requests.lock().len(), 3);

        let tail = &events[events.len() - 3..];
        assert_eq!(tail[0], response_start());
        assert_eq!(tail[1], ChatEvent::AiResponseChunk { content: ROUNDS_EXHAUSTED.to_string() });
        assert_eq!(tail[2], ChatEvent::AiResponseEnd { content: ROUNDS_EXHAUSTED.to_string() });
    }

    #[tokio::test]
    async fn test_stream_failure_gives_empty_answer() {
        let (agent, _, _) = agent(
            ScriptedProvider::new(vec![Err(Error::model_provider("connection refused"))]),
            FakeTools::new(&[]),
        );

        let events = run(&agent, "hello", &[]).await;
        assert_eq!(
            events,
            vec![
                ChatEvent::status(STATUS_STARTED),
                response_start(),
                ChatEvent::AiResponseEnd { content: String::new() },
            ]
        );
    }

    #[tokio::test]
    async fn test_mid_stream_failure_keeps_streamed_text() {
        let (agent, _, _) = agent(
            ScriptedProvider::new(vec![Ok(vec![
                Ok(StreamChunk::text("partial")),
                Err(Error::model_provider("reset")),
            ])]),
            FakeTools::new(&[]),
        );

        let events = run(&agent, "hello", &[]).await;
        assert_eq!(events.last().and_then(ChatEvent::final_text), Some("partial"));
        let starts = events.iter().filter(|e| matches!(e, ChatEvent::AiResponseStart { .. })).count();
        assert_eq!(starts, 1);
    }

    #[tokio::test]
    async fn test_uninitialized_agent_reports_error() {
        let agent = WebMcpAgent::new(settings());
        let events = run(&agent, "hello", &[]).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[1], ChatEvent::Error { content } if content.starts_with("处理请求时出错: ")));

        let info = agent.tools_info().await;
        assert_eq!(info, json!({ "servers": {}, "total_tools": 0, "server_count": 0 }));
    }

    #[tokio::test]
    async fn test_initialize_without_api_key_returns_false() {
        let agent = WebMcpAgent::new(AgentSettings::default());
        assert!(!agent.initialize().await.unwrap());
        assert!(agent.initialize_strict().await.is_err());
    }

    #[tokio::test]
    async fn test_tools_info_and_close() {
        let (agent, _, _) = agent(ScriptedProvider::new(vec![]), FakeTools::new(&["search", "fetch"]));
        let info = agent.tools_info().await;
        assert_eq!(info["total_tools"], 2);
        assert_eq!(info["servers"]["fake"]["tools"][1]["name"], "fetch");

        agent.close().await;
        agent.close().await;
        assert_eq!(agent.tools_info().await["server_count"], 0);
    }
}

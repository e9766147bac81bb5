pub mod client;
pub mod http_transport;
pub mod naming;
pub mod protocol;
pub mod server_manager;
pub mod transport;
pub mod types;

pub use client::{McpClient, ToolDescriptor, ToolExecutor};
pub use http_transport::StreamableHttpTransport;
pub use naming::{sanitize_tool_name, ToolNameRegistry};
pub use protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, ProtocolHandler, ProtocolMessage};
pub use server_manager::{McpServerInstance, ServerState};
pub use transport::{StdioTransport, Transport, TransportStatus};
pub use types::{CallToolResult, Content, ContentItem, InitializeParams, InitializeResult, Tool, PROTOCOL_VERSION};

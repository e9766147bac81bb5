use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::mcp::protocol::ProtocolMessage;

/// Transport layer abstraction for MCP communication
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a message through the transport
    async fn send(&self, message: &ProtocolMessage) -> Result<()>;

    /// Receive the next message; `None` once the peer has gone away
    async fn receive(&self) -> Result<Option<ProtocolMessage>>;

    async fn is_connected(&self) -> bool;

    async fn close(&self) -> Result<()>;

    async fn get_status(&self) -> TransportStatus;
}

/// Transport status information
#[derive(Debug, Clone)]
pub struct TransportStatus {
    pub transport_type: String,
    pub is_connected: bool,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub last_activity: Option<Instant>,
    pub error_count: u64,
}

impl TransportStatus {
    pub fn new(transport_type: &str) -> Self {
        Self {
            transport_type: transport_type.to_string(),
            is_connected: true,
            messages_sent: 0,
            messages_received: 0,
            last_activity: Some(Instant::now()),
            error_count: 0,
        }
    }
}

/// Stdio transport for MCP servers running as child processes
pub struct StdioTransport {
    process: Arc<Mutex<Option<Child>>>,
    sender: Arc<Mutex<Option<BufWriter<ChildStdin>>>>,
    receiver: Arc<Mutex<Option<mpsc::Receiver<Result<ProtocolMessage>>>>>,
    status: Arc<RwLock<TransportStatus>>,
    shutdown_tx: Arc<Mutex<Option<mpsc::Sender<()>>>>,
}

impl StdioTransport {
    /// Spawn `command` and speak newline-delimited JSON-RPC over its stdio
    pub async fn spawn(
        server_name: &str,
        command: &str,
        args: &[String],
        env_vars: &HashMap<String, String>,
    ) -> Result<Self> {
        info!(server = server_name, "Starting MCP server process: {} {:?}", command, args);

        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env_vars)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::mcp(format!("Failed to spawn MCP server process '{}': {}", command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::mcp("Failed to get stdin handle for MCP server"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::mcp("Failed to get stdout handle for MCP server"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::mcp("Failed to get stderr handle for MCP server"))?;

        let (message_tx, message_rx) = mpsc::channel::<Result<ProtocolMessage>>(100);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let transport = Self {
            process: Arc::new(Mutex::new(Some(child))),
            sender: Arc::new(Mutex::new(Some(BufWriter::new(stdin)))),
            receiver: Arc::new(Mutex::new(Some(message_rx))),
            status: Arc::new(RwLock::new(TransportStatus::new("stdio"))),
            shutdown_tx: Arc::new(Mutex::new(Some(shutdown_tx))),
        };

        let status = transport.status.clone();
        let name = server_name.to_string();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut line = String::new();

            loop {
                line.clear();
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!(server = %name, "Stdout reader shutting down");
                        break;
                    }
                    result = reader.read_line(&mut line) => {
                        match result {
                            Ok(0) => {
                                debug!(server = %name, "MCP server stdout closed");
                                break;
                            }
                            Ok(_) => {
                                let trimmed = line.trim();
                                if trimmed.is_empty() {
                                    continue;
                                }
                                let parsed = ProtocolMessage::parse(trimmed);
                                {
                                    let mut status = status.write().await;
                                    match parsed {
                                        Ok(_) => {
                                            status.messages_received += 1;
                                            status.last_activity = Some(Instant::now());
                                        }
                                        Err(_) => status.error_count += 1,
                                    }
                                }
                                if let Err(e) = &parsed {
                                    error!(server = %name, "Failed to parse message from MCP server: {}", e);
                                }
                                if message_tx.send(parsed).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                error!(server = %name, "Error reading from MCP server stdout: {}", e);
                                let _ = message_tx
                                    .send(Err(Error::mcp(format!("Transport read error: {}", e))))
                                    .await;
                                break;
                            }
                        }
                    }
                }
            }

            let mut status = status.write().await;
            status.is_connected = false;
        });

        let name = server_name.to_string();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();
            while let Ok(read) = reader.read_line(&mut line).await {
                if read == 0 {
                    break;
                }
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    debug!(server = %name, "MCP server stderr: {}", trimmed);
                }
                line.clear();
            }
        });

        Ok(transport)
    }

    async fn kill(&self) -> Result<()> {
        let mut process = self.process.lock().await;
        if let Some(mut child) = process.take() {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill MCP server process: {}", e);
            }
        }

        self.status.write().await.is_connected = false;
        Ok(())
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&self, message: &ProtocolMessage) -> Result<()> {
        let mut sender_guard = self.sender.lock().await;
        let sender = sender_guard
            .as_mut()
            .ok_or_else(|| Error::mcp("Transport sender not available"))?;

        let serialized = message.serialize()?;
        debug!("Sending to MCP server: {}", serialized);

        sender
            .write_all(serialized.as_bytes())
            .await
            .map_err(|e| Error::mcp(format!("Failed to write to MCP server stdin: {}", e)))?;
        sender
            .write_all(b"\n")
            .await
            .map_err(|e| Error::mcp(format!("Failed to write newline to MCP server stdin: {}", e)))?;
        sender
            .flush()
            .await
            .map_err(|e| Error::mcp(format!("Failed to flush MCP server stdin: {}", e)))?;

        let mut status = self.status.write().await;
        status.messages_sent += 1;
        status.last_activity = Some(Instant::now());
        Ok(())
    }

    async fn receive(&self) -> Result<Option<ProtocolMessage>> {
        let mut receiver_guard = self.receiver.lock().await;
        match receiver_guard.as_mut() {
            Some(receiver) => receiver.recv().await.transpose(),
            None => Ok(None),
        }
    }

    async fn is_connected(&self) -> bool {
        self.status.read().await.is_connected
    }

    async fn close(&self) -> Result<()> {
        debug!("Closing stdio transport");

        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(()).await;
        }
        *self.sender.lock().await = None;
        *self.receiver.lock().await = None;

        self.kill().await
    }

    async fn get_status(&self) -> TransportStatus {
        self.status.read().await.clone()
    }
}

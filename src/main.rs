use anyhow::Context;
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mcpmode::app::AgentSettings;
use mcpmode::chat::{ChatEvent, WebMcpAgent};
use mcpmode::cli::{Cli, Commands};
use mcpmode::server::ChatServer;

fn init_logging(debug: bool, log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let default_filter = if debug { "mcpmode=debug" } else { "mcpmode=info" };
    let filter = if debug {
        EnvFilter::new(default_filter)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
    };

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "mcpmode.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .with(file_layer)
        .init();

    Ok(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.debug, cli.log_dir.as_deref())?;

    let mut settings = AgentSettings::load();
    if let Some(path) = cli.mcp_config.clone() {
        settings.mcp_config_path = Some(path);
    }
    info!("Starting mcpmode {}", env!("CARGO_PKG_VERSION"));

    let agent = Arc::new(WebMcpAgent::new(settings));

    match cli.command {
        Commands::Serve { bind } => {
            if !agent.initialize().await? {
                warn!("Agent failed to initialize, chat requests will report an error");
            }
            let server = ChatServer::new(agent.clone());
            let listener = ChatServer::bind(&bind)
                .await
                .with_context(|| format!("failed to bind {}", bind))?;
            server
                .serve(listener, async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        warn!("Failed to listen for Ctrl-C: {}", e);
                        std::future::pending::<()>().await;
                    }
                })
                .await?;
        }
        Commands::Chat { message, session } => {
            agent
                .initialize_strict()
                .await
                .context("failed to initialize agent")?;

            let (tx, mut rx) = mpsc::channel::<ChatEvent>(64);
            let turn_agent = agent.clone();
            let turn = tokio::spawn(async move {
                turn_agent.chat_stream(&message, &[], session.as_deref(), &tx).await;
            });
            while let Some(event) = rx.recv().await {
                println!("{}", serde_json::to_string(&event)?);
            }
            turn.await.context("chat turn panicked")?;
        }
        Commands::Tools => {
            agent
                .initialize_strict()
                .await
                .context("failed to initialize agent")?;
            println!("{}", serde_json::to_string_pretty(&agent.tools_info().await)?);
        }
    }

    agent.close().await;
    Ok(())
}

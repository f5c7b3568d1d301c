//! Casework CLI
//!
//! Chat with the case-management assistant from the terminal.

mod logging;
mod paths;
mod settings;
mod shell;

use std::path::PathBuf;
use std::sync::Arc;

use casework_client::{ClientConfig, SessionActorHandle, TransportKind};
use casework_connectors::{SseTransport, Transport, WebSocketTransport};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::settings::Overrides;

#[derive(Parser)]
#[command(name = "casework", version)]
#[command(about = "Casework CLI - chat with the case-management assistant", long_about = None)]
struct Cli {
    /// Data directory (default: $CASEWORK_DATA_DIR or ~/.casework)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Config file (default: <data dir>/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive chat session
    Chat {
        /// Backend endpoint (ws:// for websocket, http:// for sse)
        #[arg(long)]
        endpoint: Option<String>,

        /// Transport: websocket or sse
        #[arg(long)]
        transport: Option<String>,

        /// Service user the conversation is about
        #[arg(long)]
        subject: Option<String>,

        /// Assistant tool to route the conversation to
        #[arg(long)]
        tool: Option<String>,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let data_dir = paths::resolve_data_dir(cli.data_dir.as_deref())?;
    paths::ensure_dirs(&data_dir)?;

    let overrides = match &cli.command {
        Commands::Chat {
            endpoint,
            transport,
            subject,
            tool,
        } => Overrides {
            endpoint: endpoint.clone(),
            transport: transport.clone(),
            subject: subject.clone(),
            tool: tool.clone(),
        },
        Commands::Config => Overrides::default(),
    };
    let config = settings::resolve(
        cli.config.as_deref(),
        paths::config_path(&data_dir),
        |key| std::env::var(key).ok(),
        &overrides,
    )?;

    match cli.command {
        Commands::Config => {
            println!("# data dir: {}", data_dir.display());
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Chat { .. } => {
            let logging = logging::init_logging(&paths::log_dir(&data_dir))?;
            info!(
                component = "cli",
                event = "cli.chat.start",
                run_id = %logging.run_id,
                endpoint = %config.endpoint,
                transport = ?config.transport,
                "Starting chat"
            );

            let transport = build_transport(&config)?;
            let handle = SessionActorHandle::spawn(&config, transport);
            shell::run(handle).await
        }
    }
}

fn build_transport(config: &ClientConfig) -> anyhow::Result<Arc<dyn Transport>> {
    match config.transport {
        TransportKind::Websocket => Ok(Arc::new(WebSocketTransport::new())),
        TransportKind::Sse => {
            let client = reqwest::Client::builder().build()?;
            Ok(Arc::new(SseTransport::new(client, Some(config.reset_url()))))
        }
    }
}

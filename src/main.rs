mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use sluice::config::SluiceConfig;
use sluice::protocol::ConversationId;

#[derive(Parser)]
#[command(name = "sluice", version, about = "Security-gated streaming chat server and client")]
struct Cli {
    /// Config file (defaults to ~/.sluice/config.toml)
    #[arg(long, global = true)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the chat server
    Serve,
    /// Send one message and stream the reply
    Chat {
        /// Conversation to post into
        #[arg(long, short)]
        conversation: Option<String>,
        /// Message text
        message: String,
    },
    /// Validate and print the security gate order
    CheckGates,
    /// Fetch and print an anti-forgery token
    Token,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => SluiceConfig::load_from(path)?,
        None => SluiceConfig::load()?,
    };

    // Log to stderr so stdout carries only the streamed reply.
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve => {
            sluice::server::serve(config).await?;
        }
        Command::Chat {
            conversation,
            message,
        } => {
            cli::chat::chat(&config, conversation.map(ConversationId::new), &message).await?;
        }
        Command::CheckGates => {
            cli::check_gates::check_gates(&config)?;
        }
        Command::Token => {
            cli::token::token(&config).await?;
        }
    }

    Ok(())
}

//! Chatsnap - terminal client for an offline-capable chat.
//!
//! The client:
//! - Shows the conversation live while connected
//! - Falls back to the local cache while offline
//! - Queues messages written offline and sends them on reconnect

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

mod commands;

/// Chatsnap - offline-capable chat client
#[derive(Parser)]
#[command(name = "chatsnap")]
#[command(about = "Terminal client for an offline-capable chat", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the chat
    Run {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<String>,

        /// Display name for this session
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Show paths and cache contents
    Status,

    /// Show or modify configuration
    Config {
        /// Key to get or set
        key: Option<String>,
        /// Value to set
        value: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run { config, name } => {
            info!("Starting chatsnap...");
            commands::run::execute(config, name).await
        }
        Commands::Status => commands::status::execute().await,
        Commands::Config { key, value } => commands::config::execute(key, value).await,
    }
}

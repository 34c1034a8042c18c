//! Castwire CLI
//!
//! Stream your screen and microphone to an RTMP ingest server.
//!
//! # Usage
//!
//! ```bash
//! # Open the streaming console and go live immediately
//! CASTWIRE_STREAM_KEY=live_xxx castwire stream --start
//!
//! # Record a dry run to a local FLV file
//! castwire stream --url /tmp/test.flv --start
//!
//! # Create a config file
//! castwire config init
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Castwire - screen and microphone streaming to RTMP
#[derive(Parser)]
#[command(name = "castwire")]
#[command(version)]
#[command(about = "Stream your screen and microphone to an RTMP ingest server", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the streaming console
    Stream(commands::StreamArgs),

    /// Manage the configuration file
    Config(commands::ConfigArgs),

    /// Show build features and the effective configuration
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("castwire_core={}", level).parse()?)
                .add_directive(format!("castwire={}", level).parse()?),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Stream(args) => commands::stream(args).await?,
        Commands::Config(args) => commands::config(args).await?,
        Commands::Info => commands::info().await?,
    }

    Ok(())
}

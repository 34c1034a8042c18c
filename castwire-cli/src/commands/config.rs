//! Config command - manage the configuration file

use anyhow::{Context, Result};
use castwire_core::config::{sample_config, ConfigFile};
use clap::{Args, Subcommand};

/// Arguments for the config command
#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show the path to the config file
    Path,

    /// Show the effective configuration, defaults filled in
    Show,

    /// Write the sample config file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Print the sample configuration to stdout
    Sample,
}

/// Run config subcommand
pub async fn config(args: ConfigArgs) -> Result<()> {
    let path = ConfigFile::default_path();

    match args.command {
        ConfigCommand::Path => {
            let status = if path.exists() { "exists" } else { "not created yet" };
            println!("{} ({})", path.display(), status);
        }
        ConfigCommand::Show => {
            let file = ConfigFile::load_from(&path).context("Failed to load config file")?;
            if path.exists() {
                println!("# {}\n", path.display());
            } else {
                println!("# No config file at {}; showing defaults\n", path.display());
            }
            print!("{}", file.to_toml_string().context("Failed to render config")?);
        }
        ConfigCommand::Init { force } => {
            if path.exists() && !force {
                println!("Configuration file already exists: {}", path.display());
                println!("Use --force to overwrite, or edit the existing file.");
                return Ok(());
            }
            if force && path.exists() {
                std::fs::remove_file(&path).context("Failed to replace config file")?;
            }
            ConfigFile::create_sample_if_missing(&path).context("Failed to write config file")?;

            println!("Created configuration file: {}", path.display());
            println!();
            println!("Set stream.ingest_url and stream_key (or export CASTWIRE_STREAM_KEY), then run:");
            println!("  castwire stream --start");
        }
        ConfigCommand::Sample => {
            print!("{}", sample_config());
        }
    }

    Ok(())
}

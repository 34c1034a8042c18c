//! Stream command - interactive streaming console

use anyhow::{Context, Result};
use castwire_core::config::{AudioCodecKind, AudioSourceKind, VideoCodecKind, VideoSourceKind};
use castwire_core::{ConfigFile, PipelineConfig, PipelineController, PipelineState, Preset};
use clap::Args;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::warn;

/// Arguments for the stream command
#[derive(Args)]
pub struct StreamArgs {
    /// Config file (defaults to ~/.config/castwire/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Ingest URL without the key, or a path ending in .flv to record locally
    #[arg(short, long)]
    url: Option<String>,

    /// Environment variable holding the stream key
    #[arg(long)]
    key_env: Option<String>,

    /// Output preset (480p30, 720p30, 720p60, 1080p30, 1080p60, WxH@FPS)
    #[arg(short, long)]
    preset: Option<String>,

    /// Video source (testpattern, screen)
    #[arg(long)]
    video_source: Option<String>,

    /// Audio source (synthetic, microphone)
    #[arg(long)]
    audio_source: Option<String>,

    /// Video codec (screenvideo, h264)
    #[arg(long)]
    video_codec: Option<String>,

    /// Audio codec (pcm, aac)
    #[arg(long)]
    audio_codec: Option<String>,

    /// Start streaming right away
    #[arg(short, long)]
    start: bool,
}

impl StreamArgs {
    fn to_config(&self) -> Result<PipelineConfig> {
        let file = match &self.config {
            Some(path) => ConfigFile::load_from(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => ConfigFile::load_or_default(),
        };
        let mut config = PipelineConfig::from_file(&file).context("Invalid configuration")?;

        if let Some(url) = &self.url {
            config.ingest_url = url.clone();
        }
        if let Some(var) = &self.key_env {
            config.stream_key = None;
            config.helix = None;
            config.stream_key_env = var.clone();
        }
        if let Some(preset) = &self.preset {
            let preset: Preset = preset.parse().map_err(|e: String| anyhow::anyhow!(e))?;
            config = config.with_preset(preset);
        }
        if let Some(source) = &self.video_source {
            config.video_source = source
                .parse::<VideoSourceKind>()
                .map_err(|e| anyhow::anyhow!(e))?;
        }
        if let Some(source) = &self.audio_source {
            config.audio_source = source
                .parse::<AudioSourceKind>()
                .map_err(|e| anyhow::anyhow!(e))?;
        }
        if let Some(codec) = &self.video_codec {
            config.video_codec = codec
                .parse::<VideoCodecKind>()
                .map_err(|e| anyhow::anyhow!(e))?;
        }
        if let Some(codec) = &self.audio_codec {
            config.audio_codec = codec
                .parse::<AudioCodecKind>()
                .map_err(|e| anyhow::anyhow!(e))?;
        }

        for warning in config.validate() {
            warn!("{}", warning);
        }
        config.validate_strict().context("Invalid configuration")?;
        Ok(config)
    }
}

/// Run the interactive console until `exit`, end of input or Ctrl+C
pub async fn stream(args: StreamArgs) -> Result<()> {
    let config = args.to_config()?;

    println!("Castwire - Streaming Console\n");
    println!("Configuration:");
    println!("  Destination: {}", config.ingest_url);
    println!("  Preset:      {}", config.preset);
    println!("  Video:       {} from {:?}", config.video_codec, config.video_source);
    println!(
        "  Audio:       {} from {:?} ({} Hz, {} ch)",
        config.audio_codec,
        config.audio_source,
        config.sample_rate,
        config.channels
    );
    println!();
    println!("Commands: start, stop, status, exit\n");

    let controller = PipelineController::new(config);
    tokio::spawn(report_faults(controller.clone()));

    if args.start {
        run_command(&controller, "start").await;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                println!("\nReceived interrupt signal...");
                break;
            }
            line = lines.next_line() => match line.context("Failed to read from stdin")? {
                Some(line) => {
                    if !run_command(&controller, line.trim()).await {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    println!("Shutting down...");
    controller.exit().await.context("Failed to stop the pipeline")?;
    println!("Stopped. {}", controller.metrics());
    Ok(())
}

/// Handle one console command; returns false when the console should close
async fn run_command(controller: &PipelineController, command: &str) -> bool {
    match command {
        "" => {}
        "start" => match controller.start().await {
            Ok(()) => println!("Streaming ({})", controller.state()),
            Err(e) => print_error(&e),
        },
        "stop" => match controller.stop().await {
            Ok(()) => println!("Stopped ({})", controller.state()),
            Err(e) => print_error(&e),
        },
        "status" => print_status(controller),
        "exit" | "quit" => return false,
        other => println!("Unknown command '{}'. Commands: start, stop, status, exit", other),
    }
    true
}

fn print_status(controller: &PipelineController) {
    println!("State:     {}", controller.state());
    println!("Transport: {}", controller.transport_state());
    println!("Workers:   {}", controller.active_workers());
    println!("Stats:     {}", controller.metrics());
    if let Some(fault) = controller.last_fault() {
        println!("Fault:     {} in {}", fault.error, fault.stage);
    }
}

fn print_error(error: &castwire_core::CastError) {
    println!("Error: {}", error);
    if let Some(hint) = error.user_hint() {
        println!("Hint:  {}", hint);
    }
}

async fn report_faults(controller: PipelineController) {
    let mut states = controller.subscribe();
    while let Some(state) = states.changed().await {
        if state != PipelineState::Faulted {
            continue;
        }
        match controller.last_fault() {
            Some(fault) => {
                println!("\nStream faulted in {}: {}", fault.stage, fault.error);
                if let Some(hint) = fault.error.user_hint() {
                    println!("Hint: {}", hint);
                }
            }
            None => println!("\nStream faulted"),
        }
        println!("Type 'start' to try again.");
    }
}

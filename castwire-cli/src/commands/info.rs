//! Info command - show build features and the effective configuration

use anyhow::{Context, Result};
use castwire_core::credentials::provider_for;
use castwire_core::{ConfigFile, Destination, PipelineConfig, StreamKeyProvider};

fn yes_no(enabled: bool) -> &'static str {
    if enabled { "yes" } else { "no" }
}

/// Show what this build can do and what `castwire stream` would use
pub async fn info() -> Result<()> {
    println!("Castwire {} - System Information\n", env!("CARGO_PKG_VERSION"));

    println!("Build features:");
    println!("  Screen capture (xcap):     {}", yes_no(cfg!(feature = "screen")));
    println!("  Microphone (cpal):         {}", yes_no(cfg!(feature = "microphone")));
    println!("  H.264 / AAC (FFmpeg):      {}", yes_no(cfg!(feature = "ffmpeg")));
    println!("  Always available:          test pattern, synthetic tone, Screen Video, PCM");
    println!();

    let path = ConfigFile::default_path();
    let file = ConfigFile::load_from(&path).context("Failed to load config file")?;
    let config = PipelineConfig::from_file(&file).context("Invalid configuration")?;

    println!("Configuration ({}):", path.display());
    println!("  Preset:      {} ({}x{} @ {}fps)", config.preset, config.width(), config.height(), config.fps());
    println!("  Video:       {} from {:?}, keyframe every {} frames", config.video_codec, config.video_source, config.keyframe_interval);
    println!(
        "  Audio:       {} from {:?}, {} Hz, {} ch, {} samples/block",
        config.audio_codec, config.audio_source, config.sample_rate, config.channels, config.block_size
    );
    println!(
        "  Queues:      video {}, audio {}, encoded {}, packets {}",
        config.video_queue, config.audio_queue, config.encoded_queue, config.packet_queue
    );
    println!("  Mux wait:    {:?}", config.mux_wait);
    println!("  Drain:       {:?}", config.drain_timeout);
    println!(
        "  Reconnect:   {} attempts, backoff {:?} .. {:?}, {:?} backlog ({} packets)",
        config.transport.max_retries,
        config.transport.initial_backoff,
        config.transport.max_backoff,
        config.transport.backlog,
        config.backlog_packets()
    );
    println!();

    println!("Destination:");
    let bare = Destination::new(config.ingest_url.as_str(), "");
    if bare.is_file() {
        println!("  Recording to FLV file {}", config.ingest_url);
    } else {
        match provider_for(&config).stream_key().await {
            Ok(key) => println!("  {}", Destination::new(config.ingest_url.as_str(), key).masked()),
            Err(e) => {
                println!("  {} (no stream key: {})", config.ingest_url, e);
                if let Some(hint) = e.user_hint() {
                    println!("  Hint: {}", hint);
                }
            }
        }
    }

    let mut problems = config.validate();
    if let Err(e) = config.validate_strict() {
        problems.insert(0, e.to_string());
    }
    if !problems.is_empty() {
        println!();
        println!("Warnings:");
        for problem in problems {
            println!("  - {}", problem);
        }
    }

    Ok(())
}

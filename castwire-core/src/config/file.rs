//! Configuration file loading and saving
//!
//! Loads user configuration from `~/.config/castwire/config.toml`

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{
    parse_resolution, AudioCodecKind, AudioSourceKind, HelixCredentials, PipelineConfig, Preset,
    TransportPolicy, VideoCodecKind, VideoSourceKind, DEFAULT_INGEST_URL, STREAM_KEY_ENV,
};
use crate::error::{CastError, Result};

/// Configuration file structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Destination settings
    #[serde(default)]
    pub stream: StreamSettings,

    /// Video capture and encoding
    #[serde(default)]
    pub video: VideoSettings,

    /// Audio capture and encoding
    #[serde(default)]
    pub audio: AudioSettings,

    /// Reconnect policy
    #[serde(default)]
    pub transport: TransportSettings,

    /// Queue sizes and timing
    #[serde(default)]
    pub pipeline: PipelineSettings,
}

/// Where the stream goes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSettings {
    /// Ingest URL without the key (rtmp://, file:// or a path ending in .flv)
    #[serde(default = "default_ingest_url")]
    pub ingest_url: String,

    /// Stream key (empty = read from `stream_key_env`)
    #[serde(default, alias = "twitch_stream_key")]
    pub stream_key: String,

    /// Environment variable holding the stream key
    #[serde(default = "default_stream_key_env")]
    pub stream_key_env: String,

    /// Twitch application client id; with `user_id` the key is fetched from Helix
    #[serde(default)]
    pub client_id: String,

    /// Twitch application client secret
    #[serde(default)]
    pub client_secret: String,

    /// Twitch user (broadcaster) id
    #[serde(default, alias = "broadcaster_id")]
    pub user_id: String,

    /// User access token with the `channel:read:stream_key` scope
    #[serde(default)]
    pub access_token: String,
}

impl StreamSettings {
    /// Helix credentials, if the table names a Twitch application
    fn helix_credentials(&self) -> Result<Option<HelixCredentials>> {
        let client_id = self.client_id.trim();
        let user_id = self.user_id.trim();
        let secret = self.client_secret.trim();
        let token = self.access_token.trim();

        if client_id.is_empty() {
            if !user_id.is_empty() || !secret.is_empty() || !token.is_empty() {
                return Err(CastError::config(
                    "stream.client_id is required for Twitch key lookup",
                ));
            }
            return Ok(None);
        }
        if user_id.is_empty() {
            return Err(CastError::config(
                "stream.user_id is required when stream.client_id is set",
            ));
        }
        if secret.is_empty() && token.is_empty() {
            return Err(CastError::config(
                "stream.client_secret or stream.access_token is required when stream.client_id is set",
            ));
        }

        let mut credentials = HelixCredentials::new(client_id, secret, user_id);
        if !token.is_empty() {
            credentials = credentials.with_access_token(token);
        }
        Ok(Some(credentials))
    }
}

/// Video settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoSettings {
    /// Video source: testpattern, screen
    #[serde(default)]
    pub source: VideoSourceKind,

    /// Display index for screen capture
    #[serde(default)]
    pub display: usize,

    /// Output resolution, e.g. "1280x720"
    #[serde(default = "default_resolution")]
    pub resolution: String,

    /// Frames per second
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,

    /// Named preset overriding resolution and frame_rate (e.g. "1080p30")
    #[serde(default)]
    pub preset: String,

    /// Video codec: screenvideo, h264
    #[serde(default)]
    pub codec: VideoCodecKind,

    /// Frames between keyframes (0 = two seconds)
    #[serde(default)]
    pub keyframe_interval: u32,

    /// Bitrate in kbps for codecs that use one
    #[serde(default = "default_video_bitrate")]
    pub bitrate: u32,
}

/// Audio settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioSettings {
    /// Audio source: synthetic, microphone
    #[serde(default)]
    pub source: AudioSourceKind,

    /// Sample rate in Hz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Channel count
    #[serde(default = "default_channels")]
    pub channels: u16,

    /// Samples per channel in one device block
    #[serde(default = "default_block_size")]
    pub block_size: u32,

    /// Audio codec: pcm, aac
    #[serde(default)]
    pub codec: AudioCodecKind,

    /// Bitrate in kbps for codecs that use one
    #[serde(default = "default_audio_bitrate")]
    pub bitrate: u32,
}

/// Reconnect settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportSettings {
    /// Consecutive failed attempts before the stream faults
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First reconnect delay in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum reconnect delay in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Seconds of stream kept while disconnected
    #[serde(default = "default_backlog_secs")]
    pub backlog_secs: u64,

    /// Connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Write timeout in milliseconds
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

/// Queue and timing settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Raw frame queue capacity
    #[serde(default = "default_video_queue")]
    pub video_queue: usize,

    /// Raw audio block queue capacity
    #[serde(default = "default_audio_queue")]
    pub audio_queue: usize,

    /// Encoded unit queue capacity
    #[serde(default = "default_encoded_queue")]
    pub encoded_queue: usize,

    /// Muxed packet queue capacity
    #[serde(default = "default_packet_queue")]
    pub packet_queue: usize,

    /// Muxer wait for a stalled stream in milliseconds
    #[serde(default = "default_mux_wait_ms")]
    pub mux_wait_ms: u64,

    /// Stop drain timeout in milliseconds
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// Units between stats log lines
    #[serde(default = "default_stats_interval")]
    pub stats_interval: u64,
}

fn default_ingest_url() -> String {
    DEFAULT_INGEST_URL.to_string()
}

fn default_stream_key_env() -> String {
    STREAM_KEY_ENV.to_string()
}

fn default_resolution() -> String {
    "1280x720".to_string()
}

fn default_frame_rate() -> u32 {
    30
}

fn default_video_bitrate() -> u32 {
    2500
}

fn default_sample_rate() -> u32 {
    44100
}

fn default_channels() -> u16 {
    1
}

fn default_block_size() -> u32 {
    4096
}

fn default_audio_bitrate() -> u32 {
    128
}

fn default_max_retries() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    250
}

fn default_max_backoff_ms() -> u64 {
    8000
}

fn default_backlog_secs() -> u64 {
    3
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_write_timeout_ms() -> u64 {
    2000
}

fn default_video_queue() -> usize {
    8
}

fn default_audio_queue() -> usize {
    16
}

fn default_encoded_queue() -> usize {
    32
}

fn default_packet_queue() -> usize {
    64
}

fn default_mux_wait_ms() -> u64 {
    250
}

fn default_drain_timeout_ms() -> u64 {
    3000
}

fn default_stats_interval() -> u64 {
    300
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            ingest_url: default_ingest_url(),
            stream_key: String::new(),
            stream_key_env: default_stream_key_env(),
            client_id: String::new(),
            client_secret: String::new(),
            user_id: String::new(),
            access_token: String::new(),
        }
    }
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            source: VideoSourceKind::default(),
            display: 0,
            resolution: default_resolution(),
            frame_rate: default_frame_rate(),
            preset: String::new(),
            codec: VideoCodecKind::default(),
            keyframe_interval: 0,
            bitrate: default_video_bitrate(),
        }
    }
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            source: AudioSourceKind::default(),
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            block_size: default_block_size(),
            codec: AudioCodecKind::default(),
            bitrate: default_audio_bitrate(),
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backlog_secs: default_backlog_secs(),
            connect_timeout_ms: default_connect_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            video_queue: default_video_queue(),
            audio_queue: default_audio_queue(),
            encoded_queue: default_encoded_queue(),
            packet_queue: default_packet_queue(),
            mux_wait_ms: default_mux_wait_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            stats_interval: default_stats_interval(),
        }
    }
}

impl ConfigFile {
    /// Get the default config file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("castwire").join("config.toml")
        } else if let Ok(home) = std::env::var("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("castwire")
                .join("config.toml")
        } else {
            PathBuf::from("/etc/castwire/config.toml")
        }
    }

    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        Self::load_from(Self::default_path())
    }

    /// Load configuration from a specific path
    ///
    /// A missing file yields the defaults.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| CastError::config(format!("Failed to read config file: {}", e)))?;

        let config = Self::parse(&content)?;
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| CastError::config(format!("Failed to parse config file: {}", e)))
    }

    /// Load configuration, logging warnings but returning defaults on error
    pub fn load_or_default() -> Self {
        match Self::load() {
            Ok(config) => config,
            Err(e) => {
                warn!("Failed to load config file: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the default path
    pub fn save(&self) -> Result<()> {
        self.save_to(Self::default_path())
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    CastError::config(format!("Failed to create config directory: {}", e))
                })?;
            }
        }

        std::fs::write(path, self.to_toml_string()?)
            .map_err(|e| CastError::config(format!("Failed to write config file: {}", e)))?;

        info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Serialize to TOML text
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| CastError::config(format!("Failed to serialize config: {}", e)))
    }

    /// Write the sample config to `path` if nothing exists there yet
    ///
    /// Returns whether a file was created.
    pub fn create_sample_if_missing(path: impl AsRef<Path>) -> Result<bool> {
        let path = path.as_ref();
        if path.exists() {
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    CastError::config(format!("Failed to create config directory: {}", e))
                })?;
            }
        }
        std::fs::write(path, sample_config())
            .map_err(|e| CastError::config(format!("Failed to write config file: {}", e)))?;
        Ok(true)
    }

    /// Resolve into a runtime pipeline config
    pub fn to_pipeline_config(&self) -> Result<PipelineConfig> {
        let preset = if self.video.preset.trim().is_empty() {
            let (width, height) =
                parse_resolution(&self.video.resolution).map_err(CastError::config)?;
            Preset::Custom {
                width,
                height,
                fps: self.video.frame_rate,
            }
        } else {
            self.video
                .preset
                .parse::<Preset>()
                .map_err(CastError::config)?
        };

        let keyframe_interval = if self.video.keyframe_interval == 0 {
            preset.fps().max(1) * 2
        } else {
            self.video.keyframe_interval
        };

        let stream_key = Some(self.stream.stream_key.trim())
            .filter(|key| !key.is_empty())
            .map(str::to_string);

        let config = PipelineConfig {
            helix: self.stream.helix_credentials()?,
            ingest_url: self.stream.ingest_url.clone(),
            stream_key,
            stream_key_env: self.stream.stream_key_env.clone(),
            video_source: self.video.source,
            display: self.video.display,
            preset,
            video_codec: self.video.codec,
            keyframe_interval,
            video_bitrate: self.video.bitrate,
            audio_source: self.audio.source,
            sample_rate: self.audio.sample_rate,
            channels: self.audio.channels,
            block_size: self.audio.block_size,
            audio_codec: self.audio.codec,
            audio_bitrate: self.audio.bitrate,
            video_queue: self.pipeline.video_queue,
            audio_queue: self.pipeline.audio_queue,
            encoded_queue: self.pipeline.encoded_queue,
            packet_queue: self.pipeline.packet_queue,
            mux_wait: Duration::from_millis(self.pipeline.mux_wait_ms),
            drain_timeout: Duration::from_millis(self.pipeline.drain_timeout_ms),
            stats_interval: self.pipeline.stats_interval,
            transport: TransportPolicy {
                max_retries: self.transport.max_retries,
                initial_backoff: Duration::from_millis(self.transport.initial_backoff_ms),
                max_backoff: Duration::from_millis(self.transport.max_backoff_ms),
                backlog: Duration::from_secs(self.transport.backlog_secs),
                connect_timeout: Duration::from_millis(self.transport.connect_timeout_ms),
                write_timeout: Duration::from_millis(self.transport.write_timeout_ms),
            },
        };

        for warning in config.validate() {
            warn!("{}", warning);
        }
        config.validate_strict()?;
        Ok(config)
    }
}

/// Generate a sample configuration file
pub fn sample_config() -> String {
    r#"# castwire configuration

[stream]
# Ingest URL without the stream key. rtmp://host/app, file:///path/out.flv
# or a plain path ending in .flv for local recording
ingest_url = "rtmp://live.twitch.tv/app"

# Stream key. Leave empty to read it from the environment variable below
stream_key = ""
stream_key_env = "CASTWIRE_STREAM_KEY"

# Fetch the stream key from the Twitch API instead. Needs the application
# client id, the broadcaster's user id and either the client secret or a user
# access token with the channel:read:stream_key scope
client_id = ""
client_secret = ""
user_id = ""
access_token = ""

[video]
# Video source: testpattern, screen
source = "testpattern"

# Display index for screen capture
display = 0

# Output resolution and frame rate
resolution = "1280x720"
frame_rate = 30

# Named preset overriding the two above: 480p30, 720p30, 720p60, 1080p30, 1080p60
preset = ""

# Video codec: screenvideo, h264 (h264 requires the ffmpeg build)
codec = "screenvideo"

# Frames between keyframes (0 = two seconds)
keyframe_interval = 0

# Bitrate in kbps (h264 only)
bitrate = 2500

[audio]
# Audio source: synthetic, microphone
source = "synthetic"

sample_rate = 44100
channels = 1

# Samples per channel delivered per device callback
block_size = 4096

# Audio codec: pcm, aac (aac requires the ffmpeg build)
codec = "pcm"

# Bitrate in kbps (aac only)
bitrate = 128

[transport]
# Consecutive failed reconnect attempts before the stream stops with an error
max_retries = 5

# Reconnect delay starts here and doubles up to max_backoff_ms (+/-20% jitter)
initial_backoff_ms = 250
max_backoff_ms = 8000

# Seconds of stream buffered while disconnected
backlog_secs = 3

connect_timeout_ms = 5000
write_timeout_ms = 2000

[pipeline]
# Queue capacities between stages
video_queue = 8
audio_queue = 16
encoded_queue = 32
packet_queue = 64

# How long the muxer waits for a stalled stream before sending the other alone
mux_wait_ms = 250

# How long stop waits for in-flight data to reach the transport
drain_timeout_ms = 3000

# Packets between stats log lines
stats_interval = 300
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ConfigFile::default();
        assert_eq!(config.stream.ingest_url, "rtmp://live.twitch.tv/app");
        assert_eq!(config.video.frame_rate, 30);
        assert_eq!(config.audio.block_size, 4096);
    }

    #[test]
    fn test_sample_config_parses() {
        let config = ConfigFile::parse(&sample_config()).unwrap();
        assert_eq!(config, ConfigFile::default());
    }

    #[test]
    fn test_legacy_stream_key_alias() {
        let config = ConfigFile::parse(
            r#"
[stream]
twitch_stream_key = "live_123"
"#,
        )
        .unwrap();
        assert_eq!(config.stream.stream_key, "live_123");
        let pipeline = config.to_pipeline_config().unwrap();
        assert_eq!(pipeline.stream_key.as_deref(), Some("live_123"));
    }

    #[test]
    fn test_twitch_credentials_resolve() {
        let config = ConfigFile::parse(
            r#"
[stream]
client_id = "abc"
client_secret = "shh"
broadcaster_id = "1234"
"#,
        )
        .unwrap();
        let pipeline = config.to_pipeline_config().unwrap();
        let helix = pipeline.helix.unwrap();
        assert_eq!(helix.client_id, "abc");
        assert_eq!(helix.user_id, "1234");
        assert_eq!(helix.access_token, None);
        assert_eq!(helix.api_url, crate::config::HELIX_API_URL);
        assert!(!format!("{:?}", helix).contains("shh"));
        assert_eq!(pipeline.stream_key, None);
    }

    #[test]
    fn test_partial_twitch_credentials_rejected() {
        let mut config = ConfigFile::default();
        config.stream.client_id = "abc".to_string();
        config.stream.client_secret = "shh".to_string();
        assert!(matches!(config.to_pipeline_config(), Err(CastError::Config(_))));

        config.stream.user_id = "1234".to_string();
        config.stream.client_secret.clear();
        assert!(config.to_pipeline_config().is_err());

        config.stream.access_token = "user-token".to_string();
        let helix = config.to_pipeline_config().unwrap().helix.unwrap();
        assert_eq!(helix.access_token.as_deref(), Some("user-token"));

        let mut orphan = ConfigFile::default();
        orphan.stream.user_id = "1234".to_string();
        assert!(orphan.to_pipeline_config().is_err());
    }

    #[test]
    fn test_preset_overrides_resolution() {
        let mut config = ConfigFile::default();
        config.video.preset = "1080p60".to_string();
        let pipeline = config.to_pipeline_config().unwrap();
        assert_eq!(pipeline.width(), 1920);
        assert_eq!(pipeline.fps(), 60);
        assert_eq!(pipeline.keyframe_interval, 120);
    }
}

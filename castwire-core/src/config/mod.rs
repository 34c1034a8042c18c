//! Configuration types for castwire
//!
//! Provides resolution presets, codec and source selection, transport policy
//! and the runtime [`PipelineConfig`] consumed once per `start`.

mod file;

pub use file::{sample_config, ConfigFile};

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{CastError, Result};

/// Default ingest endpoint; the stream key is appended as the last path segment
pub const DEFAULT_INGEST_URL: &str = "rtmp://live.twitch.tv/app";

/// Environment variable consulted for the stream key when none is configured
pub const STREAM_KEY_ENV: &str = "CASTWIRE_STREAM_KEY";

/// Twitch OAuth endpoint used to obtain an app access token
pub const HELIX_AUTH_URL: &str = "https://id.twitch.tv/oauth2";

/// Twitch Helix API root
pub const HELIX_API_URL: &str = "https://api.twitch.tv/helix";

/// Video codec for encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodecKind {
    /// FLV Screen Video (built in, no system libraries)
    #[default]
    #[serde(rename = "screenvideo")]
    ScreenVideo,
    /// H.264 through libx264 (requires the `ffmpeg` feature)
    H264,
}

impl VideoCodecKind {
    /// Codec name for display
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::ScreenVideo => "Screen Video",
            Self::H264 => "H.264",
        }
    }
}

impl std::fmt::Display for VideoCodecKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

impl std::str::FromStr for VideoCodecKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "screenvideo" | "screen" | "flashsv" => Ok(Self::ScreenVideo),
            "h264" | "avc" | "264" => Ok(Self::H264),
            _ => Err(format!("Unknown video codec: {}", s)),
        }
    }
}

/// Audio codec for encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodecKind {
    /// Linear PCM, 16-bit little endian (built in)
    #[default]
    Pcm,
    /// AAC through FFmpeg (requires the `ffmpeg` feature)
    Aac,
}

impl std::fmt::Display for AudioCodecKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pcm => write!(f, "PCM"),
            Self::Aac => write!(f, "AAC"),
        }
    }
}

impl std::str::FromStr for AudioCodecKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pcm" | "s16le" => Ok(Self::Pcm),
            "aac" => Ok(Self::Aac),
            _ => Err(format!("Unknown audio codec: {}", s)),
        }
    }
}

/// Where video frames come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VideoSourceKind {
    /// Generated moving test pattern
    #[default]
    #[serde(rename = "testpattern")]
    TestPattern,
    /// A physical display (requires the `screen` feature)
    Screen,
}

impl std::str::FromStr for VideoSourceKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "testpattern" | "test" | "pattern" => Ok(Self::TestPattern),
            "screen" | "display" | "monitor" => Ok(Self::Screen),
            _ => Err(format!("Unknown video source: {}", s)),
        }
    }
}

/// Where audio blocks come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AudioSourceKind {
    /// Generated sine tone
    #[default]
    Synthetic,
    /// Default input device (requires the `microphone` feature)
    Microphone,
}

impl std::str::FromStr for AudioSourceKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "synthetic" | "tone" | "sine" => Ok(Self::Synthetic),
            "microphone" | "mic" => Ok(Self::Microphone),
            _ => Err(format!("Unknown audio source: {}", s)),
        }
    }
}

/// Output resolution/framerate preset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Preset {
    /// 854x480 @ 30fps
    P480_30,
    /// 1280x720 @ 30fps (default)
    #[default]
    P720_30,
    /// 1280x720 @ 60fps
    P720_60,
    /// 1920x1080 @ 30fps
    P1080_30,
    /// 1920x1080 @ 60fps
    P1080_60,
    /// Custom resolution/framerate
    Custom { width: u32, height: u32, fps: u32 },
}

impl Preset {
    /// Width in pixels
    pub fn width(&self) -> u32 {
        match self {
            Self::P480_30 => 854,
            Self::P720_30 | Self::P720_60 => 1280,
            Self::P1080_30 | Self::P1080_60 => 1920,
            Self::Custom { width, .. } => *width,
        }
    }

    /// Height in pixels
    pub fn height(&self) -> u32 {
        match self {
            Self::P480_30 => 480,
            Self::P720_30 | Self::P720_60 => 720,
            Self::P1080_30 | Self::P1080_60 => 1080,
            Self::Custom { height, .. } => *height,
        }
    }

    /// Framerate
    pub fn fps(&self) -> u32 {
        match self {
            Self::P480_30 | Self::P720_30 | Self::P1080_30 => 30,
            Self::P720_60 | Self::P1080_60 => 60,
            Self::Custom { fps, .. } => *fps,
        }
    }
}

impl std::fmt::Display for Preset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::P480_30 => write!(f, "480p30"),
            Self::P720_30 => write!(f, "720p30"),
            Self::P720_60 => write!(f, "720p60"),
            Self::P1080_30 => write!(f, "1080p30"),
            Self::P1080_60 => write!(f, "1080p60"),
            Self::Custom { width, height, fps } => write!(f, "{}x{}@{}", width, height, fps),
        }
    }
}

impl std::str::FromStr for Preset {
    type Err = String;

    /// Accepts named presets (`1080p30`) and `WIDTHxHEIGHT@FPS`
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "480p30" => Ok(Self::P480_30),
            "720p30" => Ok(Self::P720_30),
            "720p60" => Ok(Self::P720_60),
            "1080p30" => Ok(Self::P1080_30),
            "1080p60" => Ok(Self::P1080_60),
            other => {
                let (res, fps) = other
                    .split_once('@')
                    .ok_or_else(|| format!("Unknown preset: {}", s))?;
                let (width, height) = parse_resolution(res)?;
                let fps = fps
                    .parse()
                    .map_err(|_| format!("Invalid framerate in preset: {}", s))?;
                Ok(Self::Custom { width, height, fps })
            }
        }
    }
}

/// Parse a resolution string such as `"1920x1080"` or `"720p"`
pub fn parse_resolution(s: &str) -> std::result::Result<(u32, u32), String> {
    let s = s.trim().to_lowercase();
    match s.as_str() {
        "480p" => return Ok((854, 480)),
        "720p" => return Ok((1280, 720)),
        "1080p" => return Ok((1920, 1080)),
        _ => {}
    }
    let (w, h) = s
        .split_once('x')
        .ok_or_else(|| format!("Invalid resolution: {}", s))?;
    let width = w
        .trim()
        .parse()
        .map_err(|_| format!("Invalid width in resolution: {}", s))?;
    let height = h
        .trim()
        .parse()
        .map_err(|_| format!("Invalid height in resolution: {}", s))?;
    Ok((width, height))
}

/// Reconnect and buffering policy for the transport
#[derive(Debug, Clone, PartialEq)]
pub struct TransportPolicy {
    /// Consecutive failed connection attempts before giving up
    pub max_retries: u32,
    /// First reconnect delay
    pub initial_backoff: Duration,
    /// Upper bound on the reconnect delay
    pub max_backoff: Duration,
    /// Seconds worth of packets kept while disconnected
    pub backlog: Duration,
    /// Timeout for establishing a connection (including the RTMP handshake)
    pub connect_timeout: Duration,
    /// Timeout for a single packet write
    pub write_timeout: Duration,
}

impl Default for TransportPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(8),
            backlog: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(2),
        }
    }
}

/// Twitch application credentials for looking up the stream key remotely
#[derive(Clone, PartialEq, Eq)]
pub struct HelixCredentials {
    /// Application client id
    pub client_id: String,
    /// Application client secret, exchanged for an app access token
    pub client_secret: String,
    /// Numeric id of the broadcasting user
    pub user_id: String,
    /// User access token with the `channel:read:stream_key` scope; skips the
    /// client secret exchange when set
    pub access_token: Option<String>,
    /// OAuth root, normally [`HELIX_AUTH_URL`]
    pub auth_url: String,
    /// API root, normally [`HELIX_API_URL`]
    pub api_url: String,
}

impl HelixCredentials {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            user_id: user_id.into(),
            access_token: None,
            auth_url: HELIX_AUTH_URL.to_string(),
            api_url: HELIX_API_URL.to_string(),
        }
    }

    /// Use an existing user access token
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Point at different OAuth and API roots
    pub fn with_endpoints(mut self, auth_url: impl Into<String>, api_url: impl Into<String>) -> Self {
        self.auth_url = auth_url.into().trim_end_matches('/').to_string();
        self.api_url = api_url.into().trim_end_matches('/').to_string();
        self
    }
}

impl std::fmt::Debug for HelixCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HelixCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"****")
            .field("user_id", &self.user_id)
            .field("access_token", &self.access_token.as_ref().map(|_| "****"))
            .field("auth_url", &self.auth_url)
            .field("api_url", &self.api_url)
            .finish()
    }
}

/// Complete pipeline configuration
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Ingest URL without the stream key
    pub ingest_url: String,
    /// Explicit stream key; when `None` the key is read from `stream_key_env`
    pub stream_key: Option<String>,
    /// Environment variable holding the stream key
    pub stream_key_env: String,
    /// Fetch the key from Twitch instead of the environment
    pub helix: Option<HelixCredentials>,
    /// Video source
    pub video_source: VideoSourceKind,
    /// Display index for screen capture
    pub display: usize,
    /// Output preset (resolution/framerate)
    pub preset: Preset,
    /// Video codec
    pub video_codec: VideoCodecKind,
    /// Frames between forced keyframes
    pub keyframe_interval: u32,
    /// Video bitrate in kbps for codecs that use one
    pub video_bitrate: u32,
    /// Audio source
    pub audio_source: AudioSourceKind,
    /// Audio sample rate in Hz
    pub sample_rate: u32,
    /// Audio channel count
    pub channels: u16,
    /// Samples per channel in one device block
    pub block_size: u32,
    /// Audio codec
    pub audio_codec: AudioCodecKind,
    /// Audio bitrate in kbps for codecs that use one
    pub audio_bitrate: u32,
    /// Raw frame queue capacity
    pub video_queue: usize,
    /// Raw audio block queue capacity
    pub audio_queue: usize,
    /// Encoded unit queue capacity (per kind)
    pub encoded_queue: usize,
    /// Muxed packet queue capacity
    pub packet_queue: usize,
    /// How long the muxer waits for the missing kind before emitting alone
    pub mux_wait: Duration,
    /// Upper bound on the stop drain
    pub drain_timeout: Duration,
    /// Units between periodic stats log lines
    pub stats_interval: u64,
    /// Reconnect and buffering policy
    pub transport: TransportPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let preset = Preset::default();
        Self {
            ingest_url: DEFAULT_INGEST_URL.to_string(),
            stream_key: None,
            stream_key_env: STREAM_KEY_ENV.to_string(),
            helix: None,
            video_source: VideoSourceKind::default(),
            display: 0,
            preset,
            video_codec: VideoCodecKind::default(),
            keyframe_interval: preset.fps() * 2,
            video_bitrate: 2500,
            audio_source: AudioSourceKind::default(),
            sample_rate: 44100,
            channels: 1,
            block_size: 4096,
            audio_codec: AudioCodecKind::default(),
            audio_bitrate: 128,
            video_queue: 8,
            audio_queue: 16,
            encoded_queue: 32,
            packet_queue: 64,
            mux_wait: Duration::from_millis(250),
            drain_timeout: Duration::from_secs(3),
            stats_interval: 300,
            transport: TransportPolicy::default(),
        }
    }
}

impl PipelineConfig {
    /// Build a runtime config from a loaded config file
    pub fn from_file(file: &ConfigFile) -> Result<Self> {
        file.to_pipeline_config()
    }

    /// Set the ingest URL
    pub fn with_ingest_url(mut self, url: impl Into<String>) -> Self {
        self.ingest_url = url.into();
        self
    }

    /// Set an explicit stream key
    pub fn with_stream_key(mut self, key: impl Into<String>) -> Self {
        self.stream_key = Some(key.into());
        self
    }

    /// Set the output preset; the keyframe interval follows at two seconds
    pub fn with_preset(mut self, preset: Preset) -> Self {
        self.preset = preset;
        self.keyframe_interval = preset.fps().max(1) * 2;
        self
    }

    /// Set the keyframe interval in frames
    pub fn with_keyframe_interval(mut self, frames: u32) -> Self {
        self.keyframe_interval = frames;
        self
    }

    /// Set the audio device shape
    pub fn with_audio_format(mut self, sample_rate: u32, channels: u16, block_size: u32) -> Self {
        self.sample_rate = sample_rate;
        self.channels = channels;
        self.block_size = block_size;
        self
    }

    /// Set the muxer wait
    pub fn with_mux_wait(mut self, wait: Duration) -> Self {
        self.mux_wait = wait;
        self
    }

    /// Set the drain timeout
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Set the transport policy
    pub fn with_transport(mut self, transport: TransportPolicy) -> Self {
        self.transport = transport;
        self
    }

    /// Output width
    pub fn width(&self) -> u32 {
        self.preset.width()
    }

    /// Output height
    pub fn height(&self) -> u32 {
        self.preset.height()
    }

    /// Output framerate
    pub fn fps(&self) -> u32 {
        self.preset.fps()
    }

    /// Time between video frames
    pub fn frame_period(&self) -> Duration {
        Duration::from_secs(1) / self.fps().max(1)
    }

    /// Duration of one audio device block
    pub fn block_duration(&self) -> Duration {
        crate::types::samples_to_duration(self.block_size as u64, self.sample_rate)
    }

    /// Number of packets the transport backlog may hold
    ///
    /// Sized from the combined video and audio cadence so the backlog covers
    /// `transport.backlog` of stream time.
    pub fn backlog_packets(&self) -> usize {
        let secs = self.transport.backlog.as_secs_f64();
        let video = self.fps() as f64;
        let audio = if self.block_size == 0 {
            0.0
        } else {
            self.sample_rate as f64 / self.block_size as f64
        };
        ((secs * (video + audio)).ceil() as usize).max(1)
    }

    /// Validate the configuration and return any warnings
    ///
    /// An empty list means the configuration looks good.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.fps() > 60 {
            warnings.push(format!(
                "{}fps exceeds what most ingest servers accept (60fps)",
                self.fps()
            ));
        }

        if self.mux_wait > Duration::from_secs(1) {
            warnings.push(format!(
                "mux_wait of {:?} adds that much latency whenever one stream stalls",
                self.mux_wait
            ));
        }

        if self.keyframe_interval > self.fps() * 4 {
            warnings.push(format!(
                "Keyframe interval of {} frames is longer than 4 seconds; reconnects will resume slowly",
                self.keyframe_interval
            ));
        }

        if self.block_duration() > Duration::from_millis(200) {
            warnings.push(format!(
                "Audio blocks of {} samples at {} Hz are longer than 200ms",
                self.block_size, self.sample_rate
            ));
        }

        warnings
    }

    /// Validate and return an error if the configuration cannot work
    pub fn validate_strict(&self) -> Result<()> {
        if self.width() == 0 || self.height() == 0 {
            return Err(CastError::config("Resolution cannot be zero"));
        }

        if self.width() > 7680 || self.height() > 4320 {
            return Err(CastError::config(format!(
                "Resolution {}x{} exceeds maximum supported (7680x4320)",
                self.width(),
                self.height()
            )));
        }

        if self.fps() == 0 {
            return Err(CastError::config("Framerate cannot be zero"));
        }

        if self.fps() > 240 {
            return Err(CastError::config(format!(
                "Framerate {} exceeds maximum supported (240)",
                self.fps()
            )));
        }

        if self.keyframe_interval == 0 {
            return Err(CastError::config("Keyframe interval cannot be zero"));
        }

        if self.sample_rate == 0 || self.channels == 0 || self.block_size == 0 {
            return Err(CastError::config(
                "Audio sample rate, channels and block size must be non-zero",
            ));
        }

        if self.video_queue == 0
            || self.audio_queue == 0
            || self.encoded_queue == 0
            || self.packet_queue == 0
        {
            return Err(CastError::config("Queue capacities must be non-zero"));
        }

        if self.ingest_url.trim().is_empty() {
            return Err(CastError::config("Ingest URL cannot be empty"));
        }

        if self.transport.initial_backoff.is_zero()
            || self.transport.max_backoff < self.transport.initial_backoff
        {
            return Err(CastError::config(
                "max_backoff must be at least initial_backoff, which must be non-zero",
            ));
        }

        Ok(())
    }
}

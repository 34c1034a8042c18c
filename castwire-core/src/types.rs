//! Core types for castwire
//!
//! These are the units that flow between pipeline stages. Every unit is moved
//! into the next stage's queue; no stage keeps a reference to a unit it has
//! handed off.

use bytes::Bytes;
use std::time::Duration;

/// Pixel layout of a captured frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelFormat {
    /// 8-bit BGRA, 4 bytes per pixel
    #[default]
    Bgra,
    /// 8-bit RGBA, 4 bytes per pixel
    Rgba,
}

impl PixelFormat {
    /// Byte offsets of the (red, green, blue) channels within a pixel
    pub fn rgb_offsets(&self) -> (usize, usize, usize) {
        match self {
            Self::Bgra => (2, 1, 0),
            Self::Rgba => (0, 1, 2),
        }
    }
}

/// Frame format information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFormat {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Pixel layout
    pub pixel_format: PixelFormat,
    /// Stride in bytes
    pub stride: u32,
}

impl FrameFormat {
    /// Tightly packed 4-byte-per-pixel format
    pub fn packed(width: u32, height: u32, pixel_format: PixelFormat) -> Self {
        Self {
            width,
            height,
            pixel_format,
            stride: width * 4,
        }
    }

    /// Expected buffer size in bytes
    pub fn buffer_len(&self) -> usize {
        self.stride as usize * self.height as usize
    }
}

/// Raw image as returned by a frame grabber, before timestamping
#[derive(Debug)]
pub struct RawImage {
    /// Image format
    pub format: FrameFormat,
    /// Pixel data
    pub data: Vec<u8>,
}

/// A raw video frame captured from the display
#[derive(Debug)]
pub struct CapturedFrame {
    /// Frame format
    pub format: FrameFormat,
    /// Pixel data
    pub data: Vec<u8>,
    /// Capture time relative to the pipeline clock
    pub captured_at: Duration,
    /// Per-source sequence number
    pub sequence: u64,
}

/// A block of raw audio samples delivered by the capture device
#[derive(Debug)]
pub struct CapturedAudioBlock {
    /// Interleaved samples
    pub samples: Vec<f32>,
    /// Samples per channel
    pub sample_count: u32,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of interleaved channels
    pub channels: u16,
    /// Capture time relative to the pipeline clock
    pub captured_at: Duration,
    /// Per-source sequence number
    pub sequence: u64,
}

impl CapturedAudioBlock {
    /// Playback duration of this block
    pub fn duration(&self) -> Duration {
        samples_to_duration(self.sample_count as u64, self.sample_rate)
    }
}

/// Convert a per-channel sample count to a duration
pub fn samples_to_duration(samples: u64, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(samples * 1_000_000_000 / sample_rate as u64)
}

/// Elementary stream kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Compressed video
    Video,
    /// Compressed audio
    Audio,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Video => write!(f, "video"),
            Self::Audio => write!(f, "audio"),
        }
    }
}

/// A compressed unit produced by an encoder
#[derive(Debug, Clone)]
pub struct EncodedUnit {
    /// Stream kind
    pub kind: StreamKind,
    /// Compressed payload
    pub payload: Bytes,
    /// Presentation timestamp
    pub pts: Duration,
    /// Decode timestamp
    pub dts: Duration,
    /// Keyframe flag (always false for audio)
    pub keyframe: bool,
    /// Sequence number of the capture unit this was encoded from
    pub sequence: u64,
}

/// An encoded unit wrapped with container header fields
#[derive(Debug, Clone)]
pub struct MuxedPacket {
    /// Container stream id (FLV tag type: 8 = audio, 9 = video)
    pub stream_id: u8,
    /// Stream kind
    pub kind: StreamKind,
    /// Container timestamp in milliseconds (decode order)
    pub timestamp_ms: u32,
    /// Composition offset in milliseconds (pts - dts)
    pub composition_offset_ms: i32,
    /// Keyframe flag
    pub keyframe: bool,
    /// Payload size in bytes
    pub payload_size: u32,
    /// Compressed payload
    pub payload: Bytes,
}

impl MuxedPacket {
    /// FLV tag type for audio data
    pub const AUDIO_STREAM_ID: u8 = 8;
    /// FLV tag type for video data
    pub const VIDEO_STREAM_ID: u8 = 9;

    /// Wrap an encoded unit, re-basing its timestamps to the millisecond
    /// container clock
    pub fn wrap(unit: EncodedUnit) -> Self {
        let timestamp_ms = unit.dts.as_millis().min(u32::MAX as u128) as u32;
        let pts_ms = unit.pts.as_millis().min(u32::MAX as u128) as i64;
        let stream_id = match unit.kind {
            StreamKind::Video => Self::VIDEO_STREAM_ID,
            StreamKind::Audio => Self::AUDIO_STREAM_ID,
        };
        Self {
            stream_id,
            kind: unit.kind,
            timestamp_ms,
            composition_offset_ms: (pts_ms - timestamp_ms as i64) as i32,
            keyframe: unit.keyframe,
            payload_size: unit.payload.len() as u32,
            payload: unit.payload,
        }
    }

    /// Whether this packet starts a decodable video sequence
    pub fn is_video_keyframe(&self) -> bool {
        self.kind == StreamKind::Video && self.keyframe
    }
}

/// Video track description sent ahead of the first video tag
#[derive(Debug, Clone, PartialEq)]
pub struct VideoTrack {
    /// FLV video codec id (3 = Screen Video, 7 = AVC)
    pub codec_id: u8,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Frames per second
    pub fps: u32,
    /// Nominal bitrate in kbps (0 = unknown)
    pub bitrate_kbps: u32,
    /// Decoder configuration record, for codecs that need one
    pub sequence_header: Option<Bytes>,
}

/// Audio track description sent ahead of the first audio tag
#[derive(Debug, Clone, PartialEq)]
pub struct AudioTrack {
    /// FLV sound format (3 = linear PCM little endian, 10 = AAC)
    pub sound_format: u8,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Channel count
    pub channels: u16,
    /// Nominal bitrate in kbps (0 = unknown)
    pub bitrate_kbps: u32,
    /// AudioSpecificConfig, for codecs that need one
    pub sequence_header: Option<Bytes>,
}

/// Everything a connection needs to describe the stream on (re)connect
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub video: VideoTrack,
    pub audio: AudioTrack,
}

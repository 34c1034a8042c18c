//! Video and audio encoding
//!
//! This module provides:
//! - The [`VideoCodec`] / [`AudioCodec`] traits encoder backends implement
//! - Encoder worker loops with keyframe forcing and timestamp sync
//! - Built-in FLV Screen Video and linear PCM codecs
//! - H.264 and AAC through FFmpeg (`ffmpeg` feature)

#[cfg(any(feature = "ffmpeg", test))]
mod avc;
#[cfg(feature = "ffmpeg")]
mod ffmpeg;
mod pcm;
mod screen_video;
mod sync;
mod worker;

#[cfg(feature = "ffmpeg")]
pub use ffmpeg::{AacCodec, X264Codec};
pub use pcm::PcmCodec;
pub use screen_video::ScreenVideoCodec;
pub use sync::{AudioTimeline, VideoTimeline};
pub use worker::{AudioEncoder, VideoEncoder};

use bytes::Bytes;

use crate::config::{AudioCodecKind, PipelineConfig, VideoCodecKind};
use crate::error::Result;
use crate::types::{AudioTrack, CapturedAudioBlock, CapturedFrame, VideoTrack};

/// One compressed video frame
#[derive(Debug, Clone)]
pub struct VideoPayload {
    /// Codec bitstream for this frame
    pub data: Bytes,
    /// Whether the frame decodes on its own
    pub keyframe: bool,
}

/// One compressed audio frame
#[derive(Debug, Clone)]
pub struct AudioPayload {
    /// Codec bitstream for this frame
    pub data: Bytes,
    /// Samples per channel this frame covers
    pub samples: u32,
}

/// A video compressor
pub trait VideoCodec: Send {
    /// Compress one frame
    ///
    /// Returns `None` when the codec buffered the frame without producing
    /// output yet. When `force_keyframe` is set the output must be a keyframe.
    fn encode(&mut self, frame: &CapturedFrame, force_keyframe: bool)
    -> Result<Option<VideoPayload>>;

    /// Track description, including any sequence header
    fn track(&self) -> VideoTrack;

    /// Codec name for logs
    fn name(&self) -> &'static str;
}

/// An audio compressor
///
/// Codecs with a fixed frame size (AAC) may return several frames for one
/// block, or none while they fill their first frame.
pub trait AudioCodec: Send {
    /// Compress one block
    fn encode(&mut self, block: &CapturedAudioBlock) -> Result<Vec<AudioPayload>>;

    /// Track description, including any sequence header
    fn track(&self) -> AudioTrack;

    /// Codec name for logs
    fn name(&self) -> &'static str;
}

/// Build the video codec a config asks for
pub fn video_codec_for(config: &PipelineConfig) -> Result<Box<dyn VideoCodec>> {
    match config.video_codec {
        VideoCodecKind::ScreenVideo => Ok(Box::new(ScreenVideoCodec::new(
            config.width(),
            config.height(),
            config.fps(),
        ))),
        #[cfg(feature = "ffmpeg")]
        VideoCodecKind::H264 => Ok(Box::new(X264Codec::new(config)?)),
        #[cfg(not(feature = "ffmpeg"))]
        VideoCodecKind::H264 => Err(crate::error::CastError::init(
            "H.264 encoding requires castwire built with the `ffmpeg` feature",
        )),
    }
}

/// Build the audio codec a config asks for
pub fn audio_codec_for(config: &PipelineConfig) -> Result<Box<dyn AudioCodec>> {
    match config.audio_codec {
        AudioCodecKind::Pcm => Ok(Box::new(PcmCodec::new(config.sample_rate, config.channels))),
        #[cfg(feature = "ffmpeg")]
        AudioCodecKind::Aac => Ok(Box::new(AacCodec::new(config)?)),
        #[cfg(not(feature = "ffmpeg"))]
        AudioCodecKind::Aac => Err(crate::error::CastError::init(
            "AAC encoding requires castwire built with the `ffmpeg` feature",
        )),
    }
}

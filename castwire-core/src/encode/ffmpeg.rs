//! H.264 and AAC through FFmpeg
//!
//! Both encoders run with zero added latency: x264 with `tune=zerolatency`
//! and no B-frames, so every frame in produces one access unit out with
//! `pts == dts`.

use bytes::Bytes;
use ffmpeg_next as ffmpeg;
use ffmpeg_next::codec::{self, encoder};
use ffmpeg_next::format::{sample, Pixel, Sample};
use ffmpeg_next::software::scaling::{self, Flags};
use ffmpeg_next::util::frame::audio::Audio;
use ffmpeg_next::util::frame::video::Video;
use ffmpeg_next::{ChannelLayout, Dictionary, Rational};
use std::collections::VecDeque;
use tracing::{debug, info, trace};

use super::avc;
use super::{AudioCodec, AudioPayload, VideoCodec, VideoPayload};
use crate::config::PipelineConfig;
use crate::error::{CastError, Result};
use crate::types::{AudioTrack, CapturedAudioBlock, CapturedFrame, PixelFormat, VideoTrack};

/// FLV codec id for AVC
pub const AVC_CODEC_ID: u8 = 7;
/// FLV sound format for AAC
pub const AAC_SOUND_FORMAT: u8 = 10;

fn init() -> Result<()> {
    ffmpeg::init().map_err(|e| CastError::init(format!("FFmpeg init failed: {}", e)))
}

fn pixel_for(format: PixelFormat) -> Pixel {
    match format {
        PixelFormat::Bgra => Pixel::BGRA,
        PixelFormat::Rgba => Pixel::RGBA,
    }
}

/// Copy the encoder's extradata out of its context
fn extradata(encoder: &encoder::Video) -> Vec<u8> {
    // SAFETY: the context is open and owned by `encoder`; extradata is only
    // read here, and copied before the borrow ends.
    unsafe {
        let ctx = encoder.as_ptr();
        if (*ctx).extradata.is_null() || (*ctx).extradata_size <= 0 {
            return Vec::new();
        }
        std::slice::from_raw_parts((*ctx).extradata, (*ctx).extradata_size as usize).to_vec()
    }
}

/// libx264 encoder producing AVCC access units
pub struct X264Codec {
    encoder: encoder::Video,
    scaler: Option<(scaling::Context, Pixel, u32, u32)>,
    frame: Video,
    packet: ffmpeg::Packet,
    pending: VecDeque<VideoPayload>,
    track: VideoTrack,
    frame_count: i64,
}

// The FFmpeg contexts are only touched from the encoder worker that owns
// the codec.
unsafe impl Send for X264Codec {}

impl X264Codec {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        init()?;
        let (width, height, fps) = (config.width(), config.height(), config.fps());

        let codec = encoder::find_by_name("libx264")
            .ok_or_else(|| CastError::init("libx264 encoder not available in this FFmpeg build"))?;
        let mut encoder = codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .map_err(|e| CastError::init(format!("Failed to create video encoder: {}", e)))?;

        let bitrate = config.video_bitrate as usize * 1000;
        encoder.set_width(width);
        encoder.set_height(height);
        encoder.set_format(Pixel::YUV420P);
        encoder.set_time_base(Rational::new(1, fps as i32));
        encoder.set_frame_rate(Some(Rational::new(fps as i32, 1)));
        encoder.set_bit_rate(bitrate);
        encoder.set_max_bit_rate(bitrate);
        encoder.set_gop(config.keyframe_interval);
        encoder.set_max_b_frames(0);
        // Parameter sets go into extradata instead of every keyframe
        encoder.set_flags(codec::Flags::GLOBAL_HEADER);

        let mut opts = Dictionary::new();
        opts.set("preset", "veryfast");
        opts.set("tune", "zerolatency");
        opts.set("forced-idr", "1");

        let encoder = encoder
            .open_with(opts)
            .map_err(|e| CastError::init(format!("Failed to open libx264: {}", e)))?;

        let sequence_header = avc::decoder_config(&extradata(&encoder))
            .ok_or_else(|| CastError::init("libx264 did not produce SPS/PPS"))?;

        info!(
            "x264 encoder opened: {}x{} @ {}fps, {}kbps",
            width, height, fps, config.video_bitrate
        );

        Ok(Self {
            frame: Video::new(Pixel::YUV420P, width, height),
            encoder,
            scaler: None,
            packet: ffmpeg::Packet::empty(),
            pending: VecDeque::new(),
            track: VideoTrack {
                codec_id: AVC_CODEC_ID,
                width,
                height,
                fps,
                bitrate_kbps: config.video_bitrate,
                sequence_header: Some(sequence_header),
            },
            frame_count: 0,
        })
    }

    fn ensure_scaler(&mut self, pixel: Pixel, width: u32, height: u32) -> Result<()> {
        let current = self.scaler.as_ref().map(|(_, p, w, h)| (*p, *w, *h));
        if current != Some((pixel, width, height)) {
            debug!(
                "Creating scaler: {:?} {}x{} -> YUV420P {}x{}",
                pixel, width, height, self.track.width, self.track.height
            );
            let scaler = scaling::Context::get(
                pixel,
                width,
                height,
                Pixel::YUV420P,
                self.track.width,
                self.track.height,
                Flags::BILINEAR,
            )
            .map_err(|e| CastError::encode(format!("Failed to create scaler: {}", e)))?;
            self.scaler = Some((scaler, pixel, width, height));
        }
        Ok(())
    }

    fn receive_packets(&mut self) -> Result<()> {
        loop {
            match self.encoder.receive_packet(&mut self.packet) {
                Ok(()) => {
                    let data = avc::annexb_to_avcc(self.packet.data().unwrap_or_default());
                    trace!(
                        "x264 packet: size={} keyframe={}",
                        data.len(),
                        self.packet.is_key()
                    );
                    self.pending.push_back(VideoPayload {
                        data,
                        keyframe: self.packet.is_key(),
                    });
                }
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => break,
                Err(e) => {
                    return Err(CastError::encode(format!("Failed to receive packet: {}", e)));
                }
            }
        }
        Ok(())
    }
}

impl VideoCodec for X264Codec {
    fn encode(
        &mut self,
        frame: &CapturedFrame,
        force_keyframe: bool,
    ) -> Result<Option<VideoPayload>> {
        let format = frame.format;
        if frame.data.len() < format.buffer_len() {
            return Err(CastError::encode(format!(
                "frame {} has {} bytes, expected {}",
                frame.sequence,
                frame.data.len(),
                format.buffer_len()
            )));
        }
        let pixel = pixel_for(format.pixel_format);
        self.ensure_scaler(pixel, format.width, format.height)?;

        let mut src = Video::new(pixel, format.width, format.height);
        let dst_stride = src.stride(0);
        let row_len = format.width as usize * 4;
        let plane = src.data_mut(0);
        for (y, row) in frame
            .data
            .chunks(format.stride as usize)
            .take(format.height as usize)
            .enumerate()
        {
            let start = y * dst_stride;
            plane[start..start + row_len].copy_from_slice(&row[..row_len]);
        }

        if let Some((scaler, ..)) = self.scaler.as_mut() {
            scaler
                .run(&src, &mut self.frame)
                .map_err(|e| CastError::encode(format!("Scaling failed: {}", e)))?;
        }

        self.frame.set_pts(Some(self.frame_count));
        self.frame.set_kind(if force_keyframe {
            ffmpeg::picture::Type::I
        } else {
            ffmpeg::picture::Type::None
        });
        self.frame_count += 1;

        self.encoder
            .send_frame(&self.frame)
            .map_err(|e| CastError::encode(format!("Failed to send frame: {}", e)))?;
        self.receive_packets()?;

        Ok(self.pending.pop_front())
    }

    fn track(&self) -> VideoTrack {
        self.track.clone()
    }

    fn name(&self) -> &'static str {
        "libx264"
    }
}

const AAC_SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// AAC-LC AudioSpecificConfig for a rate and channel count
fn audio_specific_config(sample_rate: u32, channels: u16) -> Option<Bytes> {
    let index = AAC_SAMPLE_RATES.iter().position(|&r| r == sample_rate)? as u16;
    if !(1..=7).contains(&channels) {
        return None;
    }
    // objectType (5 bits) = 2, frequency index (4), channel config (4), 3 zero bits
    let config: u16 = (2 << 11) | (index << 7) | (channels << 3);
    Some(Bytes::copy_from_slice(&config.to_be_bytes()))
}

/// FFmpeg's native AAC-LC encoder
///
/// Blocks are re-cut into the encoder's fixed frame size; a trailing partial
/// frame waits for the next block.
pub struct AacCodec {
    encoder: encoder::Audio,
    frame: Audio,
    packet: ffmpeg::Packet,
    frame_size: usize,
    channels: u16,
    sample_rate: u32,
    buffer: Vec<f32>,
    samples_sent: i64,
    track: AudioTrack,
}

unsafe impl Send for AacCodec {}

impl AacCodec {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        init()?;
        let (sample_rate, channels) = (config.sample_rate, config.channels);
        let sequence_header = audio_specific_config(sample_rate, channels).ok_or_else(|| {
            CastError::init(format!(
                "AAC cannot encode {} Hz / {} channels",
                sample_rate, channels
            ))
        })?;
        let layout = match channels {
            1 => ChannelLayout::MONO,
            2 => ChannelLayout::STEREO,
            n => {
                return Err(CastError::init(format!(
                    "AAC encoder supports mono or stereo, got {} channels",
                    n
                )));
            }
        };

        let codec = encoder::find_by_name("aac")
            .ok_or_else(|| CastError::init("AAC encoder not available in this FFmpeg build"))?;
        let mut encoder = codec::context::Context::new_with_codec(codec)
            .encoder()
            .audio()
            .map_err(|e| CastError::init(format!("Failed to create audio encoder: {}", e)))?;

        let format = Sample::F32(sample::Type::Planar);
        encoder.set_rate(sample_rate as i32);
        encoder.set_bit_rate(config.audio_bitrate as usize * 1000);
        encoder.set_format(format);
        encoder.set_time_base(Rational::new(1, sample_rate as i32));
        encoder.set_channel_layout(layout);
        encoder.set_flags(codec::Flags::GLOBAL_HEADER);

        let encoder = encoder
            .open_with(Dictionary::new())
            .map_err(|e| CastError::init(format!("Failed to open AAC encoder: {}", e)))?;

        let frame_size = match encoder.frame_size() as usize {
            0 => 1024,
            n => n,
        };
        info!(
            "AAC encoder opened: {}ch @ {}Hz, {}kbps, frame_size={}",
            channels, sample_rate, config.audio_bitrate, frame_size
        );

        Ok(Self {
            frame: Audio::new(format, frame_size, layout),
            encoder,
            packet: ffmpeg::Packet::empty(),
            frame_size,
            channels,
            sample_rate,
            buffer: Vec::with_capacity(frame_size * channels as usize * 2),
            samples_sent: 0,
            track: AudioTrack {
                sound_format: AAC_SOUND_FORMAT,
                sample_rate,
                channels,
                bitrate_kbps: config.audio_bitrate,
                sequence_header: Some(sequence_header),
            },
        })
    }

    /// Deinterleave one frame into the planar input frame and send it
    fn send_frame(&mut self, interleaved: &[f32]) -> Result<()> {
        let channels = self.channels as usize;
        for ch in 0..channels {
            let plane = self.frame.data_mut(ch);
            for (i, sample) in interleaved.iter().skip(ch).step_by(channels).enumerate() {
                plane[i * 4..i * 4 + 4].copy_from_slice(&sample.to_ne_bytes());
            }
        }
        self.frame.set_pts(Some(self.samples_sent));
        self.samples_sent += self.frame_size as i64;

        self.encoder
            .send_frame(&self.frame)
            .map_err(|e| CastError::encode(format!("Failed to send audio frame: {}", e)))
    }

    fn receive_packets(&mut self, out: &mut Vec<AudioPayload>) -> Result<()> {
        loop {
            match self.encoder.receive_packet(&mut self.packet) {
                Ok(()) => out.push(AudioPayload {
                    data: Bytes::copy_from_slice(self.packet.data().unwrap_or_default()),
                    samples: self.frame_size as u32,
                }),
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => break,
                Err(e) => {
                    return Err(CastError::encode(format!(
                        "Failed to receive audio packet: {}",
                        e
                    )));
                }
            }
        }
        Ok(())
    }
}

impl AudioCodec for AacCodec {
    fn encode(&mut self, block: &CapturedAudioBlock) -> Result<Vec<AudioPayload>> {
        if block.sample_rate != self.sample_rate || block.channels != self.channels {
            return Err(CastError::encode(format!(
                "block is {} Hz/{} ch, encoder expects {} Hz/{} ch",
                block.sample_rate, block.channels, self.sample_rate, self.channels
            )));
        }

        self.buffer.extend_from_slice(&block.samples);
        let per_frame = self.frame_size * self.channels as usize;
        let mut out = Vec::new();
        while self.buffer.len() >= per_frame {
            let chunk: Vec<f32> = self.buffer.drain(..per_frame).collect();
            self.send_frame(&chunk)?;
            self.receive_packets(&mut out)?;
        }
        Ok(out)
    }

    fn track(&self) -> AudioTrack {
        self.track.clone()
    }

    fn name(&self) -> &'static str {
        "aac"
    }
}

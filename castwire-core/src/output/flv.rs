//! FLV tag bodies and file framing
//!
//! RTMP audio/video messages carry exactly the FLV tag body, so both the RTMP
//! and file connectors build their payloads here.

use bytes::{BufMut, Bytes, BytesMut};
use rml_rtmp::rml_amf0::{self, Amf0Value};
use std::collections::HashMap;

use crate::error::{CastError, Result};
use crate::types::{AudioTrack, MuxedPacket, StreamInfo, VideoTrack};

/// FLV codec id for AVC
const AVC: u8 = 7;
/// FLV sound format for AAC
const AAC: u8 = 10;

/// Tag type of a script data (metadata) tag
pub const SCRIPT_TAG: u8 = 18;

/// 13-byte FLV file header including the leading PreviousTagSize0
pub fn file_header(has_video: bool, has_audio: bool) -> [u8; 13] {
    let flags = (u8::from(has_audio) << 2) | u8::from(has_video);
    [b'F', b'L', b'V', 1, flags, 0, 0, 0, 9, 0, 0, 0, 0]
}

/// Frame a tag body as a file tag followed by its PreviousTagSize
pub fn file_tag(tag_type: u8, timestamp_ms: u32, body: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(11 + body.len() + 4);
    out.put_u8(tag_type);
    out.put_uint(body.len() as u64, 3);
    out.put_uint((timestamp_ms & 0x00ff_ffff) as u64, 3);
    out.put_u8((timestamp_ms >> 24) as u8);
    out.put_uint(0, 3); // stream id
    out.extend_from_slice(body);
    out.put_u32(11 + body.len() as u32);
    out.freeze()
}

fn video_header(out: &mut BytesMut, track: &VideoTrack, keyframe: bool) {
    let frame_type: u8 = if keyframe { 1 } else { 2 };
    out.put_u8((frame_type << 4) | (track.codec_id & 0x0f));
}

/// Tag body for one video packet
pub fn video_body(track: &VideoTrack, packet: &MuxedPacket) -> Bytes {
    let mut out = BytesMut::with_capacity(5 + packet.payload.len());
    video_header(&mut out, track, packet.keyframe);
    if track.codec_id == AVC {
        out.put_u8(1); // NALU
        out.put_int(packet.composition_offset_ms as i64, 3);
    }
    out.extend_from_slice(&packet.payload);
    out.freeze()
}

/// Tag body announcing the video decoder configuration, if the codec has one
pub fn video_sequence_header(track: &VideoTrack) -> Option<Bytes> {
    let record = track.sequence_header.as_ref()?;
    let mut out = BytesMut::with_capacity(5 + record.len());
    video_header(&mut out, track, true);
    if track.codec_id == AVC {
        out.put_u8(0); // sequence header
        out.put_int(0, 3);
    }
    out.extend_from_slice(record);
    Some(out.freeze())
}

/// FLV sound rate index; non-AAC decoders only know these four rates
fn sound_rate_index(sample_rate: u32) -> u8 {
    match sample_rate {
        0..=8000 => 0,
        8001..=16000 => 1,
        16001..=33000 => 2,
        _ => 3,
    }
}

fn audio_header(track: &AudioTrack) -> u8 {
    if track.sound_format == AAC {
        // AAC always signals 44 kHz, 16-bit, stereo; the real shape is in the
        // AudioSpecificConfig
        return (AAC << 4) | 0x0f;
    }
    let stereo = u8::from(track.channels > 1);
    (track.sound_format << 4) | (sound_rate_index(track.sample_rate) << 2) | (1 << 1) | stereo
}

/// Tag body for one audio packet
pub fn audio_body(track: &AudioTrack, packet: &MuxedPacket) -> Bytes {
    let mut out = BytesMut::with_capacity(2 + packet.payload.len());
    out.put_u8(audio_header(track));
    if track.sound_format == AAC {
        out.put_u8(1); // raw frame
    }
    out.extend_from_slice(&packet.payload);
    out.freeze()
}

/// Tag body announcing the audio decoder configuration, if the codec has one
pub fn audio_sequence_header(track: &AudioTrack) -> Option<Bytes> {
    let config = track.sequence_header.as_ref()?;
    let mut out = BytesMut::with_capacity(2 + config.len());
    out.put_u8(audio_header(track));
    if track.sound_format == AAC {
        out.put_u8(0); // sequence header
    }
    out.extend_from_slice(config);
    Some(out.freeze())
}

/// Tag body for a packet of either kind
pub fn packet_body(info: &StreamInfo, packet: &MuxedPacket) -> Bytes {
    if packet.stream_id == MuxedPacket::VIDEO_STREAM_ID {
        video_body(&info.video, packet)
    } else {
        audio_body(&info.audio, packet)
    }
}

/// `onMetaData` properties describing the stream
pub fn metadata_properties(info: &StreamInfo) -> HashMap<String, Amf0Value> {
    let mut props = HashMap::new();
    let video = &info.video;
    let audio = &info.audio;
    props.insert("width".into(), Amf0Value::Number(video.width as f64));
    props.insert("height".into(), Amf0Value::Number(video.height as f64));
    props.insert("framerate".into(), Amf0Value::Number(video.fps as f64));
    props.insert("videocodecid".into(), Amf0Value::Number(video.codec_id as f64));
    props.insert("videodatarate".into(), Amf0Value::Number(video.bitrate_kbps as f64));
    props.insert("audiocodecid".into(), Amf0Value::Number(audio.sound_format as f64));
    props.insert("audiosamplerate".into(), Amf0Value::Number(audio.sample_rate as f64));
    props.insert("audiosamplesize".into(), Amf0Value::Number(16.0));
    props.insert("audiodatarate".into(), Amf0Value::Number(audio.bitrate_kbps as f64));
    props.insert("stereo".into(), Amf0Value::Boolean(audio.channels > 1));
    props.insert("encoder".into(), Amf0Value::Utf8String(encoder_name()));
    props
}

/// Encoder string advertised in stream metadata
pub fn encoder_name() -> String {
    format!("castwire {}", env!("CARGO_PKG_VERSION"))
}

/// Script tag body: `onMetaData` followed by the property object
pub fn metadata_body(info: &StreamInfo) -> Result<Bytes> {
    let values = vec![
        Amf0Value::Utf8String("onMetaData".into()),
        Amf0Value::Object(metadata_properties(info)),
    ];
    rml_amf0::serialize(&values)
        .map(Bytes::from)
        .map_err(|e| CastError::transport(format!("failed to encode metadata: {:?}", e)))
}

/// One tag read back from an FLV file
#[derive(Debug, Clone, PartialEq)]
pub struct FlvTag {
    pub tag_type: u8,
    pub timestamp_ms: u32,
    pub body: Bytes,
}

impl FlvTag {
    /// Whether this is a video keyframe (including sequence headers)
    pub fn is_video_keyframe(&self) -> bool {
        self.tag_type == MuxedPacket::VIDEO_STREAM_ID && self.body.first().is_some_and(|b| b >> 4 == 1)
    }

    /// Whether this is a codec sequence header rather than media
    pub fn is_sequence_header(&self) -> bool {
        match self.tag_type {
            MuxedPacket::VIDEO_STREAM_ID => {
                self.body.first().is_some_and(|b| b & 0x0f == AVC) && self.body.get(1) == Some(&0)
            }
            MuxedPacket::AUDIO_STREAM_ID => {
                self.body.first().is_some_and(|b| b >> 4 == AAC) && self.body.get(1) == Some(&0)
            }
            _ => false,
        }
    }
}

/// Split an FLV file into its tags
pub fn read_tags(data: &[u8]) -> Result<Vec<FlvTag>> {
    if data.len() < 13 || &data[..3] != b"FLV" {
        return Err(CastError::config("not an FLV file"));
    }
    let header_len = u32::from_be_bytes([data[5], data[6], data[7], data[8]]) as usize;
    let mut pos = header_len + 4;
    let mut tags = Vec::new();
    while pos < data.len() {
        let header = data
            .get(pos..pos + 11)
            .ok_or_else(|| CastError::config(format!("truncated tag header at {}", pos)))?;
        let size = u32::from_be_bytes([0, header[1], header[2], header[3]]) as usize;
        let timestamp_ms = u32::from_be_bytes([header[7], header[4], header[5], header[6]]);
        let body = data
            .get(pos + 11..pos + 11 + size)
            .ok_or_else(|| CastError::config(format!("truncated tag body at {}", pos)))?;
        tags.push(FlvTag {
            tag_type: header[0],
            timestamp_ms,
            body: Bytes::copy_from_slice(body),
        });
        pos += 11 + size + 4;
    }
    Ok(tags)
}

//! Linear PCM audio (FLV sound format 3)

use bytes::{BufMut, BytesMut};

use super::{AudioCodec, AudioPayload};
use crate::error::{CastError, Result};
use crate::types::{AudioTrack, CapturedAudioBlock};

/// FLV sound format for little-endian linear PCM
pub const PCM_SOUND_FORMAT: u8 = 3;

/// Converts float samples to signed 16-bit little endian
pub struct PcmCodec {
    sample_rate: u32,
    channels: u16,
}

impl PcmCodec {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }
}

impl AudioCodec for PcmCodec {
    fn encode(&mut self, block: &CapturedAudioBlock) -> Result<Vec<AudioPayload>> {
        if block.channels != self.channels || block.sample_rate != self.sample_rate {
            return Err(CastError::encode(format!(
                "block {} is {} Hz/{} ch, track is {} Hz/{} ch",
                block.sequence, block.sample_rate, block.channels, self.sample_rate, self.channels
            )));
        }

        let mut out = BytesMut::with_capacity(block.samples.len() * 2);
        for &sample in &block.samples {
            let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            out.put_i16_le(value);
        }

        Ok(vec![AudioPayload {
            data: out.freeze(),
            samples: block.sample_count,
        }])
    }

    fn track(&self) -> AudioTrack {
        AudioTrack {
            sound_format: PCM_SOUND_FORMAT,
            sample_rate: self.sample_rate,
            channels: self.channels,
            bitrate_kbps: self.sample_rate * self.channels as u32 * 16 / 1000,
            sequence_header: None,
        }
    }

    fn name(&self) -> &'static str {
        "pcm s16le"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_samples_clamped_and_little_endian() {
        let mut codec = PcmCodec::new(8000, 1);
        let block = CapturedAudioBlock {
            samples: vec![0.0, 1.0, -2.0],
            sample_count: 3,
            sample_rate: 8000,
            channels: 1,
            captured_at: Duration::ZERO,
            sequence: 0,
        };
        let out = codec.encode(&block).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].samples, 3);
        assert_eq!(&out[0].data[..], &[0x00, 0x00, 0xff, 0x7f, 0x01, 0x80]);
    }

    #[test]
    fn test_format_mismatch_is_unit_error() {
        let mut codec = PcmCodec::new(44100, 1);
        let block = CapturedAudioBlock {
            samples: vec![0.0; 4],
            sample_count: 2,
            sample_rate: 48000,
            channels: 2,
            captured_at: Duration::ZERO,
            sequence: 5,
        };
        let err = codec.encode(&block).unwrap_err();
        assert!(!err.is_fatal());
    }
}

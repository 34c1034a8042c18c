//! FLV Screen Video (codec id 3)
//!
//! The image is cut into 64x64 blocks, ordered bottom-left to top-right, each
//! holding bottom-up BGR rows in a zlib stream. Keyframes carry every block;
//! interframes carry only the blocks that changed and mark the rest with a
//! zero size. Blocks use stored (uncompressed) deflate so encoding stays a
//! cheap copy.

use bytes::{BufMut, BytesMut};
use tracing::{debug, trace};

use super::{VideoCodec, VideoPayload};
use crate::error::{CastError, Result};
use crate::types::{CapturedFrame, VideoTrack};

/// FLV codec id for Screen Video
pub const SCREEN_VIDEO_CODEC_ID: u8 = 3;

/// Block edge in pixels
const BLOCK: u32 = 64;

/// Screen Video encoder
pub struct ScreenVideoCodec {
    width: u32,
    height: u32,
    fps: u32,
    /// Frame size the block cache belongs to
    cached_size: Option<(u32, u32)>,
    /// Raw BGR bytes of each block in the previous frame
    previous: Vec<Vec<u8>>,
}

impl ScreenVideoCodec {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            fps,
            cached_size: None,
            previous: Vec::new(),
        }
    }
}

impl VideoCodec for ScreenVideoCodec {
    fn encode(
        &mut self,
        frame: &CapturedFrame,
        force_keyframe: bool,
    ) -> Result<Option<VideoPayload>> {
        let format = frame.format;
        let (w, h) = (format.width, format.height);
        if w == 0 || h == 0 || w > 4095 || h > 4095 {
            return Err(CastError::encode(format!(
                "screen video cannot encode {}x{} frames",
                w, h
            )));
        }
        if frame.data.len() < format.buffer_len() || format.stride < w * 4 {
            return Err(CastError::encode(format!(
                "frame {} has {} bytes, expected {}",
                frame.sequence,
                frame.data.len(),
                format.buffer_len()
            )));
        }

        let keyframe = force_keyframe || self.cached_size != Some((w, h));
        if keyframe && !force_keyframe {
            debug!("Frame size changed to {}x{}, sending keyframe", w, h);
        }

        let cols = w.div_ceil(BLOCK);
        let rows = h.div_ceil(BLOCK);
        let mut blocks = Vec::with_capacity((cols * rows) as usize);
        for row in 0..rows {
            for col in 0..cols {
                blocks.push(extract_block(frame, col, row));
            }
        }

        let mut out = BytesMut::with_capacity(4 + blocks.len() * (BLOCK * BLOCK * 3 + 13) as usize);
        out.put_u16((((BLOCK / 16) - 1) << 12 | w) as u16);
        out.put_u16((((BLOCK / 16) - 1) << 12 | h) as u16);

        let mut changed = 0usize;
        for (i, block) in blocks.iter().enumerate() {
            let unchanged = !keyframe && self.previous.get(i) == Some(block);
            if unchanged {
                out.put_u16(0);
            } else {
                changed += 1;
                let compressed = zlib_stored(block);
                out.put_u16(compressed.len() as u16);
                out.extend_from_slice(&compressed);
            }
        }

        trace!(
            "Frame {}: {} of {} blocks, keyframe={}",
            frame.sequence,
            changed,
            blocks.len(),
            keyframe
        );
        self.previous = blocks;
        self.cached_size = Some((w, h));

        Ok(Some(VideoPayload {
            data: out.freeze(),
            keyframe,
        }))
    }

    fn track(&self) -> VideoTrack {
        VideoTrack {
            codec_id: SCREEN_VIDEO_CODEC_ID,
            width: self.width,
            height: self.height,
            fps: self.fps,
            bitrate_kbps: 0,
            sequence_header: None,
        }
    }

    fn name(&self) -> &'static str {
        "screen video"
    }
}

/// Copy block (`col`, `row`) out of the frame as bottom-up BGR rows
///
/// Row 0 is the bottom of the image.
fn extract_block(frame: &CapturedFrame, col: u32, row: u32) -> Vec<u8> {
    let format = frame.format;
    let (r_off, g_off, b_off) = format.pixel_format.rgb_offsets();
    let x0 = col * BLOCK;
    let bw = BLOCK.min(format.width - x0);
    let y0 = row * BLOCK;
    let bh = BLOCK.min(format.height - y0);

    let mut out = Vec::with_capacity((bw * bh * 3) as usize);
    for by in 0..bh {
        let top_down = format.height - 1 - (y0 + by);
        let line = (top_down * format.stride) as usize;
        for bx in 0..bw {
            let p = line + ((x0 + bx) * 4) as usize;
            out.push(frame.data[p + b_off]);
            out.push(frame.data[p + g_off]);
            out.push(frame.data[p + r_off]);
        }
    }
    out
}

/// Wrap `data` in a zlib stream of stored deflate blocks
fn zlib_stored(data: &[u8]) -> Vec<u8> {
    let chunks = data.len().div_ceil(0xffff).max(1);
    let mut out = Vec::with_capacity(2 + data.len() + chunks * 5 + 4);
    // CMF: deflate, 32K window; FLG: fastest, check bits
    out.extend_from_slice(&[0x78, 0x01]);

    let mut pieces = data.chunks(0xffff).peekable();
    if pieces.peek().is_none() {
        out.extend_from_slice(&[0x01, 0x00, 0x00, 0xff, 0xff]);
    }
    while let Some(piece) = pieces.next() {
        let last = pieces.peek().is_none();
        let len = piece.len() as u16;
        out.push(u8::from(last));
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&(!len).to_le_bytes());
        out.extend_from_slice(piece);
    }

    out.extend_from_slice(&adler32(data).to_be_bytes());
    out
}

fn adler32(data: &[u8]) -> u32 {
    const MOD: u32 = 65521;
    let (mut a, mut b) = (1u32, 0u32);
    for chunk in data.chunks(5552) {
        for &byte in chunk {
            a += byte as u32;
            b += a;
        }
        a %= MOD;
        b %= MOD;
    }
    (b << 16) | a
}

/// Decode the block sizes of a Screen Video frame
///
/// Returns the image size and the size of each block's zlib stream (0 for an
/// unchanged block).
#[cfg(test)]
fn parse_block_sizes(data: &[u8]) -> Option<((u32, u32), Vec<u16>)> {
    if data.len() < 4 {
        return None;
    }
    let w = u16::from_be_bytes([data[0], data[1]]) as u32 & 0x0fff;
    let h = u16::from_be_bytes([data[2], data[3]]) as u32 & 0x0fff;
    let count = (w.div_ceil(BLOCK) * h.div_ceil(BLOCK)) as usize;
    let mut sizes = Vec::with_capacity(count);
    let mut pos = 4;
    for _ in 0..count {
        let size = u16::from_be_bytes([*data.get(pos)?, *data.get(pos + 1)?]);
        pos += 2 + size as usize;
        sizes.push(size);
    }
    (pos == data.len()).then_some(((w, h), sizes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FrameFormat, PixelFormat};
    use std::time::Duration;

    fn frame(width: u32, height: u32, fill: u8, sequence: u64) -> CapturedFrame {
        let format = FrameFormat::packed(width, height, PixelFormat::Bgra);
        CapturedFrame {
            format,
            data: vec![fill; format.buffer_len()],
            captured_at: Duration::ZERO,
            sequence,
        }
    }

    #[test]
    fn test_adler32_known_value() {
        assert_eq!(adler32(b"Wikipedia"), 0x11e6_0398);
        assert_eq!(adler32(b""), 1);
    }

    #[test]
    fn test_zlib_stored_layout() {
        let z = zlib_stored(b"abc");
        assert_eq!(&z[..2], &[0x78, 0x01]);
        // Header bytes must be a multiple of 31
        assert_eq!(u16::from_be_bytes([z[0], z[1]]) % 31, 0);
        assert_eq!(&z[2..7], &[0x01, 0x03, 0x00, 0xfc, 0xff]);
        assert_eq!(&z[7..10], b"abc");
        assert_eq!(z.len(), 2 + 5 + 3 + 4);
    }

    #[test]
    fn test_keyframe_then_unchanged_interframe() {
        let mut codec = ScreenVideoCodec::new(100, 70, 30);
        let key = codec.encode(&frame(100, 70, 0x20, 0), false).unwrap().unwrap();
        assert!(key.keyframe);
        let ((w, h), sizes) = parse_block_sizes(&key.data).unwrap();
        assert_eq!((w, h), (100, 70));
        assert_eq!(sizes.len(), 4);
        // Bottom-left block is full size, top-right is 36x6
        assert_eq!(sizes[0] as usize, 2 + 5 + 64 * 64 * 3 + 4);
        assert_eq!(sizes[3] as usize, 2 + 5 + 36 * 6 * 3 + 4);

        let inter = codec.encode(&frame(100, 70, 0x20, 1), false).unwrap().unwrap();
        assert!(!inter.keyframe);
        let (_, sizes) = parse_block_sizes(&inter.data).unwrap();
        assert!(sizes.iter().all(|&s| s == 0));
    }

    #[test]
    fn test_interframe_carries_only_changed_blocks() {
        let mut codec = ScreenVideoCodec::new(128, 64, 30);
        let mut f = frame(128, 64, 0, 0);
        codec.encode(&f, true).unwrap();
        // Touch one pixel in the right-hand block
        f.data[(10 * 128 + 100) * 4] = 0xff;
        let inter = codec.encode(&f, false).unwrap().unwrap();
        let (_, sizes) = parse_block_sizes(&inter.data).unwrap();
        assert_eq!(sizes[0], 0);
        assert!(sizes[1] > 0);
    }

    #[test]
    fn test_forced_keyframe_and_short_buffer() {
        let mut codec = ScreenVideoCodec::new(64, 64, 30);
        codec.encode(&frame(64, 64, 1, 0), false).unwrap();
        assert!(codec.encode(&frame(64, 64, 1, 1), true).unwrap().unwrap().keyframe);

        let mut bad = frame(64, 64, 1, 2);
        bad.data.truncate(10);
        assert!(matches!(codec.encode(&bad, false), Err(CastError::Encode(_))));
    }
}

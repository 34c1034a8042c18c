//! Encoder worker loops

use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::sync::{AudioTimeline, VideoTimeline};
use super::{AudioCodec, VideoCodec};
use crate::queue::{BoundedQueue, CloseOnDrop};
use crate::state::PipelineContext;
use crate::types::{samples_to_duration, CapturedAudioBlock, CapturedFrame, EncodedUnit, StreamKind};
use crate::worker::run_blocking;

/// Pulls raw frames, compresses them and queues encoded units for the muxer
pub struct VideoEncoder {
    codec: Box<dyn VideoCodec>,
    keyframe_interval: u32,
    /// Frames since the last keyframe; `None` until the first one
    since_keyframe: Option<u32>,
    timeline: VideoTimeline,
    input: Arc<BoundedQueue<CapturedFrame>>,
    output: CloseOnDrop<EncodedUnit>,
    ctx: PipelineContext,
    encoded: u64,
}

impl VideoEncoder {
    pub fn new(
        codec: Box<dyn VideoCodec>,
        keyframe_interval: u32,
        ctx: PipelineContext,
        input: Arc<BoundedQueue<CapturedFrame>>,
        output: Arc<BoundedQueue<EncodedUnit>>,
    ) -> Self {
        Self {
            codec,
            keyframe_interval: keyframe_interval.max(1),
            since_keyframe: None,
            timeline: VideoTimeline::new(),
            input,
            output: CloseOnDrop::new(output),
            ctx,
            encoded: 0,
        }
    }

    /// Encode until the input queue is closed and empty, or `shutdown` fires
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            "Video encoder started: {}, keyframe every {} frames",
            self.codec.name(),
            self.keyframe_interval
        );

        loop {
            let frame = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                frame = self.input.pop() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            if !self.encode_frame(frame) {
                break;
            }
        }

        info!("Video encoder stopped after {} units", self.encoded);
    }

    /// Returns false when the codec hit an error it cannot continue past
    fn encode_frame(&mut self, frame: CapturedFrame) -> bool {
        let force = self
            .since_keyframe
            .is_none_or(|n| n >= self.keyframe_interval);
        let pts = self.timeline.assign(frame.captured_at);

        let started = Instant::now();
        let codec = &mut self.codec;
        let result = run_blocking(|| codec.encode(&frame, force));
        self.ctx.metrics.record_video_encode(started.elapsed());

        match result {
            Ok(Some(payload)) => {
                if force && !payload.keyframe {
                    warn!("Codec ignored keyframe request for frame {}", frame.sequence);
                }
                self.since_keyframe = if payload.keyframe {
                    Some(1)
                } else {
                    self.since_keyframe.map(|n| n + 1)
                };

                trace!(
                    "Encoded frame {}: pts={:?} size={} keyframe={}",
                    frame.sequence,
                    pts,
                    payload.data.len(),
                    payload.keyframe
                );

                let unit = EncodedUnit {
                    kind: StreamKind::Video,
                    payload: payload.data,
                    pts,
                    dts: pts,
                    keyframe: payload.keyframe,
                    sequence: frame.sequence,
                };
                self.encoded += 1;
                self.ctx.metrics.add_video_units_encoded(1);
                if self.output.push(unit).is_drop() {
                    self.ctx.metrics.add_encoded_units_dropped(1);
                    debug!("Encoded video queue full, dropped frame {}", frame.sequence);
                }
                true
            }
            Ok(None) => {
                self.since_keyframe = self.since_keyframe.map(|n| n + 1);
                true
            }
            Err(e) if e.is_fatal() => {
                self.ctx.faults.report("video encoder", e);
                false
            }
            Err(e) => {
                self.ctx.metrics.add_encode_failures(1);
                warn!("Dropping frame {}: {}", frame.sequence, e);
                true
            }
        }
    }
}

/// Pulls raw audio blocks, compresses them and queues encoded units
pub struct AudioEncoder {
    codec: Box<dyn AudioCodec>,
    timeline: AudioTimeline,
    last_pts: Option<std::time::Duration>,
    input: Arc<BoundedQueue<CapturedAudioBlock>>,
    output: CloseOnDrop<EncodedUnit>,
    ctx: PipelineContext,
    encoded: u64,
}

impl AudioEncoder {
    pub fn new(
        codec: Box<dyn AudioCodec>,
        ctx: PipelineContext,
        input: Arc<BoundedQueue<CapturedAudioBlock>>,
        output: Arc<BoundedQueue<EncodedUnit>>,
    ) -> Self {
        Self {
            codec,
            timeline: AudioTimeline::new(),
            last_pts: None,
            input,
            output: CloseOnDrop::new(output),
            ctx,
            encoded: 0,
        }
    }

    /// Encode until the input queue is closed and empty, or `shutdown` fires
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Audio encoder started: {}", self.codec.name());

        loop {
            let block = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                block = self.input.pop() => match block {
                    Some(block) => block,
                    None => break,
                },
            };
            if !self.encode_block(block) {
                break;
            }
        }

        info!(
            "Audio encoder stopped after {} units ({} timeline re-anchors)",
            self.encoded,
            self.timeline.reanchors()
        );
    }

    fn encode_block(&mut self, block: CapturedAudioBlock) -> bool {
        let reanchors = self.timeline.reanchors();
        let block_pts = self.timeline.assign(block.captured_at, block.duration());
        if self.timeline.reanchors() != reanchors {
            debug!(
                "Audio timeline re-anchored at block {} to {:?}",
                block.sequence, block_pts
            );
        }

        let started = Instant::now();
        let codec = &mut self.codec;
        let result = run_blocking(|| codec.encode(&block));
        self.ctx.metrics.record_audio_encode(started.elapsed());

        let payloads = match result {
            Ok(payloads) => payloads,
            Err(e) if e.is_fatal() => {
                self.ctx.faults.report("audio encoder", e);
                return false;
            }
            Err(e) => {
                self.ctx.metrics.add_encode_failures(1);
                warn!("Dropping audio block {}: {}", block.sequence, e);
                return true;
            }
        };

        let mut offset: u64 = 0;
        for payload in payloads {
            let mut pts = block_pts + samples_to_duration(offset, block.sample_rate);
            offset += payload.samples as u64;
            if let Some(last) = self.last_pts {
                pts = pts.max(last);
            }
            self.last_pts = Some(pts);

            let unit = EncodedUnit {
                kind: StreamKind::Audio,
                payload: payload.data,
                pts,
                dts: pts,
                keyframe: false,
                sequence: block.sequence,
            };
            self.encoded += 1;
            self.ctx.metrics.add_audio_units_encoded(1);
            if self.output.push(unit).is_drop() {
                self.ctx.metrics.add_encoded_units_dropped(1);
                debug!("Encoded audio queue full, evicted oldest unit");
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::{PcmCodec, ScreenVideoCodec, VideoPayload};
    use crate::error::{CastError, Result};
    use crate::queue::DropPolicy;
    use crate::types::{FrameFormat, PixelFormat, VideoTrack};
    use bytes::Bytes;
    use std::time::Duration;

    fn frame(sequence: u64, at_ms: u64) -> CapturedFrame {
        let format = FrameFormat::packed(64, 64, PixelFormat::Bgra);
        CapturedFrame {
            format,
            data: vec![0; format.buffer_len()],
            captured_at: Duration::from_millis(at_ms),
            sequence,
        }
    }

    /// Fails every frame whose sequence is listed
    struct FlakyCodec {
        fail: Vec<u64>,
    }

    impl VideoCodec for FlakyCodec {
        fn encode(&mut self, frame: &CapturedFrame, force: bool) -> Result<Option<VideoPayload>> {
            if self.fail.contains(&frame.sequence) {
                return Err(CastError::encode("flaky"));
            }
            Ok(Some(VideoPayload {
                data: Bytes::from_static(b"x"),
                keyframe: force,
            }))
        }

        fn track(&self) -> VideoTrack {
            ScreenVideoCodec::new(64, 64, 30).track()
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_keyframe_interval_and_unit_failures() {
        let (ctx, _faults) = PipelineContext::standalone();
        let input = BoundedQueue::new("frames", 32, DropPolicy::DropNewest);
        let output = BoundedQueue::new("video", 32, DropPolicy::DropNewest);
        // Frame 3 would be a forced keyframe; its failure moves the keyframe to 4
        let encoder = VideoEncoder::new(
            Box::new(FlakyCodec { fail: vec![3] }),
            3,
            ctx.clone(),
            input.clone(),
            output.clone(),
        );
        for i in 0..8 {
            input.push(frame(i, i * 33));
        }
        input.close();
        encoder.run(CancellationToken::new()).await;

        let mut units = Vec::new();
        while let Some(unit) = output.try_pop() {
            units.push((unit.sequence, unit.keyframe));
        }
        assert_eq!(
            units,
            vec![
                (0, true),
                (1, false),
                (2, false),
                (4, true),
                (5, false),
                (6, false),
                (7, true)
            ]
        );
        assert_eq!(ctx.metrics.encode_failures(), 1);
        assert!(output.is_closed());
    }

    #[tokio::test]
    async fn test_video_pts_clamped_under_jitter() {
        let (ctx, _faults) = PipelineContext::standalone();
        let input = BoundedQueue::new("frames", 32, DropPolicy::DropNewest);
        let output = BoundedQueue::new("video", 32, DropPolicy::DropNewest);
        let encoder = VideoEncoder::new(
            Box::new(ScreenVideoCodec::new(64, 64, 30)),
            30,
            ctx,
            input.clone(),
            output.clone(),
        );
        for (i, at) in [0u64, 40, 30, 70, 65, 100].into_iter().enumerate() {
            input.push(frame(i as u64, at));
        }
        input.close();
        encoder.run(CancellationToken::new()).await;

        let mut last = Duration::ZERO;
        let mut count = 0;
        while let Some(unit) = output.try_pop() {
            assert!(unit.pts >= last);
            assert_eq!(unit.pts, unit.dts);
            last = unit.pts;
            count += 1;
        }
        assert_eq!(count, 6);
    }

    #[tokio::test]
    async fn test_audio_units_follow_sample_timeline() {
        let (ctx, _faults) = PipelineContext::standalone();
        let input = BoundedQueue::new("blocks", 32, DropPolicy::DropOldest);
        let output = BoundedQueue::new("audio", 32, DropPolicy::DropOldest);
        let encoder = AudioEncoder::new(
            Box::new(PcmCodec::new(1000, 1)),
            ctx,
            input.clone(),
            output.clone(),
        );
        for (i, at) in [0u64, 112, 190, 700].into_iter().enumerate() {
            input.push(CapturedAudioBlock {
                samples: vec![0.1; 100],
                sample_count: 100,
                sample_rate: 1000,
                channels: 1,
                captured_at: Duration::from_millis(at),
                sequence: i as u64,
            });
        }
        input.close();
        encoder.run(CancellationToken::new()).await;

        let pts: Vec<_> = std::iter::from_fn(|| output.try_pop())
            .map(|u| u.pts.as_millis())
            .collect();
        assert_eq!(pts, vec![0, 100, 200, 700]);
    }
}

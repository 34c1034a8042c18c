//! Fixed-cadence frame source

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{FrameGrabber, MAX_CONSECUTIVE_GRAB_FAILURES};
use crate::error::{CastError, Result};
use crate::queue::{BoundedQueue, CloseOnDrop};
use crate::state::PipelineContext;
use crate::types::{CapturedFrame, FrameFormat, PixelFormat, RawImage};
use crate::worker::run_blocking;

/// Pulls frames from a grabber at a fixed rate and queues them for encoding
///
/// Deadlines come from the schedule (`start + n * period`), not from when the
/// previous grab finished, so grab latency does not accumulate into drift.
pub struct FrameSource {
    grabber: Box<dyn FrameGrabber>,
    period: Duration,
    ctx: PipelineContext,
    output: CloseOnDrop<CapturedFrame>,
}

impl FrameSource {
    /// Create a source emitting at `fps` into `output`
    ///
    /// `output` should use [`crate::queue::DropPolicy::DropNewest`].
    pub fn new(
        grabber: Box<dyn FrameGrabber>,
        fps: u32,
        ctx: PipelineContext,
        output: Arc<BoundedQueue<CapturedFrame>>,
    ) -> Self {
        Self {
            grabber,
            period: Duration::from_secs(1) / fps.max(1),
            ctx,
            output: CloseOnDrop::new(output),
        }
    }

    /// Run until `stop` fires or the grabber fails too many times in a row
    ///
    /// The output queue is closed on return.
    pub async fn run(mut self, stop: CancellationToken) {
        let name = self.grabber.name();
        info!("Frame source '{}' started at {:?} per frame", name, self.period);

        let start = Instant::now();
        let mut tick: u64 = 0;
        let mut sequence: u64 = 0;
        let mut failures: u32 = 0;

        loop {
            let deadline = slot(start, self.period, tick);
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = sleep_until(deadline) => {}
            }

            let grabber = &mut self.grabber;
            match run_blocking(|| grabber.grab()) {
                Ok(image) => {
                    failures = 0;
                    let frame = CapturedFrame {
                        format: image.format,
                        data: image.data,
                        captured_at: self.ctx.clock.now(),
                        sequence,
                    };
                    sequence += 1;
                    self.ctx.metrics.add_frames_captured(1);

                    if self.output.push(frame).is_drop() {
                        self.ctx.metrics.add_frames_dropped(1);
                        debug!("Frame queue full, dropped frame {}", sequence - 1);
                    }
                }
                Err(e) => {
                    failures += 1;
                    self.ctx.metrics.add_capture_failures(1);
                    warn!(
                        "Frame grab failed ({}/{}): {}",
                        failures, MAX_CONSECUTIVE_GRAB_FAILURES, e
                    );
                    if failures >= MAX_CONSECUTIVE_GRAB_FAILURES {
                        self.ctx.faults.report(
                            "frame source",
                            CastError::source_lost(format!(
                                "{} failed {} times in a row: {}",
                                name, failures, e
                            )),
                        );
                        break;
                    }
                }
            }

            tick += 1;
            let now = Instant::now();
            let next = slot(start, self.period, tick);
            if now > next && now - next >= self.period {
                // Resume on the first future slot instead of bursting
                let behind = ((now - start).as_nanos() / self.period.as_nanos()) as u64;
                trace!("Frame source behind schedule, skipping {} ticks", behind + 1 - tick);
                tick = behind + 1;
            }
        }

        info!("Frame source '{}' stopped after {} frames", name, sequence);
    }
}

/// Scheduled instant of tick `n`
fn slot(start: Instant, period: Duration, n: u64) -> Instant {
    start + Duration::from_nanos((period.as_nanos() as u64).saturating_mul(n))
}

/// Generates a moving test pattern
///
/// A static gradient with a bright vertical bar sweeping across it, so
/// consecutive frames differ in a small region only.
pub struct TestPatternGrabber {
    format: FrameFormat,
    background: Vec<u8>,
    frame: u64,
}

impl TestPatternGrabber {
    /// Width of the moving bar in pixels
    const BAR_WIDTH: u32 = 16;

    pub fn new(width: u32, height: u32) -> Self {
        let format = FrameFormat::packed(width, height, PixelFormat::Bgra);
        let mut background = vec![0u8; format.buffer_len()];
        for y in 0..height {
            for x in 0..width {
                let i = ((y * format.stride) + x * 4) as usize;
                background[i] = (x * 255 / width.max(1)) as u8;
                background[i + 1] = (y * 255 / height.max(1)) as u8;
                background[i + 2] = 0x40;
                background[i + 3] = 0xff;
            }
        }
        Self {
            format,
            background,
            frame: 0,
        }
    }
}

impl FrameGrabber for TestPatternGrabber {
    fn grab(&mut self) -> Result<RawImage> {
        let mut data = self.background.clone();
        let width = self.format.width;
        if width > 0 {
            let bar_x = ((self.frame * 8) % width as u64) as u32;
            for y in 0..self.format.height {
                for x in bar_x..(bar_x + Self::BAR_WIDTH).min(width) {
                    let i = ((y * self.format.stride) + x * 4) as usize;
                    data[i..i + 3].fill(0xff);
                }
            }
        }
        self.frame += 1;
        Ok(RawImage {
            format: self.format,
            data,
        })
    }

    fn name(&self) -> String {
        format!("test pattern {}x{}", self.format.width, self.format.height)
    }
}

//! Interleaves encoded video and audio into one timestamp-ordered stream

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::CastError;
use crate::queue::{BoundedQueue, CloseOnDrop, PopResult};
use crate::state::PipelineContext;
use crate::types::{EncodedUnit, MuxedPacket, StreamKind};

/// Per-kind input bookkeeping
struct Lane {
    kind: StreamKind,
    queue: Arc<BoundedQueue<EncodedUnit>>,
    pending: Option<EncodedUnit>,
    last_pts: Option<Duration>,
    done: bool,
    /// Set after a wait for this kind timed out; cleared when it delivers
    stalled: bool,
}

impl Lane {
    fn new(kind: StreamKind, queue: Arc<BoundedQueue<EncodedUnit>>) -> Self {
        Self {
            kind,
            queue,
            pending: None,
            last_pts: None,
            done: false,
            stalled: false,
        }
    }

    /// Whether this lane may still produce a unit
    fn open(&self) -> bool {
        self.pending.is_some() || !self.done
    }

    fn accept(&mut self, unit: Option<EncodedUnit>) {
        match unit {
            Some(unit) => {
                if self.stalled {
                    info!("{} units resumed", self.kind);
                    self.stalled = false;
                }
                self.pending = Some(unit);
            }
            None => {
                debug!("{} input closed", self.kind);
                self.done = true;
            }
        }
    }

    /// Take whatever is already queued without waiting
    fn refill(&mut self) {
        if self.pending.is_some() || self.done {
            return;
        }
        match self.queue.try_pop() {
            Some(unit) => self.accept(Some(unit)),
            None if self.queue.is_finished() => self.accept(None),
            None => {}
        }
    }
}

enum Wake {
    Video(Option<EncodedUnit>),
    Audio(Option<EncodedUnit>),
    Shutdown,
}

/// Merges the two encoded streams into [`MuxedPacket`]s
///
/// Holds at most one pending unit per kind and always emits the one with the
/// smaller timestamp, video first on ties. A unit older than the last one
/// emitted for its kind is dropped, never reordered.
pub struct Muxer {
    video: Lane,
    audio: Lane,
    output: CloseOnDrop<MuxedPacket>,
    mux_wait: Duration,
    ctx: PipelineContext,
    emitted: u64,
}

impl Muxer {
    pub fn new(
        video: Arc<BoundedQueue<EncodedUnit>>,
        audio: Arc<BoundedQueue<EncodedUnit>>,
        output: Arc<BoundedQueue<MuxedPacket>>,
        mux_wait: Duration,
        ctx: PipelineContext,
    ) -> Self {
        Self {
            video: Lane::new(StreamKind::Video, video),
            audio: Lane::new(StreamKind::Audio, audio),
            output: CloseOnDrop::new(output),
            mux_wait,
            ctx,
            emitted: 0,
        }
    }

    /// Mux until both inputs are closed and flushed, or `shutdown` fires
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Muxer started (wait {:?})", self.mux_wait);

        loop {
            self.video.refill();
            self.audio.refill();

            match (self.video.pending.is_some(), self.audio.pending.is_some()) {
                (true, true) => {
                    let video_first = match (&self.video.pending, &self.audio.pending) {
                        (Some(v), Some(a)) => v.pts <= a.pts,
                        _ => true,
                    };
                    if video_first {
                        self.emit_video();
                    } else {
                        self.emit_audio();
                    }
                }
                (false, false) => {
                    if !self.video.open() && !self.audio.open() {
                        break;
                    }
                    if !self.wait_any(&shutdown).await {
                        return self.finish_early();
                    }
                }
                (true, false) => {
                    if !self.wait_for_audio(&shutdown).await {
                        return self.finish_early();
                    }
                }
                (false, true) => {
                    if !self.wait_for_video(&shutdown).await {
                        return self.finish_early();
                    }
                }
            }
        }

        info!("Muxer drained after {} packets", self.emitted);
    }

    fn finish_early(self) {
        info!("Muxer stopped after {} packets", self.emitted);
    }

    /// Wait for either input; false on shutdown
    async fn wait_any(&mut self, shutdown: &CancellationToken) -> bool {
        let (video, audio) = (self.video.queue.clone(), self.audio.queue.clone());
        let wake = tokio::select! {
            biased;
            _ = shutdown.cancelled() => Wake::Shutdown,
            unit = video.pop(), if !self.video.done => Wake::Video(unit),
            unit = audio.pop(), if !self.audio.done => Wake::Audio(unit),
        };
        self.apply(wake)
    }

    /// Video is pending: give audio up to `mux_wait` to catch up
    async fn wait_for_audio(&mut self, shutdown: &CancellationToken) -> bool {
        if self.audio.done || self.audio.stalled {
            self.emit_video();
            return true;
        }
        let audio = self.audio.queue.clone();
        let wake = tokio::select! {
            biased;
            _ = shutdown.cancelled() => Wake::Shutdown,
            result = audio.pop_timeout(self.mux_wait) => match result {
                PopResult::Item(unit) => Wake::Audio(Some(unit)),
                PopResult::Closed => Wake::Audio(None),
                PopResult::TimedOut => {
                    self.stall(StreamKind::Audio);
                    self.emit_video();
                    return true;
                }
            },
        };
        self.apply(wake)
    }

    /// Audio is pending: give video up to `mux_wait` to catch up
    async fn wait_for_video(&mut self, shutdown: &CancellationToken) -> bool {
        if self.video.done || self.video.stalled {
            self.emit_audio();
            return true;
        }
        let video = self.video.queue.clone();
        let wake = tokio::select! {
            biased;
            _ = shutdown.cancelled() => Wake::Shutdown,
            result = video.pop_timeout(self.mux_wait) => match result {
                PopResult::Item(unit) => Wake::Video(Some(unit)),
                PopResult::Closed => Wake::Video(None),
                PopResult::TimedOut => {
                    self.stall(StreamKind::Video);
                    self.emit_audio();
                    return true;
                }
            },
        };
        self.apply(wake)
    }

    fn apply(&mut self, wake: Wake) -> bool {
        match wake {
            Wake::Video(unit) => self.video.accept(unit),
            Wake::Audio(unit) => self.audio.accept(unit),
            Wake::Shutdown => return false,
        }
        true
    }

    fn stall(&mut self, kind: StreamKind) {
        self.ctx.metrics.add_mux_stall_timeouts(1);
        warn!(
            "No {} units for {:?}, muxing the other stream alone",
            kind, self.mux_wait
        );
        match kind {
            StreamKind::Video => self.video.stalled = true,
            StreamKind::Audio => self.audio.stalled = true,
        }
    }

    fn emit_video(&mut self) {
        if let Some(unit) = self.video.pending.take() {
            Self::emit(&mut self.video.last_pts, unit, &self.output, &self.ctx, &mut self.emitted);
        }
    }

    fn emit_audio(&mut self) {
        if let Some(unit) = self.audio.pending.take() {
            Self::emit(&mut self.audio.last_pts, unit, &self.output, &self.ctx, &mut self.emitted);
        }
    }

    fn emit(
        last_pts: &mut Option<Duration>,
        unit: EncodedUnit,
        output: &BoundedQueue<MuxedPacket>,
        ctx: &PipelineContext,
        emitted: &mut u64,
    ) {
        if let Some(last) = *last_pts {
            if unit.pts < last {
                let err = CastError::MuxOrderViolation(format!(
                    "{} unit {} at {:?} is behind {:?}",
                    unit.kind, unit.sequence, unit.pts, last
                ));
                ctx.metrics.add_mux_order_violations(1);
                warn!("Dropping unit: {}", err);
                return;
            }
        }
        *last_pts = Some(unit.pts);

        let packet = MuxedPacket::wrap(unit);
        *emitted += 1;
        ctx.metrics.add_packets_muxed(1);
        if output.push(packet).is_drop() {
            debug!("Packet queue full, evicted oldest packet");
        }
    }
}

//! Callback-driven audio capture
//!
//! Devices deliver blocks from their own thread through a [`BlockSink`]. The
//! sink never waits: it stamps the block with the pipeline clock and hands it
//! to a drop-oldest queue. An [`AudioSource`] supervises the device and
//! re-opens it once if it disappears mid-stream.

use std::f32::consts::TAU;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::AudioDevice;
use crate::clock::Clock;
use crate::error::{CastError, Result};
use crate::queue::{BoundedQueue, CloseOnDrop};
use crate::state::PipelineContext;
use crate::stats::PipelineMetrics;
use crate::types::{samples_to_duration, CapturedAudioBlock};

/// Non-blocking hand-off from a device callback into the pipeline
///
/// Cheap to clone; clones share the sequence counter so numbering continues
/// across a device re-open.
#[derive(Clone)]
pub struct BlockSink {
    queue: Arc<BoundedQueue<CapturedAudioBlock>>,
    clock: Arc<Clock>,
    metrics: Arc<PipelineMetrics>,
    sequence: Arc<AtomicU64>,
}

impl BlockSink {
    pub fn new(
        queue: Arc<BoundedQueue<CapturedAudioBlock>>,
        clock: Arc<Clock>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            queue,
            clock,
            metrics,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queue one block of interleaved samples
    ///
    /// The block is stamped with the time its first sample was recorded (the
    /// delivery time minus the block duration). When the queue is full the
    /// oldest queued block is evicted. Safe to call from a real-time thread:
    /// no await and only a brief uncontended lock.
    pub fn push(&self, samples: Vec<f32>, sample_rate: u32, channels: u16) {
        let sample_count = (samples.len() / channels.max(1) as usize) as u32;
        let duration = samples_to_duration(sample_count as u64, sample_rate);
        let block = CapturedAudioBlock {
            samples,
            sample_count,
            sample_rate,
            channels,
            captured_at: self.clock.now().saturating_sub(duration),
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
        };
        self.metrics.add_audio_blocks_captured(1);
        if self.queue.push(block).is_drop() {
            self.metrics.add_audio_blocks_evicted(1);
        }
    }

    /// Number of blocks pushed so far
    pub fn blocks_pushed(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }
}

/// Lets a device report that it went away
#[derive(Debug, Clone)]
pub struct LossNotifier {
    tx: mpsc::UnboundedSender<String>,
}

impl LossNotifier {
    fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Report device loss; callable from any thread
    pub fn device_lost(&self, reason: impl Into<String>) {
        let _ = self.tx.send(reason.into());
    }
}

/// A running device stream; dropping it stops delivery
pub struct DeviceStream {
    _guard: Box<dyn Send>,
}

impl DeviceStream {
    /// Wrap whatever keeps the device running
    pub fn new(guard: impl Send + 'static) -> Self {
        Self {
            _guard: Box::new(guard),
        }
    }
}

/// Supervises an audio device for the lifetime of a stream
pub struct AudioSource {
    device: Box<dyn AudioDevice>,
    sink: BlockSink,
    stream: DeviceStream,
    loss_tx: LossNotifier,
    loss_rx: mpsc::UnboundedReceiver<String>,
    ctx: PipelineContext,
    _close: CloseOnDrop<CapturedAudioBlock>,
}

impl AudioSource {
    /// Open the device and start delivering into `output`
    ///
    /// Failure to open is a [`CastError::FatalInit`]. `output` should use
    /// [`crate::queue::DropPolicy::DropOldest`].
    pub fn open(
        mut device: Box<dyn AudioDevice>,
        ctx: PipelineContext,
        output: Arc<BoundedQueue<CapturedAudioBlock>>,
    ) -> Result<Self> {
        let sink = BlockSink::new(output.clone(), ctx.clock.clone(), ctx.metrics.clone());
        let (loss_tx, loss_rx) = LossNotifier::channel();
        let stream = device
            .open(sink.clone(), loss_tx.clone())
            .map_err(|e| CastError::init(format!("failed to open {}: {}", device.name(), e)))?;
        info!("Audio device '{}' opened", device.name());

        Ok(Self {
            device,
            sink,
            stream,
            loss_tx,
            loss_rx,
            ctx,
            _close: CloseOnDrop::new(output),
        })
    }

    /// Supervise until `stop` fires or the device is lost for good
    ///
    /// The device stream is dropped and the output queue closed on return.
    pub async fn run(mut self, stop: CancellationToken) {
        let name = self.device.name();
        loop {
            let reason = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                reason = self.loss_rx.recv() => match reason {
                    Some(reason) => reason,
                    None => break,
                },
            };

            warn!("Audio device '{}' lost: {}; re-opening", name, reason);
            // Stop the dead stream before opening a new one
            self.stream = DeviceStream::new(());
            self.ctx.metrics.add_source_reopens(1);

            match self.device.open(self.sink.clone(), self.loss_tx.clone()) {
                Ok(stream) => {
                    self.stream = stream;
                    // Anything queued came from the old stream
                    while self.loss_rx.try_recv().is_ok() {}
                    info!("Audio device '{}' re-opened", name);
                }
                Err(e) => {
                    self.ctx.faults.report(
                        "audio source",
                        CastError::source_lost(format!(
                            "{} lost ({}) and re-open failed: {}",
                            name, reason, e
                        )),
                    );
                    break;
                }
            }
        }

        debug!(
            "Audio source '{}' stopped after {} blocks",
            name,
            self.sink.blocks_pushed()
        );
    }
}

/// Generates a sine tone in fixed-size blocks at real-time cadence
///
/// Runs as a tokio task, so under paused time it delivers blocks
/// deterministically.
pub struct SyntheticAudioDevice {
    sample_rate: u32,
    channels: u16,
    block_size: u32,
    frequency: f32,
    phase: Arc<parking_lot::Mutex<f32>>,
}

impl SyntheticAudioDevice {
    pub fn new(sample_rate: u32, channels: u16, block_size: u32) -> Self {
        Self {
            sample_rate,
            channels,
            block_size,
            frequency: 440.0,
            phase: Arc::new(parking_lot::Mutex::new(0.0)),
        }
    }

    /// Tone frequency in Hz
    pub fn with_frequency(mut self, frequency: f32) -> Self {
        self.frequency = frequency;
        self
    }

    fn block_period(&self) -> Duration {
        samples_to_duration(self.block_size as u64, self.sample_rate)
    }
}

impl AudioDevice for SyntheticAudioDevice {
    fn open(&mut self, sink: BlockSink, _loss: LossNotifier) -> Result<DeviceStream> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| CastError::init("synthetic audio requires a tokio runtime"))?;

        let period = self.block_period();
        if period.is_zero() {
            return Err(CastError::init("synthetic audio block duration is zero"));
        }

        let token = CancellationToken::new();
        let cancel = token.clone();
        let (sample_rate, channels, block_size) = (self.sample_rate, self.channels, self.block_size);
        let step = TAU * self.frequency / sample_rate as f32;
        let phase = self.phase.clone();

        handle.spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let mut samples = Vec::with_capacity(block_size as usize * channels as usize);
                let mut p = *phase.lock();
                for _ in 0..block_size {
                    let value = p.sin() * 0.25;
                    for _ in 0..channels {
                        samples.push(value);
                    }
                    p = (p + step) % TAU;
                }
                *phase.lock() = p;
                sink.push(samples, sample_rate, channels);
            }
        });

        Ok(DeviceStream::new(token.drop_guard()))
    }

    fn name(&self) -> String {
        format!("synthetic {} Hz tone", self.frequency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::DropPolicy;

    #[test]
    fn test_sink_evicts_oldest_and_stamps_block_start() {
        let (ctx, _faults) = PipelineContext::standalone();
        let queue = BoundedQueue::new("audio", 2, DropPolicy::DropOldest);
        let sink = BlockSink::new(queue.clone(), ctx.clock.clone(), ctx.metrics.clone());
        for _ in 0..3 {
            sink.push(vec![0.0; 8], 8000, 2);
        }
        assert_eq!(ctx.metrics.audio_blocks_evicted(), 1);
        let first = queue.try_pop().unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(first.sample_count, 4);
        assert_eq!(queue.try_pop().unwrap().sequence, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_synthetic_device_delivers_at_block_cadence() {
        let (ctx, _faults) = PipelineContext::standalone();
        let queue = BoundedQueue::new("audio", 64, DropPolicy::DropOldest);
        let source = AudioSource::open(
            Box::new(SyntheticAudioDevice::new(1000, 1, 100)),
            ctx,
            queue.clone(),
        )
        .unwrap();
        let stop = CancellationToken::new();
        let task = tokio::spawn(source.run(stop.clone()));

        tokio::time::sleep(Duration::from_millis(550)).await;
        stop.cancel();
        task.await.unwrap();

        let mut stamps = Vec::new();
        while let Some(block) = queue.try_pop() {
            assert_eq!(block.samples.len(), 100);
            stamps.push(block.captured_at);
        }
        let expected: Vec<_> = (0..5).map(|i| Duration::from_millis(i * 100)).collect();
        assert_eq!(stamps, expected);
        assert!(queue.is_closed());
    }
}

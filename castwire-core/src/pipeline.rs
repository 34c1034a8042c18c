//! Pipeline controller
//!
//! Owns the lifecycle of one streaming session at a time:
//!
//! ```text
//!   Idle ──start──▶ Starting ──▶ Streaming ──stop──▶ Stopping ──▶ Idle
//!     ▲                │                                │
//!     └── init error ──┘        any stage fault ──▶ Faulted
//! ```
//!
//! Every `start` builds a fresh set of components through a
//! [`PipelineBackend`], wires them with bounded queues and spawns one task
//! per stage. `stop` stops the sources first and lets the rest drain; a fault
//! from any stage tears everything down at once.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capture::{AudioDevice, AudioSource, FrameGrabber, FrameSource};
use crate::capture::{SyntheticAudioDevice, TestPatternGrabber};
use crate::clock::Clock;
use crate::config::{AudioSourceKind, PipelineConfig, VideoSourceKind};
use crate::credentials::{provider_for, Destination, StreamKeyProvider};
use crate::encode::{audio_codec_for, video_codec_for, AudioCodec, VideoCodec};
use crate::encode::{AudioEncoder, VideoEncoder};
use crate::error::{CastError, Result, ResultExt};
use crate::mux::Muxer;
use crate::output::{connector_for, Connector, Transport, TransportState};
use crate::queue::{BoundedQueue, DropPolicy};
use crate::state::{Fault, FaultReporter, PipelineContext, PipelineState, StateHandle};
use crate::stats::{MetricsSnapshot, PipelineMetrics};
use crate::types::StreamInfo;
use crate::worker::WorkerCount;

/// Extra time stages get to react to cancellation before they are aborted
const ABORT_GRACE: Duration = Duration::from_millis(500);

/// Factory for the per-session components
///
/// The default methods build the real thing from the config; tests override
/// them to inject fake devices, codecs and connections.
pub trait PipelineBackend: Send + Sync {
    fn frame_grabber(&self, config: &PipelineConfig) -> Result<Box<dyn FrameGrabber>>;

    fn audio_device(&self, config: &PipelineConfig) -> Result<Box<dyn AudioDevice>>;

    fn video_codec(&self, config: &PipelineConfig) -> Result<Box<dyn VideoCodec>> {
        video_codec_for(config)
    }

    fn audio_codec(&self, config: &PipelineConfig) -> Result<Box<dyn AudioCodec>> {
        audio_codec_for(config)
    }

    fn connector(&self, destination: &Destination, config: &PipelineConfig) -> Arc<dyn Connector> {
        connector_for(destination, config)
    }

    fn stream_key_provider(&self, config: &PipelineConfig) -> Box<dyn StreamKeyProvider> {
        provider_for(config)
    }
}

/// Builds sources from the configured source kinds
#[derive(Debug, Default)]
pub struct DefaultBackend;

impl PipelineBackend for DefaultBackend {
    fn frame_grabber(&self, config: &PipelineConfig) -> Result<Box<dyn FrameGrabber>> {
        match config.video_source {
            VideoSourceKind::TestPattern => Ok(Box::new(TestPatternGrabber::new(
                config.width(),
                config.height(),
            ))),
            #[cfg(feature = "screen")]
            VideoSourceKind::Screen => Ok(Box::new(crate::capture::ScreenGrabber::open(
                config.display,
                config.width(),
                config.height(),
            )?)),
            #[cfg(not(feature = "screen"))]
            VideoSourceKind::Screen => Err(CastError::init(
                "screen capture requires castwire built with the `screen` feature",
            )),
        }
    }

    fn audio_device(&self, config: &PipelineConfig) -> Result<Box<dyn AudioDevice>> {
        match config.audio_source {
            AudioSourceKind::Synthetic => Ok(Box::new(SyntheticAudioDevice::new(
                config.sample_rate,
                config.channels,
                config.block_size,
            ))),
            #[cfg(feature = "microphone")]
            AudioSourceKind::Microphone => Ok(Box::new(crate::capture::MicrophoneDevice::new(
                config.sample_rate,
                config.channels,
                config.block_size,
            ))),
            #[cfg(not(feature = "microphone"))]
            AudioSourceKind::Microphone => Err(CastError::init(
                "microphone capture requires castwire built with the `microphone` feature",
            )),
        }
    }
}

/// One running session
struct Run {
    id: u64,
    capture_stop: CancellationToken,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    monitor: Option<JoinHandle<()>>,
}

impl Run {
    /// Wait for every stage until `deadline`; finished handles are removed
    async fn join_until(&mut self, deadline: Instant) -> bool {
        while let Some(task) = self.tasks.last_mut() {
            if tokio::time::timeout_at(deadline, task).await.is_err() {
                return false;
            }
            self.tasks.pop();
        }
        true
    }

    /// Cancel everything, give stages a moment, then abort stragglers
    async fn teardown(mut self) {
        self.shutdown.cancel();
        if !self.join_until(Instant::now() + ABORT_GRACE).await {
            warn!("Aborting {} stages that did not stop", self.tasks.len());
            for task in &self.tasks {
                task.abort();
            }
            for task in self.tasks.drain(..) {
                let _ = task.await;
            }
        }
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
    }
}

struct Inner {
    config: parking_lot::Mutex<PipelineConfig>,
    backend: Arc<dyn PipelineBackend>,
    state: watch::Sender<PipelineState>,
    transport_state: Arc<watch::Sender<TransportState>>,
    metrics: parking_lot::Mutex<Arc<PipelineMetrics>>,
    last_fault: parking_lot::Mutex<Option<Arc<Fault>>>,
    /// Held for the whole of every transition
    run: tokio::sync::Mutex<Option<Run>>,
    generation: AtomicU64,
    workers: WorkerCount,
    exited: AtomicBool,
}

impl Inner {
    fn set_state(&self, state: PipelineState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!("Pipeline {} -> {}", previous, state);
        }
    }

    /// Move from `from` to `to`, leaving any other state alone
    fn transition(&self, from: PipelineState, to: PipelineState) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            info!("Pipeline {} -> {}", from, to);
        }
        changed
    }
}

/// Drives the capture → encode → mux → transport pipeline
///
/// Cheap to clone; clones control the same pipeline.
#[derive(Clone)]
pub struct PipelineController {
    inner: Arc<Inner>,
}

impl PipelineController {
    /// Controller building real devices from `config`
    pub fn new(config: PipelineConfig) -> Self {
        Self::with_backend(config, Arc::new(DefaultBackend))
    }

    /// Controller building components through `backend`
    pub fn with_backend(config: PipelineConfig, backend: Arc<dyn PipelineBackend>) -> Self {
        let (state, _) = watch::channel(PipelineState::Idle);
        let (transport_state, _) = watch::channel(TransportState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config: parking_lot::Mutex::new(config),
                backend,
                state,
                transport_state: Arc::new(transport_state),
                metrics: parking_lot::Mutex::new(Arc::new(PipelineMetrics::new())),
                last_fault: parking_lot::Mutex::new(None),
                run: tokio::sync::Mutex::new(None),
                generation: AtomicU64::new(0),
                workers: WorkerCount::new(),
                exited: AtomicBool::new(false),
            }),
        }
    }

    /// Current state
    pub fn state(&self) -> PipelineState {
        *self.inner.state.borrow()
    }

    /// Handle for observing state transitions
    pub fn subscribe(&self) -> StateHandle {
        StateHandle::new(self.inner.state.subscribe())
    }

    /// Counters of the current (or last) session
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.lock().snapshot()
    }

    /// Connection state of the transport
    pub fn transport_state(&self) -> TransportState {
        *self.inner.transport_state.borrow()
    }

    /// The fault behind the last transition to `Faulted`
    pub fn last_fault(&self) -> Option<Arc<Fault>> {
        self.inner.last_fault.lock().clone()
    }

    /// Number of stage tasks still alive
    pub fn active_workers(&self) -> usize {
        self.inner.workers.active()
    }

    /// The config the next `start` will use
    pub fn config(&self) -> PipelineConfig {
        self.inner.config.lock().clone()
    }

    /// Replace the config used by the next `start`
    pub fn set_config(&self, config: PipelineConfig) {
        *self.inner.config.lock() = config;
    }

    /// Build and start every stage
    ///
    /// A no-op while starting or streaming. Credential and config errors
    /// leave the state untouched; a device or encoder that fails to open
    /// returns the pipeline to `Idle`.
    pub async fn start(&self) -> Result<()> {
        if self.inner.exited.load(Ordering::SeqCst) {
            return Err(CastError::InvalidState("controller has exited".into()));
        }
        let mut run = self.inner.run.lock().await;

        match self.state() {
            PipelineState::Starting | PipelineState::Streaming => {
                debug!("start ignored, pipeline already {}", self.state());
                return Ok(());
            }
            PipelineState::Stopping => {
                return Err(CastError::InvalidState("pipeline is stopping".into()));
            }
            PipelineState::Idle | PipelineState::Faulted => {}
        }

        // A faulted session whose teardown has not run yet
        if let Some(old) = run.take() {
            old.teardown().await;
        }

        let config = self.config();
        config.validate_strict()?;
        let destination = self.destination(&config).await?;

        self.inner.set_state(PipelineState::Starting);
        match self.build(&config, destination) {
            Ok(started) => {
                *run = Some(started);
                self.inner.transition(PipelineState::Starting, PipelineState::Streaming);
                Ok(())
            }
            Err(e) => {
                error!("Pipeline failed to start: {}", e);
                self.inner.set_state(PipelineState::Idle);
                Err(e)
            }
        }
    }

    async fn destination(&self, config: &PipelineConfig) -> Result<Destination> {
        let without_key = Destination::new(config.ingest_url.as_str(), "");
        if without_key.is_file() {
            return Ok(without_key);
        }
        let key = self
            .inner
            .backend
            .stream_key_provider(config)
            .stream_key()
            .await?;
        Ok(Destination::new(config.ingest_url.as_str(), key))
    }

    /// Open devices and codecs, wire the queues and spawn the stages
    fn build(&self, config: &PipelineConfig, destination: Destination) -> Result<Run> {
        let backend = &self.inner.backend;
        let id = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let metrics = Arc::new(PipelineMetrics::new());
        *self.inner.metrics.lock() = metrics.clone();
        self.inner.transport_state.send_replace(TransportState::Disconnected);

        let (faults, fault_rx) = FaultReporter::channel();
        let ctx = PipelineContext {
            clock: Arc::new(Clock::start()),
            state: self.subscribe(),
            metrics,
            faults,
        };

        let grabber = backend.frame_grabber(config).context("video source")?;
        let device = backend.audio_device(config).context("audio source")?;
        let video_codec = backend.video_codec(config).context("video encoder")?;
        let audio_codec = backend.audio_codec(config).context("audio encoder")?;
        let info = StreamInfo {
            video: video_codec.track(),
            audio: audio_codec.track(),
        };

        let frames = BoundedQueue::new("frames", config.video_queue, DropPolicy::DropNewest);
        let blocks = BoundedQueue::new("audio blocks", config.audio_queue, DropPolicy::DropOldest);
        let video_units =
            BoundedQueue::new("encoded video", config.encoded_queue, DropPolicy::DropNewest);
        let audio_units =
            BoundedQueue::new("encoded audio", config.encoded_queue, DropPolicy::DropOldest);
        let packets = BoundedQueue::new("packets", config.packet_queue, DropPolicy::DropOldest);

        let audio_source = AudioSource::open(device, ctx.clone(), blocks.clone())?;
        let frame_source = FrameSource::new(grabber, config.fps(), ctx.clone(), frames.clone());
        let video_encoder = VideoEncoder::new(
            video_codec,
            config.keyframe_interval,
            ctx.clone(),
            frames,
            video_units.clone(),
        );
        let audio_encoder = AudioEncoder::new(audio_codec, ctx.clone(), blocks, audio_units.clone());
        let muxer = Muxer::new(video_units, audio_units, packets.clone(), config.mux_wait, ctx.clone());
        let connector = backend.connector(&destination, config);
        let transport = Transport::new(
            connector,
            destination,
            info,
            config,
            packets,
            ctx,
            self.inner.transport_state.clone(),
        );

        let shutdown = CancellationToken::new();
        let capture_stop = shutdown.child_token();

        let tasks = vec![
            self.spawn_stage("frame source", frame_source.run(capture_stop.clone())),
            self.spawn_stage("audio source", audio_source.run(capture_stop.clone())),
            self.spawn_stage("video encoder", video_encoder.run(shutdown.clone())),
            self.spawn_stage("audio encoder", audio_encoder.run(shutdown.clone())),
            self.spawn_stage("muxer", muxer.run(shutdown.clone())),
            self.spawn_stage("transport", transport.run(shutdown.clone())),
        ];
        let monitor = tokio::spawn(monitor_faults(
            self.inner.clone(),
            id,
            fault_rx,
            shutdown.clone(),
        ));

        info!(
            "Pipeline started: {}x{} @ {}fps, {} Hz/{} ch audio",
            config.width(),
            config.height(),
            config.fps(),
            config.sample_rate,
            config.channels
        );
        Ok(Run {
            id,
            capture_stop,
            shutdown,
            tasks,
            monitor: Some(monitor),
        })
    }

    fn spawn_stage<F>(&self, name: &'static str, stage: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.inner.workers.enter();
        tokio::spawn(async move {
            let _guard = guard;
            stage.await;
            debug!("{} exited", name);
        })
    }

    /// Stop the sources, drain in-flight units into the transport and close it
    ///
    /// Whatever has not drained within `drain_timeout` is cancelled. A no-op
    /// when nothing is running.
    pub async fn stop(&self) -> Result<()> {
        let mut run = self.inner.run.lock().await;
        let Some(mut current) = run.take() else {
            return Ok(());
        };

        if self.state() == PipelineState::Faulted {
            current.teardown().await;
            return Ok(());
        }

        self.inner.set_state(PipelineState::Stopping);
        let drain_timeout = self.inner.config.lock().drain_timeout;
        current.capture_stop.cancel();

        if current.join_until(Instant::now() + drain_timeout).await {
            info!("Pipeline drained");
        } else {
            warn!(
                "Drain did not finish within {:?}, cancelling remaining stages",
                drain_timeout
            );
        }
        current.teardown().await;

        self.inner.transition(PipelineState::Stopping, PipelineState::Idle);
        info!("Pipeline stopped: {}", self.metrics());
        Ok(())
    }

    /// Stop, then refuse any further `start`
    pub async fn exit(&self) -> Result<()> {
        self.stop().await?;
        self.inner.exited.store(true, Ordering::SeqCst);
        info!("Pipeline controller exited");
        Ok(())
    }
}

/// Waits for the first fault of session `id` and tears the session down
async fn monitor_faults(
    inner: Arc<Inner>,
    id: u64,
    mut faults: mpsc::UnboundedReceiver<Fault>,
    shutdown: CancellationToken,
) {
    let Some(fault) = faults.recv().await else {
        return;
    };
    if inner.generation.load(Ordering::SeqCst) != id {
        return;
    }

    error!("Pipeline faulted in {}: {}", fault.stage, fault.error);
    *inner.last_fault.lock() = Some(Arc::new(fault));
    inner.set_state(PipelineState::Faulted);
    shutdown.cancel();

    let mut run = inner.run.lock().await;
    if let Some(mut current) = run.take_if(|r| r.id == id) {
        // Detach ourselves so teardown does not abort this task
        current.monitor = None;
        current.teardown().await;
        debug!("Faulted session {} torn down", id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_stop_when_idle_is_noop() {
        let controller = PipelineController::new(PipelineConfig::default());
        controller.stop().await.unwrap();
        assert_eq!(controller.state(), PipelineState::Idle);
        assert_eq!(controller.active_workers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_key_leaves_state_unchanged() {
        let config = PipelineConfig::default();
        let config = PipelineConfig {
            stream_key: None,
            stream_key_env: "CASTWIRE_TEST_UNSET_KEY_VAR".into(),
            ..config
        };
        let controller = PipelineController::new(config);
        let err = controller.start().await.unwrap_err();
        assert!(matches!(err.root(), CastError::Credentials(_)));
        assert_eq!(controller.state(), PipelineState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_refuses_start() {
        let controller = PipelineController::new(PipelineConfig::default());
        controller.exit().await.unwrap();
        assert!(matches!(
            controller.start().await,
            Err(CastError::InvalidState(_))
        ));
    }
}

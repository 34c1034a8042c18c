//! Mock infrastructure for testing
//!
//! Fake capture devices and a recording connection with failure injection,
//! plus a [`PipelineBackend`] wiring them into a controller. Everything runs
//! on tokio time so tests can use paused time.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use castwire_core::capture::{AudioDevice, BlockSink, DeviceStream, FrameGrabber, LossNotifier};
use castwire_core::config::{PipelineConfig, Preset, TransportPolicy};
use castwire_core::output::{Connection, Connector};
use castwire_core::types::{
    AudioTrack, EncodedUnit, FrameFormat, MuxedPacket, PixelFormat, RawImage, StreamInfo,
    StreamKind, VideoTrack,
};
use castwire_core::{CastError, Destination, PipelineBackend, Result};

/// A 64x64 @ 10fps, 100ms-audio-block config with a static stream key
pub fn test_config() -> PipelineConfig {
    PipelineConfig::default()
        .with_ingest_url("rtmp://ingest.test/app")
        .with_stream_key("test-key")
        .with_preset(Preset::Custom {
            width: 64,
            height: 64,
            fps: 10,
        })
        .with_audio_format(44100, 1, 4410)
        .with_transport(fast_transport())
}

/// Short backoff so reconnect tests finish quickly on paused time
pub fn fast_transport() -> TransportPolicy {
    TransportPolicy {
        max_retries: 5,
        initial_backoff: Duration::from_millis(100),
        max_backoff: Duration::from_secs(1),
        backlog: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(1),
        write_timeout: Duration::from_secs(1),
    }
}

/// Track description matching [`test_config`]
pub fn test_stream_info() -> StreamInfo {
    StreamInfo {
        video: VideoTrack {
            codec_id: 3,
            width: 64,
            height: 64,
            fps: 10,
            bitrate_kbps: 0,
            sequence_header: None,
        },
        audio: AudioTrack {
            sound_format: 3,
            sample_rate: 44100,
            channels: 1,
            bitrate_kbps: 705,
            sequence_header: None,
        },
    }
}

/// A muxed packet with a one-byte payload
pub fn packet(kind: StreamKind, ms: u64, keyframe: bool) -> MuxedPacket {
    MuxedPacket::wrap(EncodedUnit {
        kind,
        payload: bytes::Bytes::from_static(b"p"),
        pts: Duration::from_millis(ms),
        dts: Duration::from_millis(ms),
        keyframe,
        sequence: ms,
    })
}

/// Solid-colour grabber that can start failing after a number of grabs
pub struct FakeGrabber {
    format: FrameFormat,
    grabs: u64,
    fail_after: Option<u64>,
}

impl FakeGrabber {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            format: FrameFormat::packed(width, height, PixelFormat::Bgra),
            grabs: 0,
            fail_after: None,
        }
    }

    /// Every grab after the first `grabs` fails
    pub fn failing_after(mut self, grabs: u64) -> Self {
        self.fail_after = Some(grabs);
        self
    }
}

impl FrameGrabber for FakeGrabber {
    fn grab(&mut self) -> Result<RawImage> {
        if self.fail_after.is_some_and(|limit| self.grabs >= limit) {
            return Err(CastError::capture("display went away"));
        }
        self.grabs += 1;
        let shade = (self.grabs * 8 % 256) as u8;
        Ok(RawImage {
            format: self.format,
            data: vec![shade; self.format.buffer_len()],
        })
    }

    fn name(&self) -> String {
        "fake display".into()
    }
}

/// Controls shared between a test and the audio devices it creates
#[derive(Debug, Default)]
pub struct AudioControl {
    /// Report loss this long after each open
    pub kill_after: Mutex<Option<Duration>>,
    /// Whether re-opening a device after loss fails
    pub fail_reopen: AtomicBool,
    /// Successful opens across all devices
    pub opens: AtomicUsize,
}

/// Delivers silent blocks at real-time cadence from a tokio task
pub struct FakeAudioDevice {
    sample_rate: u32,
    channels: u16,
    block_size: u32,
    control: Arc<AudioControl>,
    opened: bool,
}

impl FakeAudioDevice {
    pub fn new(sample_rate: u32, channels: u16, block_size: u32, control: Arc<AudioControl>) -> Self {
        Self {
            sample_rate,
            channels,
            block_size,
            control,
            opened: false,
        }
    }
}

impl AudioDevice for FakeAudioDevice {
    fn open(&mut self, sink: BlockSink, loss: LossNotifier) -> Result<DeviceStream> {
        if self.opened && self.control.fail_reopen.load(Ordering::SeqCst) {
            return Err(CastError::capture("device is gone"));
        }
        self.opened = true;
        self.control.opens.fetch_add(1, Ordering::SeqCst);

        let period = Duration::from_secs(self.block_size as u64) / self.sample_rate;
        let kill_after = *self.control.kill_after.lock();
        let (rate, channels, block) = (self.sample_rate, self.channels, self.block_size);
        let token = CancellationToken::new();
        let cancel = token.clone();

        tokio::spawn(async move {
            let opened_at = tokio::time::Instant::now();
            let mut ticker = tokio::time::interval_at(opened_at + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if kill_after.is_some_and(|after| opened_at.elapsed() >= after) {
                    loss.device_lost("unplugged");
                    break;
                }
                sink.push(vec![0.0; block as usize * channels as usize], rate, channels);
            }
        });
        Ok(DeviceStream::new(token.drop_guard()))
    }

    fn name(&self) -> String {
        "fake microphone".into()
    }
}

/// Everything a [`RecordingConnector`] saw
#[derive(Debug, Default)]
pub struct ConnectionLog {
    pub packets: Mutex<Vec<MuxedPacket>>,
    /// Connect attempts, failed ones included
    pub attempts: AtomicUsize,
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    /// Outcome of upcoming connect attempts; empty means succeed
    pub connect_script: Mutex<VecDeque<bool>>,
    /// Zero-based write attempt that fails once
    pub fail_write_at: Mutex<Option<usize>>,
    /// Fail every write while set
    pub fail_all_writes: AtomicBool,
    writes: AtomicUsize,
}

impl ConnectionLog {
    pub fn timestamps(&self, kind: StreamKind) -> Vec<u32> {
        self.packets
            .lock()
            .iter()
            .filter(|p| p.kind == kind)
            .map(|p| p.timestamp_ms)
            .collect()
    }

    pub fn count(&self, kind: StreamKind) -> usize {
        self.packets.lock().iter().filter(|p| p.kind == kind).count()
    }

    /// Whether every opened connection was closed
    pub fn all_closed(&self) -> bool {
        let connects = self.connects.load(Ordering::SeqCst);
        connects > 0 && self.closes.load(Ordering::SeqCst) == connects
    }
}

/// Records written packets in memory
#[derive(Clone, Default)]
pub struct RecordingConnector {
    pub log: Arc<ConnectionLog>,
}

impl RecordingConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Connector for RecordingConnector {
    async fn connect(&self, _destination: &Destination, _info: &StreamInfo) -> Result<Box<dyn Connection>> {
        self.log.attempts.fetch_add(1, Ordering::SeqCst);
        let succeed = self.log.connect_script.lock().pop_front().unwrap_or(true);
        if !succeed {
            return Err(CastError::transport("connection refused"));
        }
        self.log.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RecordingConnection {
            log: self.log.clone(),
            closed: false,
        }))
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

struct RecordingConnection {
    log: Arc<ConnectionLog>,
    closed: bool,
}

#[async_trait]
impl Connection for RecordingConnection {
    async fn write(&mut self, packet: &MuxedPacket) -> Result<()> {
        assert!(!self.closed, "write after close");
        let index = self.log.writes.fetch_add(1, Ordering::SeqCst);
        if self.log.fail_all_writes.load(Ordering::SeqCst) {
            return Err(CastError::transport("broken pipe"));
        }
        let mut fail_at = self.log.fail_write_at.lock();
        if *fail_at == Some(index) {
            *fail_at = None;
            return Err(CastError::transport("connection reset by peer"));
        }
        drop(fail_at);
        self.log.packets.lock().push(packet.clone());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.log.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Builds fake devices and the recording connector
pub struct MockBackend {
    pub connector: RecordingConnector,
    pub audio: Arc<AudioControl>,
    /// Frame grabs before the display starts failing
    pub grabs_before_failure: Option<u64>,
    /// Make opening the video source fail
    pub fail_video_init: bool,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            connector: RecordingConnector::new(),
            audio: Arc::new(AudioControl::default()),
            grabs_before_failure: None,
            fail_video_init: false,
        }
    }

    pub fn log(&self) -> Arc<ConnectionLog> {
        self.connector.log.clone()
    }
}

impl PipelineBackend for MockBackend {
    fn frame_grabber(&self, config: &PipelineConfig) -> Result<Box<dyn FrameGrabber>> {
        if self.fail_video_init {
            return Err(CastError::init("no display available"));
        }
        let grabber = FakeGrabber::new(config.width(), config.height());
        Ok(Box::new(match self.grabs_before_failure {
            Some(grabs) => grabber.failing_after(grabs),
            None => grabber,
        }))
    }

    fn audio_device(&self, config: &PipelineConfig) -> Result<Box<dyn AudioDevice>> {
        Ok(Box::new(FakeAudioDevice::new(
            config.sample_rate,
            config.channels,
            config.block_size,
            self.audio.clone(),
        )))
    }

    fn connector(&self, _destination: &Destination, _config: &PipelineConfig) -> Arc<dyn Connector> {
        Arc::new(self.connector.clone())
    }
}

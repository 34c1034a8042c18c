//! Pipeline counters and latency tracking
//!
//! Every stage records into one shared [`PipelineMetrics`]; the controller and
//! CLI read [`MetricsSnapshot`]s. Counters are relaxed atomics so recording
//! never blocks a capture or encode loop.

use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Maximum number of samples to keep for rolling averages
const MAX_SAMPLES: usize = 120;

/// Rolling average calculator for timing data
#[derive(Debug)]
struct RollingAverage {
    samples: VecDeque<Duration>,
    max_samples: usize,
}

impl RollingAverage {
    fn new(max_samples: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples),
            max_samples,
        }
    }

    fn add(&mut self, duration: Duration) {
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(duration);
    }

    fn average_ms(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let total: Duration = self.samples.iter().sum();
        (total / self.samples.len() as u32).as_secs_f64() * 1000.0
    }
}

/// Shared counters for all pipeline stages
#[derive(Debug)]
pub struct PipelineMetrics {
    frames_captured: AtomicU64,
    frames_dropped: AtomicU64,
    capture_failures: AtomicU64,
    audio_blocks_captured: AtomicU64,
    audio_blocks_evicted: AtomicU64,
    source_reopens: AtomicU64,
    video_units_encoded: AtomicU64,
    audio_units_encoded: AtomicU64,
    encode_failures: AtomicU64,
    encoded_units_dropped: AtomicU64,
    packets_muxed: AtomicU64,
    mux_order_violations: AtomicU64,
    mux_stall_timeouts: AtomicU64,
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    packets_dropped_backlog: AtomicU64,
    packets_skipped_for_keyframe: AtomicU64,
    reconnects: AtomicU64,
    video_encode_latency: RwLock<RollingAverage>,
    audio_encode_latency: RwLock<RollingAverage>,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! counter {
    ($record:ident, $get:ident, $field:ident) => {
        #[doc = concat!("Increment `", stringify!($field), "`")]
        pub fn $record(&self, n: u64) {
            self.$field.fetch_add(n, Ordering::Relaxed);
        }

        #[doc = concat!("Current `", stringify!($field), "`")]
        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl PipelineMetrics {
    /// Create a zeroed metrics collector
    pub fn new() -> Self {
        Self {
            frames_captured: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            capture_failures: AtomicU64::new(0),
            audio_blocks_captured: AtomicU64::new(0),
            audio_blocks_evicted: AtomicU64::new(0),
            source_reopens: AtomicU64::new(0),
            video_units_encoded: AtomicU64::new(0),
            audio_units_encoded: AtomicU64::new(0),
            encode_failures: AtomicU64::new(0),
            encoded_units_dropped: AtomicU64::new(0),
            packets_muxed: AtomicU64::new(0),
            mux_order_violations: AtomicU64::new(0),
            mux_stall_timeouts: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            packets_dropped_backlog: AtomicU64::new(0),
            packets_skipped_for_keyframe: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            video_encode_latency: RwLock::new(RollingAverage::new(MAX_SAMPLES)),
            audio_encode_latency: RwLock::new(RollingAverage::new(MAX_SAMPLES)),
        }
    }

    counter!(add_frames_captured, frames_captured, frames_captured);
    counter!(add_frames_dropped, frames_dropped, frames_dropped);
    counter!(add_capture_failures, capture_failures, capture_failures);
    counter!(add_audio_blocks_captured, audio_blocks_captured, audio_blocks_captured);
    counter!(add_audio_blocks_evicted, audio_blocks_evicted, audio_blocks_evicted);
    counter!(add_source_reopens, source_reopens, source_reopens);
    counter!(add_video_units_encoded, video_units_encoded, video_units_encoded);
    counter!(add_audio_units_encoded, audio_units_encoded, audio_units_encoded);
    counter!(add_encode_failures, encode_failures, encode_failures);
    counter!(add_encoded_units_dropped, encoded_units_dropped, encoded_units_dropped);
    counter!(add_packets_muxed, packets_muxed, packets_muxed);
    counter!(add_mux_order_violations, mux_order_violations, mux_order_violations);
    counter!(add_mux_stall_timeouts, mux_stall_timeouts, mux_stall_timeouts);
    counter!(add_packets_sent, packets_sent, packets_sent);
    counter!(add_bytes_sent, bytes_sent, bytes_sent);
    counter!(add_packets_dropped_backlog, packets_dropped_backlog, packets_dropped_backlog);
    counter!(
        add_packets_skipped_for_keyframe,
        packets_skipped_for_keyframe,
        packets_skipped_for_keyframe
    );
    counter!(add_reconnects, reconnects, reconnects);

    /// Record how long a single video encode call took
    pub fn record_video_encode(&self, duration: Duration) {
        self.video_encode_latency.write().add(duration);
    }

    /// Record how long a single audio encode call took
    pub fn record_audio_encode(&self, duration: Duration) {
        self.audio_encode_latency.write().add(duration);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_captured: self.frames_captured(),
            frames_dropped: self.frames_dropped(),
            capture_failures: self.capture_failures(),
            audio_blocks_captured: self.audio_blocks_captured(),
            audio_blocks_evicted: self.audio_blocks_evicted(),
            source_reopens: self.source_reopens(),
            video_units_encoded: self.video_units_encoded(),
            audio_units_encoded: self.audio_units_encoded(),
            encode_failures: self.encode_failures(),
            encoded_units_dropped: self.encoded_units_dropped(),
            packets_muxed: self.packets_muxed(),
            mux_order_violations: self.mux_order_violations(),
            mux_stall_timeouts: self.mux_stall_timeouts(),
            packets_sent: self.packets_sent(),
            bytes_sent: self.bytes_sent(),
            packets_dropped_backlog: self.packets_dropped_backlog(),
            packets_skipped_for_keyframe: self.packets_skipped_for_keyframe(),
            reconnects: self.reconnects(),
            video_encode_ms: self.video_encode_latency.read().average_ms(),
            audio_encode_ms: self.audio_encode_latency.read().average_ms(),
        }
    }
}

/// Point-in-time copy of [`PipelineMetrics`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub capture_failures: u64,
    pub audio_blocks_captured: u64,
    pub audio_blocks_evicted: u64,
    pub source_reopens: u64,
    pub video_units_encoded: u64,
    pub audio_units_encoded: u64,
    pub encode_failures: u64,
    pub encoded_units_dropped: u64,
    pub packets_muxed: u64,
    pub mux_order_violations: u64,
    pub mux_stall_timeouts: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_dropped_backlog: u64,
    pub packets_skipped_for_keyframe: u64,
    pub reconnects: u64,
    /// Rolling average video encode time
    pub video_encode_ms: f64,
    /// Rolling average audio encode time
    pub audio_encode_ms: f64,
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "capture: {} frames ({} dropped, {} failed), {} audio blocks ({} evicted) | \
             encode: {} video, {} audio, {} failed ({:.1}ms/{:.1}ms) | \
             mux: {} packets, {} out-of-order | \
             send: {} packets ({:.2} MB), {} backlog drops, {} reconnects",
            self.frames_captured,
            self.frames_dropped,
            self.capture_failures,
            self.audio_blocks_captured,
            self.audio_blocks_evicted,
            self.video_units_encoded,
            self.audio_units_encoded,
            self.encode_failures,
            self.video_encode_ms,
            self.audio_encode_ms,
            self.packets_muxed,
            self.mux_order_violations,
            self.packets_sent,
            self.bytes_sent as f64 / 1_000_000.0,
            self.packets_dropped_backlog,
            self.reconnects
        )
    }
}

//! Transport stage: writes muxed packets to a connection and survives drops

use std::collections::VecDeque;
use std::hash::{BuildHasher, RandomState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Connection, Connector};
use crate::config::{PipelineConfig, TransportPolicy};
use crate::credentials::Destination;
use crate::error::CastError;
use crate::queue::BoundedQueue;
use crate::state::PipelineContext;
use crate::types::{MuxedPacket, StreamInfo};

/// Connection lifecycle as seen by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Input closed; flushing what is left before closing
    Draining,
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Draining => write!(f, "draining"),
        }
    }
}

/// Trim `backlog` so it starts at its most recent video keyframe
///
/// Returns how many packets were dropped from the front, or `None` when the
/// backlog holds no keyframe (it is left untouched).
pub fn resume_from_keyframe(backlog: &mut VecDeque<MuxedPacket>) -> Option<usize> {
    let start = backlog.iter().rposition(MuxedPacket::is_video_keyframe)?;
    backlog.drain(..start);
    Some(start)
}

/// Scale `base` by a random factor in [0.8, 1.2]
fn jittered(base: Duration, salt: u64) -> Duration {
    let hash = RandomState::new().hash_one(salt);
    let unit = (hash % 10_001) as f64 / 10_000.0;
    base.mul_f64(0.8 + 0.4 * unit)
}

/// Delivers muxed packets in arrival order over a [`Connection`]
///
/// While disconnected, packets collect in a backlog holding a few seconds of
/// stream; the oldest are dropped when it is full. A reconnect resumes at the
/// most recent buffered keyframe, or skips ahead to the next one.
pub struct Transport {
    connector: Arc<dyn Connector>,
    destination: Destination,
    info: StreamInfo,
    policy: TransportPolicy,
    backlog_capacity: usize,
    stats_interval: u64,
    input: Arc<BoundedQueue<MuxedPacket>>,
    ctx: PipelineContext,
    state: Arc<watch::Sender<TransportState>>,

    connection: Option<Box<dyn Connection>>,
    backlog: VecDeque<MuxedPacket>,
    /// Consecutive failed connects and writes since the last successful write
    failures: u32,
    backoff: Duration,
    retry_at: Option<Instant>,
    awaiting_keyframe: bool,
    connected_once: bool,
    sent: u64,
    started: Instant,
}

impl Transport {
    pub fn new(
        connector: Arc<dyn Connector>,
        destination: Destination,
        info: StreamInfo,
        config: &PipelineConfig,
        input: Arc<BoundedQueue<MuxedPacket>>,
        ctx: PipelineContext,
        state: Arc<watch::Sender<TransportState>>,
    ) -> Self {
        let backlog_capacity = config.backlog_packets().max(1);
        Self {
            connector,
            destination,
            info,
            policy: config.transport.clone(),
            backlog_capacity,
            stats_interval: config.stats_interval.max(1),
            input,
            ctx,
            state,
            connection: None,
            backlog: VecDeque::with_capacity(backlog_capacity),
            failures: 0,
            backoff: config.transport.initial_backoff,
            retry_at: None,
            awaiting_keyframe: false,
            connected_once: false,
            sent: 0,
            started: Instant::now(),
        }
    }

    /// Run until the input drains or `shutdown` fires
    ///
    /// Exhausting the retry budget reports a fatal `TransportWrite` fault.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            "Transport started: {} via {} (backlog {} packets)",
            self.destination,
            self.connector.name(),
            self.backlog_capacity
        );

        loop {
            if self.connection.is_none() && self.failures >= self.policy.max_retries {
                self.ctx.faults.report(
                    "transport",
                    CastError::transport(format!(
                        "giving up on {} after {} consecutive failures",
                        self.destination, self.failures
                    )),
                );
                break;
            }

            if self.connection.is_none() && self.retry_due() {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = self.try_connect() => {}
                };
                continue;
            }

            let retry_at = self.retry_at.filter(|_| self.connection.is_none());
            let input = self.input.clone();
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => continue,
                packet = input.pop() => packet,
            };

            match next {
                Some(packet) => self.handle(packet).await,
                None => {
                    self.drain().await;
                    return;
                }
            }
        }

        self.close_connection().await;
        self.set_state(TransportState::Disconnected);
        info!("Transport stopped after {} packets", self.sent);
    }

    fn retry_due(&self) -> bool {
        self.retry_at.is_none_or(|at| Instant::now() >= at)
    }

    fn set_state(&self, state: TransportState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Transport {} -> {}", previous, state);
        }
    }

    /// One connection attempt; on success the backlog is flushed
    ///
    /// The failure count is only cleared by a successful write, so a server
    /// that accepts connections but fails every write still exhausts it.
    async fn try_connect(&mut self) {
        self.set_state(TransportState::Connecting);
        let attempt = timeout(
            self.policy.connect_timeout,
            self.connector.connect(&self.destination, &self.info),
        )
        .await;
        let result = match attempt {
            Ok(result) => result,
            Err(_) => Err(CastError::transport(format!(
                "connect timed out after {:?}",
                self.policy.connect_timeout
            ))),
        };

        match result {
            Ok(connection) => {
                if self.connected_once {
                    self.ctx.metrics.add_reconnects(1);
                    info!(
                        "Reconnected to {} after {} failed attempts",
                        self.destination, self.failures
                    );
                } else {
                    info!("Connected to {}", self.destination);
                }
                self.connected_once = true;
                self.retry_at = None;
                self.connection = Some(connection);
                self.set_state(TransportState::Connected);
                self.flush_backlog().await;
            }
            Err(e) => {
                self.failures += 1;
                self.set_state(TransportState::Disconnected);
                if self.failures < self.policy.max_retries {
                    let delay = self.schedule_retry();
                    warn!(
                        "Connection attempt {} to {} failed: {}; retrying in {:?}",
                        self.failures, self.destination, e, delay
                    );
                } else {
                    warn!(
                        "Connection attempt {} to {} failed: {}",
                        self.failures, self.destination, e
                    );
                }
            }
        }
    }

    fn schedule_retry(&mut self) -> Duration {
        let delay = jittered(self.backoff, self.failures as u64 ^ self.sent);
        self.retry_at = Some(Instant::now() + delay);
        self.backoff = (self.backoff * 2).min(self.policy.max_backoff);
        delay
    }

    /// Re-send the backlog from its latest keyframe
    async fn flush_backlog(&mut self) {
        match resume_from_keyframe(&mut self.backlog) {
            Some(skipped) => {
                self.awaiting_keyframe = false;
                if skipped > 0 {
                    self.ctx.metrics.add_packets_skipped_for_keyframe(skipped as u64);
                }
                if !self.backlog.is_empty() {
                    info!(
                        "Resuming with {} backlogged packets ({} skipped before keyframe)",
                        self.backlog.len(),
                        skipped
                    );
                }
            }
            None => {
                let skipped = self.backlog.len();
                self.backlog.clear();
                self.awaiting_keyframe = true;
                if skipped > 0 {
                    self.ctx.metrics.add_packets_skipped_for_keyframe(skipped as u64);
                    info!("No keyframe buffered, discarded {} packets", skipped);
                }
            }
        }

        while self.connection.is_some() {
            let Some(packet) = self.backlog.pop_front() else {
                break;
            };
            self.write(packet).await;
        }
    }

    async fn handle(&mut self, packet: MuxedPacket) {
        if self.awaiting_keyframe {
            if !packet.is_video_keyframe() {
                self.ctx.metrics.add_packets_skipped_for_keyframe(1);
                return;
            }
            debug!("Resuming at keyframe {}ms", packet.timestamp_ms);
            self.awaiting_keyframe = false;
        }

        if self.connection.is_some() {
            self.write(packet).await;
        } else {
            self.buffer(packet);
        }
    }

    fn buffer(&mut self, packet: MuxedPacket) {
        if self.backlog.len() >= self.backlog_capacity {
            self.backlog.pop_front();
            self.ctx.metrics.add_packets_dropped_backlog(1);
        }
        self.backlog.push_back(packet);
    }

    async fn write(&mut self, packet: MuxedPacket) {
        let Some(connection) = self.connection.as_mut() else {
            self.buffer(packet);
            return;
        };

        let result = match timeout(self.policy.write_timeout, connection.write(&packet)).await {
            Ok(result) => result,
            Err(_) => Err(CastError::transport(format!(
                "write timed out after {:?}",
                self.policy.write_timeout
            ))),
        };

        match result {
            Ok(()) => {
                if self.failures > 0 {
                    self.failures = 0;
                    self.backoff = self.policy.initial_backoff;
                }
                self.sent += 1;
                self.ctx.metrics.add_packets_sent(1);
                self.ctx.metrics.add_bytes_sent(packet.payload_size as u64);
                if self.sent % self.stats_interval == 0 {
                    self.log_stats();
                }
            }
            Err(e) => {
                self.failures += 1;
                warn!(
                    "Write to {} failed ({}/{}): {}",
                    self.destination, self.failures, self.policy.max_retries, e
                );
                self.close_connection().await;
                self.set_state(TransportState::Disconnected);
                // Oldest packet goes first if the backlog overflows
                self.backlog.push_front(packet);
                while self.backlog.len() > self.backlog_capacity {
                    self.backlog.pop_front();
                    self.ctx.metrics.add_packets_dropped_backlog(1);
                }
                if self.failures < self.policy.max_retries {
                    let delay = self.schedule_retry();
                    info!("Reconnecting in {:?}", delay);
                }
            }
        }
    }

    fn log_stats(&self) {
        let elapsed = self.started.elapsed().as_secs_f64().max(0.001);
        let metrics = &self.ctx.metrics;
        debug!(
            "Transport: {} packets ({:.1}/s), {} KiB, {} reconnects, {} backlog drops, {} skipped",
            self.sent,
            self.sent as f64 / elapsed,
            metrics.bytes_sent() / 1024,
            metrics.reconnects(),
            metrics.packets_dropped_backlog(),
            metrics.packets_skipped_for_keyframe()
        );
    }

    async fn close_connection(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            match timeout(self.policy.write_timeout, connection.close()).await {
                Ok(Ok(())) => debug!("Connection to {} closed", self.destination),
                Ok(Err(e)) => debug!("Error closing connection: {}", e),
                Err(_) => debug!("Timed out closing connection"),
            }
        }
    }

    async fn drain(&mut self) {
        self.set_state(TransportState::Draining);
        if self.connection.is_none() && !self.backlog.is_empty() {
            warn!(
                "Input closed while disconnected, discarding {} backlogged packets",
                self.backlog.len()
            );
            self.backlog.clear();
        }
        self.close_connection().await;
        self.set_state(TransportState::Disconnected);
        info!("Transport drained after {} packets", self.sent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EncodedUnit, StreamKind};
    use bytes::Bytes;

    fn packet(kind: StreamKind, ms: u64, keyframe: bool) -> MuxedPacket {
        MuxedPacket::wrap(EncodedUnit {
            kind,
            payload: Bytes::from_static(b"p"),
            pts: Duration::from_millis(ms),
            dts: Duration::from_millis(ms),
            keyframe,
            sequence: ms,
        })
    }

    #[test]
    fn test_resume_from_latest_keyframe() {
        let mut backlog: VecDeque<_> = vec![
            packet(StreamKind::Video, 0, true),
            packet(StreamKind::Audio, 10, false),
            packet(StreamKind::Video, 33, false),
            packet(StreamKind::Video, 66, true),
            packet(StreamKind::Audio, 70, false),
        ]
        .into();
        assert_eq!(resume_from_keyframe(&mut backlog), Some(3));
        let stamps: Vec<_> = backlog.iter().map(|p| p.timestamp_ms).collect();
        assert_eq!(stamps, vec![66, 70]);
    }

    #[test]
    fn test_resume_without_keyframe() {
        let mut backlog: VecDeque<_> = vec![
            packet(StreamKind::Audio, 0, false),
            packet(StreamKind::Video, 33, false),
        ]
        .into();
        assert_eq!(resume_from_keyframe(&mut backlog), None);
        assert_eq!(backlog.len(), 2);
    }

    #[test]
    fn test_jitter_stays_within_twenty_percent() {
        let base = Duration::from_millis(1000);
        for salt in 0..200 {
            let d = jittered(base, salt);
            assert!(d >= Duration::from_millis(800) && d <= Duration::from_millis(1200));
        }
    }
}

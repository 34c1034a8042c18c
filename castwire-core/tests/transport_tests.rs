//! Integration tests for the transport: reconnect, backlog and keyframe resume

mod mocks;

use mocks::{packet, test_config, test_stream_info, RecordingConnector};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use castwire_core::output::{Transport, TransportState};
use castwire_core::queue::{BoundedQueue, DropPolicy};
use castwire_core::state::{Fault, PipelineContext};
use castwire_core::stats::PipelineMetrics;
use castwire_core::types::{MuxedPacket, StreamKind};
use castwire_core::{CastError, Destination, PipelineConfig};

struct Harness {
    input: Arc<BoundedQueue<MuxedPacket>>,
    state: watch::Receiver<TransportState>,
    metrics: Arc<PipelineMetrics>,
    faults: mpsc::UnboundedReceiver<Fault>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

fn spawn_transport(connector: RecordingConnector, config: &PipelineConfig, packets: Vec<MuxedPacket>) -> Harness {
    let (ctx, faults) = PipelineContext::standalone();
    let metrics = ctx.metrics.clone();
    let input = BoundedQueue::new("packets", 64, DropPolicy::DropOldest);
    for p in packets {
        input.push(p);
    }
    let (state_tx, state) = watch::channel(TransportState::Disconnected);
    let transport = Transport::new(
        Arc::new(connector),
        Destination::new("rtmp://ingest.test/app", "key"),
        test_stream_info(),
        config,
        input.clone(),
        ctx,
        Arc::new(state_tx),
    );
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(transport.run(shutdown.clone()));
    Harness {
        input,
        state,
        metrics,
        faults,
        shutdown,
        task,
    }
}

fn stamps(packets: &[MuxedPacket]) -> Vec<(StreamKind, u32)> {
    packets.iter().map(|p| (p.kind, p.timestamp_ms)).collect()
}

#[tokio::test(start_paused = true)]
async fn test_reconnects_and_resumes_at_latest_keyframe() {
    let connector = RecordingConnector::new();
    let log = connector.log.clone();
    // First connect works, the next two reconnect attempts fail
    log.connect_script.lock().extend([true, false, false]);
    *log.fail_write_at.lock() = Some(2);

    let mut harness = spawn_transport(
        connector,
        &test_config(),
        vec![
            packet(StreamKind::Video, 0, true),
            packet(StreamKind::Audio, 0, false),
            packet(StreamKind::Video, 100, false),
            packet(StreamKind::Audio, 100, false),
            packet(StreamKind::Video, 200, true),
            packet(StreamKind::Audio, 200, false),
            packet(StreamKind::Video, 300, false),
        ],
    );

    sleep(Duration::from_secs(2)).await;

    assert_eq!(
        stamps(&log.packets.lock()),
        vec![
            (StreamKind::Video, 0),
            (StreamKind::Audio, 0),
            (StreamKind::Video, 200),
            (StreamKind::Audio, 200),
            (StreamKind::Video, 300),
        ]
    );
    assert_eq!(log.attempts.load(Ordering::SeqCst), 4);
    assert_eq!(log.connects.load(Ordering::SeqCst), 2);
    assert_eq!(harness.metrics.reconnects(), 1);
    assert_eq!(harness.metrics.packets_skipped_for_keyframe(), 2);
    assert_eq!(*harness.state.borrow(), TransportState::Connected);
    assert!(harness.faults.try_recv().is_err());

    harness.input.close();
    timeout(Duration::from_secs(5), harness.task).await.unwrap().unwrap();
    assert!(log.all_closed());
    assert_eq!(*harness.state.borrow(), TransportState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_max_retries() {
    let connector = RecordingConnector::new();
    let log = connector.log.clone();
    log.connect_script.lock().extend([false; 10]);

    let mut config = test_config();
    config.transport.max_retries = 3;
    let mut harness = spawn_transport(connector, &config, vec![packet(StreamKind::Video, 0, true)]);

    timeout(Duration::from_secs(10), &mut harness.task)
        .await
        .expect("transport did not give up")
        .unwrap();

    assert_eq!(log.attempts.load(Ordering::SeqCst), 3);
    let fault = harness.faults.recv().await.expect("no fault reported");
    assert_eq!(fault.stage, "transport");
    assert!(matches!(fault.error.root(), CastError::TransportWrite(_)));
    assert_eq!(*harness.state.borrow(), TransportState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_failing_writes_exhaust_retries() {
    let connector = RecordingConnector::new();
    let log = connector.log.clone();
    log.fail_all_writes.store(true, Ordering::SeqCst);

    let mut config = test_config();
    config.transport.max_retries = 3;
    let packets = (0..10)
        .map(|i| packet(StreamKind::Video, i * 100, true))
        .collect();
    let mut harness = spawn_transport(connector, &config, packets);

    timeout(Duration::from_secs(30), &mut harness.task)
        .await
        .expect("transport kept reconnecting")
        .unwrap();

    // Every connect succeeded, every session died on its first write
    assert_eq!(log.connects.load(Ordering::SeqCst), 3);
    assert!(log.packets.lock().is_empty());
    assert!(log.all_closed());
    let fault = harness.faults.recv().await.expect("no fault reported");
    assert_eq!(fault.stage, "transport");
    assert!(matches!(fault.error.root(), CastError::TransportWrite(_)));
    assert_eq!(*harness.state.borrow(), TransportState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_successful_write_restores_retry_budget() {
    let connector = RecordingConnector::new();
    let log = connector.log.clone();
    // A write failure and a refused connect, then a healthy session
    log.connect_script.lock().extend([true, false, true, false]);
    *log.fail_write_at.lock() = Some(0);

    let mut config = test_config();
    config.transport.max_retries = 3;
    let mut harness = spawn_transport(connector, &config, vec![packet(StreamKind::Video, 0, true)]);

    sleep(Duration::from_secs(3)).await;
    assert_eq!(log.packets.lock().len(), 1);
    assert!(harness.faults.try_recv().is_err());

    // Two more failures only stay under the budget because the count was reset
    *log.fail_write_at.lock() = Some(2);
    harness.input.push(packet(StreamKind::Video, 100, true));
    sleep(Duration::from_millis(50)).await;
    harness.input.push(packet(StreamKind::Video, 200, false));
    sleep(Duration::from_secs(5)).await;

    assert!(harness.faults.try_recv().is_err());
    assert_eq!(*harness.state.borrow(), TransportState::Connected);
    assert_eq!(
        stamps(&log.packets.lock()),
        vec![(StreamKind::Video, 0), (StreamKind::Video, 100), (StreamKind::Video, 200)]
    );

    harness.shutdown.cancel();
    harness.task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_backlog_drops_oldest_then_resumes_at_keyframe() {
    let connector = RecordingConnector::new();
    let log = connector.log.clone();
    log.connect_script.lock().push_back(false);

    // 10 fps + 10 blocks/s for one second = 20 packets of backlog
    let mut config = test_config();
    config.transport.backlog = Duration::from_secs(1);
    assert_eq!(config.backlog_packets(), 20);

    let packets = (0..30)
        .map(|i| packet(StreamKind::Video, i * 10, i == 12))
        .collect();
    let harness = spawn_transport(connector, &config, packets);

    sleep(Duration::from_secs(1)).await;

    let sent = log.packets.lock().clone();
    assert_eq!(harness.metrics.packets_dropped_backlog(), 10);
    assert_eq!(harness.metrics.packets_skipped_for_keyframe(), 2);
    assert_eq!(sent.len(), 18);
    assert_eq!(sent[0].timestamp_ms, 120);
    assert!(sent[0].is_video_keyframe());

    harness.shutdown.cancel();
    harness.task.await.unwrap();
    assert!(log.all_closed());
}

#[tokio::test(start_paused = true)]
async fn test_waits_for_keyframe_after_connecting() {
    let connector = RecordingConnector::new();
    let log = connector.log.clone();

    let harness = spawn_transport(
        connector,
        &test_config(),
        vec![
            packet(StreamKind::Audio, 0, false),
            packet(StreamKind::Video, 0, false),
            packet(StreamKind::Video, 100, true),
            packet(StreamKind::Audio, 100, false),
        ],
    );
    harness.input.close();
    harness.task.await.unwrap();

    assert_eq!(
        stamps(&log.packets.lock()),
        vec![(StreamKind::Video, 100), (StreamKind::Audio, 100)]
    );
    assert_eq!(harness.metrics.packets_skipped_for_keyframe(), 2);
    assert!(log.all_closed());
}

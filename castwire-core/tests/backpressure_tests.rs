//! Integration tests for full-queue behaviour of the capture stages

mod mocks;

use mocks::{AudioControl, FakeAudioDevice, FakeGrabber};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use castwire_core::capture::{AudioSource, FrameSource};
use castwire_core::encode::{AudioEncoder, PcmCodec, ScreenVideoCodec, VideoEncoder};
use castwire_core::queue::{BoundedQueue, DropPolicy};
use castwire_core::state::PipelineContext;
use castwire_core::types::{CapturedAudioBlock, CapturedFrame, FrameFormat, PixelFormat};

#[tokio::test(start_paused = true)]
async fn test_frame_source_drops_newest_when_full() {
    let (ctx, _faults) = PipelineContext::standalone();
    let metrics = ctx.metrics.clone();
    let frames = BoundedQueue::new("frames", 2, DropPolicy::DropNewest);
    let source = FrameSource::new(Box::new(FakeGrabber::new(32, 32)), 10, ctx, frames.clone());

    let stop = CancellationToken::new();
    let task = tokio::spawn(source.run(stop.clone()));
    sleep(Duration::from_millis(950)).await;
    stop.cancel();
    task.await.unwrap();

    assert_eq!(metrics.frames_captured(), 10);
    assert_eq!(metrics.frames_dropped(), 8);
    assert!(frames.is_closed());
    let kept: Vec<_> = std::iter::from_fn(|| frames.try_pop()).map(|f| f.sequence).collect();
    assert_eq!(kept, vec![0, 1]);
}

#[tokio::test(start_paused = true)]
async fn test_audio_source_evicts_oldest_when_full() {
    let (ctx, _faults) = PipelineContext::standalone();
    let metrics = ctx.metrics.clone();
    let blocks = BoundedQueue::new("audio blocks", 3, DropPolicy::DropOldest);
    let device = FakeAudioDevice::new(44100, 2, 4410, Arc::new(AudioControl::default()));
    let source = AudioSource::open(Box::new(device), ctx, blocks.clone()).unwrap();

    let stop = CancellationToken::new();
    let task = tokio::spawn(source.run(stop.clone()));
    sleep(Duration::from_millis(1050)).await;
    stop.cancel();
    task.await.unwrap();

    assert_eq!(metrics.audio_blocks_captured(), 10);
    assert_eq!(metrics.audio_blocks_evicted(), 7);
    assert!(blocks.is_closed());

    let kept: Vec<_> = std::iter::from_fn(|| blocks.try_pop()).collect();
    let sequences: Vec<_> = kept.iter().map(|b| b.sequence).collect();
    assert_eq!(sequences, vec![7, 8, 9]);
    assert!(kept.iter().all(|b| b.channels == 2 && b.sample_count == 4410));
    // Each block is stamped with the time of its first sample
    assert_eq!(kept[0].captured_at, Duration::from_millis(700));
}

#[tokio::test(start_paused = true)]
async fn test_lost_audio_device_is_reopened_once() {
    let (ctx, mut faults) = PipelineContext::standalone();
    let metrics = ctx.metrics.clone();
    let blocks = BoundedQueue::new("audio blocks", 64, DropPolicy::DropOldest);
    let control = Arc::new(AudioControl::default());
    *control.kill_after.lock() = Some(Duration::from_millis(300));
    let device = FakeAudioDevice::new(44100, 1, 4410, control.clone());
    let source = AudioSource::open(Box::new(device), ctx, blocks.clone()).unwrap();

    let stop = CancellationToken::new();
    let task = tokio::spawn(source.run(stop.clone()));
    sleep(Duration::from_millis(450)).await;

    assert_eq!(metrics.source_reopens(), 1);
    assert_eq!(control.opens.load(std::sync::atomic::Ordering::SeqCst), 2);
    assert!(faults.try_recv().is_err());

    stop.cancel();
    task.await.unwrap();
    let sequences: Vec<_> = std::iter::from_fn(|| blocks.try_pop()).map(|b| b.sequence).collect();
    // Numbering continues across the re-open
    assert!(sequences.windows(2).all(|w| w[1] == w[0] + 1));
}

fn frame(sequence: u64) -> CapturedFrame {
    let format = FrameFormat::packed(32, 32, PixelFormat::Bgra);
    CapturedFrame {
        format,
        data: vec![sequence as u8; format.buffer_len()],
        captured_at: Duration::from_millis(sequence * 100),
        sequence,
    }
}

fn block(sequence: u64) -> CapturedAudioBlock {
    CapturedAudioBlock {
        samples: vec![0.25; 4410],
        sample_count: 4410,
        sample_rate: 44100,
        channels: 1,
        captured_at: Duration::from_millis(sequence * 100),
        sequence,
    }
}

#[tokio::test(start_paused = true)]
async fn test_video_encoder_drops_newest_when_full() {
    let (ctx, _faults) = PipelineContext::standalone();
    let metrics = ctx.metrics.clone();
    let frames = BoundedQueue::new("frames", 16, DropPolicy::DropNewest);
    let units = BoundedQueue::new("encoded video", 2, DropPolicy::DropNewest);
    for sequence in 0..6 {
        frames.push(frame(sequence));
    }
    frames.close();

    let encoder = VideoEncoder::new(
        Box::new(ScreenVideoCodec::new(32, 32, 10)),
        30,
        ctx,
        frames,
        units.clone(),
    );
    encoder.run(CancellationToken::new()).await;

    assert_eq!(metrics.video_units_encoded(), 6);
    assert_eq!(metrics.encoded_units_dropped(), 4);
    assert!(units.is_closed());
    let kept: Vec<_> = std::iter::from_fn(|| units.try_pop()).map(|u| u.sequence).collect();
    assert_eq!(kept, vec![0, 1]);
}

#[tokio::test(start_paused = true)]
async fn test_audio_encoder_evicts_oldest_when_full() {
    let (ctx, _faults) = PipelineContext::standalone();
    let metrics = ctx.metrics.clone();
    let blocks = BoundedQueue::new("audio blocks", 16, DropPolicy::DropOldest);
    let units = BoundedQueue::new("encoded audio", 2, DropPolicy::DropOldest);
    for sequence in 0..6 {
        blocks.push(block(sequence));
    }
    blocks.close();

    let encoder = AudioEncoder::new(Box::new(PcmCodec::new(44100, 1)), ctx, blocks, units.clone());
    encoder.run(CancellationToken::new()).await;

    assert_eq!(metrics.audio_units_encoded(), 6);
    assert_eq!(metrics.encoded_units_dropped(), 4);
    let kept: Vec<_> = std::iter::from_fn(|| units.try_pop()).collect();
    assert_eq!(kept.iter().map(|u| u.sequence).collect::<Vec<_>>(), vec![4, 5]);
    assert!(kept[0].pts < kept[1].pts);
}

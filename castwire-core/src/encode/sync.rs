//! Presentation timestamp assignment
//!
//! Capture timestamps jitter. These timelines turn them into per-stream pts
//! that never go backwards, and keep audio on a gapless sample timeline while
//! the device stays close to it.

use std::time::Duration;

/// Video pts: the capture time, clamped to be non-decreasing
#[derive(Debug, Default)]
pub struct VideoTimeline {
    last: Option<Duration>,
}

impl VideoTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the pts for a frame captured at `captured_at`
    pub fn assign(&mut self, captured_at: Duration) -> Duration {
        let pts = match self.last {
            Some(last) => captured_at.max(last),
            None => captured_at,
        };
        self.last = Some(pts);
        pts
    }
}

/// Audio pts: a continuous sample timeline anchored to the capture clock
///
/// Each block is expected to start where the previous one ended. While the
/// capture timestamp stays within half a block of that expectation the
/// expectation wins, which removes callback jitter. A larger gap (evicted
/// blocks, device re-open) re-anchors the timeline on the capture timestamp.
#[derive(Debug, Default)]
pub struct AudioTimeline {
    last: Option<Duration>,
    expected: Option<Duration>,
    reanchors: u64,
}

impl AudioTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the pts for a block of `duration` captured at `captured_at`
    pub fn assign(&mut self, captured_at: Duration, duration: Duration) -> Duration {
        let pts = match (self.expected, self.last) {
            (Some(expected), Some(last)) => {
                let drift = if captured_at > expected {
                    captured_at - expected
                } else {
                    expected - captured_at
                };
                if drift <= duration / 2 {
                    expected
                } else {
                    self.reanchors += 1;
                    captured_at.max(last)
                }
            }
            _ => captured_at,
        };
        self.last = Some(pts);
        self.expected = Some(pts + duration);
        pts
    }

    /// How many times the timeline jumped to the capture clock
    pub fn reanchors(&self) -> u64 {
        self.reanchors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::RandomState;
    use std::hash::BuildHasher;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    /// Deterministic pseudo-random jitter in `-range..=range` ms
    fn jitter(state: &RandomState, i: u64, range: i64) -> i64 {
        (state.hash_one(i) % (2 * range as u64 + 1)) as i64 - range
    }

    #[test]
    fn test_video_clamps_regressions() {
        let mut timeline = VideoTimeline::new();
        assert_eq!(timeline.assign(ms(100)), ms(100));
        assert_eq!(timeline.assign(ms(90)), ms(100));
        assert_eq!(timeline.assign(ms(133)), ms(133));
    }

    #[test]
    fn test_audio_absorbs_small_jitter() {
        let mut timeline = AudioTimeline::new();
        assert_eq!(timeline.assign(ms(0), ms(100)), ms(0));
        assert_eq!(timeline.assign(ms(130), ms(100)), ms(100));
        assert_eq!(timeline.assign(ms(185), ms(100)), ms(200));
        assert_eq!(timeline.reanchors(), 0);
    }

    #[test]
    fn test_audio_reanchors_after_gap() {
        let mut timeline = AudioTimeline::new();
        timeline.assign(ms(0), ms(100));
        timeline.assign(ms(100), ms(100));
        // Two blocks evicted
        assert_eq!(timeline.assign(ms(400), ms(100)), ms(400));
        assert_eq!(timeline.reanchors(), 1);
        assert_eq!(timeline.assign(ms(510), ms(100)), ms(500));
    }

    #[test]
    fn test_audio_reanchor_never_goes_back() {
        let mut timeline = AudioTimeline::new();
        timeline.assign(ms(1000), ms(100));
        // Far earlier than expected: clamp to the last pts
        assert_eq!(timeline.assign(ms(500), ms(100)), ms(1000));
    }

    #[test]
    fn test_jittered_capture_gives_monotonic_pts() {
        let state = RandomState::new();
        let mut video = VideoTimeline::new();
        let mut audio = AudioTimeline::new();
        let mut last_video = Duration::ZERO;
        let mut last_audio = Duration::ZERO;

        for i in 0..2000u64 {
            let nominal = i as i64 * 33;
            let captured = ms((nominal + jitter(&state, i, 40)).max(0) as u64);
            let pts = video.assign(captured);
            assert!(pts >= last_video, "video pts went back at {}", i);
            last_video = pts;

            let nominal = i as i64 * 93;
            let captured = ms((nominal + jitter(&state, i + 10_000, 120)).max(0) as u64);
            let pts = audio.assign(captured, ms(93));
            assert!(pts >= last_audio, "audio pts went back at {}", i);
            last_audio = pts;
        }
    }
}

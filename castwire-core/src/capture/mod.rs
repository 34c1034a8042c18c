//! Video and audio capture sources
//!
//! This module handles:
//! - Pulling frames from a [`FrameGrabber`] on a fixed-cadence schedule
//! - Receiving audio blocks from an [`AudioDevice`] callback without blocking it
//! - Re-opening an audio device once after it disappears

pub mod audio;
#[cfg(feature = "microphone")]
pub mod microphone;
#[cfg(feature = "screen")]
pub mod screen;
pub mod video;

pub use audio::{AudioSource, BlockSink, DeviceStream, LossNotifier, SyntheticAudioDevice};
#[cfg(feature = "microphone")]
pub use microphone::MicrophoneDevice;
#[cfg(feature = "screen")]
pub use screen::ScreenGrabber;
pub use video::{FrameSource, TestPatternGrabber};

use crate::error::Result;
use crate::types::RawImage;

/// Consecutive grab failures after which a frame source gives up
pub const MAX_CONSECUTIVE_GRAB_FAILURES: u32 = 3;

/// Synchronous pull-based image capture
///
/// `grab` is called once per tick from the frame source task and may block
/// for the duration of one capture.
pub trait FrameGrabber: Send {
    /// Capture one image
    fn grab(&mut self) -> Result<RawImage>;

    /// Human-readable source name for logs
    fn name(&self) -> String;
}

/// Push-based audio capture device
///
/// The device calls [`BlockSink::push`] from its own thread for every block
/// and reports mid-stream loss through the [`LossNotifier`].
pub trait AudioDevice: Send {
    /// Start delivering blocks; dropping the returned stream stops delivery
    fn open(&mut self, sink: BlockSink, loss: LossNotifier) -> Result<DeviceStream>;

    /// Human-readable device name for logs
    fn name(&self) -> String;
}

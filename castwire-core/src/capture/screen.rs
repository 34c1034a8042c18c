//! Display capture through xcap

use tracing::info;
use xcap::image::imageops::{self, FilterType};
use xcap::Monitor;

use super::FrameGrabber;
use crate::error::{CastError, Result};
use crate::types::{FrameFormat, PixelFormat, RawImage};

/// Captures one display and scales it to the output resolution
pub struct ScreenGrabber {
    monitor_id: u32,
    monitor_name: String,
    width: u32,
    height: u32,
}

impl ScreenGrabber {
    /// Open display `index` (in enumeration order)
    pub fn open(index: usize, width: u32, height: u32) -> Result<Self> {
        let monitors =
            Monitor::all().map_err(|e| CastError::init(format!("cannot list displays: {}", e)))?;
        let monitor = monitors.get(index).ok_or_else(|| {
            CastError::init(format!(
                "display {} not found ({} available)",
                index,
                monitors.len()
            ))
        })?;

        info!(
            "Capturing display {} '{}' ({}x{})",
            index,
            monitor.name(),
            monitor.width(),
            monitor.height()
        );

        Ok(Self {
            monitor_id: monitor.id(),
            monitor_name: monitor.name().to_string(),
            width,
            height,
        })
    }

    fn monitor(&self) -> Result<Monitor> {
        Monitor::all()
            .map_err(|e| CastError::capture(e.to_string()))?
            .into_iter()
            .find(|m| m.id() == self.monitor_id)
            .ok_or_else(|| CastError::capture(format!("display '{}' disappeared", self.monitor_name)))
    }
}

impl FrameGrabber for ScreenGrabber {
    fn grab(&mut self) -> Result<RawImage> {
        let mut image = self
            .monitor()?
            .capture_image()
            .map_err(|e| CastError::capture(e.to_string()))?;

        if image.width() != self.width || image.height() != self.height {
            image = imageops::resize(&image, self.width, self.height, FilterType::Triangle);
        }

        Ok(RawImage {
            format: FrameFormat::packed(self.width, self.height, PixelFormat::Rgba),
            data: image.into_raw(),
        })
    }

    fn name(&self) -> String {
        format!("display '{}'", self.monitor_name)
    }
}

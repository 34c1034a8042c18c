//! Microphone capture through cpal

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig, StreamError};
use std::sync::mpsc;
use tracing::{error, info, warn};

use super::audio::{BlockSink, DeviceStream, LossNotifier};
use super::AudioDevice;
use crate::error::{CastError, Result};
use crate::worker::run_blocking;

/// Symmetric i16 scale for sample conversion
const I16_SCALE: f32 = i16::MAX as f32;

/// The host's default input device
///
/// cpal streams are not `Send` on every platform, so each open runs the stream
/// on a dedicated thread that lives until the returned [`DeviceStream`] drops.
pub struct MicrophoneDevice {
    sample_rate: u32,
    channels: u16,
    block_size: u32,
}

impl MicrophoneDevice {
    pub fn new(sample_rate: u32, channels: u16, block_size: u32) -> Self {
        Self {
            sample_rate,
            channels,
            block_size,
        }
    }
}

/// Collects callback buffers into fixed-size blocks
struct Accumulator {
    sink: BlockSink,
    pending: Vec<f32>,
    block_len: usize,
    sample_rate: u32,
    channels: u16,
}

impl Accumulator {
    fn new(sink: BlockSink, block_size: u32, sample_rate: u32, channels: u16) -> Self {
        let block_len = block_size as usize * channels as usize;
        Self {
            sink,
            pending: Vec::with_capacity(block_len),
            block_len,
            sample_rate,
            channels,
        }
    }

    fn extend(&mut self, samples: impl Iterator<Item = f32>) {
        for sample in samples {
            self.pending.push(sample);
            if self.pending.len() == self.block_len {
                let block = std::mem::replace(&mut self.pending, Vec::with_capacity(self.block_len));
                self.sink.push(block, self.sample_rate, self.channels);
            }
        }
    }
}

fn build_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    format: SampleFormat,
    mut acc: Accumulator,
    loss: LossNotifier,
) -> std::result::Result<cpal::Stream, String> {
    let on_error = move |err: StreamError| match err {
        StreamError::DeviceNotAvailable => loss.device_lost("input device not available"),
        other => warn!("Audio stream error: {}", other),
    };

    let stream = match format {
        SampleFormat::F32 => device.build_input_stream(
            config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| acc.extend(data.iter().copied()),
            on_error,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                acc.extend(data.iter().map(|&s| s as f32 / I16_SCALE))
            },
            on_error,
            None,
        ),
        other => return Err(format!("unsupported sample format {:?}", other)),
    };
    stream.map_err(|e| e.to_string())
}

impl AudioDevice for MicrophoneDevice {
    fn open(&mut self, sink: BlockSink, loss: LossNotifier) -> Result<DeviceStream> {
        let (ready_tx, ready_rx) = mpsc::sync_channel::<std::result::Result<(), String>>(1);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (sample_rate, channels, block_size) = (self.sample_rate, self.channels, self.block_size);

        std::thread::Builder::new()
            .name("castwire-mic".to_string())
            .spawn(move || {
                let host = cpal::default_host();
                let Some(device) = host.default_input_device() else {
                    let _ = ready_tx.send(Err("no default input device".to_string()));
                    return;
                };
                let default = match device.default_input_config() {
                    Ok(config) => config,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                let format = default.sample_format();

                let requested = StreamConfig {
                    channels,
                    sample_rate: cpal::SampleRate(sample_rate),
                    buffer_size: cpal::BufferSize::Default,
                };
                let acc = Accumulator::new(sink, block_size, sample_rate, channels);
                let stream = match build_stream(&device, &requested, format, acc, loss) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let native: StreamConfig = default.into();
                        let _ = ready_tx.send(Err(format!(
                            "device rejected {} Hz/{} ch ({}); its native format is {} Hz/{} ch",
                            sample_rate, channels, e, native.sample_rate.0, native.channels
                        )));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }
                info!(
                    "Microphone '{}' capturing",
                    device.name().unwrap_or_else(|_| "unknown".to_string())
                );
                let _ = ready_tx.send(Ok(()));

                // Returns once the DeviceStream holding the sender is dropped
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| CastError::init(format!("failed to spawn audio thread: {}", e)))?;

        match run_blocking(|| ready_rx.recv()) {
            Ok(Ok(())) => Ok(DeviceStream::new(stop_tx)),
            Ok(Err(e)) => Err(CastError::init(format!("microphone: {}", e))),
            Err(_) => {
                error!("Audio thread exited before reporting readiness");
                Err(CastError::init("microphone thread exited"))
            }
        }
    }

    fn name(&self) -> String {
        "default microphone".to_string()
    }
}

//! Castwire Core Library
//!
//! Live screen and microphone streaming to RTMP ingest servers.
//!
//! This library provides:
//! - Fixed-cadence screen capture and callback-driven audio capture
//! - Video and audio encoding with keyframe forcing and timestamp sync
//! - Timestamp-ordered muxing of both streams into FLV packets
//! - RTMP publishing with reconnect, backlog and keyframe resume
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────┐
//! │ FrameSource  │──▶│ VideoEncoder  │──┐
//! └──────────────┘   └───────────────┘  │   ┌───────┐   ┌───────────┐
//!                                       ├──▶│ Muxer │──▶│ Transport │──▶ RTMP / FLV
//! ┌──────────────┐   ┌───────────────┐  │   └───────┘   └───────────┘
//! │ AudioSource  │──▶│ AudioEncoder  │──┘
//! └──────────────┘   └───────────────┘
//! ```
//!
//! Every arrow is a bounded queue; the [`PipelineController`] owns the
//! lifecycle of all stages.

pub mod capture;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod encode;
pub mod error;
pub mod mux;
pub mod output;
pub mod pipeline;
pub mod queue;
pub mod state;
pub mod stats;
pub mod types;
pub mod worker;

pub use config::{ConfigFile, PipelineConfig, Preset, TransportPolicy};
pub use credentials::{Destination, HelixStreamKey, StreamKeyProvider};
pub use error::{CastError, Result};
pub use output::TransportState;
pub use pipeline::{DefaultBackend, PipelineBackend, PipelineController};
pub use state::{Fault, PipelineState, StateHandle};
pub use stats::MetricsSnapshot;

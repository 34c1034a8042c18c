//! Delivery of muxed packets to an ingest server or a local file
//!
//! This module provides:
//! - The [`Transport`] stage: connection state machine, reconnect with
//!   backoff, bounded backlog and keyframe resume
//! - The [`Connector`] / [`Connection`] seam transport drives
//! - RTMP publishing and FLV file recording connectors

mod file;
pub mod flv;
mod rtmp;
mod transport;

pub use file::{file_path, FlvFileConnection, FlvFileConnector};
pub use rtmp::{RtmpConnector, RtmpUrl};
pub use transport::{resume_from_keyframe, Transport, TransportState};

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::credentials::Destination;
use crate::error::Result;
use crate::types::{MuxedPacket, StreamInfo};

/// Opens connections to a destination
///
/// Implementations must send whatever the receiver needs before the first
/// media packet (metadata, sequence headers) as part of `connect`, so every
/// reconnect starts a decodable stream.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, destination: &Destination, info: &StreamInfo)
    -> Result<Box<dyn Connection>>;

    /// Connector name for logs
    fn name(&self) -> &'static str;
}

/// An open connection accepting muxed packets in order
#[async_trait]
pub trait Connection: Send {
    /// Write one packet
    async fn write(&mut self, packet: &MuxedPacket) -> Result<()>;

    /// Flush and close; the connection is unusable afterwards
    async fn close(&mut self) -> Result<()>;
}

/// Connector for a destination: FLV file for file destinations, RTMP otherwise
pub fn connector_for(destination: &Destination, config: &PipelineConfig) -> Arc<dyn Connector> {
    if destination.is_file() {
        Arc::new(FlvFileConnector::new())
    } else {
        Arc::new(RtmpConnector::new(config.transport.connect_timeout))
    }
}

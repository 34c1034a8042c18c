//! FLV file recording
//!
//! Used for destinations like `file:///tmp/test.flv` or `capture.flv`, which
//! makes local recordings and dry runs go through the same transport path as
//! a live stream.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info};

use super::flv;
use super::{Connection, Connector};
use crate::credentials::Destination;
use crate::error::{CastError, Result, ResultExt};
use crate::types::{MuxedPacket, StreamInfo};

/// Map a file destination to its path
pub fn file_path(destination: &Destination) -> PathBuf {
    let url = destination.ingest_url();
    PathBuf::from(url.strip_prefix("file://").unwrap_or(url))
}

/// Writes the stream to an FLV file
///
/// The first connect truncates the file and writes the FLV header; later
/// connects append, repeating metadata and sequence headers like a fresh RTMP
/// session would.
#[derive(Default)]
pub struct FlvFileConnector {
    created: Mutex<Option<PathBuf>>,
}

impl FlvFileConnector {
    pub fn new() -> Self {
        Self::default()
    }

    async fn open(&self, path: &Path) -> Result<(File, bool)> {
        let fresh = self.created.lock().as_deref() != Some(path);
        let file = if fresh {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(CastError::from)
                    .context(format!("creating {}", parent.display()))?;
            }
            File::create(path).await
        } else {
            OpenOptions::new().append(true).open(path).await
        }
        .map_err(|e| CastError::transport(format!("cannot open {}: {}", path.display(), e)))?;

        if fresh {
            *self.created.lock() = Some(path.to_path_buf());
        }
        Ok((file, fresh))
    }
}

#[async_trait]
impl Connector for FlvFileConnector {
    async fn connect(
        &self,
        destination: &Destination,
        info: &StreamInfo,
    ) -> Result<Box<dyn Connection>> {
        let path = file_path(destination);
        let (file, fresh) = self.open(&path).await?;
        let mut connection = FlvFileConnection {
            writer: BufWriter::new(file),
            info: info.clone(),
            path,
            tags: 0,
        };

        if fresh {
            connection.put(&flv::file_header(true, true)).await?;
            info!("Recording to {}", connection.path.display());
        } else {
            info!("Resuming recording to {}", connection.path.display());
        }

        let metadata = flv::metadata_body(info)?;
        connection.put_tag(flv::SCRIPT_TAG, 0, &metadata).await?;
        if let Some(header) = flv::video_sequence_header(&info.video) {
            connection.put_tag(MuxedPacket::VIDEO_STREAM_ID, 0, &header).await?;
        }
        if let Some(header) = flv::audio_sequence_header(&info.audio) {
            connection.put_tag(MuxedPacket::AUDIO_STREAM_ID, 0, &header).await?;
        }
        Ok(Box::new(connection))
    }

    fn name(&self) -> &'static str {
        "flv file"
    }
}

/// An open recording
pub struct FlvFileConnection {
    writer: BufWriter<File>,
    info: StreamInfo,
    path: PathBuf,
    tags: u64,
}

impl FlvFileConnection {
    async fn put(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer
            .write_all(bytes)
            .await
            .map_err(|e| CastError::transport(format!("write to {} failed: {}", self.path.display(), e)))
    }

    async fn put_tag(&mut self, tag_type: u8, timestamp_ms: u32, body: &[u8]) -> Result<()> {
        let tag = flv::file_tag(tag_type, timestamp_ms, body);
        self.put(&tag).await?;
        self.tags += 1;
        Ok(())
    }
}

#[async_trait]
impl Connection for FlvFileConnection {
    async fn write(&mut self, packet: &MuxedPacket) -> Result<()> {
        let body = flv::packet_body(&self.info, packet);
        self.put_tag(packet.stream_id, packet.timestamp_ms, &body).await
    }

    async fn close(&mut self) -> Result<()> {
        self.writer
            .flush()
            .await
            .map_err(|e| CastError::transport(format!("flush of {} failed: {}", self.path.display(), e)))?;
        debug!("Closed {} after {} tags", self.path.display(), self.tags);
        Ok(())
    }
}

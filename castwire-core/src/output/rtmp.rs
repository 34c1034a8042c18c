//! RTMP publishing over TCP

use async_trait::async_trait;
use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use rml_rtmp::sessions::{
    ClientSession, ClientSessionConfig, ClientSessionEvent, ClientSessionResult,
    PublishRequestType, StreamMetadata,
};
use rml_rtmp::time::RtmpTimestamp;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, trace};

use super::flv;
use super::{Connection, Connector};
use crate::credentials::Destination;
use crate::error::{CastError, Result};
use crate::types::{MuxedPacket, StreamInfo};

/// Default RTMP port
pub const DEFAULT_PORT: u16 = 1935;

/// Parsed `rtmp://host[:port]/app` ingest URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmpUrl {
    pub host: String,
    pub port: u16,
    pub app: String,
}

impl RtmpUrl {
    pub fn parse(url: &str) -> Result<Self> {
        let lower = url.to_ascii_lowercase();
        if lower.starts_with("rtmps://") {
            return Err(CastError::config("rtmps:// ingest is not supported, use rtmp://"));
        }
        let rest = lower
            .starts_with("rtmp://")
            .then(|| &url["rtmp://".len()..])
            .ok_or_else(|| CastError::config(format!("Not an RTMP URL: {}", url)))?;

        let (authority, app) = rest.split_once('/').unwrap_or((rest, ""));
        let app = app.trim_matches('/');
        if authority.is_empty() || app.is_empty() {
            return Err(CastError::config(format!(
                "RTMP URL needs a host and an application: {}",
                url
            )));
        }

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| CastError::config(format!("Invalid port in {}", url)))?;
                (host, port)
            }
            None => (authority, DEFAULT_PORT),
        };

        Ok(Self {
            host: host.to_string(),
            port,
            app: app.to_string(),
        })
    }

    /// The `tcUrl` sent in the connect command
    pub fn tc_url(&self) -> String {
        format!("rtmp://{}:{}/{}", self.host, self.port, self.app)
    }
}

fn io_error(what: &str, e: std::io::Error) -> CastError {
    CastError::transport(format!("{}: {}", what, e))
}

fn session_error(what: &str, e: impl std::fmt::Debug) -> CastError {
    CastError::transport(format!("{}: {:?}", what, e))
}

/// Opens RTMP publish sessions
pub struct RtmpConnector {
    /// Bound on each network read during session setup
    read_timeout: Duration,
}

impl RtmpConnector {
    pub fn new(read_timeout: Duration) -> Self {
        Self { read_timeout }
    }
}

#[async_trait]
impl Connector for RtmpConnector {
    async fn connect(
        &self,
        destination: &Destination,
        info: &StreamInfo,
    ) -> Result<Box<dyn Connection>> {
        let url = RtmpUrl::parse(destination.ingest_url())?;
        debug!("Connecting to {}:{}", url.host, url.port);

        let mut stream = TcpStream::connect((url.host.as_str(), url.port))
            .await
            .map_err(|e| io_error("TCP connect failed", e))?;
        stream
            .set_nodelay(true)
            .map_err(|e| io_error("Failed to set TCP_NODELAY", e))?;

        let remaining = handshake(&mut stream, self.read_timeout).await?;

        let mut config = ClientSessionConfig::new();
        config.tc_url = Some(url.tc_url());
        let (session, initial) =
            ClientSession::new(config).map_err(|e| session_error("RTMP session setup failed", e))?;

        let mut connection = RtmpConnection {
            stream,
            session,
            info: info.clone(),
            read_timeout: self.read_timeout,
            read_buf: vec![0; 4096],
        };
        connection.process(initial).await?;
        let events = connection.input(&remaining).await?;
        trace!("{} events buffered after handshake", events.len());

        let request = connection
            .session
            .request_connection(url.app.clone())
            .map_err(|e| session_error("connect request failed", e))?;
        connection.process(vec![request]).await?;
        connection
            .wait_for(|event| match event {
                ClientSessionEvent::ConnectionRequestAccepted => Some(Ok(())),
                ClientSessionEvent::ConnectionRequestRejected { description } => Some(Err(
                    CastError::transport(format!("server rejected connect: {}", description)),
                )),
                _ => None,
            })
            .await?;

        let request = connection
            .session
            .request_publishing(destination.stream_key().to_string(), PublishRequestType::Live)
            .map_err(|e| session_error("publish request failed", e))?;
        connection.process(vec![request]).await?;
        connection
            .wait_for(|event| match event {
                ClientSessionEvent::PublishRequestAccepted => Some(Ok(())),
                _ => None,
            })
            .await?;

        connection.announce().await?;
        info!("Publishing to {} as '{}'", destination, url.app);
        Ok(Box::new(connection))
    }

    fn name(&self) -> &'static str {
        "rtmp"
    }
}

/// Client side of the RTMP handshake; returns bytes read past its end
async fn handshake(stream: &mut TcpStream, read_timeout: Duration) -> Result<Vec<u8>> {
    let mut handshake = Handshake::new(PeerType::Client);
    let p0_and_p1 = handshake
        .generate_outbound_p0_and_p1()
        .map_err(|e| session_error("handshake failed", e))?;
    stream
        .write_all(&p0_and_p1)
        .await
        .map_err(|e| io_error("handshake write failed", e))?;

    let mut buf = [0u8; 4096];
    loop {
        let n = read_some(stream, &mut buf, read_timeout).await?;
        match handshake
            .process_bytes(&buf[..n])
            .map_err(|e| session_error("handshake failed", e))?
        {
            HandshakeProcessResult::InProgress { response_bytes } => {
                if !response_bytes.is_empty() {
                    stream
                        .write_all(&response_bytes)
                        .await
                        .map_err(|e| io_error("handshake write failed", e))?;
                }
            }
            HandshakeProcessResult::Completed {
                response_bytes,
                remaining_bytes,
            } => {
                stream
                    .write_all(&response_bytes)
                    .await
                    .map_err(|e| io_error("handshake write failed", e))?;
                debug!("RTMP handshake complete");
                return Ok(remaining_bytes);
            }
        }
    }
}

async fn read_some(stream: &mut TcpStream, buf: &mut [u8], read_timeout: Duration) -> Result<usize> {
    let n = tokio::time::timeout(read_timeout, stream.read(buf))
        .await
        .map_err(|_| CastError::transport("server did not respond"))?
        .map_err(|e| io_error("read failed", e))?;
    if n == 0 {
        return Err(CastError::transport("server closed the connection"));
    }
    Ok(n)
}

/// An accepted publish session
struct RtmpConnection {
    stream: TcpStream,
    session: ClientSession,
    info: StreamInfo,
    read_timeout: Duration,
    read_buf: Vec<u8>,
}

impl RtmpConnection {
    /// Send outbound packets, returning any raised events
    async fn process(&mut self, results: Vec<ClientSessionResult>) -> Result<Vec<ClientSessionEvent>> {
        let mut events = Vec::new();
        for result in results {
            match result {
                ClientSessionResult::OutboundResponse(packet) => {
                    self.stream
                        .write_all(&packet.bytes)
                        .await
                        .map_err(|e| io_error("write failed", e))?;
                }
                ClientSessionResult::RaisedEvent(event) => events.push(event),
                ClientSessionResult::UnhandleableMessageReceived(payload) => {
                    trace!("Ignoring RTMP message type {}", payload.type_id);
                }
            }
        }
        Ok(events)
    }

    /// Feed bytes from the server into the session
    async fn input(&mut self, bytes: &[u8]) -> Result<Vec<ClientSessionEvent>> {
        if bytes.is_empty() {
            return Ok(Vec::new());
        }
        let results = self
            .session
            .handle_input(bytes)
            .map_err(|e| session_error("bad data from server", e))?;
        self.process(results).await
    }

    /// Read until `check` resolves one of the raised events
    async fn wait_for(
        &mut self,
        mut check: impl FnMut(&ClientSessionEvent) -> Option<Result<()>>,
    ) -> Result<()> {
        loop {
            let mut buf = std::mem::take(&mut self.read_buf);
            let n = read_some(&mut self.stream, &mut buf, self.read_timeout).await;
            let events = match n {
                Ok(n) => self.input(&buf[..n]).await,
                Err(e) => Err(e),
            };
            self.read_buf = buf;
            for event in events? {
                if let Some(outcome) = check(&event) {
                    return outcome;
                }
            }
        }
    }

    /// Answer anything the server sent (pings, acks) without waiting
    async fn poll_incoming(&mut self) -> Result<()> {
        loop {
            let mut buf = std::mem::take(&mut self.read_buf);
            let read = self.stream.try_read(&mut buf);
            let outcome = match read {
                Ok(0) => Err(CastError::transport("server closed the connection")),
                Ok(n) => self.input(&buf[..n]).await.map(|_| true),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(false),
                Err(e) => Err(io_error("read failed", e)),
            };
            self.read_buf = buf;
            if !outcome? {
                return Ok(());
            }
        }
    }

    /// Metadata and sequence headers, sent on every connect
    async fn announce(&mut self) -> Result<()> {
        let video = self.info.video.clone();
        let audio = self.info.audio.clone();
        let mut metadata = StreamMetadata::new();
        metadata.video_width = Some(video.width);
        metadata.video_height = Some(video.height);
        metadata.video_codec_id = Some(video.codec_id as u32);
        metadata.video_frame_rate = Some(video.fps as f32);
        metadata.video_bitrate_kbps = Some(video.bitrate_kbps);
        metadata.audio_codec_id = Some(audio.sound_format as u32);
        metadata.audio_bitrate_kbps = Some(audio.bitrate_kbps);
        metadata.audio_sample_rate = Some(audio.sample_rate);
        metadata.audio_channels = Some(audio.channels as u32);
        metadata.audio_is_stereo = Some(audio.channels > 1);
        metadata.encoder = Some(flv::encoder_name());

        let result = self
            .session
            .publish_metadata(&metadata)
            .map_err(|e| session_error("metadata failed", e))?;
        self.process(vec![result]).await?;

        let zero = RtmpTimestamp { value: 0 };
        if let Some(header) = flv::video_sequence_header(&video) {
            let result = self
                .session
                .publish_video_data(header, zero, false)
                .map_err(|e| session_error("video sequence header failed", e))?;
            self.process(vec![result]).await?;
        }
        if let Some(header) = flv::audio_sequence_header(&audio) {
            let result = self
                .session
                .publish_audio_data(header, zero, false)
                .map_err(|e| session_error("audio sequence header failed", e))?;
            self.process(vec![result]).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for RtmpConnection {
    async fn write(&mut self, packet: &MuxedPacket) -> Result<()> {
        let body = flv::packet_body(&self.info, packet);
        let timestamp = RtmpTimestamp {
            value: packet.timestamp_ms,
        };
        let result = if packet.stream_id == MuxedPacket::VIDEO_STREAM_ID {
            self.session.publish_video_data(body, timestamp, !packet.keyframe)
        } else {
            self.session.publish_audio_data(body, timestamp, false)
        }
        .map_err(|e| session_error("failed to frame packet", e))?;

        self.process(vec![result]).await?;
        self.poll_incoming().await
    }

    async fn close(&mut self) -> Result<()> {
        self.stream
            .shutdown()
            .await
            .map_err(|e| io_error("shutdown failed", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AudioTrack, EncodedUnit, StreamKind, VideoTrack};
    use bytes::Bytes;
    use rml_rtmp::sessions::{
        ServerSession, ServerSessionConfig, ServerSessionEvent, ServerSessionResult,
    };
    use std::collections::VecDeque;
    use tokio::net::TcpListener;

    fn info() -> StreamInfo {
        StreamInfo {
            video: VideoTrack {
                codec_id: 3,
                width: 64,
                height: 48,
                fps: 10,
                bitrate_kbps: 0,
                sequence_header: None,
            },
            audio: AudioTrack {
                sound_format: 3,
                sample_rate: 44100,
                channels: 1,
                bitrate_kbps: 705,
                sequence_header: None,
            },
        }
    }

    fn packet(kind: StreamKind, ms: u64, keyframe: bool) -> MuxedPacket {
        MuxedPacket::wrap(EncodedUnit {
            kind,
            payload: Bytes::from_static(b"frame"),
            pts: Duration::from_millis(ms),
            dts: Duration::from_millis(ms),
            keyframe,
            sequence: ms,
        })
    }

    /// Accept one publisher, approve every request and collect its events
    /// until the client hangs up
    async fn ingest_server(listener: TcpListener) -> Vec<ServerSessionEvent> {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 8192];

        let mut handshake = Handshake::new(PeerType::Server);
        let remaining = loop {
            let n = socket.read(&mut buf).await.unwrap();
            assert!(n > 0, "client left during handshake");
            match handshake.process_bytes(&buf[..n]).unwrap() {
                HandshakeProcessResult::InProgress { response_bytes } => {
                    socket.write_all(&response_bytes).await.unwrap();
                }
                HandshakeProcessResult::Completed {
                    response_bytes,
                    remaining_bytes,
                } => {
                    socket.write_all(&response_bytes).await.unwrap();
                    break remaining_bytes;
                }
            }
        };

        let (mut session, initial) = ServerSession::new(ServerSessionConfig::new()).unwrap();
        let mut pending: VecDeque<ServerSessionResult> = initial.into();
        pending.extend(session.handle_input(&remaining).unwrap());

        let mut events = Vec::new();
        loop {
            while let Some(result) = pending.pop_front() {
                match result {
                    ServerSessionResult::OutboundResponse(packet) => {
                        socket.write_all(&packet.bytes).await.unwrap();
                    }
                    ServerSessionResult::RaisedEvent(event) => {
                        match &event {
                            ServerSessionEvent::ConnectionRequested { request_id, .. }
                            | ServerSessionEvent::PublishStreamRequested { request_id, .. } => {
                                pending.extend(session.accept_request(*request_id).unwrap());
                            }
                            _ => {}
                        }
                        events.push(event);
                    }
                    ServerSessionResult::UnhandleableMessageReceived(_) => {}
                }
            }

            let n = socket.read(&mut buf).await.unwrap_or(0);
            if n == 0 {
                return events;
            }
            pending.extend(session.handle_input(&buf[..n]).unwrap());
        }
    }

    #[tokio::test]
    async fn test_publishes_metadata_and_packets_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(ingest_server(listener));

        let connector = RtmpConnector::new(Duration::from_secs(5));
        let destination = Destination::new(format!("rtmp://127.0.0.1:{}/live", port), "secret");
        let mut connection = connector.connect(&destination, &info()).await.unwrap();
        connection.write(&packet(StreamKind::Video, 0, true)).await.unwrap();
        connection.write(&packet(StreamKind::Audio, 0, false)).await.unwrap();
        connection.write(&packet(StreamKind::Video, 100, false)).await.unwrap();
        connection.close().await.unwrap();

        let events = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server did not finish")
            .unwrap();

        assert!(events.iter().any(|e| matches!(
            e,
            ServerSessionEvent::ConnectionRequested { app_name, .. } if app_name == "live"
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            ServerSessionEvent::PublishStreamRequested { stream_key, .. } if stream_key == "secret"
        )));

        let metadata = events
            .iter()
            .find_map(|e| match e {
                ServerSessionEvent::StreamMetadataChanged { metadata, .. } => Some(metadata),
                _ => None,
            })
            .expect("no metadata received");
        assert_eq!(metadata.video_width, Some(64));
        assert_eq!(metadata.video_height, Some(48));
        assert_eq!(metadata.video_codec_id, Some(3));
        assert_eq!(metadata.audio_codec_id, Some(3));
        assert_eq!(metadata.audio_sample_rate, Some(44100));

        let video: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                ServerSessionEvent::VideoDataReceived { timestamp, data, .. } => {
                    assert!(!data.is_empty());
                    Some(timestamp.value)
                }
                _ => None,
            })
            .collect();
        let audio: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                ServerSessionEvent::AudioDataReceived { timestamp, .. } => Some(timestamp.value),
                _ => None,
            })
            .collect();
        assert_eq!(video, vec![0, 100]);
        assert_eq!(audio, vec![0]);
    }

    #[tokio::test]
    async fn test_connect_fails_when_nothing_listens() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = RtmpConnector::new(Duration::from_secs(1));
        let destination = Destination::new(format!("rtmp://127.0.0.1:{}/live", port), "secret");
        let err = connector.connect(&destination, &info()).await.err().unwrap();
        assert!(matches!(err, CastError::TransportWrite(_)));
    }

    #[test]
    fn test_parse_default_port() {
        let url = RtmpUrl::parse("rtmp://live.twitch.tv/app").unwrap();
        assert_eq!(url.host, "live.twitch.tv");
        assert_eq!(url.port, DEFAULT_PORT);
        assert_eq!(url.app, "app");
        assert_eq!(url.tc_url(), "rtmp://live.twitch.tv:1935/app");
    }

    #[test]
    fn test_parse_port_and_nested_app() {
        let url = RtmpUrl::parse("rtmp://127.0.0.1:1936/live/backup/").unwrap();
        assert_eq!(url.host, "127.0.0.1");
        assert_eq!(url.port, 1936);
        assert_eq!(url.app, "live/backup");
    }

    #[test]
    fn test_parse_rejects_bad_urls() {
        assert!(RtmpUrl::parse("rtmps://a.rtmp.youtube.com/live2").is_err());
        assert!(RtmpUrl::parse("http://example.com/app").is_err());
        assert!(RtmpUrl::parse("rtmp://example.com").is_err());
        assert!(RtmpUrl::parse("rtmp://example.com:abc/app").is_err());
    }
}

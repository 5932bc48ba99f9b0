use anyhow::Result;
use bytes::Bytes;
use rml_rtmp::handshake::PeerType;
use rml_rtmp::sessions::{ServerSession, ServerSessionConfig, ServerSessionEvent, ServerSessionResult};
use rml_rtmp::time::RtmpTimestamp;
use tokio::net::TcpStream;

use super::run_handshake;

/// Publish/play intents and media raised while driving a server-side
/// `rml_rtmp` session, translated out of [`ServerSessionEvent`].
pub enum ServerIntent {
    Publish {
        request_id: u32,
        app_name: String,
        stream_key: String,
    },
    Play {
        request_id: u32,
        app_name: String,
        stream_key: String,
        stream_id: u32,
    },
    Audio { data: Bytes, timestamp: u32 },
    Video { data: Bytes, timestamp: u32 },
    PublishFinished,
    PlayFinished,
    /// Informational event (chunk size change, ack, ping, metadata, ...);
    /// nothing in this crate's component model needs to act on it.
    Other,
}

/// Wraps a handshaken `rml_rtmp::sessions::ServerSession` for one inbound
/// connection.
pub struct ServerConnection {
    session: ServerSession,
    stream_key: Option<String>,
}

impl ServerConnection {
    /// Completes the handshake on `socket` and constructs the session.
    /// Returns the connection plus any outbound bytes already queued
    /// (e.g. the connect-accept response) that must be written before
    /// the read loop starts.
    pub async fn accept(socket: &mut TcpStream) -> Result<(Self, Vec<u8>)> {
        let remaining = run_handshake(socket, PeerType::Server).await?;

        let config = ServerSessionConfig::new();
        let (session, results) = ServerSession::new(config)?;
        let mut conn = Self {
            session,
            stream_key: None,
        };
        let mut out = Vec::new();
        let mut intents = Vec::new();
        conn.drain_results(results, &mut out, &mut intents);
        if !remaining.is_empty() {
            conn.handle_input_into(&remaining, &mut out, &mut intents)?;
        }
        // Connection-level intents (there should be none yet) are
        // discarded here; the caller re-runs handle_input for real
        // traffic once the read loop starts.
        Ok((conn, out))
    }

    pub fn accept_request(&mut self, request_id: u32) -> Result<Vec<u8>> {
        let results = self.session.accept_request(request_id)?;
        let mut out = Vec::new();
        let mut intents = Vec::new();
        self.drain_results(results, &mut out, &mut intents);
        Ok(out)
    }

    pub fn reject_request(&mut self, request_id: u32, description: &str) -> Result<Vec<u8>> {
        let results = self.session.reject_request(request_id, "0", description)?;
        let mut out = Vec::new();
        let mut intents = Vec::new();
        self.drain_results(results, &mut out, &mut intents);
        Ok(out)
    }

    /// Feeds freshly read bytes into the session, returning outbound
    /// bytes to write back and any intents raised as a result.
    pub fn handle_input(&mut self, data: &[u8]) -> Result<(Vec<u8>, Vec<ServerIntent>)> {
        let mut out = Vec::new();
        let mut intents = Vec::new();
        self.handle_input_into(data, &mut out, &mut intents)?;
        Ok((out, intents))
    }

    fn handle_input_into(
        &mut self,
        data: &[u8],
        out: &mut Vec<u8>,
        intents: &mut Vec<ServerIntent>,
    ) -> Result<()> {
        let results = self.session.handle_input(data)?;
        self.drain_results(results, out, intents);
        Ok(())
    }

    fn drain_results(
        &mut self,
        results: Vec<ServerSessionResult>,
        out: &mut Vec<u8>,
        intents: &mut Vec<ServerIntent>,
    ) {
        for result in results {
            match result {
                ServerSessionResult::OutboundResponse(packet) => out.extend(packet.bytes),
                ServerSessionResult::RaisedEvent(ServerSessionEvent::ConnectionRequested {
                    request_id,
                    ..
                }) => {
                    // Always accept the connect command; app-level
                    // rejection happens at publish/play time against the
                    // Registry. The accept's own outbound bytes must be
                    // folded into this same pass.
                    if let Ok(results) = self.session.accept_request(request_id) {
                        self.drain_results(results, out, intents);
                    }
                }
                ServerSessionResult::RaisedEvent(event) => {
                    if let Some(intent) = self.translate(event) {
                        intents.push(intent);
                    }
                }
                ServerSessionResult::UnhandleableMessageReceived(_) => {}
            }
        }
    }

    fn translate(&mut self, event: ServerSessionEvent) -> Option<ServerIntent> {
        match event {
            ServerSessionEvent::PublishStreamRequested {
                request_id,
                app_name,
                stream_key,
                ..
            } => {
                self.stream_key = Some(stream_key.clone());
                Some(ServerIntent::Publish {
                    request_id,
                    app_name,
                    stream_key,
                })
            }
            ServerSessionEvent::PlayStreamRequested {
                request_id,
                app_name,
                stream_key,
                stream_id,
                ..
            } => {
                self.stream_key = Some(stream_key.clone());
                Some(ServerIntent::Play {
                    request_id,
                    app_name,
                    stream_key,
                    stream_id,
                })
            }
            ServerSessionEvent::PublishStreamFinished { .. } => Some(ServerIntent::PublishFinished),
            ServerSessionEvent::PlayStreamFinished { .. } => Some(ServerIntent::PlayFinished),
            ServerSessionEvent::AudioDataReceived { data, timestamp, .. } => {
                Some(ServerIntent::Audio {
                    data,
                    timestamp: timestamp.value,
                })
            }
            ServerSessionEvent::VideoDataReceived { data, timestamp, .. } => {
                Some(ServerIntent::Video {
                    data,
                    timestamp: timestamp.value,
                })
            }
            _ => Some(ServerIntent::Other),
        }
    }

    pub fn send_audio(&mut self, stream_id: u32, data: Bytes, timestamp: u32) -> Result<Vec<u8>> {
        let packet =
            self.session
                .send_audio_data(stream_id, data, RtmpTimestamp::new(timestamp), true)?;
        Ok(packet.bytes)
    }

    pub fn send_video(&mut self, stream_id: u32, data: Bytes, timestamp: u32) -> Result<Vec<u8>> {
        let packet =
            self.session
                .send_video_data(stream_id, data, RtmpTimestamp::new(timestamp), true)?;
        Ok(packet.bytes)
    }
}

use anyhow::Result;
use bytes::Bytes;
use rml_rtmp::sessions::{
    ClientSession, ClientSessionEvent, ClientSessionResult, PublishRequestType,
};
use rml_rtmp::time::RtmpTimestamp;

/// Connection/publish intents raised while driving a client-side `rml_rtmp`
/// session, translated out of [`ClientSessionEvent`]. Mirrors
/// `super::server::ServerIntent` for the egress direction.
pub enum ClientIntent {
    ConnectionAccepted,
    ConnectionRejected(String),
    PublishAccepted,
    PublishRejected(String),
    Other,
}

/// Wraps a handshaken `rml_rtmp::sessions::ClientSession` for one outbound
/// push-egress connection.
pub struct ClientConnection {
    session: ClientSession,
}

impl ClientConnection {
    pub fn new(session: ClientSession) -> Self {
        Self { session }
    }

    pub fn request_connection(&mut self, app_name: &str) -> Result<Vec<u8>> {
        let result = self.session.request_connection(app_name.to_string())?;
        let mut out = Vec::new();
        let mut intents = Vec::new();
        self.drain_one(result, &mut out, &mut intents);
        Ok(out)
    }

    pub fn request_publishing(&mut self, stream_key: &str) -> Result<Vec<u8>> {
        let result = self
            .session
            .request_publishing(stream_key.to_string(), PublishRequestType::Live)?;
        let mut out = Vec::new();
        let mut intents = Vec::new();
        self.drain_one(result, &mut out, &mut intents);
        Ok(out)
    }

    pub fn publish_audio(&mut self, data: Bytes, timestamp: u32) -> Result<Vec<u8>> {
        let result = self
            .session
            .publish_audio_data(data, RtmpTimestamp::new(timestamp), true)?;
        let mut out = Vec::new();
        let mut intents = Vec::new();
        self.drain_one(result, &mut out, &mut intents);
        Ok(out)
    }

    pub fn publish_video(&mut self, data: Bytes, timestamp: u32) -> Result<Vec<u8>> {
        let result = self
            .session
            .publish_video_data(data, RtmpTimestamp::new(timestamp), false)?;
        let mut out = Vec::new();
        let mut intents = Vec::new();
        self.drain_one(result, &mut out, &mut intents);
        Ok(out)
    }

    /// Feeds freshly read bytes into the session, returning outbound bytes
    /// to write back and any intents raised as a result.
    pub fn handle_input(&mut self, data: &[u8]) -> Result<(Vec<u8>, Vec<ClientIntent>)> {
        let results = self.session.handle_input(data)?;
        let mut out = Vec::new();
        let mut intents = Vec::new();
        for result in results {
            self.drain_one(result, &mut out, &mut intents);
        }
        Ok((out, intents))
    }

    /// Feeds the initial results returned by `ClientSession::new` through
    /// the same translation path as `handle_input`.
    pub fn drain_initial(&mut self, results: Vec<ClientSessionResult>) -> (Vec<u8>, Vec<ClientIntent>) {
        let mut out = Vec::new();
        let mut intents = Vec::new();
        for result in results {
            self.drain_one(result, &mut out, &mut intents);
        }
        (out, intents)
    }

    fn drain_one(&mut self, result: ClientSessionResult, out: &mut Vec<u8>, intents: &mut Vec<ClientIntent>) {
        match result {
            ClientSessionResult::OutboundResponse(packet) => out.extend(packet.bytes),
            ClientSessionResult::RaisedEvent(event) => {
                if let Some(intent) = Self::translate(event) {
                    intents.push(intent);
                }
            }
            ClientSessionResult::UnhandleableMessageReceived(_) => {}
        }
    }

    fn translate(event: ClientSessionEvent) -> Option<ClientIntent> {
        match event {
            ClientSessionEvent::ConnectionRequestAccepted => Some(ClientIntent::ConnectionAccepted),
            ClientSessionEvent::ConnectionRequestRejected { description } => {
                Some(ClientIntent::ConnectionRejected(description))
            }
            ClientSessionEvent::PublishRequestAccepted => Some(ClientIntent::PublishAccepted),
            ClientSessionEvent::PublishRequestRejected { description } => {
                Some(ClientIntent::PublishRejected(description))
            }
            _ => Some(ClientIntent::Other),
        }
    }
}

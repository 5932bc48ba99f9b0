use crate::consumer::{KeyframeGate, SendQueue};
use crate::frame::MediaFrameBatch;
use crate::registry::TargetDef;
use crate::rtmp_io::client::{ClientConnection, ClientIntent};
use crate::rtmp_io::{run_handshake, AsyncReadWrite};
use anyhow::{anyhow, bail, Result};
use log::warn;
use rml_rtmp::handshake::PeerType;
use rml_rtmp::sessions::{ClientSession, ClientSessionConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex as TokioMutex, Notify};
use tokio_util::sync::CancellationToken;
use url::Url;

const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

/// One RTMP(S) client pushing this stream's batches to one downstream URL.
/// Runs a reconnect loop for the life of the stream's listing of this
/// target; closed only when dropped from the target set or the stream
/// quits.
pub struct PushConsumer {
    target: TargetDef,
    queue: SendQueue,
    gate: KeyframeGate,
    notify: Notify,
    quited: AtomicBool,
    cancel: CancellationToken,
}

struct ParsedTarget {
    host: String,
    port: u16,
    app: String,
    stream_key: String,
    use_tls: bool,
}

fn parse_target(url: &str) -> Result<ParsedTarget> {
    let parsed = Url::parse(url)?;
    let use_tls = match parsed.scheme() {
        "rtmp" => false,
        "rtmps" => true,
        other => bail!("unsupported target scheme '{other}'"),
    };
    let host = parsed
        .host_str()
        .ok_or_else(|| anyhow!("target url missing host: {url}"))?
        .to_string();
    let port = parsed.port().unwrap_or(if use_tls { 443 } else { 1935 });

    let mut segments: Vec<&str> = parsed
        .path_segments()
        .map(|s| s.collect())
        .unwrap_or_default();
    segments.retain(|s| !s.is_empty());
    if segments.is_empty() {
        bail!("target url missing app/stream path: {url}");
    }
    let app = segments[0].to_string();
    let stream_key = segments[1..].join("/");

    Ok(ParsedTarget {
        host,
        port,
        app,
        stream_key,
        use_tls,
    })
}

impl PushConsumer {
    pub fn spawn(target: TargetDef) -> Arc<Self> {
        let this = Arc::new(Self {
            target,
            queue: SendQueue::new(),
            gate: KeyframeGate::new(),
            notify: Notify::new(),
            quited: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });
        tokio::spawn(this.clone().reconnect_loop());
        this
    }

    pub fn target_url(&self) -> &str {
        &self.target.url
    }

    /// Appends a batch to the send queue (truncating per the shared
    /// overflow policy) and wakes the sender. Non-blocking.
    pub fn play(&self, batch: MediaFrameBatch) {
        self.queue.push(batch);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.quited.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        if self.quited.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.notify.notify_one();
    }

    async fn reconnect_loop(self: Arc<Self>) {
        loop {
            if self.quited.load(Ordering::Acquire) {
                return;
            }
            let result = tokio::select! {
                r = self.connect_and_serve() => r,
                _ = self.cancel.cancelled() => Ok(()),
            };
            if let Err(e) = result {
                warn!("push target '{}' disconnected: {:#}", self.target.url, e);
            }
            if self.quited.load(Ordering::Acquire) {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                _ = self.cancel.cancelled() => return,
            }
        }
    }

    async fn connect_and_serve(self: &Arc<Self>) -> Result<()> {
        let parsed = parse_target(&self.target.url)?;
        let tcp = TcpStream::connect((parsed.host.as_str(), parsed.port)).await?;

        let mut socket: Box<dyn AsyncReadWrite> = if parsed.use_tls {
            let mut builder = native_tls::TlsConnector::builder();
            builder.danger_accept_invalid_certs(!self.target.verify_tls);
            let connector = tokio_native_tls::TlsConnector::from(builder.build()?);
            Box::new(connector.connect(&parsed.host, tcp).await?)
        } else {
            Box::new(tcp)
        };

        let remaining = run_handshake(&mut socket, PeerType::Client).await?;
        let (session, initial_results) = ClientSession::new(ClientSessionConfig::new())?;
        let mut conn = ClientConnection::new(session);

        let (initial_out, _) = conn.drain_initial(initial_results);
        if !initial_out.is_empty() {
            socket.write_all(&initial_out).await?;
        }
        if !remaining.is_empty() {
            let (out, _) = conn.handle_input(&remaining)?;
            if !out.is_empty() {
                socket.write_all(&out).await?;
            }
        }

        let connect_bytes = conn.request_connection(&parsed.app)?;
        socket.write_all(&connect_bytes).await?;
        wait_for(
            &mut socket,
            &mut conn,
            |i| matches!(i, ClientIntent::ConnectionAccepted),
            |i| matches!(i, ClientIntent::ConnectionRejected(_)),
        )
        .await?;

        let publish_bytes = conn.request_publishing(&parsed.stream_key)?;
        socket.write_all(&publish_bytes).await?;
        wait_for(
            &mut socket,
            &mut conn,
            |i| matches!(i, ClientIntent::PublishAccepted),
            |i| matches!(i, ClientIntent::PublishRejected(_)),
        )
        .await?;

        // PUBLISH_START: start clean from the new connection.
        self.queue.clear();
        self.gate.reset();

        let (read_half, write_half) = tokio::io::split(socket);
        let conn = Arc::new(TokioMutex::new(conn));
        let writer = Arc::new(TokioMutex::new(write_half));

        tokio::select! {
            r = Self::run_reader(read_half, conn.clone(), writer.clone()) => r,
            r = self.clone().run_sender(conn, writer) => r,
        }
    }

    async fn run_reader(
        mut read_half: ReadHalf<Box<dyn AsyncReadWrite>>,
        conn: Arc<TokioMutex<ClientConnection>>,
        writer: Arc<TokioMutex<WriteHalf<Box<dyn AsyncReadWrite>>>>,
    ) -> Result<()> {
        let mut buf = vec![0u8; 65536];
        loop {
            let n = read_half.read(&mut buf).await?;
            if n == 0 {
                bail!("downstream closed the connection");
            }
            let out = conn.lock().await.handle_input(&buf[..n])?.0;
            if !out.is_empty() {
                writer.lock().await.write_all(&out).await?;
            }
        }
    }

    async fn run_sender(
        self: Arc<Self>,
        conn: Arc<TokioMutex<ClientConnection>>,
        writer: Arc<TokioMutex<WriteHalf<Box<dyn AsyncReadWrite>>>>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = self.cancel.cancelled() => return Ok(()),
            }
            if self.quited.load(Ordering::Acquire) {
                return Ok(());
            }
            for batch in self.queue.drain() {
                for frame in batch.frames {
                    if !self.gate.admit(frame.codec, frame.is_keyframe) {
                        continue;
                    }
                    let out = {
                        let mut c = conn.lock().await;
                        if frame.codec.is_video() {
                            c.publish_video(frame.payload, frame.pts)?
                        } else {
                            c.publish_audio(frame.payload, frame.pts)?
                        }
                    };
                    writer.lock().await.write_all(&out).await?;
                }
            }
        }
    }
}

/// Reads off `socket` until an intent matching `accepted` or `rejected`
/// arrives, writing any outbound protocol bytes as it goes. Used for the
/// connect/publish request-response phase, before the connection is split
/// into the reader/sender task pair.
async fn wait_for(
    socket: &mut Box<dyn AsyncReadWrite>,
    conn: &mut ClientConnection,
    accepted: impl Fn(&ClientIntent) -> bool,
    rejected: impl Fn(&ClientIntent) -> bool,
) -> Result<()> {
    let mut buf = vec![0u8; 4096];
    loop {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            bail!("downstream closed the connection during handshake");
        }
        let (out, intents) = conn.handle_input(&buf[..n])?;
        if !out.is_empty() {
            socket.write_all(&out).await?;
        }
        for intent in &intents {
            if accepted(intent) {
                return Ok(());
            }
            if rejected(intent) {
                bail!("downstream rejected the request");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rtmp_target() {
        let p = parse_target("rtmp://example.com/live/stream-key").unwrap();
        assert_eq!(p.host, "example.com");
        assert_eq!(p.port, 1935);
        assert_eq!(p.app, "live");
        assert_eq!(p.stream_key, "stream-key");
        assert!(!p.use_tls);
    }

    #[test]
    fn parses_rtmps_target_with_explicit_port() {
        let p = parse_target("rtmps://example.com:4443/app/key/extra").unwrap();
        assert_eq!(p.port, 4443);
        assert_eq!(p.app, "app");
        assert_eq!(p.stream_key, "key/extra");
        assert!(p.use_tls);
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(parse_target("http://example.com/app/key").is_err());
    }
}

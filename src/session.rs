use crate::consumer::pull::PullConsumer;
use crate::flv;
use crate::producer::Producer;
use crate::registry::StreamRegistry;
use crate::rtmp_io::server::{ServerConnection, ServerIntent};
use anyhow::Result;
use log::debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex as TokioMutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How long a single read blocks before the session checks for process
/// cancellation. Short enough that shutdown is observed promptly without
/// spinning.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(100);

enum Bound {
    Producer(Arc<Producer>),
    Pull(Arc<PullConsumer>),
}

impl Bound {
    fn close(&self) {
        match self {
            Bound::Producer(p) => p.close(),
            Bound::Pull(p) => p.close(),
        }
    }
}

/// Per-inbound-TCP-connection RTMP state machine. Drives the handshake,
/// then dispatches `publish`/`play` intents raised by `rml_rtmp` into a
/// [`Producer`] or [`PullConsumer`] bound to the stream named in the
/// request.
pub struct Session {
    id: Uuid,
    registry: Arc<StreamRegistry>,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(registry: Arc<StreamRegistry>, cancel: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            registry,
            cancel,
        }
    }

    pub async fn run(self, socket: TcpStream) {
        if let Err(e) = self.run_inner(socket).await {
            debug!("session {} ended: {:#}", self.id, e);
        }
    }

    async fn run_inner(&self, mut socket: TcpStream) -> Result<()> {
        let (conn, out) = ServerConnection::accept(&mut socket).await?;
        if !out.is_empty() {
            socket.write_all(&out).await?;
        }

        let (mut read_half, write_half) = socket.into_split();
        let conn = Arc::new(TokioMutex::new(conn));
        let writer = Arc::new(TokioMutex::new(write_half));

        let mut bound: Option<Bound> = None;
        let mut buf = vec![0u8; 65536];

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let read = tokio::time::timeout(READ_POLL_INTERVAL, read_half.read(&mut buf)).await;
            match read {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    let (out, intents) = conn.lock().await.handle_input(&buf[..n])?;
                    if !out.is_empty() {
                        writer.lock().await.write_all(&out).await?;
                    }
                    for intent in intents {
                        self.handle_intent(&conn, &writer, intent, &mut bound).await?;
                    }
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_elapsed) => continue,
            }
        }

        self.stop(&mut bound, &writer).await;
        Ok(())
    }

    async fn handle_intent(
        &self,
        conn: &Arc<TokioMutex<ServerConnection>>,
        writer: &Arc<TokioMutex<OwnedWriteHalf>>,
        intent: ServerIntent,
        bound: &mut Option<Bound>,
    ) -> Result<()> {
        match intent {
            ServerIntent::Publish {
                request_id,
                stream_key,
                ..
            } => match self.registry.lookup(&stream_key) {
                Some(stream) => {
                    let out = conn.lock().await.accept_request(request_id)?;
                    writer.lock().await.write_all(&out).await?;
                    let producer = Arc::new(Producer::new(self.registry.clone(), stream_key, stream));
                    producer.start();
                    *bound = Some(Bound::Producer(producer));
                }
                None => {
                    let out = conn
                        .lock()
                        .await
                        .reject_request(request_id, "stream not registered")?;
                    writer.lock().await.write_all(&out).await?;
                }
            },
            ServerIntent::Play {
                request_id,
                stream_key,
                stream_id,
                ..
            } => match self.registry.lookup(&stream_key) {
                Some(stream) => {
                    let out = conn.lock().await.accept_request(request_id)?;
                    writer.lock().await.write_all(&out).await?;
                    let consumer =
                        PullConsumer::spawn(stream_key, stream_id, conn.clone(), writer.clone());
                    stream.register_pull(&consumer);
                    *bound = Some(Bound::Pull(consumer));
                }
                None => {
                    let out = conn
                        .lock()
                        .await
                        .reject_request(request_id, "stream not found")?;
                    writer.lock().await.write_all(&out).await?;
                }
            },
            ServerIntent::Audio { data, timestamp } => {
                if let Some(Bound::Producer(producer)) = bound {
                    if let Some(tagged) = flv::parse_audio_tag(&data) {
                        producer.on_frame(
                            tagged.codec,
                            tagged.payload,
                            &[],
                            timestamp,
                            timestamp,
                            tagged.is_sequence_header,
                        );
                    }
                }
            }
            ServerIntent::Video { data, timestamp } => {
                if let Some(Bound::Producer(producer)) = bound {
                    if let Some(tagged) = flv::parse_video_tag(&data) {
                        producer.on_frame(
                            tagged.codec,
                            tagged.payload,
                            &tagged.nal_payload,
                            timestamp,
                            timestamp,
                            tagged.is_sequence_header,
                        );
                    }
                }
            }
            ServerIntent::PublishFinished => {
                if let Some(b) = bound.take() {
                    b.close();
                }
            }
            ServerIntent::PlayFinished => {
                if let Some(b) = bound.take() {
                    b.close();
                }
            }
            ServerIntent::Other => {}
        }
        Ok(())
    }

    /// Idempotent by construction: this is only ever reached once, at the
    /// end of `run_inner`'s read loop.
    async fn stop(&self, bound: &mut Option<Bound>, writer: &Arc<TokioMutex<OwnedWriteHalf>>) {
        if let Some(b) = bound.take() {
            b.close();
        }
        let _ = writer.lock().await.shutdown().await;
    }
}

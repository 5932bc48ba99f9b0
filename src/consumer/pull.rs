use crate::consumer::{KeyframeGate, SendQueue};
use crate::frame::MediaFrameBatch;
use crate::rtmp_io::server::ServerConnection;
use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex as TokioMutex, Notify};
use tokio_util::sync::CancellationToken;

/// Adapter from a `Stream`'s fan-out back into a playing [`crate::session::Session`].
/// Owned by that session; only weakly referenced by the `Stream`'s
/// consumer list (see [`crate::stream::Stream`]'s doc comment).
pub struct PullConsumer {
    stream_key: String,
    stream_id: u32,
    conn: Arc<TokioMutex<ServerConnection>>,
    writer: Arc<TokioMutex<OwnedWriteHalf>>,
    queue: SendQueue,
    gate: KeyframeGate,
    notify: Notify,
    quited: AtomicBool,
    cancel: CancellationToken,
}

impl PullConsumer {
    pub fn spawn(
        stream_key: String,
        stream_id: u32,
        conn: Arc<TokioMutex<ServerConnection>>,
        writer: Arc<TokioMutex<OwnedWriteHalf>>,
    ) -> Arc<Self> {
        let this = Arc::new(Self {
            stream_key,
            stream_id,
            conn,
            writer,
            queue: SendQueue::new(),
            gate: KeyframeGate::new(),
            notify: Notify::new(),
            quited: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });
        tokio::spawn(this.clone().run());
        this
    }

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

    async fn run(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = self.cancel.cancelled() => return,
            }
            if self.quited.load(Ordering::Acquire) {
                return;
            }
            for batch in self.queue.drain() {
                for frame in batch.frames {
                    if !self.gate.admit(frame.codec, frame.is_keyframe) {
                        continue;
                    }
                    if self.send_frame(&frame).await.is_err() {
                        self.close();
                        return;
                    }
                }
            }
        }
    }

    async fn send_frame(&self, frame: &crate::frame::MediaFrame) -> Result<()> {
        let out = {
            let mut conn = self.conn.lock().await;
            if frame.codec.is_video() {
                conn.send_video(self.stream_id, frame.payload.clone(), frame.pts)?
            } else {
                conn.send_audio(self.stream_id, frame.payload.clone(), frame.pts)?
            }
        };
        self.writer.lock().await.write_all(&out).await?;
        Ok(())
    }
}

use crate::consumer::pull::PullConsumer;
use crate::consumer::push::PushConsumer;
use crate::frame::MediaFrameBatch;
use crate::registry::{StreamDef, StreamStatus, TargetDef};
use futures_util::future::join_all;
use log::warn;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Inbound batches are dropped, never blocked on, once this many are
/// queued for a stream's dispatcher.
const INBOUND_QUEUE_CAPACITY: usize = 3000;

/// How long a stream may go without an inbound batch before its consumers
/// are declared dead and closed.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// The addressable logical stream: push/pull consumer fan-out, target
/// reconciliation, idle detection. One dispatcher task runs for the life
/// of the `Stream`, from construction until `quit()`.
pub struct Stream {
    pub name: String,
    targets: Mutex<Vec<TargetDef>>,
    status: Mutex<StreamStatus>,
    push_consumers: Mutex<Vec<Arc<PushConsumer>>>,
    /// Weak: a `PullConsumer` is owned by the playing `Session`, only
    /// referenced here. The Stream never closes one, only drops its
    /// reference once `is_closed()` reports true.
    pull_consumers: Mutex<Vec<Weak<PullConsumer>>>,
    inbound_tx: mpsc::Sender<MediaFrameBatch>,
    quit: CancellationToken,
}

impl Stream {
    pub fn new(name: String, targets: Vec<TargetDef>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        let stream = Arc::new(Self {
            name,
            targets: Mutex::new(targets),
            status: Mutex::new(StreamStatus::default()),
            push_consumers: Mutex::new(Vec::new()),
            pull_consumers: Mutex::new(Vec::new()),
            inbound_tx: tx,
            quit: CancellationToken::new(),
        });
        tokio::spawn(stream.clone().dispatch_loop(rx));
        stream
    }

    pub fn definition(&self) -> StreamDef {
        StreamDef {
            name: self.name.clone(),
            targets: self.targets(),
        }
    }

    pub fn targets(&self) -> Vec<TargetDef> {
        self.targets.lock().unwrap().clone()
    }

    pub fn set_targets(&self, targets: Vec<TargetDef>) {
        *self.targets.lock().unwrap() = targets;
    }

    pub fn add_target(&self, target: TargetDef) {
        let mut targets = self.targets.lock().unwrap();
        if !targets.iter().any(|t| t.url == target.url) {
            targets.push(target);
        }
    }

    pub fn remove_target(&self, url: &str) {
        self.targets.lock().unwrap().retain(|t| t.url != url);
    }

    pub fn status(&self) -> StreamStatus {
        *self.status.lock().unwrap()
    }

    pub fn update_status(&self, last_frame_time: SystemTime, bitrate_kbps: u64) {
        *self.status.lock().unwrap() = StreamStatus {
            bitrate_kbps,
            last_frame_time: Some(last_frame_time),
        };
    }

    /// Registers a playing session's [`PullConsumer`] on this stream's
    /// fan-out list. Stores only a weak reference - see the struct doc.
    pub fn register_pull(&self, consumer: &Arc<PullConsumer>) {
        self.pull_consumers.lock().unwrap().push(Arc::downgrade(consumer));
    }

    /// Non-blocking enqueue from the Producer. If the inbound queue is
    /// full the batch is dropped and a warning logged - the sole
    /// backpressure mechanism against a slow fan-out.
    pub fn on_frame_batch(&self, batch: MediaFrameBatch) {
        if self.inbound_tx.try_send(batch).is_err() {
            warn!("stream '{}': inbound queue full, dropping batch", self.name);
        }
    }

    pub fn quit(&self) {
        self.quit.cancel();
    }

    async fn dispatch_loop(self: Arc<Self>, mut rx: mpsc::Receiver<MediaFrameBatch>) {
        loop {
            tokio::select! {
                maybe_batch = rx.recv() => {
                    match maybe_batch {
                        Some(batch) => self.fan_out(batch).await,
                        None => break,
                    }
                }
                _ = tokio::time::sleep(IDLE_TIMEOUT) => {
                    self.close_all_consumers().await;
                }
                _ = self.quit.cancelled() => break,
            }
        }
        self.close_all_consumers().await;
    }

    async fn fan_out(&self, batch: MediaFrameBatch) {
        self.reconcile().await;

        let push_snapshot = self.push_consumers.lock().unwrap().clone();
        let pull_snapshot: Vec<Arc<PullConsumer>> = self
            .pull_consumers
            .lock()
            .unwrap()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();

        let mut handles = Vec::with_capacity(push_snapshot.len() + pull_snapshot.len());
        for consumer in push_snapshot {
            let batch = batch.clone();
            handles.push(tokio::spawn(async move {
                if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| consumer.play(batch))) {
                    log::error!("panic dispatching batch to push consumer: {:?}", panic);
                }
            }));
        }
        for consumer in pull_snapshot {
            let batch = batch.clone();
            handles.push(tokio::spawn(async move {
                if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| consumer.play(batch))) {
                    log::error!("panic dispatching batch to pull consumer: {:?}", panic);
                }
            }));
        }
        join_all(handles).await;
    }

    /// Reconciles the live push-consumer set against the configured
    /// targets (additive: spawn missing, drop stale/closed) and prunes
    /// dead pull consumers. Run once per batch, before fan-out.
    async fn reconcile(&self) {
        let desired = self.targets();
        let desired_urls: HashSet<&str> = desired.iter().map(|t| t.url.as_str()).collect();

        let stale = {
            let mut push = self.push_consumers.lock().unwrap();
            let mut stale = Vec::new();
            push.retain(|c| {
                if !desired_urls.contains(c.target_url()) || c.is_closed() {
                    stale.push(c.clone());
                    false
                } else {
                    true
                }
            });
            let existing_urls: HashSet<&str> = push.iter().map(|c| c.target_url()).collect();
            for target in &desired {
                if !existing_urls.contains(target.url.as_str()) {
                    push.push(PushConsumer::spawn(target.clone()));
                }
            }
            stale
        };
        for consumer in stale {
            // Closing dials out a backoff sleep in the worst case; never
            // block fan-out on it.
            tokio::spawn(async move { consumer.close() });
        }

        self.pull_consumers
            .lock()
            .unwrap()
            .retain(|weak| weak.upgrade().map(|p| !p.is_closed()).unwrap_or(false));
    }

    async fn close_all_consumers(&self) {
        let push = self.push_consumers.lock().unwrap().drain(..).collect::<Vec<_>>();
        let pull = self.pull_consumers.lock().unwrap().drain(..).collect::<Vec<_>>();
        for consumer in push {
            consumer.close();
        }
        for weak in pull {
            if let Some(consumer) = weak.upgrade() {
                consumer.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn on_frame_batch_drops_when_queue_full() {
        let stream = Stream::new("alpha".to_string(), vec![]);
        // Fill well past capacity; none of this should panic or block.
        for _ in 0..(INBOUND_QUEUE_CAPACITY + 10) {
            stream.on_frame_batch(MediaFrameBatch::new(tokio::time::Instant::now()));
        }
        stream.quit();
    }

    #[tokio::test]
    async fn add_and_remove_target_affect_definition() {
        let stream = Stream::new("alpha".to_string(), vec![]);
        stream.add_target(TargetDef {
            url: "rtmp://a/live/k1".to_string(),
            name: "a".to_string(),
            verify_tls: false,
        });
        assert_eq!(stream.definition().targets.len(), 1);
        stream.remove_target("rtmp://a/live/k1");
        assert_eq!(stream.definition().targets.len(), 0);
        stream.quit();
    }
}

pub mod pull;
pub mod push;

use crate::frame::{CodecId, MediaFrameBatch};
use std::sync::Mutex;

/// Per-consumer overflow policy: once the queued batch count reaches
/// `HIGH_WATER`, drop all but the `LOW_WATER` most recent entries so a
/// slow consumer catches back up toward live instead of falling further
/// behind. Identical on the push and pull paths (SPEC_FULL §9) because
/// the failure mode - a slow downstream - is identical on both.
const HIGH_WATER: usize = 90;
const LOW_WATER: usize = 45;

/// Batch queue shared by [`push::PushConsumer`] and [`pull::PullConsumer`].
/// Distinct from the Stream's inbound queue (`tokio::sync::mpsc`, capacity
/// 3000) - this is the *per-consumer* overflow guard.
#[derive(Default)]
pub struct SendQueue {
    batches: Mutex<Vec<MediaFrameBatch>>,
}

impl SendQueue {
    pub fn new() -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
        }
    }

    /// Appends a batch, keeping only the newest `LOW_WATER` entries once
    /// the queue reaches `HIGH_WATER` (the older half is discarded).
    pub fn push(&self, batch: MediaFrameBatch) {
        let mut batches = self.batches.lock().unwrap();
        batches.push(batch);
        let n = batches.len();
        if n >= HIGH_WATER {
            batches.drain(0..n - LOW_WATER);
        }
    }

    /// Drains every currently queued batch in enqueue order.
    pub fn drain(&self) -> Vec<MediaFrameBatch> {
        let mut batches = self.batches.lock().unwrap();
        std::mem::take(&mut *batches)
    }

    pub fn clear(&self) {
        self.batches.lock().unwrap().clear();
    }
}

/// Tracks whether a consumer has seen its first video IDR yet. Until it
/// has, every video frame is dropped; audio is held back too so a player
/// never starts mid-GOP with silent/garbled video.
pub struct KeyframeGate {
    first_video: Mutex<bool>,
}

impl Default for KeyframeGate {
    fn default() -> Self {
        Self {
            first_video: Mutex::new(true),
        }
    }
}

impl KeyframeGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` if this frame should be forwarded downstream.
    pub fn admit(&self, codec: CodecId, is_keyframe: bool) -> bool {
        let mut gate = self.first_video.lock().unwrap();
        if !*gate {
            return true;
        }
        if !codec.is_video() {
            // Hold audio back until the first video IDR too, otherwise a
            // player can start with sound and a black/garbled frame.
            return false;
        }
        if is_keyframe {
            *gate = false;
            return true;
        }
        false
    }

    pub fn reset(&self) {
        *self.first_video.lock().unwrap() = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::MediaFrame;
    use bytes::Bytes;
    use tokio::time::Instant;

    fn batch(seq: u32) -> MediaFrameBatch {
        let mut b = MediaFrameBatch::new(Instant::now());
        b.push(MediaFrame::new(CodecId::H264, Bytes::new(), seq, seq, false));
        b
    }

    #[test]
    fn overflow_keeps_newest_45() {
        let q = SendQueue::new();
        for i in 0..90 {
            q.push(batch(i));
        }
        let drained = q.drain();
        assert_eq!(drained.len(), 45);
        // The surviving batches are the 45 most recently pushed (seq 45..90),
        // not the 45 oldest - a slow consumer must catch up toward live.
        assert_eq!(drained.first().unwrap().frames[0].pts, 45);
        assert_eq!(drained.last().unwrap().frames[0].pts, 89);
    }

    #[test]
    fn keyframe_gate_drops_until_idr() {
        let gate = KeyframeGate::new();
        assert!(!gate.admit(CodecId::H264, false));
        assert!(!gate.admit(CodecId::Aac, false));
        assert!(gate.admit(CodecId::H264, true));
        assert!(gate.admit(CodecId::Aac, false));
        assert!(gate.admit(CodecId::H264, false));
    }

    #[test]
    fn keyframe_gate_resets() {
        let gate = KeyframeGate::new();
        gate.admit(CodecId::H264, true);
        assert!(gate.admit(CodecId::H264, false));
        gate.reset();
        assert!(!gate.admit(CodecId::H264, false));
    }
}

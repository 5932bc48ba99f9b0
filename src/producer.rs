use crate::frame::{CodecId, MediaFrame, MediaFrameBatch};
use crate::idr::detect_keyframe;
use crate::registry::StreamRegistry;
use crate::stream::Stream;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;

/// A batch is closed either one wall-clock second after its first frame,
/// or as soon as a video keyframe arrives - whichever happens first.
const BATCH_MAX_AGE: Duration = Duration::from_secs(1);

/// Per-publishing-session frame assembler. Attached to a [`crate::session::Session`]
/// on a successful `publish`; turns the raw frames `rml_rtmp` hands back
/// into [`MediaFrameBatch`]es and reports bitrate/liveness into the
/// [`StreamRegistry`].
pub struct Producer {
    registry: Arc<StreamRegistry>,
    stream_name: String,
    stream: Arc<Stream>,
    current: Mutex<Option<(MediaFrameBatch, SystemTime)>>,
}

impl Producer {
    pub fn new(registry: Arc<StreamRegistry>, stream_name: String, stream: Arc<Stream>) -> Self {
        Self {
            registry,
            stream_name,
            stream,
            current: Mutex::new(None),
        }
    }

    /// No-op hook kept for symmetry with the `on_publish` -> `producer.start()`
    /// wiring the RTMP session performs on `PUBLISH_START`; this crate's
    /// session feeds frames to the producer directly rather than through a
    /// separate subscription callback.
    pub fn start(&self) {}

    /// Call for every audio/video frame delivered by the RTMP session.
    /// `payload` is the full codec-specific tag body (FLV VIDEODATA/
    /// AUDIODATA, header included) and is stored verbatim so egress can
    /// hand it back to `publish_video_data`/`send_video_data` unchanged;
    /// `keyframe_scan` is the AVCC NAL payload past that header, used only
    /// to detect an IDR and otherwise ignored (pass `&[]` for audio).
    /// `is_sequence_header` is set for AVC/HEVC decoder configuration
    /// records, which always close out (and start) a GOP boundary even
    /// though they contain no IDR NAL unit themselves.
    pub fn on_frame(
        &self,
        codec: CodecId,
        payload: Bytes,
        keyframe_scan: &[u8],
        pts: u32,
        dts: u32,
        is_sequence_header: bool,
    ) {
        let is_keyframe =
            codec.is_video() && (is_sequence_header || detect_keyframe(codec, keyframe_scan));
        let frame = MediaFrame::new(codec, payload, pts, dts, is_keyframe);

        let now = Instant::now();
        let finished = {
            let mut guard = self.current.lock().unwrap();
            let (batch, _) = guard.get_or_insert_with(|| (MediaFrameBatch::new(now), SystemTime::now()));
            batch.push(frame);

            let elapsed = now.duration_since(batch.start_time);
            if elapsed >= BATCH_MAX_AGE || is_keyframe {
                guard.take()
            } else {
                None
            }
        };

        if let Some((batch, wall_start)) = finished {
            self.finalize(batch, wall_start);
        }
    }

    fn finalize(&self, batch: MediaFrameBatch, wall_start: SystemTime) {
        let elapsed = wall_start.elapsed().unwrap_or(Duration::from_millis(1));
        let elapsed_secs = elapsed.as_secs_f64().max(0.001);
        let bitrate_kbps = ((batch.total_bytes() as f64 * 8.0) / elapsed_secs / 1024.0) as u64;

        let _ = self
            .registry
            .update_status(&self.stream_name, wall_start, bitrate_kbps);
        self.stream.on_frame_batch(batch);
    }

    /// Called when the session that owns this producer tears down. Zeroes
    /// the stream's status so `is_live` flips false within one status read,
    /// without waiting for the stream's own 30s idle timeout.
    pub fn close(&self) {
        let _ = self
            .registry
            .update_status(&self.stream_name, std::time::UNIX_EPOCH, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StreamRegistry;

    fn registry_with_stream(name: &str) -> Arc<StreamRegistry> {
        let path = format!("/tmp/rtmp-relay-producer-test-{}.json", uuid::Uuid::new_v4());
        let registry = StreamRegistry::new(path);
        registry
            .update(crate::registry::StreamDef {
                name: name.to_string(),
                targets: vec![],
            })
            .unwrap();
        registry
    }

    #[test]
    fn keyframe_flushes_immediately() {
        let registry = registry_with_stream("alpha");
        let stream = registry.lookup("alpha").unwrap();
        let producer = Producer::new(registry.clone(), "alpha".to_string(), stream);

        let non_idr = Bytes::from_static(b"\x00\x00\x00\x01\x01");
        producer.on_frame(CodecId::H264, non_idr.clone(), &non_idr, 0, 0, false);
        let status_before = registry.status("alpha").unwrap();
        assert_eq!(status_before.bitrate_kbps, 0);

        let idr = Bytes::from_static(b"\x00\x00\x00\x01\x05");
        producer.on_frame(CodecId::H264, idr.clone(), &idr, 33, 33, false);
        let status_after = registry.status("alpha").unwrap();
        assert!(status_after.last_frame_time.is_some());
    }

    #[test]
    fn close_zeroes_status() {
        let registry = registry_with_stream("beta");
        let stream = registry.lookup("beta").unwrap();
        let producer = Producer::new(registry.clone(), "beta".to_string(), stream);
        let idr = Bytes::from_static(b"\x00\x00\x00\x01\x05");
        producer.on_frame(CodecId::H264, idr.clone(), &idr, 0, 0, false);
        producer.close();
        let status = registry.status("beta").unwrap();
        assert!(!status.is_live());
        assert_eq!(status.bitrate_kbps, 0);
    }
}

use bytes::Bytes;
use tokio::time::Instant;

/// Codec carried by a single [`MediaFrame`].
///
/// Audio codecs beyond AAC/MP3 are passed through without inspection, hence
/// the `Other` escape hatch for whatever FLV/RTMP sound-format id shows up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecId {
    H264,
    H265,
    Aac,
    Mp3,
    Other(u8),
}

impl CodecId {
    pub fn is_video(&self) -> bool {
        matches!(self, CodecId::H264 | CodecId::H265)
    }
}

/// One encoded access unit.
///
/// `payload` is a reference-counted immutable buffer: cloning a frame is
/// O(1) rather than a literal copy, which is the representation SPEC_FULL
/// §9 recommends over a deep-copy-on-clone implementation. The externally
/// observable contract - every consumer sees an independent, immutable
/// batch value - still holds, because nothing mutates a `Bytes` in place.
#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub codec: CodecId,
    pub payload: Bytes,
    /// Presentation timestamp in ms. Wraps at u32::MAX like the wire format.
    pub pts: u32,
    /// Decode timestamp in ms.
    pub dts: u32,
    pub capture_time: std::time::SystemTime,
    pub is_keyframe: bool,
}

impl MediaFrame {
    pub fn new(codec: CodecId, payload: Bytes, pts: u32, dts: u32, is_keyframe: bool) -> Self {
        Self {
            codec,
            payload,
            pts,
            dts,
            capture_time: std::time::SystemTime::now(),
            is_keyframe,
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }
}

/// Ordered sequence of frames closed on a time-or-keyframe boundary; the
/// unit of fan-out from a [`crate::stream::Stream`] to its consumers.
#[derive(Debug, Clone)]
pub struct MediaFrameBatch {
    pub start_time: Instant,
    pub frames: Vec<MediaFrame>,
}

impl MediaFrameBatch {
    pub fn new(start_time: Instant) -> Self {
        Self {
            start_time,
            frames: Vec::new(),
        }
    }

    pub fn push(&mut self, frame: MediaFrame) {
        self.frames.push(frame);
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.frames.iter().map(MediaFrame::len).sum()
    }

    /// `true` if any video frame in this batch is a keyframe.
    pub fn has_keyframe(&self) -> bool {
        self.frames.iter().any(|f| f.is_keyframe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(is_keyframe: bool) -> MediaFrame {
        MediaFrame::new(CodecId::H264, Bytes::from_static(b"\x00\x01\x02"), 0, 0, is_keyframe)
    }

    #[test]
    fn clone_is_independent_but_shares_payload_storage() {
        let mut batch = MediaFrameBatch::new(Instant::now());
        batch.push(frame(false));
        let cloned = batch.clone();

        assert_eq!(cloned.frames.len(), 1);
        assert_eq!(cloned.frames[0].payload, batch.frames[0].payload);
        // Bytes clone is a refcount bump: same backing pointer.
        assert_eq!(
            cloned.frames[0].payload.as_ptr(),
            batch.frames[0].payload.as_ptr()
        );
    }

    #[test]
    fn total_bytes_sums_payload_lengths() {
        let mut batch = MediaFrameBatch::new(Instant::now());
        batch.push(frame(false));
        batch.push(frame(true));
        assert_eq!(batch.total_bytes(), 6);
        assert!(batch.has_keyframe());
    }
}

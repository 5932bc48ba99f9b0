//! Keyframe (IDR) detection for H.264 and H.265 video payloads.
//!
//! `rml_rtmp` hands back raw FLV video payloads (AVCC: each NAL unit
//! prefixed by a 4-byte big-endian length). No crate in the dependency
//! stack exposes this narrow a primitive, so it is implemented here
//! directly against the NAL unit type tables rather than pulled in.

use crate::frame::CodecId;

const H264_NAL_TYPE_IDR: u8 = 5;

// H.265 IRAP picture types: BLA_W_LP .. RSV_IRAP_VCL23
const H265_NAL_TYPE_IRAP_MIN: u8 = 16;
const H265_NAL_TYPE_IRAP_MAX: u8 = 23;

/// `true` iff `payload` (audio or video, any codec) represents a keyframe.
/// Audio is never a keyframe.
pub fn detect_keyframe(codec: CodecId, payload: &[u8]) -> bool {
    match codec {
        CodecId::H264 => is_h264_idr(payload),
        CodecId::H265 => is_h265_idr(payload),
        _ => false,
    }
}

pub fn is_h264_idr(payload: &[u8]) -> bool {
    for nal in iter_length_prefixed_nals(payload) {
        if nal.is_empty() {
            continue;
        }
        let nal_unit_type = nal[0] & 0x1F;
        if nal_unit_type == H264_NAL_TYPE_IDR {
            return true;
        }
    }
    false
}

pub fn is_h265_idr(payload: &[u8]) -> bool {
    for nal in iter_length_prefixed_nals(payload) {
        if nal.len() < 2 {
            continue;
        }
        let nal_unit_type = (nal[0] >> 1) & 0x3F;
        if (H265_NAL_TYPE_IRAP_MIN..=H265_NAL_TYPE_IRAP_MAX).contains(&nal_unit_type) {
            return true;
        }
    }
    false
}

/// Iterates `4-byte length prefix | NAL unit` records. Stops at the first
/// malformed record (truncated length/body) rather than erroring - a
/// partial payload at the tail just yields fewer NAL units, not a crash.
fn iter_length_prefixed_nals(payload: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut pos = 0usize;
    std::iter::from_fn(move || {
        if pos + 4 > payload.len() {
            return None;
        }
        let len = u32::from_be_bytes([
            payload[pos],
            payload[pos + 1],
            payload[pos + 2],
            payload[pos + 3],
        ]) as usize;
        pos += 4;
        if pos + len > payload.len() {
            return None;
        }
        let nal = &payload[pos..pos + len];
        pos += len;
        Some(nal)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nal(nal_unit_type: u8) -> Vec<u8> {
        let body = [nal_unit_type, 0xAA, 0xBB];
        let mut out = (body.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(&body);
        out
    }

    #[test]
    fn h264_idr_detected() {
        let payload = nal(5); // IDR slice
        assert!(is_h264_idr(&payload));
        assert!(detect_keyframe(CodecId::H264, &payload));
    }

    #[test]
    fn h264_non_idr_not_detected() {
        let payload = nal(1); // non-IDR slice
        assert!(!is_h264_idr(&payload));
    }

    #[test]
    fn h265_irap_detected() {
        // nal_unit_type lives in bits [6:1] of the first byte.
        let first_byte = 19 << 1; // IDR_W_RADL
        let body = [first_byte, 0x00, 0xAA];
        let mut payload = (body.len() as u32).to_be_bytes().to_vec();
        payload.extend_from_slice(&body);
        assert!(is_h265_idr(&payload));
    }

    #[test]
    fn audio_is_never_a_keyframe() {
        let payload = nal(5);
        assert!(!detect_keyframe(CodecId::Aac, &payload));
    }

    #[test]
    fn truncated_payload_does_not_panic() {
        let payload = [0, 0, 0, 10, 5]; // claims 10 bytes, has 1
        assert!(!is_h264_idr(&payload));
    }
}

//! FLV audio/video tag header parsing.
//!
//! `rml_rtmp`'s `AudioDataReceived`/`VideoDataReceived` events hand back the
//! tag body exactly as it arrived on the wire - tag header included. This
//! module strips that header to recover the codec id and the codec payload
//! (AVCC-framed NAL units for H.264/H.265) that [`crate::idr`] and
//! [`crate::producer::Producer`] expect.

use crate::frame::CodecId;
use bytes::Bytes;

/// A parsed video tag. `payload` is the **full** VIDEODATA tag body
/// (codec header + AVCC NAL units) exactly as `rml_rtmp` delivered it -
/// this is what gets stored in a [`crate::frame::MediaFrame`] and later
/// handed back to `publish_video_data`/`send_video_data` verbatim on
/// egress, which expect the same codec-specific header back. `nal_payload`
/// is the AVCC body past that header, sliced out only so [`crate::idr`]
/// has NAL units to scan; it is never stored or retransmitted on its own.
pub struct TaggedVideo {
    pub codec: CodecId,
    pub payload: Bytes,
    pub nal_payload: Bytes,
    pub is_sequence_header: bool,
}

/// `data[0]` is `FrameType(4 bits) | CodecID(4 bits)`, `data[1]` is the
/// AVCPacketType (0 = sequence header, 1 = NALU, 2 = end of sequence),
/// `data[2..5]` is a 24-bit composition time offset we don't need.
pub fn parse_video_tag(data: &Bytes) -> Option<TaggedVideo> {
    if data.len() < 5 {
        return None;
    }
    let codec_id = data[0] & 0x0F;
    let packet_type = data[1];
    let codec = match codec_id {
        7 => CodecId::H264,
        // Non-standard but widely deployed (ZLMediaKit, SRS, nginx-rtmp
        // forks) CodecID used for HEVC-in-FLV; no official value exists.
        12 => CodecId::H265,
        other => CodecId::Other(other),
    };
    Some(TaggedVideo {
        codec,
        payload: data.clone(),
        nal_payload: data.slice(5..),
        is_sequence_header: packet_type == 0,
    })
}

/// `payload` is the full AUDIODATA tag body, for the same reason as
/// [`TaggedVideo::payload`]; audio is never keyframe-scanned so there is
/// no equivalent of `nal_payload` here.
pub struct TaggedAudio {
    pub codec: CodecId,
    pub payload: Bytes,
    pub is_sequence_header: bool,
}

/// `data[0]` is `SoundFormat(4 bits) | SoundRate(2) | SoundSize(1) |
/// SoundType(1)`. AAC (format 10) carries one more header byte
/// (AACPacketType: 0 = sequence header, 1 = raw). Everything else is
/// passed through without inspection, per spec.
pub fn parse_audio_tag(data: &Bytes) -> Option<TaggedAudio> {
    if data.is_empty() {
        return None;
    }
    let sound_format = data[0] >> 4;
    match sound_format {
        10 => {
            if data.len() < 2 {
                return None;
            }
            Some(TaggedAudio {
                codec: CodecId::Aac,
                payload: data.clone(),
                is_sequence_header: data[1] == 0,
            })
        }
        2 | 14 => Some(TaggedAudio {
            codec: CodecId::Mp3,
            payload: data.clone(),
            is_sequence_header: false,
        }),
        other => Some(TaggedAudio {
            codec: CodecId::Other(other),
            payload: data.clone(),
            is_sequence_header: false,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn h264_nalu_tag_parsed() {
        let mut raw = vec![0x27, 0x01, 0x00, 0x00, 0x00]; // inter frame, AVC NALU
        raw.extend_from_slice(&[0xAA, 0xBB]);
        let tagged = parse_video_tag(&Bytes::from(raw.clone())).unwrap();
        assert!(matches!(tagged.codec, CodecId::H264));
        assert!(!tagged.is_sequence_header);
        // nal_payload is header-stripped, for keyframe scanning only...
        assert_eq!(&tagged.nal_payload[..], &[0xAA, 0xBB]);
        // ...while payload is the full tag body, unmodified, for storage
        // and retransmission.
        assert_eq!(&tagged.payload[..], &raw[..]);
    }

    #[test]
    fn h264_sequence_header_detected() {
        let raw = vec![0x17, 0x00, 0x00, 0x00, 0x00, 0x01, 0x42];
        let tagged = parse_video_tag(&Bytes::from(raw)).unwrap();
        assert!(tagged.is_sequence_header);
    }

    #[test]
    fn aac_tag_parsed() {
        let raw = vec![0xAF, 0x01, 0x11, 0x22];
        let tagged = parse_audio_tag(&Bytes::from(raw.clone())).unwrap();
        assert!(matches!(tagged.codec, CodecId::Aac));
        assert!(!tagged.is_sequence_header);
        assert_eq!(&tagged.payload[..], &raw[..]);
    }

    #[test]
    fn short_tags_rejected() {
        assert!(parse_video_tag(&Bytes::from_static(b"\x17\x00")).is_none());
        assert!(parse_audio_tag(&Bytes::new()).is_none());
    }
}

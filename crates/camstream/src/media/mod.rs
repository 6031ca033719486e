//! Media sources produced by a backend and consumed by the relay
//!
//! Backends push payloads or frames from library callbacks into bounded
//! channels; the relay drains them into the transcoder.

use bytes::Bytes;
use std::fmt;
use tokio::sync::mpsc;

/// Track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video,
    Audio,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Video => write!(f, "video"),
            MediaKind::Audio => write!(f, "audio"),
        }
    }
}

/// One RTP packet as received from the peer, header fields split out
#[derive(Debug, Clone)]
pub struct MediaPacket {
    pub kind: MediaKind,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub marker: bool,
    pub payload: Bytes,
}

impl MediaPacket {
    /// Serialize back into a minimal RTP packet (V=2, no CSRCs, no extensions)
    pub fn to_rtp(&self, ssrc: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + self.payload.len());
        out.push(0x80);
        out.push(((self.marker as u8) << 7) | (self.payload_type & 0x7f));
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&ssrc.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Pixel layout of a decoded frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Planar Y, U, V (4:2:0)
    I420,
    /// Y plane + interleaved UV (4:2:0)
    Nv12,
}

impl PixelFormat {
    /// Name understood by the transcoder's `-pix_fmt`
    pub fn as_ffmpeg(&self) -> &'static str {
        match self {
            PixelFormat::I420 => "yuv420p",
            PixelFormat::Nv12 => "nv12",
        }
    }

    /// Bytes in one tightly packed frame
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        let luma = width as usize * height as usize;
        let chroma = (width as usize).div_ceil(2) * (height as usize).div_ceil(2);
        luma + 2 * chroma
    }
}

/// Decoded video frame
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Tightly packed planes in format order
    pub planes: Vec<Bytes>,
}

impl VideoFrame {
    /// Concatenate planes into one rawvideo buffer
    pub fn to_raw(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.format.frame_size(self.width, self.height));
        for plane in &self.planes {
            out.extend_from_slice(plane);
        }
        out
    }
}

/// RTP payload streams from a peer connection
#[derive(Debug)]
pub struct RtpSource {
    pub video: mpsc::Receiver<MediaPacket>,
    pub audio: Option<mpsc::Receiver<MediaPacket>>,
    /// Payload type the peer negotiated for video
    pub video_payload_type: u8,
    pub audio_payload_type: u8,
}

/// Decoded frame stream from a managed room
#[derive(Debug)]
pub struct FrameSource {
    pub frames: mpsc::Receiver<VideoFrame>,
}

/// Stream URL the transcoder pulls itself
#[derive(Debug, Clone)]
pub struct DirectSource {
    pub url: String,
    /// Value for an `Authorization` header, if any
    pub authorization: Option<String>,
}

/// What a backend hands to the relay once established
#[derive(Debug)]
pub enum MediaSource {
    Rtp(RtpSource),
    Frames(FrameSource),
    Url(DirectSource),
}

impl MediaSource {
    pub fn describe(&self) -> &'static str {
        match self {
            MediaSource::Rtp(_) => "rtp",
            MediaSource::Frames(_) => "frames",
            MediaSource::Url(_) => "url",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtp_header_layout() {
        let packet = MediaPacket {
            kind: MediaKind::Video,
            payload_type: 96,
            sequence: 0x0102,
            timestamp: 0x03040506,
            marker: true,
            payload: Bytes::from_static(&[0xaa, 0xbb]),
        };
        let raw = packet.to_rtp(0x0a0b0c0d);
        assert_eq!(raw.len(), 14);
        assert_eq!(raw[0], 0x80);
        assert_eq!(raw[1], 0x80 | 96);
        assert_eq!(&raw[2..4], &[0x01, 0x02]);
        assert_eq!(&raw[4..8], &[0x03, 0x04, 0x05, 0x06]);
        assert_eq!(&raw[8..12], &[0x0a, 0x0b, 0x0c, 0x0d]);
        assert_eq!(&raw[12..], &[0xaa, 0xbb]);
    }

    #[test]
    fn test_frame_size() {
        assert_eq!(PixelFormat::I420.frame_size(4, 2), 8 + 2 * 2);
        assert_eq!(PixelFormat::Nv12.frame_size(640, 360), 640 * 360 * 3 / 2);
        assert_eq!(PixelFormat::I420.frame_size(3, 3), 9 + 2 * 4);
    }

    #[test]
    fn test_frame_to_raw() {
        let frame = VideoFrame {
            format: PixelFormat::I420,
            width: 2,
            height: 2,
            planes: vec![
                Bytes::from_static(&[1, 2, 3, 4]),
                Bytes::from_static(&[5]),
                Bytes::from_static(&[6]),
            ],
        };
        assert_eq!(frame.to_raw(), vec![1, 2, 3, 4, 5, 6]);
    }
}

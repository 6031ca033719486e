//! Camera model: provider selection, reported capabilities and the
//! endpoint configuration negotiated against a caller's request

use crate::session::VideoRequest;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Media-delivery backend a camera reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provider {
    /// WebSocket signaling channel + WebRTC peer (RTP payload source)
    Kvs,
    /// SDK-managed room (decoded frame source)
    LiveKit,
    /// Authenticated direct stream URL read by the transcoder itself
    Direct,
}

impl Provider {
    /// Parse the provider string a camera reports.
    ///
    /// Unrecognized values fall back to [`Provider::Direct`].
    pub fn from_reported(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "kvs" | "webrtc" | "kinesis" => Provider::Kvs,
            "livekit" | "lk" => Provider::LiveKit,
            _ => Provider::Direct,
        }
    }

    /// Whether a live-view credential fetch precedes establishment
    pub fn needs_credentials(&self) -> bool {
        !matches!(self, Provider::Direct)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::Kvs => write!(f, "kvs"),
            Provider::LiveKit => write!(f, "livekit"),
            Provider::Direct => write!(f, "direct"),
        }
    }
}

/// H.264 profile, ordered from least to most demanding
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum H264Profile {
    Baseline,
    Main,
    High,
}

impl H264Profile {
    pub fn as_ffmpeg(&self) -> &'static str {
        match self {
            H264Profile::Baseline => "baseline",
            H264Profile::Main => "main",
            H264Profile::High => "high",
        }
    }
}

/// H.264 level, ordered from lowest to highest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum H264Level {
    L3_1,
    L3_2,
    L4_0,
}

impl H264Level {
    pub fn as_ffmpeg(&self) -> &'static str {
        match self {
            H264Level::L3_1 => "3.1",
            H264Level::L3_2 => "3.2",
            H264Level::L4_0 => "4.0",
        }
    }
}

/// Capabilities reported by the owning accessory for one camera
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraCapabilities {
    pub max_width: u32,
    pub max_height: u32,
    pub max_fps: u32,
    pub max_bitrate_kbps: u32,
    pub h264_profile: H264Profile,
    pub h264_level: H264Level,
    pub has_audio: bool,
}

impl Default for CameraCapabilities {
    fn default() -> Self {
        Self {
            max_width: 1920,
            max_height: 1080,
            max_fps: 30,
            max_bitrate_kbps: 2000,
            h264_profile: H264Profile::Main,
            h264_level: H264Level::L4_0,
            has_audio: true,
        }
    }
}

/// A camera as seen by the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraDescriptor {
    /// Camera serial (platform identifier)
    pub serial: String,
    /// Location (system) identifier the camera belongs to
    pub location_id: String,
    /// Display name, used in logs
    pub name: String,
    /// Backend strategy chosen once from the reported provider
    pub provider: Provider,
    pub capabilities: CameraCapabilities,
}

impl CameraDescriptor {
    pub fn new(
        serial: impl Into<String>,
        location_id: impl Into<String>,
        reported_provider: &str,
    ) -> Self {
        let serial = serial.into();
        Self {
            name: serial.clone(),
            serial,
            location_id: location_id.into(),
            provider: Provider::from_reported(reported_provider),
            capabilities: CameraCapabilities::default(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: CameraCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// One advertised (width, height, fps) rung
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// Standard accessory resolutions, largest first
const STANDARD_LADDER: &[(u32, u32, u32)] = &[
    (1920, 1080, 30),
    (1280, 960, 30),
    (1280, 720, 30),
    (1024, 768, 30),
    (640, 480, 30),
    (640, 360, 30),
    (480, 360, 30),
    (480, 270, 30),
    (320, 240, 30),
    (320, 240, 15),
    (320, 180, 30),
];

/// Encoder ceilings and resolution ladder derived from capabilities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraEndpointConfig {
    pub resolutions: Vec<Resolution>,
    pub max_width: u32,
    pub max_height: u32,
    pub max_fps: u32,
    pub max_bitrate_kbps: u32,
    pub profile: H264Profile,
    pub level: H264Level,
}

/// Settings handed to the transcoder for one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_kbps: u32,
    pub profile: H264Profile,
    pub level: H264Level,
}

impl CameraEndpointConfig {
    pub fn from_capabilities(caps: &CameraCapabilities) -> Self {
        let max_fps = caps.max_fps.max(1);
        // Smallest frame an H.264 4:2:0 encoder accepts
        let max_width = caps.max_width.max(2);
        let max_height = caps.max_height.max(2);

        let mut resolutions: Vec<Resolution> = STANDARD_LADDER
            .iter()
            .filter(|(w, h, _)| *w <= max_width && *h <= max_height)
            .map(|&(width, height, fps)| Resolution {
                width,
                height,
                fps: fps.min(max_fps),
            })
            .collect();
        resolutions.dedup();

        // A camera smaller than every rung still advertises its own size
        if resolutions.is_empty() {
            resolutions.push(Resolution {
                width: max_width,
                height: max_height,
                fps: max_fps,
            });
        }

        Self {
            resolutions,
            max_width,
            max_height,
            max_fps,
            max_bitrate_kbps: caps.max_bitrate_kbps,
            profile: caps.h264_profile,
            level: caps.h264_level,
        }
    }

    /// Clamp a request to the ceilings. The lower of request and ceiling wins
    /// for every parameter; oversized frames are scaled down keeping the
    /// requested aspect ratio.
    pub fn negotiate(&self, request: &VideoRequest) -> EncoderSettings {
        let (mut width, mut height) = (request.width.max(2), request.height.max(2));

        if width > self.max_width || height > self.max_height {
            let scale = f64::min(
                self.max_width as f64 / width as f64,
                self.max_height as f64 / height as f64,
            );
            width = (width as f64 * scale).floor() as u32;
            height = (height as f64 * scale).floor() as u32;
        }

        EncoderSettings {
            width: (width & !1).max(2),
            height: (height & !1).max(2),
            fps: request.fps.clamp(1, self.max_fps),
            bitrate_kbps: request.max_bitrate_kbps.clamp(1, self.max_bitrate_kbps.max(1)),
            profile: request.profile.min(self.profile),
            level: request.level.min(self.level),
        }
    }
}

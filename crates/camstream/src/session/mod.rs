//! Session types: prepare/start requests and the active stream unit

pub mod registry;

pub use registry::{SessionRegistry, StartClaim};

use crate::backend::Backend;
use crate::camera::{EncoderSettings, H264Level, H264Profile};
use crate::relay::{AudioCodec, AudioOutput, OutputSpec, SrtpDestination, Transcoder, VideoOutput};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// SRTP master key length for AES_CM_128_HMAC_SHA1_80
pub const SRTP_KEY_LEN: usize = 16;

/// SRTP master salt length for AES_CM_128_HMAC_SHA1_80
pub const SRTP_SALT_LEN: usize = 14;

/// Video parameters requested by the controller at start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoRequest {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub max_bitrate_kbps: u32,
    pub profile: H264Profile,
    pub level: H264Level,
    /// RTP payload type the controller expects
    pub payload_type: u8,
    /// Packet size override; falls back to the engine MTU
    pub mtu: Option<u16>,
}

impl Default for VideoRequest {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30,
            max_bitrate_kbps: 2000,
            profile: H264Profile::High,
            level: H264Level::L4_0,
            payload_type: 99,
            mtu: None,
        }
    }
}

/// Audio parameters requested by the controller at start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioRequest {
    pub codec: AudioCodec,
    pub sample_rate_khz: u32,
    pub bitrate_kbps: u32,
    pub channels: u32,
    pub payload_type: u8,
}

impl Default for AudioRequest {
    fn default() -> Self {
        Self {
            codec: AudioCodec::Opus,
            sample_rate_khz: 24,
            bitrate_kbps: 24,
            channels: 1,
            payload_type: 110,
        }
    }
}

/// Parameters for `start`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamRequest {
    pub video: VideoRequest,
    /// `None` for video-only streams
    pub audio: Option<AudioRequest>,
}

/// Destination endpoint for one media kind, as requested at prepare time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaEndpoint {
    pub port: u16,
    pub srtp_key: Vec<u8>,
    pub srtp_salt: Vec<u8>,
}

impl MediaEndpoint {
    fn validate(&self, kind: &str) -> Result<()> {
        if self.port == 0 {
            return Err(Error::SessionError(format!("{} port must be non-zero", kind)));
        }
        if self.srtp_key.len() != SRTP_KEY_LEN {
            return Err(Error::SessionError(format!(
                "{} SRTP key must be {} bytes, got {}",
                kind,
                SRTP_KEY_LEN,
                self.srtp_key.len()
            )));
        }
        if self.srtp_salt.len() != SRTP_SALT_LEN {
            return Err(Error::SessionError(format!(
                "{} SRTP salt must be {} bytes, got {}",
                kind,
                SRTP_SALT_LEN,
                self.srtp_salt.len()
            )));
        }
        Ok(())
    }
}

/// Parameters for `prepare`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareRequest {
    /// Controller address the SRTP output is sent to
    pub target_address: IpAddr,
    pub video: MediaEndpoint,
    pub audio: Option<MediaEndpoint>,
}

impl PrepareRequest {
    pub fn validate(&self) -> Result<()> {
        self.video.validate("video")?;
        if let Some(audio) = &self.audio {
            audio.validate("audio")?;
        }
        Ok(())
    }
}

/// Reserved addressing for one media kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedEndpoint {
    pub port: u16,
    pub ssrc: u32,
    pub srtp_key: Vec<u8>,
    pub srtp_salt: Vec<u8>,
}

impl PreparedEndpoint {
    fn from_request(endpoint: &MediaEndpoint) -> Self {
        Self {
            port: endpoint.port,
            ssrc: random_ssrc(),
            srtp_key: endpoint.srtp_key.clone(),
            srtp_salt: endpoint.srtp_salt.clone(),
        }
    }
}

/// Reply to `prepare`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareResponse {
    /// Local address the stream originates from
    pub address: IpAddr,
    pub video: PreparedEndpoint,
    pub audio: Option<PreparedEndpoint>,
}

/// Everything fixed at prepare time. Consumed exactly once by `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSessionInfo {
    pub session_id: String,
    pub target_address: IpAddr,
    pub local_address: IpAddr,
    pub video: PreparedEndpoint,
    pub audio: Option<PreparedEndpoint>,
}

impl PendingSessionInfo {
    pub fn new(session_id: impl Into<String>, request: &PrepareRequest, local_address: IpAddr) -> Self {
        let video = PreparedEndpoint::from_request(&request.video);
        let mut audio = request.audio.as_ref().map(PreparedEndpoint::from_request);
        if let Some(audio) = audio.as_mut() {
            while audio.ssrc == video.ssrc {
                audio.ssrc = random_ssrc();
            }
        }

        Self {
            session_id: session_id.into(),
            target_address: request.target_address,
            local_address,
            video,
            audio,
        }
    }

    pub fn response(&self) -> PrepareResponse {
        PrepareResponse {
            address: self.local_address,
            video: self.video.clone(),
            audio: self.audio.clone(),
        }
    }

    /// Transcoder output wired to the prepared destinations.
    ///
    /// Audio is only included when both prepare and start asked for it.
    pub fn output_spec(&self, request: &StreamRequest, settings: EncoderSettings, mtu: u16) -> OutputSpec {
        let mtu = request.video.mtu.unwrap_or(mtu);
        let video = VideoOutput {
            destination: self.destination(&self.video, request.video.payload_type, mtu),
            settings,
        };
        let audio = match (&self.audio, &request.audio) {
            (Some(endpoint), Some(audio)) => Some(AudioOutput {
                destination: self.destination(endpoint, audio.payload_type, mtu),
                codec: audio.codec,
                sample_rate_khz: audio.sample_rate_khz,
                bitrate_kbps: audio.bitrate_kbps,
                channels: audio.channels,
            }),
            _ => None,
        };
        OutputSpec::Srtp { video, audio }
    }

    fn destination(&self, endpoint: &PreparedEndpoint, payload_type: u8, mtu: u16) -> SrtpDestination {
        SrtpDestination {
            address: self.target_address,
            port: endpoint.port,
            ssrc: endpoint.ssrc,
            payload_type,
            srtp_key: endpoint.srtp_key.clone(),
            srtp_salt: endpoint.srtp_salt.clone(),
            mtu,
        }
    }
}

fn random_ssrc() -> u32 {
    loop {
        let ssrc = rand::random::<u32>();
        if ssrc != 0 {
            return ssrc;
        }
    }
}

/// An active session: backend connection and transcoder, created and
/// destroyed together
pub struct StreamSession {
    info: PendingSessionInfo,
    backend: Box<dyn Backend>,
    transcoder: Arc<Transcoder>,
    started_at: Instant,
    torn_down: AtomicBool,
}

impl StreamSession {
    pub fn new(info: PendingSessionInfo, backend: Box<dyn Backend>, transcoder: Arc<Transcoder>) -> Self {
        Self {
            info,
            backend,
            transcoder,
            started_at: Instant::now(),
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.info.session_id
    }

    pub fn info(&self) -> &PendingSessionInfo {
        &self.info
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn transcoder(&self) -> &Arc<Transcoder> {
        &self.transcoder
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Stop the transcoder, then release the backend. Idempotent; every step
    /// runs regardless of the others.
    pub async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            debug!("Session {} already torn down", self.info.session_id);
            return;
        }

        self.transcoder.stop().await;
        self.backend.teardown().await;

        let counters = self.transcoder.counters();
        info!(
            "Session {} ({}) torn down after {:?} (forwarded={}, dropped={})",
            self.info.session_id,
            self.backend.kind(),
            self.uptime(),
            counters.forwarded.load(Ordering::Relaxed),
            counters.dropped.load(Ordering::Relaxed)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn endpoint(port: u16) -> MediaEndpoint {
        MediaEndpoint {
            port,
            srtp_key: vec![1; SRTP_KEY_LEN],
            srtp_salt: vec![2; SRTP_SALT_LEN],
        }
    }

    fn prepare_request(with_audio: bool) -> PrepareRequest {
        PrepareRequest {
            target_address: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)),
            video: endpoint(5000),
            audio: with_audio.then(|| endpoint(5002)),
        }
    }

    fn settings() -> EncoderSettings {
        EncoderSettings {
            width: 1280,
            height: 720,
            fps: 30,
            bitrate_kbps: 1000,
            profile: H264Profile::Main,
            level: H264Level::L3_1,
        }
    }

    #[test]
    fn test_validate_key_lengths() {
        assert!(prepare_request(true).validate().is_ok());

        let mut request = prepare_request(false);
        request.video.srtp_key.pop();
        assert!(matches!(request.validate(), Err(Error::SessionError(_))));

        let mut request = prepare_request(true);
        if let Some(audio) = request.audio.as_mut() {
            audio.srtp_salt.push(0);
        }
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_prepare_echoes_keys_with_distinct_ssrcs() {
        let local = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 5));
        let info = PendingSessionInfo::new("abc", &prepare_request(true), local);
        let response = info.response();

        assert_eq!(response.address, local);
        assert_eq!(response.video.port, 5000);
        assert_eq!(response.video.srtp_key, vec![1; SRTP_KEY_LEN]);
        let audio = response.audio.unwrap();
        assert_eq!(audio.port, 5002);
        assert_ne!(audio.ssrc, response.video.ssrc);
        assert_ne!(response.video.ssrc, 0);
    }

    #[test]
    fn test_output_spec_uses_prepared_parameters() {
        let local = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let info = PendingSessionInfo::new("abc", &prepare_request(true), local);
        let request = StreamRequest {
            video: VideoRequest {
                mtu: Some(1200),
                ..Default::default()
            },
            audio: Some(AudioRequest::default()),
        };

        let OutputSpec::Srtp { video, audio } = info.output_spec(&request, settings(), 1316) else {
            panic!("expected SRTP output");
        };
        assert_eq!(video.destination.address, info.target_address);
        assert_eq!(video.destination.ssrc, info.video.ssrc);
        assert_eq!(video.destination.payload_type, 99);
        assert_eq!(video.destination.mtu, 1200);
        assert_eq!(video.settings, settings());

        let audio = audio.unwrap();
        assert_eq!(audio.destination.port, 5002);
        assert_eq!(audio.destination.payload_type, 110);
        assert_eq!(audio.codec, AudioCodec::Opus);
    }

    #[test]
    fn test_audio_dropped_unless_prepared_and_requested() {
        let local = IpAddr::V4(Ipv4Addr::LOCALHOST);

        let video_only = PendingSessionInfo::new("a", &prepare_request(false), local);
        let request = StreamRequest {
            audio: Some(AudioRequest::default()),
            ..Default::default()
        };
        let OutputSpec::Srtp { audio, .. } = video_only.output_spec(&request, settings(), 1316) else {
            panic!("expected SRTP output");
        };
        assert!(audio.is_none());

        let with_audio = PendingSessionInfo::new("b", &prepare_request(true), local);
        let OutputSpec::Srtp { audio, video } =
            with_audio.output_spec(&StreamRequest::default(), settings(), 1316)
        else {
            panic!("expected SRTP output");
        };
        assert!(audio.is_none());
        assert_eq!(video.destination.mtu, 1316);
    }
}

//! Integration test harness
//!
//! Provides:
//! - Fake credential source and backends with teardown accounting
//! - Shell-script stand-ins for the transcoder binary
//! - An engine wired to both

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use camstream::media::{DirectSource, FrameSource, RtpSource};
use camstream::{
    Backend, BackendFactory, BackendKind, CameraDescriptor, CredentialSource, EngineConfig, Error,
    LiveViewCredentials, MediaEndpoint, MediaKind, MediaPacket, MediaSource, PixelFormat,
    PrepareRequest, Result, StreamingEngine, VideoFrame,
};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const SRTP_KEY: [u8; 16] = [
    0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f,
];
pub const SRTP_SALT: [u8; 14] = [
    0xa0, 0xa1, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6, 0xa7, 0xa8, 0xa9, 0xaa, 0xab, 0xac, 0xad,
];

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Write an executable `/bin/sh` script standing in for ffmpeg
#[cfg(unix)]
pub fn write_transcoder(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write script");
    let mut perms = std::fs::metadata(&path).expect("script metadata").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod script");
    path
}

/// Script that records its arguments, reports on stderr, then runs until signalled
pub fn recording_transcoder_body(args_file: &Path) -> String {
    format!(
        "printf '%s\\n' \"$@\" > '{}'\n\
         echo 'ffmpeg version test' >&2\n\
         trap 'exit 255' TERM INT\n\
         while :; do sleep 0.05; done",
        args_file.display()
    )
}

/// Media the fake backend hands out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeMedia {
    Url,
    /// Video-only RTP with this many packets queued
    Rtp(usize),
    /// I420 frames of 4x2 with this many frames queued
    Frames(usize),
}

#[derive(Default)]
pub struct Counters {
    pub created: AtomicUsize,
    pub established: AtomicUsize,
    pub torn_down: AtomicUsize,
    pub credential_fetches: AtomicUsize,
}

impl Counters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

pub struct FakeCredentials {
    pub counters: Arc<Counters>,
    pub fail: bool,
}

#[async_trait]
impl CredentialSource for FakeCredentials {
    async fn fetch(&self, _camera: &CameraDescriptor) -> Result<LiveViewCredentials> {
        self.counters.credential_fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(Error::CredentialFetch("HTTP 403 Forbidden: denied".to_string()));
        }
        Ok(LiveViewCredentials {
            endpoint: "wss://signal.example.com".to_string(),
            client_id: "c1".to_string(),
            ice_servers: vec![],
            room_token: None,
        })
    }
}

pub struct FakeBackend {
    counters: Arc<Counters>,
    media: FakeMedia,
    establish_delay: Duration,
}

#[async_trait]
impl Backend for FakeBackend {
    fn kind(&self) -> BackendKind {
        match self.media {
            FakeMedia::Url => BackendKind::Direct,
            FakeMedia::Rtp(_) => BackendKind::Signaling,
            FakeMedia::Frames(_) => BackendKind::Room,
        }
    }

    async fn establish(&self, deadline: Duration) -> Result<MediaSource> {
        if self.establish_delay >= deadline {
            tokio::time::sleep(deadline).await;
            return Err(Error::NegotiationTimeout(deadline));
        }
        tokio::time::sleep(self.establish_delay).await;
        self.counters.established.fetch_add(1, Ordering::SeqCst);

        Ok(match self.media {
            FakeMedia::Url => MediaSource::Url(DirectSource {
                url: "https://media.example.com/live.flv".to_string(),
                authorization: Some("Bearer t".to_string()),
            }),
            FakeMedia::Rtp(count) => {
                let (tx, rx) = mpsc::channel(count.max(1));
                for sequence in 0..count {
                    let _ = tx.try_send(MediaPacket {
                        kind: MediaKind::Video,
                        payload_type: 96,
                        sequence: sequence as u16,
                        timestamp: sequence as u32 * 3000,
                        marker: true,
                        payload: Bytes::from_static(&[0x65, 0x88, 0x84]),
                    });
                }
                // Keep the sender alive so the source stays open
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    drop(tx);
                });
                MediaSource::Rtp(RtpSource {
                    video: rx,
                    audio: None,
                    video_payload_type: 96,
                    audio_payload_type: 111,
                })
            }
            FakeMedia::Frames(count) => {
                let (tx, rx) = mpsc::channel(count.max(1));
                for _ in 0..count {
                    let _ = tx.try_send(frame());
                }
                drop(tx);
                MediaSource::Frames(FrameSource { frames: rx })
            }
        })
    }

    async fn teardown(&self) {
        self.counters.torn_down.fetch_add(1, Ordering::SeqCst);
    }
}

/// 4x2 I420 frame
pub fn frame() -> VideoFrame {
    VideoFrame {
        format: PixelFormat::I420,
        width: 4,
        height: 2,
        planes: vec![
            Bytes::from_static(&[16; 8]),
            Bytes::from_static(&[128; 2]),
            Bytes::from_static(&[128; 2]),
        ],
    }
}

pub struct FakeFactory {
    pub counters: Arc<Counters>,
    pub media: FakeMedia,
    pub establish_delay: Duration,
}

#[async_trait]
impl BackendFactory for FakeFactory {
    async fn create(
        &self,
        _session_id: &str,
        _camera: &CameraDescriptor,
        _credentials: Option<LiveViewCredentials>,
        _width: u32,
    ) -> Result<Box<dyn Backend>> {
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeBackend {
            counters: Arc::clone(&self.counters),
            media: self.media,
            establish_delay: self.establish_delay,
        }))
    }
}

pub fn test_config(transcoder: &Path) -> EngineConfig {
    let mut config = EngineConfig {
        local_address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        snapshot_ttl_secs: 60,
        ..Default::default()
    };
    config.transcoder.path = transcoder.to_path_buf();
    config.transcoder.stop_grace_ms = 1000;
    config.transcoder.input_close_grace_ms = 200;
    config.timeouts.establish_secs = 3;
    config.timeouts.first_output_secs = 3;
    config.timeouts.snapshot_secs = 2;
    config
}

pub struct EngineFixture {
    pub engine: StreamingEngine,
    pub counters: Arc<Counters>,
}

pub fn engine_with(config: EngineConfig, media: FakeMedia, establish_delay: Duration) -> EngineFixture {
    let counters = Arc::new(Counters::default());
    let engine = StreamingEngine::with_parts(
        CameraDescriptor::new("CAM1", "LOC1", "kvs").with_name("Front Door"),
        config,
        Arc::new(FakeCredentials {
            counters: Arc::clone(&counters),
            fail: false,
        }),
        Arc::new(FakeFactory {
            counters: Arc::clone(&counters),
            media,
            establish_delay,
        }),
    )
    .expect("engine");
    EngineFixture { engine, counters }
}

pub fn prepare_request(video_port: u16) -> PrepareRequest {
    PrepareRequest {
        target_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        video: MediaEndpoint {
            port: video_port,
            srtp_key: SRTP_KEY.to_vec(),
            srtp_salt: SRTP_SALT.to_vec(),
        },
        audio: None,
    }
}

/// Poll `condition` every 20ms until it holds or `within` passes
pub async fn eventually(within: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

//! Camera streaming session engine
//!
//! Bridges cloud camera feeds into an SRTP destination chosen by a
//! smart-home controller. A session is prepared (addressing and keys
//! reserved), started (credentials fetched, a backend connection
//! established, an FFmpeg transcoder spawned) and eventually stopped,
//! tearing the backend connection and the transcoder down together.
//!
//! # Features
//!
//! - **Signaling backend**: KVS-style WebSocket signaling with trickle ICE,
//!   receive-only H.264/Opus transceivers and an auxiliary data channel
//! - **Managed room backend**: SDK room yielding decoded frames (`livekit` feature)
//! - **Direct backend**: the transcoder pulls an authenticated stream URL
//! - **Relay**: FFmpeg subprocess emitting SRTP (AES_CM_128_HMAC_SHA1_80)
//! - **Snapshots**: TTL-cached single-frame capture that never fails outward
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │  Controller (prepare / start / stop / snapshot)        │
//! │  ↓                                                      │
//! │  StreamingEngine                                       │
//! │  ├─ SessionRegistry (pending / starting / ongoing)     │
//! │  ├─ CredentialResolver (live-view REST endpoint)       │
//! │  ├─ Backend strategy                                   │
//! │  │   ├─ SignalingSession (WebSocket + WebRTC peer)     │
//! │  │   ├─ ManagedRoomSession (room SDK, decoded frames)  │
//! │  │   └─ DirectBackend (stream URL)                     │
//! │  ├─ Transcoder (FFmpeg → SRTP/UDP)                     │
//! │  └─ SnapshotCapturer (TTL cache + placeholder)         │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use camstream::EngineConfig;
//!
//! let config = EngineConfig {
//!     api_base_url: "https://api.example.com".to_string(),
//!     snapshot_ttl_secs: 30,
//!     ..Default::default()
//! };
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.mtu, 1316);
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use camstream::{CameraDescriptor, EngineConfig, StaticToken, StreamingEngine};
//! use std::sync::Arc;
//!
//! # async fn example() -> camstream::Result<()> {
//! let camera = CameraDescriptor::new("SERIAL123", "loc-1", "kvs");
//! let engine = StreamingEngine::new(
//!     camera,
//!     EngineConfig::default(),
//!     Arc::new(StaticToken::new("token")),
//! )?;
//!
//! let jpeg = engine.snapshot(640, 360).await;
//! assert!(!jpeg.is_empty());
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod backend;
pub mod camera;
pub mod config;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod media;
pub mod relay;
pub mod room;
pub mod session;
pub mod signaling;
pub mod snapshot;

pub use backend::{Backend, BackendFactory, BackendKind, DefaultBackendFactory, DirectBackend};
pub use camera::{
    CameraCapabilities, CameraDescriptor, CameraEndpointConfig, EncoderSettings, H264Level,
    H264Profile, Provider,
};
pub use config::{EngineConfig, TimeoutConfig, TranscoderConfig};
pub use credentials::{
    CredentialResolver, CredentialSource, IceServer, LiveViewCredentials, StaticToken,
    TokenProvider,
};
pub use engine::StreamingEngine;
pub use error::{Error, Result};
pub use media::{MediaKind, MediaPacket, MediaSource, PixelFormat, VideoFrame};
pub use relay::{classify_exit, ExitDisposition, ReadySignal, Transcoder, TranscoderSpec};
pub use room::{ManagedRoomSession, RoomConnector, RoomEvent, RoomHandle, RoomState};
pub use session::{
    AudioRequest, MediaEndpoint, PendingSessionInfo, PrepareRequest, PrepareResponse,
    PreparedEndpoint, SessionRegistry, StartClaim, StreamRequest, StreamSession, VideoRequest,
};
pub use signaling::{SignalingSession, SignalingState};
pub use snapshot::SnapshotCapturer;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

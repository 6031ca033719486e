//! Backend strategies behind one contract
//!
//! A backend is chosen once per camera from its reported provider:
//! signaling + WebRTC peer, managed room, or the direct-URL fallback.

use crate::camera::{CameraDescriptor, Provider};
use crate::config::EngineConfig;
use crate::credentials::{CredentialSource, LiveViewCredentials, TokenProvider};
use crate::media::{DirectSource, MediaSource};
use crate::room::{ManagedRoomSession, RoomConnector};
use crate::signaling::SignalingSession;
use crate::{Error, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Which strategy a backend implements
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Signaling,
    Room,
    Direct,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Signaling => write!(f, "signaling"),
            BackendKind::Room => write!(f, "room"),
            BackendKind::Direct => write!(f, "direct"),
        }
    }
}

/// Backend connection for one session
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Connect and return the media source.
    ///
    /// # Errors
    ///
    /// [`Error::NegotiationTimeout`] once `deadline` passes; on any error the
    /// backend has already released what it opened.
    async fn establish(&self, deadline: Duration) -> Result<MediaSource>;

    /// Release everything. Idempotent, never fails.
    async fn teardown(&self);
}

#[async_trait]
impl Backend for SignalingSession {
    fn kind(&self) -> BackendKind {
        BackendKind::Signaling
    }

    async fn establish(&self, deadline: Duration) -> Result<MediaSource> {
        SignalingSession::establish(self, deadline).await
    }

    async fn teardown(&self) {
        SignalingSession::teardown(self).await
    }
}

#[async_trait]
impl Backend for ManagedRoomSession {
    fn kind(&self) -> BackendKind {
        BackendKind::Room
    }

    async fn establish(&self, deadline: Duration) -> Result<MediaSource> {
        ManagedRoomSession::establish(self, deadline).await
    }

    async fn teardown(&self) {
        ManagedRoomSession::teardown(self).await
    }
}

/// Fallback strategy: the transcoder reads the stream URL itself
pub struct DirectBackend {
    url: String,
    authorization: Option<String>,
    torn_down: AtomicBool,
}

impl DirectBackend {
    pub fn new(url: impl Into<String>, authorization: Option<String>) -> Self {
        Self {
            url: url.into(),
            authorization,
            torn_down: AtomicBool::new(false),
        }
    }

    /// Fill `{camera}` and `{width}` in a URL template
    pub fn render_url(template: &str, camera: &CameraDescriptor, width: u32) -> String {
        template
            .replace("{camera}", &camera.serial)
            .replace("{location}", &camera.location_id)
            .replace("{width}", &width.to_string())
    }
}

#[async_trait]
impl Backend for DirectBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Direct
    }

    async fn establish(&self, _deadline: Duration) -> Result<MediaSource> {
        if self.torn_down.load(Ordering::SeqCst) {
            return Err(Error::SessionStopped("direct backend torn down".to_string()));
        }
        Ok(MediaSource::Url(DirectSource {
            url: self.url.clone(),
            authorization: self.authorization.clone(),
        }))
    }

    async fn teardown(&self) {
        if !self.torn_down.swap(true, Ordering::SeqCst) {
            debug!("Direct backend released");
        }
    }
}

/// Creates the backend for a camera
#[async_trait]
pub trait BackendFactory: Send + Sync {
    /// `credentials` is `Some` whenever the camera's provider needs them.
    async fn create(
        &self,
        session_id: &str,
        camera: &CameraDescriptor,
        credentials: Option<LiveViewCredentials>,
        width: u32,
    ) -> Result<Box<dyn Backend>>;
}

/// Maps [`Provider`] to the built-in strategies
pub struct DefaultBackendFactory {
    packet_queue_depth: usize,
    direct_stream_url: String,
    tokens: Arc<dyn TokenProvider>,
    room_connector: Option<Arc<dyn RoomConnector>>,
}

impl DefaultBackendFactory {
    pub fn new(config: &EngineConfig, tokens: Arc<dyn TokenProvider>) -> Self {
        #[cfg(feature = "livekit")]
        let room_connector: Option<Arc<dyn RoomConnector>> = Some(Arc::new(
            crate::room::livekit::LiveKitConnector::new(config.frame_queue_depth),
        ));
        #[cfg(not(feature = "livekit"))]
        let room_connector: Option<Arc<dyn RoomConnector>> = None;

        Self {
            packet_queue_depth: config.packet_queue_depth,
            direct_stream_url: config.direct_stream_url.clone(),
            tokens,
            room_connector,
        }
    }

    /// Install (or replace) the room SDK connector
    pub fn with_room_connector(mut self, connector: Arc<dyn RoomConnector>) -> Self {
        self.room_connector = Some(connector);
        self
    }
}

#[async_trait]
impl BackendFactory for DefaultBackendFactory {
    async fn create(
        &self,
        session_id: &str,
        camera: &CameraDescriptor,
        credentials: Option<LiveViewCredentials>,
        width: u32,
    ) -> Result<Box<dyn Backend>> {
        match camera.provider {
            Provider::Kvs => {
                let credentials = credentials.ok_or_else(|| {
                    Error::CredentialFetch("signaling backend needs live-view credentials".to_string())
                })?;
                Ok(Box::new(SignalingSession::new(
                    session_id,
                    credentials,
                    self.packet_queue_depth,
                )))
            }
            Provider::LiveKit => {
                let connector = self.room_connector.clone().ok_or_else(|| {
                    Error::UnsupportedProvider(format!(
                        "{} (no room connector installed)",
                        camera.provider
                    ))
                })?;
                let credentials = credentials.ok_or_else(|| {
                    Error::CredentialFetch("room backend needs live-view credentials".to_string())
                })?;
                let token = credentials.room_token.clone().ok_or_else(|| {
                    Error::CredentialFetch("live-view response has no room token".to_string())
                })?;
                Ok(Box::new(ManagedRoomSession::new(
                    session_id,
                    credentials.endpoint,
                    token,
                    connector,
                )))
            }
            Provider::Direct => {
                let token = self.tokens.access_token().await?;
                Ok(Box::new(DirectBackend::new(
                    DirectBackend::render_url(&self.direct_stream_url, camera, width),
                    Some(format!("Bearer {}", token)),
                )))
            }
        }
    }
}

/// Fetch credentials when the provider needs them, then create the backend
pub async fn open_backend(
    factory: &dyn BackendFactory,
    credentials: &dyn CredentialSource,
    camera: &CameraDescriptor,
    session_id: &str,
    width: u32,
) -> Result<Box<dyn Backend>> {
    let live_view = if camera.provider.needs_credentials() {
        Some(credentials.fetch(camera).await?)
    } else {
        None
    };
    let backend = factory.create(session_id, camera, live_view, width).await?;
    debug!(
        "Session {} using {} backend for {}",
        session_id,
        backend.kind(),
        camera.name
    );
    Ok(backend)
}

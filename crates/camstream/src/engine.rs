//! Streaming engine: the controller-facing surface for one camera

use crate::backend::{open_backend, BackendFactory, DefaultBackendFactory};
use crate::camera::{CameraDescriptor, CameraEndpointConfig};
use crate::config::EngineConfig;
use crate::credentials::{CredentialResolver, CredentialSource, TokenProvider};
use crate::relay::{ExitDisposition, Transcoder};
use crate::session::{
    PendingSessionInfo, PrepareRequest, PrepareResponse, SessionRegistry, StreamRequest,
    StreamSession, VideoRequest,
};
use crate::snapshot::SnapshotCapturer;
use crate::{Error, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Weak};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

struct EngineInner {
    camera: CameraDescriptor,
    config: EngineConfig,
    endpoint: CameraEndpointConfig,
    credentials: Arc<dyn CredentialSource>,
    backends: Arc<dyn BackendFactory>,
    registry: SessionRegistry,
    snapshots: SnapshotCapturer,
}

/// Streaming sessions and snapshots for one camera
///
/// Cheap to clone; clones share the same sessions.
#[derive(Clone)]
pub struct StreamingEngine {
    inner: Arc<EngineInner>,
}

impl StreamingEngine {
    /// Engine with the REST credential resolver and the built-in backends
    pub fn new(
        camera: CameraDescriptor,
        config: EngineConfig,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self> {
        config.validate()?;
        let credentials = Arc::new(CredentialResolver::new(
            config.api_base_url.clone(),
            Arc::clone(&tokens),
            config.timeouts.http(),
        )?);
        let backends = Arc::new(DefaultBackendFactory::new(&config, tokens));
        Self::with_parts(camera, config, credentials, backends)
    }

    /// Engine with caller-supplied credential source and backend factory
    pub fn with_parts(
        camera: CameraDescriptor,
        config: EngineConfig,
        credentials: Arc<dyn CredentialSource>,
        backends: Arc<dyn BackendFactory>,
    ) -> Result<Self> {
        config.validate()?;
        let endpoint = CameraEndpointConfig::from_capabilities(&camera.capabilities);
        let snapshots = SnapshotCapturer::new(
            camera.clone(),
            config.clone(),
            Arc::clone(&credentials),
            Arc::clone(&backends),
        );

        info!(
            "Streaming engine for {} ({}, provider {})",
            camera.name, camera.serial, camera.provider
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                camera,
                config,
                endpoint,
                credentials,
                backends,
                registry: SessionRegistry::new(),
                snapshots,
            }),
        })
    }

    pub fn camera(&self) -> &CameraDescriptor {
        &self.inner.camera
    }

    pub fn endpoint(&self) -> &CameraEndpointConfig {
        &self.inner.endpoint
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn snapshots(&self) -> &SnapshotCapturer {
        &self.inner.snapshots
    }

    /// Reserve addressing and keys for a session
    ///
    /// # Example
    ///
    /// ```
    /// use camstream::{
    ///     CameraDescriptor, EngineConfig, MediaEndpoint, PrepareRequest, StaticToken,
    ///     StreamingEngine,
    /// };
    /// use std::net::{IpAddr, Ipv4Addr};
    /// use std::sync::Arc;
    ///
    /// # tokio_test::block_on(async {
    /// let engine = StreamingEngine::new(
    ///     CameraDescriptor::new("SERIAL123", "loc-1", "kvs"),
    ///     EngineConfig::default(),
    ///     Arc::new(StaticToken::new("token")),
    /// )?;
    ///
    /// let prepared = engine
    ///     .prepare(
    ///         "abc",
    ///         PrepareRequest {
    ///             target_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
    ///             video: MediaEndpoint {
    ///                 port: 5000,
    ///                 srtp_key: vec![7; 16],
    ///                 srtp_salt: vec![9; 14],
    ///             },
    ///             audio: None,
    ///         },
    ///     )
    ///     .await?;
    /// assert_eq!(prepared.video.port, 5000);
    /// assert!(engine.registry().is_pending("abc"));
    ///
    /// engine.stop("abc").await;
    /// assert!(!engine.registry().is_pending("abc"));
    /// # Ok::<(), camstream::Error>(())
    /// # }).unwrap();
    /// ```
    ///
    /// # Errors
    ///
    /// - [`Error::SessionError`] for malformed keys or an id that is already active
    /// - [`Error::IoError`] if no local route to the target exists
    #[instrument(skip(self, request), fields(camera = %self.inner.camera.serial))]
    pub async fn prepare(&self, session_id: &str, request: PrepareRequest) -> Result<PrepareResponse> {
        request.validate()?;
        let local_address = match self.inner.config.local_address {
            Some(address) => address,
            None => local_address_for(request.target_address).await?,
        };

        let info = PendingSessionInfo::new(session_id, &request, local_address);
        let response = info.response();
        self.inner.registry.prepare(info)?;

        info!(
            "Prepared session {}: {} -> {}:{} (ssrc {})",
            session_id,
            local_address,
            request.target_address,
            response.video.port,
            response.video.ssrc
        );
        Ok(response)
    }

    /// Start a prepared session.
    ///
    /// Returns once the transcoder has produced its first output. The
    /// prepared entry is consumed whatever the outcome.
    ///
    /// # Errors
    ///
    /// - [`Error::SessionNotFound`] if not prepared, or another start claimed it
    /// - [`Error::SessionStopped`] if `stop` was called meanwhile
    /// - any credential, backend or transcoder error raised before first output
    #[instrument(skip(self, request), fields(camera = %self.inner.camera.serial))]
    pub async fn start(&self, session_id: &str, request: StreamRequest) -> Result<()> {
        let (info, claim) = self.inner.registry.begin_start(session_id)?;

        let session = match self.build_session(info, &request, claim.token()).await {
            Ok(session) => session,
            Err(e) => {
                self.inner.registry.abandon(session_id, &claim);
                warn!("Session {} failed to start: {}", session_id, e);
                return Err(e);
            }
        };

        if let Err(session) = self
            .inner
            .registry
            .activate(session_id, &claim, Arc::clone(&session))
        {
            session.teardown().await;
            return Err(Error::SessionStopped(session_id.to_string()));
        }

        self.spawn_monitor(session);
        info!("Session {} started", session_id);
        Ok(())
    }

    /// Credentials, backend, transcoder, first output. Anything created is
    /// torn down before an error is returned.
    async fn build_session(
        &self,
        info: PendingSessionInfo,
        request: &StreamRequest,
        cancel: &CancellationToken,
    ) -> Result<Arc<StreamSession>> {
        let inner = &self.inner;
        let session_id = info.session_id.clone();
        let stopped = || Error::SessionStopped(session_id.clone());

        let settings = inner.endpoint.negotiate(&request.video);
        debug!("Session {} encoder settings: {:?}", session_id, settings);

        let backend = tokio::select! {
            _ = cancel.cancelled() => return Err(stopped()),
            backend = open_backend(
                inner.backends.as_ref(),
                inner.credentials.as_ref(),
                &inner.camera,
                &session_id,
                settings.width,
            ) => backend?,
        };

        let established = tokio::select! {
            _ = cancel.cancelled() => Err(stopped()),
            source = backend.establish(inner.config.timeouts.establish()) => source,
        };
        let source = match established {
            Ok(source) => source,
            Err(e) => {
                backend.teardown().await;
                return Err(e);
            }
        };
        debug!("Session {} media source: {}", session_id, source.describe());

        let output = info.output_spec(request, settings, inner.config.mtu);
        let transcoder = match Transcoder::spawn(
            &session_id,
            source,
            output,
            &inner.config.transcoder,
            inner.config.timeouts.first_output(),
        )
        .await
        {
            Ok(transcoder) => Arc::new(transcoder),
            Err(e) => {
                backend.teardown().await;
                return Err(e);
            }
        };

        let session = Arc::new(StreamSession::new(info, backend, transcoder));

        let ready = tokio::select! {
            _ = cancel.cancelled() => Err(stopped()),
            ready = session.transcoder().wait_ready(inner.config.timeouts.first_output()) => ready,
        };
        if let Err(e) = ready {
            session.teardown().await;
            return Err(e);
        }

        Ok(session)
    }

    /// Force-stop the session if its transcoder exits on its own
    fn spawn_monitor(&self, session: Arc<StreamSession>) {
        let engine: Weak<EngineInner> = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            let exit = session.transcoder().wait_exit().await;
            if session.transcoder().is_stopping() {
                return;
            }

            let session_id = session.session_id().to_string();
            if exit.disposition == ExitDisposition::ForceStop {
                let reason = Error::TranscoderExit(exit.describe());
                error!("Session {} force-stopped: {}", session_id, reason);
            }

            let removed = engine.upgrade().and_then(|inner| {
                inner
                    .registry
                    .remove_if(&session_id, |current| Arc::ptr_eq(current, &session))
            });
            if let Some(session) = removed {
                session.teardown().await;
            }
        });
    }

    /// Apply new parameters to an active session.
    ///
    /// Prepared destinations are never renegotiated and the running
    /// transcoder is kept; the request is logged.
    pub async fn reconfigure(&self, session_id: &str, request: &VideoRequest) -> Result<()> {
        let session = self
            .inner
            .registry
            .get(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;

        let settings = self.inner.endpoint.negotiate(request);
        info!(
            "Session {} reconfigure requested: {}x{}@{} {}kbps (keeping running transcoder, up {:?})",
            session_id,
            settings.width,
            settings.height,
            settings.fps,
            settings.bitrate_kbps,
            session.uptime()
        );
        Ok(())
    }

    /// Stop a session in any state. Unknown ids are ignored.
    #[instrument(skip(self), fields(camera = %self.inner.camera.serial))]
    pub async fn stop(&self, session_id: &str) {
        match self.inner.registry.stop(session_id) {
            Some(session) => {
                info!("Stopping session {}", session_id);
                session.teardown().await;
            }
            None => debug!("Stop for inactive session {}", session_id),
        }
    }

    /// Stop every session
    pub async fn stop_all(&self) {
        let sessions = self.inner.registry.drain();
        if sessions.is_empty() {
            return;
        }
        info!("Stopping {} session(s)", sessions.len());
        futures::future::join_all(sessions.iter().map(|session| session.teardown())).await;
    }

    /// JPEG of the camera, served from cache or a short-lived session.
    /// Never fails; the placeholder stands in for errors.
    pub async fn snapshot(&self, width: u32, height: u32) -> Vec<u8> {
        self.inner.snapshots.capture(width, height).await
    }

    /// Ids of active sessions
    pub fn active_sessions(&self) -> Vec<String> {
        self.inner.registry.active_ids()
    }

    /// Active session by id
    pub fn session(&self, session_id: &str) -> Option<Arc<StreamSession>> {
        self.inner.registry.get(session_id)
    }
}

/// Local address the OS would use to reach `target`
async fn local_address_for(target: IpAddr) -> Result<IpAddr> {
    let bind: SocketAddr = match target {
        IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(bind).await?;
    // No packet is sent; connect only selects the route
    socket.connect((target, 9)).await?;
    Ok(socket.local_addr()?.ip())
}

//! Best-effort snapshots
//!
//! A cache miss opens a short-lived session (credentials, backend, a
//! one-frame transcoder), bounded by its own deadline. Failures never reach
//! the caller: they get the placeholder image instead.

use crate::backend::{open_backend, Backend, BackendFactory};
use crate::camera::CameraDescriptor;
use crate::config::EngineConfig;
use crate::credentials::CredentialSource;
use crate::relay::{OutputSpec, Transcoder};
use crate::{Error, Result};
use image::{ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

const PLACEHOLDER_WIDTH: u32 = 640;
const PLACEHOLDER_HEIGHT: u32 = 360;

struct SnapshotCacheEntry {
    image: Arc<Vec<u8>>,
    taken_at: Instant,
}

/// TTL-cached single-frame capture for one camera
pub struct SnapshotCapturer {
    camera: CameraDescriptor,
    config: EngineConfig,
    credentials: Arc<dyn CredentialSource>,
    backends: Arc<dyn BackendFactory>,
    cache: parking_lot::Mutex<Option<SnapshotCacheEntry>>,
    /// Serializes misses so concurrent callers share one capture
    inflight: tokio::sync::Mutex<()>,
    sessions_opened: AtomicU64,
}

impl SnapshotCapturer {
    pub fn new(
        camera: CameraDescriptor,
        config: EngineConfig,
        credentials: Arc<dyn CredentialSource>,
        backends: Arc<dyn BackendFactory>,
    ) -> Self {
        Self {
            camera,
            config,
            credentials,
            backends,
            cache: parking_lot::Mutex::new(None),
            inflight: tokio::sync::Mutex::new(()),
            sessions_opened: AtomicU64::new(0),
        }
    }

    /// Ephemeral sessions opened so far
    pub fn sessions_opened(&self) -> u64 {
        self.sessions_opened.load(Ordering::Relaxed)
    }

    /// Forget the cached image
    pub fn invalidate(&self) {
        *self.cache.lock() = None;
    }

    fn cached(&self) -> Option<Arc<Vec<u8>>> {
        let cache = self.cache.lock();
        cache
            .as_ref()
            .filter(|entry| entry.taken_at.elapsed() < self.config.snapshot_ttl())
            .map(|entry| Arc::clone(&entry.image))
    }

    /// Return a JPEG for the camera. Never fails.
    pub async fn capture(&self, width: u32, height: u32) -> Vec<u8> {
        if let Some(image) = self.cached() {
            debug!("Snapshot cache hit for {}", self.camera.name);
            return image.as_ref().clone();
        }

        let _inflight = self.inflight.lock().await;
        if let Some(image) = self.cached() {
            debug!("Snapshot for {} served by concurrent capture", self.camera.name);
            return image.as_ref().clone();
        }

        match self.capture_fresh(width, height).await {
            Ok(image) => {
                let image = Arc::new(image);
                *self.cache.lock() = Some(SnapshotCacheEntry {
                    image: Arc::clone(&image),
                    taken_at: Instant::now(),
                });
                image.as_ref().clone()
            }
            Err(e) => {
                warn!("Snapshot for {} failed, using placeholder: {}", self.camera.name, e);
                placeholder().to_vec()
            }
        }
    }

    /// One ephemeral session, torn down whatever happens
    async fn capture_fresh(&self, width: u32, height: u32) -> Result<Vec<u8>> {
        let session_id = format!("snapshot-{}", Uuid::new_v4());
        let deadline = self.config.timeouts.snapshot();
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);

        let mut backend: Option<Box<dyn Backend>> = None;
        let mut transcoder: Option<Transcoder> = None;

        let started = Instant::now();
        let result = tokio::time::timeout(
            deadline,
            self.capture_once(&session_id, width, height, &mut backend, &mut transcoder),
        )
        .await
        .unwrap_or(Err(Error::NegotiationTimeout(deadline)));

        if let Some(transcoder) = transcoder.take() {
            transcoder.stop().await;
        }
        if let Some(backend) = backend.take() {
            backend.teardown().await;
        }

        if result.is_ok() {
            info!(
                "Snapshot {} for {} captured in {:?}",
                session_id,
                self.camera.name,
                started.elapsed()
            );
        }
        result
    }

    async fn capture_once(
        &self,
        session_id: &str,
        width: u32,
        height: u32,
        backend_slot: &mut Option<Box<dyn Backend>>,
        transcoder_slot: &mut Option<Transcoder>,
    ) -> Result<Vec<u8>> {
        let backend = backend_slot.insert(
            open_backend(
                self.backends.as_ref(),
                self.credentials.as_ref(),
                &self.camera,
                session_id,
                width,
            )
            .await?,
        );
        let source = backend.establish(self.config.timeouts.snapshot()).await?;

        let transcoder = transcoder_slot.insert(
            Transcoder::spawn(
                session_id,
                source,
                OutputSpec::Jpeg { width, height },
                &self.config.transcoder,
                self.config.timeouts.snapshot(),
            )
            .await?,
        );

        let image = transcoder.capture_jpeg().await?;
        if !is_jpeg(&image) {
            return Err(Error::TranscoderSpawn(format!(
                "snapshot output is not a JPEG ({} bytes)",
                image.len()
            )));
        }
        Ok(image)
    }
}

fn is_jpeg(bytes: &[u8]) -> bool {
    bytes.len() > 4 && bytes.starts_with(&[0xFF, 0xD8])
}

/// Fixed image returned when a capture fails
pub fn placeholder() -> &'static [u8] {
    static PLACEHOLDER: OnceLock<Vec<u8>> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        let image = RgbImage::from_pixel(PLACEHOLDER_WIDTH, PLACEHOLDER_HEIGHT, Rgb([24, 24, 24]));
        let mut out = Cursor::new(Vec::new());
        if let Err(e) = image.write_to(&mut out, ImageFormat::Jpeg) {
            warn!("Failed to encode placeholder snapshot: {}", e);
        }
        out.into_inner()
    })
}

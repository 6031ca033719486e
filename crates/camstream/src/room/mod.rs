//! Managed room backend
//!
//! The room SDK handles depacketization and decoding, so this backend
//! yields decoded frames rather than RTP payloads. The SDK itself sits
//! behind [`RoomConnector`] / [`RoomHandle`].

#[cfg(feature = "livekit")]
pub mod livekit;

use crate::media::{FrameSource, MediaSource, VideoFrame};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Room session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    Connecting,
    Connected,
    TrackSubscribed,
    Disconnected,
}

/// Events surfaced by a connected room
#[derive(Debug)]
pub enum RoomEvent {
    /// A remote video publication was subscribed; frames arrive on the receiver
    /// until the publisher stops
    VideoTrackSubscribed(mpsc::Receiver<VideoFrame>),
    Disconnected(String),
}

/// Connects to a room (SDK seam)
#[async_trait]
pub trait RoomConnector: Send + Sync {
    /// # Errors
    ///
    /// Returns [`Error::RoomError`] on authentication or network failure.
    async fn connect(&self, url: &str, token: &str) -> Result<Box<dyn RoomHandle>>;
}

/// A connected room
#[async_trait]
pub trait RoomHandle: Send {
    /// Next room event; `None` once the room is gone. Must be cancel-safe.
    async fn next_event(&mut self) -> Option<RoomEvent>;

    /// Leave the room
    async fn close(&mut self);
}

/// One viewer connection to a managed room
pub struct ManagedRoomSession {
    session_id: String,

    url: String,

    token: String,

    connector: Arc<dyn RoomConnector>,

    state: Arc<RwLock<RoomState>>,

    /// Room handle while establishing
    handle: Arc<Mutex<Option<Box<dyn RoomHandle>>>>,

    /// Close request for the post-subscribe watcher
    close_tx: parking_lot::Mutex<Option<oneshot::Sender<()>>>,

    watcher: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ManagedRoomSession {
    pub fn new(
        session_id: impl Into<String>,
        url: impl Into<String>,
        token: impl Into<String>,
        connector: Arc<dyn RoomConnector>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            url: url.into(),
            token: token.into(),
            connector,
            state: Arc::new(RwLock::new(RoomState::Connecting)),
            handle: Arc::new(Mutex::new(None)),
            close_tx: parking_lot::Mutex::new(None),
            watcher: parking_lot::Mutex::new(None),
        }
    }

    pub fn state(&self) -> RoomState {
        *self.state.read()
    }

    fn set_state(&self, new_state: RoomState) {
        set_state(&self.state, &self.session_id, new_state);
    }

    /// Connect and wait for the first subscribed video track
    #[instrument(skip(self), fields(session_id = %self.session_id))]
    pub async fn establish(&self, deadline: Duration) -> Result<MediaSource> {
        let result = match tokio::time::timeout(deadline, self.connect_and_subscribe()).await {
            Ok(result) => result,
            Err(_) => Err(Error::NegotiationTimeout(deadline)),
        };

        match result {
            Ok(frames) => {
                self.set_state(RoomState::TrackSubscribed);
                self.spawn_watcher().await;
                Ok(MediaSource::Frames(FrameSource { frames }))
            }
            Err(e) => {
                warn!("Session {} room establishment failed: {}", self.session_id, e);
                self.teardown().await;
                Err(e)
            }
        }
    }

    async fn connect_and_subscribe(&self) -> Result<mpsc::Receiver<VideoFrame>> {
        info!("Connecting to room");
        let handle = self.connector.connect(&self.url, &self.token).await?;
        *self.handle.lock().await = Some(handle);
        self.set_state(RoomState::Connected);

        let mut guard = self.handle.lock().await;
        let handle = guard
            .as_mut()
            .ok_or_else(|| Error::RoomError("Room closed while connecting".to_string()))?;

        loop {
            match handle.next_event().await {
                Some(RoomEvent::VideoTrackSubscribed(frames)) => {
                    info!("Video track subscribed");
                    return Ok(frames);
                }
                Some(RoomEvent::Disconnected(reason)) => {
                    return Err(Error::RoomError(format!(
                        "Disconnected before subscribe: {}",
                        reason
                    )));
                }
                None => {
                    return Err(Error::RoomError("Room ended before subscribe".to_string()));
                }
            }
        }
    }

    /// Hand the room to a task that follows it until disconnect or close
    async fn spawn_watcher(&self) {
        let Some(mut handle) = self.handle.lock().await.take() else {
            return;
        };

        let (close_tx, mut close_rx) = oneshot::channel();
        let state = Arc::clone(&self.state);
        let session_id = self.session_id.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut close_rx => {
                        handle.close().await;
                        break;
                    }
                    event = handle.next_event() => match event {
                        Some(RoomEvent::Disconnected(reason)) => {
                            info!("Session {} room disconnected: {}", session_id, reason);
                            break;
                        }
                        Some(RoomEvent::VideoTrackSubscribed(_)) => {
                            debug!("Session {} ignoring extra video track", session_id);
                        }
                        None => break,
                    },
                }
            }
            set_state(&state, &session_id, RoomState::Disconnected);
        });

        *self.close_tx.lock() = Some(close_tx);
        *self.watcher.lock() = Some(task);
    }

    /// Leave the room. Idempotent.
    pub async fn teardown(&self) {
        let close_tx = self.close_tx.lock().take();
        let watcher = self.watcher.lock().take();

        if let Some(tx) = close_tx {
            let _ = tx.send(());
        }
        if let Some(mut task) = watcher {
            if tokio::time::timeout(Duration::from_secs(2), &mut task)
                .await
                .is_err()
            {
                warn!("Session {} room close timed out", self.session_id);
                task.abort();
            }
        }

        let handle = self.handle.lock().await.take();
        if let Some(mut handle) = handle {
            handle.close().await;
        }

        self.set_state(RoomState::Disconnected);
    }
}

fn set_state(state: &RwLock<RoomState>, session_id: &str, new_state: RoomState) {
    let mut guard = state.write();
    if *guard != new_state {
        debug!(
            "Session {} room state: {:?} -> {:?}",
            session_id, *guard, new_state
        );
        *guard = new_state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::PixelFormat;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeHandle {
        events: mpsc::UnboundedReceiver<RoomEvent>,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RoomHandle for FakeHandle {
        async fn next_event(&mut self) -> Option<RoomEvent> {
            self.events.recv().await
        }

        async fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeConnector {
        events: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<RoomEvent>>>,
        closed: Arc<AtomicUsize>,
        fail: bool,
    }

    impl FakeConnector {
        fn new(fail: bool) -> (Arc<Self>, mpsc::UnboundedSender<RoomEvent>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let connector = Arc::new(Self {
                events: parking_lot::Mutex::new(Some(rx)),
                closed: Arc::new(AtomicUsize::new(0)),
                fail,
            });
            (connector, tx)
        }
    }

    #[async_trait]
    impl RoomConnector for FakeConnector {
        async fn connect(&self, _url: &str, token: &str) -> Result<Box<dyn RoomHandle>> {
            if self.fail || token.is_empty() {
                return Err(Error::RoomError("unauthorized".to_string()));
            }
            let events = self
                .events
                .lock()
                .take()
                .ok_or_else(|| Error::RoomError("already connected".to_string()))?;
            Ok(Box::new(FakeHandle {
                events,
                closed: Arc::clone(&self.closed),
            }))
        }
    }

    fn frame() -> VideoFrame {
        VideoFrame {
            format: PixelFormat::I420,
            width: 2,
            height: 2,
            planes: vec![
                Bytes::from_static(&[0; 4]),
                Bytes::from_static(&[0]),
                Bytes::from_static(&[0]),
            ],
        }
    }

    #[tokio::test]
    async fn test_subscribe_yields_frames_then_ends() {
        let (connector, events) = FakeConnector::new(false);
        let session = ManagedRoomSession::new("r1", "wss://room", "tok", connector.clone());
        assert_eq!(session.state(), RoomState::Connecting);

        let (frame_tx, frame_rx) = mpsc::channel(4);
        events.send(RoomEvent::VideoTrackSubscribed(frame_rx)).unwrap();

        let source = session.establish(Duration::from_secs(2)).await.unwrap();
        assert_eq!(session.state(), RoomState::TrackSubscribed);

        let MediaSource::Frames(mut source) = source else {
            panic!("expected frame source");
        };
        frame_tx.send(frame()).await.unwrap();
        drop(frame_tx);
        assert!(source.frames.recv().await.is_some());
        assert!(source.frames.recv().await.is_none());

        session.teardown().await;
        assert_eq!(session.state(), RoomState::Disconnected);
        assert_eq!(connector.closed.load(Ordering::SeqCst), 1);

        session.teardown().await;
        assert_eq!(connector.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_auth_failure() {
        let (connector, _events) = FakeConnector::new(true);
        let session = ManagedRoomSession::new("r2", "wss://room", "tok", connector);
        let err = session.establish(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::RoomError(_)));
        assert_eq!(session.state(), RoomState::Disconnected);
    }

    #[tokio::test]
    async fn test_no_publication_times_out_and_closes() {
        let (connector, _events) = FakeConnector::new(false);
        let session = ManagedRoomSession::new("r3", "wss://room", "tok", connector.clone());
        let err = session
            .establish(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NegotiationTimeout(_)));
        assert_eq!(connector.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_publisher_disconnect_before_subscribe() {
        let (connector, events) = FakeConnector::new(false);
        let session = ManagedRoomSession::new("r4", "wss://room", "tok", connector);
        events
            .send(RoomEvent::Disconnected("publisher left".to_string()))
            .unwrap();
        let err = session.establish(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::RoomError(_)));
    }

    #[tokio::test]
    async fn test_disconnect_after_subscribe_updates_state() {
        let (connector, events) = FakeConnector::new(false);
        let session = ManagedRoomSession::new("r5", "wss://room", "tok", connector);
        let (_frame_tx, frame_rx) = mpsc::channel(1);
        events.send(RoomEvent::VideoTrackSubscribed(frame_rx)).unwrap();
        session.establish(Duration::from_secs(1)).await.unwrap();

        events
            .send(RoomEvent::Disconnected("bye".to_string()))
            .unwrap();
        for _ in 0..50 {
            if session.state() == RoomState::Disconnected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(session.state(), RoomState::Disconnected);
        session.teardown().await;
    }
}

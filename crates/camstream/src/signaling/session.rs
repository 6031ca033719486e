//! Viewer-side signaling session: WebSocket channel + WebRTC peer
//!
//! The viewer always offers. The offer carries one receive-only video
//! transceiver, one receive-only audio transceiver and a data channel.
//! Without the data channel the master answers with an inactive video
//! line and never sends media.

use super::protocol::{CandidatePayload, InboundMessage, OutboundMessage};
use crate::credentials::LiveViewCredentials;
use crate::media::{MediaKind, MediaPacket, MediaSource, RtpSource};
use crate::{Error, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, instrument, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCPFeedback, RTCRtpTransceiverInit};
use webrtc::track::track_remote::TrackRemote;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Payload type registered for H.264
pub const H264_PAYLOAD_TYPE: u8 = 96;

/// Payload type registered for Opus
pub const OPUS_PAYLOAD_TYPE: u8 = 111;

/// Constrained baseline 3.1, single NAL / non-interleaved
const H264_FMTP: &str = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";

const DATA_CHANNEL_LABEL: &str = "kvsDataChannel";

/// Signaling session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Init,
    Connecting,
    OfferSent,
    AnswerReceived,
    Connected,
    Closed,
    Failed,
}

/// Events the WebSocket receiver task forwards to the negotiation loop
#[derive(Debug)]
enum ChannelEvent {
    Message(InboundMessage),
    Closed(String),
}

/// Senders handed to the first video and first audio track
#[derive(Default)]
struct TrackSlots {
    video: Mutex<Option<mpsc::Sender<MediaPacket>>>,
    audio: Mutex<Option<mpsc::Sender<MediaPacket>>>,
    forwarded: AtomicU64,
    dropped: AtomicU64,
}

impl TrackSlots {
    fn take(&self, kind: MediaKind) -> Option<mpsc::Sender<MediaPacket>> {
        match kind {
            MediaKind::Video => self.video.lock().take(),
            MediaKind::Audio => self.audio.lock().take(),
        }
    }

    fn clear(&self) {
        self.video.lock().take();
        self.audio.lock().take();
    }
}

/// One viewer connection to a camera's signaling channel
pub struct SignalingSession {
    session_id: String,

    credentials: LiveViewCredentials,

    packet_queue_depth: usize,

    state: Arc<RwLock<SignalingState>>,

    peer: Mutex<Option<Arc<RTCPeerConnection>>>,

    /// Outgoing WebSocket frames
    ws_tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,

    sender_task: Mutex<Option<JoinHandle<()>>>,

    tasks: Mutex<Vec<JoinHandle<()>>>,

    tracks: Arc<TrackSlots>,

    /// Cancelled by `teardown`; aborts an `establish` in flight
    cancel: CancellationToken,

    torn_down: AtomicBool,
}

impl SignalingSession {
    pub fn new(
        session_id: impl Into<String>,
        credentials: LiveViewCredentials,
        packet_queue_depth: usize,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            credentials,
            packet_queue_depth: packet_queue_depth.max(1),
            state: Arc::new(RwLock::new(SignalingState::Init)),
            peer: Mutex::new(None),
            ws_tx: Mutex::new(None),
            sender_task: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            tracks: Arc::new(TrackSlots::default()),
            cancel: CancellationToken::new(),
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> SignalingState {
        *self.state.read()
    }

    /// Packets forwarded to the relay queues so far
    pub fn forwarded_packets(&self) -> u64 {
        self.tracks.forwarded.load(Ordering::Relaxed)
    }

    /// Packets dropped because a relay queue was full
    pub fn dropped_packets(&self) -> u64 {
        self.tracks.dropped.load(Ordering::Relaxed)
    }

    fn set_state(&self, new_state: SignalingState) {
        let mut guard = self.state.write();
        if *guard != new_state {
            debug!(
                "Session {} signaling state: {:?} -> {:?}",
                self.session_id, *guard, new_state
            );
            *guard = new_state;
        }
    }

    /// Drive the session from `Init` to `Connected`.
    ///
    /// On any failure (including the deadline) the session ends `Failed`
    /// with every socket and task released. A concurrent `teardown` makes it
    /// settle with [`Error::SessionStopped`] and leaves the session `Closed`.
    #[instrument(skip(self), fields(session_id = %self.session_id))]
    pub async fn establish(&self, deadline: Duration) -> Result<MediaSource> {
        if self.state() != SignalingState::Init {
            return Err(Error::SessionError(format!(
                "Signaling session {} already used",
                self.session_id
            )));
        }
        self.set_state(SignalingState::Connecting);

        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(self.stopped()),
            result = tokio::time::timeout(deadline, self.negotiate()) => match result {
                Ok(result) => result,
                Err(_) => Err(Error::NegotiationTimeout(deadline)),
            },
        };

        // Teardown may land between the last await and the return
        let result = match result {
            Ok(_) if self.cancel.is_cancelled() => Err(self.stopped()),
            other => other,
        };

        match result {
            Ok(source) => Ok(source),
            Err(e) => {
                if self.cancel.is_cancelled() {
                    debug!("Session {} stopped while negotiating", self.session_id);
                    self.set_state(SignalingState::Closed);
                } else {
                    warn!("Session {} negotiation failed: {}", self.session_id, e);
                    self.set_state(SignalingState::Failed);
                }
                // The negotiation future is gone; release whatever it stored,
                // even if a concurrent teardown already ran
                self.cancel.cancel();
                self.torn_down.store(true, Ordering::SeqCst);
                self.release().await;
                Err(e)
            }
        }
    }

    fn stopped(&self) -> Error {
        Error::SessionStopped(self.session_id.clone())
    }

    async fn negotiate(&self) -> Result<MediaSource> {
        info!("Connecting to signaling channel");

        let (ws_stream, _) = connect_async(self.credentials.endpoint.as_str())
            .await
            .map_err(|e| Error::Signaling(format!("Failed to connect: {}", e)))?;

        info!("Signaling channel open");

        let (write, read) = ws_stream.split();
        let (ws_tx, ws_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        *self.ws_tx.lock() = Some(ws_tx.clone());
        *self.sender_task.lock() = Some(tokio::spawn(Self::sender_task(write, ws_rx)));
        self.tasks
            .lock()
            .push(tokio::spawn(Self::receiver_task(read, event_tx)));

        let (video_tx, video_rx) = mpsc::channel(self.packet_queue_depth);
        let (audio_tx, audio_rx) = mpsc::channel(self.packet_queue_depth);
        *self.tracks.video.lock() = Some(video_tx);
        *self.tracks.audio.lock() = Some(audio_tx);

        let (peer_state_tx, mut peer_state_rx) = mpsc::unbounded_channel();
        let peer = self.build_peer_connection(ws_tx, peer_state_tx).await?;
        *self.peer.lock() = Some(Arc::clone(&peer));

        let offer = peer
            .create_offer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;

        // Offer goes out before gathering starts so candidates never precede it
        self.send(OutboundMessage::offer(&offer.sdp)?)?;
        peer.set_local_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;
        self.set_state(SignalingState::OfferSent);

        let mut pending_candidates: Vec<RTCIceCandidateInit> = Vec::new();
        let mut answered = false;

        loop {
            tokio::select! {
                event = event_rx.recv() => match event {
                    Some(ChannelEvent::Message(InboundMessage::Answer { sdp, sender })) => {
                        if answered {
                            debug!("Ignoring duplicate answer from {:?}", sender);
                            continue;
                        }
                        if sdp.sdp_type != "answer" {
                            warn!("Ignoring SDP of type {} from {:?}", sdp.sdp_type, sender);
                            continue;
                        }

                        let answer = RTCSessionDescription::answer(sdp.sdp)
                            .map_err(|e| Error::SdpError(format!("Invalid answer: {}", e)))?;
                        peer.set_remote_description(answer)
                            .await
                            .map_err(|e| Error::SdpError(format!("Failed to apply answer: {}", e)))?;
                        answered = true;
                        self.set_state(SignalingState::AnswerReceived);

                        for candidate in pending_candidates.drain(..) {
                            Self::apply_candidate(&peer, candidate).await;
                        }
                    }
                    Some(ChannelEvent::Message(InboundMessage::Candidate { candidate, .. })) => {
                        if candidate.candidate.trim().is_empty() {
                            trace!("Remote end-of-candidates");
                            continue;
                        }
                        let init = candidate_init(candidate);
                        if answered {
                            Self::apply_candidate(&peer, init).await;
                        } else {
                            pending_candidates.push(init);
                        }
                    }
                    Some(ChannelEvent::Message(InboundMessage::Status(status))) => {
                        warn!(
                            "Signaling status: code={:?} type={:?} {:?}",
                            status.status_code, status.error_type, status.description
                        );
                    }
                    Some(ChannelEvent::Message(InboundMessage::GoAway)) => {
                        return Err(Error::Signaling("Channel sent GO_AWAY".to_string()));
                    }
                    Some(ChannelEvent::Message(InboundMessage::ReconnectIceServer)) => {
                        return Err(Error::Signaling(
                            "Channel requested ICE server reconnect".to_string(),
                        ));
                    }
                    Some(ChannelEvent::Message(InboundMessage::Unknown(kind))) => {
                        debug!("Ignoring signaling message type {}", kind);
                    }
                    Some(ChannelEvent::Closed(reason)) => {
                        return Err(Error::Signaling(format!(
                            "Channel closed before connect: {}",
                            reason
                        )));
                    }
                    None => {
                        return Err(Error::Signaling("Channel receiver ended".to_string()));
                    }
                },
                peer_state = peer_state_rx.recv() => match peer_state {
                    Some(RTCPeerConnectionState::Connected) => break,
                    Some(RTCPeerConnectionState::Failed) | Some(RTCPeerConnectionState::Closed) => {
                        return Err(Error::Signaling(format!(
                            "Peer connection {:?} before connect",
                            peer_state
                        )));
                    }
                    Some(other) => debug!("Peer connection state: {}", other),
                    None => {
                        return Err(Error::Signaling("Peer connection dropped".to_string()));
                    }
                },
            }
        }

        self.set_state(SignalingState::Connected);
        info!("Peer connected");

        self.tasks.lock().push(tokio::spawn(Self::watch_connected(
            self.session_id.clone(),
            Arc::clone(&peer),
            event_rx,
            peer_state_rx,
            Arc::clone(&self.tracks),
        )));

        Ok(MediaSource::Rtp(RtpSource {
            video: video_rx,
            audio: Some(audio_rx),
            video_payload_type: H264_PAYLOAD_TYPE,
            audio_payload_type: OPUS_PAYLOAD_TYPE,
        }))
    }

    async fn build_peer_connection(
        &self,
        ws_tx: mpsc::UnboundedSender<Message>,
        peer_state_tx: mpsc::UnboundedSender<RTCPeerConnectionState>,
    ) -> Result<Arc<RTCPeerConnection>> {
        let mut media_engine = MediaEngine::default();

        let video_feedback = vec![
            RTCPFeedback {
                typ: "goog-remb".to_owned(),
                parameter: "".to_owned(),
            },
            RTCPFeedback {
                typ: "ccm".to_owned(),
                parameter: "fir".to_owned(),
            },
            RTCPFeedback {
                typ: "nack".to_owned(),
                parameter: "".to_owned(),
            },
            RTCPFeedback {
                typ: "nack".to_owned(),
                parameter: "pli".to_owned(),
            },
            RTCPFeedback {
                typ: "transport-cc".to_owned(),
                parameter: "".to_owned(),
            },
        ];

        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_H264.to_owned(),
                        clock_rate: 90000,
                        channels: 0,
                        sdp_fmtp_line: H264_FMTP.to_owned(),
                        rtcp_feedback: video_feedback,
                    },
                    payload_type: H264_PAYLOAD_TYPE,
                    ..Default::default()
                },
                RTPCodecType::Video,
            )
            .map_err(|e| Error::WebRtcError(format!("Failed to register H.264: {}", e)))?;

        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_OPUS.to_owned(),
                        clock_rate: 48000,
                        channels: 2,
                        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                        rtcp_feedback: vec![],
                    },
                    payload_type: OPUS_PAYLOAD_TYPE,
                    ..Default::default()
                },
                RTPCodecType::Audio,
            )
            .map_err(|e| Error::WebRtcError(format!("Failed to register Opus: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::WebRtcError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = self
            .credentials
            .ice_servers
            .iter()
            .map(|server| {
                #[allow(clippy::needless_update)]
                RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                }
            })
            .collect();

        let peer = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to create peer connection: {}", e)))?,
        );

        for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
            peer.add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to add {} transceiver: {}", kind, e)))?;
        }

        peer.create_data_channel(DATA_CHANNEL_LABEL, None)
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to create data channel: {}", e)))?;

        peer.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let _ = peer_state_tx.send(s);
            Box::pin(async {})
        }));

        let session_id = self.session_id.clone();
        peer.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let ws_tx = ws_tx.clone();
            let session_id = session_id.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("Session {} local ICE gathering complete", session_id);
                    return;
                };

                let message = candidate
                    .to_json()
                    .map_err(Error::from)
                    .map(candidate_payload)
                    .and_then(|payload| OutboundMessage::candidate(&payload))
                    .and_then(|message| message.to_json());

                match message {
                    Ok(text) => {
                        if ws_tx.send(Message::Text(text)).is_err() {
                            trace!("Session {} dropped local candidate after close", session_id);
                        }
                    }
                    Err(e) => warn!("Session {} failed to encode candidate: {}", session_id, e),
                }
            })
        }));

        let tracks = Arc::clone(&self.tracks);
        let session_id = self.session_id.clone();
        peer.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tracks = Arc::clone(&tracks);
            let session_id = session_id.clone();

            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Video => MediaKind::Video,
                    RTPCodecType::Audio => MediaKind::Audio,
                    _ => return,
                };

                let Some(tx) = tracks.take(kind) else {
                    warn!("Session {} ignoring extra {} track", session_id, kind);
                    return;
                };

                info!(
                    "Session {} received {} track ({})",
                    session_id,
                    kind,
                    track.codec().capability.mime_type
                );

                tokio::spawn(Self::forward_track(track, kind, tx, tracks));
            })
        }));

        Ok(peer)
    }

    /// Read RTP from a remote track into the bounded relay queue
    async fn forward_track(
        track: Arc<TrackRemote>,
        kind: MediaKind,
        tx: mpsc::Sender<MediaPacket>,
        tracks: Arc<TrackSlots>,
    ) {
        loop {
            let (packet, _) = match track.read_rtp().await {
                Ok(read) => read,
                Err(e) => {
                    debug!("{} track ended: {}", kind, e);
                    break;
                }
            };

            let packet = MediaPacket {
                kind,
                payload_type: packet.header.payload_type,
                sequence: packet.header.sequence_number,
                timestamp: packet.header.timestamp,
                marker: packet.header.marker,
                payload: packet.payload,
            };

            match tx.try_send(packet) {
                Ok(()) => {
                    tracks.forwarded.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracks.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
    }

    async fn apply_candidate(peer: &RTCPeerConnection, candidate: RTCIceCandidateInit) {
        if let Err(e) = peer.add_ice_candidate(candidate).await {
            warn!("Failed to add remote ICE candidate: {}", e);
        }
    }

    /// Keep applying trickled candidates after connect and watch for peer loss
    async fn watch_connected(
        session_id: String,
        peer: Arc<RTCPeerConnection>,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
        mut peer_states: mpsc::UnboundedReceiver<RTCPeerConnectionState>,
        tracks: Arc<TrackSlots>,
    ) {
        let mut channel_open = true;

        loop {
            tokio::select! {
                event = events.recv(), if channel_open => match event {
                    Some(ChannelEvent::Message(InboundMessage::Candidate { candidate, .. })) => {
                        if !candidate.candidate.trim().is_empty() {
                            Self::apply_candidate(&peer, candidate_init(candidate)).await;
                        }
                    }
                    Some(ChannelEvent::Message(other)) => {
                        debug!("Session {} post-connect message: {:?}", session_id, other);
                    }
                    Some(ChannelEvent::Closed(reason)) => {
                        debug!("Session {} signaling channel closed: {}", session_id, reason);
                        channel_open = false;
                    }
                    None => channel_open = false,
                },
                state = peer_states.recv() => match state {
                    Some(RTCPeerConnectionState::Failed)
                    | Some(RTCPeerConnectionState::Closed)
                    | None => {
                        warn!("Session {} peer connection ended: {:?}", session_id, state);
                        tracks.clear();
                        return;
                    }
                    Some(other) => debug!("Session {} peer state: {}", session_id, other),
                },
            }
        }
    }

    fn send(&self, message: OutboundMessage) -> Result<()> {
        let text = message.to_json()?;
        let guard = self.ws_tx.lock();
        let tx = guard
            .as_ref()
            .ok_or_else(|| Error::Signaling("Channel not open".to_string()))?;
        tx.send(Message::Text(text))
            .map_err(|_| Error::Signaling("Channel sender closed".to_string()))
    }

    /// Sender task: sends messages from channel to WebSocket
    async fn sender_task(
        mut write: SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<Message>,
    ) {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if let Err(e) = write.send(msg).await {
                error!("Failed to send WebSocket message: {}", e);
                break;
            }
            if closing {
                break;
            }
        }

        debug!("Sender task terminated");
    }

    /// Receiver task: parses frames and forwards them to the negotiation loop
    async fn receiver_task(
        mut read: SplitStream<WsStream>,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) {
        while let Some(msg_result) = read.next().await {
            match msg_result {
                Ok(Message::Text(text)) => match InboundMessage::parse(&text) {
                    Ok(Some(message)) => {
                        if events.send(ChannelEvent::Message(message)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => trace!("Signaling keepalive"),
                    Err(e) => warn!("Ignoring malformed signaling frame: {}", e),
                },
                Ok(Message::Close(frame)) => {
                    let _ = events.send(ChannelEvent::Closed(format!("close frame {:?}", frame)));
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    let _ = events.send(ChannelEvent::Closed(format!("WebSocket error: {}", e)));
                    return;
                }
            }
        }

        let _ = events.send(ChannelEvent::Closed("stream ended".to_string()));
    }

    /// Close the signaling channel and the peer connection.
    ///
    /// Idempotent. Every step runs even if an earlier one fails. An
    /// `establish` in flight is cancelled and releases what it opened.
    pub async fn teardown(&self) {
        self.cancel.cancel();
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!("Tearing down signaling session {}", self.session_id);
        self.release().await;

        let mut state = self.state.write();
        if *state != SignalingState::Failed {
            *state = SignalingState::Closed;
        }
    }

    async fn release(&self) {
        let ws_tx = self.ws_tx.lock().take();
        if let Some(tx) = ws_tx {
            let _ = tx.send(Message::Close(None));
        }

        let sender = self.sender_task.lock().take();
        if let Some(mut handle) = sender {
            if tokio::time::timeout(Duration::from_millis(500), &mut handle)
                .await
                .is_err()
            {
                handle.abort();
            }
        }

        let peer = self.peer.lock().take();
        if let Some(peer) = peer {
            if let Err(e) = peer.close().await {
                warn!("Session {} peer close failed: {}", self.session_id, e);
            }
        }

        self.tracks.clear();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for SignalingSession {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
        if let Some(task) = self.sender_task.get_mut().take() {
            task.abort();
        }
    }
}

fn candidate_init(candidate: CandidatePayload) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

fn candidate_payload(init: RTCIceCandidateInit) -> CandidatePayload {
    CandidatePayload {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

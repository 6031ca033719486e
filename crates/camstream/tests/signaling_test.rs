//! Signaling session against an in-process fake signaling channel

mod harness;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use camstream::{Error, LiveViewCredentials, MediaKind, MediaSource, SignalingSession, SignalingState};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

/// What the fake channel does after receiving the offer
#[derive(Clone, Copy, PartialEq, Eq)]
enum Behaviour {
    /// Send keepalives and a junk frame, then close the socket
    CloseAfterOffer,
    /// Never answer
    Silent,
    /// Camera peer with trickle ICE both ways; one candidate precedes the answer
    Answer,
    /// Camera peer that sends all its candidates before the answer and
    /// ignores the viewer's
    AnswerAfterCandidates,
}

struct FakeChannel {
    url: String,
    /// Every text frame the engine sent, in order. Closes with the socket.
    frames: mpsc::UnboundedReceiver<String>,
    /// SDP of each answer the camera peer sent
    answers: mpsc::UnboundedReceiver<String>,
    _shutdown: oneshot::Sender<()>,
}

/// Frame as the channel delivers it to the viewer
fn inbound(message_type: &str, body: &str) -> Message {
    Message::Text(
        serde_json::json!({
            "messageType": message_type,
            "messagePayload": STANDARD.encode(body),
            "senderClientId": "master",
        })
        .to_string(),
    )
}

/// Sendonly H.264 camera answering one offer
struct CameraPeer {
    peer: Arc<RTCPeerConnection>,
    tasks: Vec<JoinHandle<()>>,
    apply_viewer_candidates: bool,
}

impl CameraPeer {
    async fn answer(
        offer: String,
        out: mpsc::UnboundedSender<Message>,
        answers: mpsc::UnboundedSender<String>,
        behaviour: Behaviour,
    ) -> Self {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().unwrap();
        let registry = register_default_interceptors(Registry::new(), &mut media_engine).unwrap();
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        let peer = Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .unwrap(),
        );

        let track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_owned(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line:
                    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                        .to_owned(),
                rtcp_feedback: vec![],
            },
            "video".to_owned(),
            "camera".to_owned(),
        ));
        let sender = peer
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .unwrap();

        let (candidate_tx, mut candidates) = mpsc::unbounded_channel::<String>();
        peer.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let candidate_tx = candidate_tx.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    let init = candidate.to_json().unwrap();
                    let _ = candidate_tx.send(serde_json::to_string(&init).unwrap());
                }
            })
        }));

        peer.set_remote_description(RTCSessionDescription::offer(offer).unwrap())
            .await
            .unwrap();
        let answer = peer.create_answer(None).await.unwrap();
        let mut gathered = peer.gathering_complete_promise().await;
        peer.set_local_description(answer.clone()).await.unwrap();

        let early = match behaviour {
            Behaviour::AnswerAfterCandidates => {
                let _ = tokio::time::timeout(Duration::from_secs(10), gathered.recv()).await;
                let mut all = Vec::new();
                while let Ok(candidate) = candidates.try_recv() {
                    all.push(candidate);
                }
                all
            }
            _ => {
                let first = tokio::time::timeout(Duration::from_secs(10), candidates.recv())
                    .await
                    .expect("camera gathered a candidate")
                    .unwrap();
                vec![first]
            }
        };
        assert!(!early.is_empty());

        // Candidates ahead of the answer reach a viewer with no remote description
        for candidate in &early {
            out.send(inbound("ICE_CANDIDATE", candidate)).unwrap();
        }
        let body = serde_json::json!({"type": "answer", "sdp": answer.sdp}).to_string();
        out.send(inbound("SDP_ANSWER", &body)).unwrap();
        let _ = answers.send(answer.sdp);

        let mut tasks = Vec::new();

        let trickle = out.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(candidate) = candidates.recv().await {
                if trickle.send(inbound("ICE_CANDIDATE", &candidate)).is_err() {
                    break;
                }
            }
        }));

        tasks.push(tokio::spawn(async move {
            let mut rtcp = vec![0u8; 1500];
            while sender.read(&mut rtcp).await.is_ok() {}
        }));

        // Unbound writes are dropped until the viewer connects
        tasks.push(tokio::spawn(async move {
            let mut sequence: u16 = 0;
            loop {
                let packet = Packet {
                    header: Header {
                        version: 2,
                        marker: true,
                        payload_type: 96,
                        sequence_number: sequence,
                        timestamp: u32::from(sequence) * 3000,
                        ssrc: 0x0ca0_0001,
                        ..Default::default()
                    },
                    payload: Bytes::from_static(&[0x65, 0x88, 0x84, 0x00]),
                };
                let _ = track.write_rtp(&packet).await;
                sequence = sequence.wrapping_add(1);
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }));

        Self {
            peer,
            tasks,
            apply_viewer_candidates: behaviour == Behaviour::Answer,
        }
    }

    async fn add_viewer_candidate(&self, payload: &str) {
        if !self.apply_viewer_candidates {
            return;
        }
        let body = STANDARD.decode(payload).unwrap();
        let init: RTCIceCandidateInit = serde_json::from_slice(&body).unwrap();
        self.peer.add_ice_candidate(init).await.unwrap();
    }

    async fn close(self) {
        for task in self.tasks {
            task.abort();
        }
        let _ = self.peer.close().await;
    }
}

async fn fake_channel(behaviour: Behaviour) -> FakeChannel {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (frames_tx, frames) = mpsc::unbounded_channel();
    let (answers_tx, answers) = mpsc::unbounded_channel();
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let (mut write, mut read) = ws.split();

        let (out, mut outgoing) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(message) = outgoing.recv().await {
                if write.send(message).await.is_err() {
                    break;
                }
            }
        });

        let mut camera: Option<CameraPeer> = None;

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                message = read.next() => {
                    let text = match message {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(_)) => continue,
                        _ => break,
                    };
                    let _ = frames_tx.send(text.clone());

                    let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
                    match frame["action"].as_str() {
                        Some("SDP_OFFER") => {}
                        Some("ICE_CANDIDATE") => {
                            if let (Some(camera), Some(payload)) =
                                (&camera, frame["messagePayload"].as_str())
                            {
                                camera.add_viewer_candidate(payload).await;
                            }
                            continue;
                        }
                        _ => continue,
                    }

                    match behaviour {
                        Behaviour::CloseAfterOffer => {
                            let _ = out.send(Message::Text(String::new()));
                            let _ = out.send(Message::Text(
                                r#"{"messageType":"SOMETHING_NEW"}"#.to_string(),
                            ));
                            let _ = out.send(Message::Close(None));
                            break;
                        }
                        Behaviour::Silent => {
                            let _ = out.send(Message::Text(String::new()));
                        }
                        Behaviour::Answer | Behaviour::AnswerAfterCandidates => {
                            let offer = decode_offer(&text);
                            camera = Some(
                                CameraPeer::answer(offer, out.clone(), answers_tx.clone(), behaviour)
                                    .await,
                            );
                        }
                    }
                }
            }
        }

        if let Some(camera) = camera {
            camera.close().await;
        }
        drop(out);
        let _ = writer.await;
    });

    FakeChannel {
        url,
        frames,
        answers,
        _shutdown: shutdown_tx,
    }
}

fn decode_offer(frame: &str) -> String {
    let frame: serde_json::Value = serde_json::from_str(frame).unwrap();
    let payload = frame["messagePayload"].as_str().unwrap();
    let body: serde_json::Value =
        serde_json::from_slice(&STANDARD.decode(payload).unwrap()).unwrap();
    assert_eq!(body["type"], "offer");
    body["sdp"].as_str().unwrap().to_string()
}

fn credentials(url: &str) -> LiveViewCredentials {
    LiveViewCredentials {
        endpoint: url.to_string(),
        client_id: "viewer-1".to_string(),
        ice_servers: vec![],
        room_token: None,
    }
}

/// Connect, check the answer direction and wait for the first video packet
async fn assert_connects_and_receives(channel: &mut FakeChannel, session: &SignalingSession) {
    let source = session
        .establish(Duration::from_secs(15))
        .await
        .expect("session connects");
    assert_eq!(session.state(), SignalingState::Connected);

    let answer = channel.answers.recv().await.unwrap();
    assert!(answer.contains("m=video"));
    assert!(answer.contains("a=sendonly"), "answer:\n{}", answer);

    let mut rtp = match source {
        MediaSource::Rtp(rtp) => rtp,
        other => panic!("expected an RTP source, got {}", other.describe()),
    };
    let packet = tokio::time::timeout(Duration::from_secs(10), rtp.video.recv())
        .await
        .expect("video packet within 10s")
        .expect("video queue open");
    assert_eq!(packet.kind, MediaKind::Video);
    assert_eq!(packet.payload_type, rtp.video_payload_type);
    assert_eq!(&packet.payload[..], &[0x65, 0x88, 0x84, 0x00]);
    assert!(session.forwarded_packets() >= 1);
}

#[tokio::test]
async fn test_offer_declares_data_channel_and_has_no_recipient() {
    harness::init_logging();
    let mut channel = fake_channel(Behaviour::CloseAfterOffer).await;
    let session = SignalingSession::new("s1", credentials(&channel.url), 16);

    let err = session
        .establish(Duration::from_secs(5))
        .await
        .unwrap_err();

    // Keepalive and unknown frames are skipped; the close ends the attempt
    assert!(matches!(err, Error::Signaling(_)), "got {:?}", err);
    assert_eq!(session.state(), SignalingState::Failed);

    let first = channel.frames.recv().await.unwrap();
    let frame: serde_json::Value = serde_json::from_str(&first).unwrap();
    assert_eq!(frame["action"], "SDP_OFFER");
    assert!(frame.get("recipientClientId").is_none());

    let sdp = decode_offer(&first);
    assert!(sdp.contains("m=video"));
    assert!(sdp.contains("m=audio"));
    assert!(sdp.contains("m=application"));
    assert!(sdp.contains("a=recvonly"));
    assert!(sdp.contains("H264/90000"));
    assert!(!sdp.contains("a=sendrecv"));

    while let Ok(text) = channel.frames.try_recv() {
        let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(frame["action"], "ICE_CANDIDATE");
        assert!(frame.get("recipientClientId").is_none());
    }
}

#[tokio::test]
async fn test_silent_channel_times_out() {
    harness::init_logging();
    let channel = fake_channel(Behaviour::Silent).await;
    let session = SignalingSession::new("s2", credentials(&channel.url), 16);

    let started = Instant::now();
    let err = session
        .establish(Duration::from_secs(1))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NegotiationTimeout(_)), "got {:?}", err);
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(session.state(), SignalingState::Failed);

    // Already released; a second teardown is harmless
    session.teardown().await;
    assert_eq!(session.state(), SignalingState::Failed);
}

#[tokio::test]
async fn test_connects_with_trickle_both_ways() {
    harness::init_logging();
    let mut channel = fake_channel(Behaviour::Answer).await;
    let session = SignalingSession::new("s3", credentials(&channel.url), 16);

    assert_connects_and_receives(&mut channel, &session).await;

    let mut viewer_candidates = 0;
    while let Ok(text) = channel.frames.try_recv() {
        let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
        if frame["action"] == "ICE_CANDIDATE" {
            viewer_candidates += 1;
        }
    }
    assert!(viewer_candidates >= 1);

    session.teardown().await;
    assert_eq!(session.state(), SignalingState::Closed);
}

#[tokio::test]
async fn test_candidates_before_answer_are_applied() {
    harness::init_logging();
    // The camera ignores the viewer's candidates, so only the ones the
    // viewer held until the answer can form a pair
    let mut channel = fake_channel(Behaviour::AnswerAfterCandidates).await;
    let session = SignalingSession::new("s4", credentials(&channel.url), 16);

    assert_connects_and_receives(&mut channel, &session).await;

    session.teardown().await;
    session.teardown().await;
    assert_eq!(session.state(), SignalingState::Closed);
}

#[tokio::test]
async fn test_teardown_during_establish_releases_channel() {
    harness::init_logging();
    let mut channel = fake_channel(Behaviour::Silent).await;
    let session = Arc::new(SignalingSession::new("s5", credentials(&channel.url), 16));

    let establishing = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.establish(Duration::from_secs(30)).await })
    };

    // Offer sent: the socket and the peer connection exist
    let offer = tokio::time::timeout(Duration::from_secs(5), channel.frames.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(offer.contains("SDP_OFFER"));

    session.teardown().await;

    let result = tokio::time::timeout(Duration::from_secs(5), establishing)
        .await
        .expect("establish settles after teardown")
        .unwrap();
    assert!(matches!(result, Err(Error::SessionStopped(_))), "got {:?}", result.err());
    assert_eq!(session.state(), SignalingState::Closed);

    // The fake channel ends once the viewer's socket is gone
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while channel.frames.recv().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok(), "signaling socket left open");

    // A torn-down session cannot be reused
    assert!(matches!(
        session.establish(Duration::from_secs(1)).await,
        Err(Error::SessionError(_))
    ));
}

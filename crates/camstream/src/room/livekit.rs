//! LiveKit room connector

use super::{RoomConnector, RoomEvent, RoomHandle};
use crate::media::{PixelFormat, VideoFrame};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use livekit::prelude::{RemoteTrack, Room, RoomOptions};
use livekit::webrtc::video_stream::native::NativeVideoStream;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Connector backed by the LiveKit SDK
pub struct LiveKitConnector {
    frame_queue_depth: usize,
}

impl LiveKitConnector {
    pub fn new(frame_queue_depth: usize) -> Self {
        Self {
            frame_queue_depth: frame_queue_depth.max(1),
        }
    }
}

struct LiveKitHandle {
    room: Option<Room>,
    events: mpsc::UnboundedReceiver<livekit::RoomEvent>,
    frame_queue_depth: usize,
}

#[async_trait]
impl RoomConnector for LiveKitConnector {
    async fn connect(&self, url: &str, token: &str) -> Result<Box<dyn RoomHandle>> {
        let (room, events) = Room::connect(url, token, RoomOptions::default())
            .await
            .map_err(|e| Error::RoomError(format!("Failed to join room: {}", e)))?;

        info!("Joined room {}", room.name());

        Ok(Box::new(LiveKitHandle {
            room: Some(room),
            events,
            frame_queue_depth: self.frame_queue_depth,
        }))
    }
}

#[async_trait]
impl RoomHandle for LiveKitHandle {
    async fn next_event(&mut self) -> Option<RoomEvent> {
        loop {
            match self.events.recv().await? {
                livekit::RoomEvent::TrackSubscribed { track, .. } => {
                    let RemoteTrack::Video(video) = track else {
                        continue;
                    };
                    let (tx, rx) = mpsc::channel(self.frame_queue_depth);
                    tokio::spawn(pump_frames(
                        NativeVideoStream::new(video.rtc_track()),
                        tx,
                    ));
                    return Some(RoomEvent::VideoTrackSubscribed(rx));
                }
                livekit::RoomEvent::Disconnected { reason } => {
                    return Some(RoomEvent::Disconnected(format!("{:?}", reason)));
                }
                _ => {}
            }
        }
    }

    async fn close(&mut self) {
        if let Some(room) = self.room.take() {
            if let Err(e) = room.close().await {
                debug!("Room close failed: {}", e);
            }
        }
    }
}

/// Convert SDK frames to I420 and push them into the bounded queue
async fn pump_frames(mut stream: NativeVideoStream, tx: mpsc::Sender<VideoFrame>) {
    let mut dropped = 0u64;

    while let Some(frame) = stream.next().await {
        let i420 = frame.buffer.to_i420();
        let (width, height) = (i420.width(), i420.height());
        let (stride_y, stride_u, stride_v) = i420.strides();
        let (data_y, data_u, data_v) = i420.data();

        let chroma_w = width.div_ceil(2) as usize;
        let chroma_h = height.div_ceil(2) as usize;

        let video_frame = VideoFrame {
            format: PixelFormat::I420,
            width,
            height,
            planes: vec![
                pack_plane(data_y, stride_y as usize, width as usize, height as usize),
                pack_plane(data_u, stride_u as usize, chroma_w, chroma_h),
                pack_plane(data_v, stride_v as usize, chroma_w, chroma_h),
            ],
        };

        match tx.try_send(video_frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => dropped += 1,
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }

    debug!("Room video stream ended ({} frames dropped)", dropped);
}

/// Copy a strided plane into a tightly packed buffer
fn pack_plane(data: &[u8], stride: usize, width: usize, rows: usize) -> Bytes {
    if stride == width {
        return Bytes::copy_from_slice(&data[..(width * rows).min(data.len())]);
    }
    let mut out = Vec::with_capacity(width * rows);
    for row in data.chunks(stride).take(rows) {
        out.extend_from_slice(&row[..width.min(row.len())]);
    }
    Bytes::from(out)
}

//! KVS-style signaling backend
//!
//! - `protocol`: JSON/base64 frame codec
//! - `session`: viewer state machine driving a WebRTC peer connection

pub mod protocol;
pub mod session;

pub use protocol::{
    decode_payload, encode_payload, Action, CandidatePayload, InboundMessage, OutboundMessage,
    SdpPayload, StatusResponse,
};
pub use session::{SignalingSession, SignalingState, H264_PAYLOAD_TYPE, OPUS_PAYLOAD_TYPE};

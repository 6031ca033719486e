//! Signaling channel wire format
//!
//! Outbound frames: `{"action": "SDP_OFFER"|"ICE_CANDIDATE", "messagePayload": base64(JSON)}`.
//! Inbound frames: `{"messageType": ..., "messagePayload": base64(JSON), "senderClientId": ...}`.
//! Empty text frames are keepalives.

use crate::{Error, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Action of a frame sent by the viewer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    SdpOffer,
    IceCandidate,
}

/// Frame sent to the signaling channel.
///
/// No recipient field: the viewer always talks to the master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub action: Action,
    pub message_payload: String,
}

/// SDP body carried inside offer/answer payloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpPayload {
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub sdp: String,
}

/// ICE candidate body carried inside candidate payloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Status frame the channel sends after rejecting a message
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatusResponse {
    pub correlation_id: Option<String>,
    pub error_type: Option<String>,
    pub status_code: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInbound {
    message_type: String,
    #[serde(default)]
    message_payload: Option<String>,
    #[serde(default)]
    sender_client_id: Option<String>,
    #[serde(default)]
    status_response: Option<StatusResponse>,
}

/// Decoded frame received from the signaling channel
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Answer {
        sdp: SdpPayload,
        sender: Option<String>,
    },
    Candidate {
        candidate: CandidatePayload,
        sender: Option<String>,
    },
    Status(StatusResponse),
    GoAway,
    ReconnectIceServer,
    Unknown(String),
}

/// base64(JSON(value))
pub fn encode_payload<T: Serialize>(value: &T) -> Result<String> {
    let json = serde_json::to_vec(value)?;
    Ok(STANDARD.encode(json))
}

/// Inverse of [`encode_payload`]
pub fn decode_payload<T: DeserializeOwned>(payload: &str) -> Result<T> {
    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|e| Error::Signaling(format!("Payload is not base64: {}", e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::Signaling(format!("Payload is not valid JSON: {}", e)))
}

impl OutboundMessage {
    pub fn offer(sdp: &str) -> Result<Self> {
        Ok(Self {
            action: Action::SdpOffer,
            message_payload: encode_payload(&SdpPayload {
                sdp_type: "offer".to_string(),
                sdp: sdp.to_string(),
            })?,
        })
    }

    pub fn candidate(candidate: &CandidatePayload) -> Result<Self> {
        Ok(Self {
            action: Action::IceCandidate,
            message_payload: encode_payload(candidate)?,
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl InboundMessage {
    /// Parse one text frame. Empty frames yield `Ok(None)`.
    pub fn parse(text: &str) -> Result<Option<Self>> {
        if text.trim().is_empty() {
            return Ok(None);
        }

        let raw: RawInbound = serde_json::from_str(text)
            .map_err(|e| Error::Signaling(format!("Malformed signaling frame: {}", e)))?;

        let payload = || {
            raw.message_payload
                .as_deref()
                .filter(|p| !p.is_empty())
                .ok_or_else(|| {
                    Error::Signaling(format!("{} frame without payload", raw.message_type))
                })
        };

        let message = match raw.message_type.as_str() {
            "SDP_ANSWER" => {
                let sdp: SdpPayload = decode_payload(payload()?)?;
                if sdp.sdp.trim().is_empty() {
                    return Err(Error::SdpError("Answer carries an empty SDP".to_string()));
                }
                InboundMessage::Answer {
                    sdp,
                    sender: raw.sender_client_id,
                }
            }
            "ICE_CANDIDATE" => InboundMessage::Candidate {
                candidate: decode_payload(payload()?)?,
                sender: raw.sender_client_id,
            },
            "STATUS_RESPONSE" => InboundMessage::Status(raw.status_response.unwrap_or_default()),
            "GO_AWAY" => InboundMessage::GoAway,
            "RECONNECT_ICE_SERVER" => InboundMessage::ReconnectIceServer,
            other => InboundMessage::Unknown(other.to_string()),
        };

        Ok(Some(message))
    }
}

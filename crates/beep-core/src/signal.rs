use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed signal payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        }
    }
}

impl std::fmt::Display for SdpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An SDP offer or answer. Field order matches the wire form
/// `{"type": ..., "sdp": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: u16,
}

/// A message on the signaling channel.
///
/// Serialises as `{"sdp": {"type": "offer", "sdp": "..."}}` or
/// `{"candidate": {"candidate": "...", "sdpMid": "...", "sdpMLineIndex": 0}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SignalMessage {
    #[serde(rename = "sdp")]
    Description(SessionDescription),
    #[serde(rename = "candidate")]
    IceCandidate(IceCandidate),
}

impl SignalMessage {
    pub fn encode(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(raw)?)
    }
}

impl From<SessionDescription> for SignalMessage {
    fn from(value: SessionDescription) -> Self {
        SignalMessage::Description(value)
    }
}

impl From<IceCandidate> for SignalMessage {
    fn from(value: IceCandidate) -> Self {
        SignalMessage::IceCandidate(value)
    }
}

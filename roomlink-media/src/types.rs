//! Common types used throughout the media core

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::MediaError;

/// Unique identifier for a consumer (one remote logical stream),
/// assigned by the signaling server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConsumerId(String);

impl ConsumerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConsumerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConsumerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier for a producer, assigned by the signaling server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProducerId(String);

impl ProducerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ProducerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ProducerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier for the WebRTC transport this session rides on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransportId(String);

impl TransportId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TransportId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TransportId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Media kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// Negotiated codec, derived from the consumer's MIME type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    Vp8,
    Vp9,
    H264,
    Opus,
}

impl CodecKind {
    /// Parse a codec from a `kind/subtype` MIME string, e.g. `video/VP8`.
    pub fn from_mime_type(mime_type: &str) -> Result<Self, MediaError> {
        let subtype = mime_type.split('/').nth(1).unwrap_or(mime_type);
        match subtype.to_ascii_lowercase().as_str() {
            "vp8" => Ok(Self::Vp8),
            "vp9" => Ok(Self::Vp9),
            "h264" => Ok(Self::H264),
            "opus" => Ok(Self::Opus),
            other => Err(MediaError::InvalidParameters(format!(
                "unsupported codec: {other}"
            ))),
        }
    }

    /// Canonical rtpmap encoding name.
    #[must_use]
    pub const fn encoding_name(&self) -> &'static str {
        match self {
            Self::Vp8 => "VP8",
            Self::Vp9 => "VP9",
            Self::H264 => "H264",
            Self::Opus => "opus",
        }
    }

    #[must_use]
    pub const fn kind(&self) -> MediaKind {
        match self {
            Self::Opus => MediaKind::Audio,
            _ => MediaKind::Video,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_from_mime() {
        assert_eq!(CodecKind::from_mime_type("video/VP8").unwrap(), CodecKind::Vp8);
        assert_eq!(CodecKind::from_mime_type("video/vp9").unwrap(), CodecKind::Vp9);
        assert_eq!(CodecKind::from_mime_type("video/H264").unwrap(), CodecKind::H264);
        assert_eq!(CodecKind::from_mime_type("audio/opus").unwrap(), CodecKind::Opus);
        assert!(CodecKind::from_mime_type("video/AV1").is_err());
    }

    #[test]
    fn test_codec_kind() {
        assert_eq!(CodecKind::Opus.kind(), MediaKind::Audio);
        assert_eq!(CodecKind::Vp8.kind(), MediaKind::Video);
    }

    #[test]
    fn test_id_display() {
        let id = ConsumerId::from("c1");
        assert_eq!(id.to_string(), "c1");
        assert_eq!(id.as_str(), "c1");
    }
}

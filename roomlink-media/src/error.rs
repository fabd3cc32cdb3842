use thiserror::Error;

/// Errors produced by the media core.
///
/// Dispatch-path failures (routing misses, malformed fragments) are never
/// surfaced through this type; they are counted in stats and logged so the
/// real-time path keeps moving.
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Depacketization error: {context}")]
    Depacketize { context: String },

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Session closed")]
    Closed,
}

impl MediaError {
    pub(crate) fn depacketize(context: impl Into<String>) -> Self {
        Self::Depacketize {
            context: context.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MediaError>;

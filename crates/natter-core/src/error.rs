use thiserror::Error;

use crate::messages::CloseReason;

/// Errors produced by the natter protocol layer.
#[derive(Debug, Error)]
pub enum NatterError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("name in use: {0}")]
    NameInUse(String),

    #[error("peer not found: {0}")]
    PeerNotFound(String),

    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("dial failed: {0}")]
    DialFailed(String),

    #[error("idle timeout")]
    IdleTimeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("registration failed: {reason}: {detail}")]
    RegistrationFailed { reason: CloseReason, detail: String },

    #[error("forward rejected: {reason}: {detail}")]
    ForwardRejected { reason: CloseReason, detail: String },

    #[error("session closed: {reason}: {detail}")]
    SessionClosed { reason: CloseReason, detail: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl NatterError {
    /// The wire reason code that best describes this error.
    pub fn reason(&self) -> CloseReason {
        match self {
            Self::MalformedFrame(_) | Self::Protocol(_) => CloseReason::ProtocolError,
            Self::NameInUse(_) => CloseReason::NameInUse,
            Self::PeerNotFound(_) => CloseReason::PeerNotFound,
            Self::PeerUnreachable(_) => CloseReason::PeerUnreachable,
            Self::DialFailed(_) => CloseReason::DialFailed,
            Self::IdleTimeout => CloseReason::IdleTimeout,
            Self::RegistrationFailed { reason, .. }
            | Self::ForwardRejected { reason, .. }
            | Self::SessionClosed { reason, .. } => *reason,
            Self::Transport(_) | Self::Io(_) | Self::Config(_) => CloseReason::TransportError,
        }
    }
}

impl From<ciborium::de::Error<std::io::Error>> for NatterError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        NatterError::MalformedFrame(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for NatterError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        NatterError::Protocol(format!("encode failed: {e}"))
    }
}

pub type NatterResult<T> = Result<T, NatterError>;

use crate::media::EngineError;
use roomcast_protocol::{PeerId, TransportId};
use thiserror::Error;

/// Error categories surfaced to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    NotFound,
    Precondition,
    MediaEngine,
    ServiceUnavailable,
    Conflict,
    BadRequest,
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),

    #[error("Transport not found: {0}")]
    TransportNotFound(TransportId),

    #[error("No send transport")]
    NoSendTransport,

    #[error("No recv transport")]
    NoRecvTransport,

    #[error("Cannot consume")]
    CannotConsume,

    #[error("Media engine error: {0}")]
    MediaEngine(#[from] EngineError),

    #[error("Router not ready")]
    ServiceUnavailable,

    #[error("Peer already registered: {0}")]
    DuplicatePeer(PeerId),

    #[error("Invalid request: {0}")]
    BadRequest(String),
}

impl AppError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            AppError::PeerNotFound(_) | AppError::TransportNotFound(_) => ErrorCategory::NotFound,
            AppError::NoSendTransport | AppError::NoRecvTransport | AppError::CannotConsume => {
                ErrorCategory::Precondition
            }
            AppError::MediaEngine(_) => ErrorCategory::MediaEngine,
            AppError::ServiceUnavailable => ErrorCategory::ServiceUnavailable,
            AppError::DuplicatePeer(_) => ErrorCategory::Conflict,
            AppError::BadRequest(_) => ErrorCategory::BadRequest,
        }
    }

    /// Message placed in the `{error}` payload of a failed response.
    ///
    /// Engine failures pass the engine's own message through.
    pub fn client_message(&self) -> String {
        match self {
            AppError::PeerNotFound(_) => "Peer not found".to_string(),
            AppError::TransportNotFound(_) => "Transport not found".to_string(),
            AppError::MediaEngine(e) => e.to_string(),
            AppError::DuplicatePeer(_) => "Peer already registered".to_string(),
            AppError::BadRequest(msg) => msg.clone(),
            AppError::NoSendTransport
            | AppError::NoRecvTransport
            | AppError::CannotConsume
            | AppError::ServiceUnavailable => self.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

//! Client-side error taxonomy for streaming sessions.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::ErrorKind;

/// Everything that can end (or interrupt) a streaming session.
///
/// Only [`StreamError::TransportFailure`] is retried by the reconnect loop.
/// Token rejections get one refresh-and-retry from the token cache. All other
/// kinds are terminal and surface to the caller immediately.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("stream error ({kind}): {message}")]
    ApplicationStreamError { kind: ErrorKind, message: String },

    #[error("malformed stream: {0}")]
    Protocol(String),

    #[error("anti-forgery token missing")]
    TokenMissing,

    #[error("anti-forgery token rejected as invalid")]
    TokenInvalid,

    #[error("anti-forgery token expired")]
    TokenExpired,

    #[error("rate limit exceeded, retry in {}s", retry_after.as_secs())]
    RateExceeded { retry_after: Duration },

    #[error("request body too large")]
    SizeExceeded,

    #[error("origin not permitted by server")]
    OriginRejected,

    #[error("connection failed after {attempts} reconnect attempts")]
    MaxRetriesExceeded { attempts: u32 },

    #[error("no conversation selected")]
    NoActiveConversation,

    #[error("a response is already streaming for this session")]
    StreamInProgress,
}

impl StreamError {
    /// Transport-level failures feed the reconnect loop.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransportFailure(_))
    }

    /// Rejections the token cache answers with one refresh-and-retry.
    pub fn is_token_rejection(&self) -> bool {
        matches!(self, Self::TokenExpired | Self::TokenInvalid)
    }

    /// Map a server-declared error kind onto the client taxonomy.
    pub fn from_kind(kind: ErrorKind, message: String, retry_after: Option<u64>) -> Self {
        match kind {
            ErrorKind::SizeExceeded => Self::SizeExceeded,
            ErrorKind::RateExceeded => Self::RateExceeded {
                retry_after: Duration::from_secs(retry_after.unwrap_or(1)),
            },
            ErrorKind::ForgeryMissing => Self::TokenMissing,
            ErrorKind::ForgeryInvalid => Self::TokenInvalid,
            ErrorKind::ForgeryExpired => Self::TokenExpired,
            ErrorKind::OriginRejected => Self::OriginRejected,
            ErrorKind::ModelError | ErrorKind::BadRequest => {
                Self::ApplicationStreamError { kind, message }
            }
        }
    }
}

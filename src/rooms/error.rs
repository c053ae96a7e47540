#![forbid(unsafe_code)]

// Typed signaling failures: a wire error code plus a human-readable detail.

use crate::media::MediaError;
use crate::signaling::protocol::ErrorCode;
use thiserror::Error;

#[derive(Error, Debug)]
#[error("{code}: {details}")]
pub struct SignalError {
    pub code: ErrorCode,
    pub details: String,
}

impl SignalError {
    pub fn new(code: ErrorCode, details: impl Into<String>) -> Self {
        Self {
            code,
            details: details.into(),
        }
    }
}

/// Engine failures surface as `engine-failure`; rollback of any partially
/// allocated state happens before the error leaves the critical section.
impl From<MediaError> for SignalError {
    fn from(err: MediaError) -> Self {
        Self::new(ErrorCode::EngineFailure, err.to_string())
    }
}

/// An adapter call outrunning its handshake deadline surfaces as `timeout`;
/// the client may retry and already-complete work is served idempotently.
impl From<tokio::time::error::Elapsed> for SignalError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::new(ErrorCode::Timeout, "media engine call timed out")
    }
}

#![forbid(unsafe_code)]

// Shared media-module types: engine failures and the wire-facing transport
// parameters.

use mediasoup::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What went wrong inside the media engine, tagged by the object that
/// failed so callers can log and map it without parsing strings.
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("media worker: {0}")]
    Worker(String),

    #[error("media router: {0}")]
    Router(String),

    #[error("webrtc transport: {0}")]
    Transport(String),

    #[error("producer: {0}")]
    Producer(String),

    #[error("consumer: {0}")]
    Consumer(String),
}

/// Result type alias for media operations
pub type MediaResult<T> = Result<T, MediaError>;

/// Everything a client needs to set up its side of a WebRTC transport.
/// Produced on transport creation and forwarded verbatim in signaling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

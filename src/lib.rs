#![forbid(unsafe_code)]

// videoroom library - SFU signaling and media-routing control plane

pub mod media;
pub mod metrics;
pub mod rooms;
pub mod signaling;

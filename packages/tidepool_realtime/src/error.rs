//! Error surface of the realtime core.

use topic_mux::{MuxError, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Mux(#[from] MuxError),

    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("presence is not being tracked")]
    NotTracking,

    #[error("mark-read request failed")]
    MarkRead(#[source] anyhow::Error),
}

//! Error types for the transport seam and the multiplexer.

/// Errors reported by a transport implementation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("failed to open channel for topic {topic}: {reason}")]
    OpenFailed { topic: String, reason: String },

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("presence track failed: {0}")]
    TrackFailed(String),

    #[error("channel is closed")]
    ChannelClosed,
}

/// Errors reported by the multiplexer itself.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("no channel open for topic {0}")]
    ChannelNotFound(String),
}

use thiserror::Error;

/// Failures of the realtime channel. All of them drive the reconnect loop.
#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("invalid realtime endpoint: {0}")]
    Endpoint(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("subscription rejected: {0}")]
    Rejected(String),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("heartbeat not acknowledged")]
    HeartbeatTimeout,
    #[error("channel closed: {0}")]
    Closed(String),
}

impl RealtimeError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected(message.into())
    }

    pub fn closed(reason: impl Into<String>) -> Self {
        Self::Closed(reason.into())
    }
}

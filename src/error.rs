use thiserror::Error;

/// Unified domain error for the connection/dispatch engine. Component-internal
/// I/O (config files, provider subprocess spawn) stays on `anyhow::Result` at
/// its own boundary and is converted here only once it crosses into C3/C6.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("not connected")]
    NotConnected,

    #[error("request timed out")]
    Timeout,

    #[error("connection lost")]
    ConnectionLost,

    #[error("authentication failed ({code}): {message}")]
    AuthFailed { code: i64, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}
